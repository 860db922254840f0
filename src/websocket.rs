/// WebSocket transport for the engine wire protocol.
///
/// Each connection gets its own isolated engine worker. Text frames carry
/// request envelopes; every request is answered with exactly one response
/// envelope carrying the same id. Responses may arrive out of order.
use actix::prelude::*;
use actix_web_actors::ws;
use log::{debug, error, info, warn};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::messages::{RawRequest, Request, RequestId, Response, WireResponse};
use crate::worker::{EngineClient, EngineWorker};

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for all WebSocket connections
pub struct AppState {
    pub engine_config: EngineConfig,
    pub connections: AtomicUsize,
}

impl AppState {
    pub fn new(engine_config: EngineConfig) -> Self {
        Self {
            engine_config,
            connections: AtomicUsize::new(0),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

/// Decode one text frame. On failure the error response to send back is
/// returned instead; its id is recovered from the frame when possible.
pub fn parse_frame(text: &str) -> Result<(RequestId, Request), WireResponse> {
    let raw: RawRequest = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            let id = serde_json::from_str::<JsonValue>(text)
                .ok()
                .and_then(|v| v.get("id").and_then(JsonValue::as_u64))
                .unwrap_or(0);
            let error = EngineError::InvalidPayload(format!("invalid request envelope: {}", e));
            return Err(WireResponse::error(id, &error));
        }
    };
    match raw.into_request() {
        (id, Ok(request)) => Ok((id, request)),
        (id, Err(e)) => Err(WireResponse::error(id, &e)),
    }
}

fn send_response(ctx: &mut ws::WebsocketContext<EngineWebSocket>, response: &WireResponse) {
    match serde_json::to_string(response) {
        Ok(text) => ctx.text(text),
        Err(e) => error!("failed to encode response {}: {}", response.id, e),
    }
}

/// WebSocket connection actor
pub struct EngineWebSocket {
    hb: Instant,
    state: actix_web::web::Data<AppState>,
    client: Option<EngineClient>,
}

impl EngineWebSocket {
    pub fn new(state: actix_web::web::Data<AppState>) -> Self {
        Self {
            hb: Instant::now(),
            state,
            client: None,
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                warn!("WebSocket client heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn handle_frame(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let (id, request) = match parse_frame(text) {
            Ok(parsed) => parsed,
            Err(response) => {
                send_response(ctx, &response);
                return;
            }
        };

        let client = match &self.client {
            Some(client) => client.clone(),
            None => {
                let error = EngineError::TransportFailure("engine unavailable".to_string());
                send_response(ctx, &WireResponse::error(id, &error));
                return;
            }
        };

        debug!("ws request {} {}", id, request.kind());
        let call = async move { client.call(request).await };
        ctx.spawn(call.into_actor(self).map(move |result, _act, ctx| {
            send_response(ctx, &WireResponse::from(Response { id, result }));
        }));
    }
}

impl Actor for EngineWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hb(ctx);
        match EngineWorker::spawn(self.state.engine_config.clone()) {
            Ok(client) => self.client = Some(client),
            Err(e) => error!("failed to start engine worker: {}", e),
        }
        let open = self.state.connections.fetch_add(1, Ordering::Relaxed) + 1;
        info!("WebSocket connected ({} open)", open);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(client) = self.client.take() {
            client.destroy();
        }
        let open = self.state.connections.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        info!("WebSocket disconnected ({} open)", open);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for EngineWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.handle_frame(&text, ctx);
            }
            Ok(ws::Message::Binary(_)) => {
                warn!("Unexpected binary message");
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            _ => ctx.stop(),
        }
    }
}
