/// HTTP server exposing the engine over WebSocket
use actix_web::{middleware, web, App, Error, HttpRequest, HttpResponse, HttpServer};
use actix_web_actors::ws;
use log::info;

use crate::config::ServerConfig;
use crate::websocket::{AppState, EngineWebSocket};

/// WebSocket endpoint handler
async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let resp = ws::start(EngineWebSocket::new(state), &req, stream)?;
    Ok(resp)
}

/// Health check endpoint
async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "connections": state.connection_count(),
    }))
}

/// Start the HTTP server with WebSocket support
pub async fn run_server(config: ServerConfig) -> std::io::Result<()> {
    let state = web::Data::new(AppState::new(config.engine.clone()));

    info!("LivePivot server listening");
    info!("WebSocket: ws://{}:{}/ws", config.host, config.port);
    info!("Health check: http://{}:{}/health", config.host, config.port);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            // CORS for development
            .wrap(
                actix_cors::Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .route("/ws", web::get().to(ws_index))
            .route("/health", web::get().to(health_check))
    })
    .bind(config.bind_address())?
    .run()
    .await
}
