/// Isolated engine worker and its caller-side client.
///
/// The engine lives on a dedicated OS thread with its own current-thread
/// tokio runtime and shares nothing with the caller. Requests travel over an
/// mpsc channel tagged with a correlation id; responses come back over a
/// second channel, where a dispatcher task completes the matching pending
/// call. Requests are handled one at a time in arrival order.
///
/// Pivot requests carry a generation assigned by the client. Before handling
/// a request the worker drains everything already queued and announces any
/// pivot generations it finds, so an older pivot running behind a newer one
/// comes back stale. The client re-checks on arrival as well.

use crate::aggregate::{AggregateResult, AggregateSpec};
use crate::config::EngineConfig;
use crate::engine::{Engine, LoadSummary};
use crate::error::{EngineError, Result};
use crate::messages::{Reply, Request, RequestId, Response};
use crate::pivot::{PivotConfig, PivotOutcome};
use crate::query::{FilterPredicate, QueryResult, QuerySpec, SortKey};
use crate::remote::{self, RemoteSource};
use crate::value::{ColumnValue, Row};
use log::{debug, error, info, warn};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

struct Envelope {
    id: RequestId,
    request: Request,
}

type Pending = Arc<Mutex<FxHashMap<RequestId, oneshot::Sender<Result<Reply>>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn reject_all(pending: &Pending, reason: &str) {
    let waiters: Vec<_> = lock(pending).drain().collect();
    if !waiters.is_empty() {
        warn!("rejecting {} pending requests: {}", waiters.len(), reason);
    }
    for (_, waiter) in waiters {
        let _ = waiter.send(Err(EngineError::TransportFailure(reason.to_string())));
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Run a handler, turning a panic into an error for this request only.
fn guarded<F>(handler: F) -> Result<Reply>
where
    F: FnOnce() -> Result<Reply>,
{
    panic::catch_unwind(AssertUnwindSafe(handler))
        .unwrap_or_else(|payload| Err(EngineError::Handler(panic_message(payload))))
}

/// Synchronous handlers. FETCH_DATA is awaited by the worker loop instead.
fn dispatch(engine: &mut Engine, request: Request) -> Result<Reply> {
    match request {
        Request::Init => {
            engine.init();
            Ok(Reply::Done)
        }
        Request::LoadData { rows } => Ok(Reply::Loaded(engine.load_data(rows))),
        Request::FetchData(_) => Err(EngineError::InvalidPayload(
            "FETCH_DATA is only handled by the worker loop".to_string(),
        )),
        Request::Filter { filters } => engine.filter(&filters).map(Reply::Indices),
        Request::Sort { sorts } => engine.sort(&sorts).map(Reply::Indices),
        Request::Query(spec) => engine.query(&spec).map(Reply::Indices),
        Request::Aggregate(spec) => engine.aggregate(&spec).map(Reply::Aggregates),
        Request::Pivot { config, generation } => engine.pivot(&config, generation).map(Reply::Pivot),
        Request::GetRows { indices } => engine.get_rows(&indices).map(Reply::Rows),
        Request::GetAllRows => engine.get_all_rows().map(Reply::Rows),
        Request::GetUniqueValues { column_key } => engine.get_unique_values(&column_key).map(Reply::Values),
        Request::FetchVisibleRows {
            start,
            end,
            expected_generation,
        } => engine
            .fetch_visible_rows(start, end, expected_generation)
            .map(Reply::Rows),
        Request::Cleanup => {
            engine.cleanup();
            Ok(Reply::Done)
        }
    }
}

async fn handle(engine: &mut Engine, request: Request) -> Result<Reply> {
    match request {
        Request::FetchData(source) => {
            let rows = remote::fetch_rows(&source, engine.config().remote_timeout).await?;
            guarded(|| Ok(Reply::Loaded(engine.load_data(rows))))
        }
        other => guarded(|| dispatch(engine, other)),
    }
}

async fn run_worker(
    mut engine: Engine,
    mut requests: mpsc::UnboundedReceiver<Envelope>,
    responses: mpsc::UnboundedSender<Response>,
) {
    let mut backlog: VecDeque<Envelope> = VecDeque::new();
    loop {
        let envelope = match backlog.pop_front() {
            Some(envelope) => envelope,
            None => match requests.recv().await {
                Some(envelope) => envelope,
                None => break,
            },
        };

        while let Ok(queued) = requests.try_recv() {
            backlog.push_back(queued);
        }
        for queued in &backlog {
            if let Request::Pivot {
                generation: Some(generation),
                ..
            } = &queued.request
            {
                engine.announce_pivot_generation(*generation);
            }
        }

        let id = envelope.id;
        let kind = envelope.request.kind();
        let started = Instant::now();
        let result = handle(&mut engine, envelope.request).await;
        match &result {
            Ok(_) => debug!("request {} {} done in {:?}", id, kind, started.elapsed()),
            Err(e) => warn!("request {} {} failed: {}", id, kind, e),
        }

        if responses.send(Response { id, result }).is_err() {
            break;
        }
    }
    info!("engine worker stopped");
}

pub struct EngineWorker;

impl EngineWorker {
    /// Start an engine on its own thread and return a client for it.
    /// Must be called from within a tokio runtime, which hosts the
    /// response dispatcher.
    pub fn spawn(config: EngineConfig) -> Result<EngineClient> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::TransportFailure(format!("no tokio runtime: {}", e)))?;

        let (request_tx, request_rx) = mpsc::unbounded_channel::<Envelope>();
        let (response_tx, mut response_rx) = mpsc::unbounded_channel::<Response>();

        thread::Builder::new()
            .name("livepivot-engine".to_string())
            .spawn(move || {
                let local = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(local) => local,
                    Err(e) => {
                        error!("failed to start engine runtime: {}", e);
                        return;
                    }
                };
                local.block_on(run_worker(Engine::new(config), request_rx, response_tx));
            })
            .map_err(|e| EngineError::TransportFailure(format!("failed to spawn engine thread: {}", e)))?;

        let pending: Pending = Arc::default();
        let dispatcher_pending = Arc::clone(&pending);
        let dispatcher = runtime.spawn(async move {
            while let Some(response) = response_rx.recv().await {
                let waiter = lock(&dispatcher_pending).remove(&response.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response.result);
                    }
                    None => warn!("dropping response for unknown request {}", response.id),
                }
            }
            reject_all(&dispatcher_pending, "engine worker exited");
        });

        Ok(EngineClient {
            inner: Arc::new(ClientInner {
                requests: Mutex::new(Some(request_tx)),
                pending,
                next_id: AtomicU64::new(0),
                pivot_generation: AtomicU64::new(0),
                dispatcher,
            }),
        })
    }
}

struct ClientInner {
    requests: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    pending: Pending,
    next_id: AtomicU64,
    pivot_generation: AtomicU64,
    dispatcher: JoinHandle<()>,
}

/// Caller-side handle to an engine worker. Clones share the same worker.
#[derive(Clone)]
pub struct EngineClient {
    inner: Arc<ClientInner>,
}

fn unexpected(kind: &str) -> EngineError {
    EngineError::TransportFailure(format!("unexpected reply to {}", kind))
}

impl EngineClient {
    /// Send one request and wait for its response.
    pub async fn call(&self, request: Request) -> Result<Reply> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        {
            let requests = lock(&self.inner.requests);
            let sender = requests
                .as_ref()
                .ok_or_else(|| EngineError::TransportFailure("engine client destroyed".to_string()))?;
            lock(&self.inner.pending).insert(id, tx);
            if sender.send(Envelope { id, request }).is_err() {
                lock(&self.inner.pending).remove(&id);
                return Err(EngineError::TransportFailure("engine worker is gone".to_string()));
            }
        }
        rx.await
            .unwrap_or_else(|_| Err(EngineError::TransportFailure("response channel closed".to_string())))
    }

    pub async fn init(&self) -> Result<()> {
        match self.call(Request::Init).await? {
            Reply::Done => Ok(()),
            _ => Err(unexpected("INIT")),
        }
    }

    pub async fn load_data(&self, rows: Vec<Row>) -> Result<LoadSummary> {
        match self.call(Request::LoadData { rows }).await? {
            Reply::Loaded(summary) => Ok(summary),
            _ => Err(unexpected("LOAD_DATA")),
        }
    }

    pub async fn fetch_data(&self, source: RemoteSource) -> Result<LoadSummary> {
        match self.call(Request::FetchData(source)).await? {
            Reply::Loaded(summary) => Ok(summary),
            _ => Err(unexpected("FETCH_DATA")),
        }
    }

    async fn indices(&self, request: Request) -> Result<QueryResult> {
        let kind = request.kind();
        match self.call(request).await? {
            Reply::Indices(result) => Ok(result),
            _ => Err(unexpected(kind)),
        }
    }

    pub async fn filter(&self, filters: Vec<FilterPredicate>) -> Result<QueryResult> {
        self.indices(Request::Filter { filters }).await
    }

    pub async fn sort(&self, sorts: Vec<SortKey>) -> Result<QueryResult> {
        self.indices(Request::Sort { sorts }).await
    }

    pub async fn query(&self, spec: QuerySpec) -> Result<QueryResult> {
        self.indices(Request::Query(spec)).await
    }

    pub async fn aggregate(&self, spec: AggregateSpec) -> Result<Vec<AggregateResult>> {
        match self.call(Request::Aggregate(spec)).await? {
            Reply::Aggregates(results) => Ok(results),
            _ => Err(unexpected("AGGREGATE")),
        }
    }

    /// Run a pivot under the next generation. The result is stale if a newer
    /// pivot was started before it arrived.
    pub async fn pivot(&self, config: PivotConfig) -> Result<PivotOutcome> {
        let generation = self.inner.pivot_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = match self
            .call(Request::Pivot {
                config,
                generation: Some(generation),
            })
            .await?
        {
            Reply::Pivot(outcome) => outcome,
            _ => return Err(unexpected("PIVOT")),
        };
        let latest = self.inner.pivot_generation.load(Ordering::SeqCst);
        if generation < latest && !outcome.is_stale() {
            debug!("pivot generation {} superseded by {}", generation, latest);
            return Ok(PivotOutcome::stale(generation));
        }
        Ok(outcome)
    }

    async fn rows(&self, request: Request) -> Result<Vec<Row>> {
        let kind = request.kind();
        match self.call(request).await? {
            Reply::Rows(rows) => Ok(rows),
            _ => Err(unexpected(kind)),
        }
    }

    pub async fn get_rows(&self, indices: Vec<u32>) -> Result<Vec<Row>> {
        self.rows(Request::GetRows { indices }).await
    }

    pub async fn get_all_rows(&self) -> Result<Vec<Row>> {
        self.rows(Request::GetAllRows).await
    }

    pub async fn fetch_visible_rows(
        &self,
        start: usize,
        end: usize,
        expected_generation: Option<u64>,
    ) -> Result<Vec<Row>> {
        self.rows(Request::FetchVisibleRows {
            start,
            end,
            expected_generation,
        })
        .await
    }

    pub async fn get_unique_values(&self, column_key: impl Into<String>) -> Result<Vec<ColumnValue>> {
        let request = Request::GetUniqueValues {
            column_key: column_key.into(),
        };
        match self.call(request).await? {
            Reply::Values(values) => Ok(values),
            _ => Err(unexpected("GET_UNIQUE_VALUES")),
        }
    }

    pub async fn cleanup(&self) -> Result<()> {
        match self.call(Request::Cleanup).await? {
            Reply::Done => Ok(()),
            _ => Err(unexpected("CLEANUP")),
        }
    }

    /// Newest pivot generation handed out by this client.
    pub fn pivot_generation(&self) -> u64 {
        self.inner.pivot_generation.load(Ordering::SeqCst)
    }

    /// Shut the worker down. Every pending call fails with
    /// `TransportFailure`, as does every later call.
    pub fn destroy(&self) {
        lock(&self.inner.requests).take();
        self.inner.dispatcher.abort();
        reject_all(&self.inner.pending, "engine client destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.inner.requests).is_none()
    }
}
