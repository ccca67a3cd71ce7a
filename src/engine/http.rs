//! reqwest-backed [`TransferEngine`].
//!
//! Registration only queues the request and asks for an immediate timeout;
//! the timeout advance spawns the queued transfers onto the loop's runtime.
//! Each transfer streams its response and posts chunks and its final result
//! to an event channel, then notifies the engine's one readiness socket. A
//! socket advance drains that channel into the hooks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::Client;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{
    Completion, EngineError, EngineHooks, SocketAction, SocketEvents, SocketId, TransferEngine,
    TransferError, TransferId, TransferRequest,
};
use crate::metrics::FetchMetrics;
use crate::mux::ReadySignal;

/// Per-transfer thresholds.
#[derive(Debug, Clone)]
pub struct TransferLimits {
    /// Abort when fewer than `low_speed_limit` bytes/sec arrive for this long.
    /// Zero turns the low-speed abort off.
    pub low_speed_time: Duration,
    /// Bytes per second; zero disables the average-speed check.
    pub low_speed_limit: u64,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            low_speed_time: Duration::from_secs(3),
            low_speed_limit: 10,
            connect_timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

enum TransferEvent {
    Data {
        transfer: TransferId,
        chunk: Bytes,
    },
    Done {
        transfer: TransferId,
        effective_url: String,
        result: Result<(), TransferError>,
    },
}

pub struct HttpEngine {
    client: Client,
    runtime: Handle,
    signal: Arc<ReadySignal>,
    limits: TransferLimits,
    events_tx: mpsc::UnboundedSender<TransferEvent>,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    queued: VecDeque<(TransferId, TransferRequest)>,
    active: HashMap<TransferId, JoinHandle<()>>,
    completed: VecDeque<Completion>,
    finished: HashSet<TransferId>,
    next_id: u64,
    watching: bool,
}

impl HttpEngine {
    /// The one socket this engine ever asks to have watched.
    pub const EVENT_SOCKET: SocketId = SocketId(1);

    pub fn new(runtime: Handle, limits: TransferLimits) -> Result<Self, EngineError> {
        let mut builder = Client::builder()
            .gzip(true)
            .deflate(true)
            .connect_timeout(limits.connect_timeout);
        if let Some(agent) = &limits.user_agent {
            builder = builder.user_agent(agent.clone());
        }
        let client = builder
            .build()
            .map_err(|e| EngineError::Init(e.to_string()))?;

        let (events_tx, events) = mpsc::unbounded_channel();
        Ok(Self {
            client,
            runtime,
            signal: ReadySignal::new(),
            limits,
            events_tx,
            events,
            queued: VecDeque::new(),
            active: HashMap::new(),
            completed: VecDeque::new(),
            finished: HashSet::new(),
            next_id: 1,
            watching: false,
        })
    }

    /// Readiness signal behind [`Self::EVENT_SOCKET`]; register it with the poller.
    pub fn signal(&self) -> Arc<ReadySignal> {
        self.signal.clone()
    }

    pub fn running(&self) -> usize {
        self.queued.len() + self.active.len()
    }

    fn start_queued(&mut self) {
        while let Some((transfer, request)) = self.queued.pop_front() {
            debug!(%transfer, url = %request.url, "starting transfer");
            let task = self.runtime.spawn(perform(
                self.client.clone(),
                transfer,
                request,
                self.limits.clone(),
                self.events_tx.clone(),
                self.signal.clone(),
            ));
            self.active.insert(transfer, task);
        }
    }

    fn drain_events(&mut self, hooks: &mut dyn EngineHooks) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                TransferEvent::Data { transfer, chunk } => {
                    // Chunks of a transfer removed early are dropped.
                    if self.active.contains_key(&transfer) {
                        hooks.data(transfer, chunk);
                    }
                }
                TransferEvent::Done {
                    transfer,
                    effective_url,
                    result,
                } => {
                    if self.active.remove(&transfer).is_none() {
                        continue;
                    }
                    self.finished.insert(transfer);
                    self.completed.push_back(Completion {
                        transfer,
                        effective_url,
                        result,
                    });
                }
            }
        }
    }

    fn update_watch(&mut self, hooks: &mut dyn EngineHooks) {
        let running = self.running();
        if running > 0 && !self.watching {
            hooks.socket(Self::EVENT_SOCKET, None, SocketAction::In);
            self.watching = true;
        } else if running == 0 && self.watching {
            hooks.socket(Self::EVENT_SOCKET, None, SocketAction::Remove);
            hooks.timer(None);
            self.watching = false;
        }
    }
}

impl TransferEngine for HttpEngine {
    fn add(
        &mut self,
        request: TransferRequest,
        hooks: &mut dyn EngineHooks,
    ) -> Result<TransferId, EngineError> {
        let transfer = TransferId(self.next_id);
        self.next_id += 1;
        trace!(%transfer, url = %request.url, "queued transfer");
        self.queued.push_back((transfer, request));
        self.update_watch(hooks);
        hooks.timer(Some(Duration::ZERO));
        Ok(transfer)
    }

    fn socket_action(
        &mut self,
        socket: SocketId,
        _events: SocketEvents,
        hooks: &mut dyn EngineHooks,
    ) -> Result<usize, EngineError> {
        if socket != Self::EVENT_SOCKET {
            return Err(EngineError::BadSocket(socket));
        }
        self.drain_events(hooks);
        self.update_watch(hooks);
        Ok(self.running())
    }

    fn timeout_action(&mut self, hooks: &mut dyn EngineHooks) -> Result<usize, EngineError> {
        self.start_queued();
        self.drain_events(hooks);
        self.update_watch(hooks);
        Ok(self.running())
    }

    fn next_completed(&mut self) -> Option<Completion> {
        self.completed.pop_front()
    }

    fn remove(&mut self, transfer: TransferId) -> Result<(), EngineError> {
        if self.finished.remove(&transfer) {
            return Ok(());
        }
        if let Some(task) = self.active.remove(&transfer) {
            task.abort();
            return Ok(());
        }
        let before = self.queued.len();
        self.queued.retain(|(id, _)| *id != transfer);
        if self.queued.len() < before {
            return Ok(());
        }
        Err(EngineError::UnknownTransfer(transfer))
    }
}

async fn perform(
    client: Client,
    transfer: TransferId,
    request: TransferRequest,
    limits: TransferLimits,
    events: mpsc::UnboundedSender<TransferEvent>,
    signal: Arc<ReadySignal>,
) {
    let url = request.url.clone();
    let outcome = fetch(&client, transfer, request, &limits, &events, &signal).await;
    let (effective_url, result) = match outcome {
        Ok(effective_url) => (effective_url, Ok(())),
        Err(e) => (url, Err(e)),
    };
    let _ = events.send(TransferEvent::Done {
        transfer,
        effective_url,
        result,
    });
    signal.notify_readable();
}

async fn fetch(
    client: &Client,
    transfer: TransferId,
    request: TransferRequest,
    limits: &TransferLimits,
    events: &mpsc::UnboundedSender<TransferEvent>,
    signal: &ReadySignal,
) -> Result<String, TransferError> {
    let mut builder = match request.post {
        Some(body) => client.post(&request.url).body(body),
        None => client.get(&request.url),
    };
    if let Some(headers) = &request.headers {
        builder = builder.headers(headers.header_map());
    }

    let too_slow = TransferError::TooSlow {
        limit: limits.low_speed_limit,
        secs: limits.low_speed_time.as_secs(),
    };
    let mut response = match unless_stalled(limits.low_speed_time, builder.send()).await {
        Some(response) => response?,
        None => return Err(too_slow),
    };
    let effective_url = response.url().to_string();

    let mut window = SpeedWindow::new(limits, Instant::now());
    loop {
        let chunk = match unless_stalled(limits.low_speed_time, response.chunk()).await {
            Some(chunk) => chunk?,
            None => return Err(too_slow),
        };
        let Some(chunk) = chunk else { break };
        window.record(chunk.len(), Instant::now())?;
        FetchMetrics::record_bytes_received(chunk.len());
        if events.send(TransferEvent::Data { transfer, chunk }).is_err() {
            break;
        }
        signal.notify_readable();
    }
    Ok(effective_url)
}

/// `None` if `fut` makes no progress within `window`. A zero window never
/// stalls.
async fn unless_stalled<F: Future>(window: Duration, fut: F) -> Option<F::Output> {
    if window.is_zero() {
        return Some(fut.await);
    }
    tokio::time::timeout(window, fut).await.ok()
}

/// Average-speed check over consecutive `low_speed_time` windows.
struct SpeedWindow {
    limit: u64,
    span: Duration,
    started: Instant,
    bytes: u64,
}

impl SpeedWindow {
    fn new(limits: &TransferLimits, now: Instant) -> Self {
        Self {
            limit: limits.low_speed_limit,
            span: limits.low_speed_time,
            started: now,
            bytes: 0,
        }
    }

    fn record(&mut self, len: usize, now: Instant) -> Result<(), TransferError> {
        self.bytes += len as u64;
        let elapsed = now.saturating_duration_since(self.started);
        if self.limit == 0 || self.span.is_zero() || elapsed < self.span {
            return Ok(());
        }
        let rate = self.bytes as f64 / elapsed.as_secs_f64();
        if rate < self.limit as f64 {
            return Err(TransferError::TooSlow {
                limit: self.limit,
                secs: self.span.as_secs(),
            });
        }
        self.started = now;
        self.bytes = 0;
        Ok(())
    }
}
