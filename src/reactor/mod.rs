//! The single-threaded reactor.
//!
//! Owns the engine, the multiplexer, both bridges, the output queue and the
//! ingestion reader. Every readiness or timer event advances the engine, drains
//! all completions, and flushes the queue before the loop waits again.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::admission::{Admission, DEFAULT_MAX_RUNNING};
use crate::bridge::{socket_events, SocketBridge, TimerBridge};
use crate::engine::{
    Completion, EngineError, EngineHooks, RequestHeaders, SocketAction, SocketId, TransferEngine,
    TransferId, TransferRequest,
};
use crate::error::{FetchError, Result};
use crate::ingest::{IngestionReader, Line, LineSource, DEFAULT_MAX_LINE_LEN};
use crate::metrics::FetchMetrics;
use crate::mux::{MuxError, MuxEvent, Multiplexer, Readiness, WatchKey};
use crate::queue::OutputQueue;
use crate::record::RequestRecord;


#[derive(Debug, Clone)]
pub struct ReactorOptions {
    pub max_running: usize,
    pub delimiter: u8,
    pub max_line_len: usize,
    /// Append a failed transfer's error text to its output.
    pub emit_errors: bool,
}

impl Default for ReactorOptions {
    fn default() -> Self {
        Self {
            max_running: DEFAULT_MAX_RUNNING,
            delimiter: b'\n',
            max_line_len: DEFAULT_MAX_LINE_LEN,
            emit_errors: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub lines: u64,
    pub transfers: u64,
    pub failures: u64,
    pub records_emitted: u64,
}

pub struct Reactor<E, M, L, W> {
    engine: E,
    mux: M,
    sockets: SocketBridge,
    timer: TimerBridge,
    queue: OutputQueue,
    /// Transfer to the sequence number of its record in `queue`.
    owners: HashMap<TransferId, u64>,
    admission: Admission,
    running: usize,
    reader: IngestionReader<L>,
    headers: Arc<RequestHeaders>,
    sink: W,
    emit_errors: bool,
    summary: RunSummary,
}

/// Engine callbacks, borrowing just the parts of the reactor they touch.
struct Hooks<'a, M> {
    mux: &'a mut M,
    sockets: &'a mut SocketBridge,
    timer: &'a mut TimerBridge,
    queue: &'a mut OutputQueue,
    owners: &'a HashMap<TransferId, u64>,
    error: Option<MuxError>,
}

impl<M: Multiplexer> EngineHooks for Hooks<'_, M> {
    fn socket(&mut self, socket: SocketId, owner: Option<TransferId>, action: SocketAction) {
        if let Err(e) = self.sockets.update(self.mux, socket, owner, action) {
            self.error.get_or_insert(e);
        }
    }

    fn timer(&mut self, timeout: Option<Duration>) {
        trace!(?timeout, "engine timer request");
        self.timer.update(self.mux, timeout);
    }

    fn data(&mut self, transfer: TransferId, chunk: Bytes) {
        let record = self
            .owners
            .get(&transfer)
            .and_then(|&seq| self.queue.get_mut(seq));
        match record {
            Some(record) => record.push_chunk(chunk),
            None => debug!(%transfer, len = chunk.len(), "dropping data for unknown transfer"),
        }
    }
}

impl<E, M, L, W> Reactor<E, M, L, W>
where
    E: TransferEngine,
    M: Multiplexer,
    L: LineSource,
    W: Write,
{
    pub fn new(engine: E, mux: M, source: L, sink: W, options: ReactorOptions) -> Self {
        Self {
            engine,
            mux,
            sockets: SocketBridge::new(),
            timer: TimerBridge::new(),
            queue: OutputQueue::new(options.delimiter),
            owners: HashMap::new(),
            admission: Admission::new(options.max_running),
            running: 0,
            reader: IngestionReader::new(source, options.max_line_len),
            headers: Arc::new(RequestHeaders::json_post()),
            sink,
            emit_errors: options.emit_errors,
            summary: RunSummary::default(),
        }
    }

    /// Run until the multiplexer has nothing left to wait for.
    pub fn run(&mut self) -> Result<RunSummary> {
        info!(ceiling = self.admission.ceiling(), "reactor starting");
        self.start()?;
        while let Some(event) = self.mux.wait()? {
            self.dispatch(event)?;
            self.settle()?;
        }
        self.flush()?;

        if !self.queue.is_empty() {
            warn!(
                pending = self.queue.len(),
                running = self.running,
                "event loop ended with records still queued"
            );
        }
        let summary = self.summary;
        info!(
            lines = summary.lines,
            transfers = summary.transfers,
            failures = summary.failures,
            emitted = summary.records_emitted,
            "reactor finished"
        );
        Ok(summary)
    }

    /// Watch the input and consume whatever is already available.
    fn start(&mut self) -> Result<()> {
        self.reader.start(&mut self.mux)?;
        self.ingest()?;
        self.settle()
    }

    fn dispatch(&mut self, event: MuxEvent) -> Result<()> {
        match event {
            MuxEvent::Ready {
                key: WatchKey::Input,
                ..
            } => self.ingest(),
            MuxEvent::Ready {
                key: WatchKey::Socket(socket),
                readiness,
            } => self.on_socket_ready(socket, readiness),
            MuxEvent::Timer => {
                self.timer.fired();
                self.on_timeout()
            }
        }
    }

    /// Run deferred work until none is left: zero-deadline timeouts requested
    /// from inside engine calls, and ingestion resumes requested by a flush.
    fn settle(&mut self) -> Result<()> {
        loop {
            if self.timer.take_immediate() {
                self.on_timeout()?;
                continue;
            }
            if self.reader.take_resume() {
                // Lines buffered while paused raise no fresh readiness.
                if self.reader.resume(&mut self.mux)? {
                    self.ingest()?;
                }
                continue;
            }
            return Ok(());
        }
    }

    fn on_socket_ready(&mut self, socket: SocketId, readiness: Readiness) -> Result<()> {
        let events = socket_events(readiness);
        let advanced = self.with_hooks(|engine, hooks| engine.socket_action(socket, events, hooks))?;
        if let Some(running) = check("socket_action", advanced)? {
            self.running = running;
        }
        self.reap()?;
        if self.running == 0 {
            self.timer.disarm(&mut self.mux);
        }
        Ok(())
    }

    fn on_timeout(&mut self) -> Result<()> {
        let advanced = self.with_hooks(|engine, hooks| engine.timeout_action(hooks))?;
        if let Some(running) = check("timeout_action", advanced)? {
            self.running = running;
        }
        self.reap()
    }

    /// Drain every completion the engine has, then flush.
    fn reap(&mut self) -> Result<()> {
        while let Some(Completion {
            transfer,
            effective_url,
            result,
        }) = self.engine.next_completed()
        {
            let seq = self
                .owners
                .remove(&transfer)
                .ok_or(FetchError::OrphanCompletion(transfer))?;
            self.engine
                .remove(transfer)
                .map_err(|source| FetchError::Engine { op: "remove", source })?;
            let record = self
                .queue
                .get_mut(seq)
                .ok_or(FetchError::OrphanCompletion(transfer))?;

            let error = result.err().map(|e| e.to_string());
            match &error {
                Some(message) => {
                    warn!(%transfer, url = %effective_url, error = %message, "transfer failed");
                    self.summary.failures += 1;
                    if self.emit_errors {
                        record.push_chunk(Bytes::from(message.clone()));
                    }
                }
                None => {
                    debug!(%transfer, url = %effective_url, bytes = record.body_len(), "transfer done")
                }
            }
            FetchMetrics::record_transfer_completed(record.body_len(), error.is_some());
            record.finish(error);
        }
        self.flush()
    }

    /// Emit the final records at the head, then let ingestion resume if
    /// there is room.
    fn flush(&mut self) -> Result<()> {
        let flushed = self.queue.flush(&mut self.sink)?;
        if flushed.records > 0 {
            self.sink.flush()?;
            self.summary.records_emitted += flushed.records as u64;
            FetchMetrics::record_records_emitted(flushed.records);
            trace!(records = flushed.records, chunks = flushed.chunks, "flushed");
        }
        if self.admission.is_admitting(self.running) {
            self.reader.request_resume();
        }
        Ok(())
    }

    /// Read and dispatch lines while admission holds and input is available.
    fn ingest(&mut self) -> Result<()> {
        if !self.reader.is_watching() {
            return Ok(());
        }
        loop {
            if !self.admission.is_admitting(self.running) {
                self.reader.pause(&mut self.mux);
                FetchMetrics::record_ingest_paused();
                break;
            }
            match self.reader.next()? {
                Some(line) => self.submit(line)?,
                None => {
                    if self.reader.is_eof() {
                        self.reader.finish(&mut self.mux);
                    }
                    break;
                }
            }
        }
        self.flush()
    }

    fn submit(&mut self, line: Line) -> Result<()> {
        self.summary.lines += 1;
        let (url, post) = match line {
            Line::Literal(text) => {
                self.queue.push(RequestRecord::literal(text));
                return Ok(());
            }
            Line::Fetch { url, post } => (url, post),
        };

        let request = match post {
            Some(body) => TransferRequest::post(url.clone(), body, self.headers.clone()),
            None => TransferRequest::get(url.clone()),
        };
        let transfer = self
            .with_hooks(|engine, hooks| engine.add(request, hooks))?
            .map_err(|source| FetchError::Engine { op: "add", source })?;

        debug!(%transfer, %url, "submitted");
        let seq = self.queue.push(RequestRecord::fetch(url, transfer));
        self.owners.insert(transfer, seq);
        self.running += 1;
        self.summary.transfers += 1;
        FetchMetrics::record_transfer_started();
        Ok(())
    }

    /// Call into the engine with the reactor's hooks. A multiplexer failure
    /// raised from inside a callback is returned first.
    fn with_hooks<T>(
        &mut self,
        call: impl FnOnce(&mut E, &mut dyn EngineHooks) -> std::result::Result<T, EngineError>,
    ) -> Result<std::result::Result<T, EngineError>> {
        let Self {
            engine,
            mux,
            sockets,
            timer,
            queue,
            owners,
            ..
        } = self;
        let mut hooks = Hooks {
            mux,
            sockets,
            timer,
            queue,
            owners,
            error: None,
        };
        let outcome = call(engine, &mut hooks);
        match hooks.error {
            Some(e) => Err(e.into()),
            None => Ok(outcome),
        }
    }
}

/// Bad sockets are logged and skipped; any other engine error is fatal.
fn check<T>(op: &'static str, outcome: std::result::Result<T, EngineError>) -> Result<Option<T>> {
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_bad_socket() => {
            warn!(op, error = %e, "ignoring engine error");
            Ok(None)
        }
        Err(source) => Err(FetchError::Engine { op, source }),
    }
}
