//! Multiplexer backed by a current-thread tokio runtime.
//!
//! Readiness sources are [`ReadySignal`]s: producers (transfer tasks, the
//! input pump) publish their data first and notify second, and consumers read
//! until they see nothing left. `Notify` keeps a permit when nobody is waiting,
//! so a notification between two `wait` calls is never lost. Spurious wakeups
//! are possible and harmless.
//!
//! Spawned tasks only make progress while `wait` is blocked inside the
//! runtime, which keeps every reactor callback on the calling thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Interest, MuxError, MuxEvent, Multiplexer, Readiness, WatchKey};

/// Readable/writable notifications for one source.
#[derive(Debug, Default)]
pub struct ReadySignal {
    readable: Notify,
    writable: Notify,
}

impl ReadySignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notify_readable(&self) {
        self.readable.notify_one();
    }

    pub fn notify_writable(&self) {
        self.writable.notify_one();
    }

    /// Resolves on the next (or a stored) readable notification.
    pub async fn readable(&self) {
        self.readable.notified().await;
    }

    async fn ready(&self, interest: Interest) -> Readiness {
        match (interest.readable, interest.writable) {
            (true, false) => {
                self.readable.notified().await;
                Readiness::READABLE
            }
            (false, true) => {
                self.writable.notified().await;
                Readiness::WRITABLE
            }
            _ => tokio::select! {
                () = self.readable.notified() => Readiness::READABLE,
                () = self.writable.notified() => Readiness::WRITABLE,
            },
        }
    }
}

pub struct TokioPoller {
    // Option so Drop can hand it to shutdown_background; a pump task blocked
    // on stdin would otherwise hold up process exit.
    runtime: Option<Runtime>,
    handle: Handle,
    sources: HashMap<WatchKey, Arc<ReadySignal>>,
    watched: HashMap<WatchKey, Interest>,
    deadline: Option<Instant>,
}

impl TokioPoller {
    pub fn new() -> Result<Self, MuxError> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
            sources: HashMap::new(),
            watched: HashMap::new(),
            deadline: None,
        })
    }

    /// Handle for spawning producers onto the loop's runtime.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Make `key` watchable.
    pub fn register(&mut self, key: WatchKey, signal: Arc<ReadySignal>) {
        self.sources.insert(key, signal);
    }

    pub fn is_watching(&self, key: WatchKey) -> bool {
        self.watched.contains_key(&key)
    }

    pub fn timer_armed(&self) -> bool {
        self.deadline.is_some()
    }
}

impl Multiplexer for TokioPoller {
    fn watch(&mut self, key: WatchKey, interest: Interest) -> Result<(), MuxError> {
        if !self.sources.contains_key(&key) {
            return Err(MuxError::UnknownSource(key));
        }
        trace!(%key, ?interest, "watch");
        self.watched.insert(key, interest);
        Ok(())
    }

    fn unwatch(&mut self, key: WatchKey) {
        trace!(%key, "unwatch");
        self.watched.remove(&key);
    }

    fn arm_timer(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    fn disarm_timer(&mut self) {
        self.deadline = None;
    }

    fn wait(&mut self) -> Result<Option<MuxEvent>, MuxError> {
        if self.watched.is_empty() && self.deadline.is_none() {
            debug!("nothing left to wait for");
            return Ok(None);
        }

        let mut ready = FuturesUnordered::new();
        for (&key, &interest) in &self.watched {
            let signal = self
                .sources
                .get(&key)
                .cloned()
                .ok_or(MuxError::UnknownSource(key))?;
            ready.push(async move {
                let readiness = signal.ready(interest).await;
                MuxEvent::Ready { key, readiness }
            });
        }

        let deadline = self.deadline;
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "runtime already shut down")
            })?;
        let event = runtime.block_on(async move {
            tokio::select! {
                Some(event) = ready.next() => event,
                () = sleep_until(deadline) => MuxEvent::Timer,
            }
        });

        if event == MuxEvent::Timer {
            self.deadline = None;
        }
        Ok(Some(event))
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Drop for TokioPoller {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SocketId;

    #[test]
    fn test_wait_returns_none_when_idle() {
        let mut poller = TokioPoller::new().unwrap();
        poller.register(WatchKey::Input, ReadySignal::new());

        assert!(poller.wait().unwrap().is_none());
    }

    #[test]
    fn test_watch_requires_registered_source() {
        let mut poller = TokioPoller::new().unwrap();
        let err = poller
            .watch(WatchKey::Socket(SocketId(9)), Interest::READABLE)
            .unwrap_err();
        assert!(matches!(err, MuxError::UnknownSource(WatchKey::Socket(SocketId(9)))));
    }

    #[test]
    fn test_writable_interest_reports_writable() {
        let mut poller = TokioPoller::new().unwrap();
        let signal = ReadySignal::new();
        let key = WatchKey::Socket(SocketId(2));
        poller.register(key, signal.clone());
        poller.watch(key, Interest::WRITABLE).unwrap();

        // A readable notification does not satisfy a write-only watch.
        signal.notify_readable();
        signal.notify_writable();

        assert_eq!(
            poller.wait().unwrap(),
            Some(MuxEvent::Ready {
                key,
                readiness: Readiness::WRITABLE
            })
        );
    }

    #[test]
    fn test_notification_before_wait_is_kept() {
        let mut poller = TokioPoller::new().unwrap();
        let signal = ReadySignal::new();
        poller.register(WatchKey::Input, signal.clone());
        poller.watch(WatchKey::Input, Interest::READABLE).unwrap();

        signal.notify_readable();

        let event = poller.wait().unwrap();
        assert_eq!(
            event,
            Some(MuxEvent::Ready {
                key: WatchKey::Input,
                readiness: Readiness::READABLE
            })
        );
    }

    #[test]
    fn test_notification_from_spawned_task() {
        let mut poller = TokioPoller::new().unwrap();
        let signal = ReadySignal::new();
        let key = WatchKey::Socket(SocketId(1));
        poller.register(key, signal.clone());
        poller.watch(key, Interest::READABLE).unwrap();

        poller.handle().spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            signal.notify_readable();
        });

        assert_eq!(
            poller.wait().unwrap(),
            Some(MuxEvent::Ready {
                key,
                readiness: Readiness::READABLE
            })
        );
    }

    #[test]
    fn test_timer_is_one_shot() {
        let mut poller = TokioPoller::new().unwrap();
        poller.arm_timer(Duration::from_millis(1));

        assert_eq!(poller.wait().unwrap(), Some(MuxEvent::Timer));
        assert!(!poller.timer_armed());
        assert!(poller.wait().unwrap().is_none());
    }

    #[test]
    fn test_rearming_replaces_deadline() {
        let mut poller = TokioPoller::new().unwrap();
        let signal = ReadySignal::new();
        poller.register(WatchKey::Input, signal.clone());
        poller.watch(WatchKey::Input, Interest::READABLE).unwrap();

        poller.arm_timer(Duration::from_millis(1));
        poller.arm_timer(Duration::from_secs(30));
        poller.handle().spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            signal.notify_readable();
        });

        // The first, shorter deadline must not fire.
        assert!(matches!(
            poller.wait().unwrap(),
            Some(MuxEvent::Ready { key: WatchKey::Input, .. })
        ));
        assert!(poller.timer_armed());
    }

    #[test]
    fn test_unwatched_source_does_not_fire() {
        let mut poller = TokioPoller::new().unwrap();
        let signal = ReadySignal::new();
        poller.register(WatchKey::Input, signal.clone());
        poller.watch(WatchKey::Input, Interest::READABLE).unwrap();
        poller.unwatch(WatchKey::Input);
        signal.notify_readable();

        poller.arm_timer(Duration::from_millis(5));
        assert_eq!(poller.wait().unwrap(), Some(MuxEvent::Timer));
        assert!(!poller.is_watching(WatchKey::Input));
    }
}
