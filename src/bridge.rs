//! Glue between the transfer engine's socket/timer requests and the multiplexer.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::engine::{SocketAction, SocketEvents, SocketId, TransferId};
use crate::mux::{Interest, MuxError, Multiplexer, Readiness, WatchKey};

/// What the bridge knows about one engine socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRegistration {
    pub owner: Option<TransferId>,
    pub action: SocketAction,
    pub armed: bool,
}

/// Socket descriptor to registration map, owned by the bridge.
#[derive(Debug, Default)]
pub struct SocketBridge {
    registrations: HashMap<SocketId, SocketRegistration>,
}

impl SocketBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, socket: SocketId) -> Option<&SocketRegistration> {
        self.registrations.get(&socket)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Apply an add/change/remove request from the engine.
    pub fn update<M: Multiplexer>(
        &mut self,
        mux: &mut M,
        socket: SocketId,
        owner: Option<TransferId>,
        action: SocketAction,
    ) -> Result<(), MuxError> {
        let key = WatchKey::Socket(socket);
        let Some(interest) = interest_for(action) else {
            if let Some(registration) = self.registrations.remove(&socket) {
                if registration.armed {
                    mux.unwatch(key);
                }
            }
            debug!(%socket, "socket removed");
            return Ok(());
        };

        match self.registrations.get_mut(&socket) {
            Some(registration) => {
                debug!(%socket, from = %registration.action, to = %action, "changing socket interest");
                if registration.armed {
                    mux.unwatch(key);
                    registration.armed = false;
                }
                registration.action = action;
                if owner.is_some() {
                    registration.owner = owner;
                }
            }
            None => {
                debug!(%socket, %action, "adding socket");
                self.registrations.insert(
                    socket,
                    SocketRegistration {
                        owner,
                        action,
                        armed: false,
                    },
                );
            }
        }

        mux.watch(key, interest)?;
        if let Some(registration) = self.registrations.get_mut(&socket) {
            registration.armed = true;
        }
        Ok(())
    }
}

fn interest_for(action: SocketAction) -> Option<Interest> {
    match action {
        SocketAction::In => Some(Interest::READABLE),
        SocketAction::Out => Some(Interest::WRITABLE),
        SocketAction::InOut => Some(Interest::BOTH),
        SocketAction::Remove => None,
    }
}

/// Multiplexer readiness to the engine's bitmask.
pub fn socket_events(readiness: Readiness) -> SocketEvents {
    SocketEvents {
        input: readiness.readable,
        output: readiness.writable,
    }
}

/// The engine's single reactor-wide timer.
#[derive(Debug, Default)]
pub struct TimerBridge {
    armed: Option<Duration>,
    immediate: bool,
}

impl TimerBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the engine's "next deadline" request. Last write wins.
    pub fn update<M: Multiplexer>(&mut self, mux: &mut M, timeout: Option<Duration>) {
        mux.disarm_timer();
        self.armed = None;
        self.immediate = false;
        match timeout {
            None => {}
            Some(after) if after.is_zero() => self.immediate = true,
            Some(after) => {
                mux.arm_timer(after);
                self.armed = Some(after);
            }
        }
    }

    /// The armed one-shot fired.
    pub fn fired(&mut self) {
        self.armed = None;
    }

    pub fn disarm<M: Multiplexer>(&mut self, mux: &mut M) {
        if self.armed.take().is_some() {
            debug!("no transfers left, disarming timer");
        }
        mux.disarm_timer();
    }

    pub fn armed(&self) -> Option<Duration> {
        self.armed
    }

    /// Consume a pending zero-deadline request.
    pub fn take_immediate(&mut self) -> bool {
        std::mem::take(&mut self.immediate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::MuxEvent;

    #[derive(Default)]
    struct RecordingMux {
        calls: Vec<String>,
    }

    impl Multiplexer for RecordingMux {
        fn watch(&mut self, key: WatchKey, interest: Interest) -> Result<(), MuxError> {
            self.calls.push(format!(
                "watch {key} r={} w={}",
                interest.readable, interest.writable
            ));
            Ok(())
        }

        fn unwatch(&mut self, key: WatchKey) {
            self.calls.push(format!("unwatch {key}"));
        }

        fn arm_timer(&mut self, after: Duration) {
            self.calls.push(format!("arm {}ms", after.as_millis()));
        }

        fn disarm_timer(&mut self) {
            self.calls.push("disarm".to_string());
        }

        fn wait(&mut self) -> Result<Option<MuxEvent>, MuxError> {
            Ok(None)
        }
    }

    #[test]
    fn test_add_change_remove_socket() {
        let mut mux = RecordingMux::default();
        let mut bridge = SocketBridge::new();
        let socket = SocketId(5);

        bridge
            .update(&mut mux, socket, Some(TransferId(1)), SocketAction::In)
            .unwrap();
        assert_eq!(bridge.get(socket).unwrap().owner, Some(TransferId(1)));
        assert!(bridge.get(socket).unwrap().armed);

        bridge.update(&mut mux, socket, None, SocketAction::InOut).unwrap();
        let registration = bridge.get(socket).unwrap();
        assert_eq!(registration.action, SocketAction::InOut);
        assert_eq!(registration.owner, Some(TransferId(1)));

        bridge.update(&mut mux, socket, None, SocketAction::Remove).unwrap();
        assert!(bridge.is_empty());

        assert_eq!(
            mux.calls,
            vec![
                "watch socket 5 r=true w=false",
                "unwatch socket 5",
                "watch socket 5 r=true w=true",
                "unwatch socket 5",
            ]
        );
    }

    #[test]
    fn test_remove_unknown_socket_is_noop() {
        let mut mux = RecordingMux::default();
        let mut bridge = SocketBridge::new();

        bridge
            .update(&mut mux, SocketId(8), None, SocketAction::Remove)
            .unwrap();
        assert!(mux.calls.is_empty());
    }

    #[test]
    fn test_readiness_translation() {
        let events = socket_events(Readiness {
            readable: true,
            writable: true,
        });
        assert!(events.input && events.output);
        assert_eq!(socket_events(Readiness::WRITABLE), SocketEvents { input: false, output: true });
    }

    #[test]
    fn test_timer_semantics() {
        let mut mux = RecordingMux::default();
        let mut timer = TimerBridge::new();

        timer.update(&mut mux, Some(Duration::from_millis(200)));
        assert_eq!(timer.armed(), Some(Duration::from_millis(200)));

        // Replaced, not added.
        timer.update(&mut mux, Some(Duration::from_millis(50)));
        assert_eq!(timer.armed(), Some(Duration::from_millis(50)));

        timer.update(&mut mux, Some(Duration::ZERO));
        assert_eq!(timer.armed(), None);
        assert!(timer.take_immediate());
        assert!(!timer.take_immediate());

        timer.update(&mut mux, Some(Duration::from_millis(10)));
        timer.update(&mut mux, None);
        assert_eq!(timer.armed(), None);

        // A later write cancels a pending zero deadline.
        timer.update(&mut mux, Some(Duration::ZERO));
        timer.update(&mut mux, None);
        assert!(!timer.take_immediate());

        timer.update(&mut mux, Some(Duration::ZERO));
        timer.update(&mut mux, Some(Duration::from_millis(500)));
        assert!(!timer.take_immediate());
        assert_eq!(timer.armed(), Some(Duration::from_millis(500)));

        assert_eq!(
            mux.calls,
            vec![
                "disarm", "arm 200ms", "disarm", "arm 50ms", "disarm", "disarm", "arm 10ms",
                "disarm", "disarm", "disarm", "disarm", "disarm", "arm 500ms",
            ]
        );
    }
}
