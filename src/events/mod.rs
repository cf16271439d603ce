use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde_json::{json, Value};
use uuid::Uuid;

pub type ListenerResult = Result<(), String>;

type Listener = Arc<dyn Fn(&PoolEvent) -> ListenerResult + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    /// STOP pulled from the request queue.
    Stopped,
    /// The request queue failed and yielded the bridge-failure message.
    BridgeFailure,
    /// No registry server accepted a connection.
    ConnectFailed,
    LoginRejected,
    /// Reconnect or the single retry after it failed; a fallback response
    /// was pushed.
    Unrecoverable,
    /// Stop was requested before the worker reached the serving loop.
    Cancelled,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::BridgeFailure => "bridge_failure",
            Self::ConnectFailed => "connect_failed",
            Self::LoginRejected => "login_rejected",
            Self::Unrecoverable => "unrecoverable",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolEvent {
    WorkerConnected {
        user: String,
        worker_id: Uuid,
        server: SocketAddr,
    },
    WorkerTerminated {
        user: String,
        worker_id: Uuid,
        reason: TerminationReason,
    },
    StopBroadcast {
        user: String,
        stops_sent: usize,
    },
    /// The last live worker of a pool is gone and no stop was requested.
    /// The hosting process is expected to shut down.
    PoolExhausted {
        user: String,
    },
}

impl PoolEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkerConnected { .. } => "worker.connected",
            Self::WorkerTerminated { .. } => "worker.terminated",
            Self::StopBroadcast { .. } => "pool.stop_broadcast",
            Self::PoolExhausted { .. } => "pool.exhausted",
        }
    }

    pub fn user(&self) -> &str {
        match self {
            Self::WorkerConnected { user, .. }
            | Self::WorkerTerminated { user, .. }
            | Self::StopBroadcast { user, .. }
            | Self::PoolExhausted { user } => user,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::WorkerConnected {
                user,
                worker_id,
                server,
            } => json!({"user": user, "worker_id": worker_id.to_string(), "server": server.to_string()}),
            Self::WorkerTerminated {
                user,
                worker_id,
                reason,
            } => json!({"user": user, "worker_id": worker_id.to_string(), "reason": reason.as_str()}),
            Self::StopBroadcast { user, stops_sent } => {
                json!({"user": user, "stops_sent": stops_sent})
            }
            Self::PoolExhausted { user } => json!({"user": user}),
        }
    }
}

#[derive(Debug)]
pub enum EmitError {
    ListenerFailed {
        event: &'static str,
        listener_index: usize,
        message: String,
    },
    ListenerPanicked {
        event: &'static str,
        listener_index: usize,
    },
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListenerFailed {
                event,
                listener_index,
                message,
            } => write!(
                f,
                "listener #{listener_index} failed for event '{event}': {message}"
            ),
            Self::ListenerPanicked {
                event,
                listener_index,
            } => write!(f, "listener #{listener_index} panicked for event '{event}'"),
        }
    }
}

impl Error for EmitError {}

/// Synchronous fan-out of pool events to registered listeners.
#[derive(Default)]
pub struct EventEmitter {
    listeners: RwLock<Vec<Listener>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, listener: F)
    where
        F: Fn(&PoolEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .expect("event listener lock poisoned")
            .push(Arc::new(listener));
    }

    /// Runs every listener even when an earlier one fails; the first failure
    /// is returned.
    pub fn emit(&self, event: &PoolEvent) -> Result<(), EmitError> {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .expect("event listener lock poisoned")
            .clone();

        let mut first_error = None;
        for (listener_index, listener) in listeners.iter().enumerate() {
            let outcome = match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => continue,
                Ok(Err(message)) => EmitError::ListenerFailed {
                    event: event.name(),
                    listener_index,
                    message,
                },
                Err(_) => EmitError::ListenerPanicked {
                    event: event.name(),
                    listener_index,
                },
            };
            first_error.get_or_insert(outcome);
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .expect("event listener lock poisoned")
            .len()
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;
    use uuid::Uuid;

    use super::{EmitError, EventEmitter, PoolEvent, TerminationReason};

    fn exhausted() -> PoolEvent {
        PoolEvent::PoolExhausted {
            user: "oss".to_owned(),
        }
    }

    #[test]
    fn listener_receives_emitted_event() {
        let emitter = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        emitter.on(move |event| {
            if matches!(event, PoolEvent::PoolExhausted { user } if user == "oss") {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });

        emitter.emit(&exhausted()).expect("emit should succeed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_listener_does_not_starve_later_ones() {
        let emitter = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        emitter.on(|_event| Err("listener failure".to_owned()));
        emitter.on(|_event| panic!("boom"));
        emitter.on(move |_event| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let result = emitter.emit(&exhausted());
        assert!(matches!(
            result,
            Err(EmitError::ListenerFailed {
                listener_index: 0,
                event: "pool.exhausted",
                ..
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_is_reported() {
        let emitter = EventEmitter::new();
        emitter.on(|_event| panic!("boom"));

        assert!(matches!(
            emitter.emit(&exhausted()),
            Err(EmitError::ListenerPanicked {
                listener_index: 0,
                ..
            })
        ));
    }

    #[test]
    fn event_payloads_name_user_and_reason() {
        let worker_id = Uuid::new_v4();
        let event = PoolEvent::WorkerTerminated {
            user: "oss".to_owned(),
            worker_id,
            reason: TerminationReason::Unrecoverable,
        };

        assert_eq!(event.name(), "worker.terminated");
        assert_eq!(event.user(), "oss");
        assert_eq!(
            event.payload(),
            json!({"user": "oss", "worker_id": worker_id.to_string(), "reason": "unrecoverable"})
        );
    }
}
