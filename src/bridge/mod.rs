//! Local request/response queues shared between a session pool and its
//! callers.
//!
//! Requests travel FIFO on the request queue and are consumed by whichever
//! worker pulls first. Responses are keyed by the correlation id copied from
//! the originating request, and a caller receives only the response that
//! carries its own id.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub type CorrelationId = u64;

/// Control payload asking one worker to leave its serving loop.
pub const STOP_PAYLOAD: &str = "STOP";
/// Control payload standing in for a request the bridge failed to deliver.
pub const BRIDGE_ERROR_PAYLOAD: &str = "Error";
/// Correlation id carried by pool-broadcast STOP messages.
pub const BROADCAST_STOP_ID: CorrelationId = 123_123;
pub const MAX_PAYLOAD_BYTES: usize = 4_095;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub correlation_id: CorrelationId,
    pub payload: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Stop,
    BridgeFailure,
    Request,
}

impl Message {
    pub fn new(correlation_id: CorrelationId, payload: impl Into<String>) -> Self {
        Self {
            correlation_id,
            payload: payload.into(),
        }
    }

    pub fn stop() -> Self {
        Self::new(BROADCAST_STOP_ID, STOP_PAYLOAD)
    }

    pub fn bridge_failure() -> Self {
        Self::new(0, BRIDGE_ERROR_PAYLOAD)
    }

    pub fn kind(&self) -> MessageKind {
        match self.payload.as_str() {
            STOP_PAYLOAD => MessageKind::Stop,
            BRIDGE_ERROR_PAYLOAD => MessageKind::BridgeFailure,
            _ => MessageKind::Request,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selector {
    Any,
    Correlated(CorrelationId),
}

impl Selector {
    fn matches(self, message: &Message) -> bool {
        match self {
            Self::Any => true,
            Self::Correlated(id) => message.correlation_id == id,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BridgeError {
    Closed,
    TimedOut,
    PayloadTooLarge { size: usize, limit: usize },
    ReservedCorrelationId { correlation_id: CorrelationId },
    ReservedPayload { payload: String },
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "message queue is closed"),
            Self::TimedOut => write!(f, "timed out waiting for a message"),
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::ReservedCorrelationId { correlation_id } => {
                write!(f, "correlation id {correlation_id} is reserved for pool control")
            }
            Self::ReservedPayload { payload } => {
                write!(f, "payload '{payload}' is reserved for pool control")
            }
        }
    }
}

impl std::error::Error for BridgeError {}

/// Blocking multi-producer/multi-consumer channel with correlated receive.
pub trait MessageChannel: Send + Sync {
    fn send(&self, message: Message) -> Result<(), BridgeError>;

    /// Blocks until a message matching `selector` is queued, the timeout
    /// elapses, or the channel is closed.
    fn receive(&self, selector: Selector, timeout: Option<Duration>) -> Result<Message, BridgeError>;

    fn close(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<Message>,
    closed: bool,
}

/// In-process [`MessageChannel`] backed by a mutex and condition variable.
#[derive(Default)]
pub struct LocalQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl LocalQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageChannel for LocalQueue {
    fn send(&self, message: Message) -> Result<(), BridgeError> {
        let mut state = self.state.lock().expect("local queue lock poisoned");
        if state.closed {
            return Err(BridgeError::Closed);
        }
        state.messages.push_back(message);
        drop(state);
        // Correlated receivers may be waiting for other ids.
        self.available.notify_all();
        Ok(())
    }

    fn receive(&self, selector: Selector, timeout: Option<Duration>) -> Result<Message, BridgeError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock().expect("local queue lock poisoned");

        loop {
            if state.closed {
                return Err(BridgeError::Closed);
            }
            if let Some(index) = state
                .messages
                .iter()
                .position(|message| selector.matches(message))
            {
                if let Some(message) = state.messages.remove(index) {
                    return Ok(message);
                }
            }

            state = match deadline {
                None => self
                    .available
                    .wait(state)
                    .expect("local queue lock poisoned"),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BridgeError::TimedOut);
                    }
                    self.available
                        .wait_timeout(state, deadline - now)
                        .expect("local queue lock poisoned")
                        .0
                }
            };
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("local queue lock poisoned");
        state.closed = true;
        state.messages.clear();
        drop(state);
        self.available.notify_all();
    }

    fn len(&self) -> usize {
        self.state
            .lock()
            .expect("local queue lock poisoned")
            .messages
            .len()
    }
}

/// The request-in/response-out queue pair owned by one session pool.
#[derive(Clone)]
pub struct MessageBridge {
    requests: Arc<dyn MessageChannel>,
    responses: Arc<dyn MessageChannel>,
}

impl MessageBridge {
    pub fn new(requests: Arc<dyn MessageChannel>, responses: Arc<dyn MessageChannel>) -> Self {
        Self {
            requests,
            responses,
        }
    }

    pub fn local() -> Self {
        Self::new(Arc::new(LocalQueue::new()), Arc::new(LocalQueue::new()))
    }

    /// Next request for a worker. A failing channel yields the synthetic
    /// bridge-failure message instead of an error.
    pub fn pull(&self) -> Message {
        self.requests
            .receive(Selector::Any, None)
            .unwrap_or_else(|_| Message::bridge_failure())
    }

    pub fn push(&self, message: Message) -> Result<(), BridgeError> {
        self.responses.send(message)
    }

    pub fn send_stop(&self) -> Result<(), BridgeError> {
        self.requests.send(Message::stop())
    }

    /// Caller side: enqueue one request after checking the envelope rules.
    pub fn submit(
        &self,
        correlation_id: CorrelationId,
        payload: impl Into<String>,
    ) -> Result<(), BridgeError> {
        let message = Message::new(correlation_id, payload);
        if correlation_id == BROADCAST_STOP_ID {
            return Err(BridgeError::ReservedCorrelationId { correlation_id });
        }
        if message.kind() != MessageKind::Request {
            return Err(BridgeError::ReservedPayload {
                payload: message.payload,
            });
        }
        if message.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(BridgeError::PayloadTooLarge {
                size: message.payload.len(),
                limit: MAX_PAYLOAD_BYTES,
            });
        }
        self.requests.send(message)
    }

    /// Caller side: block until the response carrying `correlation_id`
    /// arrives.
    pub fn await_response(
        &self,
        correlation_id: CorrelationId,
        timeout: Option<Duration>,
    ) -> Result<Message, BridgeError> {
        self.responses
            .receive(Selector::Correlated(correlation_id), timeout)
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn pending_responses(&self) -> usize {
        self.responses.len()
    }

    pub fn close(&self) {
        self.requests.close();
        self.responses.close();
    }
}

impl fmt::Debug for MessageBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBridge")
            .field("pending_requests", &self.requests.len())
            .field("pending_responses", &self.responses.len())
            .finish()
    }
}
