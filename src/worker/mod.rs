use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use uuid::Uuid;

use crate::bridge::{CorrelationId, Message, MessageKind};
use crate::events::{PoolEvent, TerminationReason};
use crate::logging::{LogLevel, Logger};
use crate::protocol::{wrap_response, ProtocolError, SpsSession, SESSION_LAYER_ERROR_RESPONSE};
use crate::registry::ServerRegistry;

const CONNECT_CONTEXT: &str = "worker::connect";
const SERVING_CONTEXT: &str = "worker::serving";
const STOP_POLL_SLICE: Duration = Duration::from_millis(50);

/// The slice of a session pool that one of its workers talks to.
pub trait WorkerHost: Send + Sync {
    fn user_name(&self) -> &str;
    fn password(&self) -> &str;
    fn registry(&self) -> &ServerRegistry;
    fn connect_timeout(&self) -> Option<Duration>;
    fn pull(&self) -> Message;
    fn push(&self, message: Message);
    /// Counts the worker as live. `false` means a stop is already in
    /// progress and the worker must not start serving.
    fn register_live(&self, worker_id: Uuid) -> bool;
    /// Gives back the live slot after an unrecoverable failure.
    fn release_live(&self, worker_id: Uuid);
    fn report(&self, event: PoolEvent);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    LoggingIn,
    Serving,
    Reconnecting,
    Terminated,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::LoggingIn => "logging_in",
            Self::Serving => "serving",
            Self::Reconnecting => "reconnecting",
            Self::Terminated => "terminated",
        }
    }
}

#[derive(Debug)]
pub enum ConnectError {
    /// Every server was tried `retry_attempts` times without a connection.
    RegistryExhausted { attempts: u64 },
    /// A connection was made but the login exchange failed. The remaining
    /// servers are not tried.
    Login {
        server: SocketAddr,
        source: ProtocolError,
    },
    Cancelled,
}

impl ConnectError {
    pub fn termination_reason(&self) -> TerminationReason {
        match self {
            Self::RegistryExhausted { .. } => TerminationReason::ConnectFailed,
            Self::Login { source, .. } if !source.is_transport() => {
                TerminationReason::LoginRejected
            }
            Self::Login { .. } => TerminationReason::ConnectFailed,
            Self::Cancelled => TerminationReason::Cancelled,
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegistryExhausted { attempts } => write!(
                f,
                "no provisioning server accepted a connection after {attempts} attempts"
            ),
            Self::Login { server, source } => write!(f, "login on {server} failed: {source}"),
            Self::Cancelled => write!(f, "stop requested while connecting"),
        }
    }
}

impl Error for ConnectError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Login { source, .. } => Some(source),
            Self::RegistryExhausted { .. } | Self::Cancelled => None,
        }
    }
}

/// Owns one provisioning-server session and forwards queued requests over
/// it until a STOP arrives or the session cannot be recovered.
pub struct ProtocolWorker {
    id: Uuid,
    host: Arc<dyn WorkerHost>,
    stop: Arc<AtomicBool>,
    session: Option<SpsSession>,
    state: WorkerState,
    logger: Logger,
}

impl ProtocolWorker {
    pub fn new(host: Arc<dyn WorkerHost>, stop: Arc<AtomicBool>, logger: Logger) -> Self {
        Self {
            id: Uuid::new_v4(),
            host,
            stop,
            session: None,
            state: WorkerState::Connecting,
            logger,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Connects, logs in and registers with the host. Runs on the caller's
    /// thread; on error the worker is already terminated and reported.
    pub fn start(&mut self) -> Result<(), ConnectError> {
        let outcome = self.establish().and_then(|session| {
            let server = session.peer_addr();
            self.session = Some(session);
            if self.host.register_live(self.id) {
                Ok(server)
            } else {
                self.logout_and_close();
                Err(ConnectError::Cancelled)
            }
        });

        match outcome {
            Ok(server) => {
                self.transition(WorkerState::Serving);
                self.host.report(PoolEvent::WorkerConnected {
                    user: self.host.user_name().to_owned(),
                    worker_id: self.id,
                    server,
                });
                Ok(())
            }
            Err(error) => {
                self.logger.log(
                    LogLevel::Warn,
                    Some(CONNECT_CONTEXT),
                    "Worker failed to start",
                    Some(json!({
                        "worker_id": self.id.to_string(),
                        "user": self.host.user_name(),
                        "error": error.to_string(),
                    })),
                );
                self.finish(error.termination_reason());
                Err(error)
            }
        }
    }

    /// The serving loop. Returns once the worker has terminated.
    pub fn run(mut self) -> TerminationReason {
        let reason = loop {
            let message = self.host.pull();
            match message.kind() {
                MessageKind::Stop => break TerminationReason::Stopped,
                MessageKind::BridgeFailure => break TerminationReason::BridgeFailure,
                MessageKind::Request => {}
            }

            self.logger.log(
                LogLevel::Verbose,
                Some(SERVING_CONTEXT),
                "Forwarding request",
                Some(json!({
                    "worker_id": self.id.to_string(),
                    "correlation_id": message.correlation_id,
                    "body": message.payload,
                })),
            );

            match self.forward(&message.payload) {
                Ok(body) => self.respond(message.correlation_id, &wrap_response(&body)),
                Err(error) if !error.is_transport() => {
                    self.reject_response(message.correlation_id, &error);
                }
                Err(error) => {
                    self.logger.log(
                        LogLevel::Warn,
                        Some(SERVING_CONTEXT),
                        "Exchange failed; reconnecting",
                        Some(json!({
                            "worker_id": self.id.to_string(),
                            "correlation_id": message.correlation_id,
                            "error": error.to_string(),
                        })),
                    );
                    if let Err(reason) = self.recover(&message) {
                        return self.finish(reason);
                    }
                }
            }
        };

        self.logout_and_close();
        self.finish(reason)
    }

    fn establish(&mut self) -> Result<SpsSession, ConnectError> {
        let host = Arc::clone(&self.host);
        let mut attempts = 0_u64;

        for descriptor in host.registry() {
            for attempt in 1..=descriptor.retry_attempts {
                if self.stop_requested() {
                    return Err(ConnectError::Cancelled);
                }
                attempts += 1;

                match SpsSession::connect(
                    descriptor.socket_addr(),
                    &descriptor.home_path,
                    host.connect_timeout(),
                ) {
                    Ok(session) => return self.login(session),
                    Err(error) => {
                        let mut payload = descriptor.log_payload();
                        payload["worker_id"] = json!(self.id.to_string());
                        payload["attempt"] = json!(attempt);
                        payload["error"] = json!(error.to_string());
                        self.logger.log(
                            LogLevel::Warn,
                            Some(CONNECT_CONTEXT),
                            "Connect attempt failed",
                            Some(payload),
                        );
                        self.pause(descriptor.retry_interval);
                    }
                }
            }
        }

        Err(ConnectError::RegistryExhausted { attempts })
    }

    fn login(&mut self, mut session: SpsSession) -> Result<SpsSession, ConnectError> {
        self.transition(WorkerState::LoggingIn);
        let server = session.peer_addr();

        match session.login(self.host.user_name(), self.host.password()) {
            Ok(()) => {
                self.logger.log(
                    LogLevel::Info,
                    Some(CONNECT_CONTEXT),
                    "Logged in to provisioning server",
                    Some(json!({
                        "worker_id": self.id.to_string(),
                        "user": self.host.user_name(),
                        "server": server.to_string(),
                    })),
                );
                Ok(session)
            }
            Err(source) => {
                session.close();
                Err(ConnectError::Login { server, source })
            }
        }
    }

    fn forward(&mut self, payload: &str) -> Result<String, ProtocolError> {
        match self.session.as_mut() {
            Some(session) => session.exchange(payload),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// One full reconnect pass followed by exactly one retry of `message`.
    /// On failure the fallback response is pushed and the live slot given
    /// back.
    fn recover(&mut self, message: &Message) -> Result<(), TerminationReason> {
        self.drop_session();
        self.transition(WorkerState::Reconnecting);

        let session = match self.establish() {
            Ok(session) => session,
            Err(error) => {
                self.logger.log(
                    LogLevel::Error,
                    Some(SERVING_CONTEXT),
                    "Reconnect failed",
                    Some(json!({
                        "worker_id": self.id.to_string(),
                        "error": error.to_string(),
                    })),
                );
                let reason = match error {
                    ConnectError::Cancelled => TerminationReason::Cancelled,
                    _ => TerminationReason::Unrecoverable,
                };
                return Err(self.fall_back(message.correlation_id, reason));
            }
        };

        let server = session.peer_addr();
        self.session = Some(session);
        self.transition(WorkerState::Serving);
        self.host.report(PoolEvent::WorkerConnected {
            user: self.host.user_name().to_owned(),
            worker_id: self.id,
            server,
        });

        match self.forward(&message.payload) {
            Ok(body) => {
                self.respond(message.correlation_id, &wrap_response(&body));
                Ok(())
            }
            Err(error) if !error.is_transport() => {
                self.reject_response(message.correlation_id, &error);
                Ok(())
            }
            Err(error) => {
                self.logger.log(
                    LogLevel::Error,
                    Some(SERVING_CONTEXT),
                    "Retry after reconnect failed",
                    Some(json!({
                        "worker_id": self.id.to_string(),
                        "correlation_id": message.correlation_id,
                        "error": error.to_string(),
                    })),
                );
                self.drop_session();
                Err(self.fall_back(message.correlation_id, TerminationReason::Unrecoverable))
            }
        }
    }

    /// The session is intact but the response cannot be forwarded; only
    /// this request gets the fallback.
    fn reject_response(&self, correlation_id: CorrelationId, error: &ProtocolError) {
        self.logger.log(
            LogLevel::Warn,
            Some(SERVING_CONTEXT),
            "Response rejected; answering with fallback",
            Some(json!({
                "worker_id": self.id.to_string(),
                "correlation_id": correlation_id,
                "error": error.to_string(),
            })),
        );
        self.respond(correlation_id, SESSION_LAYER_ERROR_RESPONSE);
    }

    fn fall_back(
        &mut self,
        correlation_id: CorrelationId,
        reason: TerminationReason,
    ) -> TerminationReason {
        self.respond(correlation_id, SESSION_LAYER_ERROR_RESPONSE);
        self.host.release_live(self.id);
        reason
    }

    fn respond(&self, correlation_id: CorrelationId, payload: &str) {
        self.logger.log(
            LogLevel::Verbose,
            Some(SERVING_CONTEXT),
            "Pushing response",
            Some(json!({
                "worker_id": self.id.to_string(),
                "correlation_id": correlation_id,
                "body": payload,
            })),
        );
        self.host.push(Message::new(correlation_id, payload));
    }

    fn logout_and_close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(error) = session.logout() {
                self.logger.log(
                    LogLevel::Warn,
                    Some(SERVING_CONTEXT),
                    "Logout failed",
                    Some(json!({
                        "worker_id": self.id.to_string(),
                        "server": session.peer_addr().to_string(),
                        "error": error.to_string(),
                    })),
                );
            }
            session.close();
        }
    }

    fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`, waking early once stop is requested.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline || self.stop_requested() {
                return;
            }
            thread::sleep(STOP_POLL_SLICE.min(deadline - now));
        }
    }

    fn transition(&mut self, state: WorkerState) {
        self.state = state;
        self.logger.log(
            LogLevel::Debug,
            Some(SERVING_CONTEXT),
            "Worker state changed",
            Some(json!({
                "worker_id": self.id.to_string(),
                "state": state.as_str(),
            })),
        );
    }

    fn finish(&mut self, reason: TerminationReason) -> TerminationReason {
        self.transition(WorkerState::Terminated);
        self.host.report(PoolEvent::WorkerTerminated {
            user: self.host.user_name().to_owned(),
            worker_id: self.id,
            reason,
        });
        reason
    }
}

impl fmt::Debug for ProtocolWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolWorker")
            .field("id", &self.id)
            .field("user", &self.host.user_name())
            .field("state", &self.state)
            .field("connected", &self.is_connected())
            .finish()
    }
}
