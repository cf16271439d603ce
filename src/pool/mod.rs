use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::bridge::{Message, MessageBridge};
use crate::config::{GatewayConfig, UserEntry};
use crate::events::{EventEmitter, PoolEvent};
use crate::logging::{LogLevel, Logger};
use crate::registry::ServerRegistry;
use crate::worker::{ProtocolWorker, WorkerHost};

const LOG_CONTEXT: &str = "pool::lifecycle";
const BROADCAST_CONTEXT: &str = "pool::broadcast";
const REPLENISH_CONTEXT: &str = "pool::replenish";
const DRAIN_POLL_SLICE: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    /// Pause between consecutive worker spawns.
    pub spawn_interval: Duration,
    /// `None` leaves the OS connect timeout in place.
    pub connect_timeout: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for PoolSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            spawn_interval: Duration::from_millis(config.spawn_interval_ms),
            connect_timeout: (config.connect_timeout_ms > 0)
                .then(|| Duration::from_millis(config.connect_timeout_ms)),
        }
    }
}

/// Collaborators shared by every pool of one gateway.
#[derive(Clone, Debug)]
pub struct PoolContext {
    pub registry: Arc<ServerRegistry>,
    pub events: Arc<EventEmitter>,
    pub settings: PoolSettings,
    pub logger: Logger,
}

#[derive(Debug)]
pub enum PoolError {
    AlreadyInitialized { user: String },
    /// Not a single worker reached the serving loop during initialization.
    NoConnections { user: String, target: usize },
    Spawn { user: String, source: io::Error },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInitialized { user } => {
                write!(f, "session pool for '{user}' is already initialized")
            }
            Self::NoConnections { user, target } => write!(
                f,
                "session pool for '{user}' could not establish any of {target} connections"
            ),
            Self::Spawn { user, source } => {
                write!(f, "failed to spawn worker thread for '{user}': {source}")
            }
        }
    }
}

impl Error for PoolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            Self::AlreadyInitialized { .. } | Self::NoConnections { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub user: String,
    pub target: usize,
    pub live: usize,
    pub pending_replacements: usize,
    pub unspawned: usize,
    pub tracked_workers: usize,
    pub stop_requested: bool,
    pub exhausted: bool,
    pub pending_requests: usize,
    pub pending_responses: usize,
}

/// Which counter a connecting worker is filling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Initial,
    Replacement,
}

struct WorkerHandle {
    stop: Arc<AtomicBool>,
    /// Held until the worker registers as live or fails to connect.
    slot: Option<Slot>,
    /// `None` while the worker is still connecting on the spawner's thread.
    join: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct PoolState {
    initialized: bool,
    target: usize,
    live: usize,
    pending_replacements: usize,
    /// Initialization slots `start` has not reached yet.
    unspawned: usize,
    stop_requested: bool,
    exhausted_notified: bool,
    workers: HashMap<Uuid, WorkerHandle>,
}

impl PoolState {
    /// Slots that are live or already spoken for.
    fn reserved(&self) -> usize {
        self.live + self.pending_replacements + self.unspawned
    }

    fn release_slot(&mut self, slot: Slot) {
        let counter = match slot {
            Slot::Initial => &mut self.unspawned,
            Slot::Replacement => &mut self.pending_replacements,
        };
        *counter = counter.saturating_sub(1);
    }

    fn prune_finished(&mut self) -> Vec<JoinHandle<()>> {
        let finished: Vec<Uuid> = self
            .workers
            .iter()
            .filter(|(_, handle)| handle.join.as_ref().is_some_and(JoinHandle::is_finished))
            .map(|(id, _)| *id)
            .collect();

        finished
            .into_iter()
            .filter_map(|id| self.workers.remove(&id).and_then(|handle| handle.join))
            .collect()
    }
}

struct PoolCore {
    user_name: String,
    password: String,
    bridge: MessageBridge,
    context: PoolContext,
    state: Mutex<PoolState>,
    gate: Condvar,
    stopping: AtomicBool,
    self_ref: Weak<PoolCore>,
}

/// Keeps up to `target` authenticated sessions for one user, all fed from
/// the same request queue.
#[derive(Clone)]
pub struct SessionPool {
    core: Arc<PoolCore>,
}

impl SessionPool {
    pub fn new(user: &UserEntry, bridge: MessageBridge, context: &PoolContext) -> Self {
        let core = Arc::new_cyclic(|self_ref| PoolCore {
            user_name: user.name.clone(),
            password: user.password.clone(),
            bridge,
            context: context.clone(),
            state: Mutex::new(PoolState::default()),
            gate: Condvar::new(),
            stopping: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });
        Self { core }
    }

    pub fn user_name(&self) -> &str {
        &self.core.user_name
    }

    pub fn bridge(&self) -> &MessageBridge {
        &self.core.bridge
    }

    /// Spawns `target` workers one after another and blocks until a stop is
    /// broadcast. Fails right away if none of them connected.
    pub fn initialize(&self, target: usize) -> Result<usize, PoolError> {
        let connected = self.start(target)?;
        self.wait_until_stopped();
        Ok(connected)
    }

    /// Non-blocking half of [`SessionPool::initialize`].
    pub fn start(&self, target: usize) -> Result<usize, PoolError> {
        {
            let mut state = self.core.lock_state();
            if state.initialized {
                return Err(PoolError::AlreadyInitialized {
                    user: self.core.user_name.clone(),
                });
            }
            state.initialized = true;
            state.target = target;
            state.unspawned = target;
        }

        self.core.context.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Initializing session pool",
            Some(json!({
                "user": self.core.user_name,
                "target": target,
                "servers": self.core.context.registry.len(),
                "attempts_per_pass": self.core.context.registry.attempts_per_pass(),
            })),
        );

        let spawned = self.spawn_initial(target);
        self.core.lock_state().unspawned = 0;
        let connected = spawned?;

        if connected == 0 {
            return Err(PoolError::NoConnections {
                user: self.core.user_name.clone(),
                target,
            });
        }

        self.core.context.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Session pool ready",
            Some(json!({
                "user": self.core.user_name,
                "target": target,
                "connected": connected,
            })),
        );
        // Replacements that gave up while initial slots were still
        // unspawned could not report exhaustion themselves.
        self.core.notify_if_exhausted();
        Ok(connected)
    }

    fn spawn_initial(&self, target: usize) -> Result<usize, PoolError> {
        let mut connected = 0;
        for index in 0..target {
            if self.core.is_stopping() {
                break;
            }
            if index > 0 {
                self.core.pause(self.core.context.settings.spawn_interval);
            }
            if self.core.spawn_worker(Slot::Initial)? {
                connected += 1;
            }
        }
        Ok(connected)
    }

    pub fn wait_until_stopped(&self) {
        let mut state = self.core.lock_state();
        while !state.stop_requested {
            state = self
                .core
                .gate
                .wait(state)
                .expect("session pool lock poisoned");
        }
    }

    /// Sends one STOP per live worker and raises every worker's stop flag.
    /// Only the first call has an effect; later calls return 0.
    pub fn broadcast_stop(&self) -> usize {
        let stops_sent = {
            let mut state = self.core.lock_state();
            if state.stop_requested {
                return 0;
            }
            state.stop_requested = true;
            self.core.stopping.store(true, Ordering::SeqCst);

            for handle in state.workers.values() {
                handle.stop.store(true, Ordering::SeqCst);
            }

            let mut sent = 0;
            for _ in 0..state.live {
                match self.core.bridge.send_stop() {
                    Ok(()) => sent += 1,
                    Err(error) => self.core.context.logger.log(
                        LogLevel::Error,
                        Some(BROADCAST_CONTEXT),
                        "Failed to enqueue STOP",
                        Some(json!({"user": self.core.user_name, "error": error.to_string()})),
                    ),
                }
            }
            self.core.gate.notify_all();
            sent
        };

        self.core.context.logger.log(
            LogLevel::Info,
            Some(BROADCAST_CONTEXT),
            "Stop broadcast to session pool",
            Some(json!({"user": self.core.user_name, "stops_sent": stops_sent})),
        );
        self.core.report(PoolEvent::StopBroadcast {
            user: self.core.user_name.clone(),
            stops_sent,
        });
        stops_sent
    }

    /// Waits until every worker thread has exited. Returns `false` if some
    /// were still running when `timeout` elapsed.
    pub fn wait_for_workers(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let (finished, remaining, state) = {
                let mut state = self.core.lock_state();
                let finished = state.prune_finished();
                let remaining = state.workers.len();
                (finished, remaining, state)
            };

            if remaining == 0 {
                drop(state);
                join_all(finished);
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                drop(state);
                join_all(finished);
                return false;
            }
            let slice = DRAIN_POLL_SLICE.min(deadline - now);
            let _ = self
                .core
                .gate
                .wait_timeout(state, slice)
                .expect("session pool lock poisoned");
            join_all(finished);
        }
    }

    pub fn live_count(&self) -> usize {
        self.core.lock_state().live
    }

    pub fn is_stopping(&self) -> bool {
        self.core.is_stopping()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.core.lock_state();
        PoolSnapshot {
            user: self.core.user_name.clone(),
            target: state.target,
            live: state.live,
            pending_replacements: state.pending_replacements,
            unspawned: state.unspawned,
            tracked_workers: state.workers.len(),
            stop_requested: state.stop_requested,
            exhausted: state.exhausted_notified,
            pending_requests: self.core.bridge.pending_requests(),
            pending_responses: self.core.bridge.pending_responses(),
        }
    }
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.join();
    }
}

impl PoolCore {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("session pool lock poisoned")
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn pause(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let deadline = Instant::now() + duration;
        let mut state = self.lock_state();
        while !state.stop_requested {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            state = self
                .gate
                .wait_timeout(state, deadline - now)
                .expect("session pool lock poisoned")
                .0;
        }
    }

    /// Connects a new worker for `slot` on the calling thread and, once it
    /// is live, hands its serving loop to a dedicated thread. `Ok(false)`
    /// means the worker never went live and the slot was given back.
    fn spawn_worker(self: &Arc<Self>, slot: Slot) -> Result<bool, PoolError> {
        let stop = Arc::new(AtomicBool::new(false));
        let host: Arc<dyn WorkerHost> = self.clone();
        let mut worker = ProtocolWorker::new(host, Arc::clone(&stop), self.context.logger.clone());
        let worker_id = worker.id();

        let finished = {
            let mut state = self.lock_state();
            if state.stop_requested {
                state.release_slot(slot);
                return Ok(false);
            }
            let finished = state.prune_finished();
            state.workers.insert(
                worker_id,
                WorkerHandle {
                    stop: Arc::clone(&stop),
                    slot: Some(slot),
                    join: None,
                },
            );
            finished
        };
        join_all(finished);

        if worker.start().is_err() {
            self.forget_worker(worker_id);
            return Ok(false);
        }

        let core = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("sps-{}", self.user_name))
            .spawn(move || {
                worker.run();
                core.gate.notify_all();
            });

        match spawned {
            Ok(join) => {
                let mut state = self.lock_state();
                if let Some(handle) = state.workers.get_mut(&worker_id) {
                    handle.join = Some(join);
                }
                Ok(true)
            }
            Err(source) => {
                {
                    let mut state = self.lock_state();
                    state.live = state.live.saturating_sub(1);
                }
                self.forget_worker(worker_id);
                Err(PoolError::Spawn {
                    user: self.user_name.clone(),
                    source,
                })
            }
        }
    }

    fn forget_worker(&self, worker_id: Uuid) {
        let mut state = self.lock_state();
        if let Some(slot) = state
            .workers
            .remove(&worker_id)
            .and_then(|handle| handle.slot)
        {
            state.release_slot(slot);
        }
        self.gate.notify_all();
    }

    /// Spawns replacements until the reserved slots are back at the target,
    /// then reports exhaustion if the pool ended up empty.
    fn replenish(self: &Arc<Self>, shortfall: usize) {
        let mut remaining = shortfall;
        while remaining > 0 {
            remaining -= 1;
            if !self.is_stopping() {
                self.pause(self.context.settings.spawn_interval);
            }
            let started = if self.is_stopping() {
                self.lock_state().release_slot(Slot::Replacement);
                false
            } else {
                match self.spawn_worker(Slot::Replacement) {
                    Ok(started) => started,
                    Err(error) => {
                        self.context.logger.log(
                            LogLevel::Error,
                            Some(REPLENISH_CONTEXT),
                            "Replacement worker could not be spawned",
                            Some(json!({"user": self.user_name, "error": error.to_string()})),
                        );
                        false
                    }
                }
            };

            self.context.logger.log(
                LogLevel::Debug,
                Some(REPLENISH_CONTEXT),
                "Replacement attempt finished",
                Some(json!({"user": self.user_name, "started": started})),
            );
        }

        self.notify_if_exhausted();
    }

    /// Reports exhaustion once the pool is empty with nothing left to
    /// spawn. Latched: only the first empty observation reports.
    fn notify_if_exhausted(&self) {
        let exhausted = {
            let mut state = self.lock_state();
            let exhausted = state.initialized
                && state.reserved() == 0
                && !state.stop_requested
                && !state.exhausted_notified;
            if exhausted {
                state.exhausted_notified = true;
            }
            exhausted
        };

        if exhausted {
            self.context.logger.log(
                LogLevel::Error,
                Some(REPLENISH_CONTEXT),
                "Session pool has no live workers left",
                Some(json!({"user": self.user_name})),
            );
            self.report(PoolEvent::PoolExhausted {
                user: self.user_name.clone(),
            });
        }
    }
}

impl WorkerHost for PoolCore {
    fn user_name(&self) -> &str {
        &self.user_name
    }

    fn password(&self) -> &str {
        &self.password
    }

    fn registry(&self) -> &ServerRegistry {
        &self.context.registry
    }

    fn connect_timeout(&self) -> Option<Duration> {
        self.context.settings.connect_timeout
    }

    fn pull(&self) -> Message {
        self.bridge.pull()
    }

    fn push(&self, message: Message) {
        let correlation_id = message.correlation_id;
        if let Err(error) = self.bridge.push(message) {
            self.context.logger.log(
                LogLevel::Error,
                Some(LOG_CONTEXT),
                "Failed to push response",
                Some(json!({
                    "user": self.user_name,
                    "correlation_id": correlation_id,
                    "error": error.to_string(),
                })),
            );
        }
    }

    fn register_live(&self, worker_id: Uuid) -> bool {
        let mut state = self.lock_state();
        if state.stop_requested || state.live >= state.target {
            return false;
        }
        if let Some(slot) = state
            .workers
            .get_mut(&worker_id)
            .and_then(|handle| handle.slot.take())
        {
            state.release_slot(slot);
        }
        state.live += 1;
        self.context.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "Worker registered as live",
            Some(json!({
                "user": self.user_name,
                "worker_id": worker_id.to_string(),
                "live": state.live,
            })),
        );
        true
    }

    fn release_live(&self, worker_id: Uuid) {
        let shortfall = {
            let mut state = self.lock_state();
            state.live = state.live.saturating_sub(1);
            let shortfall = if state.stop_requested {
                0
            } else {
                state.target.saturating_sub(state.reserved())
            };
            state.pending_replacements += shortfall;

            self.context.logger.log(
                LogLevel::Info,
                Some(REPLENISH_CONTEXT),
                "Worker released its live slot",
                Some(json!({
                    "user": self.user_name,
                    "worker_id": worker_id.to_string(),
                    "live": state.live,
                    "replacements": shortfall,
                })),
            );
            shortfall
        };

        match self.self_ref.upgrade() {
            Some(core) => core.replenish(shortfall),
            None => {
                let mut state = self.lock_state();
                state.pending_replacements -= shortfall;
            }
        }
    }

    fn report(&self, event: PoolEvent) {
        self.context.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            &format!("Pool event '{}'", event.name()),
            Some(event.payload()),
        );
        if let Err(error) = self.context.events.emit(&event) {
            self.context.logger.log(
                LogLevel::Warn,
                Some(LOG_CONTEXT),
                "Pool event listener failed",
                Some(json!({"event": event.name(), "error": error.to_string()})),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use uuid::Uuid;

    use crate::bridge::MessageBridge;
    use crate::config::{GatewayConfig, UserEntry};
    use crate::events::EventEmitter;
    use crate::logging::testing::memory_logger;
    use crate::logging::LogLevel;
    use crate::protocol::{LOGIN_SUCCESS_MARKER, SESSION_LAYER_ERROR_RESPONSE};
    use crate::registry::{ServerDescriptor, ServerRegistry};
    use crate::test_support::{refused_addr, wait_until, FakeSps, Reply};
    use crate::worker::WorkerHost;

    use super::{PoolContext, PoolError, PoolSettings, SessionPool};

    const WAIT: Duration = Duration::from_secs(5);

    fn user() -> UserEntry {
        UserEntry {
            name: "oss".to_owned(),
            password: "secret".to_owned(),
            max_connections: 1,
        }
    }

    fn context(servers: &[SocketAddr], events: Arc<EventEmitter>) -> PoolContext {
        context_with_retries(servers, 1, Duration::ZERO, events)
    }

    fn context_with_retries(
        servers: &[SocketAddr],
        retry_attempts: u32,
        retry_interval: Duration,
        events: Arc<EventEmitter>,
    ) -> PoolContext {
        let descriptors = servers
            .iter()
            .map(|addr| {
                ServerDescriptor::new(addr.ip(), addr.port(), retry_attempts, retry_interval, "/opt/sps")
            })
            .collect();
        let (logger, _sink) = memory_logger(LogLevel::Error);
        PoolContext {
            registry: Arc::new(ServerRegistry::new(descriptors).expect("registry should build")),
            events,
            settings: PoolSettings {
                spawn_interval: Duration::ZERO,
                connect_timeout: None,
            },
            logger,
        }
    }

    fn pool_for(servers: &[SocketAddr], events: Arc<EventEmitter>) -> SessionPool {
        SessionPool::new(&user(), MessageBridge::local(), &context(servers, events))
    }

    fn count_events(events: &EventEmitter, name: &'static str) -> Arc<AtomicUsize> {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        events.on(move |event| {
            if event.name() == name {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });
        counter
    }

    fn bar_server(max_connections: Option<usize>) -> FakeSps {
        FakeSps::with_login(max_connections, |_index, _request| {
            Reply::Respond("<Bar/>".to_owned())
        })
    }

    #[test]
    fn settings_follow_gateway_config() {
        let settings = PoolSettings::from(&GatewayConfig {
            spawn_interval_ms: 250,
            drain_timeout_ms: 1_000,
            connect_timeout_ms: 0,
        });
        assert_eq!(settings.spawn_interval, Duration::from_millis(250));
        assert_eq!(settings.connect_timeout, None);

        let settings = PoolSettings::from(&GatewayConfig {
            connect_timeout_ms: 1_500,
            ..GatewayConfig::default()
        });
        assert_eq!(settings.connect_timeout, Some(Duration::from_millis(1_500)));
    }

    #[test]
    fn initialize_fails_when_no_server_is_reachable() {
        let pool = pool_for(&[refused_addr()], Arc::new(EventEmitter::new()));

        let err = pool.initialize(1).expect_err("initialize should fail");
        assert!(matches!(err, PoolError::NoConnections { target: 1, .. }));
        assert_eq!(pool.live_count(), 0);
        assert!(matches!(
            pool.start(1),
            Err(PoolError::AlreadyInitialized { .. })
        ));
    }

    #[test]
    fn initialize_blocks_until_stop_broadcast() {
        let server = bar_server(None);
        let pool = pool_for(&[server.addr()], Arc::new(EventEmitter::new()));
        let runner = {
            let pool = pool.clone();
            thread::spawn(move || pool.initialize(2))
        };

        assert!(wait_until(WAIT, || pool.live_count() == 2));
        assert!(!runner.is_finished());

        assert_eq!(pool.broadcast_stop(), 2);
        assert_eq!(runner.join().expect("initialize thread").expect("pool"), 2);
        assert!(pool.wait_for_workers(WAIT));
        assert!(server.wait_for("<Logout ", 2, WAIT));
    }

    #[test]
    fn serves_requests_through_the_bridge() {
        let server = bar_server(None);
        let pool = pool_for(&[server.addr()], Arc::new(EventEmitter::new()));
        assert_eq!(pool.start(1).expect("pool should start"), 1);

        pool.bridge().submit(42, "<Foo/>").expect("submit should work");
        let response = pool
            .bridge()
            .await_response(42, Some(WAIT))
            .expect("response should arrive");
        assert_eq!(response.payload, "s:6:\"<Bar/>\";");

        pool.broadcast_stop();
        assert!(pool.wait_for_workers(WAIT));
    }

    #[test]
    fn broadcast_stop_is_idempotent() {
        let server = bar_server(None);
        let events = Arc::new(EventEmitter::new());
        let broadcasts = count_events(&events, "pool.stop_broadcast");
        let pool = pool_for(&[server.addr()], events);
        pool.start(2).expect("pool should start");

        assert_eq!(pool.broadcast_stop(), 2);
        assert_eq!(pool.broadcast_stop(), 0);
        assert!(pool.wait_for_workers(WAIT));

        let snapshot = pool.snapshot();
        assert!(snapshot.stop_requested);
        assert_eq!(snapshot.tracked_workers, 0);
        assert_eq!(broadcasts.load(Ordering::SeqCst), 1);
        assert_eq!(server.received_containing("<Logout "), 2);
    }

    #[test]
    fn failed_worker_is_replaced() {
        let server = FakeSps::spawn(None, |index, request| {
            if request.contains("<Login ") {
                if index == 1 {
                    Reply::Respond("<LoginResponse>Denied</LoginResponse>".to_owned())
                } else {
                    Reply::Respond(format!("<LoginResponse>{LOGIN_SUCCESS_MARKER}</LoginResponse>"))
                }
            } else if request.contains("<Logout ") {
                Reply::Respond("<LogoutResponse/>".to_owned())
            } else if index == 0 {
                Reply::Hangup
            } else {
                Reply::Respond("<Bar/>".to_owned())
            }
        });
        let events = Arc::new(EventEmitter::new());
        let exhausted = count_events(&events, "pool.exhausted");
        let pool = pool_for(&[server.addr()], events);
        pool.start(1).expect("pool should start");

        pool.bridge().submit(42, "<Foo/>").expect("submit should work");
        let response = pool
            .bridge()
            .await_response(42, Some(WAIT))
            .expect("fallback should arrive");
        assert_eq!(response.payload, SESSION_LAYER_ERROR_RESPONSE);

        assert!(wait_until(WAIT, || server.connections() == 3
            && pool.live_count() == 1));
        pool.bridge().submit(43, "<Foo/>").expect("submit should work");
        let response = pool
            .bridge()
            .await_response(43, Some(WAIT))
            .expect("response should arrive");
        assert_eq!(response.payload, "s:6:\"<Bar/>\";");
        assert_eq!(exhausted.load(Ordering::SeqCst), 0);

        pool.broadcast_stop();
        assert!(pool.wait_for_workers(WAIT));
    }

    #[test]
    fn losing_every_worker_reports_exhaustion_once() {
        let server = FakeSps::with_login(Some(2), |_index, _request| Reply::Hangup);
        let events = Arc::new(EventEmitter::new());
        let exhausted = count_events(&events, "pool.exhausted");
        let pool = pool_for(&[server.addr()], events);
        assert_eq!(pool.start(2).expect("pool should start"), 2);

        pool.bridge().submit(1, "<Foo/>").expect("submit should work");
        pool.bridge().submit(2, "<Foo/>").expect("submit should work");
        for correlation_id in [1, 2] {
            let response = pool
                .bridge()
                .await_response(correlation_id, Some(WAIT))
                .expect("fallback should arrive");
            assert_eq!(response.payload, SESSION_LAYER_ERROR_RESPONSE);
        }

        assert!(wait_until(WAIT, || exhausted.load(Ordering::SeqCst) == 1));
        assert!(pool.wait_for_workers(WAIT));
        thread::sleep(Duration::from_millis(50));

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.live, 0);
        assert_eq!(snapshot.pending_replacements, 0);
        assert!(snapshot.exhausted);
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_broadcast_suppresses_replacement() {
        let server = FakeSps::with_login(Some(1), |_index, _request| Reply::Hangup);
        let events = Arc::new(EventEmitter::new());
        let exhausted = count_events(&events, "pool.exhausted");
        let pool = pool_for(&[server.addr()], events);
        pool.start(1).expect("pool should start");

        assert_eq!(pool.broadcast_stop(), 1);
        assert!(pool.wait_for_workers(WAIT));
        assert_eq!(server.connections(), 1);
        assert_eq!(pool.snapshot().pending_replacements, 0);
        assert_eq!(exhausted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn worker_failing_during_startup_is_not_replaced_twice() {
        let server = FakeSps::with_login(None, |index, _request| {
            if index < 2 {
                Reply::Hangup
            } else {
                Reply::Respond("<Bar/>".to_owned())
            }
        });
        let events = Arc::new(EventEmitter::new());
        let exhausted = count_events(&events, "pool.exhausted");
        let mut context = context(&[server.addr()], events);
        context.settings.spawn_interval = Duration::from_millis(300);
        let pool = SessionPool::new(&user(), MessageBridge::local(), &context);
        let starter = {
            let pool = pool.clone();
            thread::spawn(move || pool.start(2))
        };

        assert!(wait_until(WAIT, || pool.live_count() == 1));
        pool.bridge().submit(1, "<Foo/>").expect("submit should work");
        let response = pool
            .bridge()
            .await_response(1, Some(WAIT))
            .expect("fallback should arrive");
        assert_eq!(response.payload, SESSION_LAYER_ERROR_RESPONSE);

        assert_eq!(starter.join().expect("start thread").expect("pool"), 2);
        assert!(wait_until(WAIT, || pool.live_count() == 2));
        thread::sleep(Duration::from_millis(1_000));

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.live, 2);
        assert_eq!(snapshot.pending_replacements, 0);
        assert_eq!(snapshot.unspawned, 0);
        assert_eq!(server.connections(), 4);
        assert_eq!(exhausted.load(Ordering::SeqCst), 0);

        pool.broadcast_stop();
        assert!(pool.wait_for_workers(WAIT));
    }

    #[test]
    fn full_pool_refuses_extra_registration() {
        let server = bar_server(None);
        let pool = pool_for(&[server.addr()], Arc::new(EventEmitter::new()));
        pool.start(1).expect("pool should start");

        assert!(!pool.core.register_live(Uuid::new_v4()));
        assert_eq!(pool.live_count(), 1);

        pool.broadcast_stop();
        assert!(pool.wait_for_workers(WAIT));
    }

    #[test]
    fn stop_broadcast_interrupts_reconnect_backoff() {
        let server = FakeSps::with_login(Some(1), |_index, _request| Reply::Hangup);
        let events = Arc::new(EventEmitter::new());
        let exhausted = count_events(&events, "pool.exhausted");
        let context =
            context_with_retries(&[server.addr()], 2, Duration::from_secs(30), events);
        let pool = SessionPool::new(&user(), MessageBridge::local(), &context);
        pool.start(1).expect("pool should start");

        pool.bridge().submit(7, "<Foo/>").expect("submit should work");
        assert!(server.wait_for("<Foo/>", 1, WAIT));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(pool.bridge().pending_responses(), 0);

        let stopped_at = Instant::now();
        pool.broadcast_stop();
        assert!(pool.wait_for_workers(WAIT));
        assert!(stopped_at.elapsed() < Duration::from_secs(2));

        let response = pool
            .bridge()
            .await_response(7, Some(WAIT))
            .expect("fallback should arrive");
        assert_eq!(response.payload, SESSION_LAYER_ERROR_RESPONSE);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.live, 0);
        assert_eq!(snapshot.pending_replacements, 0);
        assert_eq!(server.connections(), 1);
        assert_eq!(exhausted.load(Ordering::SeqCst), 0);
    }
}
