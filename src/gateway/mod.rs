use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::bridge::MessageBridge;
use crate::config::AppConfig;
use crate::events::EventEmitter;
use crate::logging::{LogLevel, Logger};
use crate::pool::{PoolContext, PoolError, PoolSettings, PoolSnapshot, SessionPool};
use crate::registry::{RegistryError, ServerRegistry};

const BOOTSTRAP_CONTEXT: &str = "gateway::bootstrap";
const SHUTDOWN_CONTEXT: &str = "gateway::shutdown";
const RUNNER_POLL_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub enum GatewayError {
    Registry(RegistryError),
    Spawn { user: String, source: io::Error },
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry(error) => write!(f, "server registry error: {error}"),
            Self::Spawn { user, source } => {
                write!(f, "failed to spawn pool thread for '{user}': {source}")
            }
        }
    }
}

impl Error for GatewayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Registry(error) => Some(error),
            Self::Spawn { source, .. } => Some(source),
        }
    }
}

impl From<RegistryError> for GatewayError {
    fn from(value: RegistryError) -> Self {
        Self::Registry(value)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GatewayStatus {
    pub pools: usize,
    pub starting_or_running: usize,
    pub failed: usize,
}

impl GatewayStatus {
    pub fn all_failed(&self) -> bool {
        self.pools > 0 && self.failed == self.pools
    }
}

struct PoolRunner {
    pool: SessionPool,
    target: usize,
    handle: Option<JoinHandle<Result<usize, PoolError>>>,
    failed: bool,
}

/// One session pool per configured user, sharing the server registry,
/// logger and event emitter.
pub struct Gateway {
    runners: Vec<PoolRunner>,
    logger: Logger,
}

impl Gateway {
    pub fn from_config(
        config: &AppConfig,
        events: Arc<EventEmitter>,
        logger: Logger,
    ) -> Result<Self, GatewayError> {
        let context = PoolContext {
            registry: Arc::new(ServerRegistry::from_config(&config.servers)?),
            events,
            settings: PoolSettings::from(&config.gateway),
            logger: logger.clone(),
        };

        let runners = config
            .users
            .iter()
            .map(|user| PoolRunner {
                pool: SessionPool::new(user, MessageBridge::local(), &context),
                target: user.max_connections,
                handle: None,
                failed: false,
            })
            .collect();

        Ok(Self { runners, logger })
    }

    pub fn pools(&self) -> impl Iterator<Item = &SessionPool> {
        self.runners.iter().map(|runner| &runner.pool)
    }

    pub fn pool(&self, user_name: &str) -> Option<&SessionPool> {
        self.pools().find(|pool| pool.user_name() == user_name)
    }

    /// Initializes every pool on its own thread.
    pub fn start(&mut self) -> Result<(), GatewayError> {
        for runner in &mut self.runners {
            if runner.handle.is_some() {
                continue;
            }
            let pool = runner.pool.clone();
            let target = runner.target;
            let handle = thread::Builder::new()
                .name(format!("pool-{}", pool.user_name()))
                .spawn(move || pool.initialize(target))
                .map_err(|source| GatewayError::Spawn {
                    user: runner.pool.user_name().to_owned(),
                    source,
                })?;
            runner.handle = Some(handle);
        }

        self.logger.log(
            LogLevel::Info,
            Some(BOOTSTRAP_CONTEXT),
            "Session pools starting",
            Some(json!({
                "users": self.pools().map(SessionPool::user_name).collect::<Vec<_>>(),
            })),
        );
        Ok(())
    }

    /// Collects pools whose initialization has returned and reports how
    /// many are still up.
    pub fn poll(&mut self) -> GatewayStatus {
        for runner in &mut self.runners {
            let finished = runner.handle.as_ref().is_some_and(JoinHandle::is_finished);
            if finished {
                if let Some(handle) = runner.handle.take() {
                    runner.failed = collect_runner(&self.logger, &runner.pool, handle);
                }
            }
        }

        GatewayStatus {
            pools: self.runners.len(),
            starting_or_running: self
                .runners
                .iter()
                .filter(|runner| runner.handle.is_some())
                .count(),
            failed: self.runners.iter().filter(|runner| runner.failed).count(),
        }
    }

    /// Broadcasts stop to every pool and waits up to `drain_timeout` for all
    /// of their workers. Returns `false` if some were still running.
    pub fn stop_all(&mut self, drain_timeout: Duration) -> bool {
        let deadline = Instant::now() + drain_timeout;

        let stops_sent: usize = self.pools().map(SessionPool::broadcast_stop).sum();
        self.logger.log(
            LogLevel::Info,
            Some(SHUTDOWN_CONTEXT),
            "Stop broadcast to all session pools",
            Some(json!({"pools": self.runners.len(), "stops_sent": stops_sent})),
        );

        let mut drained = true;
        for runner in &mut self.runners {
            if let Some(handle) = runner.handle.take() {
                while !handle.is_finished() && Instant::now() < deadline {
                    thread::sleep(RUNNER_POLL_SLICE);
                }
                if handle.is_finished() {
                    runner.failed = collect_runner(&self.logger, &runner.pool, handle);
                } else {
                    drained = false;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            drained &= runner.pool.wait_for_workers(remaining);
        }

        let level = if drained { LogLevel::Info } else { LogLevel::Warn };
        self.logger.log(
            level,
            Some(SHUTDOWN_CONTEXT),
            if drained {
                "All session pools drained"
            } else {
                "Drain timeout elapsed with workers still running"
            },
            Some(json!({"drain_timeout_ms": drain_timeout.as_millis() as u64})),
        );
        drained
    }

    pub fn snapshots(&self) -> Vec<PoolSnapshot> {
        self.pools().map(SessionPool::snapshot).collect()
    }
}

/// Returns `true` when the pool failed to initialize.
fn collect_runner(
    logger: &Logger,
    pool: &SessionPool,
    handle: JoinHandle<Result<usize, PoolError>>,
) -> bool {
    match handle.join() {
        Ok(Ok(connected)) => {
            logger.log(
                LogLevel::Debug,
                Some(BOOTSTRAP_CONTEXT),
                "Session pool finished",
                Some(json!({"user": pool.user_name(), "connected": connected})),
            );
            false
        }
        Ok(Err(error)) => {
            logger.log(
                LogLevel::Error,
                Some(BOOTSTRAP_CONTEXT),
                "Session pool failed to initialize",
                Some(json!({"user": pool.user_name(), "error": error.to_string()})),
            );
            true
        }
        Err(_) => {
            logger.log(
                LogLevel::Error,
                Some(BOOTSTRAP_CONTEXT),
                "Session pool thread panicked",
                Some(json!({"user": pool.user_name()})),
            );
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::{AppConfig, GatewayConfig, LoggingConfig, ServerEntry, UserEntry};
    use crate::events::EventEmitter;
    use crate::logging::testing::memory_logger;
    use crate::logging::LogLevel;
    use crate::test_support::{refused_addr, wait_until, FakeSps, Reply};

    use super::{Gateway, GatewayError};

    const WAIT: Duration = Duration::from_secs(5);

    fn config(server: SocketAddr, users: &[(&str, usize)]) -> AppConfig {
        AppConfig {
            logging: LoggingConfig {
                level: "error".to_owned(),
                human_friendly: false,
            },
            gateway: GatewayConfig {
                spawn_interval_ms: 0,
                drain_timeout_ms: 5_000,
                connect_timeout_ms: 0,
            },
            servers: vec![ServerEntry {
                address: server.ip().to_string(),
                port: server.port(),
                retry_attempts: 1,
                retry_interval_seconds: 0,
                home_path: "/opt/sps".to_owned(),
            }],
            users: users
                .iter()
                .map(|(name, max_connections)| UserEntry {
                    name: (*name).to_owned(),
                    password: "secret".to_owned(),
                    max_connections: *max_connections,
                })
                .collect(),
        }
    }

    #[test]
    fn runs_one_pool_per_user_and_drains_on_stop() {
        let server = FakeSps::with_login(None, |_index, _request| {
            Reply::Respond("<Bar/>".to_owned())
        });
        let (logger, _sink) = memory_logger(LogLevel::Error);
        let mut gateway = Gateway::from_config(
            &config(server.addr(), &[("oss", 2), ("billing", 1)]),
            Arc::new(EventEmitter::new()),
            logger,
        )
        .expect("gateway should build");

        gateway.start().expect("gateway should start");
        assert!(wait_until(WAIT, || {
            gateway.pools().map(|pool| pool.live_count()).sum::<usize>() == 3
        }));

        let billing = gateway.pool("billing").expect("billing pool");
        billing.bridge().submit(5, "<Foo/>").expect("submit should work");
        let response = billing
            .bridge()
            .await_response(5, Some(WAIT))
            .expect("response should arrive");
        assert_eq!(response.payload, "s:6:\"<Bar/>\";");

        let status = gateway.poll();
        assert_eq!(status.pools, 2);
        assert_eq!(status.starting_or_running, 2);
        assert!(!status.all_failed());

        assert!(gateway.stop_all(WAIT));
        assert!(gateway.snapshots().iter().all(|snapshot| snapshot.stop_requested));
        assert!(server.wait_for("<Logout ", 3, WAIT));
    }

    #[test]
    fn reports_when_every_pool_fails() {
        let (logger, _sink) = memory_logger(LogLevel::Error);
        let mut gateway = Gateway::from_config(
            &config(refused_addr(), &[("oss", 1)]),
            Arc::new(EventEmitter::new()),
            logger,
        )
        .expect("gateway should build");

        gateway.start().expect("gateway should start");
        assert!(wait_until(WAIT, || gateway.poll().all_failed()));
        assert!(gateway.stop_all(WAIT));
    }

    #[test]
    fn rejects_unparseable_server_address() {
        let mut config = config(refused_addr(), &[("oss", 1)]);
        config.servers[0].address = "sps.example.net".to_owned();
        let (logger, _sink) = memory_logger(LogLevel::Error);

        assert!(matches!(
            Gateway::from_config(&config, Arc::new(EventEmitter::new()), logger),
            Err(GatewayError::Registry(_))
        ));
    }
}
