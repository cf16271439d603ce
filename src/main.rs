use std::process;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;
use session_gateway::config::AppConfig;
use session_gateway::events::{EventEmitter, PoolEvent};
use session_gateway::gateway::Gateway;
use session_gateway::logging::{LogLevel, Logger, LoggerConfig};
use session_gateway::shutdown::ShutdownHooks;

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let app_config = load_config_or_exit();
    let log_level =
        LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
            eprintln!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                app_config.logging.level
            );
            process::exit(2);
        });

    let logger = Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    });
    logger.log(
        LogLevel::Info,
        Some("main::config"),
        "Configuration loaded",
        Some(json!({
            "servers": app_config.servers.len(),
            "users": app_config.users.iter().map(|user| json!({
                "name": user.name,
                "max_connections": user.max_connections,
            })).collect::<Vec<_>>(),
            "spawn_interval_ms": app_config.gateway.spawn_interval_ms,
            "drain_timeout_ms": app_config.gateway.drain_timeout_ms,
        })),
    );

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM/SIGUSR1",
    );

    let emitter = Arc::new(EventEmitter::new());
    {
        let shutdown_flag = shutdown_hooks.flag();
        let logger = logger.clone();
        emitter.on(move |event| {
            if let PoolEvent::PoolExhausted { user } = event {
                logger.error(
                    Some("main::shutdown"),
                    &format!("session pool for '{user}' is exhausted; shutting down"),
                );
                shutdown_flag.store(true, Ordering::SeqCst);
            }
            Ok(())
        });
    }

    let mut gateway =
        Gateway::from_config(&app_config, Arc::clone(&emitter), logger.clone()).unwrap_or_else(
            |error| {
                eprintln!("gateway startup error: {error}");
                process::exit(2);
            },
        );
    gateway.start().unwrap_or_else(|error| {
        eprintln!("gateway startup error: {error}");
        process::exit(2);
    });

    let mut all_failed = false;
    while !shutdown_hooks.is_triggered() {
        if gateway.poll().all_failed() {
            all_failed = true;
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    if all_failed {
        logger.error(
            Some("main::shutdown"),
            "No session pool could be initialized",
        );
    } else {
        logger.info(
            Some("main::shutdown"),
            "Shutdown requested, stopping session pools",
        );
    }

    let drain_timeout = Duration::from_millis(app_config.gateway.drain_timeout_ms);
    if !gateway.stop_all(drain_timeout) {
        logger.warn(
            Some("main::shutdown"),
            "Worker drain timeout reached; continuing shutdown",
        );
    }
    logger.log(
        LogLevel::Debug,
        Some("main::shutdown"),
        "Final pool snapshots",
        Some(json!(gateway.snapshots())),
    );
    logger.info(Some("main::shutdown"), "Shutdown completed");

    if all_failed {
        process::exit(1);
    }
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: the session gateway is intended for POSIX systems");
        process::exit(2);
    }
}

fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;30m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const APP_DESCRIPTION: &str =
        "Pooled, authenticated sessions between local request queues and an XML provisioning server.";

    println!("{BANNER_COLOR}");
    println!("  ::  session-gateway  ::{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("SESSION_GATEWAY_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!(
        "{DIM_GRAY}Config: --config <path>, $SESSION_LAYER_HOME/Conf/gateway.toml or ./gateway.toml{RESET}"
    );
    println!();
    println!("================================================================");
    println!();
}
