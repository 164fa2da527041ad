//! wmux - tmux control-mode gateway daemon
//!
//! Wires the pieces together: sanity-check tmux, ensure the target
//! session exists, start the supervised control-mode client, and serve
//! the WebSocket gateway until ctrl-c.
//!
//! Configuration is environment-driven:
//! - `WMUX_LISTEN` (default `127.0.0.1:8080`)
//! - `WMUX_TARGET_SESSION` (default `webui`)
//! - `WMUX_TMUX_BIN` (default `tmux`)
//! - `WMUX_RESTART_BACKOFF_MS` / `WMUX_RESTART_MAX_BACKOFF_MS`
//! - `WMUX_LOG_DIR` (optional file logging, daily rotation)
//! - `WMUX_LOG_LEVEL` / `RUST_LOG`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wmux_core::{
    check_tmux, ensure_session, CommandPolicy, ControlModeSupervisor, GatewayWsServer, Hub,
    SupervisorConfig,
};

#[derive(Debug, Clone)]
struct Config {
    listen: String,
    target_session: String,
    tmux_bin: String,
    restart_backoff: Duration,
    restart_max_backoff: Duration,
    log_dir: Option<PathBuf>,
}

fn config_from_env() -> Config {
    Config {
        listen: env_or("WMUX_LISTEN", "127.0.0.1:8080"),
        target_session: env_or("WMUX_TARGET_SESSION", "webui"),
        tmux_bin: env_or("WMUX_TMUX_BIN", "tmux"),
        restart_backoff: duration_ms_env_or("WMUX_RESTART_BACKOFF_MS", 500),
        restart_max_backoff: duration_ms_env_or("WMUX_RESTART_MAX_BACKOFF_MS", 10_000),
        log_dir: std::env::var("WMUX_LOG_DIR")
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .map(PathBuf::from),
    }
}

fn env_or(name: &str, fallback: &str) -> String {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn duration_ms_env_or(name: &str, fallback_ms: u64) -> Duration {
    let ms = std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(fallback_ms);
    Duration::from_millis(ms)
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("WMUX_LOG_LEVEL"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

fn init_logging(cfg: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let (file_layer, guard) = match &cfg.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).ok();
            let appender = tracing_appender::rolling::daily(dir, "wmux.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = config_from_env();
    let _log_guard = init_logging(&cfg);

    if cfg.target_session.trim().is_empty() {
        bail!("WMUX_TARGET_SESSION cannot be empty");
    }

    check_tmux(&cfg.tmux_bin).await?;
    ensure_session(&cfg.tmux_bin, &cfg.target_session)
        .await
        .context("ensure target session")?;

    let hub = Hub::new(CommandPolicy::default(), cfg.target_session.clone());

    let supervisor = ControlModeSupervisor::new(
        SupervisorConfig {
            tmux_bin: cfg.tmux_bin.clone(),
            target_session: cfg.target_session.clone(),
            backoff_base: cfg.restart_backoff,
            backoff_max: cfg.restart_max_backoff,
        },
        Box::new({
            let hub = Arc::clone(&hub);
            move |line| hub.feed_line(&line)
        }),
        Box::new({
            let hub = Arc::clone(&hub);
            move || hub.handle_restart()
        }),
    );
    hub.bind_sender(supervisor.clone());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    tokio::spawn(Arc::clone(&supervisor).run(shutdown_tx.subscribe()));
    tokio::spawn({
        let hub = Arc::clone(&hub);
        async move { hub.request_state_sync_with_retry().await }
    });

    let mut server = GatewayWsServer::new(cfg.listen.clone(), Arc::clone(&hub));
    server.start().await?;

    info!(
        listen = %cfg.listen,
        target_session = %cfg.target_session,
        "wmux gateway running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("shutting down");
    server.stop();
    let _ = shutdown_tx.send(());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_env_falls_back_on_garbage() {
        std::env::remove_var("WMUX_TEST_DURATION");
        assert_eq!(
            duration_ms_env_or("WMUX_TEST_DURATION", 500),
            Duration::from_millis(500)
        );

        std::env::set_var("WMUX_TEST_DURATION", "2500");
        assert_eq!(
            duration_ms_env_or("WMUX_TEST_DURATION", 500),
            Duration::from_millis(2500)
        );

        std::env::set_var("WMUX_TEST_DURATION", "soon");
        assert_eq!(
            duration_ms_env_or("WMUX_TEST_DURATION", 500),
            Duration::from_millis(500)
        );
        std::env::remove_var("WMUX_TEST_DURATION");
    }

    #[test]
    fn env_or_trims_and_defaults() {
        std::env::remove_var("WMUX_TEST_STR");
        assert_eq!(env_or("WMUX_TEST_STR", "fallback"), "fallback");
        std::env::set_var("WMUX_TEST_STR", "  value  ");
        assert_eq!(env_or("WMUX_TEST_STR", "fallback"), "value");
        std::env::set_var("WMUX_TEST_STR", "   ");
        assert_eq!(env_or("WMUX_TEST_STR", "fallback"), "fallback");
        std::env::remove_var("WMUX_TEST_STR");
    }
}
