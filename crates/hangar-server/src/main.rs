//! MCP Hangar entry point.
//!
//! Loads the configuration, builds the runtime, starts the background
//! supervisors and serves the control plane over stdio (default) or HTTP.
//! SIGHUP triggers a hot reload; SIGTERM/SIGINT drain in-flight calls and
//! shut every provider down.

use clap::Parser;
use hangar_core::workers::BackgroundWorkers;
use hangar_server::{routes, rpc, state::AppState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period for in-flight calls on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// MCP Hangar - control plane multiplexing many MCP providers behind one endpoint
#[derive(Parser, Debug)]
#[command(name = "mcp-hangar")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "HANGAR_CONFIG", default_value = "hangar.yaml")]
    config: PathBuf,

    /// Serve over HTTP instead of stdio
    #[arg(long)]
    http: bool,

    /// HTTP bind host (HTTP mode)
    #[arg(long)]
    host: Option<String>,

    /// HTTP bind port (HTTP mode)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_logging();

    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            std::process::ExitCode::FAILURE
        }
    }
}

/// Logging always goes to stderr: in stdio mode stdout carries only
/// JSON-RPC responses.
fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hangar=info,hangar_core=info,hangar_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = hangar_config::load_config(&cli.config).await?;
    config.server.apply_env_overrides();
    if let Some(host) = cli.host.clone() {
        config.server.http_host = host;
    }
    if let Some(port) = cli.port {
        config.server.http_port = port;
    }

    let state = AppState::build(&config, Some(cli.config.clone()))?;
    info!(
        providers = config.providers.len(),
        groups = config.groups.len(),
        "hangar runtime ready"
    );

    // Background supervisors: idle GC, active health probes, config watch.
    let workers = Arc::new(BackgroundWorkers::new());
    workers.spawn_idle_gc(state.registry.clone(), None);
    workers.spawn_health_prober(state.registry.clone(), None);
    if let Some(reload) = &state.reload {
        workers.spawn_config_watcher(reload.clone(), config.config_reload.clone());
    }

    spawn_signal_handlers(state.clone());

    let served = if cli.http {
        routes::serve_http(
            state.clone(),
            &config.server.http_host,
            config.server.http_port,
        )
        .await
    } else {
        rpc::serve_stdio(state.clone()).await
    };
    if let Err(e) = served {
        warn!(error = %e, "serving loop ended with error");
    }

    // Drain: wait briefly for in-flight calls, then bury everything.
    state.shutting_down.cancel();
    let drain_deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while state.in_flight_count() > 0 && tokio::time::Instant::now() < drain_deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if state.in_flight_count() > 0 {
        warn!(
            remaining = state.in_flight_count(),
            "grace period elapsed with calls still in flight"
        );
    }

    workers.stop().await;
    state.registry.shutdown_all("shutdown").await;
    info!("shutdown complete");
    Ok(())
}

/// SIGHUP reloads configuration; SIGTERM/SIGINT begin the drain.
fn spawn_signal_handlers(state: Arc<AppState>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let reload_state = state.clone();
        tokio::spawn(async move {
            let mut hup = match signal(SignalKind::hangup()) {
                Ok(hup) => hup,
                Err(e) => {
                    warn!(error = %e, "cannot install SIGHUP handler");
                    return;
                }
            };
            while hup.recv().await.is_some() {
                info!("SIGHUP received, reloading configuration");
                if let Some(reload) = &reload_state.reload {
                    if let Err(e) = reload.reload(true, "signal").await {
                        warn!(error = %e, "signal-triggered reload failed");
                    }
                }
            }
        });

        let term_state = state;
        tokio::spawn(async move {
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    warn!(error = %e, "cannot install SIGTERM handler");
                    return;
                }
            };
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::select! {
                _ = term.recv() => info!("SIGTERM received, shutting down"),
                _ = ctrl_c => info!("interrupt received, shutting down"),
            }
            term_state.shutting_down.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                state.shutting_down.cancel();
            }
        });
    }
}
