//! tcp-broadcast: a line-protocol broadcast server
//!
//! Clients connect over TCP or a Unix domain socket and speak a tiny
//! newline-delimited protocol:
//! - `ping` / `pong` liveness checks in both directions
//! - `broadcast <msg>` relayed to every connected client
//! - `quit` to disconnect
//!
//! Clients that stay silent after a server `ping` are dropped.

mod config;
mod error;
mod protocol;
mod runtime;

use config::Config;
use runtime::{Server, ShutdownHandle};
use std::process::ExitCode;
use std::thread;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tcp-broadcast: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        host = %config.host,
        max_connections = config.max_connections,
        max_line_bytes = config.max_line_bytes,
        ping_after = config.ping_after.as_secs(),
        timeout = config.timeout.as_secs(),
        "Starting tcp-broadcast server"
    );

    let mut server = match Server::bind(&config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start listener");
            return ExitCode::from(e.exit_code());
        }
    };
    match (server.local_addr(), server.socket_path()) {
        (Some(addr), _) => info!(%addr, "Server listening"),
        (None, Some(path)) => info!(path = %path.display(), "Server listening"),
        (None, None) => info!(listen = %config.listen, "Server listening"),
    }

    if let Err(e) = spawn_signal_listener(server.shutdown_handle()) {
        warn!(error = %e, "Signal handling unavailable");
    }

    let result = server.run();
    server.shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => ExitCode::from(e.exit_code()),
    }
}

/// Wait for SIGINT or SIGTERM on a helper thread, then stop the server.
fn spawn_signal_listener(handle: ShutdownHandle) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || {
            let caught = runtime.block_on(wait_for_signal());
            match caught {
                Ok(name) => info!(signal = name, "Signal caught, cleaning up"),
                Err(e) => {
                    error!(error = %e, "Failed to listen for signals");
                    return;
                }
            }
            if let Err(e) = handle.shutdown() {
                error!(error = %e, "Failed to wake event loop");
            }
        })?;

    Ok(())
}

async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = interrupt.recv() => Ok("SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}
