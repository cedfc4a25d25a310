//! Signal handling for graceful shutdown.

use tracing::info;

/// Wait for a shutdown request (SIGINT, SIGTERM, SIGQUIT, SIGHUP, or
/// SIGPIPE on Unix). A broken pipe is a shutdown request here, not a crash.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to set up SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to set up SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("Failed to set up SIGQUIT handler");
    let mut sighup = signal(SignalKind::hangup()).expect("Failed to set up SIGHUP handler");
    let mut sigpipe = signal(SignalKind::pipe()).expect("Failed to set up SIGPIPE handler");

    tokio::select! {
        _ = sigint.recv() => {
            info!(message = "Signal received.", signal = "SIGINT");
        }
        _ = sigterm.recv() => {
            info!(message = "Signal received.", signal = "SIGTERM");
        }
        _ = sigquit.recv() => {
            info!(message = "Signal received.", signal = "SIGQUIT");
        }
        _ = sighup.recv() => {
            info!(message = "Signal received.", signal = "SIGHUP");
        }
        _ = sigpipe.recv() => {
            info!(message = "Signal received.", signal = "SIGPIPE");
        }
    }
}
