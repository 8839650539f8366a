//! Shutdown on Ctrl+C, SIGTERM or an explicit cancel

use tokio::{
    select,
    signal::{
        ctrl_c,
        unix::{signal, SignalKind},
    },
    task::{self, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{LedgerError, Result};

pub fn run(cancel_token: CancellationToken) -> JoinHandle<()> {
    task::spawn(async move {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => select! {
                _ = cancel_token.cancelled() => warn!("Cancelled"),
                _ = ctrl_c() => warn!("Ctrl+C received"),
                _ = sigterm.recv() => warn!("SIGTERM received"),
            },
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                select! {
                    _ = cancel_token.cancelled() => warn!("Cancelled"),
                    _ = ctrl_c() => warn!("Ctrl+C received"),
                }
            }
        };
        info!("Initiating shutdown");
        cancel_token.cancel();
        info!("Exited");
    })
}

/// Wait for a task and report a panic or abort as an error.
pub async fn join(name: &str, handle: JoinHandle<()>) -> Result<()> {
    handle.await.map_err(|e| {
        error!(task = name, error = %e, "Task failed");
        LedgerError::Task(format!("{}: {}", name, e))
    })
}
