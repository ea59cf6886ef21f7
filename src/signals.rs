// Signal handling for graceful shutdown

use crate::error::{Result, SegvecError};
use tokio::signal::unix::{signal, Signal as TokioSignal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Waits for SIGTERM or SIGINT
pub struct SignalHandler {
    sigterm: TokioSignal,
    sigint: TokioSignal,
}

impl SignalHandler {
    pub fn new() -> Result<Self> {
        let sigterm = signal(SignalKind::terminate())
            .map_err(|e| SegvecError::io(e, "Failed to setup SIGTERM handler"))?;
        let sigint = signal(SignalKind::interrupt())
            .map_err(|e| SegvecError::io(e, "Failed to setup SIGINT handler"))?;

        Ok(Self { sigterm, sigint })
    }

    /// Wait for a shutdown signal, returning its name
    pub async fn wait(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => {
                tracing::info!("Received SIGTERM");
                "terminate"
            }
            _ = self.sigint.recv() => {
                tracing::info!("Received SIGINT");
                "interrupt"
            }
        }
    }

    /// Cancel `token` on the first shutdown signal
    pub fn cancel_on_signal(mut self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                sig = self.wait() => {
                    tracing::warn!("Stopping after {} signal", sig);
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        })
    }
}
