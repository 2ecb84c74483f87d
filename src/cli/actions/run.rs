use anyhow::{Context, Result};
use tokio::signal;

use crate::cli::actions::Action;
use crate::engine::Engine;

/// Handle the run action: start the engine and run until a shutdown
/// signal arrives.
///
/// # Errors
///
/// Returns an error if the engine fails to start.
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Run { config } => {
            let engine = Engine::new(*config)?;
            engine.start().await?;

            shutdown_signal().await?;

            engine.stop().await;
        }
    }

    Ok(())
}

/// Wait for shutdown signal (SIGINT, SIGTERM on Unix; Ctrl+C on Windows)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to install SIGINT handler")?;

        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv()  => {
                tracing::info!("Received SIGINT signal");
            },
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM signal");
            },
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("Failed to install Ctrl+C handler")?;
        tracing::info!("Received Ctrl+C signal");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    #[cfg(unix)]
    async fn test_shutdown_signal_with_timeout() {
        // No signal is sent, so waiting must time out rather than return.
        let result = timeout(Duration::from_millis(100), shutdown_signal()).await;

        assert!(result.is_err(), "Should timeout waiting for signal");
    }
}
