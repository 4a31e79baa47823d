use super::ApilensClient;
use std::sync::Weak;
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tracing::{error, info};

/// Waits for SIGTERM or SIGINT, then runs graceful shutdown on the client
/// if it is still alive. Tokio signal streams observe signals without
/// displacing handlers the host may have installed itself.
pub(crate) fn spawn_signal_listener(client: Weak<ApilensClient>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match unix_signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!("failed to install SIGTERM handler: {e}");
                    return;
                }
            };

            tokio::select! {
                result = signal::ctrl_c() => {
                    match result {
                        Ok(()) => info!("received SIGINT, flushing analytics client"),
                        Err(e) => {
                            error!("failed to listen for SIGINT: {e}");
                            return;
                        }
                    }
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, flushing analytics client");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = signal::ctrl_c().await {
                error!("failed to listen for SIGINT: {e}");
                return;
            }
            info!("received SIGINT, flushing analytics client");
        }

        if let Some(client) = client.upgrade() {
            client.shutdown().await;
        }
    });
}
