//! Installs the signal handlers of the gateway.
//!
//! **CTRL+C** (SIGINT) invokes [Platform::terminate](crate::platform::Platform::terminate), which
//! makes the server stop accepting requests and the gateway write its final snapshot.
//! **SIGHUP** forces the [Config](crate::config::Config) to re-read its file, even if its
//! modification date didn't change.
use std::sync::Arc;

use tokio::signal::unix::SignalKind;

use crate::config::Config;
use crate::platform::Platform;

/// Forks a task which handles the signals for the given platform.
pub fn install(platform: Arc<Platform>) {
    crate::spawn!(async move {
        let mut sig_hup = match tokio::signal::unix::signal(SignalKind::hangup()) {
            Ok(signal) => Some(signal),
            Err(error) => {
                log::warn!("Cannot install a handler for SIGHUP: {}", error);
                None
            }
        };

        while platform.is_running() {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Received CTRL-C. Shutting down...");
                    platform.terminate();
                },
                Some(_) = next_hangup(&mut sig_hup) => {
                    log::info!("Received SIGHUP. Reloading the configuration...");
                    if let Some(config) = platform.find::<Config>() {
                        if let Err(error) = config.load().await {
                            log::error!("Failed to re-load system config: {:#}", error);
                        }
                    }
                }
            }
        }
    });
}

async fn next_hangup(signal: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match signal {
        Some(signal) => signal.recv().await,
        None => std::future::pending().await,
    }
}
