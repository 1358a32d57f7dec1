// Numan Thabit 2025
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::runtime::Runtime;

/// SIGINT and SIGTERM begin shutdown; SIGUSR1 reloads keys and chains.
/// SIGKILL cannot be caught, which the relay cache scan on the next
/// start covers.
#[cfg(unix)]
pub fn spawn(rt: Arc<Runtime>) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut reload = signal(SignalKind::user_defined1())?;
    let cancel = rt.shutdown_token();

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interrupt.recv() => {
                    info!("SIGINT received");
                    rt.begin_shutdown();
                    break;
                }
                _ = terminate.recv() => {
                    info!("SIGTERM received");
                    rt.begin_shutdown();
                    break;
                }
                _ = reload.recv() => {
                    info!("SIGUSR1 received; reloading keys and chains");
                    if let Err(err) = rt.reload().await {
                        warn!(error = %format!("{err:#}"), "reload failed");
                    }
                }
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn(rt: Arc<Runtime>) -> Result<JoinHandle<()>> {
    let cancel = rt.shutdown_token();
    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!(error = %err, "failed to listen for shutdown signal");
                }
                info!("shutdown signal received");
                rt.begin_shutdown();
            }
        }
    }))
}
