//! Host-application exit triggers

use super::supervisor::RuntimeSupervisor;
use crate::download::DownloadCoordinator;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal;
use tokio::sync::OnceCell;

/// Ways the host application can end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    AboutToQuit,
    /// Only triggers shutdown while this session holds a live runtime
    AllWindowsClosed,
    Interrupt,
    Terminate,
}

/// Routes every exit path to a single runtime shutdown.
///
/// Concurrent triggers all wait for the one shutdown in progress, so the host
/// never exits before the runtime is gone.
pub struct ShutdownHook {
    supervisor: Arc<RuntimeSupervisor>,
    downloads: Option<DownloadCoordinator>,
    spawned_only: bool,
    done: OnceCell<HostEvent>,
}

impl ShutdownHook {
    pub fn new(supervisor: Arc<RuntimeSupervisor>) -> Self {
        Self {
            supervisor,
            downloads: None,
            spawned_only: false,
            done: OnceCell::new(),
        }
    }

    /// Cancel in-flight downloads before the runtime goes away
    pub fn with_downloads(mut self, coordinator: DownloadCoordinator) -> Self {
        self.downloads = Some(coordinator);
        self
    }

    /// Leave a runtime this session did not spawn running
    pub fn spawned_runtime_only(mut self) -> Self {
        self.spawned_only = true;
        self
    }

    /// Drive `work` until it returns or `exit` resolves, then shut down.
    ///
    /// The shutdown runs on every outcome, including errors from `work`.
    /// Returns `None` when `exit` fired first; `work` is dropped at that
    /// point.
    pub async fn run_until_exit<T, W, X>(&self, work: W, exit: X) -> Option<T>
    where
        W: Future<Output = T>,
        X: Future<Output = HostEvent>,
    {
        let (event, output) = tokio::select! {
            output = work => (HostEvent::AboutToQuit, Some(output)),
            event = exit => (event, None),
        };

        self.handle(event).await;
        output
    }

    /// Returns `true` if this call performed the shutdown
    pub async fn handle(&self, event: HostEvent) -> bool {
        if event == HostEvent::AllWindowsClosed && !self.supervisor.holds_live_process().await {
            tracing::debug!("Windows closed without a live runtime, ignoring");
            return false;
        }

        let performed = AtomicBool::new(false);
        let first = self
            .done
            .get_or_init(|| async {
                if let Some(downloads) = &self.downloads {
                    downloads.cancel_all().await;
                }

                if self.spawned_only && !self.supervisor.has_spawned().await {
                    tracing::debug!(event = ?event, "Runtime not spawned by this session, leaving it running");
                } else {
                    tracing::info!(event = ?event, "Host exiting, shutting down runtime");
                    self.supervisor.shutdown().await;
                }
                performed.store(true, Ordering::SeqCst);
                event
            })
            .await;

        if !performed.load(Ordering::SeqCst) {
            tracing::debug!(event = ?event, first = ?first, "Runtime shutdown already handled");
        }
        performed.load(Ordering::SeqCst)
    }

    pub fn has_fired(&self) -> bool {
        self.done.initialized()
    }
}

/// Wait for SIGINT or SIGTERM
pub async fn wait_for_signal() -> HostEvent {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
            HostEvent::Interrupt
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
            HostEvent::Terminate
        },
    }
}
