//! Graceful shutdown handling for the metadata server.
//!
//! The coordinator fans a single stop signal out to every node task of a
//! local cluster; each task then drains its imports before exiting.

use crate::types::NodeId;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info};

/// Maximum time to wait for the cluster to drain before giving up.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shutdown coordinator shared by the node tasks.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    shutdown_watch: watch::Receiver<bool>,
    shutdown_watch_tx: Arc<watch::Sender<bool>>,
    is_shutting_down: Arc<AtomicBool>,
    drained: Arc<Mutex<BTreeSet<NodeId>>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (shutdown_watch_tx, shutdown_watch) = watch::channel(false);

        Self {
            shutdown_tx,
            shutdown_watch,
            shutdown_watch_tx: Arc::new(shutdown_watch_tx),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            drained: Arc::new(Mutex::new(BTreeSet::new())),
            timeout,
        }
    }

    /// Subscribe to the stop broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. Only the first call has any effect.
    pub fn shutdown(&self) {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating graceful shutdown");
            let _ = self.shutdown_watch_tx.send(true);
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Wait for the stop signal (for use in `select!`).
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_watch.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Record that `node` has no imports, exports or hash operations left.
    pub fn mark_drained(&self, node: NodeId) {
        if self.drained.lock().insert(node) {
            info!(node, "node drained");
        }
    }

    pub fn drained_nodes(&self) -> BTreeSet<NodeId> {
        self.drained.lock().clone()
    }

    /// Members of `nodes` that have not reported a drain yet.
    pub fn undrained(&self, nodes: &[NodeId]) -> Vec<NodeId> {
        let drained = self.drained.lock();
        nodes.iter().copied().filter(|n| !drained.contains(n)).collect()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `drain` to completion, bounded by the shutdown timeout.
    ///
    /// Returns `false` if the timeout fired first.
    pub async fn drain<F>(&self, drain: F) -> bool
    where
        F: std::future::Future<Output = ()>,
    {
        match tokio::time::timeout(self.timeout, drain).await {
            Ok(()) => {
                info!("Cluster drained");
                true
            }
            Err(_) => {
                error!("Drain timed out after {:?}", self.timeout);
                false
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// OS signal listener that triggers the coordinator.
pub struct SignalHandler {
    coordinator: ShutdownCoordinator,
}

impl SignalHandler {
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self { coordinator }
    }

    /// Returns once SIGTERM, SIGINT or SIGQUIT was received (or the
    /// handlers could not be installed).
    #[cfg(unix)]
    pub async fn run(self) {
        use tokio::signal::unix::{signal, SignalKind};

        let installed = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::quit()),
        );
        match installed {
            (Ok(mut sigterm), Ok(mut sigint), Ok(mut sigquit)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                    _ = sigquit.recv() => info!("Received SIGQUIT"),
                }
            }
            _ => error!("Failed to install signal handlers"),
        }

        self.coordinator.shutdown();
    }

    #[cfg(windows)]
    pub async fn run(self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        } else {
            info!("Received Ctrl+C");
        }
        self.coordinator.shutdown();
    }
}
