//! In-process cluster: one tokio task per metadata server.
//!
//! Each task owns its [`MdsNode`] outright and feeds it from an unbounded
//! inbox plus a tick timer, so the node itself stays single-threaded. The
//! nodes share one [`MemoryStore`].

use crate::cluster::placement::HashPlacement;
use crate::cluster::transport::{AdminOp, ChannelTransport, Envelope, MemoryStore, ReplyRouter};
use crate::config::MdsConfig;
use crate::error::{MdsError, Result};
use crate::mds::messages::{ClientOp, ClientReply, ClientRequest, ReplyBody};
use crate::mds::MdsNode;
use crate::shutdown::ShutdownCoordinator;
use crate::types::{ClientId, NodeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a client waits for one reply.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts `ClusterHandle::call` makes on retryable failures.
const MAX_CLIENT_ATTEMPTS: u32 = 8;

/// A running in-process cluster.
pub struct LocalCluster {
    config: MdsConfig,
    tasks: Vec<(NodeId, JoinHandle<()>)>,
    inboxes: Arc<HashMap<NodeId, mpsc::UnboundedSender<Envelope>>>,
    replies: Arc<ReplyRouter>,
    store: Arc<MemoryStore>,
    shutdown: ShutdownCoordinator,
    halt: broadcast::Sender<()>,
    next_client: Arc<AtomicU64>,
}

impl LocalCluster {
    /// Build every node of `config.cluster.nodes` and spawn its task.
    pub fn start(config: &MdsConfig) -> Result<Self> {
        Self::start_with(config, ShutdownCoordinator::new())
    }

    pub fn start_with(config: &MdsConfig, shutdown: ShutdownCoordinator) -> Result<Self> {
        config.validate()?;
        let placement = Arc::new(HashPlacement::new(config.cluster.nodes.clone())?);
        let store = Arc::new(MemoryStore::new());
        let replies = Arc::new(ReplyRouter::new());

        let mut senders = HashMap::new();
        let mut receivers = Vec::new();
        for &id in &config.cluster.nodes {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(id, tx);
            receivers.push((id, rx));
        }
        let inboxes = Arc::new(senders);
        let (halt, _) = broadcast::channel(1);

        let mut nodes = Vec::new();
        for (id, rx) in receivers {
            let transport = Arc::new(ChannelTransport::new(id, inboxes.clone(), replies.clone()));
            let node = MdsNode::new(config.for_node(id), transport, store.clone(), placement.clone())?;
            nodes.push((node, rx));
        }

        let tick = config.protocol.tick_interval;
        let tasks = nodes
            .into_iter()
            .map(|(node, rx)| {
                let id = node.id();
                let task = NodeTask {
                    node,
                    inbox: rx,
                    tick,
                    stop: shutdown.subscribe(),
                    coordinator: shutdown.clone(),
                    halt: halt.subscribe(),
                };
                (id, tokio::spawn(task.run()))
            })
            .collect();

        info!(nodes = config.cluster.nodes.len(), "local cluster started");
        Ok(Self {
            config: config.clone(),
            tasks,
            inboxes,
            replies,
            store,
            shutdown,
            halt,
            next_client: Arc::new(AtomicU64::new(1)),
        })
    }

    /// A new client with its own client id.
    pub fn client(&self) -> ClusterHandle {
        ClusterHandle {
            client: self.next_client.fetch_add(1, Ordering::Relaxed),
            next_req: Arc::new(AtomicU64::new(1)),
            inboxes: self.inboxes.clone(),
            replies: self.replies.clone(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_pause: self.config.protocol.tick_interval
                * self.config.protocol.retry_delay_ticks.max(1) as u32,
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Drain every node: non-root nodes hand their imports back to the
    /// root and exit, then the root node is stopped. Returns `false` if the
    /// drain timed out.
    pub async fn shutdown(self) -> bool {
        self.shutdown.shutdown();
        let root = self.config.cluster.root_node;
        let (roots, others): (Vec<_>, Vec<_>) =
            self.tasks.into_iter().partition(|(id, _)| *id == root);

        let members: Vec<NodeId> = others.iter().map(|(id, _)| *id).collect();
        let drained = self
            .shutdown
            .drain(async {
                for (id, task) in others {
                    if let Err(e) = task.await {
                        warn!(node = id, error = %e, "node task failed");
                    }
                }
            })
            .await;
        if !drained {
            warn!(nodes = ?self.shutdown.undrained(&members), "nodes still holding imports");
        }

        let _ = self.halt.send(());
        for (id, task) in roots {
            if let Err(e) = task.await {
                warn!(node = id, error = %e, "node task failed");
            }
        }
        drained
    }
}

/// Client-side access to a local cluster.
#[derive(Clone)]
pub struct ClusterHandle {
    client: ClientId,
    next_req: Arc<AtomicU64>,
    inboxes: Arc<HashMap<NodeId, mpsc::UnboundedSender<Envelope>>>,
    replies: Arc<ReplyRouter>,
    timeout: Duration,
    retry_pause: Duration,
}

impl ClusterHandle {
    pub fn client_id(&self) -> ClientId {
        self.client
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Submit `op` to `node` once and wait for the reply.
    pub async fn request(&self, node: NodeId, op: ClientOp) -> Result<ClientReply> {
        let req = ClientRequest::new(self.client, self.next_req.fetch_add(1, Ordering::Relaxed), op);
        self.submit(node, req).await
    }

    /// Submit `op`, re-sending the same request while it fails with a
    /// retryable error, and following redirects.
    pub async fn call(&self, node: NodeId, op: ClientOp) -> Result<ReplyBody> {
        let req = ClientRequest::new(self.client, self.next_req.fetch_add(1, Ordering::Relaxed), op);
        let mut target = node;
        let mut last = MdsError::Timeout(format!("{} never answered", req.id()));
        for attempt in 1..=MAX_CLIENT_ATTEMPTS {
            let reply = match self.submit(target, req.clone()).await {
                Ok(reply) => reply,
                Err(e) if e.is_retryable() => {
                    last = e;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let err = match reply.result {
                Ok(body) => return Ok(body),
                Err(kind) => kind.into_error(format!("{} at mds{}", req.op.name(), reply.served_by)),
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if let Some(n) = err.redirect() {
                target = n;
            }
            debug!(id = %req.id(), attempt, error = %err, "retrying request");
            last = err;
            tokio::time::sleep(self.retry_pause).await;
        }
        Err(last)
    }

    /// Run an administrative operation on `node`.
    pub async fn admin(&self, node: NodeId, op: AdminOp) -> Result<()> {
        let inbox = self.inbox(node)?;
        let (done, rx) = oneshot::channel();
        inbox
            .send(Envelope::Admin { op, done })
            .map_err(|_| MdsError::Internal(format!("mds{} is not running", node)))?;
        rx.await
            .map_err(|_| MdsError::Internal(format!("mds{} dropped {:?}", node, op)))?
    }

    async fn submit(&self, node: NodeId, req: ClientRequest) -> Result<ClientReply> {
        let inbox = self.inbox(node)?;
        let id = req.id();
        let rx = self.replies.register(id);
        if inbox.send(Envelope::Client(req)).is_err() {
            self.replies.forget(&id);
            return Err(MdsError::Internal(format!("mds{} is not running", node)));
        }
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(MdsError::Internal(format!("reply channel for {} closed", id))),
            Err(_) => {
                self.replies.forget(&id);
                Err(MdsError::Timeout(format!("{} at mds{}", id, node)))
            }
        }
    }

    fn inbox(&self, node: NodeId) -> Result<&mpsc::UnboundedSender<Envelope>> {
        self.inboxes
            .get(&node)
            .ok_or_else(|| MdsError::InvalidOperation(format!("mds{} is not a member", node)))
    }
}

struct NodeTask {
    node: MdsNode,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    tick: Duration,
    stop: broadcast::Receiver<()>,
    coordinator: ShutdownCoordinator,
    halt: broadcast::Receiver<()>,
}

impl NodeTask {
    async fn run(mut self) {
        let id = self.node.id();
        let mut interval = tokio::time::interval(self.tick);
        let mut draining = false;
        debug!(node = id, "node task starting");

        loop {
            tokio::select! {
                env = self.inbox.recv() => match env {
                    Some(env) => self.handle(env),
                    None => break,
                },
                _ = interval.tick() => {
                    self.node.tick();
                    if draining && self.node.id() != self.node.root_node() && self.node.shutdown_step() {
                        self.coordinator.mark_drained(id);
                        break;
                    }
                }
                _ = self.stop.recv(), if !draining => {
                    draining = true;
                    self.node.shutdown_begin();
                }
                _ = self.halt.recv() => break,
            }
        }
        debug!(node = id, "node task stopped");
    }

    fn handle(&mut self, env: Envelope) {
        match env {
            Envelope::Peer { from, msg } => self.node.proc_message(from, msg),
            Envelope::Client(req) => self.node.submit(req),
            Envelope::Admin { op, done } => {
                let result = match op {
                    AdminOp::Export { dir, dest } => self.node.export_dir(dir, dest),
                    AdminOp::Hash { dir } => self.node.hash_dir(dir),
                    AdminOp::Unhash { dir } => self.node.unhash_dir(dir),
                };
                if let Err(e) = &result {
                    debug!(node = self.node.id(), ?op, error = %e, "admin operation refused");
                }
                let _ = done.send(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MdsConfig {
        let mut config = MdsConfig::development();
        config.protocol.tick_interval = Duration::from_millis(5);
        config
    }

    #[tokio::test]
    async fn test_mkdir_and_stat_across_nodes() {
        let cluster = LocalCluster::start(&test_config()).unwrap();
        let client = cluster.client();

        client
            .call(0, ClientOp::Mkdir { path: "/docs".to_string(), mode: 0o755 })
            .await
            .unwrap();

        // Node 2 discovers the entry from the root node.
        let body = client
            .call(2, ClientOp::Stat { path: "/docs".to_string() })
            .await
            .unwrap();
        match body {
            ReplyBody::Inode { attrs, .. } => assert!(attrs.is_dir()),
            other => panic!("unexpected reply {:?}", other),
        }

        assert!(cluster.shutdown().await);
    }

    #[tokio::test]
    async fn test_unknown_node_rejected() {
        let cluster = LocalCluster::start(&test_config()).unwrap();
        let client = cluster.client();

        let err = client
            .request(7, ClientOp::Lookup { path: "/".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, MdsError::InvalidOperation(_)));

        assert!(cluster.shutdown().await);
    }
}
