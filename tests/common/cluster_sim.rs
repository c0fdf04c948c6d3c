// Deterministic cluster simulation for integration tests
// Every node is driven from one thread; peer messages sit in a single FIFO
// queue, which keeps per-pair ordering and makes every run reproducible.

use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use strata_mds::cluster::{HashPlacement, MemoryStore, Transport};
use strata_mds::config::MdsConfig;
use strata_mds::error::ErrorKind;
use strata_mds::mds::{ClientOp, ClientReply, ClientRequest, MdsMessage, MdsNode, ReplyBody};
use strata_mds::mds::request::RequestId;
use strata_mds::types::{ClientId, InodeId, NodeId};

/// Client id used by `SimCluster::submit`.
pub const SIM_CLIENT: ClientId = 7;

/// Upper bound on deliveries per `run` call.
const MAX_DELIVERIES: usize = 200_000;

/// One peer message in flight or delivered.
#[derive(Debug, Clone)]
pub struct SimMessage {
    pub from: NodeId,
    pub to: NodeId,
    pub msg: MdsMessage,
}

impl SimMessage {
    pub fn kind(&self) -> &'static str {
        self.msg.kind()
    }
}

type Filter = Box<dyn Fn(&SimMessage) -> bool + Send>;

#[derive(Default)]
struct Network {
    queue: VecDeque<SimMessage>,
    held: Vec<SimMessage>,
    delivered: Vec<SimMessage>,
    dropped: Vec<SimMessage>,
    replies: Vec<ClientReply>,
    hold: Option<Filter>,
    drop: Option<Filter>,
}

/// Transport of one simulated node.
struct SimTransport {
    from: NodeId,
    net: Arc<Mutex<Network>>,
}

impl Transport for SimTransport {
    fn send(&self, to: NodeId, msg: MdsMessage) {
        self.net.lock().queue.push_back(SimMessage {
            from: self.from,
            to,
            msg,
        });
    }

    fn reply(&self, reply: ClientReply) {
        self.net.lock().replies.push(reply);
    }
}

/// A cluster of `MdsNode`s sharing one store, driven step by step.
pub struct SimCluster {
    pub nodes: BTreeMap<NodeId, MdsNode>,
    pub store: Arc<MemoryStore>,
    pub config: MdsConfig,
    net: Arc<Mutex<Network>>,
    next_req: u64,
}

impl SimCluster {
    /// `count` nodes numbered from 0, root on node 0.
    pub fn new(count: u64) -> Self {
        let mut config = MdsConfig::development();
        config.cluster.nodes = (0..count).collect();
        config.cluster.root_node = 0;
        Self::with_config(config)
    }

    pub fn with_config(config: MdsConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let placement = Arc::new(HashPlacement::new(config.cluster.nodes.clone()).unwrap());
        let net = Arc::new(Mutex::new(Network::default()));
        let mut nodes = BTreeMap::new();
        for &id in &config.cluster.nodes {
            let transport = Arc::new(SimTransport {
                from: id,
                net: net.clone(),
            });
            let node = MdsNode::new(config.for_node(id), transport, store.clone(), placement.clone())
                .unwrap();
            nodes.insert(id, node);
        }
        Self {
            nodes,
            store,
            config,
            net,
            next_req: 1,
        }
    }

    pub fn node(&self, id: NodeId) -> &MdsNode {
        &self.nodes[&id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut MdsNode {
        self.nodes.get_mut(&id).unwrap()
    }

    // =========================================================================
    // Clients
    // =========================================================================

    /// Hand `op` to `node` without delivering anything.
    pub fn submit(&mut self, node: NodeId, op: ClientOp) -> RequestId {
        let req = ClientRequest::new(SIM_CLIENT, self.next_req, op);
        self.next_req += 1;
        let id = req.id();
        self.node_mut(node).submit(req);
        id
    }

    /// Re-submit a request under an existing id.
    pub fn resubmit(&mut self, node: NodeId, id: RequestId, op: ClientOp) {
        let req = ClientRequest::new(id.client, id.req, op);
        self.node_mut(node).submit(req);
    }

    /// Latest reply for `id`, if one arrived.
    pub fn reply(&self, id: RequestId) -> Option<ClientReply> {
        self.net
            .lock()
            .replies
            .iter()
            .rev()
            .find(|r| r.id() == id)
            .cloned()
    }

    pub fn replies_for(&self, id: RequestId) -> usize {
        self.net.lock().replies.iter().filter(|r| r.id() == id).count()
    }

    /// Submit `op` and drive the cluster until it is answered.
    pub fn call(&mut self, node: NodeId, op: ClientOp) -> ClientReply {
        let id = self.submit(node, op);
        self.wait_reply(id)
    }

    /// Drive the cluster, ticking when the network is idle, until `id` has
    /// been answered.
    pub fn wait_reply(&mut self, id: RequestId) -> ClientReply {
        for _ in 0..500 {
            self.run();
            if let Some(reply) = self.reply(id) {
                return reply;
            }
            self.tick();
        }
        panic!("{} never answered", id);
    }

    /// `call` that expects success.
    pub fn ok(&mut self, node: NodeId, op: ClientOp) -> ReplyBody {
        let desc = format!("{:?} on mds{}", op, node);
        match self.call(node, op).result {
            Ok(body) => body,
            Err(kind) => panic!("{} failed: {:?}", desc, kind),
        }
    }

    /// `call` that expects failure.
    pub fn err(&mut self, node: NodeId, op: ClientOp) -> ErrorKind {
        let desc = format!("{:?} on mds{}", op, node);
        match self.call(node, op).result {
            Ok(body) => panic!("{} unexpectedly succeeded: {:?}", desc, body),
            Err(kind) => kind,
        }
    }

    /// Inode number behind `path`, as seen from `node`.
    pub fn ino(&mut self, node: NodeId, path: &str) -> InodeId {
        match self.ok(node, ClientOp::Lookup { path: path.to_string() }) {
            ReplyBody::Inode { ino, .. } => ino,
            other => panic!("lookup of {} returned {:?}", path, other),
        }
    }

    // =========================================================================
    // Network
    // =========================================================================

    /// Deliver one queued message. Returns `false` when the queue is empty.
    pub fn deliver_one(&mut self) -> bool {
        let next = {
            let mut net = self.net.lock();
            let Some(m) = net.queue.pop_front() else {
                return false;
            };
            if net.drop.as_ref().map(|f| f(&m)).unwrap_or(false) {
                net.dropped.push(m);
                None
            } else if net.hold.as_ref().map(|f| f(&m)).unwrap_or(false) {
                net.held.push(m);
                None
            } else {
                net.delivered.push(m.clone());
                Some(m)
            }
        };
        if let Some(m) = next {
            if let Some(node) = self.nodes.get_mut(&m.to) {
                node.proc_message(m.from, m.msg);
            }
        }
        true
    }

    /// Deliver until the network is idle.
    pub fn run(&mut self) {
        for _ in 0..MAX_DELIVERIES {
            if !self.deliver_one() {
                return;
            }
        }
        panic!("network did not go idle");
    }

    /// Advance every node's clock by one tick, then deliver.
    pub fn tick(&mut self) {
        for node in self.nodes.values_mut() {
            node.tick();
        }
        self.run();
    }

    pub fn ticks(&mut self, n: u64) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// Run and tick until every node is quiescent.
    pub fn settle(&mut self) {
        for _ in 0..500 {
            self.run();
            if self.nodes.values().all(|n| n.is_quiescent()) && self.net.lock().queue.is_empty() {
                return;
            }
            self.tick();
        }
        let busy: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| !n.is_quiescent())
            .map(|(id, _)| *id)
            .collect();
        panic!("cluster did not settle, busy nodes {:?}", busy);
    }

    /// Park matching messages instead of delivering them.
    pub fn hold_when(&mut self, f: impl Fn(&SimMessage) -> bool + Send + 'static) {
        self.net.lock().hold = Some(Box::new(f));
    }

    /// Discard matching messages.
    pub fn drop_when(&mut self, f: impl Fn(&SimMessage) -> bool + Send + 'static) {
        self.net.lock().drop = Some(Box::new(f));
    }

    /// Remove both filters and requeue held messages in arrival order.
    pub fn release_held(&mut self) {
        let mut net = self.net.lock();
        net.hold = None;
        net.drop = None;
        let held = std::mem::take(&mut net.held);
        net.queue.extend(held);
    }

    pub fn held(&self) -> Vec<SimMessage> {
        self.net.lock().held.clone()
    }

    pub fn dropped(&self) -> Vec<SimMessage> {
        self.net.lock().dropped.clone()
    }

    /// Every message delivered so far, in delivery order.
    pub fn delivered(&self) -> Vec<SimMessage> {
        self.net.lock().delivered.clone()
    }

    pub fn clear_log(&mut self) {
        self.net.lock().delivered.clear();
    }

    // =========================================================================
    // Administration
    // =========================================================================

    pub fn export(&mut self, node: NodeId, dir: InodeId, dest: NodeId) {
        self.node_mut(node).export_dir(dir, dest).unwrap();
        self.settle();
    }

    pub fn hash(&mut self, node: NodeId, dir: InodeId) {
        self.node_mut(node).hash_dir(dir).unwrap();
        self.settle();
    }

    pub fn unhash(&mut self, node: NodeId, dir: InodeId) {
        self.node_mut(node).unhash_dir(dir).unwrap();
        self.settle();
    }
}
