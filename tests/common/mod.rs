use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Duration;

use iroh_chord::{ChordConfig, ChordNetwork, NodeId, NodeInfo, Operation, OverlayNode};

/// In-memory transport: operations are executed directly against the
/// registered target node, each on a fresh task so that forwarding chains
/// behave like real message passing instead of recursion.
#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    failures: Arc<Mutex<HashSet<NodeId>>>,
    sent: Arc<Mutex<Vec<(NodeId, &'static str)>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>) -> Self {
        Self {
            registry,
            failures: Arc::new(Mutex::new(HashSet::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn set_failure(&self, node: NodeId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(node);
        } else {
            failures.remove(&node);
        }
    }

    /// Operations this node handed to the wire, as (destination, kind) pairs.
    pub async fn sent_operations(&self) -> Vec<(NodeId, &'static str)> {
        let sent = self.sent.lock().await;
        sent.clone()
    }

    pub async fn sent_count(&self, kind: &str) -> usize {
        let sent = self.sent.lock().await;
        sent.iter().filter(|(_, k)| *k == kind).count()
    }

    async fn should_fail(&self, node: &NodeId) -> bool {
        let failures = self.failures.lock().await;
        failures.contains(node)
    }
}

/// Shared address book of every live test node.
#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<NodeId, OverlayNode<TestNetwork>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, node: &OverlayNode<TestNetwork>) {
        let mut peers = self.peers.write().await;
        peers.insert(node.info().id, node.clone());
    }

    /// Take a node off the network; sends to it fail from then on.
    pub async fn unregister(&self, id: NodeId) {
        let mut peers = self.peers.write().await;
        peers.remove(&id);
    }

    pub async fn get(&self, id: &NodeId) -> Option<OverlayNode<TestNetwork>> {
        let peers = self.peers.read().await;
        peers.get(id).cloned()
    }
}

#[async_trait::async_trait]
impl ChordNetwork for TestNetwork {
    async fn send(&self, to: &NodeInfo, operation: Operation) -> Result<()> {
        if self.should_fail(&to.id).await {
            return Err(anyhow!("injected network failure"));
        }
        let Some(peer) = self.registry.get(&to.id).await else {
            return Err(anyhow!("peer not reachable"));
        };
        {
            let mut sent = self.sent.lock().await;
            sent.push((to.id, operation.kind()));
        }
        tokio::spawn(async move { peer.execute(operation).await });
        Ok(())
    }
}

pub struct TestNode {
    pub node: OverlayNode<TestNetwork>,
    pub network: TestNetwork,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, id: NodeId) -> Self {
        let info = make_info(id);
        let network = TestNetwork::new(registry.clone());
        let node = OverlayNode::new(info, network.clone(), test_config());
        registry.register(&node).await;
        Self { node, network }
    }

    pub fn info(&self) -> NodeInfo {
        self.node.info()
    }
}

pub fn make_info(id: NodeId) -> NodeInfo {
    NodeInfo {
        id,
        addr: format!("node-{id}"),
    }
}

/// Reference parameters with timers shrunk so churn scenarios settle inside
/// a test's budget.
pub fn test_config() -> ChordConfig {
    ChordConfig {
        lookup_timeout: Duration::from_millis(100),
        stabilization_period: Duration::from_millis(50),
        ..ChordConfig::default()
    }
}

/// Let spawned operation handlers drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
