//! Wire messages exchanged between ring members.
//!
//! Every message is a self-contained one-way [`Operation`] carrying its
//! `origin` and all state needed to resume at the destination; replies are
//! operations themselves. Messages are JSON-serialized and round-trip
//! exactly.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::{Key, NodeInfo};

/// One hop of a routed key lookup (the walk mutates `last_node`,
/// `time_to_live` and `reached_destination` as it progresses).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LookupRequest {
    pub origin: NodeInfo,
    pub key: Key,
    /// The hop this operation was forwarded by (the origin initially).
    pub last_node: NodeInfo,
    /// Remaining hop budget; the operation is dropped when it runs out.
    pub time_to_live: i32,
    /// Set once some hop decided the key belongs to its successor.
    pub reached_destination: bool,
}

/// Answer to a [`LookupRequest`], sent straight back to the origin.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LookupResult {
    pub origin: NodeInfo,
    pub responder: NodeInfo,
    pub key: Key,
}

/// Ask a peer for its current predecessor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestPredecessor {
    pub origin: NodeInfo,
}

/// Reply to [`RequestPredecessor`]; `None` when the slot was evicted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PredecessorResponse {
    pub origin: NodeInfo,
    pub predecessor: Option<NodeInfo>,
}

/// "I believe I am your predecessor."
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notify {
    pub origin: NodeInfo,
}

/// Opaque bytes from the layer above, shipped once routing resolved.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deliver {
    pub origin: NodeInfo,
    pub payload: Vec<u8>,
}

/// The inter-node protocol: every routing operation the dispatcher carries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Operation {
    Lookup(LookupRequest),
    LookupResult(LookupResult),
    RequestPredecessor(RequestPredecessor),
    PredecessorResponse(PredecessorResponse),
    Notify(Notify),
    Deliver(Deliver),
}

impl Operation {
    /// Serialize for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The node that originated this operation.
    pub fn origin(&self) -> &NodeInfo {
        match self {
            Operation::Lookup(op) => &op.origin,
            Operation::LookupResult(op) => &op.origin,
            Operation::RequestPredecessor(op) => &op.origin,
            Operation::PredecessorResponse(op) => &op.origin,
            Operation::Notify(op) => &op.origin,
            Operation::Deliver(op) => &op.origin,
        }
    }

    /// Short name for logging and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Lookup(_) => "lookup",
            Operation::LookupResult(_) => "lookup_result",
            Operation::RequestPredecessor(_) => "request_predecessor",
            Operation::PredecessorResponse(_) => "predecessor_response",
            Operation::Notify(_) => "notify",
            Operation::Deliver(_) => "deliver",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: u64) -> NodeInfo {
        NodeInfo {
            id,
            addr: format!("node-{id}"),
        }
    }

    #[test]
    fn lookup_round_trips_with_walk_state() {
        let operation = Operation::Lookup(LookupRequest {
            origin: info(3),
            key: 6,
            last_node: info(5),
            time_to_live: 17,
            reached_destination: true,
        });

        let decoded = Operation::decode(&operation.encode().unwrap()).unwrap();
        let Operation::Lookup(request) = decoded else {
            panic!("wrong variant after round trip");
        };
        assert_eq!(request.origin.id, 3);
        assert_eq!(request.last_node.id, 5);
        assert_eq!(request.time_to_live, 17);
        assert!(request.reached_destination);
    }

    #[test]
    fn predecessor_response_preserves_absent_slot() {
        let operation = Operation::PredecessorResponse(PredecessorResponse {
            origin: info(9),
            predecessor: None,
        });

        let decoded = Operation::decode(&operation.encode().unwrap()).unwrap();
        let Operation::PredecessorResponse(response) = decoded else {
            panic!("wrong variant after round trip");
        };
        assert!(response.predecessor.is_none());
        assert_eq!(operation.kind(), "predecessor_response");
        assert_eq!(operation.origin().id, 9);
    }
}
