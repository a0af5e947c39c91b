//! # Iroh Chord
//!
//! This crate implements the core of a Chord overlay on top of the
//! [`iroh`](https://crates.io/crates/iroh) transport stack: per-node ring
//! membership (finger table plus a bounded successor list), a deduplicated
//! key-lookup engine, and the periodic stabilization protocol that keeps the
//! ring routable while nodes join, leave and crash. Layers that store actual
//! values build on two operations the core provides: route a key to the node
//! responsible for it, and deliver opaque bytes to a specific peer.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`core`]: the transport-agnostic Chord logic — ring arithmetic, the
//!   [`FingerTable`], the lookup engine and stabilizer inside [`ChordNode`],
//!   and the clonable [`OverlayNode`] facade.
//! - [`protocol`]: the JSON serialisable one-way operations exchanged
//!   between ring members.
//! - [`framing`]: length-prefixed operation frames over byte streams.
//! - [`net`]: an [`iroh`] based [`ChordNetwork`] implementation carrying
//!   operations over QUIC.
//! - [`server`]: the inbound dispatcher hosting the protocol on an endpoint.
//!
//! ## Getting started
//!
//! Bind an endpoint, wrap it in an [`IrohDispatcher`], build an
//! [`OverlayNode`] and let stabilization keep the ring healthy:
//!
//! ```no_run
//! use anyhow::Result;
//! use iroh::protocol::Router;
//! use iroh::{Endpoint, Watcher};
//! use iroh_chord::{
//!     ChordConfig, ChordProtocolHandler, IrohDispatcher, NodeInfo, OverlayNode, CHORD_ALPN,
//! };
//!
//! # async fn launch(seed: Option<NodeInfo>) -> Result<()> {
//! let endpoint = Endpoint::builder()
//!     .alpns(vec![CHORD_ALPN.to_vec()])
//!     .bind()
//!     .await?;
//! let endpoint_addr = endpoint.node_addr().initialized().await;
//! let info = NodeInfo::new(serde_json::to_string(&endpoint_addr)?);
//! let network = IrohDispatcher {
//!     endpoint: endpoint.clone(),
//! };
//! let node = OverlayNode::new(info, network, ChordConfig::default());
//!
//! let _router = Router::builder(endpoint)
//!     .accept(CHORD_ALPN, ChordProtocolHandler::new(node.clone()))
//!     .spawn();
//!
//! if let Some(seed) = seed {
//!     node.bootstrap(&seed).await?;
//! }
//! node.start_stabilization();
//! # let _ = node.route(17).await;
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wires these pieces into a standalone ring
//! node that joins an existing member given on the command line.

pub mod core;
pub mod framing;
pub mod net;
pub mod protocol;
pub mod server;

pub use self::core::{
    add_to_node_id, between, between_left_inclusive, between_right_inclusive, derive_node_id,
    key_for, position, ChordConfig, ChordNetwork, ChordNode, Delivery, FingerTable, Key,
    LookupError, NodeId, NodeInfo, OverlayNode, RingSnapshot, RING_BITS, RING_SIZE,
};
pub use net::{IrohDispatcher, CHORD_ALPN};
pub use protocol::Operation;
pub use server::ChordProtocolHandler;
