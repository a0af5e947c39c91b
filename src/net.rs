//! Outbound half of the dispatcher: a [`ChordNetwork`] over iroh QUIC.

use anyhow::{Context, Result};
use async_trait::async_trait;
use iroh::{Endpoint, NodeAddr};

use crate::core::{ChordNetwork, NodeInfo};
use crate::framing::write_operation;
use crate::protocol::Operation;

/// ALPN under which ring members talk to each other.
pub const CHORD_ALPN: &[u8] = b"iroh-chord/ring/1";

/// Sends operations to peers as single framed messages on unidirectional
/// streams. Each [`NodeInfo`] carries its JSON-serialized [`NodeAddr`].
pub struct IrohDispatcher {
    pub endpoint: Endpoint,
}

impl IrohDispatcher {
    fn parse_addr(&self, peer: &NodeInfo) -> Result<NodeAddr> {
        serde_json::from_str(&peer.addr).context("peer carries an unparseable endpoint address")
    }
}

#[async_trait]
impl ChordNetwork for IrohDispatcher {
    async fn send(&self, to: &NodeInfo, operation: Operation) -> Result<()> {
        let addr = self.parse_addr(to)?;
        let connection = self.endpoint.connect(addr, CHORD_ALPN).await?;
        let mut stream = connection.open_uni().await?;
        write_operation(&mut stream, &operation).await?;
        stream.finish()?;
        // Resolves once the peer read the frame to completion, so an
        // unreachable or closing peer surfaces as a send failure.
        stream.stopped().await?;
        Ok(())
    }
}
