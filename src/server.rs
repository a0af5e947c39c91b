//! Inbound half of the dispatcher.
//!
//! [`ChordProtocolHandler`] plugs into iroh's router under [`CHORD_ALPN`]:
//! every unidirectional stream on an accepted connection carries one framed
//! [`Operation`], which a bounded worker set executes against the local node.
//!
//! # Usage
//!
//! ```ignore
//! let handler = ChordProtocolHandler::new(node.clone());
//! let router = Router::builder(endpoint.clone())
//!     .accept(CHORD_ALPN, handler)
//!     .spawn();
//! ```
//!
//! [`CHORD_ALPN`]: crate::net::CHORD_ALPN

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::core::{ChordNetwork, OverlayNode};
use crate::framing::read_operation;

/// Width of the worker set executing inbound operations.
pub const INBOUND_WORKERS: usize = 10;

/// Protocol handler for incoming ring connections.
///
/// Operations are executed on at most [`INBOUND_WORKERS`] concurrent tasks;
/// further streams wait for a free worker, which backpressures the peer.
pub struct ChordProtocolHandler<N: ChordNetwork> {
    node: OverlayNode<N>,
    workers: Arc<Semaphore>,
}

impl<N: ChordNetwork> ChordProtocolHandler<N> {
    /// Create a handler executing operations against the given node.
    pub fn new(node: OverlayNode<N>) -> Self {
        Self {
            node,
            workers: Arc::new(Semaphore::new(INBOUND_WORKERS)),
        }
    }

    /// Drain one accepted connection: one framed operation per stream.
    async fn serve(self, connection: Connection) -> Result<()> {
        loop {
            let mut stream = match connection.accept_uni().await {
                Ok(stream) => stream,
                // The peer closed the connection; nothing more to read.
                Err(_) => return Ok(()),
            };
            let Some(operation) = read_operation(&mut stream).await? else {
                continue;
            };
            debug!(
                kind = operation.kind(),
                origin = operation.origin().id,
                "inbound operation"
            );

            let permit = self.workers.clone().acquire_owned().await?;
            let node = self.node.clone();
            tokio::spawn(async move {
                node.execute(operation).await;
                drop(permit);
            });
        }
    }
}

impl<N: ChordNetwork> Clone for ChordProtocolHandler<N> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            workers: self.workers.clone(),
        }
    }
}

impl<N: ChordNetwork> fmt::Debug for ChordProtocolHandler<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChordProtocolHandler")
            .field("node", &self.node.info().id)
            .finish()
    }
}

impl<N: ChordNetwork> ProtocolHandler for ChordProtocolHandler<N> {
    /// Accept an incoming connection and serve its operation streams.
    fn accept(
        &self,
        connection: Connection,
    ) -> impl std::future::Future<Output = std::result::Result<(), AcceptError>> + Send {
        let handler = self.clone();
        async move {
            handler
                .serve(connection)
                .await
                .map_err(|err| AcceptError::from_err(std::io::Error::other(err)))
        }
    }
}
