use anyhow::{Context, Result};
use futures::future;
use iroh::protocol::Router;
use iroh::{Endpoint, NodeAddr, RelayMode, Watcher};
use tracing_subscriber::{fmt, EnvFilter};

use iroh_chord::{
    ChordConfig, ChordProtocolHandler, IrohDispatcher, NodeInfo, OverlayNode, CHORD_ALPN,
};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let endpoint = Endpoint::builder()
        // Any peer selecting `CHORD_ALPN` is routed to `ChordProtocolHandler`
        // below.
        .alpns(vec![CHORD_ALPN.to_vec()])
        .relay_mode(RelayMode::Default)
        .bind()
        .await?;

    let endpoint_addr: NodeAddr = endpoint.node_addr().initialized().await;
    let addr_json = serde_json::to_string(&endpoint_addr)?;
    let info = NodeInfo::new(addr_json.clone());

    println!("Chord node started");
    println!("  Ring id: {}", info.id);
    println!("  Endpoint addr JSON: {addr_json}");

    let network = IrohDispatcher {
        endpoint: endpoint.clone(),
    };
    let node = OverlayNode::new(info, network, ChordConfig::default());

    let _router = Router::builder(endpoint.clone())
        .accept(CHORD_ALPN, ChordProtocolHandler::new(node.clone()))
        .spawn();

    // A seed address JSON on the command line means "join that ring"; both
    // sides derive the seed's ring id from the same serialized address.
    if let Some(seed_json) = std::env::args().nth(1) {
        let seed = NodeInfo::new(seed_json);
        node.bootstrap(&seed)
            .await
            .context("could not join the ring via the seed node")?;
        println!("  Joined ring via node {}", seed.id);
    }

    node.start_stabilization();

    if let Some(mut deliveries) = node.deliveries().await {
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                println!(
                    "Payload from node {}: {} bytes",
                    delivery.from.id,
                    delivery.payload.len()
                );
            }
        });
    }

    // The node now serves lookups and stabilizes in the background; a real
    // deployment would expose put/get on top of `route` + `send`.
    future::pending::<()>().await;
    Ok(())
}
