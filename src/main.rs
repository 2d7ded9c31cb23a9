use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use clap::Parser;
use distributed_processing::config::NodeConfig;
use distributed_processing::node::ProcessingNode;
use distributed_processing::node::handlers::{
    handle_get_cluster_nodes, handle_get_task_result, handle_get_task_status, handle_submit_task,
};
use distributed_processing::node::protocol::{
    ENDPOINT_CLUSTER_NODES, ENDPOINT_SUBMIT_TASK, ENDPOINT_TASK_RESULT, ENDPOINT_TASK_STATUS,
};
use distributed_processing::processing::engine::DigestProcessingCore;
use distributed_processing::pubsub::PubSub;
use distributed_processing::pubsub::service::GossipPubSub;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NodeConfig::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting node on {}", config.bind);
    if !config.seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", config.seeds);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Transport (UDP gossip):
    let transport = GossipPubSub::new(config.bind, config.seeds.clone()).await?;
    tracing::info!("Node ID: {}", transport.local_node_id());

    // 2. Processing runtime:
    let processing_config = config.processing_config();
    let node = ProcessingNode::new(
        transport.clone(),
        Arc::new(DigestProcessingCore::default()),
        processing_config,
    );

    // 3. HTTP Router:
    let app = Router::new()
        .route(ENDPOINT_SUBMIT_TASK, post(handle_submit_task))
        .route(ENDPOINT_TASK_STATUS, get(handle_get_task_status))
        .route(ENDPOINT_TASK_RESULT, get(handle_get_task_result))
        .route(ENDPOINT_CLUSTER_NODES, get(handle_get_cluster_nodes))
        .layer(Extension(node.clone()));

    // 4. Spawn transport and announcement listener:
    let service_clone = transport.clone();
    tokio::spawn(async move {
        service_clone.start().await;
    });
    node.start();

    // 5. Spawn stats reporter:
    let stats_service = transport.clone();
    let stats_node = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let alive = stats_service.get_alive_members();
            tracing::info!(
                "Cluster stats: {} alive peers, {} tasks",
                alive.len(),
                stats_node.task_ids().len()
            );
            for peer in alive {
                tracing::info!("  - {} gossip={} (inc={})", peer.id, peer.addr, peer.incarnation);
            }
        }
    });

    // 6. Start HTTP server:
    let http_addr = config.http_addr();

    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
