//! colmesh node server.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use colmesh_proto::RemotePlan;
use colmesh_server::{create_transport, inspect, Args, Node, Profile};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "colmesh_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        protocol_version = colmesh_proto::PROTOCOL_VERSION,
        "starting colmesh server"
    );

    let args = Args::parse();
    let plan_path = args.plan.clone();
    let config = args.into_config()?;

    tracing::info!(
        profile = ?config.profile,
        data_path = %config.data_path.display(),
        tcp_address = ?config.tcp_address,
        ipc_address = ?config.ipc_address,
        advertise = %config.advertise_address(),
        "configuration loaded"
    );

    if config.profile == Profile::Tool {
        for summary in inspect(&config)? {
            println!("{}\t{} rows\t{}", summary.shard, summary.rows, summary.columns.join(","));
        }
        return Ok(());
    }

    let node = Node::build(config)?;

    if let Some(path) = plan_path {
        let plan = RemotePlan::from_json(&std::fs::read_to_string(&path)?)?;
        let result = node.query(&plan).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    if node.config().profile == Profile::Test {
        tracing::info!("test profile has no network transport, exiting");
        return Ok(());
    }

    let transport = create_transport(node.config(), node.handler())?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            return;
        }
        tracing::info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(());
    });

    tracing::info!("server ready, accepting connections");
    match transport.run_until_shutdown(shutdown_rx).await {
        Ok(()) => {
            tracing::info!("server shutdown complete");
        }
        Err(e) => {
            tracing::error!(error = %e, "server error");
            return Err(e.into());
        }
    }

    Ok(())
}
