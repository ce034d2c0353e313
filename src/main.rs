//! SAN Block CSI node driver
//!
//! Initializes the node service, inventories the node's initiators and
//! keeps the process alive for the CSI transport. The gRPC endpoint itself
//! is hosted by the deployment's CSI sidecar plumbing.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tonic::Request;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use sanblock_csi_driver::{
    ConfigYaml, NodeService, SyncLock, SysNodeUtils, SystemExecutor, SystemMounter,
    build_connectivity_map, csi, metrics,
};

/// CLI arguments for the CSI node driver
#[derive(Parser, Debug)]
#[command(name = "sanblock-csi-driver")]
#[command(about = "SAN Block CSI node driver")]
struct Args {
    /// CSI endpoint (unix socket path)
    #[arg(long, default_value = "unix:///var/run/csi/csi.sock")]
    endpoint: String,

    /// Path to the driver config YAML
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node name reported to the controller plane
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Address for the Prometheus metrics listener
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &args.config {
        Some(path) => ConfigYaml::load(path)?,
        None => ConfigYaml::default(),
    };

    let hostname = match args.node_id {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    info!(
        driver_name = %config.identity.name,
        driver_version = %config.identity.version,
        endpoint = %args.endpoint,
        hostname = %hostname,
        "Starting SAN Block CSI node driver"
    );

    let executor = Arc::new(SystemExecutor::new());
    let (connectivity_map, connectivity_helper) = build_connectivity_map(executor.clone());
    let node_service = NodeService::new(
        hostname,
        config,
        Arc::new(SyncLock::new()),
        Arc::new(SysNodeUtils::new(executor.clone())),
        Arc::new(SystemMounter::new(executor)),
        connectivity_map,
        connectivity_helper,
    );

    // Inventory the node's initiators up front so a misconfigured node
    // fails loudly at startup instead of at first stage.
    match node_service
        .node_get_info(Request::new(csi::NodeGetInfoRequest {}))
        .await
    {
        Ok(response) => {
            info!(node_id = %response.into_inner().node_id, "node identity inventoried");
        }
        Err(status) => {
            warn!(status = %status, "could not inventory node identity, continuing anyway");
        }
    }

    if let Some(addr) = args.metrics_addr {
        metrics::init_metrics(addr)?;
    }

    info!("node service ready");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    Ok(())
}
