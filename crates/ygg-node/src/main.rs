use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use ygg_client::Clerk;
use ygg_consensus::mem::{MemCluster, MemLog};
use ygg_ctrl::MemController;
use ygg_net::mem::MemNetwork;
use ygg_server::ShardServer;
use ygg_types::{GroupId, N_SHARDS};

#[derive(clap::Parser, Debug)]
#[command(name = "ygg-node", about = "Yggdrasil sharded KV demo cluster")]
struct Cli {
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Skip the smoke workload and just serve until interrupted.
    #[arg(long)]
    no_smoke: bool,
}

#[derive(Debug, Deserialize)]
struct ClusterConfig {
    groups: u64,
    replicas_per_group: usize,
}

#[derive(Debug, Deserialize)]
struct SnapshotConfig {
    /// Negative disables snapshotting.
    max_log_bytes: i64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct NodeConfig {
    cluster: ClusterConfig,
    snapshot: SnapshotConfig,
    observability: ObservabilityConfig,
}

type Server = ShardServer<MemLog, MemController, MemNetwork>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment =
        Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));
    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }
    let config: NodeConfig = figment
        .merge(Env::prefixed("YGG_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    anyhow::ensure!(config.cluster.groups >= 1, "need at least one group");
    anyhow::ensure!(config.cluster.replicas_per_group >= 1, "need at least one replica per group");

    let max_log_bytes = u64::try_from(config.snapshot.max_log_bytes).ok();
    let net = MemNetwork::new();
    let ctrl = MemController::new();

    // One in-process consensus cluster per group, leader at replica 0.
    let mut servers: Vec<Arc<Server>> = Vec::new();
    let mut membership: BTreeMap<GroupId, Vec<String>> = BTreeMap::new();
    for gid in 1..=config.cluster.groups {
        let cluster = MemCluster::new(config.cluster.replicas_per_group);
        let mut names = Vec::new();
        for me in 0..config.cluster.replicas_per_group {
            let (raft, apply_rx) = cluster.attach(me);
            let server = ShardServer::start(
                raft,
                apply_rx,
                ctrl.clone(),
                net.clone(),
                gid,
                me,
                max_log_bytes,
            );
            let name = format!("{gid}-{me}");
            server.serve(net.bind(&name));
            names.push(name);
            servers.push(server);
        }
        cluster.set_leader(0);
        membership.insert(gid, names);
    }

    // Assign shards round-robin across the groups.
    let mut shards = [0; N_SHARDS];
    for (shard, slot) in shards.iter_mut().enumerate() {
        *slot = (shard as u64 % config.cluster.groups) + 1;
    }
    let num = ctrl.publish(shards, membership);
    tracing::info!(
        groups = config.cluster.groups,
        replicas = config.cluster.replicas_per_group,
        config = num,
        "cluster up"
    );

    if !cli.no_smoke {
        let clerk = Clerk::new(ctrl.clone(), net.clone());
        clerk.put("demo", "1").await;
        clerk.append("demo", "2").await;
        let value = clerk.get("demo").await;
        tracing::info!(%value, "smoke workload done");
    }

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    for server in &servers {
        server.kill();
    }
    Ok(())
}
