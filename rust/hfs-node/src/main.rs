//! hfs-node: run one scheduler tier (or a whole in-process tree).

use anyhow::Context;
use clap::Parser;
use hfs_domain::{DomainConfig, DomainScheduler};
use hfs_local::StaticAgentManager;
use hfs_node::{health_router, HealthState, InProcCluster, NodeConfig, NodeRole};
use hfs_types::Resources;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hfs-node", about = "Hierarchical function scheduler node")]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured role.
    #[arg(long, value_parser = ["global", "domain", "local"])]
    role: Option<String>,

    /// Run a whole global/domain/local tree in this process
    /// (single-node deployments and demos).
    #[arg(long)]
    all_in_one: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let mut config = NodeConfig::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Some(role) = &cli.role {
        config.role = match role.as_str() {
            "global" => NodeRole::Global,
            "domain" => NodeRole::Domain,
            _ => NodeRole::Local,
        };
    }

    let health = HealthState::new(config.role.to_string(), config.node_id.clone());
    let router = health_router(health.clone());
    let listener = tokio::net::TcpListener::bind(&config.health_listen)
        .await
        .with_context(|| format!("binding health endpoint on {}", config.health_listen))?;
    info!(listen = %config.health_listen, "health endpoint up");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    if cli.all_in_one {
        run_all_in_one(&config, health).await
    } else {
        run_single_tier(&config, health).await
    }
}

async fn run_all_in_one(config: &NodeConfig, health: HealthState) -> anyhow::Result<()> {
    let domain_config = domain_config(config, false);
    let mut cluster = InProcCluster::new(&["domain-1"], domain_config).await;
    let agents = [
        ("agent-1", Resources::cpu_mem(4000.0, 8192.0)),
        ("agent-2", Resources::cpu_mem(4000.0, 8192.0)),
    ];
    let agent_mgr = Arc::new(StaticAgentManager::new(
        agents.iter().map(|(id, cap)| (id.to_string(), cap.clone())).collect(),
    ));
    cluster
        .add_local(
            "domain-1",
            &config.node_id,
            &agents.iter().map(|(id, cap)| (*id, cap.clone())).collect::<Vec<_>>(),
            agent_mgr,
            hfs_local::LocalConfig::default(),
        )
        .await
        .with_context(|| format!("starting the local tier of {}", config.node_id))?;
    health.set_ready(true);
    info!("all-in-one scheduler tree ready");
    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn run_single_tier(config: &NodeConfig, health: HealthState) -> anyhow::Result<()> {
    match config.role {
        NodeRole::Global | NodeRole::Domain => {
            let is_root = config.role == NodeRole::Global;
            let _domain = DomainScheduler::new(domain_config(config, is_root));
            health.set_ready(true);
            info!(role = %config.role, node_id = %config.node_id, "tier ready");
            // A networked transport would now accept registrations;
            // the in-process build idles until terminated.
            tokio::signal::ctrl_c().await?;
        }
        NodeRole::Local => {
            anyhow::bail!(
                "a standalone local tier needs a transport to its domain; \
                 run with --all-in-one or deploy the networked build"
            );
        }
    }
    Ok(())
}

fn domain_config(config: &NodeConfig, is_root: bool) -> DomainConfig {
    DomainConfig {
        name: config.node_id.clone(),
        is_root,
        relaxed_affinity: config.relaxed_affinity,
        heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
        heartbeat_max_times: config.heartbeat_max_times,
        dispatch_timeout: Duration::from_millis(config.dispatch_timeout_ms),
        ..Default::default()
    }
}
