//! node-medic
//!
//! Watches Kubernetes node readiness and escalates through Hetzner Cloud
//! power actions for nodes that stay unhealthy: one soft reboot per
//! unhealthy episode, then hard resets spaced by a cool-down, with the
//! remediation state tracked in a node annotation. Recovery clears the
//! state so a node can go through the cycle again later.

mod config;
mod hcloud;
mod k8s;
mod remediate;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use hcloud::HcloudClient;
use k8s::KubeNodes;
use remediate::{check_nodes, Remediator};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_tracing(&config)?;

    info!("Starting node-medic {}", env!("CARGO_PKG_VERSION"));

    let kube_client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let nodes = KubeNodes::new(kube_client);

    let hcloud =
        HcloudClient::new(config.token.clone()).context("Failed to create hcloud client")?;
    hcloud
        .verify_access()
        .await
        .context("Hetzner Cloud API access check failed")?;

    let period = Duration::from_secs(config.period_seconds);
    let remediator = Remediator::new(config.remediation(), nodes.clone(), hcloud);

    info!(
        period_seconds = config.period_seconds,
        grace_minutes = config.grace_minutes,
        cooldown_minutes = config.cooldown_minutes,
        "Entering node check loop"
    );

    loop {
        check_nodes(&nodes, &remediator)
            .await
            .context("node check failed")?;

        tokio::time::sleep(period).await;
    }
}

/// JSON logs by default, matching how the controller runs in-cluster; the
/// pretty format is for running it by hand.
fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log level")?;

    if config.log_pretty {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    }

    Ok(())
}
