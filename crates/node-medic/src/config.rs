//! Process configuration.
//!
//! Parsed once at startup and passed by value into the components that need
//! it; there is no global configuration lookup anywhere else.

use clap::Parser;

use crate::remediate::RemediationConfig;

/// Node auto-remediation controller for Hetzner Cloud backed clusters.
#[derive(Parser, Debug)]
#[command(name = "node-medic")]
#[command(about = "Reboots unhealthy Kubernetes nodes through the Hetzner Cloud API")]
#[command(version)]
pub struct Config {
    /// Hetzner Cloud API token
    #[arg(long, env = "HCLOUD_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Seconds to sleep between node checks
    #[arg(long, default_value = "120")]
    pub period_seconds: u64,

    /// Minimum node age in minutes before remediation is considered
    #[arg(long, default_value = "60")]
    pub grace_minutes: i64,

    /// Minimum minutes between a soft reboot and the follow-up hard reset
    #[arg(long, default_value = "10")]
    pub cooldown_minutes: i64,

    /// Keep the original reboot timestamp while the cool-down is running
    /// instead of refreshing it every cycle
    #[arg(long)]
    pub preserve_cooldown_stamp: bool,

    /// Log filter directive, overridden by RUST_LOG when set
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Human-readable log output instead of JSON
    #[arg(long)]
    pub log_pretty: bool,
}

impl Config {
    /// Policy-level view of the configuration.
    #[must_use]
    pub fn remediation(&self) -> RemediationConfig {
        RemediationConfig {
            grace_minutes: self.grace_minutes,
            cooldown_minutes: self.cooldown_minutes,
            refresh_cooldown_stamp: !self.preserve_cooldown_stamp,
            ..Default::default()
        }
    }
}
