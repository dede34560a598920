//! Node remediation policy engine.
//!
//! Decides, per node and per check cycle, whether to clear stale remediation
//! state, wait, soft-reboot, or hard-reset. The escalation state lives
//! entirely in a namespaced node annotation holding the RFC3339 timestamp of
//! the last remediation action, so the controller itself stays stateless
//! across cycles and restarts.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::hcloud::{parse_server_id, HcloudError, PowerControl, ProviderIdError};
use crate::k8s::{AnnotationStore, K8sError, NodeInfo, NodeInventory};

/// Annotation namespace reserved for this controller.
const ANNOTATION_PREFIX: &str = "node-medic";

/// Minimum node age before remediation is considered.
const DEFAULT_GRACE_MINUTES: i64 = 60;

/// Minimum minutes between a reboot and the follow-up reset.
const DEFAULT_COOLDOWN_MINUTES: i64 = 10;

/// Errors scoped to a single node's evaluation. The check cycle logs these
/// with node context and moves on to the next node.
#[derive(Debug, Error)]
pub enum RemediateError {
    #[error(transparent)]
    ProviderId(#[from] ProviderIdError),

    #[error("power action failed: {0}")]
    Power(#[from] HcloudError),

    #[error("annotation update failed: {0}")]
    Annotation(#[from] K8sError),

    #[error("invalid last-reboot timestamp {value:?}")]
    Timestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Outcome of evaluating one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Node reports Ready; any remediation annotations were cleared.
    Healthy,
    /// Node is unhealthy but still within the boot grace period.
    Grace,
    /// Soft reboot issued and the remediation timestamp stamped.
    SoftReboot,
    /// Hard reset issued after the cool-down elapsed.
    HardReset,
    /// Cool-down still running; no power action this cycle.
    CoolDown,
}

/// Policy thresholds and annotation naming.
#[derive(Debug, Clone)]
pub struct RemediationConfig {
    /// Minimum node age in minutes before any remediation.
    pub grace_minutes: i64,
    /// Minimum whole minutes since the last action before a hard reset.
    pub cooldown_minutes: i64,
    /// Annotation namespace owned by this controller.
    pub annotation_prefix: String,
    /// Refresh the last-reboot stamp on every cycle while the cool-down is
    /// running. This matches the historical behavior, but with a check period
    /// shorter than the cool-down it keeps pushing the reset out; disable to
    /// let the reset fire once real elapsed time crosses the threshold.
    pub refresh_cooldown_stamp: bool,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            grace_minutes: DEFAULT_GRACE_MINUTES,
            cooldown_minutes: DEFAULT_COOLDOWN_MINUTES,
            annotation_prefix: ANNOTATION_PREFIX.to_string(),
            refresh_cooldown_stamp: true,
        }
    }
}

impl RemediationConfig {
    /// Annotation key holding the last remediation timestamp.
    #[must_use]
    pub fn last_reboot_key(&self) -> String {
        format!("{}/last-reboot", self.annotation_prefix)
    }

    /// Prefix identifying every annotation owned by this controller.
    #[must_use]
    pub fn owned_key_prefix(&self) -> String {
        format!("{}/", self.annotation_prefix)
    }
}

/// The per-node remediation policy engine.
pub struct Remediator<S, P> {
    config: RemediationConfig,
    store: S,
    power: P,
}

impl<S, P> Remediator<S, P>
where
    S: AnnotationStore,
    P: PowerControl,
{
    #[must_use]
    pub fn new(config: RemediationConfig, store: S, power: P) -> Self {
        Self {
            config,
            store,
            power,
        }
    }

    /// Evaluate one node and carry out the next remediation step, if any.
    ///
    /// A failed power action returns before the stamp is written, so the next
    /// cycle retries the same step.
    pub async fn evaluate(&self, node: &NodeInfo) -> Result<Action, RemediateError> {
        debug!(node = %node.name, ready = node.ready, "evaluating node");

        if node.ready {
            self.clear_owned_annotations(node).await?;
            return Ok(Action::Healthy);
        }

        if let Some(created_at) = node.created_at {
            let age_minutes = (Utc::now() - created_at).num_minutes();
            if age_minutes < self.config.grace_minutes {
                debug!(
                    node = %node.name,
                    age_minutes,
                    grace_minutes = self.config.grace_minutes,
                    "node younger than grace period"
                );
                return Ok(Action::Grace);
            }
        }

        let provider_id = node
            .provider_id
            .as_deref()
            .ok_or(ProviderIdError::Missing)?;
        let server_id = parse_server_id(provider_id)?;

        match node.annotations.get(&self.config.last_reboot_key()) {
            None => {
                info!(node = %node.name, server = server_id, "issuing soft reboot");
                self.power.soft_reboot(server_id).await?;
                self.stamp(node).await?;
                Ok(Action::SoftReboot)
            }
            Some(raw) => {
                let last_reboot = parse_stamp(raw)?;
                let elapsed_minutes = (Utc::now() - last_reboot).num_minutes();

                if elapsed_minutes > self.config.cooldown_minutes {
                    info!(
                        node = %node.name,
                        server = server_id,
                        elapsed_minutes,
                        "issuing hard reset"
                    );
                    self.power.hard_reset(server_id).await?;
                    self.stamp(node).await?;
                    Ok(Action::HardReset)
                } else {
                    debug!(
                        node = %node.name,
                        elapsed_minutes,
                        cooldown_minutes = self.config.cooldown_minutes,
                        "cool-down still running"
                    );
                    if self.config.refresh_cooldown_stamp {
                        self.stamp(node).await?;
                    }
                    Ok(Action::CoolDown)
                }
            }
        }
    }

    /// Record the remediation action just taken.
    async fn stamp(&self, node: &NodeInfo) -> Result<(), RemediateError> {
        let now = Utc::now().to_rfc3339();
        self.store
            .set_annotation(&node.name, &self.config.last_reboot_key(), &now)
            .await?;
        Ok(())
    }

    /// Drop every annotation in our namespace. No-op when none are present.
    async fn clear_owned_annotations(&self, node: &NodeInfo) -> Result<(), RemediateError> {
        let prefix = self.config.owned_key_prefix();
        for key in node.annotations.keys() {
            if key.starts_with(&prefix) {
                debug!(node = %node.name, key = %key, "clearing remediation annotation");
                self.store.delete_annotation(&node.name, key).await?;
            }
        }
        Ok(())
    }
}

/// Parse the persisted RFC3339 remediation timestamp.
fn parse_stamp(raw: &str) -> Result<DateTime<Utc>, RemediateError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RemediateError::Timestamp {
            value: raw.to_string(),
            source: e,
        })
}

/// One full check cycle: list every node, evaluate each in turn.
///
/// A listing failure is fatal and propagates; per-node failures are logged
/// with node context and do not disturb the rest of the sweep.
pub async fn check_nodes<I, S, P>(
    inventory: &I,
    remediator: &Remediator<S, P>,
) -> Result<(), K8sError>
where
    I: NodeInventory,
    S: AnnotationStore,
    P: PowerControl,
{
    let nodes = inventory.list_nodes().await?;
    debug!(count = nodes.len(), "listed cluster nodes");

    let mut failed = 0usize;
    for node in &nodes {
        match remediator.evaluate(node).await {
            Ok(action) => debug!(node = %node.name, action = ?action, "node evaluated"),
            Err(e) => {
                failed += 1;
                error!(node = %node.name, error = %e, "node check failed");
            }
        }
    }

    info!(nodes = nodes.len(), failed, "node check complete");
    Ok(())
}
