//! Controller — translates "make X the primary" into policy-layer writes.
//!
//! The controller is the only component that touches the external routing
//! policy. Every change is idempotent, verified by readback, and rolled
//! back to the pre-change snapshot when the readback disagrees. When the
//! preferred (mwan3-like) layer is absent or refuses, the same procedure
//! runs against the base-routing fallback layer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};

use uplinkd_common::config::Config;
use uplinkd_common::envelope::ErrorKind;
use uplinkd_common::models::{
    DecisionEvent, DecisionTrigger, Member, PolicyEntry, PolicyOrdering,
};

use crate::clock::Clock;
use crate::store::TelemetryStore;

#[derive(Debug, Error)]
pub enum PolicyError {
    /// The layer is absent or cannot be talked to right now.
    #[error("policy layer unavailable: {0}")]
    Unavailable(String),
    /// The layer answered but refused the requested ordering.
    #[error("policy layer rejected change: {0}")]
    Rejected(String),
}

/// The external multi-WAN mechanism the controller drives.
#[async_trait]
pub trait PolicyLayer: Send + Sync + 'static {
    /// Short name for logs ("mwan3", "route-metric", ...).
    fn name(&self) -> &str;

    async fn read_state(&self) -> Result<PolicyOrdering, PolicyError>;

    async fn set_ordering(&self, ordering: &PolicyOrdering) -> Result<(), PolicyError>;

    fn supports_transaction(&self) -> bool;

    /// Commit a pending change. Only called when
    /// [`supports_transaction`](Self::supports_transaction) is true.
    async fn commit(&self) -> Result<(), PolicyError>;
}

/// Result of a `set_primary` call.
#[derive(Debug, Clone)]
pub struct SetPrimaryOutcome {
    pub applied: bool,
    /// The target was already primary; nothing was written.
    pub noop: bool,
    pub rollback: bool,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl SetPrimaryOutcome {
    fn applied() -> Self {
        SetPrimaryOutcome {
            applied: true,
            noop: false,
            rollback: false,
            error: None,
            error_kind: None,
        }
    }

    fn noop() -> Self {
        SetPrimaryOutcome {
            applied: false,
            noop: true,
            rollback: false,
            error: None,
            error_kind: None,
        }
    }

    fn failed(kind: ErrorKind, error: impl Into<String>, rollback: bool) -> Self {
        SetPrimaryOutcome {
            applied: false,
            noop: false,
            rollback,
            error: Some(error.into()),
            error_kind: Some(kind),
        }
    }

    pub fn is_mismatch(&self) -> bool {
        self.error_kind == Some(ErrorKind::PolicyMismatch)
    }

    pub fn is_busy(&self) -> bool {
        self.error_kind == Some(ErrorKind::Busy)
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub verify_delay: Duration,
    pub verify_timeout: Duration,
    pub policy_timeout: Duration,
    /// Skip mutation and report verification success. Test seam.
    pub dry_run: bool,
}

impl ControllerConfig {
    pub fn from_config(config: &Config) -> Self {
        ControllerConfig {
            verify_delay: config.verify_delay(),
            verify_timeout: config.verify_timeout(),
            policy_timeout: config.policy_timeout(),
            dry_run: false,
        }
    }
}

/// Metric assigned to the primary; the rest follow at `METRIC_STEP`
/// increments in configured-weight order.
const PRIMARY_METRIC: u32 = 10;
const METRIC_STEP: u32 = 10;

pub struct Controller {
    members: Vec<Member>,
    /// The mwan3-like layer, when `use_policy_layer` is set.
    preferred: Option<Arc<dyn PolicyLayer>>,
    /// Base routing stack. Always present.
    fallback: Arc<dyn PolicyLayer>,
    clock: Arc<dyn Clock>,
    store: Arc<TelemetryStore>,
    cfg: ControllerConfig,
    /// Serializes `set_primary`; overlapping callers get `busy`.
    gate: tokio::sync::Mutex<()>,
    /// Last verified primary.
    current: Mutex<Option<String>>,
}

impl Controller {
    pub fn new(
        members: Vec<Member>,
        preferred: Option<Arc<dyn PolicyLayer>>,
        fallback: Arc<dyn PolicyLayer>,
        clock: Arc<dyn Clock>,
        store: Arc<TelemetryStore>,
        cfg: ControllerConfig,
    ) -> Self {
        Controller {
            members,
            preferred,
            fallback,
            clock,
            store,
            cfg,
            gate: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
        }
    }

    /// The member the policy layer was last observed to prefer.
    pub fn current_primary(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-read the policy layer and refresh the cached primary. Called at
    /// startup so restarts converge on the existing routing state.
    pub async fn refresh_current(&self) {
        for layer in self.layers() {
            match timeout(self.cfg.policy_timeout, layer.read_state()).await {
                Ok(Ok(state)) => {
                    let primary = state.primary().map(|s| s.to_string());
                    *self.current.lock().unwrap_or_else(|e| e.into_inner()) = primary;
                    return;
                }
                Ok(Err(e)) => {
                    tracing::debug!(layer = layer.name(), error = %e, "policy state unavailable");
                }
                Err(_) => {
                    tracing::debug!(layer = layer.name(), "policy state read timed out");
                }
            }
        }
    }

    /// Make `target` the preferred member. Idempotent and serialized;
    /// an overlapping call returns `busy` without touching the policy.
    ///
    /// The decision event is appended only after the outcome is settled,
    /// so a reader can never observe `applied=true` before the policy
    /// layer reflects the change.
    pub async fn set_primary(
        &self,
        target: &str,
        trigger: DecisionTrigger,
        per_member_scores: BTreeMap<String, f64>,
    ) -> SetPrimaryOutcome {
        let Ok(_gate) = self.gate.try_lock() else {
            return SetPrimaryOutcome::failed(ErrorKind::Busy, "setPrimary already in progress", false);
        };

        let prev = self.current_primary();
        let mut last_error = String::from("no policy layer available");

        for layer in self.layers() {
            let snapshot = match timeout(self.cfg.policy_timeout, layer.read_state()).await {
                Ok(Ok(state)) => state,
                Ok(Err(e)) => {
                    tracing::warn!(layer = layer.name(), error = %e, "policy read failed");
                    last_error = e.to_string();
                    continue;
                }
                Err(_) => {
                    tracing::warn!(layer = layer.name(), "policy read timed out");
                    last_error = format!("{} read timed out", layer.name());
                    continue;
                }
            };

            if snapshot.primary() == Some(target) {
                *self.current.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(target.to_string());
                let outcome = SetPrimaryOutcome::noop();
                // Manual actions are audited even when they change nothing.
                if trigger == DecisionTrigger::Manual {
                    self.record_event(prev, Some(target.to_string()), trigger, &per_member_scores, &outcome);
                }
                return outcome;
            }

            let desired = self.build_ordering(target);

            if self.cfg.dry_run {
                tracing::info!(target, layer = layer.name(), "dry run: skipping policy mutation");
                *self.current.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(target.to_string());
                let outcome = SetPrimaryOutcome::applied();
                self.record_event(prev, Some(target.to_string()), trigger, &per_member_scores, &outcome);
                return outcome;
            }

            // Mutation begins; from here this call completes with either
            // an applied or a rolled-back state.
            if let Err(e) = self.mutate(layer.as_ref(), &desired).await {
                tracing::warn!(layer = layer.name(), error = %e, "policy mutation failed");
                last_error = e;
                continue;
            }

            if self.verify(layer.as_ref(), target).await {
                *self.current.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(target.to_string());
                tracing::info!(target, layer = layer.name(), %trigger, "primary applied");
                let outcome = SetPrimaryOutcome::applied();
                self.record_event(prev, Some(target.to_string()), trigger, &per_member_scores, &outcome);
                return outcome;
            }

            // Readback never agreed: restore the pre-change snapshot.
            tracing::warn!(target, layer = layer.name(), "verify failed, rolling back");
            if let Err(e) = self.mutate(layer.as_ref(), &snapshot).await {
                tracing::error!(layer = layer.name(), error = %e, "rollback write failed");
            }
            let outcome = SetPrimaryOutcome::failed(
                ErrorKind::PolicyMismatch,
                "policy_mismatch: readback did not reflect the requested ordering",
                true,
            );
            self.record_event(prev, Some(target.to_string()), trigger, &per_member_scores, &outcome);
            return outcome;
        }

        let outcome =
            SetPrimaryOutcome::failed(ErrorKind::PolicyUnavailable, last_error, false);
        self.record_event(prev, Some(target.to_string()), trigger, &per_member_scores, &outcome);
        outcome
    }

    // ── Internal ────────────────────────────────────────────────

    fn layers(&self) -> Vec<Arc<dyn PolicyLayer>> {
        let mut layers = Vec::with_capacity(2);
        if let Some(preferred) = &self.preferred {
            layers.push(preferred.clone());
        }
        layers.push(self.fallback.clone());
        layers
    }

    /// Target gets the lowest metric; everyone else follows in
    /// configured-weight order.
    fn build_ordering(&self, target: &str) -> PolicyOrdering {
        let mut rest: Vec<&Member> = self.members.iter().filter(|m| m.name != target).collect();
        rest.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name)));

        let mut entries = vec![PolicyEntry {
            member: target.to_string(),
            metric: PRIMARY_METRIC,
        }];
        for (i, member) in rest.iter().enumerate() {
            entries.push(PolicyEntry {
                member: member.name.clone(),
                metric: PRIMARY_METRIC + METRIC_STEP * (i as u32 + 1),
            });
        }
        PolicyOrdering { entries }
    }

    async fn mutate(&self, layer: &dyn PolicyLayer, ordering: &PolicyOrdering) -> Result<(), String> {
        match timeout(self.cfg.policy_timeout, layer.set_ordering(ordering)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("{} write timed out", layer.name())),
        }
        if layer.supports_transaction() {
            match timeout(self.cfg.policy_timeout, layer.commit()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e.to_string()),
                Err(_) => return Err(format!("{} commit timed out", layer.name())),
            }
        }
        Ok(())
    }

    /// Re-read until the layer reflects `target` as primary, or the
    /// verify window closes.
    async fn verify(&self, layer: &dyn PolicyLayer, target: &str) -> bool {
        let deadline = Instant::now() + self.cfg.verify_timeout;
        loop {
            sleep(self.cfg.verify_delay).await;
            if let Ok(Ok(state)) = timeout(self.cfg.policy_timeout, layer.read_state()).await {
                if state.primary() == Some(target) {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    fn record_event(
        &self,
        prev: Option<String>,
        new: Option<String>,
        trigger: DecisionTrigger,
        per_member_scores: &BTreeMap<String, f64>,
        outcome: &SetPrimaryOutcome,
    ) {
        let mut event = DecisionEvent::new(self.clock.now(), prev, new, trigger);
        event.per_member_scores = per_member_scores.clone();
        event.applied = outcome.applied;
        event.error = outcome.error.clone();
        event.rollback = outcome.rollback;
        self.store.append_event(event);
    }
}
