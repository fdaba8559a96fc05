//! Data models for the failover pipeline.
//!
//! These types flow between the collectors (which produce `Sample`s), the
//! scoring and decision engines (which produce `Score`s and
//! `DecisionEvent`s), the controller (which acts on a `PolicyOrdering`),
//! and the local HTTP surface (which serializes all of them).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Member ──────────────────────────────────────────────────────────

/// A configured uplink candidate the daemon can make primary.
///
/// Immutable while its collector runs; a config reload produces a new
/// `Member` value and restarts the collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Stable unique name (e.g. "starlink", "cell_a").
    pub name: String,
    pub class: MemberClass,
    pub detect: DetectMode,
    /// Relative preference weight, 1..=100. Higher wins ties.
    pub weight: u8,
    /// Continuous reachability required before the member may carry traffic.
    pub min_uptime_s: u64,
    /// Quiet period after a switch involving this member.
    pub cooldown_s: u64,
    /// When set, roaming does not count against this member in tie-breaks.
    pub prefer_roaming: bool,
    pub metered: bool,
    /// Underlying network device, when it differs from the member name.
    pub interface: Option<String>,
}

impl Member {
    /// The network device this member rides on.
    pub fn interface(&self) -> &str {
        self.interface.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberClass {
    Starlink,
    Cellular,
    Wifi,
    Lan,
    Other,
}

impl std::fmt::Display for MemberClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberClass::Starlink => write!(f, "starlink"),
            MemberClass::Cellular => write!(f, "cellular"),
            MemberClass::Wifi => write!(f, "wifi"),
            MemberClass::Lan => write!(f, "lan"),
            MemberClass::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for MemberClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starlink" => Ok(MemberClass::Starlink),
            "cellular" => Ok(MemberClass::Cellular),
            "wifi" => Ok(MemberClass::Wifi),
            "lan" => Ok(MemberClass::Lan),
            "other" => Ok(MemberClass::Other),
            other => Err(format!("unknown member class: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectMode {
    /// Member participates when its samples say it can.
    Auto,
    /// Member is always a candidate, even while unreachable.
    Force,
    /// Member is monitored for nothing and never promoted.
    Disable,
}

// ── Sample ──────────────────────────────────────────────────────────

/// One timestamped health observation for a member.
///
/// Either `reachable` is false (with an optional `cause`) or the
/// quantitative fields carry the probe's measurements. Collectors never
/// emit a partially-valid mix that could mis-score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub member: String,
    pub t: DateTime<Utc>,
    pub reachable: bool,
    /// Why the member was unreachable (e.g. "probe_timeout").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
    /// Starlink only: sky obstruction percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obstruction_pct: Option<f64>,
    /// Cellular / Wi-Fi signal strength.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_dbm: Option<i32>,
    /// Cellular network technology (GSM|3G|LTE|5G|unknown).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roaming: Option<bool>,
    /// Class-specific fields (see the per-class key constants below).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Well-known `Sample::extra` keys per member class.
pub mod extra_keys {
    // starlink
    pub const POP_PING_DROP_RATE: &str = "pop_ping_drop_rate";
    pub const SNR: &str = "snr";
    pub const UPTIME_S: &str = "uptime_s";
    pub const REBOOT_IMMINENT: &str = "reboot_imminent";
    pub const REBOOT_IN_S: &str = "reboot_in_s";
    pub const HARDWARE_SELF_TEST_PASSED: &str = "hardware_self_test_passed";
    pub const THERMAL_THROTTLE: &str = "thermal_throttle";
    pub const THERMAL_SHUTDOWN_RISK: &str = "thermal_shutdown_risk";
    // cellular
    pub const SIGNAL_QUALITY_CODE: &str = "signal_quality_code";
    pub const OPERATOR: &str = "operator";
    // wifi
    pub const RSSI_DBM: &str = "rssi_dbm";
    pub const LINK_RATE: &str = "link_rate";
    pub const SSID: &str = "ssid";
}

impl Sample {
    /// A synthetic unreachable observation.
    pub fn unreachable(member: impl Into<String>, t: DateTime<Utc>, cause: impl Into<String>) -> Self {
        Sample {
            member: member.into(),
            t,
            reachable: false,
            cause: Some(cause.into()),
            latency_ms: None,
            loss_pct: None,
            jitter_ms: None,
            obstruction_pct: None,
            signal_dbm: None,
            network_type: None,
            roaming: None,
            extra: BTreeMap::new(),
        }
    }

    /// A reachable observation with the common quantitative fields.
    pub fn reachable(
        member: impl Into<String>,
        t: DateTime<Utc>,
        latency_ms: f64,
        loss_pct: f64,
    ) -> Self {
        Sample {
            member: member.into(),
            t,
            reachable: true,
            cause: None,
            latency_ms: Some(latency_ms),
            loss_pct: Some(loss_pct),
            jitter_ms: None,
            obstruction_pct: None,
            signal_dbm: None,
            network_type: None,
            roaming: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn extra_f64(&self, key: &str) -> Option<f64> {
        self.extra.get(key).and_then(|v| v.as_f64())
    }

    pub fn extra_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(|v| v.as_bool())
    }
}

// ── Score ───────────────────────────────────────────────────────────

/// Health classification derived from a member's smoothed score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthClass {
    Healthy,
    Degraded,
    Failing,
    Down,
}

impl HealthClass {
    /// Ordering rank for tie-breaks: healthy > degraded > failing > down.
    pub fn rank(&self) -> u8 {
        match self {
            HealthClass::Healthy => 3,
            HealthClass::Degraded => 2,
            HealthClass::Failing => 1,
            HealthClass::Down => 0,
        }
    }
}

impl std::fmt::Display for HealthClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthClass::Healthy => write!(f, "healthy"),
            HealthClass::Degraded => write!(f, "degraded"),
            HealthClass::Failing => write!(f, "failing"),
            HealthClass::Down => write!(f, "down"),
        }
    }
}

/// One factor's share of an instantaneous score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReason {
    pub factor: String,
    /// Normalized contribution in [0, 1] (weight × normalized value / Σweight).
    pub contribution: f64,
}

/// Derived health of one member over its sample window.
///
/// Recomputed every decision tick, never stored across ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    /// Instantaneous score in [0, 100]. Higher is healthier.
    pub instant: f64,
    /// EWMA-smoothed score in [0, 100].
    pub smoothed: f64,
    pub class: HealthClass,
    /// Contributing factors, largest contribution first.
    pub reasons: Vec<ScoreReason>,
}

// ── DecisionEvent ───────────────────────────────────────────────────

/// What prompted a decision engine / controller action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionTrigger {
    Fail,
    Restore,
    Predictive,
    ConfigChange,
    Manual,
    Reschedule,
    Noop,
}

impl std::fmt::Display for DecisionTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionTrigger::Fail => write!(f, "fail"),
            DecisionTrigger::Restore => write!(f, "restore"),
            DecisionTrigger::Predictive => write!(f, "predictive"),
            DecisionTrigger::ConfigChange => write!(f, "config_change"),
            DecisionTrigger::Manual => write!(f, "manual"),
            DecisionTrigger::Reschedule => write!(f, "reschedule"),
            DecisionTrigger::Noop => write!(f, "noop"),
        }
    }
}

/// Audit record of an attempted (or skipped) primary change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEvent {
    /// UUIDv7, time-ordered.
    pub id: String,
    pub t: DateTime<Utc>,
    pub prev_primary: Option<String>,
    pub new_primary: Option<String>,
    pub trigger: DecisionTrigger,
    /// Smoothed score per member at decision time.
    pub per_member_scores: BTreeMap<String, f64>,
    /// True only after the policy layer was observed to reflect the change.
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub rollback: bool,
}

impl DecisionEvent {
    pub fn new(
        t: DateTime<Utc>,
        prev_primary: Option<String>,
        new_primary: Option<String>,
        trigger: DecisionTrigger,
    ) -> Self {
        DecisionEvent {
            id: Uuid::now_v7().to_string(),
            t,
            prev_primary,
            new_primary,
            trigger,
            per_member_scores: BTreeMap::new(),
            applied: false,
            error: None,
            rollback: false,
        }
    }
}

// ── Policy ordering ─────────────────────────────────────────────────

/// One member's slot in the routing policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub member: String,
    /// Route metric / mwan3 priority. Lower is preferred.
    pub metric: u32,
}

/// The complete per-member priority layout of the policy layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOrdering {
    pub entries: Vec<PolicyEntry>,
}

impl PolicyOrdering {
    /// The member the policy currently prefers (lowest metric).
    pub fn primary(&self) -> Option<&str> {
        self.entries
            .iter()
            .min_by_key(|e| e.metric)
            .map(|e| e.member.as_str())
    }

    pub fn metric_of(&self, member: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.member == member)
            .map(|e| e.metric)
    }
}

// ── Live status ─────────────────────────────────────────────────────

/// Per-member health snapshot published by the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberHealth {
    pub name: String,
    pub class: MemberClass,
    pub health: HealthClass,
    pub smoothed: f64,
    pub primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sample_t: Option<DateTime<Utc>>,
}
