//! Daemon configuration.
//!
//! On the router this is populated from the platform key-value store and
//! validated there; the agent binary also accepts the same shape as a TOML
//! file for development. The core only ever sees a `Config` that passed
//! `validate()`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{DetectMode, Member, MemberClass};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ewma_alpha must be in (0, 1], got {0}")]
    InvalidAlpha(f64),
    #[error("switch_margin must be in [0, 100], got {0}")]
    InvalidSwitchMargin(f64),
    #[error("member {name}: weight must be in 1..=100, got {weight}")]
    InvalidWeight { name: String, weight: u8 },
    #[error("duplicate member name: {0}")]
    DuplicateMember(String),
    #[error("no members configured")]
    NoMembers,
    #[error("{interval} must be greater than zero")]
    ZeroInterval { interval: &'static str },
    #[error("scoring factor {factor}: ok and bad targets must differ")]
    DegenerateFactor { factor: &'static str },
    #[error("config file: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Scoring factors ─────────────────────────────────────────────────

/// Which sample(s) in the window feed a factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorSource {
    MostRecent,
    WindowMean,
}

/// One scoring factor: a weight plus the ok/bad target pair that
/// normalizes raw values. Direction is encoded by the pair (ok < bad for
/// "lower is better" factors).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FactorConfig {
    pub weight: f64,
    pub ok: f64,
    pub bad: f64,
    pub source: FactorSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_latency_factor")]
    pub latency: FactorConfig,
    #[serde(default = "default_loss_factor")]
    pub loss: FactorConfig,
    #[serde(default = "default_jitter_factor")]
    pub jitter: FactorConfig,
    #[serde(default = "default_obstruction_factor")]
    pub obstruction: FactorConfig,
    /// smoothed ≥ healthy_min (and recent reachable) → healthy.
    #[serde(default = "default_healthy_min")]
    pub healthy_min: f64,
    /// healthy_min > smoothed ≥ degraded_min → degraded.
    #[serde(default = "default_degraded_min")]
    pub degraded_min: f64,
    /// degraded_min > smoothed ≥ failing_min → failing; below → down.
    #[serde(default = "default_failing_min")]
    pub failing_min: f64,
    /// Unreachable within the last N samples → at least failing;
    /// N consecutive unreachable → down.
    #[serde(default = "default_unreachable_window")]
    pub unreachable_window: usize,
}

fn default_latency_factor() -> FactorConfig {
    FactorConfig {
        weight: 0.30,
        ok: 50.0,
        bad: 800.0,
        source: FactorSource::MostRecent,
    }
}

fn default_loss_factor() -> FactorConfig {
    FactorConfig {
        weight: 0.30,
        ok: 0.0,
        bad: 20.0,
        source: FactorSource::MostRecent,
    }
}

fn default_jitter_factor() -> FactorConfig {
    FactorConfig {
        weight: 0.15,
        ok: 5.0,
        bad: 100.0,
        source: FactorSource::WindowMean,
    }
}

fn default_obstruction_factor() -> FactorConfig {
    FactorConfig {
        weight: 0.25,
        ok: 0.0,
        bad: 10.0,
        source: FactorSource::WindowMean,
    }
}

fn default_healthy_min() -> f64 {
    80.0
}

fn default_degraded_min() -> f64 {
    50.0
}

fn default_failing_min() -> f64 {
    20.0
}

fn default_unreachable_window() -> usize {
    3
}

impl Default for ScoringConfig {
    fn default() -> Self {
        ScoringConfig {
            latency: default_latency_factor(),
            loss: default_loss_factor(),
            jitter: default_jitter_factor(),
            obstruction: default_obstruction_factor(),
            healthy_min: default_healthy_min(),
            degraded_min: default_degraded_min(),
            failing_min: default_failing_min(),
            unreachable_window: default_unreachable_window(),
        }
    }
}

// ── Per-member overrides ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    pub name: String,
    pub class: MemberClass,
    #[serde(default = "default_detect")]
    pub detect: DetectMode,
    #[serde(default = "default_weight")]
    pub weight: u8,
    /// Overrides the global `min_uptime_s` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_uptime_s: Option<u64>,
    /// Overrides the global `cooldown_s` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_s: Option<u64>,
    #[serde(default)]
    pub prefer_roaming: bool,
    #[serde(default)]
    pub metered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

fn default_detect() -> DetectMode {
    DetectMode::Auto
}

fn default_weight() -> u8 {
    50
}

// ── Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Master switch. When false the supervisor starts nothing.
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Prefer the mwan3-like policy layer; fall back to base routing.
    #[serde(default = "default_true")]
    pub use_policy_layer: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_decision_interval_ms")]
    pub decision_interval_ms: u64,
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    #[serde(default = "default_history_window_s")]
    pub history_window_s: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_max_samples_per_member")]
    pub max_samples_per_member: usize,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    #[serde(default = "default_max_ram_mb")]
    pub max_ram_mb: u64,

    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,
    #[serde(default = "default_switch_margin")]
    pub switch_margin: f64,
    #[serde(default = "default_min_uptime_s")]
    pub min_uptime_s: u64,
    #[serde(default = "default_cooldown_s")]
    pub cooldown_s: u64,

    #[serde(default = "default_fail_threshold_loss")]
    pub fail_threshold_loss: f64,
    #[serde(default = "default_fail_threshold_latency_ms")]
    pub fail_threshold_latency_ms: f64,
    #[serde(default = "default_fail_min_duration_s")]
    pub fail_min_duration_s: u64,
    #[serde(default = "default_restore_threshold_loss")]
    pub restore_threshold_loss: f64,
    #[serde(default = "default_restore_threshold_latency_ms")]
    pub restore_threshold_latency_ms: f64,
    #[serde(default = "default_restore_min_duration_s")]
    pub restore_min_duration_s: u64,

    /// Enable predictive triggers (imminent reboot, failed self-test).
    #[serde(default = "default_true")]
    pub predictive: bool,
    #[serde(default = "default_reboot_warning_s")]
    pub reboot_warning_s: u64,

    /// Consecutive adapter failures before exponential backoff kicks in.
    #[serde(default = "default_adapter_backoff_threshold")]
    pub adapter_backoff_threshold: u32,

    #[serde(default = "default_verify_delay_ms")]
    pub verify_delay_ms: u64,
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    #[serde(default = "default_policy_timeout_ms")]
    pub policy_timeout_ms: u64,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub members: Vec<MemberConfig>,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_decision_interval_ms() -> u64 {
    5_000
}

fn default_discovery_interval_ms() -> u64 {
    60_000
}

fn default_cleanup_interval_ms() -> u64 {
    10_000
}

fn default_history_window_s() -> u64 {
    600
}

fn default_retention_hours() -> u64 {
    24
}

fn default_max_samples_per_member() -> usize {
    1_000
}

fn default_max_events() -> usize {
    500
}

fn default_max_ram_mb() -> u64 {
    16
}

fn default_ewma_alpha() -> f64 {
    0.2
}

fn default_switch_margin() -> f64 {
    10.0
}

fn default_min_uptime_s() -> u64 {
    60
}

fn default_cooldown_s() -> u64 {
    60
}

fn default_fail_threshold_loss() -> f64 {
    10.0
}

fn default_fail_threshold_latency_ms() -> f64 {
    500.0
}

fn default_fail_min_duration_s() -> u64 {
    10
}

fn default_restore_threshold_loss() -> f64 {
    2.0
}

fn default_restore_threshold_latency_ms() -> f64 {
    200.0
}

fn default_restore_min_duration_s() -> u64 {
    30
}

fn default_reboot_warning_s() -> u64 {
    300
}

fn default_adapter_backoff_threshold() -> u32 {
    3
}

fn default_verify_delay_ms() -> u64 {
    2_000
}

fn default_verify_timeout_ms() -> u64 {
    10_000
}

fn default_policy_timeout_ms() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        // The serde defaults are the single source of truth.
        toml::from_str("").expect("empty config deserializes")
    }
}

impl Config {
    /// Parse and validate a TOML rendition of the config.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs the core refuses to run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            return Err(ConfigError::InvalidAlpha(self.ewma_alpha));
        }
        if !(0.0..=100.0).contains(&self.switch_margin) {
            return Err(ConfigError::InvalidSwitchMargin(self.switch_margin));
        }
        for (name, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("decision_interval_ms", self.decision_interval_ms),
            ("cleanup_interval_ms", self.cleanup_interval_ms),
            ("history_window_s", self.history_window_s),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval { interval: name });
            }
        }
        for (name, factor) in [
            ("latency", &self.scoring.latency),
            ("loss", &self.scoring.loss),
            ("jitter", &self.scoring.jitter),
            ("obstruction", &self.scoring.obstruction),
        ] {
            if factor.ok == factor.bad {
                return Err(ConfigError::DegenerateFactor { factor: name });
            }
        }
        if self.members.is_empty() {
            return Err(ConfigError::NoMembers);
        }
        let mut seen = std::collections::HashSet::new();
        for m in &self.members {
            if !(1..=100).contains(&m.weight) {
                return Err(ConfigError::InvalidWeight {
                    name: m.name.clone(),
                    weight: m.weight,
                });
            }
            if !seen.insert(m.name.as_str()) {
                return Err(ConfigError::DuplicateMember(m.name.clone()));
            }
        }
        Ok(())
    }

    /// Materialize the member list with global defaults applied.
    pub fn members(&self) -> Vec<Member> {
        self.members
            .iter()
            .map(|m| Member {
                name: m.name.clone(),
                class: m.class,
                detect: m.detect,
                weight: m.weight,
                min_uptime_s: m.min_uptime_s.unwrap_or(self.min_uptime_s),
                cooldown_s: m.cooldown_s.unwrap_or(self.cooldown_s),
                prefer_roaming: m.prefer_roaming,
                metered: m.metered,
                interface: m.interface.clone(),
            })
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn decision_interval(&self) -> Duration {
        Duration::from_millis(self.decision_interval_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn policy_timeout(&self) -> Duration {
        Duration::from_millis(self.policy_timeout_ms)
    }

    pub fn max_ram_bytes(&self) -> u64 {
        self.max_ram_mb * 1024 * 1024
    }
}
