//! Probe adapters — simulated and system-backed.
//!
//! In simulation mode every member class gets a generator producing
//! realistic jittered samples, so the whole daemon runs end-to-end on a
//! dev machine. In production mode reachability comes from the system
//! `ping` binary, Wi-Fi signal from `/proc/net/wireless`, and interface
//! state from `/sys/class/net`. Vendor APIs (dish RPC, modem AT
//! commands) stay behind this boundary; a platform build supplies its
//! own adapters for those.

use std::sync::Arc;

use async_trait::async_trait;

use uplinkd_common::models::{extra_keys, Member, MemberClass, Sample};
use uplinkd_core::probe::{ProbeAdapter, ProbeError};

/// Pick a simulated adapter for a member class.
pub fn simulated_probe(class: MemberClass) -> Arc<dyn ProbeAdapter> {
    match class {
        MemberClass::Starlink => Arc::new(SimStarlinkProbe),
        MemberClass::Cellular => Arc::new(SimCellularProbe),
        MemberClass::Wifi => Arc::new(SimWifiProbe),
        MemberClass::Lan | MemberClass::Other => Arc::new(SimLanProbe),
    }
}

/// Dummy timestamp; the collector stamps `member` and `t` on every
/// sample it emits.
fn base_sample(latency_ms: f64, loss_pct: f64) -> Sample {
    Sample::reachable("", chrono::Utc::now(), latency_ms, loss_pct)
}

// ── Simulated probes ────────────────────────────────────────────────

struct SimStarlinkProbe;

#[async_trait]
impl ProbeAdapter for SimStarlinkProbe {
    fn name(&self) -> &str {
        "sim-starlink"
    }

    async fn probe(&self, _member: &Member) -> Result<Sample, ProbeError> {
        use rand::RngExt;
        let mut rng = rand::rng();
        let mut s = base_sample(
            35.0 + rng.random_range(0.0..25.0),
            rng.random_range(0.0..1.5),
        );
        s.jitter_ms = Some(2.0 + rng.random_range(0.0..8.0));
        s.obstruction_pct = Some(rng.random_range(0.0..2.0));
        s.extra.insert(
            extra_keys::POP_PING_DROP_RATE.into(),
            serde_json::Value::from(rng.random_range(0.0..0.01)),
        );
        s.extra.insert(
            extra_keys::SNR.into(),
            serde_json::Value::from(8.0 + rng.random_range(0.0..2.0)),
        );
        s.extra.insert(
            extra_keys::UPTIME_S.into(),
            serde_json::Value::from(rng.random_range(3_600..864_000)),
        );
        s.extra
            .insert(extra_keys::REBOOT_IMMINENT.into(), serde_json::Value::from(false));
        s.extra.insert(
            extra_keys::HARDWARE_SELF_TEST_PASSED.into(),
            serde_json::Value::from(true),
        );
        s.extra
            .insert(extra_keys::THERMAL_THROTTLE.into(), serde_json::Value::from(false));
        s.extra.insert(
            extra_keys::THERMAL_SHUTDOWN_RISK.into(),
            serde_json::Value::from(false),
        );
        Ok(s)
    }
}

struct SimCellularProbe;

#[async_trait]
impl ProbeAdapter for SimCellularProbe {
    fn name(&self) -> &str {
        "sim-cellular"
    }

    async fn probe(&self, _member: &Member) -> Result<Sample, ProbeError> {
        use rand::RngExt;
        let mut rng = rand::rng();
        let mut s = base_sample(
            45.0 + rng.random_range(0.0..35.0),
            rng.random_range(0.0..1.0),
        );
        s.jitter_ms = Some(5.0 + rng.random_range(0.0..15.0));
        s.signal_dbm = Some(-65 - rng.random_range(0..20));
        s.network_type = Some("LTE".into());
        s.roaming = Some(false);
        s.extra.insert(
            extra_keys::SIGNAL_QUALITY_CODE.into(),
            serde_json::Value::from(rng.random_range(15..31)),
        );
        s.extra
            .insert(extra_keys::OPERATOR.into(), serde_json::Value::from("SimCell"));
        Ok(s)
    }
}

struct SimWifiProbe;

#[async_trait]
impl ProbeAdapter for SimWifiProbe {
    fn name(&self) -> &str {
        "sim-wifi"
    }

    async fn probe(&self, _member: &Member) -> Result<Sample, ProbeError> {
        use rand::RngExt;
        let mut rng = rand::rng();
        let mut s = base_sample(
            8.0 + rng.random_range(0.0..12.0),
            rng.random_range(0.0..0.5),
        );
        s.jitter_ms = Some(1.0 + rng.random_range(0.0..5.0));
        let rssi = -45 - rng.random_range(0..25);
        s.signal_dbm = Some(rssi);
        s.extra
            .insert(extra_keys::RSSI_DBM.into(), serde_json::Value::from(rssi));
        s.extra.insert(
            extra_keys::LINK_RATE.into(),
            serde_json::Value::from(rng.random_range(120..867)),
        );
        s.extra
            .insert(extra_keys::SSID.into(), serde_json::Value::from("sim-uplink"));
        Ok(s)
    }
}

struct SimLanProbe;

#[async_trait]
impl ProbeAdapter for SimLanProbe {
    fn name(&self) -> &str {
        "sim-lan"
    }

    async fn probe(&self, _member: &Member) -> Result<Sample, ProbeError> {
        use rand::RngExt;
        let mut rng = rand::rng();
        let mut s = base_sample(1.0 + rng.random_range(0.0..3.0), 0.0);
        s.jitter_ms = Some(rng.random_range(0.0..1.0));
        Ok(s)
    }
}

// ── System probe ────────────────────────────────────────────────────

/// Reachability and latency via the system `ping` binary, bound to the
/// member's interface, enriched with Wi-Fi signal where available.
pub struct SystemProbe {
    ping_target: String,
    ping_count: u32,
}

impl SystemProbe {
    pub fn new(ping_target: impl Into<String>) -> Self {
        SystemProbe {
            ping_target: ping_target.into(),
            ping_count: 3,
        }
    }
}

#[async_trait]
impl ProbeAdapter for SystemProbe {
    fn name(&self) -> &str {
        "system-ping"
    }

    async fn probe(&self, member: &Member) -> Result<Sample, ProbeError> {
        let iface = member.interface();

        if operstate(iface).as_deref() == Some("down") {
            return Err(ProbeError::Unavailable(format!("{iface} is down")));
        }

        let output = tokio::process::Command::new("ping")
            .args([
                "-n",
                "-q",
                "-c",
                &self.ping_count.to_string(),
                "-W",
                "1",
                "-I",
                iface,
                &self.ping_target,
            ])
            .output()
            .await
            .map_err(|e| ProbeError::Unavailable(format!("ping spawn failed: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let loss_pct = parse_loss_pct(&stdout)
            .ok_or_else(|| ProbeError::Invalid("no packet-loss line in ping output".into()))?;

        let mut sample = if loss_pct >= 100.0 {
            Sample::unreachable("", chrono::Utc::now(), "probe_unavailable")
        } else {
            let (avg_ms, mdev_ms) = parse_rtt(&stdout)
                .ok_or_else(|| ProbeError::Invalid("no rtt line in ping output".into()))?;
            let mut s = base_sample(avg_ms, loss_pct);
            s.jitter_ms = Some(mdev_ms);
            s
        };

        if member.class == MemberClass::Wifi {
            if let Some(dbm) = read_signal_dbm(iface) {
                sample.signal_dbm = Some(dbm as i32);
                sample.extra.insert(
                    extra_keys::RSSI_DBM.into(),
                    serde_json::Value::from(dbm as i32),
                );
            }
        }

        Ok(sample)
    }
}

fn operstate(iface: &str) -> Option<String> {
    std::fs::read_to_string(format!("/sys/class/net/{iface}/operstate"))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Parse "3 packets transmitted, 3 received, 0% packet loss, ...".
fn parse_loss_pct(output: &str) -> Option<f64> {
    for line in output.lines() {
        if let Some(idx) = line.find("% packet loss") {
            let prefix = &line[..idx];
            let number = prefix.rsplit([' ', ',']).next()?;
            return number.parse::<f64>().ok();
        }
    }
    None
}

/// Parse "rtt min/avg/max/mdev = 12.3/15.6/20.1/2.2 ms" → (avg, mdev).
fn parse_rtt(output: &str) -> Option<(f64, f64)> {
    for line in output.lines() {
        if line.starts_with("rtt ") || line.starts_with("round-trip ") {
            let values = line.split('=').nth(1)?.trim();
            let values = values.strip_suffix("ms").unwrap_or(values).trim();
            let fields: Vec<&str> = values.split('/').collect();
            if fields.len() >= 4 {
                let avg = fields[1].parse::<f64>().ok()?;
                let mdev = fields[3].parse::<f64>().ok()?;
                return Some((avg, mdev));
            }
        }
    }
    None
}

/// Read the wireless signal level for `iface` from `/proc/net/wireless`.
///
/// Returns `None` if the interface is not wireless or the file is
/// unavailable.
pub fn read_signal_dbm(iface: &str) -> Option<f64> {
    let contents = std::fs::read_to_string("/proc/net/wireless").ok()?;
    parse_proc_wireless(&contents, iface)
}

fn parse_proc_wireless(contents: &str, iface: &str) -> Option<f64> {
    // Format after two header lines:
    //   wlan0: 0000   -42.  -95.  0        0      0      0       0       0
    for line in contents.lines().skip(2) {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(iface) {
            if let Some(rest) = rest.strip_prefix(':') {
                let fields: Vec<&str> = rest.split_whitespace().collect();
                if fields.len() >= 2 {
                    return fields[1].trim_end_matches('.').parse::<f64>().ok();
                }
            }
        }
    }
    None
}
