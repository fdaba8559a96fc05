//! Uplink discovery — surfaces interfaces that look like uplink
//! candidates but are not configured as members.
//!
//! Discovery never mutates the member set; it only logs, so an operator
//! can add the member to the platform config. Each candidate is
//! reported once per daemon run.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::watch;

const CANDIDATE_PREFIXES: &[&str] = &["wwan", "wlan", "eth", "en", "usb"];
const IGNORED_PREFIXES: &[&str] = &["lo", "br-", "veth", "docker", "tun", "wg"];

pub async fn run(
    configured_interfaces: HashSet<String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reported: HashSet<String> = HashSet::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for iface in scan_interfaces() {
                    if configured_interfaces.contains(&iface) || reported.contains(&iface) {
                        continue;
                    }
                    tracing::info!(
                        interface = %iface,
                        "unconfigured uplink candidate discovered"
                    );
                    reported.insert(iface);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

fn scan_interfaces() -> Vec<String> {
    let Ok(dir) = std::fs::read_dir("/sys/class/net") else {
        return Vec::new();
    };
    dir.flatten()
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| is_candidate(name))
        .collect()
}

fn is_candidate(name: &str) -> bool {
    if IGNORED_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return false;
    }
    CANDIDATE_PREFIXES.iter().any(|p| name.starts_with(p))
}
