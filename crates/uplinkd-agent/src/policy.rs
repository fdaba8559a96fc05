//! Policy layer adapters.
//!
//! Two ways of steering the default route:
//!
//! - [`Mwan3Policy`] — the preferred path on OpenWrt-class systems.
//!   Member priorities live in UCI (`mwan3.<member>.metric`); changes
//!   are staged with `uci set` and committed in one `uci commit`.
//! - [`RouteMetricPolicy`] — the fallback. Rewrites per-interface
//!   default-route metrics directly with `ip route replace`, one batch,
//!   no transaction.
//!
//! Both speak entirely through subprocesses, so the core stays free of
//! platform plumbing.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use uplinkd_common::models::{Member, PolicyEntry, PolicyOrdering};
use uplinkd_core::controller::{PolicyError, PolicyLayer};

async fn run(program: &str, args: &[&str]) -> Result<String, PolicyError> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| PolicyError::Unavailable(format!("{program} spawn failed: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PolicyError::Rejected(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// ── mwan3 ───────────────────────────────────────────────────────────

pub struct Mwan3Policy {
    member_names: Vec<String>,
}

impl Mwan3Policy {
    pub fn new(members: &[Member]) -> Self {
        Mwan3Policy {
            member_names: members.iter().map(|m| m.name.clone()).collect(),
        }
    }
}

#[async_trait]
impl PolicyLayer for Mwan3Policy {
    fn name(&self) -> &str {
        "mwan3"
    }

    async fn read_state(&self) -> Result<PolicyOrdering, PolicyError> {
        let mut entries = Vec::new();
        for member in &self.member_names {
            let key = format!("mwan3.{member}.metric");
            match run("uci", &["-q", "get", key.as_str()]).await {
                Ok(value) => {
                    let metric = value.trim().parse::<u32>().map_err(|_| {
                        PolicyError::Rejected(format!("{key} is not a metric: {value:?}"))
                    })?;
                    entries.push(PolicyEntry {
                        member: member.clone(),
                        metric,
                    });
                }
                // Member not configured in mwan3; leave it out of the
                // ordering rather than failing the read.
                Err(PolicyError::Rejected(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        if entries.is_empty() {
            return Err(PolicyError::Unavailable(
                "no mwan3 members configured".into(),
            ));
        }
        Ok(PolicyOrdering { entries })
    }

    async fn set_ordering(&self, ordering: &PolicyOrdering) -> Result<(), PolicyError> {
        for entry in &ordering.entries {
            let assignment = format!("mwan3.{}.metric={}", entry.member, entry.metric);
            run("uci", &["set", assignment.as_str()]).await?;
        }
        Ok(())
    }

    fn supports_transaction(&self) -> bool {
        true
    }

    async fn commit(&self) -> Result<(), PolicyError> {
        run("uci", &["commit", "mwan3"]).await?;
        run("mwan3", &["restart"]).await?;
        Ok(())
    }
}

// ── Base routing fallback ───────────────────────────────────────────

pub struct RouteMetricPolicy {
    /// member name → interface.
    interfaces: HashMap<String, String>,
    /// interface → gateway, learned from the last read.
    gateways: Mutex<HashMap<String, String>>,
}

impl RouteMetricPolicy {
    pub fn new(members: &[Member]) -> Self {
        RouteMetricPolicy {
            interfaces: members
                .iter()
                .map(|m| (m.name.clone(), m.interface().to_string()))
                .collect(),
            gateways: Mutex::new(HashMap::new()),
        }
    }

    fn member_for_interface(&self, iface: &str) -> Option<&str> {
        self.interfaces
            .iter()
            .find(|(_, dev)| dev.as_str() == iface)
            .map(|(name, _)| name.as_str())
    }
}

#[async_trait]
impl PolicyLayer for RouteMetricPolicy {
    fn name(&self) -> &str {
        "route-metric"
    }

    async fn read_state(&self) -> Result<PolicyOrdering, PolicyError> {
        let output = run("ip", &["route", "show", "default"]).await?;
        let routes = parse_default_routes(&output);
        if routes.is_empty() {
            return Err(PolicyError::Unavailable("no default routes".into()));
        }

        let mut entries = Vec::new();
        let mut gateways = self.gateways.lock().unwrap_or_else(|e| e.into_inner());
        for route in routes {
            gateways.insert(route.dev.clone(), route.via.clone());
            if let Some(member) = self.member_for_interface(&route.dev) {
                entries.push(PolicyEntry {
                    member: member.to_string(),
                    metric: route.metric,
                });
            }
        }
        Ok(PolicyOrdering { entries })
    }

    async fn set_ordering(&self, ordering: &PolicyOrdering) -> Result<(), PolicyError> {
        let gateways = {
            self.gateways
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        };
        let mut applied = 0usize;
        for entry in &ordering.entries {
            let Some(iface) = self.interfaces.get(&entry.member) else {
                continue;
            };
            let Some(via) = gateways.get(iface) else {
                tracing::warn!(member = %entry.member, interface = %iface, "no known gateway, skipping");
                continue;
            };
            let metric = entry.metric.to_string();
            run(
                "ip",
                &[
                    "route",
                    "replace",
                    "default",
                    "via",
                    via.as_str(),
                    "dev",
                    iface.as_str(),
                    "metric",
                    metric.as_str(),
                ],
            )
            .await?;
            applied += 1;
        }
        if applied == 0 {
            return Err(PolicyError::Rejected(
                "no default route could be rewritten".into(),
            ));
        }
        Ok(())
    }

    fn supports_transaction(&self) -> bool {
        false
    }

    async fn commit(&self) -> Result<(), PolicyError> {
        Ok(())
    }
}

// ── ip route parsing ────────────────────────────────────────────────

struct DefaultRoute {
    via: String,
    dev: String,
    metric: u32,
}

/// Parse `ip route show default` lines, e.g.
/// `default via 192.168.1.1 dev eth0 proto static metric 100`.
fn parse_default_routes(output: &str) -> Vec<DefaultRoute> {
    let mut routes = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() != Some(&"default") {
            continue;
        }
        let mut via = None;
        let mut dev = None;
        let mut metric = 0u32;
        let mut iter = fields.iter().skip(1);
        while let Some(field) = iter.next() {
            match *field {
                "via" => via = iter.next().map(|s| s.to_string()),
                "dev" => dev = iter.next().map(|s| s.to_string()),
                "metric" => {
                    metric = iter
                        .next()
                        .and_then(|s| s.parse::<u32>().ok())
                        .unwrap_or(0);
                }
                _ => {}
            }
        }
        if let (Some(via), Some(dev)) = (via, dev) {
            routes.push(DefaultRoute { via, dev, metric });
        }
    }
    routes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_default_route_lines() {
        let output = "\
default via 192.168.1.1 dev eth0 proto static metric 100
default via 10.45.0.1 dev wwan0 proto dhcp src 10.45.0.2 metric 200
10.45.0.0/24 dev wwan0 proto kernel scope link";
        let routes = parse_default_routes(output);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].via, "192.168.1.1");
        assert_eq!(routes[0].dev, "eth0");
        assert_eq!(routes[0].metric, 100);
        assert_eq!(routes[1].dev, "wwan0");
        assert_eq!(routes[1].metric, 200);
    }

    #[test]
    fn parse_route_without_metric_defaults_to_zero() {
        let routes = parse_default_routes("default via 192.168.1.1 dev eth0");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].metric, 0);
    }

    #[test]
    fn parse_ignores_non_default_routes() {
        let routes = parse_default_routes("192.168.1.0/24 dev eth0 proto kernel scope link");
        assert!(routes.is_empty());
    }
}
