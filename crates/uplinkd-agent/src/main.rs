//! uplinkd — multi-WAN failover daemon
//!
//! Watches the health of every configured uplink (Starlink dish,
//! cellular modems, Wi-Fi STA, wired WAN) and keeps the best one on the
//! default route:
//!
//! - One collector per member samples health on a fixed cadence
//! - A scoring engine smooths the samples and classifies each member
//! - The decision engine applies hysteresis and picks the primary
//! - The controller drives mwan3 (or base routing) with verify+rollback
//! - A local HTTP API exposes status, metrics, events, and actions
//! - In `--simulate` mode, fake probes generate realistic data for dev

mod api;
mod discovery;
mod policy;
mod probes;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use uplinkd_common::config::{Config, MemberConfig};
use uplinkd_common::models::{DetectMode, MemberClass};
use uplinkd_core::probe::ProbeAdapter;
use uplinkd_core::supervisor::Supervisor;

/// uplinkd failover daemon.
#[derive(Parser, Debug)]
#[command(name = "uplinkd", about = "Multi-WAN failover daemon")]
struct Cli {
    /// Path to the TOML config (omit with --simulate).
    #[arg(long)]
    config: Option<String>,

    /// Run with simulated members and probes (implies --dry-run).
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Never mutate the policy layer; verification reports success.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Local API listen address.
    #[arg(long, default_value = "127.0.0.1:9077")]
    api_addr: String,

    /// Target for system ping probes.
    #[arg(long, default_value = "1.1.1.1")]
    ping_target: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = load_config(&cli)?;
    let members = config.members();
    let dry_run = cli.dry_run || cli.simulate;

    tracing::info!(
        members = members.len(),
        simulate = cli.simulate,
        dry_run,
        use_policy_layer = config.use_policy_layer,
        "uplinkd starting"
    );

    // ── Wire the pipeline ───────────────────────────────────────
    let mut builder = Supervisor::builder(config.clone())
        .policy_layer(Arc::new(policy::Mwan3Policy::new(&members)))
        .fallback_layer(Arc::new(policy::RouteMetricPolicy::new(&members)))
        .dry_run(dry_run);
    for member in &members {
        let adapter: Arc<dyn ProbeAdapter> = if cli.simulate {
            probes::simulated_probe(member.class)
        } else {
            Arc::new(probes::SystemProbe::new(cli.ping_target.clone()))
        };
        builder = builder.probe(&member.name, adapter);
    }
    let supervisor = builder.start().await?;

    // ── Task: local HTTP API ────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        config: Arc::new(config.clone()),
        store: supervisor.store(),
        controller: supervisor.controller(),
        engine: supervisor.engine(),
        status: supervisor.status(),
    });
    let api_addr: SocketAddr = cli.api_addr.parse()?;
    let api_handle = tokio::spawn(api::run(api_state, api_addr));

    // ── Task: uplink discovery ──────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let configured: HashSet<String> = members
        .iter()
        .map(|m| m.interface().to_string())
        .collect();
    let discovery_handle = tokio::spawn(discovery::run(
        configured,
        config.discovery_interval(),
        shutdown_rx,
    ));

    // ── Shutdown handling ───────────────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        result = api_handle => {
            if let Ok(Err(e)) = result {
                tracing::error!("api task failed: {e}");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    supervisor.shutdown().await;
    let _ = discovery_handle.await;

    tracing::info!("uplinkd stopped");
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    if let Some(path) = &cli.config {
        let text = std::fs::read_to_string(path)?;
        return Ok(Config::from_toml(&text)?);
    }
    if cli.simulate {
        return Ok(simulate_config());
    }
    anyhow::bail!("either --config or --simulate is required");
}

/// Built-in member set for `--simulate`: a dish, a metered modem, and a
/// Wi-Fi STA uplink.
fn simulate_config() -> Config {
    let mut config = Config::default();
    config.min_uptime_s = 5;
    config.members = vec![
        MemberConfig {
            name: "starlink".into(),
            class: MemberClass::Starlink,
            detect: DetectMode::Auto,
            weight: 100,
            min_uptime_s: None,
            cooldown_s: None,
            prefer_roaming: false,
            metered: false,
            interface: None,
        },
        MemberConfig {
            name: "cell_a".into(),
            class: MemberClass::Cellular,
            detect: DetectMode::Auto,
            weight: 80,
            min_uptime_s: None,
            cooldown_s: None,
            prefer_roaming: false,
            metered: true,
            interface: Some("wwan0".into()),
        },
        MemberConfig {
            name: "wifi_sta".into(),
            class: MemberClass::Wifi,
            detect: DetectMode::Auto,
            weight: 60,
            min_uptime_s: None,
            cooldown_s: None,
            prefer_roaming: false,
            metered: false,
            interface: Some("wlan0".into()),
        },
    ];
    config
}
