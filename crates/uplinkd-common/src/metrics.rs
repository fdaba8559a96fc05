//! Prometheus metrics rendering for member health.
//!
//! Renders the engine's latest `MemberHealth` snapshot and the telemetry
//! store's counters in Prometheus text exposition format, suitable for
//! scraping by Prometheus or compatible collectors.

use std::fmt::Write;

use crate::models::MemberHealth;

/// Telemetry store counters surfaced as metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCounters {
    pub samples_held: u64,
    pub events_held: u64,
    pub samples_trimmed_total: u64,
    pub events_trimmed_total: u64,
    pub budget_exceeded_total: u64,
}

/// Render the member health snapshot as Prometheus text exposition format.
pub fn render_prometheus(members: &[MemberHealth], counters: &StoreCounters) -> String {
    let mut out = String::with_capacity(2048);

    // ── Per-member gauges ───────────────────────────────────────

    writeln!(
        out,
        "# HELP uplinkd_member_score Smoothed health score (0-100)."
    )
    .unwrap();
    writeln!(out, "# TYPE uplinkd_member_score gauge").unwrap();
    for m in members {
        writeln!(
            out,
            "uplinkd_member_score{{member=\"{}\",class=\"{}\"}} {:.3}",
            m.name, m.class, m.smoothed
        )
        .unwrap();
    }

    writeln!(
        out,
        "# HELP uplinkd_member_primary Whether this member carries the default route."
    )
    .unwrap();
    writeln!(out, "# TYPE uplinkd_member_primary gauge").unwrap();
    for m in members {
        writeln!(
            out,
            "uplinkd_member_primary{{member=\"{}\"}} {}",
            m.name,
            if m.primary { 1 } else { 0 }
        )
        .unwrap();
    }

    writeln!(
        out,
        "# HELP uplinkd_member_health Health classification (3=healthy 2=degraded 1=failing 0=down)."
    )
    .unwrap();
    writeln!(out, "# TYPE uplinkd_member_health gauge").unwrap();
    for m in members {
        writeln!(
            out,
            "uplinkd_member_health{{member=\"{}\",health=\"{}\"}} {}",
            m.name,
            m.health,
            m.health.rank()
        )
        .unwrap();
    }

    // ── Aggregate metrics ───────────────────────────────────────

    let healthy = members
        .iter()
        .filter(|m| m.health == crate::models::HealthClass::Healthy)
        .count();

    writeln!(out, "# HELP uplinkd_members_total Configured members.").unwrap();
    writeln!(out, "# TYPE uplinkd_members_total gauge").unwrap();
    writeln!(out, "uplinkd_members_total {}", members.len()).unwrap();

    writeln!(out, "# HELP uplinkd_members_healthy Members classified healthy.").unwrap();
    writeln!(out, "# TYPE uplinkd_members_healthy gauge").unwrap();
    writeln!(out, "uplinkd_members_healthy {healthy}").unwrap();

    // ── Store counters ──────────────────────────────────────────

    writeln!(
        out,
        "# HELP uplinkd_samples_held Samples currently retained across all members."
    )
    .unwrap();
    writeln!(out, "# TYPE uplinkd_samples_held gauge").unwrap();
    writeln!(out, "uplinkd_samples_held {}", counters.samples_held).unwrap();

    writeln!(out, "# HELP uplinkd_events_held Decision events currently retained.").unwrap();
    writeln!(out, "# TYPE uplinkd_events_held gauge").unwrap();
    writeln!(out, "uplinkd_events_held {}", counters.events_held).unwrap();

    writeln!(
        out,
        "# HELP uplinkd_samples_trimmed_total Samples evicted FIFO from the store."
    )
    .unwrap();
    writeln!(out, "# TYPE uplinkd_samples_trimmed_total counter").unwrap();
    writeln!(
        out,
        "uplinkd_samples_trimmed_total {}",
        counters.samples_trimmed_total
    )
    .unwrap();

    writeln!(
        out,
        "# HELP uplinkd_events_trimmed_total Decision events evicted from the store."
    )
    .unwrap();
    writeln!(out, "# TYPE uplinkd_events_trimmed_total counter").unwrap();
    writeln!(
        out,
        "uplinkd_events_trimmed_total {}",
        counters.events_trimmed_total
    )
    .unwrap();

    writeln!(
        out,
        "# HELP uplinkd_budget_exceeded_total Times the memory cap forced a capacity reduction."
    )
    .unwrap();
    writeln!(out, "# TYPE uplinkd_budget_exceeded_total counter").unwrap();
    writeln!(
        out,
        "uplinkd_budget_exceeded_total {}",
        counters.budget_exceeded_total
    )
    .unwrap();

    out
}
