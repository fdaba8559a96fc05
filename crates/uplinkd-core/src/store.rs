//! Bounded in-memory telemetry.
//!
//! Two logical tables: a per-member ring of [`Sample`]s and one
//! system-wide ring of [`DecisionEvent`]s. Collectors and the controller
//! write; the decision engine and the HTTP surface read point-in-time
//! snapshots. Eviction is FIFO by count, lazy by wall-clock age, and
//! always counted — nothing is discarded silently.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use uplinkd_common::config::Config;
use uplinkd_common::metrics::StoreCounters;
use uplinkd_common::models::{DecisionEvent, Sample};

/// Rough per-record heap cost used for the byte-budget estimate. The
/// store never serializes to measure; these cover the struct plus typical
/// string/extra payloads.
const SAMPLE_COST_BYTES: u64 = 768;
const EVENT_COST_BYTES: u64 = 1024;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_samples_per_member: usize,
    pub history_window_s: u64,
    pub max_events: usize,
    pub retention_hours: u64,
}

impl StoreConfig {
    pub fn from_config(config: &Config) -> Self {
        StoreConfig {
            max_samples_per_member: config.max_samples_per_member,
            history_window_s: config.history_window_s,
            max_events: config.max_events,
            retention_hours: config.retention_hours,
        }
    }
}

struct MemberRing {
    samples: VecDeque<Sample>,
}

pub struct TelemetryStore {
    cfg: StoreConfig,
    /// Current per-member capacity; shrunk in 10% steps under budget
    /// pressure, never below 1.
    effective_cap: AtomicUsize,
    rings: RwLock<HashMap<String, Arc<Mutex<MemberRing>>>>,
    events: Mutex<VecDeque<DecisionEvent>>,
    samples_trimmed: AtomicU64,
    events_trimmed: AtomicU64,
    budget_exceeded: AtomicU64,
}

impl TelemetryStore {
    pub fn new(cfg: StoreConfig) -> Self {
        let cap = cfg.max_samples_per_member.max(1);
        TelemetryStore {
            cfg,
            effective_cap: AtomicUsize::new(cap),
            rings: RwLock::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            samples_trimmed: AtomicU64::new(0),
            events_trimmed: AtomicU64::new(0),
            budget_exceeded: AtomicU64::new(0),
        }
    }

    fn ring(&self, member: &str) -> Arc<Mutex<MemberRing>> {
        {
            let rings = self.rings.read().unwrap_or_else(|e| e.into_inner());
            if let Some(ring) = rings.get(member) {
                return ring.clone();
            }
        }
        let mut rings = self.rings.write().unwrap_or_else(|e| e.into_inner());
        rings
            .entry(member.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(MemberRing {
                    samples: VecDeque::new(),
                }))
            })
            .clone()
    }

    // ── Samples ─────────────────────────────────────────────────

    /// Append one observation. Timestamps are clamped so a member's ring
    /// stays totally ordered even if the source clock steps backwards.
    pub fn append_sample(&self, mut sample: Sample) {
        let ring = self.ring(&sample.member);
        let mut ring = ring.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = ring.samples.back() {
            if sample.t < last.t {
                sample.t = last.t;
            }
        }
        ring.samples.push_back(sample);

        let cap = self.effective_cap.load(Ordering::Relaxed);
        while ring.samples.len() > cap {
            ring.samples.pop_front();
            self.samples_trimmed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Best-effort most recent observation for a member.
    pub fn last_sample(&self, member: &str) -> Option<Sample> {
        let ring = self.ring(member);
        let ring = ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.samples.back().cloned()
    }

    /// Point-in-time snapshot of a member's window: every retained sample
    /// younger than `history_window_s`. Older samples are evicted on the
    /// way out.
    pub fn window(&self, member: &str, now: DateTime<Utc>) -> Vec<Sample> {
        let cutoff = now - chrono::Duration::seconds(self.cfg.history_window_s as i64);
        let ring = self.ring(member);
        let mut ring = ring.lock().unwrap_or_else(|e| e.into_inner());
        while ring.samples.front().is_some_and(|s| s.t < cutoff) {
            ring.samples.pop_front();
            self.samples_trimmed.fetch_add(1, Ordering::Relaxed);
        }
        ring.samples.iter().cloned().collect()
    }

    // ── Decision events ─────────────────────────────────────────

    pub fn append_event(&self, event: DecisionEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push_back(event);
        while events.len() > self.cfg.max_events {
            events.pop_front();
            self.events_trimmed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// All retained events in chronological order. Events past the
    /// wall-clock retention are evicted on the way out.
    pub fn events(&self, now: DateTime<Utc>) -> Vec<DecisionEvent> {
        let cutoff = now - chrono::Duration::hours(self.cfg.retention_hours as i64);
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        while events.front().is_some_and(|e| e.t < cutoff) {
            events.pop_front();
            self.events_trimmed.fetch_add(1, Ordering::Relaxed);
        }
        events.iter().cloned().collect()
    }

    // ── Maintenance ─────────────────────────────────────────────

    /// Physically evict everything past its wall-clock bound. Called by
    /// the supervisor's cleanup task; reads perform the same eviction
    /// lazily.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let members: Vec<String> = {
            let rings = self.rings.read().unwrap_or_else(|e| e.into_inner());
            rings.keys().cloned().collect()
        };
        for member in members {
            let _ = self.window(&member, now);
        }
        let _ = self.events(now);
    }

    /// Enforce the aggregate byte budget. On breach, reduce the
    /// per-member sample capacity by one 10% step, trim, and count it.
    /// Returns true when a reduction happened.
    pub fn enforce_budget(&self, max_bytes: u64) -> bool {
        let counters = self.counters();
        let estimated = counters.samples_held * SAMPLE_COST_BYTES
            + counters.events_held * EVENT_COST_BYTES;
        if estimated <= max_bytes {
            return false;
        }

        let cap = self.effective_cap.load(Ordering::Relaxed);
        let reduced = ((cap * 9) / 10).max(1);
        self.effective_cap.store(reduced, Ordering::Relaxed);
        self.budget_exceeded.fetch_add(1, Ordering::Relaxed);

        let rings: Vec<Arc<Mutex<MemberRing>>> = {
            let rings = self.rings.read().unwrap_or_else(|e| e.into_inner());
            rings.values().cloned().collect()
        };
        for ring in rings {
            let mut ring = ring.lock().unwrap_or_else(|e| e.into_inner());
            while ring.samples.len() > reduced {
                ring.samples.pop_front();
                self.samples_trimmed.fetch_add(1, Ordering::Relaxed);
            }
        }
        true
    }

    /// Current per-member sample capacity after any budget reductions.
    pub fn effective_capacity(&self) -> usize {
        self.effective_cap.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> StoreCounters {
        let samples_held: u64 = {
            let rings = self.rings.read().unwrap_or_else(|e| e.into_inner());
            rings
                .values()
                .map(|r| r.lock().unwrap_or_else(|e| e.into_inner()).samples.len() as u64)
                .sum()
        };
        let events_held = self.events.lock().unwrap_or_else(|e| e.into_inner()).len() as u64;
        StoreCounters {
            samples_held,
            events_held,
            samples_trimmed_total: self.samples_trimmed.load(Ordering::Relaxed),
            events_trimmed_total: self.events_trimmed.load(Ordering::Relaxed),
            budget_exceeded_total: self.budget_exceeded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uplinkd_common::models::DecisionTrigger;

    fn store_with(cap: usize, window_s: u64) -> TelemetryStore {
        TelemetryStore::new(StoreConfig {
            max_samples_per_member: cap,
            history_window_s: window_s,
            max_events: 4,
            retention_hours: 24,
        })
    }

    fn sample_at(member: &str, t: DateTime<Utc>) -> Sample {
        Sample::reachable(member, t, 40.0, 0.0)
    }

    // ─── Sample Ring ────────────────────────────────────────────────────

    #[test]
    fn fifo_eviction_is_counted() {
        let store = store_with(3, 600);
        let t0 = Utc::now();
        for i in 0..5 {
            store.append_sample(sample_at("a", t0 + chrono::Duration::seconds(i)));
        }
        let window = store.window("a", t0 + chrono::Duration::seconds(5));
        assert_eq!(window.len(), 3);
        assert_eq!(store.counters().samples_trimmed_total, 2);
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let store = store_with(10, 600);
        let t0 = Utc::now();
        store.append_sample(sample_at("a", t0));
        store.append_sample(sample_at("a", t0 - chrono::Duration::seconds(5)));
        let window = store.window("a", t0);
        assert_eq!(window.len(), 2);
        assert!(window[1].t >= window[0].t);
    }

    #[test]
    fn window_hides_and_evicts_old_samples() {
        let store = store_with(100, 10);
        let t0 = Utc::now();
        store.append_sample(sample_at("a", t0));
        store.append_sample(sample_at("a", t0 + chrono::Duration::seconds(30)));

        let window = store.window("a", t0 + chrono::Duration::seconds(31));
        assert_eq!(window.len(), 1);
        // The expired sample was physically evicted and counted.
        assert_eq!(store.counters().samples_trimmed_total, 1);
        assert_eq!(store.counters().samples_held, 1);
    }

    #[test]
    fn last_sample_tracks_latest() {
        let store = store_with(10, 600);
        let t0 = Utc::now();
        assert!(store.last_sample("a").is_none());
        store.append_sample(sample_at("a", t0));
        store.append_sample(sample_at("a", t0 + chrono::Duration::seconds(1)));
        let last = store.last_sample("a").unwrap();
        assert_eq!(last.t, t0 + chrono::Duration::seconds(1));
    }

    // ─── Event Ring ─────────────────────────────────────────────────────

    #[test]
    fn event_ring_is_bounded() {
        let store = store_with(10, 600);
        let t0 = Utc::now();
        for _ in 0..6 {
            store.append_event(DecisionEvent::new(
                t0,
                None,
                Some("a".into()),
                DecisionTrigger::Fail,
            ));
        }
        assert_eq!(store.events(t0).len(), 4);
        assert_eq!(store.counters().events_trimmed_total, 2);
    }

    #[test]
    fn events_expire_by_retention() {
        let store = store_with(10, 600);
        let t0 = Utc::now();
        store.append_event(DecisionEvent::new(
            t0,
            None,
            Some("a".into()),
            DecisionTrigger::Fail,
        ));
        let later = t0 + chrono::Duration::hours(25);
        assert!(store.events(later).is_empty());
    }

    // ─── Budget ─────────────────────────────────────────────────────────

    #[test]
    fn budget_breach_reduces_capacity_in_steps() {
        let store = store_with(100, 600);
        let t0 = Utc::now();
        for i in 0..100 {
            store.append_sample(sample_at("a", t0 + chrono::Duration::milliseconds(i)));
        }
        // 100 samples ≈ 75 KB estimated; 1 KB budget must breach.
        assert!(store.enforce_budget(1024));
        assert_eq!(store.effective_capacity(), 90);
        assert_eq!(store.counters().budget_exceeded_total, 1);
        assert_eq!(store.counters().samples_held, 90);

        assert!(store.enforce_budget(1024));
        assert_eq!(store.effective_capacity(), 81);
    }

    #[test]
    fn budget_within_limit_is_untouched() {
        let store = store_with(100, 600);
        store.append_sample(sample_at("a", Utc::now()));
        assert!(!store.enforce_budget(10 * 1024 * 1024));
        assert_eq!(store.effective_capacity(), 100);
        assert_eq!(store.counters().budget_exceeded_total, 0);
    }

    #[test]
    fn trimming_never_raises_sample_count() {
        let store = store_with(50, 600);
        let t0 = Utc::now();
        for i in 0..80 {
            store.append_sample(sample_at("a", t0 + chrono::Duration::milliseconds(i)));
        }
        let before = store.counters().samples_held;
        store.enforce_budget(0);
        assert!(store.counters().samples_held <= before);
    }
}
