//! Per-member sampling loop.
//!
//! A collector owns one member. On every tick it asks the member's probe
//! adapter for a sample and appends it to the telemetry store. Probe work
//! gets a hard deadline of 80% of the poll interval; an overrun or any
//! adapter failure turns into a synthetic unreachable sample so the
//! decision engine always sees a full-cadence window. Adapter panics are
//! isolated in a spawned task and never reach the supervisor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use uplinkd_common::models::{Member, Sample};

use crate::clock::Clock;
use crate::probe::ProbeAdapter;
use crate::store::TelemetryStore;

/// Ceiling for exponential adapter backoff.
const MAX_ADAPTER_BACKOFF: Duration = Duration::from_secs(30);
const INITIAL_ADAPTER_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("collector for {0} is already running")]
    AlreadyRunning(String),
}

pub struct Collector {
    member: Member,
    adapter: Arc<dyn ProbeAdapter>,
    store: Arc<TelemetryStore>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    /// Consecutive failures before backoff kicks in.
    backoff_threshold: u32,
    running: AtomicBool,
    last: Mutex<Option<Sample>>,
}

struct TickState {
    consecutive_failures: u32,
    backoff: Duration,
    backoff_until: Option<Instant>,
    last_cause: String,
}

impl Collector {
    pub fn new(
        member: Member,
        adapter: Arc<dyn ProbeAdapter>,
        store: Arc<TelemetryStore>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        backoff_threshold: u32,
    ) -> Self {
        Collector {
            member,
            adapter,
            store,
            clock,
            poll_interval,
            backoff_threshold: backoff_threshold.max(1),
            running: AtomicBool::new(false),
            last: Mutex::new(None),
        }
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    /// Best-effort last observation for liveness queries.
    pub fn last_sample(&self) -> Option<Sample> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run the sampling loop until `shutdown` flips. Returns
    /// `AlreadyRunning` when the loop is already active.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), CollectorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CollectorError::AlreadyRunning(self.member.name.clone()));
        }

        tracing::info!(
            member = %self.member.name,
            class = %self.member.class,
            adapter = self.adapter.name(),
            interval_ms = self.poll_interval.as_millis() as u64,
            "collector started"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        // An abandoned tick is skipped, never caught up in a burst.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut state = TickState {
            consecutive_failures: 0,
            backoff: INITIAL_ADAPTER_BACKOFF,
            backoff_until: None,
            last_cause: String::from("probe_unavailable"),
        };

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(&mut state).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!(member = %self.member.name, "collector stopped");
        Ok(())
    }

    async fn tick(&self, state: &mut TickState) {
        // While the adapter is backing off, keep the cadence with
        // unreachable samples instead of hammering the device.
        if let Some(until) = state.backoff_until {
            if Instant::now() < until {
                self.emit(Sample::unreachable(
                    &self.member.name,
                    self.clock.now(),
                    state.last_cause.clone(),
                ));
                return;
            }
            state.backoff_until = None;
        }

        let deadline = self.poll_interval.mul_f64(0.8);
        let adapter = self.adapter.clone();
        let member = self.member.clone();
        let mut probe = tokio::spawn(async move { adapter.probe(&member).await });

        let result = match tokio::time::timeout(deadline, &mut probe).await {
            Err(_) => {
                probe.abort();
                Err(String::from("probe_timeout"))
            }
            Ok(Err(join_err)) => {
                if join_err.is_panic() {
                    tracing::error!(
                        member = %self.member.name,
                        adapter = self.adapter.name(),
                        "probe adapter panicked"
                    );
                }
                Err(String::from("probe_panic"))
            }
            Ok(Ok(Err(probe_err))) => {
                tracing::debug!(
                    member = %self.member.name,
                    adapter = self.adapter.name(),
                    error = %probe_err,
                    "probe failed"
                );
                Err(String::from(probe_err.cause()))
            }
            Ok(Ok(Ok(sample))) => Ok(sample),
        };

        match result {
            Ok(mut sample) => {
                state.consecutive_failures = 0;
                state.backoff = INITIAL_ADAPTER_BACKOFF;
                sample.member = self.member.name.clone();
                sample.t = self.clock.now();
                self.emit(sample);
            }
            Err(cause) => {
                state.consecutive_failures += 1;
                state.last_cause = cause.clone();
                if state.consecutive_failures >= self.backoff_threshold {
                    state.backoff_until = Some(Instant::now() + state.backoff);
                    tracing::warn!(
                        member = %self.member.name,
                        adapter = self.adapter.name(),
                        failures = state.consecutive_failures,
                        backoff_s = state.backoff.as_secs(),
                        "adapter backing off"
                    );
                    state.backoff = (state.backoff * 2).min(MAX_ADAPTER_BACKOFF);
                }
                self.emit(Sample::unreachable(
                    &self.member.name,
                    self.clock.now(),
                    cause,
                ));
            }
        }
    }

    fn emit(&self, sample: Sample) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(sample.clone());
        self.store.append_sample(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::probe::{ProbeAdapter, ProbeError};
    use crate::store::StoreConfig;
    use crate::testkit::ScriptedProbe;
    use async_trait::async_trait;
    use uplinkd_common::models::{DetectMode, MemberClass};

    fn member(name: &str) -> Member {
        Member {
            name: name.into(),
            class: MemberClass::Lan,
            detect: DetectMode::Auto,
            weight: 50,
            min_uptime_s: 0,
            cooldown_s: 0,
            prefer_roaming: false,
            metered: false,
            interface: None,
        }
    }

    fn store() -> Arc<TelemetryStore> {
        Arc::new(TelemetryStore::new(StoreConfig {
            max_samples_per_member: 100,
            history_window_s: 3_600,
            max_events: 10,
            retention_hours: 24,
        }))
    }

    fn collector(adapter: Arc<dyn ProbeAdapter>, store: Arc<TelemetryStore>) -> Arc<Collector> {
        Arc::new(Collector::new(
            member("lan"),
            adapter,
            store,
            Arc::new(SystemClock),
            Duration::from_secs(1),
            3,
        ))
    }

    async fn run_for(collector: Arc<Collector>, ticks: u64) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let c = collector.clone();
        let handle = tokio::spawn(async move { c.run(shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(1000 * ticks + 500)).await;
        let _ = shutdown_tx.send(true);
        handle.await.unwrap().unwrap();
    }

    // ─── Cadence ────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn emits_samples_at_cadence() {
        let probe = Arc::new(ScriptedProbe::new("lan-ping"));
        probe.push_sample(Sample::reachable("x", chrono::Utc::now(), 5.0, 0.0));
        let store = store();
        run_for(collector(probe, store.clone()), 3).await;

        let window = store.window("lan", chrono::Utc::now());
        assert!(window.len() >= 3, "expected >=3 samples, got {}", window.len());
        assert!(window.iter().all(|s| s.reachable));
        assert!(window.iter().all(|s| s.member == "lan"));
    }

    #[tokio::test(start_paused = true)]
    async fn already_running_is_rejected() {
        let probe = Arc::new(ScriptedProbe::new("lan-ping"));
        probe.push_sample(Sample::reachable("x", chrono::Utc::now(), 5.0, 0.0));
        let c = collector(probe, store());

        let (_tx, rx) = watch::channel(false);
        let c2 = c.clone();
        let handle = tokio::spawn(async move { c2.run(rx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (_tx2, rx2) = watch::channel(false);
        let second = c.run(rx2).await;
        assert!(matches!(second, Err(CollectorError::AlreadyRunning(_))));
        handle.abort();
    }

    // ─── Failure Semantics ──────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn probe_error_becomes_unreachable_sample() {
        let probe = Arc::new(ScriptedProbe::new("lan-ping"));
        probe.push_error("no route to host");
        let store = store();
        run_for(collector(probe, store.clone()), 1).await;

        let last = store.last_sample("lan").unwrap();
        assert!(!last.reachable);
        assert_eq!(last.cause.as_deref(), Some("probe_unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_yields_probe_timeout() {
        struct SlowProbe;

        #[async_trait]
        impl ProbeAdapter for SlowProbe {
            fn name(&self) -> &str {
                "slow"
            }
            async fn probe(&self, _member: &Member) -> Result<Sample, ProbeError> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Sample::reachable("x", chrono::Utc::now(), 1.0, 0.0))
            }
        }

        let store = store();
        run_for(collector(Arc::new(SlowProbe), store.clone()), 1).await;

        let last = store.last_sample("lan").unwrap();
        assert!(!last.reachable);
        assert_eq!(last.cause.as_deref(), Some("probe_timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_probe_does_not_kill_the_loop() {
        struct PanickingProbe;

        #[async_trait]
        impl ProbeAdapter for PanickingProbe {
            fn name(&self) -> &str {
                "boom"
            }
            async fn probe(&self, _member: &Member) -> Result<Sample, ProbeError> {
                panic!("adapter bug");
            }
        }

        let store = store();
        run_for(collector(Arc::new(PanickingProbe), store.clone()), 2).await;

        let window = store.window("lan", chrono::Utc::now());
        assert!(window.len() >= 2);
        assert!(window.iter().all(|s| !s.reachable));
        assert_eq!(window[0].cause.as_deref(), Some("probe_panic"));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_back_off_the_adapter() {
        let probe = Arc::new(ScriptedProbe::new("lan-ping"));
        probe.push_error("modem gone");
        let store = store();
        run_for(collector(probe.clone(), store.clone()), 6).await;

        // Samples keep flowing at full cadence...
        let window = store.window("lan", chrono::Utc::now());
        assert!(window.len() >= 6);
        assert!(window.iter().all(|s| !s.reachable));
        // ...but after 3 consecutive failures the adapter stops being hit
        // every tick.
        assert!(
            probe.calls() < window.len() as u64,
            "expected fewer probe calls ({}) than samples ({})",
            probe.calls(),
            window.len()
        );
    }
}
