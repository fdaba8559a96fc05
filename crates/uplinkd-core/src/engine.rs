//! Decision engine.
//!
//! Ticks on its own cadence, reads each member's window from the
//! telemetry store, scores it, and decides which member should be
//! primary under the stability rules: switch margin sustained over
//! `fail_min_duration`, restore-min-duration before promotion over a
//! non-failing primary, per-member cooldowns after every switch, and
//! predictive triggers that bypass the margin but not the cooldown
//! (unless the primary is down). The engine never performs I/O beyond
//! the store and the controller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::MissedTickBehavior;

use uplinkd_common::config::{Config, ScoringConfig};
use uplinkd_common::envelope::ErrorKind;
use uplinkd_common::models::{
    DecisionEvent, DecisionTrigger, DetectMode, HealthClass, Member, MemberHealth, Sample, Score,
};

use crate::clock::Clock;
use crate::controller::{Controller, SetPrimaryOutcome};
use crate::score::{self, ScoreParams};
use crate::store::TelemetryStore;

/// Mismatched verifies against one target before it is benched.
const REPEATED_MISMATCH_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub decision_interval: Duration,
    pub switch_margin: f64,
    pub fail_min_duration_s: u64,
    pub restore_min_duration_s: u64,
    pub fail_threshold_loss: f64,
    pub fail_threshold_latency_ms: f64,
    pub restore_threshold_loss: f64,
    pub restore_threshold_latency_ms: f64,
    pub predictive: bool,
    pub reboot_warning_s: u64,
    pub ewma_alpha: f64,
    pub scoring: ScoringConfig,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        EngineConfig {
            decision_interval: config.decision_interval(),
            switch_margin: config.switch_margin,
            fail_min_duration_s: config.fail_min_duration_s,
            restore_min_duration_s: config.restore_min_duration_s,
            fail_threshold_loss: config.fail_threshold_loss,
            fail_threshold_latency_ms: config.fail_threshold_latency_ms,
            restore_threshold_loss: config.restore_threshold_loss,
            restore_threshold_latency_ms: config.restore_threshold_latency_ms,
            predictive: config.predictive,
            reboot_warning_s: config.reboot_warning_s,
            ewma_alpha: config.ewma_alpha,
            scoring: config.scoring.clone(),
        }
    }
}

/// Engine-internal member state, debounced by one decision tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// No window yet.
    Unknown,
    /// First scored tick; classification not yet confirmed.
    Observing,
    Healthy,
    Degraded,
    Failing,
    Down,
}

impl From<HealthClass> for MemberState {
    fn from(class: HealthClass) -> Self {
        match class {
            HealthClass::Healthy => MemberState::Healthy,
            HealthClass::Degraded => MemberState::Degraded,
            HealthClass::Failing => MemberState::Failing,
            HealthClass::Down => MemberState::Down,
        }
    }
}

struct MemberTrack {
    member: Member,
    /// EWMA state carried across ticks.
    smoothed: Option<f64>,
    /// Latest raw score.
    score: Option<Score>,
    /// Effective class after the loss+latency fail-threshold shortcut.
    class: Option<HealthClass>,
    state: MemberState,
    /// Classification awaiting one more tick before the state commits.
    pending: Option<MemberState>,
    /// Start of the current continuous-reachability streak.
    reachable_since: Option<DateTime<Utc>>,
    /// Continuous raw-healthy streak meeting the restore thresholds.
    healthy_since: Option<DateTime<Utc>>,
    /// Continuous effective failing/down streak.
    failing_since: Option<DateTime<Utc>>,
    /// Continuous loss+latency threshold breach.
    breach_since: Option<DateTime<Utc>>,
    /// Continuous smoothed lead of at least switch_margin over the primary.
    margin_since: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    mismatch_streak: u32,
    promotion_blocked: bool,
    last_sample_t: Option<DateTime<Utc>>,
    last_roaming: Option<bool>,
}

impl MemberTrack {
    fn new(member: Member) -> Self {
        MemberTrack {
            member,
            smoothed: None,
            score: None,
            class: None,
            state: MemberState::Unknown,
            pending: None,
            reachable_since: None,
            healthy_since: None,
            failing_since: None,
            breach_since: None,
            margin_since: None,
            cooldown_until: None,
            mismatch_streak: 0,
            promotion_blocked: false,
            last_sample_t: None,
            last_roaming: None,
        }
    }

    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    fn sustained_s(since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
        since.map(|s| (now - s).num_seconds())
    }
}

/// Manual actions routed through the engine so cooldown bookkeeping stays
/// in one place.
pub enum EngineCommand {
    SetPrimary {
        name: String,
        reply: oneshot::Sender<SetPrimaryOutcome>,
    },
    ForceRecheck {
        reply: oneshot::Sender<()>,
    },
    Pause {
        reply: oneshot::Sender<()>,
    },
    Resume {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap cloneable handle for the HTTP surface. The sender slot is
/// swappable so the handle survives an engine restart.
#[derive(Clone)]
pub struct EngineHandle {
    tx: Arc<RwLock<mpsc::Sender<EngineCommand>>>,
}

impl EngineHandle {
    pub fn new(tx: mpsc::Sender<EngineCommand>) -> Self {
        EngineHandle {
            tx: Arc::new(RwLock::new(tx)),
        }
    }

    /// Point the handle at a freshly restarted engine.
    pub async fn replace(&self, tx: mpsc::Sender<EngineCommand>) {
        *self.tx.write().await = tx;
    }

    async fn send(&self, cmd: EngineCommand) -> bool {
        self.tx.read().await.send(cmd).await.is_ok()
    }

    pub async fn set_primary(&self, name: &str) -> Option<SetPrimaryOutcome> {
        let (reply, rx) = oneshot::channel();
        if !self
            .send(EngineCommand::SetPrimary {
                name: name.to_string(),
                reply,
            })
            .await
        {
            return None;
        }
        rx.await.ok()
    }

    pub async fn force_recheck(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if !self.send(EngineCommand::ForceRecheck { reply }).await {
            return false;
        }
        rx.await.is_ok()
    }

    pub async fn pause(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if !self.send(EngineCommand::Pause { reply }).await {
            return false;
        }
        rx.await.is_ok()
    }

    pub async fn resume(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if !self.send(EngineCommand::Resume { reply }).await {
            return false;
        }
        rx.await.is_ok()
    }
}

pub struct Engine {
    cfg: EngineConfig,
    store: Arc<TelemetryStore>,
    controller: Arc<Controller>,
    clock: Arc<dyn Clock>,
    tracks: Vec<MemberTrack>,
    status: Arc<RwLock<Vec<MemberHealth>>>,
    /// Which primary the margin streaks are measured against.
    margin_primary: Option<String>,
    paused: bool,
    cmd_rx: mpsc::Receiver<EngineCommand>,
}

impl Engine {
    /// The command channel and status slot are owned by the supervisor
    /// so they survive an engine restart.
    pub fn new(
        cfg: EngineConfig,
        members: Vec<Member>,
        store: Arc<TelemetryStore>,
        controller: Arc<Controller>,
        clock: Arc<dyn Clock>,
        cmd_rx: mpsc::Receiver<EngineCommand>,
        status: Arc<RwLock<Vec<MemberHealth>>>,
    ) -> Self {
        let tracks = members
            .into_iter()
            .filter(|m| m.detect != DetectMode::Disable)
            .map(MemberTrack::new)
            .collect();
        Engine {
            cfg,
            store,
            controller,
            clock,
            tracks,
            status,
            margin_primary: None,
            paused: false,
            cmd_rx,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.cfg.decision_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            members = self.tracks.len(),
            interval_ms = self.cfg.decision_interval.as_millis() as u64,
            "decision engine started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.paused {
                        self.tick().await;
                    }
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    self.handle_command(cmd).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("decision engine stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One decision pass. Public so deterministic suites can drive the
    /// engine without the timer.
    pub async fn tick(&mut self) {
        let now = self.clock.now();
        let current = self.controller.current_primary();

        let prev_primary_state = current
            .as_deref()
            .and_then(|name| self.tracks.iter().find(|t| t.member.name == name))
            .map(|t| t.state);

        // Score every tracked member against its current window.
        for track in &mut self.tracks {
            let window = self.store.window(&track.member.name, now);
            Self::update_track(&self.cfg, track, &window, now);
        }

        // Margin streaks are measured against the current primary; a
        // primary change restarts them.
        if self.margin_primary != current {
            for track in &mut self.tracks {
                track.margin_since = None;
            }
            self.margin_primary = current.clone();
        }
        let primary_smoothed = current
            .as_deref()
            .and_then(|name| self.tracks.iter().find(|t| t.member.name == name))
            .and_then(|t| t.smoothed);
        if let Some(primary_smoothed) = primary_smoothed {
            for track in &mut self.tracks {
                if Some(track.member.name.as_str()) == current.as_deref() {
                    track.margin_since = None;
                    continue;
                }
                let leads = track.smoothed.is_some_and(|s| {
                    let diff = s - primary_smoothed;
                    diff > 0.0 && diff >= self.cfg.switch_margin
                });
                if leads {
                    track.margin_since.get_or_insert(now);
                } else {
                    track.margin_since = None;
                }
            }
        }

        // A failing, down, or predictive-flagged primary competes no
        // further; the target is the best alternative.
        let cur_impaired = current
            .as_deref()
            .and_then(|name| self.tracks.iter().find(|t| t.member.name == name))
            .is_some_and(|t| {
                matches!(t.class, Some(HealthClass::Failing | HealthClass::Down))
                    || (self.cfg.predictive
                        && t.score.as_ref().is_some_and(score::has_predictive_reason))
            });
        let target = self.pick_target(now, current.as_deref(), cur_impaired);
        let switch = target.as_deref().and_then(|target_name| {
            self.evaluate_switch(now, current.as_deref(), target_name)
        });

        if let (Some(target_name), Some(trigger)) = (target.as_deref(), switch) {
            let outcome = self
                .controller
                .set_primary(target_name, trigger, self.scores_snapshot())
                .await;
            self.absorb_outcome(now, current.as_deref(), target_name, &outcome);
        } else {
            // No switch: audit a debounced class transition of the
            // current primary so the event stream stays bounded but
            // informative.
            let primary_state = current
                .as_deref()
                .and_then(|name| self.tracks.iter().find(|t| t.member.name == name))
                .map(|t| t.state);
            if let (Some(prev), Some(next)) = (prev_primary_state, primary_state) {
                let settled = |s: MemberState| {
                    !matches!(s, MemberState::Unknown | MemberState::Observing)
                };
                if prev != next && settled(prev) && settled(next) {
                    let mut event = DecisionEvent::new(
                        now,
                        current.clone(),
                        current.clone(),
                        DecisionTrigger::Noop,
                    );
                    event.per_member_scores = self.scores_snapshot();
                    self.store.append_event(event);
                }
            }
        }

        self.publish_status(current.as_deref()).await;
    }

    // ── Per-member bookkeeping ──────────────────────────────────

    fn update_track(
        cfg: &EngineConfig,
        track: &mut MemberTrack,
        window: &[Sample],
        now: DateTime<Utc>,
    ) {
        let params = ScoreParams {
            scoring: &cfg.scoring,
            ewma_alpha: cfg.ewma_alpha,
            predictive: cfg.predictive,
            reboot_warning_s: cfg.reboot_warning_s,
        };
        let Some(scored) = score::score(window, &params, track.smoothed) else {
            track.smoothed = None;
            track.score = None;
            track.class = None;
            track.state = MemberState::Unknown;
            track.pending = None;
            track.reachable_since = None;
            track.healthy_since = None;
            track.failing_since = None;
            track.breach_since = None;
            track.last_sample_t = None;
            track.last_roaming = None;
            return;
        };

        let last = &window[window.len() - 1];
        track.last_sample_t = Some(last.t);
        track.last_roaming = last.roaming;
        track.smoothed = Some(scored.smoothed);

        // Continuous reachability. A streak that fills the whole window
        // extends the streak seen on earlier ticks.
        let streak_start = window
            .iter()
            .rev()
            .take_while(|s| s.reachable)
            .last()
            .map(|s| s.t);
        track.reachable_since = match (track.reachable_since, streak_start) {
            (Some(prev), Some(start)) if window.iter().all(|s| s.reachable) => {
                Some(prev.min(start))
            }
            (_, start) => start,
        };

        // Loss+latency fail-threshold shortcut.
        let breach = last.loss_pct.is_some_and(|l| l >= cfg.fail_threshold_loss)
            && last
                .latency_ms
                .is_some_and(|l| l >= cfg.fail_threshold_latency_ms);
        if breach {
            track.breach_since.get_or_insert(last.t);
        } else {
            track.breach_since = None;
        }

        let mut class = scored.class;
        if breach && class.rank() > HealthClass::Failing.rank() {
            class = HealthClass::Failing;
        }

        if matches!(class, HealthClass::Failing | HealthClass::Down) {
            track.failing_since.get_or_insert(now);
        } else {
            track.failing_since = None;
        }

        // Restore eligibility: healthy classification that also clears
        // the restore thresholds.
        let restored = class == HealthClass::Healthy
            && last
                .loss_pct
                .map_or(true, |l| l <= cfg.restore_threshold_loss)
            && last
                .latency_ms
                .map_or(true, |l| l <= cfg.restore_threshold_latency_ms);
        if restored {
            track.healthy_since.get_or_insert(now);
        } else {
            track.healthy_since = None;
        }

        // Debounced state machine: a new classification must persist for
        // one extra tick before the state commits.
        let target_state = MemberState::from(class);
        if track.state == MemberState::Unknown {
            track.state = MemberState::Observing;
            track.pending = Some(target_state);
        } else if track.state == target_state {
            track.pending = None;
        } else if track.pending == Some(target_state) {
            track.state = target_state;
            track.pending = None;
        } else {
            track.pending = Some(target_state);
        }

        track.class = Some(class);
        track.score = Some(scored);
    }

    // ── Target selection ────────────────────────────────────────

    fn is_candidate(&self, track: &MemberTrack, now: DateTime<Utc>) -> bool {
        if track.score.is_none() || track.promotion_blocked {
            return false;
        }
        if track.member.detect == DetectMode::Force {
            return true;
        }
        let reachable_now = track.reachable_since.is_some();
        let uptime_ok = MemberTrack::sustained_s(track.reachable_since, now)
            .is_some_and(|s| s >= track.member.min_uptime_s as i64);
        reachable_now && uptime_ok
    }

    fn pick_target(
        &self,
        now: DateTime<Utc>,
        current: Option<&str>,
        exclude_current: bool,
    ) -> Option<String> {
        let candidates: Vec<&MemberTrack> = self
            .tracks
            .iter()
            .filter(|t| !(exclude_current && Some(t.member.name.as_str()) == current))
            .filter(|t| self.is_candidate(t, now))
            .collect();
        let best = candidates
            .iter()
            .filter_map(|t| t.smoothed)
            .fold(f64::NEG_INFINITY, f64::max);
        if best == f64::NEG_INFINITY {
            return None;
        }

        // Everyone within the switch margin of the best smoothed score
        // competes on the tie-break chain.
        let mut contenders: Vec<&MemberTrack> = candidates
            .into_iter()
            .filter(|t| t.smoothed.is_some_and(|s| best - s <= self.cfg.switch_margin))
            .collect();
        contenders.sort_by(|a, b| {
            Self::tiebreak_key(b)
                .cmp(&Self::tiebreak_key(a))
                .then_with(|| a.member.name.cmp(&b.member.name))
        });
        contenders.first().map(|t| t.member.name.clone())
    }

    /// class → weight → non-roaming → non-metered; name breaks the rest.
    fn tiebreak_key(track: &MemberTrack) -> (u8, u8, u8, u8) {
        let class_rank = track.class.map(|c| c.rank()).unwrap_or(0);
        let roaming_penalized =
            track.last_roaming == Some(true) && !track.member.prefer_roaming;
        (
            class_rank,
            track.member.weight,
            u8::from(!roaming_penalized),
            u8::from(!track.member.metered),
        )
    }

    // ── Switch evaluation ───────────────────────────────────────

    fn evaluate_switch(
        &self,
        now: DateTime<Utc>,
        current: Option<&str>,
        target: &str,
    ) -> Option<DecisionTrigger> {
        if current == Some(target) {
            return None;
        }
        let Some(current_name) = current else {
            return Some(DecisionTrigger::Reschedule);
        };
        let Some(cur) = self.tracks.iter().find(|t| t.member.name == current_name) else {
            // The policy prefers something we do not manage.
            return Some(DecisionTrigger::Reschedule);
        };
        if cur.score.is_none() {
            return Some(DecisionTrigger::Reschedule);
        }
        let tgt = self.tracks.iter().find(|t| t.member.name == target)?;

        let cur_class = cur.class.unwrap_or(HealthClass::Down);
        let emergency = cur_class == HealthClass::Down;
        let cooldown_active = cur.in_cooldown(now) || tgt.in_cooldown(now);

        // Predictive triggers bypass the switch margin, not the cooldown
        // (unless the primary is already down).
        if self.cfg.predictive
            && cur.score.as_ref().is_some_and(score::has_predictive_reason)
            && (emergency || !cooldown_active)
        {
            return Some(DecisionTrigger::Predictive);
        }

        let cur_failing = matches!(cur_class, HealthClass::Failing | HealthClass::Down);
        let fail_ready = cur_failing
            && MemberTrack::sustained_s(cur.failing_since, now)
                .is_some_and(|s| s >= self.cfg.fail_min_duration_s as i64);
        let margin_ready = MemberTrack::sustained_s(tgt.margin_since, now)
            .is_some_and(|s| s >= self.cfg.fail_min_duration_s as i64);

        // A switch needs a sustained margin lead or a sustained failure
        // of the current primary.
        if !fail_ready && !margin_ready {
            return None;
        }
        // Promotion over a non-failing primary additionally requires the
        // target to have been restored for restore_min_duration.
        if !cur_failing {
            let restore_ready = MemberTrack::sustained_s(tgt.healthy_since, now)
                .is_some_and(|s| s >= self.cfg.restore_min_duration_s as i64);
            if !restore_ready {
                return None;
            }
        }
        if cooldown_active && !emergency {
            return None;
        }
        if cur_failing {
            Some(DecisionTrigger::Fail)
        } else {
            Some(DecisionTrigger::Restore)
        }
    }

    fn absorb_outcome(
        &mut self,
        now: DateTime<Utc>,
        prev: Option<&str>,
        target: &str,
        outcome: &SetPrimaryOutcome,
    ) {
        if outcome.applied {
            for track in &mut self.tracks {
                let involved = track.member.name == target
                    || Some(track.member.name.as_str()) == prev;
                if involved {
                    track.cooldown_until =
                        Some(now + chrono::Duration::seconds(track.member.cooldown_s as i64));
                }
                // Any successful apply un-benches previously mismatching
                // targets.
                track.promotion_blocked = false;
                track.mismatch_streak = 0;
                track.margin_since = None;
            }
            self.margin_primary = Some(target.to_string());
            return;
        }
        if outcome.is_mismatch() {
            if let Some(track) = self.tracks.iter_mut().find(|t| t.member.name == target) {
                track.mismatch_streak += 1;
                if track.mismatch_streak >= REPEATED_MISMATCH_THRESHOLD
                    && !track.promotion_blocked
                {
                    track.promotion_blocked = true;
                    tracing::warn!(
                        member = %target,
                        streak = track.mismatch_streak,
                        "repeated policy mismatch, benching member until the next applied change"
                    );
                    let mut event = DecisionEvent::new(
                        now,
                        prev.map(|s| s.to_string()),
                        Some(target.to_string()),
                        DecisionTrigger::Noop,
                    );
                    event.error = Some(format!(
                        "promotion_blocked: repeated policy_mismatch on {target}"
                    ));
                    self.store.append_event(event);
                }
            }
        } else if outcome.is_busy() {
            tracing::debug!(member = %target, "controller busy, retrying next tick");
        }
    }

    fn scores_snapshot(&self) -> BTreeMap<String, f64> {
        self.tracks
            .iter()
            .filter_map(|t| t.smoothed.map(|s| (t.member.name.clone(), s)))
            .collect()
    }

    async fn publish_status(&self, current: Option<&str>) {
        let snapshot: Vec<MemberHealth> = self
            .tracks
            .iter()
            .map(|t| MemberHealth {
                name: t.member.name.clone(),
                class: t.member.class,
                health: t.class.unwrap_or(HealthClass::Down),
                smoothed: t.smoothed.unwrap_or(0.0),
                primary: Some(t.member.name.as_str()) == current,
                last_sample_t: t.last_sample_t,
            })
            .collect();
        *self.status.write().await = snapshot;
    }

    // ── Manual actions ──────────────────────────────────────────

    /// Execute one manual action. The run loop feeds commands from the
    /// handle's channel; deterministic suites call this directly.
    pub async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::SetPrimary { name, reply } => {
                let outcome = self.manual_set_primary(&name).await;
                let _ = reply.send(outcome);
            }
            EngineCommand::ForceRecheck { reply } => {
                tracing::info!("manual force_recheck");
                for track in &mut self.tracks {
                    track.promotion_blocked = false;
                    track.mismatch_streak = 0;
                }
                let now = self.clock.now();
                let current = self.controller.current_primary();
                let mut event =
                    DecisionEvent::new(now, current.clone(), current, DecisionTrigger::Manual);
                event.applied = true;
                event.per_member_scores = self.scores_snapshot();
                self.store.append_event(event);
                self.tick().await;
                let _ = reply.send(());
            }
            EngineCommand::Pause { reply } => {
                self.paused = true;
                tracing::info!("decision engine paused");
                self.audit_manual().await;
                let _ = reply.send(());
            }
            EngineCommand::Resume { reply } => {
                self.paused = false;
                tracing::info!("decision engine resumed");
                self.audit_manual().await;
                let _ = reply.send(());
            }
        }
    }

    async fn manual_set_primary(&mut self, name: &str) -> SetPrimaryOutcome {
        if !self.tracks.iter().any(|t| t.member.name == name) {
            return SetPrimaryOutcome {
                applied: false,
                noop: false,
                rollback: false,
                error: Some(format!("unknown member: {name}")),
                error_kind: Some(ErrorKind::ConfigInvalid),
            };
        }
        let now = self.clock.now();
        let prev = self.controller.current_primary();
        let outcome = self
            .controller
            .set_primary(name, DecisionTrigger::Manual, self.scores_snapshot())
            .await;
        self.absorb_outcome(now, prev.as_deref(), name, &outcome);
        outcome
    }

    async fn audit_manual(&self) {
        let now = self.clock.now();
        let current = self.controller.current_primary();
        let mut event = DecisionEvent::new(now, current.clone(), current, DecisionTrigger::Manual);
        event.applied = true;
        event.per_member_scores = self.scores_snapshot();
        self.store.append_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::controller::ControllerConfig;
    use crate::store::StoreConfig;
    use crate::testkit::MemoryPolicyLayer;
    use uplinkd_common::models::MemberClass;

    fn member(name: &str, weight: u8, min_uptime_s: u64) -> Member {
        Member {
            name: name.into(),
            class: MemberClass::Other,
            detect: DetectMode::Auto,
            weight,
            min_uptime_s,
            cooldown_s: 30,
            prefer_roaming: false,
            metered: false,
            interface: None,
        }
    }

    fn healthy_sample(name: &str, t: DateTime<Utc>) -> Sample {
        let mut s = Sample::reachable(name, t, 50.0, 0.0);
        s.jitter_ms = Some(5.0);
        s
    }

    fn slow_sample(name: &str, t: DateTime<Utc>) -> Sample {
        let mut s = Sample::reachable(name, t, 800.0, 0.0);
        s.jitter_ms = Some(5.0);
        s
    }

    struct Rig {
        engine: Engine,
        store: Arc<TelemetryStore>,
        clock: Arc<ManualClock>,
        policy: Arc<MemoryPolicyLayer>,
        _cmd_tx: mpsc::Sender<EngineCommand>,
    }

    impl Rig {
        fn new(members: Vec<Member>) -> Self {
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let store = Arc::new(TelemetryStore::new(StoreConfig {
                max_samples_per_member: 1_000,
                history_window_s: 600,
                max_events: 500,
                retention_hours: 24,
            }));
            // Fresh boot: the policy layer has no ordering yet.
            let policy = Arc::new(MemoryPolicyLayer::new(&[], ""));
            let controller = Arc::new(Controller::new(
                members.clone(),
                None,
                policy.clone(),
                clock.clone(),
                store.clone(),
                ControllerConfig {
                    verify_delay: Duration::from_millis(1),
                    verify_timeout: Duration::from_millis(20),
                    policy_timeout: Duration::from_millis(100),
                    dry_run: false,
                },
            ));
            let cfg = EngineConfig {
                decision_interval: Duration::from_secs(5),
                switch_margin: 10.0,
                fail_min_duration_s: 10,
                restore_min_duration_s: 30,
                fail_threshold_loss: 10.0,
                fail_threshold_latency_ms: 500.0,
                restore_threshold_loss: 2.0,
                restore_threshold_latency_ms: 200.0,
                predictive: true,
                reboot_warning_s: 300,
                ewma_alpha: 0.2,
                scoring: ScoringConfig::default(),
            };
            let (cmd_tx, cmd_rx) = mpsc::channel(16);
            let engine = Engine::new(
                cfg,
                members,
                store.clone(),
                controller,
                clock.clone(),
                cmd_rx,
                Arc::new(RwLock::new(Vec::new())),
            );
            Rig {
                engine,
                store,
                clock,
                policy,
                _cmd_tx: cmd_tx,
            }
        }

        /// Feed per-second samples for `secs`, ticking the engine every
        /// five simulated seconds.
        async fn advance(&mut self, secs: u64, make: impl Fn(DateTime<Utc>) -> Vec<Sample>) {
            for i in 0..secs {
                let t = self.clock.now();
                for sample in make(t) {
                    self.store.append_sample(sample);
                }
                self.clock.advance(Duration::from_secs(1));
                if (i + 1) % 5 == 0 {
                    self.engine.tick().await;
                }
            }
        }

        fn events(&self) -> Vec<DecisionEvent> {
            self.store.events(self.clock.now())
        }

        fn applied_events(&self) -> Vec<DecisionEvent> {
            self.events().into_iter().filter(|e| e.applied).collect()
        }
    }

    // ─── Initial Selection ──────────────────────────────────────────────

    #[tokio::test]
    async fn first_tick_selects_by_weight() {
        let mut rig = Rig::new(vec![member("starlink", 100, 0), member("cell_a", 80, 0)]);
        rig.advance(5, |t| {
            vec![healthy_sample("starlink", t), healthy_sample("cell_a", t)]
        })
        .await;

        let events = rig.applied_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger, DecisionTrigger::Reschedule);
        assert_eq!(events[0].new_primary.as_deref(), Some("starlink"));
        assert_eq!(rig.policy.visible_primary().as_deref(), Some("starlink"));
    }

    // ─── min_uptime ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn min_uptime_gates_candidacy() {
        let mut rig = Rig::new(vec![member("starlink", 100, 60)]);
        rig.advance(55, |t| vec![healthy_sample("starlink", t)]).await;
        assert!(rig.applied_events().is_empty(), "not enough uptime yet");

        rig.advance(10, |t| vec![healthy_sample("starlink", t)]).await;
        let events = rig.applied_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new_primary.as_deref(), Some("starlink"));
    }

    // ─── Margin + Restore + Cooldown ────────────────────────────────────

    #[tokio::test]
    async fn margin_promotion_waits_for_restore_and_cooldown() {
        let mut rig = Rig::new(vec![member("starlink", 100, 0), member("cell_a", 80, 0)]);
        // t0..t0+5: both healthy, starlink selected at t0+5.
        rig.advance(5, |t| {
            vec![healthy_sample("starlink", t), healthy_sample("cell_a", t)]
        })
        .await;
        assert_eq!(rig.policy.visible_primary().as_deref(), Some("starlink"));

        // Degrade starlink; cell_a builds a sustained margin lead, but the
        // switch must wait for restore_min_duration (30s from the first
        // tick) and starlink's cooldown (30s from the switch at t0+5).
        rig.advance(25, |t| {
            vec![slow_sample("starlink", t), healthy_sample("cell_a", t)]
        })
        .await;
        assert_eq!(
            rig.applied_events().len(),
            1,
            "no promotion before restore_min_duration and cooldown"
        );

        rig.advance(5, |t| {
            vec![slow_sample("starlink", t), healthy_sample("cell_a", t)]
        })
        .await;
        let events = rig.applied_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].trigger, DecisionTrigger::Restore);
        assert_eq!(events[1].new_primary.as_deref(), Some("cell_a"));
        assert_eq!(rig.policy.visible_primary().as_deref(), Some("cell_a"));
    }

    // ─── Debounced Class Transitions ────────────────────────────────────

    #[tokio::test]
    async fn primary_class_transition_is_debounced_and_audited() {
        let mut rig = Rig::new(vec![member("starlink", 100, 0), member("cell_a", 80, 0)]);
        rig.advance(10, |t| {
            vec![healthy_sample("starlink", t), healthy_sample("cell_a", t)]
        })
        .await;
        let baseline = rig.events().len();

        // One failing tick: pending only, no transition event.
        rig.advance(5, |t| {
            vec![
                Sample::unreachable("starlink", t, "probe_timeout"),
                healthy_sample("cell_a", t),
            ]
        })
        .await;
        let noops: Vec<DecisionEvent> = rig
            .events()
            .into_iter()
            .skip(baseline)
            .filter(|e| e.trigger == DecisionTrigger::Noop)
            .collect();
        assert!(noops.is_empty(), "one tick must not commit a transition");

        // Second failing tick commits the transition and audits it once.
        rig.advance(5, |t| {
            vec![
                Sample::unreachable("starlink", t, "probe_timeout"),
                healthy_sample("cell_a", t),
            ]
        })
        .await;
        let noops: Vec<DecisionEvent> = rig
            .events()
            .into_iter()
            .skip(baseline)
            .filter(|e| e.trigger == DecisionTrigger::Noop)
            .collect();
        assert_eq!(noops.len(), 1);
        assert_eq!(noops[0].prev_primary.as_deref(), Some("starlink"));
    }

    // ─── Manual Actions ─────────────────────────────────────────────────

    #[tokio::test]
    async fn manual_unknown_member_is_rejected() {
        let mut rig = Rig::new(vec![member("starlink", 100, 0)]);
        let outcome = rig.engine.manual_set_primary("nope").await;
        assert!(!outcome.applied);
        assert_eq!(outcome.error_kind, Some(ErrorKind::ConfigInvalid));
    }

    #[tokio::test]
    async fn manual_switch_stamps_cooldown() {
        let mut rig = Rig::new(vec![member("starlink", 100, 0), member("cell_a", 80, 0)]);
        rig.advance(5, |t| {
            vec![healthy_sample("starlink", t), healthy_sample("cell_a", t)]
        })
        .await;

        let outcome = rig.engine.manual_set_primary("cell_a").await;
        assert!(outcome.applied);
        assert_eq!(rig.policy.visible_primary().as_deref(), Some("cell_a"));

        // starlink leads on the tie-break but must wait out the cooldown
        // and the restore window; nothing flips right back.
        rig.advance(20, |t| {
            vec![healthy_sample("starlink", t), healthy_sample("cell_a", t)]
        })
        .await;
        assert_eq!(rig.policy.visible_primary().as_deref(), Some("cell_a"));
    }

    // ─── Repeated Mismatch ──────────────────────────────────────────────

    #[tokio::test]
    async fn repeated_mismatch_benches_target_until_force_recheck() {
        let mut rig = Rig::new(vec![member("starlink", 100, 0), member("cell_a", 80, 0)]);
        rig.advance(5, |t| {
            vec![healthy_sample("starlink", t), healthy_sample("cell_a", t)]
        })
        .await;
        assert_eq!(rig.policy.visible_primary().as_deref(), Some("starlink"));

        // From here on, every write is accepted but readback never moves.
        rig.policy.set_stale_reads(true);

        // Kill starlink: down is an emergency, so the engine retries
        // cell_a every tick and keeps hitting the stale readback.
        rig.advance(30, |t| {
            vec![
                Sample::unreachable("starlink", t, "probe_timeout"),
                healthy_sample("cell_a", t),
            ]
        })
        .await;

        let rollbacks = rig
            .events()
            .into_iter()
            .filter(|e| e.rollback)
            .count();
        assert_eq!(
            rollbacks, REPEATED_MISMATCH_THRESHOLD as usize,
            "after the bench, no further attempts are made"
        );
        let cell = rig
            .engine
            .tracks
            .iter()
            .find(|t| t.member.name == "cell_a")
            .unwrap();
        assert!(cell.promotion_blocked);
        assert!(rig.events().iter().any(|e| e
            .error
            .as_deref()
            .is_some_and(|m| m.contains("promotion_blocked"))));

        // force_recheck clears the bench and immediately retries.
        let before = rig.events().into_iter().filter(|e| e.rollback).count();
        rig.policy.set_stale_reads(false);
        let (reply, rx) = oneshot::channel();
        rig.engine
            .handle_command(EngineCommand::ForceRecheck { reply })
            .await;
        rx.await.unwrap();
        assert_eq!(
            rig.policy.visible_primary().as_deref(),
            Some("cell_a"),
            "recheck retries the switch once the bench is lifted"
        );
        let after = rig.events().into_iter().filter(|e| e.rollback).count();
        assert_eq!(before, after);
    }
}
