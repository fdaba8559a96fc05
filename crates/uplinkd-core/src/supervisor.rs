//! Supervisor — owns and wires the whole pipeline.
//!
//! A single builder produces the fully-connected supervisor: telemetry
//! store, controller, one collector per enabled member, the decision
//! engine, and the cleanup task. The supervisor owns the root shutdown
//! channel; every subsystem task is restarted on fatal failure with
//! exponential backoff capped at one minute. There is no global state:
//! everything flows through the handles the supervisor hands out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use uplinkd_common::config::{Config, ConfigError};
use uplinkd_common::models::{DetectMode, MemberHealth};

use crate::clock::{Clock, SystemClock};
use crate::collector::Collector;
use crate::controller::{Controller, ControllerConfig, PolicyLayer};
use crate::engine::{Engine, EngineConfig, EngineHandle};
use crate::probe::ProbeAdapter;
use crate::store::{StoreConfig, TelemetryStore};

const RESTART_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no probe adapter registered for member {0}")]
    MissingProbe(String),
    #[error("no fallback policy layer provided")]
    MissingFallback,
}

pub struct SupervisorBuilder {
    config: Config,
    clock: Arc<dyn Clock>,
    probes: HashMap<String, Arc<dyn ProbeAdapter>>,
    policy: Option<Arc<dyn PolicyLayer>>,
    fallback: Option<Arc<dyn PolicyLayer>>,
    dry_run: bool,
}

impl SupervisorBuilder {
    pub fn new(config: Config) -> Self {
        SupervisorBuilder {
            config,
            clock: Arc::new(SystemClock),
            probes: HashMap::new(),
            policy: None,
            fallback: None,
            dry_run: false,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register the probe adapter for one member.
    pub fn probe(mut self, member: &str, adapter: Arc<dyn ProbeAdapter>) -> Self {
        self.probes.insert(member.to_string(), adapter);
        self
    }

    /// The preferred (mwan3-like) policy layer. Ignored when the config
    /// sets `use_policy_layer = false`.
    pub fn policy_layer(mut self, layer: Arc<dyn PolicyLayer>) -> Self {
        self.policy = Some(layer);
        self
    }

    /// The base-routing fallback layer. Required.
    pub fn fallback_layer(mut self, layer: Arc<dyn PolicyLayer>) -> Self {
        self.fallback = Some(layer);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Validate, wire, and start everything.
    pub async fn start(self) -> Result<Supervisor, SupervisorError> {
        self.config.validate()?;

        let store = Arc::new(TelemetryStore::new(StoreConfig::from_config(&self.config)));
        let members = self.config.members();
        let fallback = self.fallback.ok_or(SupervisorError::MissingFallback)?;
        let preferred = if self.config.use_policy_layer {
            self.policy
        } else {
            None
        };

        let mut controller_cfg = ControllerConfig::from_config(&self.config);
        controller_cfg.dry_run = self.dry_run;
        let controller = Arc::new(Controller::new(
            members.clone(),
            preferred,
            fallback,
            self.clock.clone(),
            store.clone(),
            controller_cfg,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let mut collectors = Vec::new();
        for member in &members {
            if member.detect == DetectMode::Disable {
                continue;
            }
            let adapter = self
                .probes
                .get(&member.name)
                .cloned()
                .ok_or_else(|| SupervisorError::MissingProbe(member.name.clone()))?;
            collectors.push(Arc::new(Collector::new(
                member.clone(),
                adapter,
                store.clone(),
                self.clock.clone(),
                self.config.poll_interval(),
                self.config.adapter_backoff_threshold,
            )));
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let engine_handle = EngineHandle::new(cmd_tx);
        let status: Arc<RwLock<Vec<MemberHealth>>> = Arc::new(RwLock::new(Vec::new()));

        if !self.config.enable {
            tracing::warn!("uplinkd is disabled by config; supervisor starts nothing");
            return Ok(Supervisor {
                config: self.config,
                store,
                controller,
                engine_handle,
                status,
                collectors,
                shutdown_tx,
                tasks,
            });
        }

        controller.refresh_current().await;

        for collector in &collectors {
            tasks.push(spawn_collector(collector.clone(), shutdown_rx.clone()));
        }

        tasks.push(spawn_engine(
            EngineConfig::from_config(&self.config),
            members,
            store.clone(),
            controller.clone(),
            self.clock.clone(),
            cmd_rx,
            engine_handle.clone(),
            status.clone(),
            shutdown_rx.clone(),
        ));

        tasks.push(spawn_cleanup(
            store.clone(),
            self.clock.clone(),
            self.config.cleanup_interval(),
            self.config.max_ram_bytes(),
            shutdown_rx,
        ));

        tracing::info!(
            members = collectors.len(),
            dry_run = self.dry_run,
            "supervisor started"
        );

        Ok(Supervisor {
            config: self.config,
            store,
            controller,
            engine_handle,
            status,
            collectors,
            shutdown_tx,
            tasks,
        })
    }
}

pub struct Supervisor {
    config: Config,
    store: Arc<TelemetryStore>,
    controller: Arc<Controller>,
    engine_handle: EngineHandle,
    status: Arc<RwLock<Vec<MemberHealth>>>,
    collectors: Vec<Arc<Collector>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn builder(config: Config) -> SupervisorBuilder {
        SupervisorBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<TelemetryStore> {
        self.store.clone()
    }

    pub fn controller(&self) -> Arc<Controller> {
        self.controller.clone()
    }

    pub fn engine(&self) -> EngineHandle {
        self.engine_handle.clone()
    }

    pub fn status(&self) -> Arc<RwLock<Vec<MemberHealth>>> {
        self.status.clone()
    }

    pub fn collectors(&self) -> &[Arc<Collector>] {
        &self.collectors
    }

    /// Cooperative shutdown: stop new ticks, wait for every task to
    /// drain. In-flight probes are abandoned by their own deadlines.
    pub async fn shutdown(self) {
        tracing::info!("supervisor shutting down");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!("supervisor stopped");
    }
}

// ── Task wrappers ───────────────────────────────────────────────────

/// Run a collector, restarting it on fatal failure with exponential
/// backoff. A clean return (cooperative shutdown) ends the task.
fn spawn_collector(collector: Arc<Collector>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = RESTART_BACKOFF_INITIAL;
        loop {
            let c = collector.clone();
            let rx = shutdown.clone();
            let run = tokio::spawn(async move { c.run(rx).await });
            match run.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => {
                    tracing::error!(member = %collector.member().name, error = %e, "collector error");
                }
                Err(join_err) => {
                    tracing::error!(
                        member = %collector.member().name,
                        error = %join_err,
                        "collector task died"
                    );
                }
            }
            if *shutdown.borrow() {
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RESTART_BACKOFF_CAP);
            tracing::warn!(member = %collector.member().name, "restarting collector");
        }
    })
}

/// Run the decision engine, rebuilding it on fatal failure. The command
/// channel is re-created and swapped into the shared handle so the HTTP
/// surface keeps working across restarts; engine hysteresis state resets
/// to `unknown`, which only delays the next decision by the debounce.
#[allow(clippy::too_many_arguments)]
fn spawn_engine(
    cfg: EngineConfig,
    members: Vec<uplinkd_common::models::Member>,
    store: Arc<TelemetryStore>,
    controller: Arc<Controller>,
    clock: Arc<dyn Clock>,
    cmd_rx: mpsc::Receiver<crate::engine::EngineCommand>,
    handle: EngineHandle,
    status: Arc<RwLock<Vec<MemberHealth>>>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = RESTART_BACKOFF_INITIAL;
        let mut cmd_rx = Some(cmd_rx);
        loop {
            let rx = match cmd_rx.take() {
                Some(rx) => rx,
                None => {
                    let (tx, rx) = mpsc::channel(16);
                    handle.replace(tx).await;
                    rx
                }
            };
            let engine = Engine::new(
                cfg.clone(),
                members.clone(),
                store.clone(),
                controller.clone(),
                clock.clone(),
                rx,
                status.clone(),
            );
            let run = tokio::spawn(engine.run(shutdown.clone()));
            match run.await {
                Ok(()) => return,
                Err(join_err) => {
                    tracing::error!(error = %join_err, "decision engine died");
                }
            }
            if *shutdown.borrow() {
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RESTART_BACKOFF_CAP);
            tracing::warn!("restarting decision engine");
        }
    })
}

/// Periodic store maintenance: wall-clock eviction plus the aggregate
/// memory budget.
fn spawn_cleanup(
    store: Arc<TelemetryStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    max_bytes: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    store.sweep(clock.now());
                    if store.enforce_budget(max_bytes) {
                        tracing::warn!(
                            capacity = store.effective_capacity(),
                            "memory budget exceeded, reduced per-member sample capacity"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{MemoryPolicyLayer, ScriptedProbe};
    use uplinkd_common::config::MemberConfig;
    use uplinkd_common::models::{MemberClass, Sample};

    fn config() -> Config {
        let mut config = Config::default();
        config.poll_interval_ms = 100;
        config.decision_interval_ms = 200;
        config.cleanup_interval_ms = 200;
        config.min_uptime_s = 0;
        config.members = vec![
            MemberConfig {
                name: "starlink".into(),
                class: MemberClass::Starlink,
                detect: uplinkd_common::models::DetectMode::Auto,
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
                detect: uplinkd_common::models::DetectMode::Auto,
                weight: 80,
                min_uptime_s: None,
                cooldown_s: None,
                prefer_roaming: false,
                metered: true,
                interface: None,
            },
        ];
        config
    }

    fn probe(name: &str) -> Arc<ScriptedProbe> {
        let probe = Arc::new(ScriptedProbe::new(name));
        probe.push_sample(Sample::reachable("x", chrono::Utc::now(), 40.0, 0.0));
        probe
    }

    #[tokio::test(start_paused = true)]
    async fn builder_rejects_missing_probe() {
        let result = Supervisor::builder(config())
            .probe("starlink", probe("starlink"))
            .fallback_layer(Arc::new(MemoryPolicyLayer::new(&[], "")))
            .start()
            .await;
        assert!(matches!(result, Err(SupervisorError::MissingProbe(m)) if m == "cell_a"));
    }

    #[tokio::test(start_paused = true)]
    async fn builder_rejects_invalid_config() {
        let mut bad = config();
        bad.ewma_alpha = 2.0;
        let result = Supervisor::builder(bad)
            .probe("starlink", probe("starlink"))
            .probe("cell_a", probe("cell_a"))
            .fallback_layer(Arc::new(MemoryPolicyLayer::new(&[], "")))
            .start()
            .await;
        assert!(matches!(result, Err(SupervisorError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_selects_a_primary_end_to_end() {
        let policy = Arc::new(MemoryPolicyLayer::new(&[], ""));
        let supervisor = Supervisor::builder(config())
            .probe("starlink", probe("starlink"))
            .probe("cell_a", probe("cell_a"))
            .fallback_layer(policy.clone())
            .start()
            .await
            .expect("supervisor starts");

        // Let collectors sample and the engine decide a few times.
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(policy.visible_primary().as_deref(), Some("starlink"));
        assert_eq!(
            supervisor.controller().current_primary().as_deref(),
            Some("starlink")
        );
        let status = supervisor.status();
        let snapshot = status.read().await.clone();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|m| m.name == "starlink" && m.primary));

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_config_starts_nothing() {
        let mut disabled = config();
        disabled.enable = false;
        let supervisor = Supervisor::builder(disabled)
            .probe("starlink", probe("starlink"))
            .probe("cell_a", probe("cell_a"))
            .fallback_layer(Arc::new(MemoryPolicyLayer::new(&[], "")))
            .start()
            .await
            .expect("supervisor builds");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(supervisor.store().counters().samples_held, 0);
        supervisor.shutdown().await;
    }
}
