//! In-memory implementations of the capability contracts.
//!
//! These stand in for the real policy layer and probe adapters in the
//! unit and scenario suites, so the whole pipeline runs deterministically
//! without touching the routing stack or any hardware.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use uplinkd_common::models::{Member, PolicyEntry, PolicyOrdering, Sample};

use crate::controller::{PolicyError, PolicyLayer};
use crate::probe::{ProbeAdapter, ProbeError};

// ── Policy layer ────────────────────────────────────────────────────

/// Policy layer backed by two orderings: what was written (`stored`) and
/// what readback returns (`visible`). With stale reads enabled the two
/// diverge, which is exactly the verify-failure case the controller has
/// to roll back from.
pub struct MemoryPolicyLayer {
    stored: Mutex<PolicyOrdering>,
    visible: Mutex<PolicyOrdering>,
    stale_reads: AtomicBool,
    unavailable: AtomicBool,
    transactional: bool,
    commits: AtomicU64,
    writes: AtomicU64,
}

impl MemoryPolicyLayer {
    /// Build with every member present and `primary` at the lowest metric.
    pub fn new(members: &[&str], primary: &str) -> Self {
        let entries = members
            .iter()
            .enumerate()
            .map(|(i, name)| PolicyEntry {
                member: name.to_string(),
                metric: if *name == primary {
                    10
                } else {
                    20 + 10 * i as u32
                },
            })
            .collect();
        let ordering = PolicyOrdering { entries };
        MemoryPolicyLayer {
            stored: Mutex::new(ordering.clone()),
            visible: Mutex::new(ordering),
            stale_reads: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            transactional: true,
            commits: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// When set, `read_state` keeps returning the pre-write ordering.
    pub fn set_stale_reads(&self, stale: bool) {
        self.stale_reads.store(stale, Ordering::Relaxed);
    }

    /// When set, every call fails with `PolicyError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn visible(&self) -> PolicyOrdering {
        self.visible.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn visible_primary(&self) -> Option<String> {
        self.visible().primary().map(|s| s.to_string())
    }

    pub fn stored_primary(&self) -> Option<String> {
        self.stored
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .primary()
            .map(|s| s.to_string())
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<(), PolicyError> {
        if self.unavailable.load(Ordering::Relaxed) {
            Err(PolicyError::Unavailable("simulated outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PolicyLayer for MemoryPolicyLayer {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read_state(&self) -> Result<PolicyOrdering, PolicyError> {
        self.check_available()?;
        if self.stale_reads.load(Ordering::Relaxed) {
            Ok(self.visible.lock().unwrap_or_else(|e| e.into_inner()).clone())
        } else {
            Ok(self.stored.lock().unwrap_or_else(|e| e.into_inner()).clone())
        }
    }

    async fn set_ordering(&self, ordering: &PolicyOrdering) -> Result<(), PolicyError> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        *self.stored.lock().unwrap_or_else(|e| e.into_inner()) = ordering.clone();
        if !self.stale_reads.load(Ordering::Relaxed) {
            *self.visible.lock().unwrap_or_else(|e| e.into_inner()) = ordering.clone();
        }
        Ok(())
    }

    fn supports_transaction(&self) -> bool {
        self.transactional
    }

    async fn commit(&self) -> Result<(), PolicyError> {
        self.check_available()?;
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ── Probe adapter ───────────────────────────────────────────────────

/// Probe adapter that replays a scripted sequence of results, then keeps
/// repeating the final entry.
pub struct ScriptedProbe {
    name: String,
    script: Mutex<VecDeque<Result<Sample, String>>>,
    last: Mutex<Option<Result<Sample, String>>>,
    calls: AtomicU64,
}

impl ScriptedProbe {
    pub fn new(name: impl Into<String>) -> Self {
        ScriptedProbe {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            calls: AtomicU64::new(0),
        }
    }

    /// How many times the collector actually invoked the probe.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn push_sample(&self, sample: Sample) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(sample));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(message.into()));
    }
}

#[async_trait]
impl ProbeAdapter for ScriptedProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self, _member: &Member) -> Result<Sample, ProbeError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let result = match next {
            Some(entry) => {
                *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(entry.clone());
                entry
            }
            None => self
                .last
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .unwrap_or_else(|| Err("script exhausted".into())),
        };
        result.map_err(ProbeError::Unavailable)
    }
}
