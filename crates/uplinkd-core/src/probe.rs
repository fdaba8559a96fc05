//! Probe adapter contract.
//!
//! A probe adapter turns raw device or interface state into a [`Sample`]:
//! ICMP reachability, a Starlink dish status fetch, a cellular signal
//! read, a Wi-Fi link read. The vendor-specific plumbing lives behind this
//! trait; the collector only sees a `Sample` or a [`ProbeError`].

use async_trait::async_trait;
use thiserror::Error;
use uplinkd_common::models::{Member, Sample};

#[derive(Debug, Error)]
pub enum ProbeError {
    /// The underlying device or interface could not be reached. Transient.
    #[error("probe unavailable: {0}")]
    Unavailable(String),
    /// The probe produced data the adapter refuses to turn into a sample.
    #[error("probe returned invalid data: {0}")]
    Invalid(String),
}

impl ProbeError {
    /// The `cause` string recorded on the synthetic unreachable sample.
    pub fn cause(&self) -> &'static str {
        match self {
            ProbeError::Unavailable(_) => "probe_unavailable",
            ProbeError::Invalid(_) => "probe_invalid",
        }
    }
}

/// Class-specific health probe.
///
/// Implementations must be cancel-safe: the collector abandons a probe
/// that overruns its per-tick deadline and may abort the task driving it.
/// The returned sample's `member` and `t` fields are overwritten by the
/// collector, so adapters only fill in measurements.
#[async_trait]
pub trait ProbeAdapter: Send + Sync + 'static {
    /// Short name for logs and backoff accounting.
    fn name(&self) -> &str;

    async fn probe(&self, member: &Member) -> Result<Sample, ProbeError>;
}
