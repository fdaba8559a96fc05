//! # uplinkd-core
//!
//! The decision pipeline of the uplinkd multi-WAN failover daemon:
//!
//! - [`collector`] — one sampling loop per member, feeding the store
//! - [`score`] — pure scoring, EWMA smoothing, health classification
//! - [`engine`] — the decision cadence with hysteresis and cooldowns
//! - [`controller`] — applies the chosen primary to the policy layer with
//!   verify and rollback
//! - [`store`] — bounded in-memory telemetry (samples + decision events)
//! - [`supervisor`] — wires and owns all of the above
//!
//! Collectors and the engine never call each other; the telemetry store is
//! the only shared entity between them.

pub mod clock;
pub mod collector;
pub mod controller;
pub mod engine;
pub mod probe;
pub mod score;
pub mod store;
pub mod supervisor;
pub mod testkit;
