//! Health scoring.
//!
//! Composite score (0–100) from normalized factor targets, an EWMA
//! smoothing pass, and a health classification with a predictive
//! override for conditions quantitative factors cannot see (imminent
//! dish reboot, failed hardware self-test, thermal shutdown risk).
//!
//! Everything here is pure: same window in, byte-identical `Score` out.
//! The decision engine owns the per-member smoothed state and passes it
//! back in each tick.

use uplinkd_common::config::{FactorConfig, FactorSource, ScoringConfig};
use uplinkd_common::models::{extra_keys, HealthClass, Sample, Score, ScoreReason};

/// Scoring knobs the engine derives from the daemon config.
#[derive(Debug, Clone)]
pub struct ScoreParams<'a> {
    pub scoring: &'a ScoringConfig,
    /// EWMA smoothing factor in (0, 1]. Higher = more responsive.
    pub ewma_alpha: f64,
    pub predictive: bool,
    pub reboot_warning_s: u64,
}

/// Score one member's window. Returns `None` for an empty window — the
/// member has no defined score and is not a candidate.
pub fn score(window: &[Sample], params: &ScoreParams, prev_smoothed: Option<f64>) -> Option<Score> {
    let last = window.last()?;

    let factors: [(&str, &FactorConfig, fn(&Sample) -> Option<f64>); 4] = [
        ("latency", &params.scoring.latency, |s| s.latency_ms),
        ("loss", &params.scoring.loss, |s| s.loss_pct),
        ("jitter", &params.scoring.jitter, |s| s.jitter_ms),
        ("obstruction", &params.scoring.obstruction, |s| {
            s.obstruction_pct
        }),
    ];

    let mut sum_weight = 0.0;
    let mut sum_contrib = 0.0;
    let mut reasons = Vec::new();
    for (name, factor, get) in factors {
        let Some(x) = factor_value(window, factor.source, get) else {
            continue;
        };
        let norm = clamp01((factor.bad - x) / (factor.bad - factor.ok));
        sum_weight += factor.weight;
        sum_contrib += factor.weight * norm;
        reasons.push((name, factor.weight * norm));
    }

    let instant = if sum_weight > 0.0 {
        (sum_contrib / sum_weight * 100.0).clamp(0.0, 100.0)
    } else if last.reachable {
        // Reachability is the only signal this window carries.
        100.0
    } else {
        0.0
    };

    let smoothed = match prev_smoothed {
        Some(prev) => params.ewma_alpha * instant + (1.0 - params.ewma_alpha) * prev,
        None => instant,
    }
    .clamp(0.0, 100.0);

    let mut reasons: Vec<ScoreReason> = reasons
        .into_iter()
        .map(|(factor, contrib)| ScoreReason {
            factor: factor.to_string(),
            contribution: if sum_weight > 0.0 {
                contrib / sum_weight
            } else {
                0.0
            },
        })
        .collect();
    reasons.sort_by(|a, b| {
        b.contribution
            .partial_cmp(&a.contribution)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.factor.cmp(&b.factor))
    });

    let mut class = classify(smoothed, window, params.scoring);

    if params.predictive {
        for (cause, forces_down) in predictive_conditions(last, params.reboot_warning_s) {
            let floor = if forces_down {
                HealthClass::Down
            } else {
                HealthClass::Failing
            };
            if class.rank() > floor.rank() {
                class = floor;
            }
            reasons.insert(
                0,
                ScoreReason {
                    factor: cause.to_string(),
                    contribution: 1.0,
                },
            );
        }
    }

    Some(Score {
        instant,
        smoothed,
        class,
        reasons,
    })
}

/// Whether a score carries a predictive downgrade.
pub fn has_predictive_reason(s: &Score) -> bool {
    s.reasons.iter().any(|r| r.factor.starts_with("predictive:"))
}

fn factor_value(
    window: &[Sample],
    source: FactorSource,
    get: fn(&Sample) -> Option<f64>,
) -> Option<f64> {
    match source {
        // Most recent sample that carries the field; unreachable samples
        // have no measurements, so this skips past them.
        FactorSource::MostRecent => window.iter().rev().find_map(get),
        FactorSource::WindowMean => {
            let values: Vec<f64> = window.iter().filter_map(get).collect();
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
    }
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

fn classify(smoothed: f64, window: &[Sample], scoring: &ScoringConfig) -> HealthClass {
    let n = scoring.unreachable_window.max(1);
    let consecutive_unreachable = window.iter().rev().take_while(|s| !s.reachable).count();
    if consecutive_unreachable >= n {
        return HealthClass::Down;
    }
    if smoothed < scoring.failing_min {
        return HealthClass::Down;
    }
    if window.iter().rev().take(n).any(|s| !s.reachable) {
        return HealthClass::Failing;
    }
    if smoothed >= scoring.healthy_min {
        HealthClass::Healthy
    } else if smoothed >= scoring.degraded_min {
        HealthClass::Degraded
    } else {
        HealthClass::Failing
    }
}

/// Predictive conditions read from the latest sample. Each yields the
/// reason string and whether it mandates an immediate move (down) rather
/// than a downgrade to failing.
fn predictive_conditions(last: &Sample, reboot_warning_s: u64) -> Vec<(&'static str, bool)> {
    let mut conditions = Vec::new();
    if last.extra_bool(extra_keys::HARDWARE_SELF_TEST_PASSED) == Some(false) {
        conditions.push(("predictive:hardware_self_test_failed", true));
    }
    let reboot_soon = last.extra_bool(extra_keys::REBOOT_IMMINENT) == Some(true)
        || last
            .extra_f64(extra_keys::REBOOT_IN_S)
            .is_some_and(|s| s <= reboot_warning_s as f64);
    if reboot_soon {
        conditions.push(("predictive:reboot_imminent", false));
    }
    if last.extra_bool(extra_keys::THERMAL_SHUTDOWN_RISK) == Some(true) {
        conditions.push(("predictive:thermal_shutdown_risk", false));
    }
    conditions
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use uplinkd_common::models::Sample;

    fn params(scoring: &ScoringConfig) -> ScoreParams<'_> {
        ScoreParams {
            scoring,
            ewma_alpha: 0.2,
            predictive: true,
            reboot_warning_s: 300,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc::now()
    }

    fn good_sample(t: DateTime<Utc>) -> Sample {
        let mut s = Sample::reachable("m", t, 50.0, 0.0);
        s.jitter_ms = Some(5.0);
        s
    }

    fn bad_sample(t: DateTime<Utc>) -> Sample {
        let mut s = Sample::reachable("m", t, 800.0, 20.0);
        s.jitter_ms = Some(100.0);
        s
    }

    // ─── Instant Score ──────────────────────────────────────────────────

    #[test]
    fn empty_window_has_no_score() {
        let scoring = ScoringConfig::default();
        assert!(score(&[], &params(&scoring), None).is_none());
    }

    #[test]
    fn ok_targets_score_100() {
        let scoring = ScoringConfig::default();
        let s = score(&[good_sample(t0())], &params(&scoring), None).unwrap();
        assert!((s.instant - 100.0).abs() < 1e-9, "got {}", s.instant);
    }

    #[test]
    fn bad_targets_score_0() {
        let scoring = ScoringConfig::default();
        let s = score(&[bad_sample(t0())], &params(&scoring), None).unwrap();
        assert!(s.instant.abs() < 1e-9, "got {}", s.instant);
    }

    #[test]
    fn values_beyond_bad_clamp_to_zero() {
        let scoring = ScoringConfig::default();
        let mut sample = Sample::reachable("m", t0(), 5_000.0, 90.0);
        sample.jitter_ms = Some(500.0);
        let s = score(&[sample], &params(&scoring), None).unwrap();
        assert!(s.instant.abs() < 1e-9);
        assert!(s.smoothed >= 0.0 && s.smoothed <= 100.0);
    }

    #[test]
    fn missing_factors_are_excluded_not_zeroed() {
        let scoring = ScoringConfig::default();
        // Latency only, right at the ok target: perfect score even though
        // loss, jitter, and obstruction are absent.
        let mut sample = Sample::reachable("m", t0(), 50.0, 0.0);
        sample.loss_pct = None;
        let s = score(&[sample], &params(&scoring), None).unwrap();
        assert!((s.instant - 100.0).abs() < 1e-9);
        assert_eq!(s.reasons.len(), 1);
        assert_eq!(s.reasons[0].factor, "latency");
    }

    #[test]
    fn obstruction_uses_window_mean() {
        let scoring = ScoringConfig::default();
        let base = t0();
        let window: Vec<Sample> = (0..4)
            .map(|i| {
                let mut s = good_sample(base + chrono::Duration::seconds(i));
                s.obstruction_pct = Some(i as f64 * 2.0); // mean 3.0
                s
            })
            .collect();
        let s = score(&window, &params(&scoring), None).unwrap();
        let obstruction = s
            .reasons
            .iter()
            .find(|r| r.factor == "obstruction")
            .unwrap();
        // mean 3.0 against ok=0 bad=10 → norm 0.7 of its weight share.
        let expected = 0.25 * 0.7 / (0.30 + 0.30 + 0.15 + 0.25);
        assert!((obstruction.contribution - expected).abs() < 1e-9);
    }

    #[test]
    fn reachability_only_window_scores_by_reachability() {
        let scoring = ScoringConfig::default();
        let mut sample = Sample::reachable("m", t0(), 0.0, 0.0);
        sample.latency_ms = None;
        sample.loss_pct = None;
        let s = score(&[sample], &params(&scoring), None).unwrap();
        assert!((s.instant - 100.0).abs() < 1e-9);

        let unreachable = Sample::unreachable("m", t0(), "probe_timeout");
        let s = score(&[unreachable], &params(&scoring), None).unwrap();
        assert!(s.instant.abs() < 1e-9);
    }

    // ─── Purity ─────────────────────────────────────────────────────────

    #[test]
    fn score_is_pure() {
        let scoring = ScoringConfig::default();
        let window = vec![good_sample(t0()), bad_sample(t0())];
        let a = score(&window, &params(&scoring), Some(42.0)).unwrap();
        let b = score(&window, &params(&scoring), Some(42.0)).unwrap();
        assert_eq!(a, b);
    }

    // ─── Smoothing ──────────────────────────────────────────────────────

    #[test]
    fn first_sample_seeds_ewma() {
        let scoring = ScoringConfig::default();
        let s = score(&[good_sample(t0())], &params(&scoring), None).unwrap();
        assert!((s.smoothed - s.instant).abs() < 1e-9);
    }

    #[test]
    fn ewma_blends_with_previous() {
        let scoring = ScoringConfig::default();
        let s = score(&[good_sample(t0())], &params(&scoring), Some(0.0)).unwrap();
        // α=0.2, instant=100, prev=0 → 20.
        assert!((s.smoothed - 20.0).abs() < 1e-9);
    }

    #[test]
    fn smoothed_stays_in_bounds() {
        let scoring = ScoringConfig::default();
        let mut prev = None;
        for _ in 0..50 {
            let s = score(&[bad_sample(t0())], &params(&scoring), prev).unwrap();
            assert!((0.0..=100.0).contains(&s.smoothed));
            prev = Some(s.smoothed);
        }
    }

    // ─── Classification ─────────────────────────────────────────────────

    #[test]
    fn classification_tiers() {
        let scoring = ScoringConfig::default();
        let window = [good_sample(t0())];
        assert_eq!(classify(90.0, &window, &scoring), HealthClass::Healthy);
        assert_eq!(classify(65.0, &window, &scoring), HealthClass::Degraded);
        assert_eq!(classify(30.0, &window, &scoring), HealthClass::Failing);
        assert_eq!(classify(10.0, &window, &scoring), HealthClass::Down);
    }

    #[test]
    fn recent_unreachable_caps_at_failing() {
        let scoring = ScoringConfig::default();
        let base = t0();
        let window = vec![
            good_sample(base),
            Sample::unreachable("m", base + chrono::Duration::seconds(1), "probe_timeout"),
            good_sample(base + chrono::Duration::seconds(2)),
        ];
        assert_eq!(classify(95.0, &window, &scoring), HealthClass::Failing);
    }

    #[test]
    fn consecutive_unreachable_is_down() {
        let scoring = ScoringConfig::default();
        let base = t0();
        let window: Vec<Sample> = (0..3)
            .map(|i| Sample::unreachable("m", base + chrono::Duration::seconds(i), "timeout"))
            .collect();
        assert_eq!(classify(95.0, &window, &scoring), HealthClass::Down);
    }

    // ─── Predictive Override ────────────────────────────────────────────

    #[test]
    fn imminent_reboot_forces_failing() {
        let scoring = ScoringConfig::default();
        let mut sample = good_sample(t0());
        sample
            .extra
            .insert(extra_keys::REBOOT_IN_S.into(), serde_json::Value::from(280));
        let s = score(&[sample], &params(&scoring), Some(95.0)).unwrap();
        assert_eq!(s.class, HealthClass::Failing);
        assert_eq!(s.reasons[0].factor, "predictive:reboot_imminent");
    }

    #[test]
    fn distant_reboot_is_ignored() {
        let scoring = ScoringConfig::default();
        let mut sample = good_sample(t0());
        sample
            .extra
            .insert(extra_keys::REBOOT_IN_S.into(), serde_json::Value::from(900));
        let s = score(&[sample], &params(&scoring), Some(95.0)).unwrap();
        assert_eq!(s.class, HealthClass::Healthy);
        assert!(!has_predictive_reason(&s));
    }

    #[test]
    fn failed_self_test_forces_down() {
        let scoring = ScoringConfig::default();
        let mut sample = good_sample(t0());
        sample.extra.insert(
            extra_keys::HARDWARE_SELF_TEST_PASSED.into(),
            serde_json::Value::from(false),
        );
        let s = score(&[sample], &params(&scoring), Some(95.0)).unwrap();
        assert_eq!(s.class, HealthClass::Down);
        assert_eq!(s.reasons[0].factor, "predictive:hardware_self_test_failed");
    }

    #[test]
    fn thermal_risk_forces_failing() {
        let scoring = ScoringConfig::default();
        let mut sample = good_sample(t0());
        sample.extra.insert(
            extra_keys::THERMAL_SHUTDOWN_RISK.into(),
            serde_json::Value::from(true),
        );
        let s = score(&[sample], &params(&scoring), Some(95.0)).unwrap();
        assert_eq!(s.class, HealthClass::Failing);
        assert!(has_predictive_reason(&s));
    }

    #[test]
    fn predictive_disabled_ignores_conditions() {
        let scoring = ScoringConfig::default();
        let mut sample = good_sample(t0());
        sample.extra.insert(
            extra_keys::HARDWARE_SELF_TEST_PASSED.into(),
            serde_json::Value::from(false),
        );
        let mut p = params(&scoring);
        p.predictive = false;
        let s = score(&[sample], &p, Some(95.0)).unwrap();
        assert_eq!(s.class, HealthClass::Healthy);
    }

    #[test]
    fn predictive_never_upgrades_class() {
        let scoring = ScoringConfig::default();
        let base = t0();
        // Already down from consecutive unreachable samples; a reboot
        // warning must not lift it to failing.
        let mut window: Vec<Sample> = (0..3)
            .map(|i| Sample::unreachable("m", base + chrono::Duration::seconds(i), "timeout"))
            .collect();
        window[2]
            .extra
            .insert(extra_keys::REBOOT_IN_S.into(), serde_json::Value::from(100));
        let s = score(&window, &params(&scoring), Some(95.0)).unwrap();
        assert_eq!(s.class, HealthClass::Down);
    }
}
