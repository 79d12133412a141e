//! Probability calibration.
//!
//! Raw ensemble output is pulled away from certainty by a fixed piecewise
//! linear remap, optionally reconciled with the market's implied
//! probability, then hard-clamped:
//!
//!   raw > 0.90          → [0.65, 0.75]
//!   0.75 < raw ≤ 0.90   → [0.60, 0.65]
//!   raw < 0.10          → [0.10, 0.20]
//!   0.10 ≤ raw ≤ 0.75   → [0.20, 0.60]
//!
//! If the result sits more than `MARKET_GAP` away from the implied
//! probability it becomes `0.6·calibrated + 0.4·implied`. Output is always
//! in `[FLOOR, CEILING]` unless the input is NaN, which propagates.

const EPS: f64 = 1e-6;

pub const FLOOR: f64 = 0.10;
pub const CEILING: f64 = 0.75;
pub const MARKET_GAP: f64 = 0.20;
pub const MARKET_WEIGHT: f64 = 0.40;
pub const IMPLIED_MIN: f64 = 0.05;
pub const IMPLIED_MAX: f64 = 0.95;

/// Piecewise remap of a raw probability. Inputs outside `[0, 1]` are
/// clamped first.
pub fn remap(raw: f64) -> f64 {
    if raw.is_nan() {
        return f64::NAN;
    }
    let p = raw.clamp(0.0, 1.0);
    if p > 0.90 {
        0.65 + (p - 0.90) / 0.10 * 0.10
    } else if p > 0.75 {
        0.60 + (p - 0.75) / 0.15 * 0.05
    } else if p < 0.10 {
        0.10 + p / 0.10 * 0.10
    } else {
        0.20 + (p - 0.10) / 0.65 * 0.40
    }
}

/// Clamp an implied probability into the range the blend trusts. NaN and
/// absent both mean "no market".
pub fn clamp_implied(implied: Option<f64>) -> Option<f64> {
    implied
        .filter(|p| !p.is_nan())
        .map(|p| p.clamp(IMPLIED_MIN, IMPLIED_MAX))
}

/// Weight placed on the market for a given calibrated value, 0 when the
/// two agree within `MARKET_GAP`.
pub fn market_weight(calibrated: f64, implied: Option<f64>) -> f64 {
    match clamp_implied(implied) {
        Some(m) if (calibrated - m).abs() > MARKET_GAP => MARKET_WEIGHT,
        _ => 0.0,
    }
}

/// Market reconciliation step, without the final clamp.
pub fn blend_with_market(calibrated: f64, implied: Option<f64>) -> f64 {
    let w = market_weight(calibrated, implied);
    match clamp_implied(implied) {
        Some(m) if w > 0.0 => (1.0 - w) * calibrated + w * m,
        _ => calibrated,
    }
}

pub fn clamp_calibrated(p: f64) -> f64 {
    if p.is_nan() {
        p
    } else {
        p.clamp(FLOOR, CEILING)
    }
}

/// Full calibration: remap, market blend, clamp.
pub fn calibrate(raw: f64, implied: Option<f64>) -> f64 {
    clamp_calibrated(blend_with_market(remap(raw), implied))
}

fn clamp_prob(p: f64) -> f64 {
    p.clamp(EPS, 1.0 - EPS)
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        let z = (-x).exp();
        1.0 / (1.0 + z)
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

pub(crate) fn logit(p: f64) -> f64 {
    let p = clamp_prob(p);
    (p / (1.0 - p)).ln()
}

fn logloss(p: f64, y: f64) -> f64 {
    let p = clamp_prob(p);
    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
}

/// Mean log loss over `(probability, outcome)` pairs; `None` when empty.
pub fn mean_log_loss(samples: &[(f64, f64)]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let total: f64 = samples.iter().map(|(p, y)| logloss(*p, *y)).sum();
    Some(total / samples.len() as f64)
}

/// Mean squared error of the probabilities; `None` when empty.
pub fn brier_score(samples: &[(f64, f64)]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let total: f64 = samples.iter().map(|(p, y)| (p - y).powi(2)).sum();
    Some(total / samples.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn remap_literal_pairs() {
        assert_relative_eq!(remap(1.0), 0.75, epsilon = 1e-12);
        assert_relative_eq!(remap(0.95), 0.70, epsilon = 1e-12);
        assert_relative_eq!(remap(0.90), 0.65, epsilon = 1e-12);
        assert_relative_eq!(remap(0.825), 0.625, epsilon = 1e-12);
        assert_relative_eq!(remap(0.75), 0.60, epsilon = 1e-12);
        assert_relative_eq!(remap(0.425), 0.40, epsilon = 1e-12);
        assert_relative_eq!(remap(0.10), 0.20, epsilon = 1e-12);
        assert_relative_eq!(remap(0.05), 0.15, epsilon = 1e-12);
        assert_relative_eq!(remap(0.0), 0.10, epsilon = 1e-12);
    }

    #[test]
    fn calibrate_literal_pairs() {
        // No market: plain remap.
        assert_relative_eq!(calibrate(0.95, None), 0.70, epsilon = 1e-12);
        // 0.70 vs 0.40 is a 0.30 gap → 0.6·0.70 + 0.4·0.40 = 0.58.
        assert_relative_eq!(calibrate(0.95, Some(0.40)), 0.58, epsilon = 1e-12);
        // Within the gap: untouched.
        assert_relative_eq!(calibrate(0.425, Some(0.52)), 0.40, epsilon = 1e-12);
        // Implied is clamped to 0.95 first: 0.6·0.20 + 0.4·0.95 = 0.50.
        assert_relative_eq!(calibrate(0.10, Some(0.99)), 0.50, epsilon = 1e-12);
        // Low side pulled toward the market.
        assert_relative_eq!(calibrate(0.0, Some(0.60)), 0.6 * 0.10 + 0.4 * 0.60, epsilon = 1e-12);
    }

    #[test]
    fn output_stays_in_range() {
        for i in 0..=1000 {
            let raw = i as f64 / 1000.0;
            for implied in [None, Some(0.0), Some(0.3), Some(0.5), Some(0.9), Some(1.0)] {
                let p = calibrate(raw, implied);
                assert!((FLOOR..=CEILING).contains(&p), "raw={raw} implied={implied:?} p={p}");
            }
        }
    }

    #[test]
    fn remap_is_monotone() {
        let mut prev = remap(0.0);
        for i in 1..=1000 {
            let next = remap(i as f64 / 1000.0);
            assert!(next >= prev - 1e-12);
            prev = next;
        }
    }

    #[test]
    fn out_of_range_inputs_are_clamped() {
        assert_relative_eq!(remap(1.7), 0.75, epsilon = 1e-12);
        assert_relative_eq!(remap(-0.3), 0.10, epsilon = 1e-12);
    }

    #[test]
    fn nan_policy() {
        assert!(calibrate(f64::NAN, Some(0.5)).is_nan());
        assert_relative_eq!(calibrate(0.95, Some(f64::NAN)), 0.70, epsilon = 1e-12);
        assert_eq!(market_weight(0.7, Some(f64::NAN)), 0.0);
    }

    #[test]
    fn scoring_rules() {
        let samples = [(0.8, 1.0), (0.2, 0.0)];
        assert_relative_eq!(brier_score(&samples).unwrap(), 0.04, epsilon = 1e-12);
        assert_relative_eq!(
            mean_log_loss(&samples).unwrap(),
            -(0.8f64).ln(),
            epsilon = 1e-12
        );
        assert!(brier_score(&[]).is_none());
    }

    #[test]
    fn logit_sigmoid_inverse() {
        assert_relative_eq!(sigmoid(logit(0.3)), 0.3, epsilon = 1e-12);
        assert!((0.0..=1.0).contains(&sigmoid(800.0)));
    }
}
