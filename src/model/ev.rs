//! Odds conversion, expected value and Kelly sizing.
//!
//! All functions take decimal odds `d` (stake included, so `d − 1` is the
//! net profit per unit staked). Unknown odds are carried as NaN and every
//! function below propagates NaN instead of guessing.
//!
//!   EV    = p·(d − 1) − (1 − p)
//!   Kelly = (b·p − q) / b,  b = d − 1,  q = 1 − p

use crate::db::models::AmericanOdds;

/// Disagreement with the market beyond which EV is damped toward it.
pub const EV_MARKET_GAP: f64 = 0.15;
pub const EV_MARKET_SLOPE: f64 = 2.0;
pub const EV_MARKET_MAX_WEIGHT: f64 = 0.40;

/// Rows needed for a full sample-size score.
pub const CONFIDENCE_FULL_SAMPLE: f64 = 50.0;

/// American → decimal odds.
///
/// `+150` → 2.5, `−110` → 1.909…; `Off` and anything with `|o| < 100`
/// (not a real American price) → NaN.
pub fn american_to_decimal(odds: AmericanOdds) -> f64 {
    match odds.value() {
        Some(o) if o >= 100 => f64::from(o) / 100.0 + 1.0,
        Some(o) if o <= -100 => 100.0 / f64::from(o).abs() + 1.0,
        _ => f64::NAN,
    }
}

/// Break-even win probability `1/d`.
pub fn implied_probability(decimal_odds: f64) -> f64 {
    if decimal_odds.is_nan() || decimal_odds <= 0.0 {
        return f64::NAN;
    }
    1.0 / decimal_odds
}

fn raw_ev(probability: f64, decimal_odds: f64) -> f64 {
    probability * (decimal_odds - 1.0) - (1.0 - probability)
}

/// Expected value per unit staked, damped toward the market's own EV as
/// the model disagrees with it.
///
/// With `diff = |p − implied|` above `EV_MARKET_GAP`, the market weight is
/// `min(0.40, (diff − 0.15)·2)`. A missing implied probability defaults to
/// `1/d`.
pub fn expected_value(probability: f64, decimal_odds: f64, implied: Option<f64>) -> f64 {
    if probability.is_nan() || decimal_odds.is_nan() {
        return f64::NAN;
    }
    let base = raw_ev(probability, decimal_odds);
    let implied = implied
        .filter(|p| !p.is_nan())
        .unwrap_or_else(|| implied_probability(decimal_odds));
    if implied.is_nan() {
        return base;
    }

    let diff = (probability - implied).abs();
    if diff <= EV_MARKET_GAP {
        return base;
    }
    let weight = ((diff - EV_MARKET_GAP) * EV_MARKET_SLOPE).min(EV_MARKET_MAX_WEIGHT);
    (1.0 - weight) * base + weight * raw_ev(implied, decimal_odds)
}

/// Full-Kelly stake fraction, floored at 0 and capped at 1.
pub fn kelly_fraction(probability: f64, decimal_odds: f64) -> f64 {
    if probability.is_nan() || decimal_odds.is_nan() {
        return f64::NAN;
    }
    let b = decimal_odds - 1.0;
    if b <= 0.0 {
        return 0.0;
    }
    let q = 1.0 - probability;
    ((b * probability - q) / b).clamp(0.0, 1.0)
}

/// Data-quality score in `[0, 1]`:
/// `0.6·min(1, n/50) + 0.4·max(0, 1 − (upper − lower))`.
///
/// An unknown interval counts as width 1.
pub fn confidence_score(training_rows: usize, lower: f64, upper: f64) -> f64 {
    let sample = (training_rows as f64 / CONFIDENCE_FULL_SAMPLE).min(1.0);
    let width = upper - lower;
    let width = if width.is_nan() { 1.0 } else { width };
    let interval = (1.0 - width).max(0.0);
    (0.6 * sample + 0.4 * interval).clamp(0.0, 1.0)
}

/// Ranking key `EV · clamp(kelly, 0, 1)^1.5`.
pub fn kelly_adjusted_ev(ev: f64, kelly: f64) -> f64 {
    if ev.is_nan() || kelly.is_nan() {
        return f64::NAN;
    }
    ev * kelly.clamp(0.0, 1.0).powf(1.5)
}

/// Settled profit for a stake: win → `stake·(d − 1)`, loss → `−stake`,
/// push (`None`) → 0. NaN when a win has unknown odds.
pub fn profit_loss(outcome: Option<bool>, odds: AmericanOdds, stake: f64) -> f64 {
    match outcome {
        Some(true) => stake * (american_to_decimal(odds) - 1.0),
        Some(false) => -stake,
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_american_to_decimal() {
        assert_relative_eq!(american_to_decimal(AmericanOdds::Line(150)), 2.5, epsilon = 1e-12);
        assert_relative_eq!(
            american_to_decimal(AmericanOdds::Line(-110)),
            1.0 + 100.0 / 110.0,
            epsilon = 1e-12
        );
        assert_relative_eq!(american_to_decimal(AmericanOdds::Line(100)), 2.0, epsilon = 1e-12);
        assert_relative_eq!(american_to_decimal(AmericanOdds::Line(-100)), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_odds_are_nan() {
        assert!(american_to_decimal(AmericanOdds::Off).is_nan());
        assert!(american_to_decimal(AmericanOdds::Line(0)).is_nan());
        assert!(american_to_decimal(AmericanOdds::Line(50)).is_nan());
        assert!(implied_probability(f64::NAN).is_nan());
    }

    #[test]
    fn test_ev_without_disagreement() {
        // Even money at 55%: 0.55·1 − 0.45.
        assert_relative_eq!(expected_value(0.55, 2.0, None), 0.10, epsilon = 1e-12);
    }

    #[test]
    fn test_ev_market_damping() {
        // p = 0.75 vs implied 0.5 → diff 0.25 → weight 0.20.
        let base = 0.75 - 0.25;
        let market = 0.0;
        let ev = expected_value(0.75, 2.0, Some(0.5));
        assert_relative_eq!(ev, 0.8 * base + 0.2 * market, epsilon = 1e-12);
        assert!(ev < raw_ev(0.75, 2.0));
    }

    #[test]
    fn test_ev_market_weight_is_capped() {
        // diff 0.45 → weight min(0.40, 0.60) = 0.40.
        let ev = expected_value(0.95, 2.0, Some(0.5));
        assert_relative_eq!(ev, 0.6 * 0.9 + 0.4 * 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_ev_nan_propagates() {
        assert!(expected_value(0.5, f64::NAN, None).is_nan());
        assert!(expected_value(f64::NAN, 2.0, None).is_nan());
    }

    #[test]
    fn test_kelly() {
        // b = 1, p = 0.6 → 0.2
        assert_relative_eq!(kelly_fraction(0.6, 2.0), 0.2, epsilon = 1e-12);
        assert_relative_eq!(kelly_fraction(0.3, 2.0), 0.0, epsilon = 1e-12);
        assert!(kelly_fraction(0.99, 101.0) <= 1.0);
        assert!(kelly_fraction(0.6, f64::NAN).is_nan());
        assert_relative_eq!(kelly_fraction(0.6, 1.0), 0.0);
    }

    #[test]
    fn test_confidence_score() {
        assert_relative_eq!(confidence_score(50, 0.4, 0.6), 0.6 + 0.4 * 0.8, epsilon = 1e-12);
        assert_relative_eq!(confidence_score(25, 0.0, 1.5), 0.3, epsilon = 1e-12);
        assert_relative_eq!(confidence_score(100, f64::NAN, 0.5), 0.6, epsilon = 1e-12);
    }

    #[test]
    fn test_kelly_adjusted_ev() {
        assert_relative_eq!(kelly_adjusted_ev(0.2, 0.25), 0.2 * 0.125, epsilon = 1e-12);
        assert_relative_eq!(kelly_adjusted_ev(0.2, 0.0), 0.0);
        assert!(kelly_adjusted_ev(f64::NAN, 0.5).is_nan());
    }

    #[test]
    fn test_profit_loss() {
        assert_relative_eq!(
            profit_loss(Some(true), AmericanOdds::Line(-110), 100.0),
            90.909_090_909,
            epsilon = 1e-6
        );
        assert_relative_eq!(profit_loss(Some(true), AmericanOdds::Line(150), 100.0), 150.0);
        assert_relative_eq!(profit_loss(Some(false), AmericanOdds::Line(150), 100.0), -100.0);
        assert_relative_eq!(profit_loss(None, AmericanOdds::Line(150), 100.0), 0.0);
    }
}
