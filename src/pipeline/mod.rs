//! Per-proposition evaluation and the batch loop.
//!
//! Every candidate is trained and scored in isolation: nothing learned for
//! one proposition leaks into another, so the batch runs on the rayon pool
//! with no shared mutable state.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::db::models::{GameLog, PropCandidate, PropPrediction, Side};
use crate::error::ModelError;
use crate::model::calibration::{blend_with_market, clamp_calibrated, clamp_implied, market_weight};
use crate::model::ev::{
    american_to_decimal, confidence_score, expected_value, implied_probability, kelly_adjusted_ev,
    kelly_fraction,
};
use crate::model::features::DEFAULT_DECAY_HALF_LIFE;
use crate::model::{
    label_outcomes, ClassifierConfig, FeatureBuilder, ProbabilityInterval, PropClassifier,
    StatColumns,
};

pub const DEFAULT_MIN_GAMES: usize = 10;
pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 0.95;

/// Distance of the market anchor for interval bounds from the implied
/// probability.
const BOUND_ANCHOR_OFFSET: f64 = 0.10;
const LOWER_BOUND_RANGE: (f64, f64) = (0.05, 0.70);
const UPPER_BOUND_RANGE: (f64, f64) = (0.15, 0.80);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub min_games: usize,
    /// Skip Under propositions entirely.
    pub overs_only: bool,
    pub confidence_level: f64,
    pub decay_half_life: f64,
    pub max_props: Option<usize>,
    pub classifier: ClassifierConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_games: DEFAULT_MIN_GAMES,
            overs_only: true,
            confidence_level: DEFAULT_CONFIDENCE_LEVEL,
            decay_half_life: DEFAULT_DECAY_HALF_LIFE,
            max_props: None,
            classifier: ClassifierConfig::default(),
        }
    }
}

/// Train a model for one proposition and score it.
///
/// `Ok(None)` means the candidate was deliberately skipped (unknown or
/// filtered side, too little history, nothing left after alignment).
pub fn evaluate_prop(
    candidate: &PropCandidate,
    log: &GameLog,
    config: &PipelineConfig,
) -> Result<Option<PropPrediction>, ModelError> {
    let label = format!(
        "{} {} {} {}",
        candidate.player, candidate.prop, candidate.side, candidate.line
    );
    match candidate.side {
        Side::Unknown => {
            info!("Skipping {}: unknown side", label);
            return Ok(None);
        }
        Side::Under if config.overs_only => {
            info!("Skipping {}: only overs are evaluated", label);
            return Ok(None);
        }
        _ => {}
    }
    if log.len() < config.min_games {
        info!(
            "Skipping {}: {} historical games (need {})",
            label,
            log.len(),
            config.min_games
        );
        return Ok(None);
    }

    let stat = StatColumns::resolve(log, candidate.prop)?;
    let builder = FeatureBuilder::new(config.decay_half_life);
    let matrix = builder.build(log, &stat, Some(candidate.line));
    let labels = label_outcomes(log, &stat, candidate.line, candidate.side)?;

    let aligned: Vec<usize> = labels
        .iter()
        .enumerate()
        .filter_map(|(i, l)| l.map(|_| i))
        .collect();
    if aligned.is_empty() {
        info!("Skipping {}: no labelled games after alignment", label);
        return Ok(None);
    }
    let training = matrix.select_rows(&aligned);
    let y: Vec<f64> = labels.iter().flatten().map(|&l| f64::from(l)).collect();

    let mut classifier = PropClassifier::new(config.classifier);
    classifier.fit(&training, &y, Some(training.weights.as_slice()))?;

    let upcoming = builder.build_upcoming(log, &stat, Some(candidate.line));
    let interval = classifier.predict_with_interval(&upcoming, config.confidence_level)?;

    let decimal_odds = american_to_decimal(candidate.odds);
    let implied = implied_probability(decimal_odds);
    let market = clamp_implied(Some(implied));
    let blended = blend_interval(interval, market);

    let ev = expected_value(blended.point, decimal_odds, market);
    let ev_lower = expected_value(blended.lower, decimal_odds, market);
    let ev_upper = expected_value(blended.upper, decimal_odds, market);
    let kelly = kelly_fraction(blended.point, decimal_odds);

    let prediction = PropPrediction {
        id: None,
        player: candidate.player.clone(),
        prop: candidate.prop,
        line: candidate.line,
        side: candidate.side,
        odds: candidate.odds,
        decimal_odds,
        implied_probability: implied,
        model_probability: blended.point,
        probability_ci_lower: blended.lower,
        probability_ci_upper: blended.upper,
        edge: blended.point - implied,
        expected_value: ev,
        ev_ci_lower: ev_lower,
        ev_ci_upper: ev_upper,
        kelly_fraction: kelly,
        kelly_adjusted_ev: kelly_adjusted_ev(ev, kelly),
        confidence_score: confidence_score(training.len(), blended.lower, blended.upper),
        historical_games: log.len() as i64,
        training_samples: classifier.training_samples().unwrap_or(training.len()) as i64,
        game_date: candidate.game_date,
        generated_at: Utc::now(),
    };
    info!(
        "{}: probability {:.3} [{:.3}, {:.3}], EV {:.3} [{:.3}, {:.3}], edge {:.3}",
        label,
        prediction.model_probability,
        prediction.probability_ci_lower,
        prediction.probability_ci_upper,
        prediction.expected_value,
        prediction.ev_ci_lower,
        prediction.ev_ci_upper,
        prediction.edge
    );
    Ok(Some(prediction))
}

/// Market reconciliation of a calibrated interval.
///
/// The point goes through the calibrator's market blend and final clamp.
/// When that blend fires, the bounds move by the same weight toward
/// `implied ∓ 0.10`. Bounds are then clamped to their own ranges.
pub fn blend_interval(interval: ProbabilityInterval, implied: Option<f64>) -> ProbabilityInterval {
    let weight = market_weight(interval.point, implied);
    let point = clamp_calibrated(blend_with_market(interval.point, implied));

    let (mut lower, mut upper) = (interval.lower, interval.upper);
    if let Some(m) = clamp_implied(implied).filter(|_| weight > 0.0) {
        lower = (1.0 - weight) * lower + weight * (m - BOUND_ANCHOR_OFFSET).max(0.05);
        upper = (1.0 - weight) * upper + weight * (m + BOUND_ANCHOR_OFFSET).min(0.95);
    }

    ProbabilityInterval {
        point,
        lower: clamp_nan_safe(lower, LOWER_BOUND_RANGE),
        upper: clamp_nan_safe(upper, UPPER_BOUND_RANGE),
    }
}

fn clamp_nan_safe(value: f64, (lo, hi): (f64, f64)) -> f64 {
    if value.is_nan() {
        value
    } else {
        value.clamp(lo, hi)
    }
}

/// Score every candidate that has a game log, skipping failures, and return
/// the survivors ranked best first, all stamped with one run timestamp.
///
/// With `overs_only` the feed is narrowed to Over rows first; `max_props`
/// then caps how many of the remaining rows are evaluated, in feed order.
pub fn evaluate_batch(
    candidates: &[PropCandidate],
    logs: &HashMap<String, GameLog>,
    config: &PipelineConfig,
) -> Vec<PropPrediction> {
    let generated_at = Utc::now();
    let selected = select_candidates(candidates, config);
    if selected.len() < candidates.len() {
        info!(
            "Processing {} of {} candidate props",
            selected.len(),
            candidates.len()
        );
    }

    let mut predictions: Vec<PropPrediction> = selected
        .par_iter()
        .filter_map(|candidate| {
            let Some(log) = logs.get(&candidate.player) else {
                info!("Skipping {}: no historical games on file", candidate.player);
                return None;
            };
            match evaluate_prop(candidate, log, config) {
                Ok(prediction) => prediction,
                Err(e) => {
                    warn!(
                        "Failed to evaluate {} {} {}: {}",
                        candidate.player, candidate.prop, candidate.line, e
                    );
                    None
                }
            }
        })
        .collect();

    rank_predictions(&mut predictions);
    for prediction in &mut predictions {
        prediction.generated_at = generated_at;
    }
    info!(
        "Evaluated {} of {} candidate props",
        predictions.len(),
        selected.len()
    );
    predictions
}

fn select_candidates<'a>(
    candidates: &'a [PropCandidate],
    config: &PipelineConfig,
) -> Vec<&'a PropCandidate> {
    candidates
        .iter()
        .filter(|c| !config.overs_only || c.side == Side::Over)
        .take(config.max_props.unwrap_or(usize::MAX))
        .collect()
}

/// Drop predictions for games before `since` (or with no game date).
pub fn retain_games_since(predictions: &mut Vec<PropPrediction>, since: NaiveDate) {
    predictions.retain(|p| p.game_date.is_some_and(|d| d >= since));
}

/// Best first by Kelly-adjusted EV, then raw EV; NaN sorts last.
pub fn rank_predictions(predictions: &mut [PropPrediction]) {
    predictions.sort_by(|a, b| {
        descending_nan_last(a.kelly_adjusted_ev, b.kelly_adjusted_ev)
            .then_with(|| descending_nan_last(a.expected_value, b.expected_value))
    });
}

fn descending_nan_last(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.total_cmp(&a),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{AmericanOdds, GameRecord, PropType};
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn rising_log(player: &str, n: usize) -> GameLog {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let games = (0..n)
            .map(|i| GameRecord {
                player: player.to_string(),
                game_date: start + chrono::Duration::days(i as i64 * 2),
                stats: BTreeMap::from([
                    ("pts".to_string(), 10.0 + i as f64),
                    ("reb".to_string(), (i % 4) as f64 + 3.0),
                ]),
            })
            .collect();
        GameLog::new(player, games)
    }

    fn candidate(player: &str, prop: PropType, line: f64, side: Side) -> PropCandidate {
        PropCandidate {
            player: player.to_string(),
            prop,
            line,
            side,
            odds: AmericanOdds::Line(-110),
            game_date: NaiveDate::from_ymd_opt(2024, 3, 1),
        }
    }

    fn fast_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.classifier.forest.n_trees = 40;
        config
    }

    #[test]
    fn end_to_end_over_prop() {
        let log = rising_log("Rising Star", 15);
        let c = candidate("Rising Star", PropType::Points, 20.5, Side::Over);
        let p = evaluate_prop(&c, &log, &fast_config()).unwrap().unwrap();

        assert!((0.10..=0.75).contains(&p.model_probability));
        assert!(p.expected_value.is_finite());
        assert!(p.kelly_fraction >= 0.0);
        assert_relative_eq!(p.decimal_odds, 1.0 + 100.0 / 110.0, epsilon = 1e-12);
        assert_relative_eq!(p.edge, p.model_probability - p.implied_probability, epsilon = 1e-12);
        assert!((0.05..=0.70).contains(&p.probability_ci_lower));
        assert!((0.15..=0.80).contains(&p.probability_ci_upper));
        assert!((0.0..=1.0).contains(&p.confidence_score));
        assert_eq!(p.historical_games, 15);
        assert_eq!(p.game_date, c.game_date);
    }

    #[test]
    fn skips_filtered_candidates() {
        let log = rising_log("P", 15);
        let config = fast_config();
        let under = candidate("P", PropType::Points, 20.5, Side::Under);
        assert!(evaluate_prop(&under, &log, &config).unwrap().is_none());
        let unknown = candidate("P", PropType::Points, 20.5, Side::Unknown);
        assert!(evaluate_prop(&unknown, &log, &config).unwrap().is_none());

        let short = rising_log("P", 9);
        let over = candidate("P", PropType::Points, 12.5, Side::Over);
        assert!(evaluate_prop(&over, &short, &config).unwrap().is_none());
    }

    #[test]
    fn unders_run_when_filter_is_off() {
        let log = rising_log("P", 15);
        let config = PipelineConfig {
            overs_only: false,
            ..fast_config()
        };
        let under = candidate("P", PropType::Points, 20.5, Side::Under);
        let p = evaluate_prop(&under, &log, &config).unwrap().unwrap();
        assert_eq!(p.side, Side::Under);
        assert!((0.10..=0.75).contains(&p.model_probability));
    }

    #[test]
    fn unresolved_prop_is_an_error() {
        let log = rising_log("P", 15);
        let threes = candidate("P", PropType::Threes, 1.5, Side::Over);
        assert!(matches!(
            evaluate_prop(&threes, &log, &fast_config()),
            Err(ModelError::UnresolvedColumn { .. })
        ));
    }

    #[test]
    fn constant_history_still_produces_a_bounded_prediction() {
        // Never cleared 30.5: baseline 0, then pulled toward the market.
        let log = rising_log("P", 12);
        let c = candidate("P", PropType::Points, 30.5, Side::Over);
        let p = evaluate_prop(&c, &log, &fast_config()).unwrap().unwrap();
        let implied = 1.0 / (1.0 + 100.0 / 110.0);
        assert_relative_eq!(p.model_probability, 0.4 * implied, epsilon = 1e-12);
        // Baseline is the mean over every labelled game.
        assert_eq!(p.training_samples, 12);
    }

    #[test]
    fn off_odds_propagate_nan() {
        let log = rising_log("P", 15);
        let mut c = candidate("P", PropType::Points, 20.5, Side::Over);
        c.odds = AmericanOdds::Off;
        let p = evaluate_prop(&c, &log, &fast_config()).unwrap().unwrap();
        assert!(p.decimal_odds.is_nan());
        assert!(p.expected_value.is_nan());
        assert!(p.kelly_fraction.is_nan());
        assert!(p.edge.is_nan());
        assert!((0.10..=0.75).contains(&p.model_probability));
    }

    #[test]
    fn blend_interval_moves_bounds_with_point() {
        let interval = ProbabilityInterval {
            point: 0.75,
            lower: 0.60,
            upper: 0.75,
        };
        let b = blend_interval(interval, Some(0.40));
        assert_relative_eq!(b.point, 0.6 * 0.75 + 0.4 * 0.40, epsilon = 1e-12);
        assert_relative_eq!(b.lower, 0.6 * 0.60 + 0.4 * 0.30, epsilon = 1e-12);
        assert_relative_eq!(b.upper, 0.6 * 0.75 + 0.4 * 0.50, epsilon = 1e-12);

        let close = blend_interval(interval, Some(0.70));
        assert_relative_eq!(close.point, 0.75);
        assert_relative_eq!(close.lower, 0.60);
        assert_relative_eq!(close.upper, 0.75);

        let none = blend_interval(
            ProbabilityInterval {
                point: 0.5,
                lower: 0.0,
                upper: 1.0,
            },
            None,
        );
        assert_relative_eq!(none.lower, 0.05);
        assert_relative_eq!(none.upper, 0.80);
    }

    #[test]
    fn batch_skips_bad_candidates_and_ranks() {
        let mut logs = HashMap::new();
        logs.insert("A".to_string(), rising_log("A", 15));
        logs.insert("B".to_string(), rising_log("B", 15));
        let candidates = vec![
            candidate("A", PropType::Points, 20.5, Side::Over),
            candidate("Nobody", PropType::Points, 20.5, Side::Over),
            candidate("A", PropType::Threes, 1.5, Side::Over),
            candidate("B", PropType::Rebounds, 4.5, Side::Over),
            candidate("B", PropType::Points, 15.5, Side::Unknown),
        ];
        let out = evaluate_batch(&candidates, &logs, &fast_config());
        assert_eq!(out.len(), 2);
        assert!(out.windows(2).all(|w| {
            descending_nan_last(w[0].kelly_adjusted_ev, w[1].kelly_adjusted_ev) != Ordering::Greater
        }));

        let stamp = out[0].generated_at;
        assert!(out.iter().all(|p| p.generated_at == stamp));
    }

    #[test]
    fn max_props_caps_the_feed_before_evaluation() {
        let mut logs = HashMap::new();
        logs.insert("A".to_string(), rising_log("A", 15));
        let candidates = vec![
            candidate("A", PropType::Points, 20.5, Side::Under),
            candidate("Nobody", PropType::Points, 20.5, Side::Over),
            candidate("A", PropType::Points, 20.5, Side::Over),
            candidate("A", PropType::Rebounds, 4.5, Side::Over),
        ];
        let limited = |n| PipelineConfig {
            max_props: Some(n),
            ..fast_config()
        };

        // Unders are filtered out before the cap; the first Over has no log.
        assert!(evaluate_batch(&candidates, &logs, &limited(1)).is_empty());
        let two = evaluate_batch(&candidates, &logs, &limited(2));
        assert_eq!(two.len(), 1);
        assert_eq!(two[0].prop, PropType::Points);
        assert_eq!(evaluate_batch(&candidates, &logs, &limited(3)).len(), 2);
    }

    #[test]
    fn stored_batch_lists_in_rank_order() {
        let mut logs = HashMap::new();
        logs.insert("A".to_string(), rising_log("A", 15));
        logs.insert("B".to_string(), rising_log("B", 15));
        let candidates = vec![
            candidate("A", PropType::Points, 20.5, Side::Over),
            candidate("A", PropType::Rebounds, 4.5, Side::Over),
            candidate("B", PropType::Points, 15.5, Side::Over),
            candidate("B", PropType::Points, 30.5, Side::Over),
        ];
        let out = evaluate_batch(&candidates, &logs, &fast_config());
        assert_eq!(out.len(), 4);

        let db = crate::db::Database::open_in_memory().unwrap();
        db.insert_predictions(&out).unwrap();
        let listed = db.list_latest_predictions(10).unwrap();
        let key = |p: &PropPrediction| (p.player.clone(), p.prop, p.line.to_bits());
        assert_eq!(
            listed.iter().map(key).collect::<Vec<_>>(),
            out.iter().map(key).collect::<Vec<_>>()
        );
    }

    #[test]
    fn retain_games_since_drops_old_and_undated() {
        let day = |d| NaiveDate::from_ymd_opt(2024, 3, d).unwrap();
        let mut preds = vec![ranked(0.1, 0.1), ranked(0.2, 0.2), ranked(0.3, 0.3)];
        preds[0].game_date = Some(day(1));
        preds[1].game_date = Some(day(5));
        retain_games_since(&mut preds, day(3));
        assert_eq!(preds.len(), 1);
        assert_eq!(preds[0].game_date, Some(day(5)));
    }

    fn ranked(kae: f64, ev: f64) -> PropPrediction {
        PropPrediction {
            id: None,
            player: format!("{kae}/{ev}"),
            prop: PropType::Points,
            line: 10.5,
            side: Side::Over,
            odds: AmericanOdds::Line(100),
            decimal_odds: 2.0,
            implied_probability: 0.5,
            model_probability: 0.5,
            probability_ci_lower: 0.4,
            probability_ci_upper: 0.6,
            edge: 0.0,
            expected_value: ev,
            ev_ci_lower: ev,
            ev_ci_upper: ev,
            kelly_fraction: 0.0,
            kelly_adjusted_ev: kae,
            confidence_score: 0.5,
            historical_games: 10,
            training_samples: 8,
            game_date: None,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn ranking_puts_nan_last_and_breaks_ties_on_ev() {
        let mut preds = vec![
            ranked(f64::NAN, 1.0),
            ranked(0.01, 0.05),
            ranked(0.0, 0.2),
            ranked(0.0, -0.1),
            ranked(0.03, 0.1),
        ];
        rank_predictions(&mut preds);
        let keys: Vec<(f64, f64)> = preds
            .iter()
            .map(|p| (p.kelly_adjusted_ev, p.expected_value))
            .collect();
        assert_eq!(keys[0], (0.03, 0.1));
        assert_eq!(keys[1], (0.01, 0.05));
        assert_eq!(keys[2], (0.0, 0.2));
        assert_eq!(keys[3], (0.0, -0.1));
        assert!(keys[4].0.is_nan());
    }
}
