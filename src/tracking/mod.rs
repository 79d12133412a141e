//! Settles stored predictions against the games that were actually played
//! and aggregates the running performance of the model.

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::db::models::{PropPrediction, PropType, Side, TrackedOutcome};
use crate::db::{Database, PredictionRun, ScoreUpdate};
use crate::error::ModelError;
use crate::model::calibration::{brier_score, calibrate, clamp_implied, mean_log_loss};
use crate::model::ev::{
    american_to_decimal, expected_value, implied_probability, kelly_adjusted_ev, kelly_fraction,
    profit_loss,
};
use crate::model::StatColumns;

/// Flat stake every settled bet is scored at.
pub const DEFAULT_STAKE: f64 = 100.0;

/// `Some(true)` win, `Some(false)` loss, `None` push (landed on the line).
///
/// Unlike the training labels, a tie is not a loss here.
pub fn determine_outcome(actual: f64, line: f64, side: Side) -> Result<Option<bool>, ModelError> {
    if actual == line {
        return match side {
            Side::Unknown => Err(ModelError::InvalidSide(side)),
            _ => Ok(None),
        };
    }
    match side {
        Side::Over => Ok(Some(actual > line)),
        Side::Under => Ok(Some(actual < line)),
        Side::Unknown => Err(ModelError::InvalidSide(side)),
    }
}

/// Counters for one tracking run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackingSummary {
    pub candidates: usize,
    pub tracked: usize,
    pub pushes: usize,
    pub not_found: usize,
    pub errors: usize,
}

/// Settle every untracked prediction whose game fell in `[since, until]`.
pub fn track_outcomes(
    db: &Database,
    since: NaiveDate,
    until: NaiveDate,
    stake: f64,
) -> Result<TrackingSummary> {
    let pending = db.list_untracked_predictions(since, until)?;
    let mut summary = TrackingSummary {
        candidates: pending.len(),
        ..Default::default()
    };
    info!("Tracking {} prediction(s) between {} and {}", pending.len(), since, until);

    let today = Utc::now().date_naive();
    for prediction in &pending {
        match settle(db, prediction, stake, today) {
            Ok(Some(outcome)) => {
                if outcome.outcome.is_none() {
                    summary.pushes += 1;
                }
                db.upsert_tracked_outcome(&outcome)?;
                summary.tracked += 1;
            }
            Ok(None) => summary.not_found += 1,
            Err(e) => {
                warn!(
                    "Failed to settle {} {} {} {}: {}",
                    prediction.player, prediction.prop, prediction.side, prediction.line, e
                );
                summary.errors += 1;
            }
        }
    }

    info!(
        "Tracked {} bet(s) ({} push), {} game(s) not found, {} error(s)",
        summary.tracked, summary.pushes, summary.not_found, summary.errors
    );
    Ok(summary)
}

/// `Ok(None)` when the game (or its stat) is not in the store yet.
fn settle(
    db: &Database,
    prediction: &PropPrediction,
    stake: f64,
    today: NaiveDate,
) -> Result<Option<TrackedOutcome>> {
    let (Some(id), Some(game_date)) = (prediction.id, prediction.game_date) else {
        return Ok(None);
    };
    let Some(game) = db.find_game(&prediction.player, game_date)? else {
        debug!("No game for {} on {}", prediction.player, game_date);
        return Ok(None);
    };

    let available: BTreeSet<String> = game.stats.keys().cloned().collect();
    let columns = StatColumns::resolve_columns(&available, prediction.prop)?;
    let Some(actual) = columns.raw.as_deref().and_then(|c| game.value(c)) else {
        debug!("No {} stat for {} on {}", prediction.prop, prediction.player, game_date);
        return Ok(None);
    };

    let outcome = determine_outcome(actual, prediction.line, prediction.side)?;
    let profit = profit_loss(outcome, prediction.odds, stake);

    Ok(Some(TrackedOutcome {
        id: None,
        prediction_id: id,
        player: prediction.player.clone(),
        prop: prediction.prop,
        line: prediction.line,
        side: prediction.side,
        odds: prediction.odds,
        model_probability: finite(prediction.model_probability),
        expected_value: finite(prediction.expected_value),
        actual_value: actual,
        outcome,
        profit_loss: finite(profit),
        game_date,
        result_date: today,
    }))
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

// ── Stored prediction maintenance ─────────────────────────────────────────────

/// Re-run the calibrator over one stored prediction and rederive everything
/// that depends on its probability. `None` when it has no probability.
pub fn rescore(prediction: &PropPrediction) -> Option<ScoreUpdate> {
    let id = prediction.id?;
    if prediction.model_probability.is_nan() {
        return None;
    }
    let decimal_odds = american_to_decimal(prediction.odds);
    let implied = implied_probability(decimal_odds);
    let market = clamp_implied(Some(implied));
    let probability = calibrate(prediction.model_probability, market);
    let ev = expected_value(probability, decimal_odds, market);
    let kelly = kelly_fraction(probability, decimal_odds);
    Some(ScoreUpdate {
        prediction_id: id,
        model_probability: probability,
        expected_value: ev,
        edge: probability - implied,
        kelly_fraction: kelly,
        kelly_adjusted_ev: kelly_adjusted_ev(ev, kelly),
    })
}

/// Counters for one recalibration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecalibrationSummary {
    pub predictions: usize,
    pub tracked_bets: usize,
}

/// Recalibrate every stored prediction and the bets tracked against them.
pub fn recalibrate_history(db: &Database) -> Result<RecalibrationSummary> {
    let updates: Vec<ScoreUpdate> = db
        .list_scored_predictions()?
        .iter()
        .filter_map(rescore)
        .collect();
    let (predictions, tracked_bets) = db.update_prediction_scores(&updates)?;
    info!(
        "Recalibrated {} prediction(s) and {} tracked bet(s)",
        predictions, tracked_bets
    );
    Ok(RecalibrationSummary {
        predictions,
        tracked_bets,
    })
}

/// When the predictions for recent games were generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FreshnessReport {
    pub runs: Vec<PredictionRun>,
    pub latest_generated_on: Option<NaiveDate>,
    /// Nothing in the window was generated on `today`, so it predates the
    /// current model.
    pub stale: bool,
}

/// Inspect predictions for games from `days_back` days ago up to yesterday.
pub fn check_prediction_freshness(
    db: &Database,
    today: NaiveDate,
    days_back: i64,
) -> Result<FreshnessReport> {
    let since = today - chrono::Duration::days(days_back);
    let until = today - chrono::Duration::days(1);
    let runs = db.list_prediction_runs(since, until)?;
    let latest_generated_on = runs.iter().map(|r| r.generated_on).max();
    let stale = latest_generated_on.is_some_and(|d| d < today);

    for run in &runs {
        info!(
            "Game {}: {} prediction(s) generated {} ({} to {})",
            run.game_date, run.count, run.generated_on, run.first_generated, run.last_generated
        );
    }
    match latest_generated_on {
        None => info!("No predictions for games between {} and {}", since, until),
        Some(d) if stale => warn!(
            "Most recent predictions are from {}; regenerate them to score the current model",
            d
        ),
        Some(_) => info!("Recent predictions were generated today"),
    }
    Ok(FreshnessReport {
        runs,
        latest_generated_on,
        stale,
    })
}

// ── Performance metrics ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropBreakdown {
    pub prop: PropType,
    pub wins: usize,
    pub losses: usize,
    pub profit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfitPoint {
    pub date: NaiveDate,
    pub cumulative: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub total_bets: usize,
    pub wins: usize,
    pub losses: usize,
    pub pushes: usize,
    /// Percent of decided bets won
    pub win_rate: f64,
    pub total_profit: f64,
    /// Percent return on the total amount staked
    pub roi: f64,
    pub by_prop: Vec<PropBreakdown>,
    pub over_time: Vec<ProfitPoint>,
    pub brier_score: Option<f64>,
    pub log_loss: Option<f64>,
}

fn round_to(v: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (v * scale).round() / scale
}

/// Aggregate settled bets. Pushes count toward neither wins nor losses and
/// stake nothing; the over-time series is ordered by game date.
pub fn performance_report(outcomes: &[TrackedOutcome], stake: f64) -> PerformanceReport {
    let decided: Vec<&TrackedOutcome> = outcomes.iter().filter(|o| o.outcome.is_some()).collect();
    let pushes = outcomes.len() - decided.len();
    let wins = decided.iter().filter(|o| o.outcome == Some(true)).count();
    let losses = decided.len() - wins;
    let total_profit: f64 = decided.iter().filter_map(|o| o.profit_loss).sum();

    let (win_rate, roi) = if decided.is_empty() {
        (0.0, 0.0)
    } else {
        let n = decided.len() as f64;
        (wins as f64 / n * 100.0, total_profit / (n * stake) * 100.0)
    };

    let mut by_prop: BTreeMap<PropType, PropBreakdown> = BTreeMap::new();
    for o in &decided {
        let entry = by_prop.entry(o.prop).or_insert(PropBreakdown {
            prop: o.prop,
            wins: 0,
            losses: 0,
            profit: 0.0,
        });
        if o.outcome == Some(true) {
            entry.wins += 1;
        } else {
            entry.losses += 1;
        }
        entry.profit += o.profit_loss.unwrap_or(0.0);
    }
    let by_prop = by_prop
        .into_values()
        .map(|mut b| {
            b.profit = round_to(b.profit, 2);
            b
        })
        .collect();

    let mut chronological = decided.clone();
    chronological.sort_by_key(|o| o.game_date);
    let mut running = 0.0;
    let over_time = chronological
        .iter()
        .map(|o| {
            running += o.profit_loss.unwrap_or(0.0);
            ProfitPoint {
                date: o.game_date,
                cumulative: round_to(running, 2),
            }
        })
        .collect();

    let scored: Vec<(f64, f64)> = decided
        .iter()
        .filter_map(|o| {
            let p = o.model_probability.filter(|p| p.is_finite())?;
            Some((p, if o.outcome == Some(true) { 1.0 } else { 0.0 }))
        })
        .collect();

    PerformanceReport {
        total_bets: decided.len(),
        wins,
        losses,
        pushes,
        win_rate: round_to(win_rate, 1),
        total_profit: round_to(total_profit, 2),
        roi: round_to(roi, 1),
        by_prop,
        over_time,
        brier_score: brier_score(&scored),
        log_loss: mean_log_loss(&scored),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{AmericanOdds, GameRecord};
    use approx::assert_relative_eq;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn outcome(prop: PropType, won: Option<bool>, profit: f64, d: u32, p: f64) -> TrackedOutcome {
        TrackedOutcome {
            id: None,
            prediction_id: 1,
            player: "A".into(),
            prop,
            line: 20.5,
            side: Side::Over,
            odds: AmericanOdds::Line(-110),
            model_probability: Some(p),
            expected_value: Some(0.05),
            actual_value: 22.0,
            outcome: won,
            profit_loss: Some(profit),
            game_date: date(d),
            result_date: date(d + 1),
        }
    }

    fn prediction(player: &str, prop: PropType, line: f64, side: Side, d: u32) -> PropPrediction {
        PropPrediction {
            id: None,
            player: player.into(),
            prop,
            line,
            side,
            odds: AmericanOdds::Line(-110),
            decimal_odds: 1.909,
            implied_probability: 0.524,
            model_probability: 0.6,
            probability_ci_lower: 0.5,
            probability_ci_upper: 0.7,
            edge: 0.076,
            expected_value: 0.14,
            ev_ci_lower: 0.0,
            ev_ci_upper: 0.3,
            kelly_fraction: 0.16,
            kelly_adjusted_ev: 0.009,
            confidence_score: 0.6,
            historical_games: 30,
            training_samples: 24,
            game_date: Some(date(d)),
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_determine_outcome() {
        assert_eq!(determine_outcome(25.0, 20.5, Side::Over), Ok(Some(true)));
        assert_eq!(determine_outcome(18.0, 20.5, Side::Over), Ok(Some(false)));
        assert_eq!(determine_outcome(18.0, 20.5, Side::Under), Ok(Some(true)));
        assert_eq!(determine_outcome(20.0, 20.0, Side::Over), Ok(None));
        assert_eq!(determine_outcome(20.0, 20.0, Side::Under), Ok(None));
        assert_eq!(
            determine_outcome(25.0, 20.5, Side::Unknown),
            Err(ModelError::InvalidSide(Side::Unknown))
        );
    }

    #[test]
    fn test_performance_report_totals() {
        let outcomes = vec![
            outcome(PropType::Points, Some(true), 90.91, 3, 0.7),
            outcome(PropType::Points, Some(false), -100.0, 1, 0.6),
            outcome(PropType::Assists, Some(true), 90.91, 2, 0.55),
            outcome(PropType::Assists, None, 0.0, 4, 0.5),
        ];
        let report = performance_report(&outcomes, DEFAULT_STAKE);

        assert_eq!(report.total_bets, 3);
        assert_eq!(report.wins, 2);
        assert_eq!(report.losses, 1);
        assert_eq!(report.pushes, 1);
        assert_relative_eq!(report.win_rate, 66.7);
        assert_relative_eq!(report.total_profit, 81.82);
        assert_relative_eq!(report.roi, 27.3);

        assert_eq!(report.by_prop.len(), 2);
        assert_eq!(report.by_prop[0].prop, PropType::Points);
        assert_eq!(report.by_prop[0].wins, 1);
        assert_eq!(report.by_prop[0].losses, 1);
        assert_relative_eq!(report.by_prop[0].profit, -9.09);

        let dates: Vec<NaiveDate> = report.over_time.iter().map(|p| p.date).collect();
        assert_eq!(dates, vec![date(1), date(2), date(3)]);
        assert_relative_eq!(report.over_time[0].cumulative, -100.0);
        assert_relative_eq!(report.over_time[2].cumulative, 81.82);

        let brier = (0.3f64.powi(2) + 0.6f64.powi(2) + 0.45f64.powi(2)) / 3.0;
        assert_relative_eq!(report.brier_score.unwrap(), brier, epsilon = 1e-12);
        assert!(report.log_loss.unwrap() > 0.0);
    }

    #[test]
    fn test_empty_report() {
        let report = performance_report(&[], DEFAULT_STAKE);
        assert_eq!(report.total_bets, 0);
        assert_relative_eq!(report.win_rate, 0.0);
        assert_relative_eq!(report.roi, 0.0);
        assert!(report.brier_score.is_none());
        assert!(report.over_time.is_empty());
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let outcomes = [outcome(PropType::Points, Some(true), 90.91, 1, 0.6)];
        let report = performance_report(&outcomes, DEFAULT_STAKE);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["totalBets"], 1);
        assert!(json["byProp"].is_array());
        assert_eq!(json["overTime"][0]["date"], "2024-01-01");
    }

    #[test]
    fn test_track_outcomes_settles_and_counts() {
        let db = Database::open_in_memory().unwrap();
        db.insert_game_records(&[
            GameRecord {
                player: "Jane Doe".into(),
                game_date: date(5),
                stats: BTreeMap::from([("pts".to_string(), 24.0), ("reb".to_string(), 7.0)]),
            },
            GameRecord {
                player: "Ann Lee".into(),
                game_date: date(5),
                stats: BTreeMap::from([("pts".to_string(), 15.0)]),
            },
        ])
        .unwrap();
        db.insert_predictions(&[
            prediction("Jane Doe", PropType::Points, 20.5, Side::Over, 5),
            prediction("Jane Doe", PropType::Rebounds, 7.0, Side::Under, 5),
            prediction("Ann Lee", PropType::Points, 15.5, Side::Over, 5),
            prediction("Missing Guy", PropType::Points, 10.5, Side::Over, 5),
        ])
        .unwrap();

        let summary = track_outcomes(&db, date(1), date(10), DEFAULT_STAKE).unwrap();
        assert_eq!(summary.candidates, 4);
        assert_eq!(summary.tracked, 3);
        assert_eq!(summary.pushes, 1);
        assert_eq!(summary.not_found, 1);
        assert_eq!(summary.errors, 0);

        let tracked = db.list_tracked_outcomes().unwrap();
        assert_eq!(tracked.len(), 3);
        let win = tracked
            .iter()
            .find(|o| o.player == "Jane Doe" && o.prop == PropType::Points)
            .unwrap();
        assert_eq!(win.outcome, Some(true));
        assert_relative_eq!(win.profit_loss.unwrap(), 90.909_090_909, epsilon = 1e-6);
        let push = tracked.iter().find(|o| o.prop == PropType::Rebounds).unwrap();
        assert_eq!(push.outcome, None);
        assert_relative_eq!(push.profit_loss.unwrap(), 0.0);

        // Settled rows are not picked up again; the missing one still is.
        let again = track_outcomes(&db, date(1), date(10), DEFAULT_STAKE).unwrap();
        assert_eq!(again.candidates, 1);
        assert_eq!(again.not_found, 1);
    }

    #[test]
    fn test_rescore_recalibrates_and_rederives() {
        let mut p = prediction("A", PropType::Points, 20.5, Side::Over, 5);
        p.id = Some(7);
        p.model_probability = 0.95;
        let u = rescore(&p).unwrap();
        assert_eq!(u.prediction_id, 7);
        let implied = 1.0 / (1.0 + 100.0 / 110.0);
        let expected = calibrate(0.95, Some(implied));
        assert_relative_eq!(u.model_probability, expected, epsilon = 1e-12);
        assert!((0.10..=0.75).contains(&u.model_probability));
        assert_relative_eq!(u.edge, expected - implied, epsilon = 1e-12);
        assert_relative_eq!(
            u.kelly_adjusted_ev,
            kelly_adjusted_ev(u.expected_value, u.kelly_fraction),
            epsilon = 1e-12
        );

        p.model_probability = f64::NAN;
        assert!(rescore(&p).is_none());
        p.model_probability = 0.5;
        p.id = None;
        assert!(rescore(&p).is_none());
    }

    #[test]
    fn test_recalibrate_history_updates_store() {
        let db = Database::open_in_memory().unwrap();
        db.insert_game_records(&[GameRecord {
            player: "Jane Doe".into(),
            game_date: date(5),
            stats: BTreeMap::from([("pts".to_string(), 24.0)]),
        }])
        .unwrap();
        let mut high = prediction("Jane Doe", PropType::Points, 20.5, Side::Over, 5);
        high.model_probability = 0.75;
        db.insert_predictions(&[high, prediction("Ann Lee", PropType::Points, 15.5, Side::Over, 6)])
            .unwrap();
        track_outcomes(&db, date(1), date(10), DEFAULT_STAKE).unwrap();

        let summary = recalibrate_history(&db).unwrap();
        assert_eq!(summary.predictions, 2);
        assert_eq!(summary.tracked_bets, 1);

        let implied = 1.0 / (1.0 + 100.0 / 110.0);
        let stored = db.list_scored_predictions().unwrap();
        assert_relative_eq!(
            stored[0].model_probability,
            calibrate(0.75, Some(implied)),
            epsilon = 1e-12
        );
        let tracked = db.list_tracked_outcomes().unwrap();
        assert_relative_eq!(
            tracked[0].model_probability.unwrap(),
            stored[0].model_probability,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_freshness_flags_old_predictions() {
        let db = Database::open_in_memory().unwrap();
        let today = date(10);
        let mut old = prediction("A", PropType::Points, 20.5, Side::Over, 8);
        old.generated_at = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 1, 7, 12, 0, 0).unwrap();
        let mut tonight = prediction("B", PropType::Points, 20.5, Side::Over, 10);
        tonight.generated_at = old.generated_at;
        db.insert_predictions(&[old, tonight]).unwrap();

        let report = check_prediction_freshness(&db, today, 7).unwrap();
        // Tonight's game is outside the up-to-yesterday window.
        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.latest_generated_on, Some(date(7)));
        assert!(report.stale);

        let empty = check_prediction_freshness(&db, date(30), 3).unwrap();
        assert!(empty.runs.is_empty());
        assert!(!empty.stale);
    }
}
