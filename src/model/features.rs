//! Feature construction from a player's game log.
//!
//! Each historical game gets one feature row built only from the games
//! played *before* it, so a row never sees the stat it is labelled with.
//! `build_upcoming` produces the prediction-time row from the full history.

use std::collections::BTreeSet;

use crate::db::models::{GameLog, GameRecord};

use super::schema::{is_feature_column, StatColumns};

/// Minimum log length before trend/volatility features are produced.
pub const MIN_ENGINEERED_HISTORY: usize = 5;
/// Games within this distance of the line count as "near the line".
pub const NEAR_LINE_BAND: f64 = 1.5;
/// Default sample-weight half-life, in games.
pub const DEFAULT_DECAY_HALF_LIFE: f64 = 20.0;

const LINE_COLUMN: &str = "line";

const BASE_FEATURES: [&str; 10] = [
    "roll_mean_5",
    "roll_mean_10",
    "season_mean",
    "roll_std_10",
    "trend_slope_5",
    "momentum_3",
    "volatility",
    "consistency",
    "recent_vs_season_5",
    "recent_vs_season_10",
];

const LINE_FEATURES: [&str; 11] = [
    "line_minus_mean_5",
    "line_minus_mean_10",
    "line_minus_season",
    "line_pct_vs_5",
    "line_pct_vs_10",
    "line_pct_vs_season",
    "line_difficulty",
    "games_near_line",
    "hit_rate_at_line",
    "mean_x_line",
    "volatility_x_line",
];

/// Numeric feature table: one row per game plus a sample weight per row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub weights: Vec<f64>,
}

impl FeatureMatrix {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| r[idx]).collect())
    }

    pub fn last_row(&self) -> Option<&[f64]> {
        self.rows.last().map(Vec::as_slice)
    }

    /// Keep only the given rows (weights follow their rows).
    pub fn select_rows(&self, indices: &[usize]) -> FeatureMatrix {
        FeatureMatrix {
            columns: self.columns.clone(),
            rows: indices.iter().map(|&i| self.rows[i].clone()).collect(),
            weights: indices.iter().map(|&i| self.weights[i]).collect(),
        }
    }
}

/// Builds feature matrices from game logs.
#[derive(Debug, Clone, Copy)]
pub struct FeatureBuilder {
    decay_half_life: f64,
}

impl Default for FeatureBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_DECAY_HALF_LIFE)
    }
}

impl FeatureBuilder {
    pub fn new(decay_half_life: f64) -> Self {
        Self { decay_half_life }
    }

    /// One row per historical game, in chronological order.
    pub fn build(&self, log: &GameLog, stat: &StatColumns, line: Option<f64>) -> FeatureMatrix {
        let games = log.chronological();
        let layout = Layout::new(log, stat);

        let series = stat_series(&games, stat);
        let rows = games
            .iter()
            .enumerate()
            .map(|(i, game)| {
                let prior: Vec<f64> = series[..i].iter().flatten().copied().collect();
                layout.row(game, &prior, line)
            })
            .collect();

        FeatureMatrix {
            columns: layout.columns(line),
            rows,
            weights: self.decay_weights(games.len()),
        }
    }

    /// A single row describing the next, not-yet-played game.
    pub fn build_upcoming(
        &self,
        log: &GameLog,
        stat: &StatColumns,
        line: Option<f64>,
    ) -> FeatureMatrix {
        let games = log.chronological();
        let layout = Layout::new(log, stat);
        let columns = layout.columns(line);

        let Some(latest) = games.last() else {
            return FeatureMatrix {
                columns,
                ..FeatureMatrix::default()
            };
        };
        let prior: Vec<f64> = stat_series(&games, stat).into_iter().flatten().collect();

        FeatureMatrix {
            columns,
            rows: vec![layout.row(latest, &prior, line)],
            weights: vec![1.0],
        }
    }

    /// Exponential time decay by game age, normalised to mean 1.
    fn decay_weights(&self, n: usize) -> Vec<f64> {
        if n == 0 {
            return Vec::new();
        }
        let half_life = self.decay_half_life.max(f64::EPSILON);
        let raw: Vec<f64> = (0..n)
            .map(|i| 0.5f64.powf((n - 1 - i) as f64 / half_life))
            .collect();
        let mean = raw.iter().sum::<f64>() / n as f64;
        raw.into_iter().map(|w| w / mean).collect()
    }
}

/// Column set shared by every row built from one log.
struct Layout {
    feature_columns: Vec<String>,
    engineered: bool,
}

impl Layout {
    fn new(log: &GameLog, stat: &StatColumns) -> Self {
        let feature_columns: BTreeSet<String> = log
            .columns()
            .into_iter()
            .filter(|c| is_feature_column(c))
            .collect();
        Self {
            feature_columns: feature_columns.into_iter().collect(),
            engineered: stat.raw.is_some() && log.len() >= MIN_ENGINEERED_HISTORY,
        }
    }

    fn columns(&self, line: Option<f64>) -> Vec<String> {
        let mut columns = Vec::new();
        if line.is_some() {
            columns.push(LINE_COLUMN.to_string());
        }
        columns.extend(self.feature_columns.iter().cloned());
        if self.engineered {
            columns.extend(BASE_FEATURES.iter().map(|s| s.to_string()));
            if line.is_some() {
                columns.extend(LINE_FEATURES.iter().map(|s| s.to_string()));
            }
        }
        columns
    }

    fn row(&self, game: &GameRecord, prior: &[f64], line: Option<f64>) -> Vec<f64> {
        let mut row = Vec::new();
        if let Some(line) = line {
            row.push(line);
        }
        row.extend(
            self.feature_columns
                .iter()
                .map(|c| game.value(c).unwrap_or(0.0)),
        );
        if self.engineered {
            let stats = WindowStats::from_prior(prior);
            row.extend(stats.base());
            if let Some(line) = line {
                row.extend(stats.line_context(prior, line));
            }
        }
        row.into_iter()
            .map(|v| if v.is_finite() { v } else { 0.0 })
            .collect()
    }
}

fn stat_series(games: &[&GameRecord], stat: &StatColumns) -> Vec<Option<f64>> {
    match stat.raw.as_deref() {
        Some(col) => games.iter().map(|g| g.value(col)).collect(),
        None => vec![None; games.len()],
    }
}

/// Rolling statistics over the games before a row.
struct WindowStats {
    mean_5: Option<f64>,
    mean_10: Option<f64>,
    season: Option<f64>,
    std_10: Option<f64>,
    slope_5: f64,
    momentum_3: f64,
}

impl WindowStats {
    fn from_prior(prior: &[f64]) -> Self {
        let momentum_3 = if prior.len() >= 6 {
            let n = prior.len();
            let last = mean(&prior[n - 3..]).unwrap_or(0.0);
            let before = mean(&prior[n - 6..n - 3]).unwrap_or(0.0);
            if before > 0.0 {
                (last - before) / before
            } else {
                0.0
            }
        } else {
            0.0
        };
        Self {
            mean_5: mean(tail(prior, 5)),
            mean_10: mean(tail(prior, 10)),
            season: mean(prior),
            std_10: sample_std(tail(prior, 10)),
            slope_5: ols_slope(tail(prior, 5)),
            momentum_3,
        }
    }

    fn base(&self) -> [f64; 10] {
        let mean_10 = self.mean_10.unwrap_or(0.0);
        let std_10 = self.std_10.unwrap_or(0.0);
        let consistency = if mean_10 > 0.0 {
            1.0 - std_10 / mean_10
        } else {
            0.5
        };
        [
            self.mean_5.unwrap_or(0.0),
            mean_10,
            self.season.unwrap_or(0.0),
            std_10,
            self.slope_5,
            self.momentum_3,
            std_10,
            consistency,
            ratio(self.mean_5, self.season),
            ratio(self.mean_10, self.season),
        ]
    }

    fn line_context(&self, prior: &[f64], line: f64) -> [f64; 11] {
        let delta = |m: Option<f64>| m.map(|m| line - m).unwrap_or(0.0);
        let pct = |m: Option<f64>| match m {
            Some(m) if m > 0.0 => (line - m) / m,
            _ => 0.0,
        };
        let difficulty = match (self.mean_10, self.std_10) {
            (Some(m), Some(s)) if s > 0.0 => (line - m) / s,
            _ => 0.0,
        };
        let near_line = tail(prior, 10)
            .iter()
            .filter(|v| (**v - line).abs() <= NEAR_LINE_BAND)
            .count() as f64;
        let hit_rate = if prior.is_empty() {
            0.0
        } else {
            prior.iter().filter(|v| **v > line).count() as f64 / prior.len() as f64
        };
        [
            delta(self.mean_5),
            delta(self.mean_10),
            delta(self.season),
            pct(self.mean_5),
            pct(self.mean_10),
            pct(self.season),
            difficulty,
            near_line,
            hit_rate,
            self.mean_10.map(|m| m * line).unwrap_or(0.0),
            self.std_10.map(|s| s * line).unwrap_or(0.0),
        ]
    }
}

fn tail(values: &[f64], n: usize) -> &[f64] {
    &values[values.len().saturating_sub(n)..]
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Sample standard deviation (n − 1).
fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

fn ratio(num: Option<f64>, den: Option<f64>) -> f64 {
    match (num, den) {
        (Some(n), Some(d)) if d > 0.0 => n / d,
        _ => 0.0,
    }
}

/// Least-squares slope of `values` against their index.
pub(crate) fn ols_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = values.iter().sum::<f64>() / n as f64;
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        sxy += dx * (y - y_mean);
        sxx += dx * dx;
    }
    if sxx == 0.0 {
        0.0
    } else {
        sxy / sxx
    }
}
