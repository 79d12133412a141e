use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub mod models;
use models::*;

/// Thread-safe SQLite handle (single connection behind a mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        self.conn()?.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Game logs ─────────────────────────────────────────────────────────────

    /// Insert or replace historical games keyed by (player, game_date)
    pub fn insert_game_records(&self, records: &[GameRecord]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO game_logs (player, game_date, stats_json, imported_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(player, game_date) DO UPDATE SET
                    stats_json = excluded.stats_json,
                    imported_at = excluded.imported_at",
            )?;
            let now = Utc::now();
            for record in records {
                let finite: BTreeMap<&String, f64> = record
                    .stats
                    .iter()
                    .filter(|(_, v)| v.is_finite())
                    .map(|(k, v)| (k, *v))
                    .collect();
                stmt.execute(params![
                    record.player,
                    record.game_date,
                    serde_json::to_string(&finite)?,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Full game log for a player (name matched case-insensitively)
    pub fn load_game_log(&self, player: &str) -> Result<GameLog> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT player, game_date, stats_json FROM game_logs
             WHERE player = ?1 COLLATE NOCASE
             ORDER BY game_date ASC, id ASC",
        )?;
        let games = stmt
            .query_map(params![player], map_game_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(GameLog::new(player, games))
    }

    /// The player's game on a given date, if imported
    pub fn find_game(&self, player: &str, game_date: NaiveDate) -> Result<Option<GameRecord>> {
        let conn = self.conn()?;
        let game = conn
            .query_row(
                "SELECT player, game_date, stats_json FROM game_logs
                 WHERE player = ?1 COLLATE NOCASE AND game_date = ?2
                 ORDER BY id DESC LIMIT 1",
                params![player, game_date],
                map_game_record,
            )
            .optional()?;
        Ok(game)
    }

    // ── Predictions ───────────────────────────────────────────────────────────

    /// Persist a batch of predictions, returning their row ids in order
    pub fn insert_predictions(&self, predictions: &[PropPrediction]) -> Result<Vec<i64>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(predictions.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO processed_props (
                    player, prop, line, over_under, odds, decimal_odds,
                    implied_probability, model_probability,
                    probability_ci_lower, probability_ci_upper, edge,
                    expected_value, ev_ci_lower, ev_ci_upper,
                    kelly_fraction, kelly_adjusted_ev, confidence_score,
                    historical_games, training_samples, game_date, generated_at
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)",
            )?;
            for p in predictions {
                stmt.execute(params![
                    p.player,
                    p.prop,
                    p.line,
                    p.side,
                    p.odds,
                    finite(p.decimal_odds),
                    finite(p.implied_probability),
                    finite(p.model_probability),
                    finite(p.probability_ci_lower),
                    finite(p.probability_ci_upper),
                    finite(p.edge),
                    finite(p.expected_value),
                    finite(p.ev_ci_lower),
                    finite(p.ev_ci_upper),
                    finite(p.kelly_fraction),
                    finite(p.kelly_adjusted_ev),
                    finite(p.confidence_score),
                    p.historical_games,
                    p.training_samples,
                    p.game_date,
                    p.generated_at,
                ])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Most recent predictions, best ranked first within a run
    pub fn list_latest_predictions(&self, limit: i64) -> Result<Vec<PropPrediction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{PREDICTION_COLUMNS} FROM processed_props pp
             ORDER BY pp.generated_at DESC, pp.kelly_adjusted_ev IS NULL,
                      pp.kelly_adjusted_ev DESC, pp.id ASC
             LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit], map_prediction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Predictions for games in [since, until] with no settled result yet
    pub fn list_untracked_predictions(
        &self,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<PropPrediction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{PREDICTION_COLUMNS} FROM processed_props pp
             LEFT JOIN bet_tracking bt ON bt.prop_id = pp.id
             WHERE pp.game_date IS NOT NULL
               AND pp.game_date >= ?1 AND pp.game_date <= ?2
               AND (bt.id IS NULL OR bt.actual_result IS NULL)
             ORDER BY pp.game_date DESC, pp.id ASC"
        ))?;
        let rows = stmt
            .query_map(params![since, until], map_prediction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Every prediction that carries a model probability, oldest first
    pub fn list_scored_predictions(&self) -> Result<Vec<PropPrediction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{PREDICTION_COLUMNS} FROM processed_props pp
             WHERE pp.model_probability IS NOT NULL
             ORDER BY pp.id ASC"
        ))?;
        let rows = stmt
            .query_map([], map_prediction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Overwrite the model-derived columns of stored predictions and of the
    /// bets tracked against them. Returns (predictions, bets) touched.
    pub fn update_prediction_scores(&self, updates: &[ScoreUpdate]) -> Result<(usize, usize)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let (mut props, mut bets) = (0, 0);
        {
            let mut prop_stmt = tx.prepare(
                "UPDATE processed_props
                 SET model_probability = ?1, expected_value = ?2, edge = ?3,
                     kelly_fraction = ?4, kelly_adjusted_ev = ?5
                 WHERE id = ?6",
            )?;
            let mut bet_stmt = tx.prepare(
                "UPDATE bet_tracking SET model_probability = ?1, expected_value = ?2
                 WHERE prop_id = ?3",
            )?;
            for u in updates {
                props += prop_stmt.execute(params![
                    finite(u.model_probability),
                    finite(u.expected_value),
                    finite(u.edge),
                    finite(u.kelly_fraction),
                    finite(u.kelly_adjusted_ev),
                    u.prediction_id,
                ])?;
                bets += bet_stmt.execute(params![
                    finite(u.model_probability),
                    finite(u.expected_value),
                    u.prediction_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok((props, bets))
    }

    /// Predictions for games in [since, until], grouped by game date and the
    /// day they were generated
    pub fn list_prediction_runs(
        &self,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<PredictionRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT game_date, substr(generated_at, 1, 10) AS generated_on, COUNT(*),
                    MIN(generated_at), MAX(generated_at)
             FROM processed_props
             WHERE game_date IS NOT NULL AND game_date >= ?1 AND game_date <= ?2
             GROUP BY game_date, generated_on
             ORDER BY game_date DESC, generated_on DESC",
        )?;
        let rows = stmt
            .query_map(params![since, until], map_prediction_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Bet tracking ──────────────────────────────────────────────────────────

    /// Record (or overwrite) the settled result of a prediction
    pub fn upsert_tracked_outcome(&self, outcome: &TrackedOutcome) -> Result<i64> {
        let conn = self.conn()?;
        let id = conn.query_row(
            "INSERT INTO bet_tracking (
                prop_id, player, prop, line, over_under, odds,
                model_probability, expected_value, actual_result,
                outcome, profit_loss, game_date, result_date
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
             ON CONFLICT(prop_id) DO UPDATE SET
                actual_result = excluded.actual_result,
                outcome = excluded.outcome,
                profit_loss = excluded.profit_loss,
                result_date = excluded.result_date
             RETURNING id",
            params![
                outcome.prediction_id,
                outcome.player,
                outcome.prop,
                outcome.line,
                outcome.side,
                outcome.odds,
                outcome.model_probability.and_then(finite),
                outcome.expected_value.and_then(finite),
                outcome.actual_value,
                outcome.outcome,
                outcome.profit_loss.and_then(finite),
                outcome.game_date,
                outcome.result_date,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Every settled bet, oldest game first
    pub fn list_tracked_outcomes(&self) -> Result<Vec<TrackedOutcome>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, prop_id, player, prop, line, over_under, odds,
                    model_probability, expected_value, actual_result,
                    outcome, profit_loss, game_date, result_date
             FROM bet_tracking
             WHERE actual_result IS NOT NULL
             ORDER BY game_date ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([], map_tracked_outcome)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Stats ─────────────────────────────────────────────────────────────────

    /// Row counts across the store
    pub fn get_stats(&self) -> Result<Stats> {
        let conn = self.conn()?;
        let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };
        Ok(Stats {
            game_logs: count("SELECT COUNT(*) FROM game_logs")?,
            players: count("SELECT COUNT(DISTINCT player COLLATE NOCASE) FROM game_logs")?,
            predictions: count("SELECT COUNT(*) FROM processed_props")?,
            tracked_bets: count("SELECT COUNT(*) FROM bet_tracking WHERE actual_result IS NOT NULL")?,
            pending_bets: count(
                "SELECT COUNT(*) FROM processed_props pp
                 LEFT JOIN bet_tracking bt ON bt.prop_id = pp.id
                 WHERE pp.game_date IS NOT NULL AND (bt.id IS NULL OR bt.actual_result IS NULL)",
            )?,
        })
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

/// Non-finite floats are stored as NULL.
fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

fn nan_if_null(v: Option<f64>) -> f64 {
    v.unwrap_or(f64::NAN)
}

const PREDICTION_COLUMNS: &str = "SELECT pp.id, pp.player, pp.prop, pp.line, pp.over_under, pp.odds,
        pp.decimal_odds, pp.implied_probability, pp.model_probability,
        pp.probability_ci_lower, pp.probability_ci_upper, pp.edge,
        pp.expected_value, pp.ev_ci_lower, pp.ev_ci_upper,
        pp.kelly_fraction, pp.kelly_adjusted_ev, pp.confidence_score,
        pp.historical_games, pp.training_samples, pp.game_date, pp.generated_at";

fn map_game_record(row: &rusqlite::Row) -> rusqlite::Result<GameRecord> {
    let json: String = row.get(2)?;
    let stats: BTreeMap<String, f64> = serde_json::from_str(&json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(GameRecord {
        player: row.get(0)?,
        game_date: row.get(1)?,
        stats,
    })
}

fn map_prediction(row: &rusqlite::Row) -> rusqlite::Result<PropPrediction> {
    Ok(PropPrediction {
        id: row.get(0)?,
        player: row.get(1)?,
        prop: row.get(2)?,
        line: row.get(3)?,
        side: row.get(4)?,
        odds: row.get(5)?,
        decimal_odds: nan_if_null(row.get(6)?),
        implied_probability: nan_if_null(row.get(7)?),
        model_probability: nan_if_null(row.get(8)?),
        probability_ci_lower: nan_if_null(row.get(9)?),
        probability_ci_upper: nan_if_null(row.get(10)?),
        edge: nan_if_null(row.get(11)?),
        expected_value: nan_if_null(row.get(12)?),
        ev_ci_lower: nan_if_null(row.get(13)?),
        ev_ci_upper: nan_if_null(row.get(14)?),
        kelly_fraction: nan_if_null(row.get(15)?),
        kelly_adjusted_ev: nan_if_null(row.get(16)?),
        confidence_score: nan_if_null(row.get(17)?),
        historical_games: row.get(18)?,
        training_samples: row.get(19)?,
        game_date: row.get(20)?,
        generated_at: row.get(21)?,
    })
}

fn map_prediction_run(row: &rusqlite::Row) -> rusqlite::Result<PredictionRun> {
    Ok(PredictionRun {
        game_date: row.get(0)?,
        generated_on: row.get(1)?,
        count: row.get(2)?,
        first_generated: row.get(3)?,
        last_generated: row.get(4)?,
    })
}

fn map_tracked_outcome(row: &rusqlite::Row) -> rusqlite::Result<TrackedOutcome> {
    Ok(TrackedOutcome {
        id: row.get(0)?,
        prediction_id: row.get(1)?,
        player: row.get(2)?,
        prop: row.get(3)?,
        line: row.get(4)?,
        side: row.get(5)?,
        odds: row.get(6)?,
        model_probability: row.get(7)?,
        expected_value: row.get(8)?,
        actual_value: row.get(9)?,
        outcome: row.get(10)?,
        profit_loss: row.get(11)?,
        game_date: row.get(12)?,
        result_date: row.get(13)?,
    })
}

impl ToSql for PropType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for PropType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

impl ToSql for Side {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Side {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(Side::from(value.as_str()?.to_string()))
    }
}

/// `Off` is stored as NULL.
impl ToSql for AmericanOdds {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.value() {
            Some(v) => ToSqlOutput::from(v),
            None => ToSqlOutput::from(rusqlite::types::Null),
        })
    }
}

impl FromSql for AmericanOdds {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(AmericanOdds::Off),
            ValueRef::Integer(v) => i32::try_from(v)
                .map(AmericanOdds::Line)
                .map_err(|_| FromSqlError::OutOfRange(v)),
            ValueRef::Text(_) => Ok(AmericanOdds::parse(value.as_str()?)),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS game_logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    player      TEXT    NOT NULL COLLATE NOCASE,
    game_date   TEXT    NOT NULL,
    stats_json  TEXT    NOT NULL,
    imported_at TEXT    NOT NULL,
    UNIQUE (player, game_date)
);

CREATE TABLE IF NOT EXISTS processed_props (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    player               TEXT    NOT NULL,
    prop                 TEXT    NOT NULL,
    line                 REAL    NOT NULL,
    over_under           TEXT    NOT NULL,
    odds                 INTEGER,
    decimal_odds         REAL,
    implied_probability  REAL,
    model_probability    REAL,
    probability_ci_lower REAL,
    probability_ci_upper REAL,
    edge                 REAL,
    expected_value       REAL,
    ev_ci_lower          REAL,
    ev_ci_upper          REAL,
    kelly_fraction       REAL,
    kelly_adjusted_ev    REAL,
    confidence_score     REAL,
    historical_games     INTEGER NOT NULL,
    training_samples     INTEGER NOT NULL,
    game_date            TEXT,
    generated_at         TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS bet_tracking (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    prop_id           INTEGER NOT NULL UNIQUE,
    player            TEXT    NOT NULL,
    prop              TEXT    NOT NULL,
    line              REAL    NOT NULL,
    over_under        TEXT    NOT NULL,
    odds              INTEGER,
    model_probability REAL,
    expected_value    REAL,
    actual_result     REAL,
    outcome           INTEGER,
    profit_loss       REAL,
    game_date         TEXT    NOT NULL,
    result_date       TEXT    NOT NULL,
    FOREIGN KEY (prop_id) REFERENCES processed_props(id)
);

CREATE INDEX IF NOT EXISTS idx_game_logs_player ON game_logs(player, game_date);
CREATE INDEX IF NOT EXISTS idx_processed_props_game_date ON processed_props(game_date);
CREATE INDEX IF NOT EXISTS idx_processed_props_generated ON processed_props(generated_at);
"#;

/// New model-derived values for one stored prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreUpdate {
    pub prediction_id: i64,
    pub model_probability: f64,
    pub expected_value: f64,
    pub edge: f64,
    pub kelly_fraction: f64,
    pub kelly_adjusted_ev: f64,
}

/// How many predictions were generated on one day for one game date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PredictionRun {
    pub game_date: NaiveDate,
    pub generated_on: NaiveDate,
    pub count: i64,
    pub first_generated: DateTime<Utc>,
    pub last_generated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stats {
    pub game_logs: i64,
    pub players: i64,
    pub predictions: i64,
    pub tracked_bets: i64,
    pub pending_bets: i64,
}
