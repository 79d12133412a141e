pub mod json_file;
pub mod provider;

pub use json_file::JsonFileFeed;
pub use provider::PropFeed;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::{info, warn};

use crate::db::models::GameRecord;

/// Read a game-log export: an array of `{player, game_date, stats}` rows.
pub async fn read_game_records(path: &Path) -> Result<Vec<GameRecord>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read game logs {}", path.display()))?;
    parse_rows(&raw, "game log")
}

/// Decode a JSON array row by row. Rows that fail to decode are logged and
/// dropped; only a document that is not an array is an error.
pub fn parse_rows<T: DeserializeOwned>(raw: &str, what: &str) -> Result<Vec<T>> {
    let rows: Vec<serde_json::Value> =
        serde_json::from_str(raw).with_context(|| format!("Failed to parse {} file", what))?;
    let total = rows.len();
    let parsed: Vec<T> = rows
        .into_iter()
        .enumerate()
        .filter_map(|(i, row)| match serde_json::from_value(row) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Skipping {} row {}: {}", what, i, e);
                None
            }
        })
        .collect();
    if parsed.len() < total {
        info!("Kept {} of {} {} rows", parsed.len(), total, what);
    }
    Ok(parsed)
}
