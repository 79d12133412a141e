use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use super::provider::PropFeed;
use crate::db::models::PropCandidate;

/// Feed backed by a JSON export of the book's prop table.
///
/// The file is an array of rows keyed `Player`, `Prop`, `Line`,
/// `Over/Under`, `Odds` and optionally `game_date`.
pub struct JsonFileFeed {
    path: PathBuf,
}

impl JsonFileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileFeed { path: path.into() }
    }
}

#[async_trait]
impl PropFeed for JsonFileFeed {
    fn name(&self) -> &str {
        "JsonFile"
    }

    async fn fetch_candidates(&self) -> Result<Vec<PropCandidate>> {
        debug!("Reading props from {}", self.path.display());
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read feed {}", self.path.display()))?;
        parse_candidates(&raw)
    }
}

/// Rows with an unknown prop type or a malformed field are skipped.
pub fn parse_candidates(raw: &str) -> Result<Vec<PropCandidate>> {
    super::parse_rows(raw, "prop feed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{AmericanOdds, PropType, Side};
    use chrono::NaiveDate;

    const SAMPLE: &str = r#"[
        {"Player": "Jane Doe", "Prop": "Made Threes", "Line": 2.5, "Over/Under": "Over", "Odds": -115, "game_date": "2024-03-05"},
        {"Player": "Ann Lee", "Prop": "Points", "Line": 18.5, "Over/Under": "Under", "Odds": "+120"},
        {"Player": "Bo Kim", "Prop": "Rebounds", "Line": 6.5, "Over/Under": "?", "Odds": "OFF"}
    ]"#;

    #[test]
    fn test_parse_candidates() {
        let props = parse_candidates(SAMPLE).unwrap();
        assert_eq!(props.len(), 3);
        assert_eq!(props[0].prop, PropType::MadeThrees);
        assert_eq!(props[0].odds, AmericanOdds::Line(-115));
        assert_eq!(props[0].game_date, NaiveDate::from_ymd_opt(2024, 3, 5));
        assert_eq!(props[1].side, Side::Under);
        assert_eq!(props[1].odds, AmericanOdds::Line(120));
        assert_eq!(props[1].game_date, None);
        assert_eq!(props[2].side, Side::Unknown);
        assert_eq!(props[2].odds, AmericanOdds::Off);
    }

    #[test]
    fn test_unknown_prop_type_skips_only_that_row() {
        let raw = r#"[
            {"Player": "Ann Lee", "Prop": "Points", "Line": 18.5, "Over/Under": "Over", "Odds": -110},
            {"Player": "X", "Prop": "Turnovers", "Line": 1.5, "Over/Under": "Over", "Odds": -110},
            {"Player": "Y", "Prop": "Assists", "Line": "six", "Over/Under": "Over", "Odds": -110},
            {"Player": "Bo Kim", "Prop": "Blocks", "Line": 0.5, "Over/Under": "Under", "Odds": 140}
        ]"#;
        let props = parse_candidates(raw).unwrap();
        let players: Vec<&str> = props.iter().map(|p| p.player.as_str()).collect();
        assert_eq!(players, vec!["Ann Lee", "Bo Kim"]);
        assert_eq!(props[1].prop, PropType::Blocks);
    }

    #[test]
    fn test_feed_that_is_not_an_array_is_an_error() {
        assert!(parse_candidates(r#"{"Player": "X"}"#).is_err());
    }

    #[tokio::test]
    async fn test_json_file_feed_reads_file() {
        let path = std::env::temp_dir().join(format!("propcast-feed-{}.json", std::process::id()));
        tokio::fs::write(&path, SAMPLE).await.unwrap();
        let feed = JsonFileFeed::new(&path);
        let props = feed.fetch_candidates().await.unwrap();
        assert_eq!(props.len(), 3);
        assert_eq!(feed.name(), "JsonFile");
        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let feed = JsonFileFeed::new("/nonexistent/propcast/feed.json");
        assert!(feed.fetch_candidates().await.is_err());
    }
}
