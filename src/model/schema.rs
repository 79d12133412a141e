//! Prop type → column mapping for the historical store.
//!
//! Each prop type has an ordered alias list for its raw box-score column and
//! an optional pre-labelled `target_*` column. A log's columns are resolved
//! once, by exact case-insensitive name, and the result is handed to both the
//! feature builder and the labeler so they always agree on the stat column.

use std::collections::BTreeSet;

use crate::db::models::{GameLog, PropType};
use crate::error::ModelError;

const FEATURE_PREFIX: &str = "feat_";
const TARGET_PREFIX: &str = "target_";

fn raw_aliases(prop: PropType) -> &'static [&'static str] {
    match prop {
        PropType::Points => &["pts", "points", "point"],
        PropType::Rebounds => &["reb", "rebounds", "rebound"],
        PropType::Assists => &["ast", "assists", "assist"],
        PropType::Threes | PropType::MadeThrees => &["fg3m", "3pm", "3p_made", "threes", "3p"],
        PropType::Steals => &["stl", "steals", "steal"],
        PropType::Blocks => &["blk", "blocks", "block"],
    }
}

fn target_column(prop: PropType) -> Option<&'static str> {
    match prop {
        PropType::Points => Some("target_pts"),
        PropType::Rebounds => Some("target_reb"),
        PropType::Assists => Some("target_ast"),
        PropType::Steals => Some("target_stl"),
        PropType::Blocks => Some("target_blk"),
        // The store has no threes target.
        PropType::Threes | PropType::MadeThrees => None,
    }
}

pub fn is_feature_column(name: &str) -> bool {
    name.starts_with(FEATURE_PREFIX)
}

pub fn is_target_column(name: &str) -> bool {
    name.starts_with(TARGET_PREFIX)
}

/// Columns of one game log that carry a prop type's statistic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatColumns {
    pub prop: PropType,
    /// Raw per-game stat (e.g. `pts`).
    pub raw: Option<String>,
    /// Binary proxy label used when no raw column exists.
    pub target: Option<String>,
}

impl StatColumns {
    /// Resolve against an explicit column set.
    pub fn resolve_columns(columns: &BTreeSet<String>, prop: PropType) -> Result<Self, ModelError> {
        let find = |wanted: &str| {
            columns
                .iter()
                .find(|c| c.eq_ignore_ascii_case(wanted))
                .cloned()
        };

        let raw = raw_aliases(prop)
            .iter()
            .filter_map(|alias| find(alias))
            .find(|c| !is_feature_column(c) && !is_target_column(c));
        let target = target_column(prop).and_then(find);

        if raw.is_none() && target.is_none() {
            return Err(ModelError::UnresolvedColumn {
                prop,
                available: columns.iter().cloned().collect(),
            });
        }
        Ok(Self { prop, raw, target })
    }

    pub fn resolve(log: &GameLog, prop: PropType) -> Result<Self, ModelError> {
        Self::resolve_columns(&log.columns(), prop)
    }
}
