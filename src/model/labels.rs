//! Binary training labels: did the stat clear the line in each past game?
//!
//! Ties count as misses here. Outcome tracking treats the same tie as a
//! push; the two paths are kept separate on purpose.

use crate::db::models::{GameLog, Side};
use crate::error::ModelError;

use super::schema::StatColumns;

/// One label per game in chronological order; `None` where the game has no
/// value in the resolved column.
pub fn label_outcomes(
    log: &GameLog,
    stat: &StatColumns,
    line: f64,
    side: Side,
) -> Result<Vec<Option<u8>>, ModelError> {
    if side == Side::Unknown {
        return Err(ModelError::InvalidSide(side));
    }
    let games = log.chronological();

    if let Some(raw) = stat.raw.as_deref() {
        return Ok(games
            .iter()
            .map(|g| {
                g.value(raw).map(|actual| {
                    let hit = match side {
                        Side::Over => actual > line,
                        _ => actual < line,
                    };
                    u8::from(hit)
                })
            })
            .collect());
    }

    // Proxy labels were computed for some other line; coerce to 0/1.
    if let Some(target) = stat.target.as_deref() {
        return Ok(games
            .iter()
            .map(|g| g.value(target).map(|v| u8::from(v > 0.0)))
            .collect());
    }

    Err(ModelError::UnresolvedColumn {
        prop: stat.prop,
        available: log.columns().into_iter().collect(),
    })
}
