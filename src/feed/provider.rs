use anyhow::Result;
use async_trait::async_trait;

use crate::db::models::PropCandidate;

/// Trait that every source of market propositions must implement.
#[async_trait]
pub trait PropFeed: Send + Sync {
    /// Return the propositions currently offered.
    async fn fetch_candidates(&self) -> Result<Vec<PropCandidate>>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
