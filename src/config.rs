use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::model::{ClassifierConfig, ModelKind};
use crate::pipeline::PipelineConfig;
use crate::tracking::DEFAULT_STAKE;

/// Player-prop probability engine
#[derive(Parser, Debug, Clone)]
#[command(name = "propcast", version, about)]
pub struct Config {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "propcast.db", global = true)]
    pub database_path: String,

    /// Minimum historical games before a prop is modelled
    #[arg(long, env = "MIN_GAMES", default_value = "10", global = true)]
    pub min_games: usize,

    /// Two-sided confidence level of the probability interval
    #[arg(long, env = "CONFIDENCE_LEVEL", default_value = "0.95", global = true)]
    pub confidence_level: f64,

    /// Half-life (in games) of the recency sample weights
    #[arg(long, env = "DECAY_HALF_LIFE", default_value = "20.0", global = true)]
    pub decay_half_life: f64,

    /// Seed for the ensemble's bootstrap and feature draws
    #[arg(long, env = "MODEL_SEED", default_value = "42", global = true)]
    pub seed: u64,

    /// Flat stake used to score settled bets
    #[arg(long, env = "STAKE", default_value_t = DEFAULT_STAKE, global = true)]
    pub stake: f64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Load historical game logs from a JSON export
    Import {
        #[arg(long)]
        file: PathBuf,
    },
    /// Score every proposition in a feed and store the ranked results
    Predict {
        /// JSON prop feed
        #[arg(long, env = "PROP_FEED")]
        feed: PathBuf,
        /// Model Under propositions too
        #[arg(long)]
        all_sides: bool,
        /// Evaluate at most the first N props of the feed
        #[arg(long)]
        max_props: Option<usize>,
        #[arg(long, value_enum, default_value_t = ModelKind::RandomForest)]
        model: ModelKind,
    },
    /// Settle stored predictions against imported results
    Track {
        #[arg(long, default_value = "7")]
        days_back: i64,
        /// Re-run the calibrator over every stored prediction first
        #[arg(long)]
        recalibrate: bool,
        /// Report when the predictions for recent games were generated
        #[arg(long)]
        check: bool,
    },
    /// Score the feed again with the current model, keeping only props for
    /// games in the last `days_back` days
    Regenerate {
        #[arg(long, env = "PROP_FEED")]
        feed: PathBuf,
        #[arg(long, default_value = "7")]
        days_back: i64,
        #[arg(long)]
        all_sides: bool,
        #[arg(long, value_enum, default_value_t = ModelKind::RandomForest)]
        model: ModelKind,
    },
    /// Serve the results API
    Serve {
        #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8080")]
        addr: String,
    },
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_games == 0 {
            anyhow::bail!("min_games must be at least 1");
        }
        if self.confidence_level.is_nan() || self.confidence_level <= 0.0 || self.confidence_level >= 1.0 {
            anyhow::bail!("confidence_level must be strictly between 0.0 and 1.0");
        }
        if self.decay_half_life.is_nan() || self.decay_half_life <= 0.0 {
            anyhow::bail!("decay_half_life must be positive");
        }
        if self.stake.is_nan() || self.stake <= 0.0 {
            anyhow::bail!("stake must be positive");
        }
        if let Command::Track { days_back, .. } | Command::Regenerate { days_back, .. } =
            self.command
        {
            if days_back < 0 {
                anyhow::bail!("days_back must not be negative");
            }
        }
        Ok(())
    }

    /// Pipeline settings for a predict run.
    pub fn pipeline_config(
        &self,
        all_sides: bool,
        max_props: Option<usize>,
        model: ModelKind,
    ) -> PipelineConfig {
        PipelineConfig {
            min_games: self.min_games,
            overs_only: !all_sides,
            confidence_level: self.confidence_level,
            decay_half_life: self.decay_half_life,
            max_props,
            classifier: ClassifierConfig {
                kind: model,
                seed: self.seed,
                ..ClassifierConfig::default()
            },
        }
    }
}
