use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use clap::Parser;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use tracing::{info, warn};

mod config;
mod dashboard;
mod db;
mod error;
mod feed;
mod model;
mod pipeline;
mod tracking;

use config::{Command, Config};
use dashboard::AppState;
use db::Database;
use feed::{JsonFileFeed, PropFeed};
use pipeline::PipelineConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    match config.command.clone() {
        Command::Import { file } => import(&db, &file).await,
        Command::Predict {
            feed,
            all_sides,
            max_props,
            model,
        } => {
            let pipeline = config.pipeline_config(all_sides, max_props, model);
            predict(&db, &JsonFileFeed::new(feed), pipeline, None).await
        }
        Command::Regenerate {
            feed,
            days_back,
            all_sides,
            model,
        } => {
            let since = Utc::now().date_naive() - Duration::days(days_back);
            let pipeline = config.pipeline_config(all_sides, None, model);
            info!("Regenerating predictions for games since {}", since);
            predict(&db, &JsonFileFeed::new(feed), pipeline, Some(since)).await
        }
        Command::Track {
            days_back,
            recalibrate,
            check,
        } => {
            let until = Utc::now().date_naive();
            let since = until - Duration::days(days_back);
            if check {
                tracking::check_prediction_freshness(&db, until, days_back)?;
            }
            if recalibrate {
                tracking::recalibrate_history(&db)?;
            }
            let summary = tracking::track_outcomes(&db, since, until, config.stake)?;
            let report = tracking::performance_report(&db.list_tracked_outcomes()?, config.stake);
            info!(
                "Record {}-{} ({} push), win rate {:.1}%, profit ${:.2}, ROI {:.1}%",
                report.wins, report.losses, report.pushes, report.win_rate, report.total_profit, report.roi
            );
            if summary.not_found > 0 {
                info!("{} prediction(s) still waiting on results", summary.not_found);
            }
            Ok(())
        }
        Command::Serve { addr } => {
            let app = dashboard::router(AppState {
                db: db.clone(),
                stake: config.stake,
            });
            let addr: SocketAddr = addr.parse()?;
            info!("Results API listening on http://{}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app).await?;
            Ok(())
        }
    }
}

async fn import(db: &Database, file: &Path) -> Result<()> {
    let records = feed::read_game_records(file).await?;
    let stored = db.insert_game_records(&records)?;
    let stats = db.get_stats()?;
    info!(
        "Imported {} game(s); store holds {} game(s) for {} player(s)",
        stored, stats.game_logs, stats.players
    );
    Ok(())
}

async fn predict(
    db: &Database,
    feed: &dyn PropFeed,
    config: PipelineConfig,
    games_since: Option<NaiveDate>,
) -> Result<()> {
    let candidates = feed.fetch_candidates().await?;
    info!("Fetched {} prop(s) from {}", candidates.len(), feed.name());

    // All store reads happen up front; the batch runs without touching the db.
    let mut logs = HashMap::new();
    for candidate in &candidates {
        if logs.contains_key(&candidate.player) {
            continue;
        }
        match db.load_game_log(&candidate.player) {
            Ok(log) if !log.is_empty() => {
                logs.insert(candidate.player.clone(), log);
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to load game log for {}: {}", candidate.player, e),
        }
    }
    info!("Loaded game logs for {} player(s)", logs.len());

    let mut predictions = tokio::task::spawn_blocking(move || {
        pipeline::evaluate_batch(&candidates, &logs, &config)
    })
    .await?;
    if let Some(since) = games_since {
        pipeline::retain_games_since(&mut predictions, since);
    }

    let ids = db.insert_predictions(&predictions)?;
    info!("Stored {} prediction(s)", ids.len());

    for p in predictions.iter().take(10) {
        info!(
            "{} {} {} {} @ {}: p={:.3} [{:.3}, {:.3}] EV={:+.3} kelly={:.3} KAE={:+.4}",
            p.player,
            p.prop,
            p.side,
            p.line,
            p.odds,
            p.model_probability,
            p.probability_ci_lower,
            p.probability_ci_upper,
            p.expected_value,
            p.kelly_fraction,
            p.kelly_adjusted_ev
        );
    }
    Ok(())
}
