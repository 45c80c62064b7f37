use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use roomsense::advisory::{AdvisoryCache, AdvisoryProvider, HvacAdvisoryProvider};
use roomsense::db::Database;
use roomsense::models::{AggregatedState, DetectionSnapshot};
use roomsense::settings::{FeatureToggles, SettingsStore};
use roomsense::tracking::TrackingController;

const PUBLISH_INTERVAL_SECS: u64 = 1;
const SNAPSHOT_QUEUE_DEPTH: usize = 32;

/// One NDJSON line on stdin: either a detection frame from the device driver
/// or a control command from the operator.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum InputLine {
    Snapshot {
        #[serde(flatten)]
        snapshot: DetectionSnapshot,
    },
    StartLecture {
        registered_count: u32,
    },
    StopLecture,
    Pause,
    Resume,
    RefreshAdvisory,
    SetFeatures {
        #[serde(flatten)]
        features: FeatureToggles,
    },
    ListSessions,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("roomsense starting up...");

    let data_dir = std::env::var("ROOMSENSE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"));
    std::fs::create_dir_all(&data_dir)?;

    let database = Database::new(data_dir.join("roomsense.sqlite3"))?;

    // Finalize sessions that were running when the process last crashed.
    if let Some(session) = database.get_incomplete_session().await? {
        warn!(
            "Recovered incomplete session {}; marking as Interrupted",
            session.id
        );
        database
            .mark_session_interrupted(&session.id, Utc::now())
            .await?;
    }

    let settings = Arc::new(SettingsStore::new(data_dir.join("settings.json"))?);
    let advisory_cfg = settings.advisory();
    let provider = HvacAdvisoryProvider::new(advisory_cfg.clone())?;
    let cache = AdvisoryCache::new(
        provider,
        chrono::Duration::seconds(advisory_cfg.cache_ttl_secs as i64),
    );

    let controller = TrackingController::new(database, settings, cache);
    let (snapshot_tx, snapshot_rx) = mpsc::channel(SNAPSHOT_QUEUE_DEPTH);
    controller.start_tracking(snapshot_rx).await?;

    let publisher = tokio::spawn(publish_states(controller.subscribe()));
    let mut input = tokio::spawn(read_input(controller.clone(), snapshot_tx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
        _ = &mut input => info!("input stream closed"),
    }

    input.abort();
    publisher.abort();
    controller.stop_tracking().await?;

    let metrics = controller.metrics_snapshot().await;
    info!(
        "processed {} ticks ({} alerts) - cpu {:.1}%, mem {:.1} MB",
        metrics.tick_count,
        metrics.alert_count,
        metrics.system.cpu_percent,
        metrics.system.memory_mb
    );
    Ok(())
}

/// Emit the latest aggregated state as one NDJSON line per publish interval.
async fn publish_states(mut states: watch::Receiver<AggregatedState>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(PUBLISH_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let state = states.borrow_and_update().clone();
        emit(&json!({ "type": "state", "state": state }));
    }
}

async fn read_input<P>(
    controller: TrackingController<P>,
    snapshots: mpsc::Sender<DetectionSnapshot>,
) where
    P: AdvisoryProvider + Send + Sync + 'static,
{
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<InputLine>(&line) {
                    Ok(input) => handle_input(&controller, &snapshots, input).await,
                    Err(err) => warn!("ignoring malformed input line: {err}"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                error!("stdin read failed: {err}");
                break;
            }
        }
    }
}

async fn handle_input<P>(
    controller: &TrackingController<P>,
    snapshots: &mpsc::Sender<DetectionSnapshot>,
    input: InputLine,
) where
    P: AdvisoryProvider + Send + Sync + 'static,
{
    match input {
        InputLine::Snapshot { snapshot } => {
            if snapshots.send(snapshot).await.is_err() {
                warn!("aggregation loop is gone; dropping snapshot");
            }
        }
        InputLine::StartLecture { registered_count } => {
            match controller.start_session(registered_count).await {
                Ok(session) => emit(&json!({ "type": "sessionStarted", "session": session })),
                Err(err) => emit_error(&err.to_string()),
            }
        }
        InputLine::StopLecture => match controller.stop_session().await {
            Ok(report) => {
                info!("\n{}", report.render_text());
                emit(&json!({ "type": "attendanceReport", "report": report }));
            }
            Err(err) => emit_error(&err.to_string()),
        },
        InputLine::Pause => {
            controller.pause();
            emit(&json!({ "type": "paused" }));
        }
        InputLine::Resume => {
            controller.resume();
            emit(&json!({ "type": "resumed" }));
        }
        InputLine::RefreshAdvisory => {
            let advisory = controller.request_advisory_refresh().await;
            emit(&json!({ "type": "advisory", "advisory": &*advisory }));
        }
        InputLine::SetFeatures { features } => match controller.set_features(features) {
            Ok(()) => emit(&json!({ "type": "featuresUpdated" })),
            Err(err) => emit_error(&err.to_string()),
        },
        InputLine::ListSessions => match controller.recent_sessions(20).await {
            Ok(sessions) => emit(&json!({ "type": "sessions", "sessions": sessions })),
            Err(err) => emit_error(&err.to_string()),
        },
    }
}

fn emit(event: &serde_json::Value) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(err) => error!("failed to serialize output event: {err}"),
    }
}

fn emit_error(message: &str) {
    emit(&json!({ "type": "error", "message": message }));
}
