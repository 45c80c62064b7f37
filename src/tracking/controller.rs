use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::{error, info};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::advisory::{Advisory, AdvisoryCache, AdvisoryProvider};
use crate::attendance::{
    validate_registered_count, AttendanceReport, AttendanceTracker, SessionError,
};
use crate::db::Database;
use crate::metrics::{MetricsSnapshot, TickMetricsCollector};
use crate::models::{
    AggregatedState, DetectionSnapshot, SessionInfo, SessionRow, SessionStatus,
};
use crate::settings::{FeatureToggles, SettingsStore};

use super::loop_worker::{aggregation_loop, LoopShared};

/// Orchestrates the aggregation worker and exposes the control surface:
/// session start/stop, pause/resume, advisory refresh, and the published
/// state stream.
pub struct TrackingController<P> {
    shared: Arc<LoopShared>,
    advisory: Arc<AdvisoryCache<P>>,
    db: Database,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    refresher: Arc<Mutex<Option<JoinHandle<()>>>>,
    cancel_token: Arc<Mutex<Option<CancellationToken>>>,
}

impl<P> Clone for TrackingController<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            advisory: Arc::clone(&self.advisory),
            db: self.db.clone(),
            worker: Arc::clone(&self.worker),
            refresher: Arc::clone(&self.refresher),
            cancel_token: Arc::clone(&self.cancel_token),
        }
    }
}

impl<P> TrackingController<P>
where
    P: AdvisoryProvider + Send + Sync + 'static,
{
    pub fn new(db: Database, settings: Arc<SettingsStore>, advisory: AdvisoryCache<P>) -> Self {
        let (state_tx, _) = watch::channel(AggregatedState::default());

        Self {
            shared: Arc::new(LoopShared {
                tracker: Arc::new(Mutex::new(AttendanceTracker::new())),
                settings,
                last_advisory: RwLock::new(None),
                state_tx,
                paused: AtomicBool::new(false),
                metrics: TickMetricsCollector::new(),
            }),
            advisory: Arc::new(advisory),
            db,
            worker: Arc::new(Mutex::new(None)),
            refresher: Arc::new(Mutex::new(None)),
            cancel_token: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the aggregation worker over a snapshot feed, plus the optional
    /// background advisory refresher.
    pub async fn start_tracking(
        &self,
        snapshots: mpsc::Receiver<DetectionSnapshot>,
    ) -> Result<()> {
        let mut worker_guard = self.worker.lock().await;
        if worker_guard.is_some() {
            bail!("tracking already active");
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(aggregation_loop(
            snapshots,
            self.shared.clone(),
            cancel_token.clone(),
        ));
        *worker_guard = Some(handle);

        if let Some(secs) = self.shared.settings.advisory().auto_refresh_secs {
            let controller = self.clone();
            let token = cancel_token.clone();
            let refresher = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first interval tick fires immediately; skip it so the
                // cadence starts one full period after startup.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            controller.request_advisory_refresh().await;
                        }
                        _ = token.cancelled() => break,
                    }
                }
            });
            *self.refresher.lock().await = Some(refresher);
        }

        *self.cancel_token.lock().await = Some(cancel_token);
        info!("aggregation worker started");
        Ok(())
    }

    pub async fn stop_tracking(&self) -> Result<()> {
        if let Some(token) = self.cancel_token.lock().await.take() {
            token.cancel();
        }

        if let Some(handle) = self.refresher.lock().await.take() {
            if let Err(err) = handle.await {
                error!("advisory refresher failed to join: {err}");
            }
        }

        if let Some(handle) = self.worker.lock().await.take() {
            handle
                .await
                .context("aggregation worker failed to join")?;
        }
        Ok(())
    }

    /// Stream of published states; every subscriber sees the latest value.
    pub fn subscribe(&self) -> watch::Receiver<AggregatedState> {
        self.shared.state_tx.subscribe()
    }

    pub fn current(&self) -> AggregatedState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Relaxed);
        self.shared.state_tx.send_modify(|state| state.paused = true);
        info!("frame processing paused");
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Relaxed);
        self.shared.state_tx.send_modify(|state| state.paused = false);
        info!("frame processing resumed");
    }

    pub async fn start_session(&self, registered_count: u32) -> Result<SessionInfo, SessionError> {
        let features = self.shared.settings.features();
        if !features.attendance {
            return Err(SessionError::InvalidConfiguration(
                "attendance tracking is not enabled".into(),
            ));
        }
        validate_registered_count(registered_count, &features, &self.shared.settings.alerts())?;

        let mut tracker = self.shared.tracker.lock().await;
        if tracker.is_active() {
            return Err(SessionError::InvalidTransition(
                "lecture already in progress".into(),
            ));
        }

        let now = Utc::now();
        let session_id = Uuid::new_v4().to_string();
        let row = SessionRow {
            id: session_id.clone(),
            started_at: now,
            stopped_at: None,
            status: SessionStatus::Running,
            registered_count,
            max_observed: 0,
            min_observed: 0,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_session(&row).await?;

        tracker.start(session_id.clone(), registered_count, now)?;
        info!("lecture session {session_id} started for {registered_count} registered");

        Ok(SessionInfo {
            id: session_id,
            started_at: now,
            registered_count,
        })
    }

    pub async fn stop_session(&self) -> Result<AttendanceReport, SessionError> {
        let now = Utc::now();
        let report = {
            let mut tracker = self.shared.tracker.lock().await;
            tracker.stop(now)?
        };

        self.db.finalize_session(&report, now).await?;
        self.shared.state_tx.send_modify(|state| state.attendance = None);
        info!(
            "lecture session {} stopped; {} bodies tracked",
            report.session_id,
            report.bodies.len()
        );
        Ok(report)
    }

    /// Fetch (or serve from cache) an advisory for the current occupancy and
    /// hold it for the loop to publish until a newer one is requested.
    pub async fn request_advisory_refresh(&self) -> Arc<Advisory> {
        let occupancy = self.shared.state_tx.borrow().num_bodies;
        let advisory = self.advisory.get(occupancy, Utc::now()).await;

        *self.shared.last_advisory.write().unwrap() = Some(advisory.clone());
        self.shared
            .state_tx
            .send_modify(|state| state.advisory = Some((*advisory).clone()));
        advisory
    }

    pub fn set_features(&self, features: FeatureToggles) -> Result<()> {
        self.shared.settings.update_features(features)?;
        info!(
            "features updated: distancing={} phone={} attendance={}",
            features.distancing, features.phone, features.attendance
        );
        Ok(())
    }

    pub async fn recent_sessions(&self, limit: usize) -> Result<Vec<SessionRow>> {
        self.db.list_sessions(limit).await
    }

    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.shared.metrics.get_snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::{HvacAction, SensorSnapshot};
    use crate::models::{BodyIdentity, DetectedBody};
    use chrono::{DateTime, TimeZone};

    struct StubProvider;

    impl AdvisoryProvider for StubProvider {
        async fn refresh(&self, occupancy: usize) -> Result<Advisory> {
            Ok(Advisory {
                action: HvacAction::Fan,
                suggestion: format!("Run fan - circulate air. ({occupancy} ppl)"),
                sensor: SensorSnapshot::default(),
                external_temp_c: Some(28.0),
                fetched_at: Utc::now(),
            })
        }
    }

    fn t(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + offset_secs, 0).unwrap()
    }

    fn snapshot_with_ids(ids: &[u64], offset_secs: i64) -> DetectionSnapshot {
        DetectionSnapshot {
            timestamp: t(offset_secs),
            bodies: ids
                .iter()
                .map(|&id| DetectedBody {
                    id: Some(id),
                    position: Some([id as f32 * 10.0, 0.0, 0.0]),
                    keypoints_2d: Vec::new(),
                })
                .collect(),
        }
    }

    fn controller_fixture(dir: &std::path::Path) -> TrackingController<StubProvider> {
        let db = Database::new(dir.join("test.sqlite3")).unwrap();
        let settings = Arc::new(SettingsStore::new(dir.join("settings.json")).unwrap());
        let cache = AdvisoryCache::new(StubProvider, chrono::Duration::seconds(60));
        TrackingController::new(db, settings, cache)
    }

    async fn wait_for_tick(
        rx: &mut watch::Receiver<AggregatedState>,
        timestamp: DateTime<Utc>,
    ) {
        loop {
            if rx.borrow_and_update().timestamp == timestamp {
                return;
            }
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn full_lecture_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller_fixture(dir.path());
        let (tx, rx) = mpsc::channel(8);
        controller.start_tracking(rx).await.unwrap();
        let mut states = controller.subscribe();

        controller.start_session(10).await.unwrap();

        tx.send(snapshot_with_ids(&[1, 2], 0)).await.unwrap();
        tx.send(snapshot_with_ids(&[1, 2, 3], 1)).await.unwrap();
        tx.send(snapshot_with_ids(&[2, 3], 2)).await.unwrap();
        wait_for_tick(&mut states, t(2)).await;

        let state = controller.current();
        assert_eq!(state.num_bodies, 2);
        assert!(state.attendance.is_some());

        let report = controller.stop_session().await.unwrap();
        assert_eq!(report.max_observed, 3);
        assert_eq!(report.min_observed, 2);
        let durations: Vec<(BodyIdentity, f64)> = report
            .bodies
            .iter()
            .map(|body| (body.identity, body.duration_secs))
            .collect();
        assert_eq!(
            durations,
            vec![
                (BodyIdentity::Stable(1), 1.0),
                (BodyIdentity::Stable(2), 2.0),
                (BodyIdentity::Stable(3), 1.0),
            ]
        );

        // The finished session landed in storage.
        let sessions = controller.recent_sessions(5).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Completed);

        controller.stop_tracking().await.unwrap();
    }

    #[tokio::test]
    async fn registered_count_over_the_occupancy_limit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller_fixture(dir.path());

        // Default config: distancing enabled with a limit of 12.
        let err = controller.start_session(13).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidConfiguration(_)));

        // Session stayed inactive, so stopping is a transition error.
        let err = controller.stop_session().await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn double_session_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller_fixture(dir.path());

        controller.start_session(10).await.unwrap();
        let err = controller.start_session(10).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn advisory_refresh_is_held_for_publication() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller_fixture(dir.path());
        let (tx, rx) = mpsc::channel(8);
        controller.start_tracking(rx).await.unwrap();
        let mut states = controller.subscribe();

        let advisory = controller.request_advisory_refresh().await;
        assert_eq!(advisory.action, HvacAction::Fan);

        // The next tick republishes the advisory untouched.
        tx.send(snapshot_with_ids(&[1], 0)).await.unwrap();
        wait_for_tick(&mut states, t(0)).await;
        let state = controller.current();
        assert_eq!(state.advisory.as_ref().map(|a| a.action), Some(HvacAction::Fan));

        controller.stop_tracking().await.unwrap();
    }

    #[tokio::test]
    async fn pause_and_resume_gate_the_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller_fixture(dir.path());
        let (tx, rx) = mpsc::channel(8);
        controller.start_tracking(rx).await.unwrap();
        let mut states = controller.subscribe();

        controller.pause();
        assert!(controller.current().paused);

        controller.resume();
        tx.send(snapshot_with_ids(&[1, 2], 5)).await.unwrap();
        wait_for_tick(&mut states, t(5)).await;
        let state = controller.current();
        assert!(!state.paused);
        assert_eq!(state.num_bodies, 2);

        controller.stop_tracking().await.unwrap();
    }

    #[tokio::test]
    async fn double_start_tracking_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller_fixture(dir.path());

        let (_tx, rx) = mpsc::channel(8);
        controller.start_tracking(rx).await.unwrap();
        let (_tx2, rx2) = mpsc::channel(8);
        assert!(controller.start_tracking(rx2).await.is_err());

        controller.stop_tracking().await.unwrap();
    }
}
