use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::advisory::Advisory;
use crate::alerts::{occupancy, phone};
use crate::attendance::AttendanceTracker;
use crate::metrics::{TickMetrics, TickMetricsCollector};
use crate::models::{AggregatedState, AttendanceSummary, DetectionSnapshot};
use crate::settings::SettingsStore;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

// Import the logging macros (exported at crate root)
use crate::{log_info, log_warn};

/// State shared between the aggregation worker and the controller.
pub(crate) struct LoopShared {
    pub tracker: Arc<Mutex<AttendanceTracker>>,
    pub settings: Arc<SettingsStore>,
    pub last_advisory: RwLock<Option<Arc<Advisory>>>,
    pub state_tx: watch::Sender<AggregatedState>,
    pub paused: AtomicBool,
    pub metrics: TickMetricsCollector,
}

/// Drives one tick per incoming snapshot until the feed closes or the
/// controller cancels. Runs at the device's native frame cadence; a tick the
/// device fails to produce simply never arrives here.
pub(crate) async fn aggregation_loop(
    mut snapshots: mpsc::Receiver<DetectionSnapshot>,
    shared: Arc<LoopShared>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            received = snapshots.recv() => match received {
                Some(snapshot) => process_tick(&shared, snapshot).await,
                None => {
                    log_info!("snapshot feed closed; aggregation loop exiting");
                    break;
                }
            },
            _ = cancel_token.cancelled() => {
                log_info!("aggregation loop shutting down");
                break;
            }
        }
    }
}

async fn process_tick(shared: &LoopShared, snapshot: DetectionSnapshot) {
    if shared.paused.load(Ordering::Relaxed) {
        // Drop the frame but keep the published state honest about it.
        shared.state_tx.send_modify(|state| state.paused = true);
        return;
    }

    let tick_start = Instant::now();
    let features = shared.settings.features();
    let alert_config = shared.settings.alerts();

    // Fixed alert order: occupancy, proximity, then phone.
    let mut alerts = Vec::new();
    if features.distancing {
        alerts.extend(occupancy::evaluate(&snapshot, &alert_config));
    }
    if features.phone {
        alerts.extend(phone::evaluate(&snapshot, &alert_config));
    }
    let evaluate_ms = tick_start.elapsed().as_millis() as u64;

    let attendance = observe_attendance(shared, &snapshot).await;

    // The advisory is only ever refreshed on request; ticks republish the
    // value the controller last stored.
    let advisory = shared
        .last_advisory
        .read()
        .unwrap()
        .as_ref()
        .map(|advisory| (**advisory).clone());

    let state = AggregatedState {
        timestamp: snapshot.timestamp,
        num_bodies: snapshot.bodies.len(),
        alerts,
        attendance,
        advisory,
        paused: false,
    };

    let num_alerts = state.alerts.len();
    shared.state_tx.send_replace(state);

    shared
        .metrics
        .record_tick(TickMetrics {
            timestamp: snapshot.timestamp,
            num_bodies: snapshot.bodies.len(),
            num_alerts,
            evaluate_ms,
            total_ms: tick_start.elapsed().as_millis() as u64,
        })
        .await;
}

async fn observe_attendance(
    shared: &LoopShared,
    snapshot: &DetectionSnapshot,
) -> Option<AttendanceSummary> {
    if !shared.settings.features().attendance {
        return None;
    }

    let mut tracker = shared.tracker.lock().await;
    if !tracker.is_active() {
        return None;
    }

    match tracker.observe(snapshot, snapshot.timestamp) {
        Ok(summary) => Some(summary),
        Err(err) => {
            // Lost a race with stop_session; the tick carries on without a summary.
            log_warn!("attendance observation skipped: {err}");
            None
        }
    }
}
