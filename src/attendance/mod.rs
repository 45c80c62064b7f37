use std::collections::HashMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alerts::AlertConfig;
use crate::models::{
    AttendanceClass, AttendanceSummary, BodyIdentity, DetectionSnapshot,
};
use crate::settings::FeatureToggles;

/// Hard ceiling on registered attendees when no occupancy limit applies.
pub const ROOM_CAPACITY: u32 = 30;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Presence window for one body across a session. Never removed once
/// created, so a body that drops out of tracking and returns keeps
/// accumulating onto its original record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub identity: BodyIdentity,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyDuration {
    pub identity: BodyIdentity,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub duration_secs: f64,
}

/// Final durations report produced when a session stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceReport {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub registered_count: u32,
    pub max_observed: usize,
    pub min_observed: usize,
    pub bodies: Vec<BodyDuration>,
}

impl AttendanceReport {
    /// Human-readable lecture report.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "----- Lecture Attendance Tracking Report -----");
        let _ = writeln!(out, "Lecture Duration: {:.2} seconds", self.duration_secs);
        let _ = writeln!(out, "Max attendees: {}", self.max_observed);
        let _ = writeln!(out, "Min attendees: {}", self.min_observed);
        let _ = writeln!(out, "Registered Students: {}", self.registered_count);
        let _ = writeln!(out);
        let _ = writeln!(out, "Individual Tracking:");
        for body in &self.bodies {
            let _ = writeln!(out, "Body {}: {:.2}s", body.identity, body.duration_secs);
        }
        let _ = write!(out, "----- End of Report -----");
        out
    }
}

struct ActiveSession {
    id: String,
    registered_count: u32,
    started_at: DateTime<Utc>,
    max_observed: usize,
    min_observed: usize,
    // Records in first-seen order, with an index for upserts.
    records: Vec<AttendanceRecord>,
    index: HashMap<BodyIdentity, usize>,
}

/// Attendance state machine: Inactive until `start`, back to Inactive on
/// `stop`. Observation is only valid while Active; the owning controller
/// serializes start/stop/observe behind one lock.
#[derive(Default)]
pub struct AttendanceTracker {
    session: Option<ActiveSession>,
}

impl AttendanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn active_session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.id.as_str())
    }

    pub fn start(
        &mut self,
        session_id: String,
        registered_count: u32,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        if self.session.is_some() {
            return Err(SessionError::InvalidTransition(
                "lecture already in progress".into(),
            ));
        }
        if registered_count == 0 {
            return Err(SessionError::InvalidConfiguration(
                "registered count must be greater than zero".into(),
            ));
        }

        self.session = Some(ActiveSession {
            id: session_id,
            registered_count,
            started_at: now,
            max_observed: 0,
            min_observed: usize::MAX,
            records: Vec::new(),
            index: HashMap::new(),
        });
        Ok(())
    }

    pub fn observe(
        &mut self,
        snapshot: &DetectionSnapshot,
        now: DateTime<Utc>,
    ) -> Result<AttendanceSummary, SessionError> {
        let session = self.session.as_mut().ok_or_else(|| {
            SessionError::InvalidTransition("no active lecture to observe".into())
        })?;

        let present = snapshot.bodies.len();
        session.max_observed = session.max_observed.max(present);
        session.min_observed = session.min_observed.min(present);

        for body in &snapshot.bodies {
            let identity = body.identity();
            match session.index.get(&identity) {
                Some(&slot) => session.records[slot].last_seen = now,
                None => {
                    session.index.insert(identity, session.records.len());
                    session.records.push(AttendanceRecord {
                        identity,
                        first_seen: now,
                        last_seen: now,
                    });
                }
            }
        }

        Ok(AttendanceSummary {
            classification: classify(session.max_observed, session.registered_count),
            present,
            registered_count: session.registered_count,
        })
    }

    pub fn stop(&mut self, now: DateTime<Utc>) -> Result<AttendanceReport, SessionError> {
        let session = self.session.take().ok_or_else(|| {
            SessionError::InvalidTransition("no active lecture to stop".into())
        })?;

        let bodies = session
            .records
            .into_iter()
            .map(|record| BodyDuration {
                identity: record.identity,
                first_seen: record.first_seen,
                last_seen: record.last_seen,
                duration_secs: seconds_between(record.first_seen, record.last_seen),
            })
            .collect();

        Ok(AttendanceReport {
            session_id: session.id,
            started_at: session.started_at,
            stopped_at: now,
            duration_secs: seconds_between(session.started_at, now),
            registered_count: session.registered_count,
            max_observed: session.max_observed,
            // A session stopped before any tick has no meaningful minimum.
            min_observed: session.min_observed.min(session.max_observed),
            bodies,
        })
    }
}

/// Registered-count precondition, enforced before `start` may succeed: with
/// the distancing feature on, the room must fit under the occupancy limit;
/// otherwise the fixed room capacity applies.
pub fn validate_registered_count(
    registered_count: u32,
    features: &FeatureToggles,
    alerts: &AlertConfig,
) -> Result<(), SessionError> {
    if registered_count == 0 {
        return Err(SessionError::InvalidConfiguration(
            "registered count must be greater than zero".into(),
        ));
    }
    if features.distancing && registered_count as usize > alerts.occupancy_limit {
        return Err(SessionError::InvalidConfiguration(format!(
            "registered count {} exceeds occupancy limit {}",
            registered_count, alerts.occupancy_limit
        )));
    }
    if !features.distancing && registered_count > ROOM_CAPACITY {
        return Err(SessionError::InvalidConfiguration(format!(
            "registered count {registered_count} exceeds room capacity {ROOM_CAPACITY}"
        )));
    }
    Ok(())
}

fn classify(max_observed: usize, registered_count: u32) -> AttendanceClass {
    let ratio = max_observed as f64 / registered_count as f64;
    if ratio < 1.0 / 3.0 {
        AttendanceClass::Poor
    } else if ratio <= 2.0 / 3.0 {
        AttendanceClass::Fair
    } else {
        AttendanceClass::Good
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DetectedBody;
    use chrono::TimeZone;

    fn snapshot_with_ids(ids: &[u64], timestamp: DateTime<Utc>) -> DetectionSnapshot {
        DetectionSnapshot {
            timestamp,
            bodies: ids
                .iter()
                .map(|&id| DetectedBody {
                    id: Some(id),
                    position: Some([0.0, 0.0, 0.0]),
                    keypoints_2d: Vec::new(),
                })
                .collect(),
        }
    }

    fn t(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + offset_secs, 0).unwrap()
    }

    #[test]
    fn start_twice_is_an_invalid_transition() {
        let mut tracker = AttendanceTracker::new();
        tracker.start("a".into(), 10, t(0)).unwrap();
        let err = tracker.start("b".into(), 10, t(1)).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition(_)));
        assert_eq!(tracker.active_session_id(), Some("a"));
    }

    #[test]
    fn zero_registered_count_is_rejected_at_start() {
        let mut tracker = AttendanceTracker::new();
        let err = tracker.start("a".into(), 0, t(0)).unwrap_err();
        assert!(matches!(err, SessionError::InvalidConfiguration(_)));
        assert!(!tracker.is_active());
    }

    #[test]
    fn observe_and_stop_require_an_active_session() {
        let mut tracker = AttendanceTracker::new();
        let snapshot = snapshot_with_ids(&[1], t(0));
        assert!(matches!(
            tracker.observe(&snapshot, t(0)),
            Err(SessionError::InvalidTransition(_))
        ));
        assert!(matches!(
            tracker.stop(t(0)),
            Err(SessionError::InvalidTransition(_))
        ));
    }

    #[test]
    fn round_trip_tracks_extrema_and_durations() {
        let mut tracker = AttendanceTracker::new();
        tracker.start("lecture".into(), 10, t(0)).unwrap();

        tracker.observe(&snapshot_with_ids(&[1, 2], t(0)), t(0)).unwrap();
        tracker
            .observe(&snapshot_with_ids(&[1, 2, 3], t(1)), t(1))
            .unwrap();
        tracker.observe(&snapshot_with_ids(&[2, 3], t(2)), t(2)).unwrap();

        let report = tracker.stop(t(3)).unwrap();
        assert_eq!(report.max_observed, 3);
        assert_eq!(report.min_observed, 2);
        assert_eq!(report.registered_count, 10);
        assert!(!tracker.is_active());

        // First-seen insertion order, with durations matching tick spacing.
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
    }

    #[test]
    fn reappearing_body_extends_its_original_record() {
        let mut tracker = AttendanceTracker::new();
        tracker.start("lecture".into(), 5, t(0)).unwrap();
        tracker.observe(&snapshot_with_ids(&[1], t(0)), t(0)).unwrap();
        tracker.observe(&snapshot_with_ids(&[], t(1)), t(1)).unwrap();
        tracker.observe(&snapshot_with_ids(&[1], t(5)), t(5)).unwrap();

        let report = tracker.stop(t(6)).unwrap();
        assert_eq!(report.bodies.len(), 1);
        assert_eq!(report.bodies[0].duration_secs, 5.0);
    }

    #[test]
    fn classification_tiers_follow_the_ratio() {
        assert_eq!(classify(2, 10), AttendanceClass::Poor);
        assert_eq!(classify(4, 10), AttendanceClass::Fair);
        assert_eq!(classify(9, 10), AttendanceClass::Good);
    }

    #[test]
    fn classification_is_monotonic_in_max_observed() {
        let registered = 12;
        let mut best_seen = 0;
        for max_observed in 0..=registered as usize {
            let rank = match classify(max_observed, registered) {
                AttendanceClass::Poor => 0,
                AttendanceClass::Fair => 1,
                AttendanceClass::Good => 2,
            };
            assert!(rank >= best_seen);
            best_seen = rank;
        }
    }

    #[test]
    fn summary_classifies_from_running_maximum() {
        let mut tracker = AttendanceTracker::new();
        tracker.start("lecture".into(), 9, t(0)).unwrap();
        tracker
            .observe(&snapshot_with_ids(&[1, 2, 3, 4, 5, 6, 7], t(0)), t(0))
            .unwrap();
        // Attendance thinned out, but the classification keys off the peak.
        let summary = tracker.observe(&snapshot_with_ids(&[1], t(1)), t(1)).unwrap();
        assert_eq!(summary.classification, AttendanceClass::Good);
        assert_eq!(summary.present, 1);
    }

    #[test]
    fn registered_count_must_fit_the_enabled_limits() {
        let features = FeatureToggles {
            distancing: true,
            phone: true,
            attendance: true,
        };
        let alerts = AlertConfig::default();
        assert!(matches!(
            validate_registered_count(13, &features, &alerts),
            Err(SessionError::InvalidConfiguration(_))
        ));
        assert!(validate_registered_count(12, &features, &alerts).is_ok());

        let without_distancing = FeatureToggles {
            distancing: false,
            ..features
        };
        assert!(validate_registered_count(13, &without_distancing, &alerts).is_ok());
        assert!(matches!(
            validate_registered_count(31, &without_distancing, &alerts),
            Err(SessionError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn report_text_matches_the_lecture_layout() {
        let mut tracker = AttendanceTracker::new();
        tracker.start("lecture".into(), 10, t(0)).unwrap();
        tracker.observe(&snapshot_with_ids(&[1, 2], t(0)), t(0)).unwrap();
        tracker.observe(&snapshot_with_ids(&[1], t(2)), t(2)).unwrap();

        let text = tracker.stop(t(3)).unwrap().render_text();
        assert!(text.starts_with("----- Lecture Attendance Tracking Report -----"));
        assert!(text.contains("Max attendees: 2"));
        assert!(text.contains("Min attendees: 1"));
        assert!(text.contains("Body 1: 2.00s"));
        assert!(text.contains("Body 2: 0.00s"));
        assert!(text.ends_with("----- End of Report -----"));
    }
}
