use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::advisory::Advisory;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AlertKind {
    Occupancy,
    Proximity,
    Phone,
}

/// A single alert raised for one tick. Alerts never latch: each tick
/// recomputes its alert set from scratch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AttendanceClass {
    Poor,
    Fair,
    Good,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub classification: AttendanceClass,
    pub present: usize,
    pub registered_count: u32,
}

/// The merged view published once per tick. Immutable after construction;
/// observers only ever see whole values, never a partially-updated one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedState {
    pub timestamp: DateTime<Utc>,
    pub num_bodies: usize,
    pub alerts: Vec<Alert>,
    pub attendance: Option<AttendanceSummary>,
    pub advisory: Option<Advisory>,
    pub paused: bool,
}

impl Default for AggregatedState {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            num_bodies: 0,
            alerts: Vec::new(),
            attendance: None,
            advisory: None,
            paused: false,
        }
    }
}
