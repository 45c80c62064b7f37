mod cache;
mod provider;

pub use cache::{AdvisoryCache, AdvisoryProvider};
pub use provider::{
    ActionClassifier, HvacAdvisoryProvider, HvacFeatures, ThresholdClassifier,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// HVAC action predicted by the classifier collaborator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HvacAction {
    Cool,
    Heat,
    Maintain,
    Fan,
    Idle,
    Unknown,
}

/// Latest values of the room's environmental sensors. Any reading may be
/// missing if the sensor bus did not report it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorSnapshot {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub sound_level: Option<f64>,
    pub air_quality: Option<f64>,
    pub light_level: Option<f64>,
}

/// A cached environmental recommendation. Replaced wholesale on refresh,
/// never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Advisory {
    pub action: HvacAction,
    pub suggestion: String,
    pub sensor: SensorSnapshot,
    pub external_temp_c: Option<f64>,
    pub fetched_at: DateTime<Utc>,
}

impl Advisory {
    /// Neutral advisory used when no refresh has ever succeeded.
    pub fn fallback(now: DateTime<Utc>) -> Self {
        Self {
            action: HvacAction::Unknown,
            suggestion: "Monitor - no immediate action.".to_string(),
            sensor: SensorSnapshot::default(),
            external_temp_c: None,
            fetched_at: now,
        }
    }
}
