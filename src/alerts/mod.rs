pub mod occupancy;
pub mod phone;

use serde::{Deserialize, Serialize};

/// Thresholds for the per-tick alert evaluators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertConfig {
    /// Maximum body count before an occupancy alert fires.
    pub occupancy_limit: usize,

    /// Minimum allowed distance between two bodies, in meters.
    pub min_distance_m: f32,

    /// Nose-to-neck vertical distance (pixels) below which the head is
    /// considered bent over a phone.
    pub phone_y_threshold_px: f32,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            occupancy_limit: 12,
            min_distance_m: 1.0,
            phone_y_threshold_px: 40.0,
        }
    }
}
