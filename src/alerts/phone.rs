use crate::models::{Alert, AlertKind, DetectionSnapshot};

use super::AlertConfig;

const NOSE: usize = 0;
const NECK: usize = 1;

/// Evaluate the phone-use heuristic over one snapshot.
///
/// Only the first body in the snapshot is inspected. A head bent toward a
/// phone brings the nose keypoint close to the neck keypoint in the vertical
/// axis; a nose-to-neck y distance under the threshold raises the alert.
/// Bodies with fewer than two keypoints yield no alert and no error.
pub fn evaluate(snapshot: &DetectionSnapshot, config: &AlertConfig) -> Vec<Alert> {
    let Some(body) = snapshot.bodies.first() else {
        return Vec::new();
    };
    let (Some(nose), Some(neck)) = (body.keypoints_2d.get(NOSE), body.keypoints_2d.get(NECK))
    else {
        return Vec::new();
    };

    let gap = (nose.y - neck.y).abs();
    if gap.is_finite() && gap < config.phone_y_threshold_px {
        vec![Alert {
            kind: AlertKind::Phone,
            message: format!("Phone usage alert for body {}!", body.identity()),
        }]
    } else {
        Vec::new()
    }
}
