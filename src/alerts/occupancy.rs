use crate::models::{Alert, AlertKind, DetectionSnapshot};

use super::AlertConfig;

/// Evaluate occupancy and pairwise-distance rules over one snapshot.
///
/// Pure function of its inputs: no state, no side effects, empty output for
/// empty input. Every unordered pair is checked each tick; counts stay in the
/// single/double digits so the O(n^2) scan is fine, and capping it would
/// silently drop alerts.
pub fn evaluate(snapshot: &DetectionSnapshot, config: &AlertConfig) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if snapshot.bodies.len() > config.occupancy_limit {
        alerts.push(Alert {
            kind: AlertKind::Occupancy,
            message: format!("More than {} bodies detected!", config.occupancy_limit),
        });
    }

    // Bodies with absent or non-finite positions are skipped rather than
    // failing the tick.
    let positions: Vec<[f32; 3]> = snapshot
        .bodies
        .iter()
        .filter_map(|body| body.position)
        .filter(|position| position.iter().all(|coord| coord.is_finite()))
        .collect();

    for i in 0..positions.len() {
        for j in (i + 1)..positions.len() {
            if distance(positions[i], positions[j]) < config.min_distance_m {
                alerts.push(Alert {
                    kind: AlertKind::Proximity,
                    message: format!("Two bodies < {}m apart!", config.min_distance_m),
                });
            }
        }
    }

    alerts
}

fn distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DetectedBody;
    use chrono::Utc;

    fn body_at(id: u64, position: [f32; 3]) -> DetectedBody {
        DetectedBody {
            id: Some(id),
            position: Some(position),
            keypoints_2d: Vec::new(),
        }
    }

    fn snapshot_of(bodies: Vec<DetectedBody>) -> DetectionSnapshot {
        DetectionSnapshot {
            timestamp: Utc::now(),
            bodies,
        }
    }

    #[test]
    fn quiet_room_raises_nothing() {
        let config = AlertConfig::default();
        let bodies = (0..3)
            .map(|i| body_at(i, [i as f32 * 5.0, 0.0, 0.0]))
            .collect();
        assert!(evaluate(&snapshot_of(bodies), &config).is_empty());
    }

    #[test]
    fn empty_snapshot_raises_nothing() {
        assert!(evaluate(&snapshot_of(Vec::new()), &AlertConfig::default()).is_empty());
    }

    #[test]
    fn one_over_the_limit_raises_exactly_one_occupancy_alert() {
        let config = AlertConfig {
            occupancy_limit: 4,
            ..AlertConfig::default()
        };
        // Far apart so no proximity alerts muddy the count; reversing the
        // order must not change the outcome.
        let mut bodies: Vec<DetectedBody> = (0..5)
            .map(|i| body_at(i, [i as f32 * 10.0, 0.0, 0.0]))
            .collect();

        for _ in 0..2 {
            let alerts = evaluate(&snapshot_of(bodies.clone()), &config);
            assert_eq!(alerts.len(), 1);
            assert_eq!(alerts[0].kind, AlertKind::Occupancy);
            bodies.reverse();
        }
    }

    #[test]
    fn thirteen_far_apart_bodies_at_default_limit() {
        let config = AlertConfig::default();
        let bodies = (0..13)
            .map(|i| body_at(i, [i as f32 * 10.0, 0.0, 0.0]))
            .collect();
        let alerts = evaluate(&snapshot_of(bodies), &config);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].message, "More than 12 bodies detected!");
    }

    #[test]
    fn every_close_pair_is_reported() {
        let config = AlertConfig::default();
        // Three bodies within a meter of each other: three pairs.
        let bodies = vec![
            body_at(1, [0.0, 0.0, 0.0]),
            body_at(2, [0.3, 0.0, 0.0]),
            body_at(3, [0.0, 0.3, 0.0]),
        ];
        let alerts = evaluate(&snapshot_of(bodies), &config);
        assert_eq!(alerts.len(), 3);
        assert!(alerts.iter().all(|a| a.kind == AlertKind::Proximity));
    }

    #[test]
    fn malformed_positions_are_skipped_not_fatal() {
        let config = AlertConfig::default();
        let mut broken = body_at(1, [f32::NAN, 0.0, 0.0]);
        broken.id = None;
        let bodies = vec![
            broken,
            DetectedBody {
                id: Some(2),
                position: None,
                keypoints_2d: Vec::new(),
            },
            body_at(3, [0.0, 0.0, 0.0]),
            body_at(4, [0.2, 0.0, 0.0]),
        ];
        let alerts = evaluate(&snapshot_of(bodies), &config);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Proximity);
    }
}
