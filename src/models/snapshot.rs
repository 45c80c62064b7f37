use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single 2D keypoint, normalized at ingestion.
///
/// Device drivers emit keypoints in several shapes: `[x, y]` pairs,
/// `[x, y, confidence]` triples, or `{x, y, confidence}` records. All three
/// deserialize into this one shape; downstream code never inspects the wire
/// form again.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "KeypointWire")]
pub struct Keypoint2d {
    pub x: f32,
    pub y: f32,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum KeypointWire {
    Labeled {
        x: f32,
        y: f32,
        #[serde(default)]
        confidence: Option<f32>,
    },
    Triple([f32; 3]),
    Pair([f32; 2]),
}

impl From<KeypointWire> for Keypoint2d {
    fn from(wire: KeypointWire) -> Self {
        match wire {
            KeypointWire::Labeled { x, y, confidence } => Self { x, y, confidence },
            KeypointWire::Triple([x, y, c]) => Self {
                x,
                y,
                confidence: Some(c),
            },
            KeypointWire::Pair([x, y]) => Self {
                x,
                y,
                confidence: None,
            },
        }
    }
}

/// Identity of a detected body within a tracking session.
///
/// `Stable` carries the device-assigned track id and persists across
/// consecutive snapshots. `Ephemeral` is a structural hash of the body's
/// content for one tick only, used when the device provides no id;
/// presence-duration guarantees apply to `Stable` identities only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BodyIdentity {
    Stable(u64),
    Ephemeral(u64),
}

impl BodyIdentity {
    pub fn is_stable(&self) -> bool {
        matches!(self, BodyIdentity::Stable(_))
    }
}

impl fmt::Display for BodyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyIdentity::Stable(id) => write!(f, "{id}"),
            BodyIdentity::Ephemeral(hash) => write!(f, "anon-{:08x}", hash & 0xffff_ffff),
        }
    }
}

/// One detected body in a snapshot: device track id (if tracking held),
/// 3D position in meters, and 2D skeleton keypoints in pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedBody {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub position: Option<[f32; 3]>,
    #[serde(default)]
    pub keypoints_2d: Vec<Keypoint2d>,
}

impl DetectedBody {
    /// Identity for this body, falling back to a structural hash when the
    /// device did not assign a track id. The fallback never fails, but it is
    /// lossy: the same person may hash differently on the next tick.
    pub fn identity(&self) -> BodyIdentity {
        match self.id {
            Some(id) => BodyIdentity::Stable(id),
            None => BodyIdentity::Ephemeral(self.structural_hash()),
        }
    }

    fn structural_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        if let Some(position) = self.position {
            for coord in position {
                coord.to_bits().hash(&mut hasher);
            }
        }
        for keypoint in &self.keypoints_2d {
            keypoint.x.to_bits().hash(&mut hasher);
            keypoint.y.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// One tick's worth of detections. Immutable once produced; the aggregation
/// loop owns each snapshot for exactly one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionSnapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub bodies: Vec<DetectedBody>,
}
