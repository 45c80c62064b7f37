pub mod session;
pub mod snapshot;
pub mod state;

pub use session::{SessionInfo, SessionRow, SessionStatus};
pub use snapshot::{BodyIdentity, DetectedBody, DetectionSnapshot, Keypoint2d};
pub use state::{AggregatedState, Alert, AlertKind, AttendanceClass, AttendanceSummary};
