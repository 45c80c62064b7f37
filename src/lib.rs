pub mod advisory;
pub mod alerts;
pub mod attendance;
pub mod db;
pub mod metrics;
pub mod models;
pub mod settings;
pub mod tracking;
mod utils;

pub use advisory::{Advisory, AdvisoryCache, AdvisoryProvider, HvacAction, HvacAdvisoryProvider};
pub use alerts::AlertConfig;
pub use attendance::{AttendanceReport, AttendanceTracker, SessionError};
pub use db::Database;
pub use models::{AggregatedState, Alert, AlertKind, DetectionSnapshot};
pub use settings::{FeatureToggles, SettingsStore};
pub use tracking::TrackingController;
