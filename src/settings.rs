use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock};

use crate::alerts::AlertConfig;

/// Which per-tick evaluations are enabled. Disabled features contribute
/// nothing and are not invoked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureToggles {
    pub distancing: bool,
    pub phone: bool,
    pub attendance: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            distancing: true,
            phone: true,
            attendance: true,
        }
    }
}

/// Advisory fetch endpoints, credentials and cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisorySettings {
    pub city: String,
    /// How long a fetched advisory stays fresh.
    pub cache_ttl_secs: u64,
    /// TTLs for the two upstream sub-fetches.
    pub sensor_ttl_secs: u64,
    pub weather_ttl_secs: u64,
    /// Background refresh cadence; `None` disables the background task and
    /// leaves explicit requests as the only trigger.
    pub auto_refresh_secs: Option<u64>,
    pub request_timeout_secs: u64,
    pub sensor_base_url: String,
    pub thing_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub weather_base_url: String,
    pub weather_api_key: String,
}

impl Default for AdvisorySettings {
    fn default() -> Self {
        Self {
            city: "Beirut".into(),
            cache_ttl_secs: 60,
            sensor_ttl_secs: 60,
            weather_ttl_secs: 300,
            auto_refresh_secs: Some(300),
            request_timeout_secs: 10,
            sensor_base_url: "https://api2.arduino.cc/iot".into(),
            thing_id: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            weather_base_url: "http://api.weatherapi.com".into(),
            weather_api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserSettings {
    features: FeatureToggles,
    alerts: AlertConfig,
    advisory: AdvisorySettings,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let mut data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            UserSettings::default()
        };
        apply_env_overrides(&mut data);

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn features(&self) -> FeatureToggles {
        self.data.read().unwrap().features
    }

    pub fn alerts(&self) -> AlertConfig {
        self.data.read().unwrap().alerts.clone()
    }

    pub fn advisory(&self) -> AdvisorySettings {
        self.data.read().unwrap().advisory.clone()
    }

    pub fn update_features(&self, features: FeatureToggles) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.features = features;
        self.persist(&guard)
    }

    pub fn update_alerts(&self, alerts: AlertConfig) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.alerts = alerts;
        self.persist(&guard)
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

/// Credentials come from the environment when present so they never need to
/// live in the settings file.
fn apply_env_overrides(data: &mut UserSettings) {
    if let Ok(client_id) = std::env::var("ROOMSENSE_CLIENT_ID") {
        data.advisory.client_id = client_id;
    }
    if let Ok(client_secret) = std::env::var("ROOMSENSE_CLIENT_SECRET") {
        data.advisory.client_secret = client_secret;
    }
    if let Ok(weather_api_key) = std::env::var("ROOMSENSE_WEATHER_KEY") {
        data.advisory.weather_api_key = weather_api_key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json")).unwrap();
        assert!(store.features().attendance);
        assert_eq!(store.alerts().occupancy_limit, 12);
        assert_eq!(store.advisory().cache_ttl_secs, 60);
    }

    #[test]
    fn updates_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::new(path.clone()).unwrap();
        store
            .update_features(FeatureToggles {
                distancing: false,
                phone: true,
                attendance: false,
            })
            .unwrap();
        store
            .update_alerts(AlertConfig {
                occupancy_limit: 8,
                ..AlertConfig::default()
            })
            .unwrap();

        let reopened = SettingsStore::new(path).unwrap();
        assert!(!reopened.features().distancing);
        assert!(!reopened.features().attendance);
        assert_eq!(reopened.alerts().occupancy_limit, 8);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();

        let store = SettingsStore::new(path).unwrap();
        assert_eq!(store.alerts().occupancy_limit, 12);
    }
}
