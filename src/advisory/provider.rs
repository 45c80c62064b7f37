use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::info;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::settings::AdvisorySettings;

use super::cache::AdvisoryProvider;
use super::{Advisory, HvacAction, SensorSnapshot};

const TARGET_TEMP_C: f64 = 25.0;
const HEAT_PER_PERSON_C: f64 = 0.3;

/// Model input assembled from the two external fetches plus occupancy.
#[derive(Debug, Clone)]
pub struct HvacFeatures {
    pub sensor: SensorSnapshot,
    pub external_temp_c: f64,
    pub occupancy: usize,
}

/// Boundary to the trained HVAC model. The real model lives outside this
/// crate; the default implementation is a plain threshold rule so the
/// provider works without it.
pub trait ActionClassifier: Send + Sync {
    fn classify(&self, features: &HvacFeatures) -> HvacAction;
}

pub struct ThresholdClassifier;

impl ActionClassifier for ThresholdClassifier {
    fn classify(&self, features: &HvacFeatures) -> HvacAction {
        let Some(temperature) = features.sensor.temperature else {
            return HvacAction::Unknown;
        };
        if features.occupancy == 0 {
            return HvacAction::Idle;
        }
        let diff = adjusted_diff(temperature, features.occupancy);
        if diff > 1.0 {
            HvacAction::Cool
        } else if diff < -1.0 {
            HvacAction::Heat
        } else if diff.abs() <= 0.5 {
            HvacAction::Maintain
        } else {
            HvacAction::Fan
        }
    }
}

/// Temperature correction needed to reach the target, with each occupant
/// counted as a fixed heat contribution. Rounded to 0.1 degC.
pub fn adjusted_diff(current_temp_c: f64, occupancy: usize) -> f64 {
    let raw = current_temp_c - TARGET_TEMP_C + occupancy as f64 * HEAT_PER_PERSON_C;
    (raw * 10.0).round() / 10.0
}

pub fn suggestion_for(action: HvacAction, diff: f64, occupancy: usize) -> String {
    match action {
        HvacAction::Cool if diff > 0.0 => format!(
            "COOL by {:.1}°C to reach 25°C (incl. {} ppl).",
            diff.abs(),
            occupancy
        ),
        HvacAction::Heat if diff < 0.0 => format!(
            "HEAT by {:.1}°C to reach 25°C (incl. {} ppl).",
            diff.abs(),
            occupancy
        ),
        HvacAction::Maintain => "Maintain - temperature is optimal.".to_string(),
        HvacAction::Fan => "Run fan - circulate air.".to_string(),
        HvacAction::Idle => "Idle - no one is here.".to_string(),
        _ => "Monitor - no immediate action.".to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct PropertyEntry {
    name: String,
    #[serde(default)]
    last_value: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WeatherResponse {
    current: WeatherCurrent,
}

#[derive(Debug, Deserialize)]
struct WeatherCurrent {
    temp_c: f64,
}

struct CachedFetch<T> {
    fetched_at: Instant,
    value: T,
}

/// Advisory refresh against the sensor cloud and the weather service.
///
/// The two upstream reads are cached independently, each behind its own TTL,
/// so a refresh never waits on an upstream that answered recently.
pub struct HvacAdvisoryProvider {
    http: Client,
    cfg: AdvisorySettings,
    classifier: Box<dyn ActionClassifier>,
    sensor_cache: Mutex<Option<CachedFetch<SensorSnapshot>>>,
    weather_cache: Mutex<Option<CachedFetch<f64>>>,
}

impl HvacAdvisoryProvider {
    pub fn new(cfg: AdvisorySettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .context("failed to build HTTP client for advisory fetches")?;

        Ok(Self {
            http,
            cfg,
            classifier: Box::new(ThresholdClassifier),
            sensor_cache: Mutex::new(None),
            weather_cache: Mutex::new(None),
        })
    }

    pub fn with_classifier(mut self, classifier: Box<dyn ActionClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    async fn fetch_access_token(&self) -> Result<String> {
        let url = format!("{}/v1/clients/token", self.cfg.sensor_base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "grant_type": "client_credentials",
                "client_id": self.cfg.client_id,
                "client_secret": self.cfg.client_secret,
                "audience": self.cfg.sensor_base_url,
            }))
            .send()
            .await
            .context("sensor cloud token request failed")?
            .error_for_status()
            .context("sensor cloud rejected token request")?;

        let token: TokenResponse = response
            .json()
            .await
            .context("malformed sensor cloud token response")?;
        Ok(token.access_token)
    }

    async fn fetch_sensor_snapshot(&self) -> Result<SensorSnapshot> {
        let token = self.fetch_access_token().await?;
        let url = format!(
            "{}/v2/things/{}/properties",
            self.cfg.sensor_base_url, self.cfg.thing_id
        );
        let properties: Vec<PropertyEntry> = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .context("sensor property request failed")?
            .error_for_status()
            .context("sensor cloud rejected property request")?
            .json()
            .await
            .context("malformed sensor property response")?;

        Ok(sensor_from_properties(&properties))
    }

    /// Sensor readings, served from the sub-cache while fresh.
    async fn sensor_reading(&self) -> Result<SensorSnapshot> {
        let ttl = Duration::from_secs(self.cfg.sensor_ttl_secs);
        let mut guard = self.sensor_cache.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.fetched_at.elapsed() < ttl {
                return Ok(cached.value.clone());
            }
        }

        let snapshot = self.fetch_sensor_snapshot().await?;
        *guard = Some(CachedFetch {
            fetched_at: Instant::now(),
            value: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// External temperature, served from the sub-cache while fresh.
    async fn weather_temp(&self) -> Result<f64> {
        let ttl = Duration::from_secs(self.cfg.weather_ttl_secs);
        let mut guard = self.weather_cache.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.fetched_at.elapsed() < ttl {
                return Ok(cached.value);
            }
        }

        let url = format!(
            "{}/v1/current.json?key={}&q={}",
            self.cfg.weather_base_url, self.cfg.weather_api_key, self.cfg.city
        );
        let weather: WeatherResponse = self
            .http
            .get(&url)
            .send()
            .await
            .context("weather request failed")?
            .error_for_status()
            .context("weather service rejected request")?
            .json()
            .await
            .context("malformed weather response")?;

        *guard = Some(CachedFetch {
            fetched_at: Instant::now(),
            value: weather.current.temp_c,
        });
        Ok(weather.current.temp_c)
    }
}

impl AdvisoryProvider for HvacAdvisoryProvider {
    async fn refresh(&self, occupancy: usize) -> Result<Advisory> {
        let sensor = self.sensor_reading().await?;
        let external_temp_c = self.weather_temp().await?;

        let features = HvacFeatures {
            sensor: sensor.clone(),
            external_temp_c,
            occupancy,
        };
        let action = self.classifier.classify(&features);

        let current_temp = sensor
            .temperature
            .context("sensor bus reported no temperature")?;
        let diff = adjusted_diff(current_temp, occupancy);
        let suggestion = suggestion_for(action, diff, occupancy);
        info!("advisory refreshed: {action:?} ({suggestion})");

        Ok(Advisory {
            action,
            suggestion,
            sensor,
            external_temp_c: Some(external_temp_c),
            fetched_at: Utc::now(),
        })
    }
}

fn sensor_from_properties(properties: &[PropertyEntry]) -> SensorSnapshot {
    let mut snapshot = SensorSnapshot::default();
    for property in properties {
        let value = property.last_value.as_ref().and_then(value_as_f64);
        match property.name.to_lowercase().as_str() {
            "temperature" => snapshot.temperature = value,
            "humidity" => snapshot.humidity = value,
            "sound_level" => snapshot.sound_level = value,
            "airquality" => snapshot.air_quality = value,
            "lightlevel" => snapshot.light_level = value,
            _ => {}
        }
    }
    snapshot
}

fn value_as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(number) => number.as_f64(),
        serde_json::Value::String(text) => text.parse().ok(),
        _ => None,
    }
}
