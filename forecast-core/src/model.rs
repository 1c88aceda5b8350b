use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Link name of the point-in-time reading resource.
pub const SNAPSHOT_LINK: &str = "snapshot";
/// Link name of the multi-period forecast resource.
pub const DETAILED_FORECAST_LINK: &str = "detailed_forecast";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Latitude and longitude in the textual form used for endpoint substitution.
    pub fn query_strings(&self) -> (String, String) {
        (self.latitude.to_string(), self.longitude.to_string())
    }
}

/// A forecast site with whatever forecast data its last fetch managed to attach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub coordinates: Coordinates,
    #[serde(default)]
    pub links: BTreeMap<String, String>,
    #[serde(default)]
    pub snapshot: Option<SnapshotForecast>,
    #[serde(default)]
    pub forecast: Option<DetailedForecast>,
}

impl Site {
    /// Builds a site from the `data` section of a site metadata payload.
    ///
    /// Returns `None` when the payload lacks the identity or coordinates.
    pub fn from_payload(data: &Value) -> Option<Self> {
        let raw: SitePayload = serde_json::from_value(data.clone()).ok()?;

        Some(Self {
            id: raw.id,
            name: raw.name,
            coordinates: Coordinates::new(raw.latitude, raw.longitude),
            links: raw.links,
            snapshot: None,
            forecast: None,
        })
    }

    pub fn link(&self, name: &str) -> Option<&str> {
        self.links.get(name).map(String::as_str)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Deserialize)]
struct SitePayload {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    #[serde(default)]
    name: Option<String>,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    links: BTreeMap<String, String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotForecast {
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub temperature_c: Option<f64>,
    #[serde(default)]
    pub feels_like_c: Option<f64>,
    #[serde(default)]
    pub humidity_pct: Option<u8>,
    #[serde(default)]
    pub wind_speed_mps: Option<f64>,
    #[serde(default)]
    pub condition: Option<String>,
}

impl SnapshotForecast {
    pub fn from_payload(data: &Value) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPeriod {
    pub starts_at: DateTime<Utc>,
    #[serde(default)]
    pub temperature_c: Option<f64>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub precipitation_chance: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedForecast {
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
    pub periods: Vec<ForecastPeriod>,
}

impl DetailedForecast {
    pub fn from_payload(data: &Value) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }
}

/// Which forecast variant a fetch produces. `None` marks a fan-in task that fetches nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForecastKind {
    Snapshot,
    Detailed,
    None,
}

impl ForecastKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForecastKind::Snapshot => "snapshot",
            ForecastKind::Detailed => "detailed",
            ForecastKind::None => "none",
        }
    }
}

impl std::fmt::Display for ForecastKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed result of a forecast fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum Forecast {
    Snapshot(SnapshotForecast),
    Detailed(DetailedForecast),
}

impl Forecast {
    /// Builds the variant named by `kind` from a payload's `data` section.
    pub fn from_payload(kind: ForecastKind, data: &Value) -> Option<Self> {
        match kind {
            ForecastKind::Snapshot => SnapshotForecast::from_payload(data).map(Forecast::Snapshot),
            ForecastKind::Detailed => DetailedForecast::from_payload(data).map(Forecast::Detailed),
            ForecastKind::None => None,
        }
    }

    /// Stores this forecast in the matching slot of `site`.
    pub fn attach_to(self, site: &mut Site) {
        match self {
            Forecast::Snapshot(snapshot) => site.snapshot = Some(snapshot),
            Forecast::Detailed(detailed) => site.forecast = Some(detailed),
        }
    }
}

/// A place picked by the user, e.g. from a place search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub name: Option<String>,
    pub coordinates: Coordinates,
}

/// Every service payload wraps its content in a `data` object.
pub fn data_section(payload: &Value) -> Option<&Value> {
    payload.get("data").filter(|data| data.is_object())
}
