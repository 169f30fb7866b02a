//! Client track request and its filter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DeviceType, GeoPoint, PipelineConfig, TimeKeeper, TrackError, TrackResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    #[default]
    Default,
    /// Bounded top-K lookup; results are emitted once the input ends.
    Search,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Inputs are whole tracks: deduplicate by time, never aggregate.
    None,
    /// Aggregate fragments per track id.
    #[default]
    TrackId,
}

/// Circle around `center`; `radius_nm` in nautical miles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CircularRange {
    pub center: Option<GeoPoint>,
    pub radius_nm: f64,
}

/// Box with independently optional bounds, in degrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct LinearRange {
    pub min_latitude: Option<f64>,
    pub max_latitude: Option<f64>,
    pub min_longitude: Option<f64>,
    pub max_longitude: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TrackFilter {
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default)]
    pub registries: Vec<String>,
    #[serde(default)]
    pub device_types: Vec<DeviceType>,
    #[serde(default)]
    pub circular: Vec<CircularRange>,
    #[serde(default)]
    pub linear: Vec<LinearRange>,
}

impl TrackFilter {
    pub fn has_ranges(&self) -> bool { !self.circular.is_empty() || !self.linear.is_empty() }

    pub fn validate(&self) -> TrackResult<()> {
        for (i, c) in self.circular.iter().enumerate() {
            let Some(center) = c.center else {
                return Err(TrackError::Config(format!("circular range {} has no center", i)));
            };
            if !center.latitude.is_finite() || !center.longitude.is_finite() {
                return Err(TrackError::Config(format!("circular range {} has a non-finite center", i)));
            }
            if !c.radius_nm.is_finite() || c.radius_nm < 0.0 {
                return Err(TrackError::Config(format!("circular range {} radius must be >= 0 (got {})", i, c.radius_nm)));
            }
        }
        for (i, l) in self.linear.iter().enumerate() {
            if let (Some(lo), Some(hi)) = (l.min_latitude, l.max_latitude) {
                if lo > hi { return Err(TrackError::Config(format!("linear range {}: min_latitude > max_latitude", i))); }
            }
            if let (Some(lo), Some(hi)) = (l.min_longitude, l.max_longitude) {
                if lo > hi { return Err(TrackError::Config(format!("linear range {}: min_longitude > max_longitude", i))); }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackRequest {
    #[serde(default)]
    pub mode: RequestMode,
    /// Result cap in search mode (0 means 1).
    #[serde(default)]
    pub limit: u32,
    /// Keep every fragment instead of only the latest (historical mode).
    #[serde(default)]
    pub history: Option<Duration>,
    /// How far back the backlog query reaches.
    #[serde(default)]
    pub max_history: Option<Duration>,
    #[serde(default)]
    pub replay_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub replay_speed: f64,
    #[serde(default)]
    pub disable_merge: bool,
    #[serde(default)]
    pub disable_timeouts: bool,
    #[serde(default)]
    pub merge_mode: MergeMode,
    #[serde(default)]
    pub filter: Option<TrackFilter>,
    /// Continue with live data after the backlog (set by the façade).
    #[serde(default)]
    pub stream: bool,
}

impl Default for TrackRequest {
    fn default() -> Self {
        Self {
            mode: RequestMode::Default,
            limit: 0,
            history: None,
            max_history: None,
            replay_time: None,
            replay_speed: 1.0,
            disable_merge: false,
            disable_timeouts: false,
            merge_mode: MergeMode::TrackId,
            filter: None,
            stream: false,
        }
    }
}

impl TrackRequest {
    /// Normalise history settings: a zero history is no history, and the
    /// backlog window is never shorter than the requested history.
    pub fn populate(&mut self, cfg: &PipelineConfig) {
        if self.history.is_some_and(|h| h.is_zero()) {
            self.history = None;
        }
        if let Some(h) = self.history {
            if self.max_history.map_or(true, |m| h > m) {
                self.max_history = Some(h);
            }
        }
        if self.max_history.map_or(true, |m| m.is_zero()) {
            self.max_history = Some(cfg.default_max_history());
        }
    }

    pub fn historical(&self) -> bool { self.history.is_some() }

    pub fn search(&self) -> bool { self.mode == RequestMode::Search }

    pub fn time_keeper(&self) -> TimeKeeper {
        match self.replay_time {
            Some(t) => TimeKeeper::replay(t, self.replay_speed),
            None => TimeKeeper::wall(),
        }
    }

    pub fn validate(&self) -> TrackResult<()> {
        match &self.filter {
            Some(f) => f.validate(),
            None => Ok(()),
        }
    }
}
