//! Tidewatch core types: tracks, fragments and the update envelope that flows
//! between pipeline stages.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod chan;
pub mod clock;
pub mod config;
pub mod error;
pub mod request;

pub use clock::TimeKeeper;
pub use config::PipelineConfig;
pub use error::{TrackError, TrackResult};
pub use request::{CircularRange, LinearRange, MergeMode, RequestMode, TrackFilter, TrackRequest};

pub type TrackId = String;

/// Kind of sensor or transport that produced a fragment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    Unknown,
    Ais,
    Radar,
    Adsb,
    Omnicom,
    Sart,
    Spidertracks,
    Manual,
    /// Output of the fusion engine; always sorts ahead of raw sensor data.
    Fusion,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self { Self { latitude, longitude } }
}

/// A positional report for a track from one sensor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    #[serde(default)]
    pub device_type: DeviceType,
    /// Event time declared by the sensor.
    pub time: DateTime<Utc>,
    /// When the platform last refreshed this report. Targets without one never
    /// extend a timeout deadline.
    #[serde(default)]
    pub update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub position: Option<GeoPoint>,
    /// Periodic beacon (as opposed to a one-off report).
    #[serde(default)]
    pub repeat: bool,
    /// Operator asked for this (manual) track to be timed out now.
    #[serde(default)]
    pub force_timeout: bool,
    /// Transport reported the target as lost.
    #[serde(default)]
    pub lost_signal: bool,
}

impl Target {
    pub fn new(device_type: DeviceType, time: DateTime<Utc>) -> Self {
        Self {
            device_type,
            time,
            update_time: Some(time),
            position: None,
            repeat: false,
            force_timeout: false,
            lost_signal: false,
        }
    }

    pub fn at(mut self, latitude: f64, longitude: f64) -> Self {
        self.position = Some(GeoPoint::new(latitude, longitude));
        self
    }
}

/// Static/descriptive data about a track (name, registry info, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    #[serde(default)]
    pub device_type: DeviceType,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Metadata {
    pub fn new(device_type: DeviceType, time: DateTime<Utc>, name: Option<&str>) -> Self {
        Self { device_type, time, name: name.map(|s| s.to_string()) }
    }
}

/// Common view over targets and metadata used by the merger's ordering rules.
pub trait Fragment {
    fn time(&self) -> DateTime<Utc>;
    fn device_type(&self) -> DeviceType;
}

impl Fragment for Target {
    fn time(&self) -> DateTime<Utc> { self.time }
    fn device_type(&self) -> DeviceType { self.device_type }
}

impl Fragment for Metadata {
    fn time(&self) -> DateTime<Utc> { self.time }
    fn device_type(&self) -> DeviceType { self.device_type }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Track {
    pub id: TrackId,
    #[serde(default)]
    pub registry_id: Option<String>,
    /// Most recent first.
    #[serde(default)]
    pub targets: Vec<Target>,
    /// Most recent first.
    #[serde(default)]
    pub metadata: Vec<Metadata>,
}

impl Track {
    pub fn new(id: impl Into<TrackId>) -> Self {
        Self { id: id.into(), registry_id: None, targets: Vec::with_capacity(8), metadata: Vec::with_capacity(8) }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.push(metadata);
        self
    }

    /// Latest fragment time across targets and metadata.
    pub fn latest_time(&self) -> Option<DateTime<Utc>> {
        let t = self.targets.iter().map(|t| t.time);
        let m = self.metadata.iter().map(|m| m.time);
        t.chain(m).max()
    }

    /// Position of the most recent target, if it has one.
    pub fn position(&self) -> Option<GeoPoint> {
        self.targets.first().and_then(|t| t.position)
    }

    /// Display name from the most recent metadata.
    pub fn name(&self) -> Option<&str> {
        self.metadata.first().and_then(|m| m.name.as_deref())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Current,
    Timeout,
    LeftGeoRange,
    InitialLoadDone,
    Closing,
    Starting,
    SetupDone,
    #[default]
    Unknown,
}

impl Status {
    /// Stream lifecycle markers carry no track.
    pub fn is_marker(self) -> bool {
        matches!(self, Status::InitialLoadDone | Status::Closing | Status::Starting | Status::SetupDone)
    }
}

/// Unit of flow between pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TrackUpdate {
    pub status: Status,
    pub track: Option<Track>,
}

impl TrackUpdate {
    pub fn current(track: Track) -> Self { Self { status: Status::Current, track: Some(track) } }
    pub fn marker(status: Status) -> Self { Self { status, track: None } }
    pub fn with_status(status: Status, track: Track) -> Self { Self { status, track: Some(track) } }

    pub fn track_id(&self) -> Option<&str> { self.track.as_ref().map(|t| t.id.as_str()) }
}

pub mod prelude {
    pub use super::{
        DeviceType, Fragment, GeoPoint, Metadata, Status, Target, Track, TrackId, TrackUpdate,
    };
    pub use super::{PipelineConfig, TimeKeeper, TrackError, TrackResult};
}
