//! Geographic range filter.

use geo::{GeodesicDistance, Point};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tidewatch_core::chan::{recv_or_cancel, send_or_cancel};
use tidewatch_core::{GeoPoint, LinearRange, Status, Track, TrackId, TrackRequest, TrackResult, TrackUpdate};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::PipelineStage;

const METERS_PER_NM: f64 = 1852.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeoRange {
    /// Ellipsoidal (WGS84) distance from `center` within `radius_nm`.
    Circular { center: GeoPoint, radius_nm: f64 },
    Linear(LinearRange),
}

impl GeoRange {
    pub fn contains(&self, p: GeoPoint) -> bool {
        match self {
            GeoRange::Circular { center, radius_nm } => {
                let a = Point::new(center.longitude, center.latitude);
                let b = Point::new(p.longitude, p.latitude);
                a.geodesic_distance(&b) / METERS_PER_NM <= *radius_nm
            }
            GeoRange::Linear(r) => {
                r.min_latitude.map_or(true, |v| p.latitude >= v)
                    && r.max_latitude.map_or(true, |v| p.latitude <= v)
                    && r.min_longitude.map_or(true, |v| p.longitude >= v)
                    && r.max_longitude.map_or(true, |v| p.longitude <= v)
            }
        }
    }
}

/// Allowed ranges plus the set of track ids currently inside one of them.
#[derive(Debug, Clone, Default)]
pub struct GeoDb {
    in_range: FxHashSet<TrackId>,
    ranges: SmallVec<[GeoRange; 4]>,
}

impl GeoDb {
    pub fn new(ranges: impl IntoIterator<Item = GeoRange>) -> Self {
        Self { in_range: FxHashSet::default(), ranges: ranges.into_iter().collect() }
    }

    /// Ranges of the request's filter. Fails on malformed ranges.
    pub fn from_request(req: &TrackRequest) -> TrackResult<Self> {
        let Some(f) = &req.filter else { return Ok(Self::default()) };
        f.validate()?;
        let circular = f.circular.iter().filter_map(|c| c.center.map(|center| GeoRange::Circular { center, radius_nm: c.radius_nm }));
        let linear = f.linear.iter().map(|l| GeoRange::Linear(*l));
        Ok(Self::new(circular.chain(linear)))
    }

    pub fn is_empty(&self) -> bool { self.ranges.is_empty() }

    /// Uses the most recent target's position; no position means out of range.
    pub fn is_in_range(&self, track: &Track) -> bool {
        match track.position() {
            Some(p) => self.ranges.iter().any(|r| r.contains(p)),
            None => false,
        }
    }

    /// Apply the in/out-of-range transition for `update`. `None` drops it.
    pub fn eval(&mut self, update: TrackUpdate) -> Option<TrackUpdate> {
        let Some(track) = &update.track else { return Some(update) };
        match update.status {
            Status::Current => {
                let inside = self.is_in_range(track);
                let known = self.in_range.contains(&track.id);
                match (known, inside) {
                    (false, true) => {
                        self.in_range.insert(track.id.clone());
                        Some(update)
                    }
                    (false, false) => None,
                    (true, true) => Some(update),
                    (true, false) => {
                        self.in_range.remove(&track.id);
                        metrics::counter!("geo_left_range_total", 1u64);
                        trace!(track = %track.id, "geo: left range");
                        Some(TrackUpdate { status: Status::LeftGeoRange, track: update.track })
                    }
                }
            }
            Status::Timeout if !self.in_range.contains(&track.id) => None,
            _ => Some(update),
        }
    }
}

pub struct GeoFilter {
    db: GeoDb,
    cancel: CancellationToken,
    cap: usize,
}

impl GeoFilter {
    pub fn new(req: &TrackRequest, cancel: CancellationToken, cap: usize) -> TrackResult<Self> {
        Ok(Self { db: GeoDb::from_request(req)?, cancel, cap: cap.max(1) })
    }

    pub fn with_db(db: GeoDb, cancel: CancellationToken, cap: usize) -> Self { Self { db, cancel, cap: cap.max(1) } }
}

#[async_trait::async_trait]
impl PipelineStage for GeoFilter {
    async fn start(self: Box<Self>, mut input: mpsc::Receiver<TrackUpdate>) -> TrackResult<mpsc::Receiver<TrackUpdate>> {
        if self.db.is_empty() {
            return Ok(input);
        }
        let GeoFilter { mut db, cancel, cap } = *self;
        let (tx, rx) = mpsc::channel(cap);
        debug!(ranges = db.ranges.len(), "geo: filter start");
        tokio::spawn(async move {
            while let Some(update) = recv_or_cancel(&mut input, &cancel).await {
                let Some(update) = db.eval(update) else { continue };
                if !send_or_cancel(&tx, update, &cancel).await {
                    return;
                }
            }
            debug!(in_range = db.in_range.len(), "geo: filter stopped");
        });
        Ok(rx)
    }
}
