//! Wall clock, or a scaled clock for replaying recorded data.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy)]
struct Replay {
    /// Real time the replay began.
    started: DateTime<Utc>,
    /// Simulated time at `started`.
    replay_time: DateTime<Utc>,
    /// Simulated seconds per real second.
    speed: f64,
}

/// Source of "now" for deadline computations.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeKeeper {
    replay: Option<Replay>,
}

impl TimeKeeper {
    pub fn wall() -> Self { Self::default() }

    /// Simulated clock starting at `replay_time`. Non-positive speeds fall back to 1.0.
    pub fn replay(replay_time: DateTime<Utc>, speed: f64) -> Self {
        let speed = if speed.is_finite() && speed > 0.0 { speed } else { 1.0 };
        Self { replay: Some(Replay { started: Utc::now(), replay_time, speed }) }
    }

    pub fn is_replay(&self) -> bool { self.replay.is_some() }

    pub fn now(&self) -> DateTime<Utc> { self.from_real(Utc::now()) }

    /// Simulated time -> real time.
    pub fn to_real(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self.replay {
            None => t,
            Some(r) => r.started + scale(t - r.replay_time, 1.0 / r.speed),
        }
    }

    /// Real time -> simulated time.
    pub fn from_real(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self.replay {
            None => t,
            Some(r) => r.replay_time + scale(t - r.started, r.speed),
        }
    }

    /// Real sleep needed for `sim` of simulated time to pass. Negative spans clamp to zero.
    pub fn real_delay(&self, sim: Duration) -> std::time::Duration {
        let real = match self.replay {
            None => sim,
            Some(r) => scale(sim, 1.0 / r.speed),
        };
        real.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

fn scale(d: Duration, factor: f64) -> Duration {
    Duration::milliseconds((d.num_milliseconds() as f64 * factor) as i64)
}
