//! Runtime knobs with `TIDEWATCH_*` environment overrides.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Decode workers per feed (minimum 1).
    pub decode_threads: usize,
    /// Raw records waiting for a decoder.
    pub raw_queue_cap: usize,
    /// Decoded records waiting for the first stage.
    pub feed_queue_cap: usize,
    /// Output of merger / geo filter / log stages.
    pub stage_queue_cap: usize,
    /// Output of timeout / search stages.
    pub timeout_queue_cap: usize,
    /// How long a live tail poll waits before reporting idle.
    pub tail_timeout: Duration,
    /// Pause before reopening a live cursor whose position was lost.
    pub restart_pause: Duration,
    /// Shorter timeouts and history for demos/tests.
    pub fast_timers: bool,
    /// History window when the request does not ask for one.
    pub max_history: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            decode_threads: 8,
            raw_queue_cap: 128,
            feed_queue_cap: 512,
            stage_queue_cap: 128,
            timeout_queue_cap: 64,
            tail_timeout: Duration::from_millis(250),
            restart_pause: Duration::from_secs(1),
            fast_timers: false,
            max_history: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = env_parse::<usize>("TIDEWATCH_DECODE_THREADS") { cfg.decode_threads = n.max(1); }
        if let Some(n) = env_parse::<usize>("TIDEWATCH_QUEUE_CAP") { cfg.feed_queue_cap = n.max(1); }
        if let Some(ms) = env_parse::<u64>("TIDEWATCH_TAIL_MS") { cfg.tail_timeout = Duration::from_millis(ms); }
        if let Some(ms) = env_parse::<u64>("TIDEWATCH_RESTART_PAUSE_MS") { cfg.restart_pause = Duration::from_millis(ms); }
        if let Some(secs) = env_parse::<u64>("TIDEWATCH_MAX_HISTORY_SECS") { cfg.max_history = Some(Duration::from_secs(secs)); }
        cfg.fast_timers = std::env::var("TIDEWATCH_FAST_TIMERS").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        cfg
    }

    /// Timeout applied to a track with no per-device override.
    pub fn default_timeout(&self) -> chrono::Duration {
        if self.fast_timers { chrono::Duration::minutes(1) } else { chrono::Duration::minutes(15) }
    }

    /// History window used when neither the request nor the config sets one.
    pub fn default_max_history(&self) -> Duration {
        match self.max_history {
            Some(d) => d,
            None if self.fast_timers => Duration::from_secs(60),
            None => Duration::from_secs(15 * 60),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}
