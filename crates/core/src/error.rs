//! Errors surfaced while building or running a pipeline.

/// Recoverable, caller-visible errors. Broken internal invariants panic instead.
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    /// Bad or contradictory request/filter; returned from stage construction.
    #[error("configuration: {0}")]
    Config(String),
    /// Non-transient document store failure.
    #[error("store: {0}")]
    Store(String),
    /// The pipeline was canceled while a stage was being wired up.
    #[error("canceled")]
    Canceled,
}

pub type TrackResult<T> = Result<T, TrackError>;
