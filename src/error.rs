use thiserror::Error;

/// Errors surfaced by cache construction.
///
/// Nothing after construction errors: operations on a closed cache are
/// silent no-ops, and steady-state back-pressure (dropped sets, dropped get
/// signals, rejected candidates) is only visible through [`Metrics`].
///
/// [`Metrics`]: crate::Metrics
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("num_counters must be greater than zero")]
    InvalidNumCounters,

    #[error("max_cost must be greater than zero")]
    InvalidMaxCost,

    #[error("buffer_items must be greater than zero")]
    InvalidBufferItems,
}
