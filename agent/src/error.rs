//! Shared error types for the data-plane sources.

use thiserror::Error;

/// Failure reported by a probe, energy or accelerator source for one tick.
///
/// Sources never abort the tick loop: the collector logs the error, counts
/// it against the source's consecutive-failure budget and treats the tick's
/// reading as empty.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The underlying facility is not present on this host (no powercap
    /// zones, no probe support, no accelerator driver).
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// IO failure while reading the source.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The source returned data the agent could not interpret.
    #[error("malformed reading: {0}")]
    Malformed(String),
}
