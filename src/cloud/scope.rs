//! Outcome of scoped acquisition.

use thiserror::Error;

use crate::tracker::CleanupReport;

/// Failure of a scoped block: the body, the cleanup that followed it, or
/// both. The body failure is never discarded.
#[derive(Debug, Error)]
pub enum ScopeError<E> {
    /// The body failed and cleanup succeeded.
    #[error("scoped body failed: {0}")]
    Body(E),
    /// The body succeeded but cleanup left resources behind.
    #[error("cleanup after scoped body failed: {0}")]
    Cleanup(CleanupReport),
    /// Both the body and the cleanup failed.
    #[error("scoped body failed: {body}; cleanup also failed: {cleanup}")]
    BodyAndCleanup {
        /// Failure raised by the body.
        body: E,
        /// Resources that could not be cleaned up.
        cleanup: CleanupReport,
    },
}

impl<E> ScopeError<E> {
    /// Combines a body outcome with the cleanup that followed it.
    ///
    /// # Errors
    ///
    /// Returns the matching [`ScopeError`] variant when either side failed.
    pub fn settle<T>(outcome: Result<T, E>, cleanup: CleanupReport) -> Result<T, Self> {
        match (outcome, cleanup.is_clean()) {
            (Ok(value), true) => Ok(value),
            (Ok(_), false) => Err(Self::Cleanup(cleanup)),
            (Err(body), true) => Err(Self::Body(body)),
            (Err(body), false) => Err(Self::BodyAndCleanup { body, cleanup }),
        }
    }

    /// Body failure, when there was one.
    #[must_use]
    pub const fn body(&self) -> Option<&E> {
        match self {
            Self::Body(body) | Self::BodyAndCleanup { body, .. } => Some(body),
            Self::Cleanup(_) => None,
        }
    }

    /// Cleanup report, when cleanup failed.
    #[must_use]
    pub const fn cleanup(&self) -> Option<&CleanupReport> {
        match self {
            Self::Cleanup(cleanup) | Self::BodyAndCleanup { cleanup, .. } => Some(cleanup),
            Self::Body(_) => None,
        }
    }
}
