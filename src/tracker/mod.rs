//! Registry of created resources and partial-failure cleanup.
//!
//! Every resource a session creates is registered here before control
//! returns to the caller. [`ResourceTracker::clean`] attempts teardown of
//! each entry in registration order, isolates failures per resource, and
//! keeps failed entries registered so a later clean can retry them.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LifecycleError;

/// Future returned by [`TrackedResource::teardown`].
pub type TeardownFuture<'a> = Pin<Box<dyn Future<Output = Result<(), LifecycleError>> + Send + 'a>>;

/// A provider resource that can be torn down by the tracker.
pub trait TrackedResource: Send + Sync {
    /// Human-readable description used in logs and cleanup failures, for
    /// example `instance i-123`.
    fn describe(&self) -> String;

    /// Tears the resource down. When `wait` is set the future resolves only
    /// once the provider confirms removal.
    fn teardown(&self, wait: bool) -> TeardownFuture<'_>;
}

/// Identifier assigned to a registered resource.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ResourceId(Uuid);

impl ResourceId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Teardown failure of a single tracked resource.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to clean up {resource}: {source}")]
pub struct CleanupFailure {
    /// Description of the resource that could not be removed.
    pub resource: String,
    /// Underlying teardown error.
    pub source: LifecycleError,
}

/// Outcome of a cleanup pass. Empty when every resource was removed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CleanupReport {
    failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub(crate) const fn from_failures(failures: Vec<CleanupFailure>) -> Self {
        Self { failures }
    }

    /// Returns `true` when no teardown failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of resources that failed to tear down.
    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Returns `true` when the report holds no failures.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Iterates over the recorded failures in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &CleanupFailure> {
        self.failures.iter()
    }

    /// Consumes the report, returning the failures.
    #[must_use]
    pub fn into_failures(self) -> Vec<CleanupFailure> {
        self.failures
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            return f.write_str("all resources cleaned up");
        }
        write!(f, "{} resource(s) failed to clean up", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

type Entry = (ResourceId, Arc<dyn TrackedResource>);

/// Ordered registry of live resources.
#[derive(Default)]
pub struct ResourceTracker {
    entries: Mutex<Vec<Entry>>,
}

impl ResourceTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `resource` and returns its identifier.
    pub fn register(&self, resource: Arc<dyn TrackedResource>) -> ResourceId {
        let id = ResourceId::new();
        debug!(resource = %resource.describe(), %id, "tracking resource");
        self.entries.lock().push((id, resource));
        id
    }

    /// Stops tracking a resource the caller removed explicitly. Returns
    /// `false` when the identifier was not registered.
    pub fn forget(&self, id: ResourceId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Number of resources currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` when nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Descriptions of tracked resources in registration order.
    #[must_use]
    pub fn describe_all(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|(_, resource)| resource.describe())
            .collect()
    }

    /// Tears down every tracked resource, in registration order.
    ///
    /// A failure on one resource never prevents attempts on the others.
    /// Removed resources are no longer tracked; failed ones stay tracked and
    /// are listed in the returned report.
    pub async fn clean(&self, wait: bool) -> CleanupReport {
        let snapshot = std::mem::take(&mut *self.entries.lock());
        let mut failed: Vec<Entry> = Vec::new();
        let mut report = CleanupReport::default();

        for (id, resource) in snapshot {
            let description = resource.describe();
            match resource.teardown(wait).await {
                Ok(()) => debug!(resource = %description, "cleaned up resource"),
                Err(source) => {
                    warn!(resource = %description, error = %source, "cleanup failed");
                    report.failures.push(CleanupFailure {
                        resource: description,
                        source,
                    });
                    failed.push((id, resource));
                }
            }
        }

        if !failed.is_empty() {
            let mut entries = self.entries.lock();
            let registered_meanwhile = std::mem::take(&mut *entries);
            failed.extend(registered_meanwhile);
            *entries = failed;
        }
        report
    }
}

impl fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("resources", &self.describe_all())
            .finish()
    }
}
