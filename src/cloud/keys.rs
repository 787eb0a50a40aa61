//! Uploaded keys as tracked resources.

use std::sync::Arc;

use crate::provider::ProviderAdapter;
use crate::tracker::{TeardownFuture, TrackedResource};

/// Key uploaded by the session; removed from the provider on cleanup.
pub(super) struct UploadedKey {
    name: String,
    provider: Arc<dyn ProviderAdapter>,
}

impl UploadedKey {
    pub(super) fn new(name: &str, provider: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            name: name.to_owned(),
            provider,
        }
    }
}

impl TrackedResource for UploadedKey {
    fn describe(&self) -> String {
        format!("key {}", self.name)
    }

    fn teardown(&self, _wait: bool) -> TeardownFuture<'_> {
        Box::pin(async move {
            self.provider.delete_key(&self.name).await?;
            Ok(())
        })
    }
}
