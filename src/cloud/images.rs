//! Images captured by the session.

use std::sync::Arc;

use crate::provider::ProviderAdapter;
use crate::tracker::{TeardownFuture, TrackedResource};

/// Image created by [`super::Cloud::snapshot`]; deleted on cleanup.
pub(super) struct CreatedImage {
    image_id: String,
    provider: Arc<dyn ProviderAdapter>,
}

impl CreatedImage {
    pub(super) fn new(image_id: &str, provider: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            image_id: image_id.to_owned(),
            provider,
        }
    }
}

impl TrackedResource for CreatedImage {
    fn describe(&self) -> String {
        format!("image {}", self.image_id)
    }

    fn teardown(&self, _wait: bool) -> TeardownFuture<'_> {
        Box::pin(async move {
            self.provider.delete_image(&self.image_id).await?;
            Ok(())
        })
    }
}
