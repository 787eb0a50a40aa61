//! Provider-scoped session façade.
//!
//! A [`Cloud`] owns the resource tracker and the active SSH identity for
//! one provider. Everything it creates is registered before control returns
//! to the caller, so [`Cloud::clean`] (or [`Cloud::scope`]) can tear it all
//! down even when the caller lost the handle along an error path. Instances
//! and keys deleted explicitly leave the tracker once they are gone.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::channel::{ChannelConfig, CommandRunner, ProcessCommandRunner, RemoteChannel};
use crate::config::{LifecycleConfig, LifecycleTimings};
use crate::error::LifecycleError;
use crate::instance::Instance;
use crate::key::KeyPair;
use crate::provider::{LaunchRequest, ProviderAdapter, ProviderHandle};
use crate::tracker::{CleanupReport, ResourceId, ResourceTracker};
use crate::util::local_user_name;

mod images;
mod keys;
mod scope;

pub use scope::ScopeError;

use images::CreatedImage;
use keys::UploadedKey;

/// Session against one provider.
pub struct Cloud<R: CommandRunner + 'static = ProcessCommandRunner> {
    tag: String,
    provider: Arc<dyn ProviderAdapter>,
    tracker: Arc<ResourceTracker>,
    key_pair: RwLock<KeyPair>,
    uploaded_keys: Mutex<HashMap<String, ResourceId>>,
    created_images: Mutex<HashMap<String, ResourceId>>,
    channel_config: ChannelConfig,
    timings: LifecycleTimings,
    runner: Arc<R>,
}

impl Cloud<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns the errors documented on [`Cloud::new`].
    pub fn with_process_runner(
        provider: Arc<dyn ProviderAdapter>,
        config: &LifecycleConfig,
        channel_config: ChannelConfig,
    ) -> Result<Self, LifecycleError> {
        Self::new(provider, config, channel_config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner + 'static> Cloud<R> {
    /// Creates a session. Validates both configurations, resolves the
    /// session tag, and picks the configured or discovered identity.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Config`] when validation fails or
    /// [`LifecycleError::InvalidTag`] when the resolved tag breaks provider
    /// naming rules.
    pub fn new(
        provider: Arc<dyn ProviderAdapter>,
        config: &LifecycleConfig,
        channel_config: ChannelConfig,
        runner: R,
    ) -> Result<Self, LifecycleError> {
        config.validate()?;
        channel_config.validate()?;
        let tag = config.session_tag()?;
        let key_pair = config.key_pair();
        info!(provider = provider.name(), %tag, key = %key_pair, "cloud session started");
        Ok(Self {
            tag,
            provider,
            tracker: Arc::new(ResourceTracker::new()),
            key_pair: RwLock::new(key_pair),
            uploaded_keys: Mutex::new(HashMap::new()),
            created_images: Mutex::new(HashMap::new()),
            channel_config,
            timings: config.timings(),
            runner: Arc::new(runner),
        })
    }

    /// Tag applied to created resources.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Name reported by the provider adapter.
    #[must_use]
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Active SSH identity.
    #[must_use]
    pub fn key_pair(&self) -> KeyPair {
        self.key_pair.read().clone()
    }

    /// Number of resources awaiting cleanup.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.tracker.len()
    }

    /// Waiting parameters handed to instances.
    #[must_use]
    pub const fn timings(&self) -> &LifecycleTimings {
        &self.timings
    }

    fn wrap(&self, handle: ProviderHandle) -> Instance<R> {
        let identity = self.key_pair.read().private_key_path().to_path_buf();
        let channel = RemoteChannel::new(
            handle.endpoint,
            &identity,
            self.channel_config.clone(),
            Arc::clone(&self.runner),
        );
        Instance::new(
            handle,
            Arc::clone(&self.provider),
            channel,
            self.timings.clone(),
        )
    }

    /// Launches an instance and tracks it.
    ///
    /// Missing `key_name` and `tag` fields are filled from the session. With
    /// `wait` unset the call returns once the provider accepted the request;
    /// call [`Instance::wait`] later to poll for readiness.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidRequest`] for an incomplete request,
    /// the provider's failure, or the boot wait failure. An instance whose
    /// boot wait failed stays tracked so [`Cloud::clean`] removes it.
    pub async fn launch(
        &self,
        mut request: LaunchRequest,
        wait: bool,
    ) -> Result<Arc<Instance<R>>, LifecycleError> {
        request.validate()?;
        if request.key_name.is_none() {
            request.key_name = Some(self.key_pair.read().name().to_owned());
        }
        if request.tag.is_none() {
            request.tag = Some(self.tag.clone());
        }

        let handle = self.provider.create(&request).await?;
        let instance = Arc::new(self.wrap(handle));
        let id = self.tracker.register(instance.clone());
        instance.attach(&self.tracker, id);
        info!(instance_id = %instance.id(), endpoint = %instance.endpoint(), image = %request.image_id, "launched instance");

        if wait {
            instance.wait(self.timings.boot_timeout).await?;
        }
        Ok(instance)
    }

    /// Attaches to an existing instance. The instance is not tracked, so
    /// [`Cloud::clean`] leaves it alone.
    ///
    /// # Errors
    ///
    /// Returns the provider's lookup failure.
    pub async fn get_instance(&self, instance_id: &str) -> Result<Arc<Instance<R>>, LifecycleError> {
        let handle = self.provider.describe(instance_id).await?;
        Ok(Arc::new(self.wrap(handle)))
    }

    /// Adopts an existing identity without contacting the provider.
    ///
    /// The private key defaults to the public path without `.pub`; the name
    /// defaults to the local user name.
    pub fn use_key(&self, public_key_path: &str, private_key_path: Option<&str>, name: Option<&str>) {
        let key = KeyPair::new(
            public_key_path,
            private_key_path,
            name.map_or_else(local_user_name, str::to_owned),
        );
        info!(key = %key, "using key");
        *self.key_pair.write() = key;
    }

    /// Uploads `public_key_path` under `name` and makes it the active
    /// identity. When the provider can delete keys the upload is tracked so
    /// [`Cloud::clean`] removes it.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::DuplicateResource`] when a key named `name`
    /// already exists, [`LifecycleError::KeyMaterial`] when the key cannot
    /// be read, or the provider's failure.
    pub async fn upload_key(
        &self,
        public_key_path: &str,
        name: Option<&str>,
    ) -> Result<(), LifecycleError> {
        let key = KeyPair::new(
            public_key_path,
            None,
            name.map_or_else(local_user_name, str::to_owned),
        );
        if self.provider.key_exists(key.name()).await? {
            return Err(LifecycleError::DuplicateResource {
                kind: String::from("key"),
                name: key.name().to_owned(),
            });
        }
        let material = key.public_key_content().await?;
        self.provider.upload_key(&material, key.name()).await?;
        info!(key = %key, "uploaded key");

        if self.provider.capabilities().key_deletion {
            let id = self.tracker.register(Arc::new(UploadedKey::new(
                key.name(),
                Arc::clone(&self.provider),
            )));
            self.uploaded_keys.lock().insert(key.name().to_owned(), id);
        }
        *self.key_pair.write() = key;
        Ok(())
    }

    /// Deletes the key `name` from the provider.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotSupported`] when the provider cannot
    /// delete keys, or the provider's failure.
    pub async fn delete_key(&self, name: &str) -> Result<(), LifecycleError> {
        if !self.provider.capabilities().key_deletion {
            return Err(LifecycleError::not_supported(
                "delete_key",
                self.provider.name(),
            ));
        }
        self.provider.delete_key(name).await?;
        info!(key = name, "deleted key");
        let tracked = self.uploaded_keys.lock().remove(name);
        if let Some(id) = tracked {
            self.tracker.forget(id);
        }
        Ok(())
    }

    /// Captures `instance` as an image and tracks the image so
    /// [`Cloud::clean`] removes it. With `clean` set, cloud-init state and
    /// logs are reset first so the image boots like a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotSupported`] when the provider cannot take
    /// snapshots, the failure of [`Instance::clean`], or the provider's
    /// failure.
    pub async fn snapshot(
        &self,
        instance: &Instance<R>,
        clean: bool,
    ) -> Result<String, LifecycleError> {
        if !self.provider.capabilities().snapshots {
            return Err(LifecycleError::not_supported(
                "snapshot",
                self.provider.name(),
            ));
        }
        if clean {
            instance.clean().await?;
        }
        let image_id = self.provider.snapshot(instance.handle()).await?;
        let id = self.tracker.register(Arc::new(CreatedImage::new(
            &image_id,
            Arc::clone(&self.provider),
        )));
        self.created_images.lock().insert(image_id.clone(), id);
        info!(instance_id = %instance.id(), %image_id, "created image");
        Ok(image_id)
    }

    /// Deletes the image `image_id` from the provider.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotSupported`] when the provider cannot
    /// manage images, or the provider's failure.
    pub async fn delete_image(&self, image_id: &str) -> Result<(), LifecycleError> {
        if !self.provider.capabilities().snapshots {
            return Err(LifecycleError::not_supported(
                "delete_image",
                self.provider.name(),
            ));
        }
        self.provider.delete_image(image_id).await?;
        info!(%image_id, "deleted image");
        let tracked = self.created_images.lock().remove(image_id);
        if let Some(id) = tracked {
            self.tracker.forget(id);
        }
        Ok(())
    }

    /// Tears down every tracked resource, waiting for each to go.
    ///
    /// Failures are collected in the returned report, never raised. Failed
    /// resources stay tracked, so calling `clean` again retries them.
    pub async fn clean(&self) -> CleanupReport {
        let report = self.tracker.clean(true).await;
        if report.is_clean() {
            info!(provider = self.provider.name(), "cloud session cleaned up");
        }
        report
    }

    /// Runs `body`, then always calls [`Cloud::clean`].
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError`] carrying the body failure, the cleanup report,
    /// or both.
    pub async fn scope<'a, F, Fut, T, E>(&'a self, body: F) -> Result<T, ScopeError<E>>
    where
        F: FnOnce(&'a Self) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let outcome = body(self).await;
        let cleanup = self.clean().await;
        ScopeError::settle(outcome, cleanup)
    }
}

impl<R: CommandRunner + 'static> Drop for Cloud<R> {
    fn drop(&mut self) {
        if !self.tracker.is_empty() {
            warn!(
                provider = self.provider.name(),
                resources = ?self.tracker.describe_all(),
                "cloud session dropped with tracked resources; call clean() before dropping"
            );
        }
    }
}

impl<R: CommandRunner + 'static> fmt::Debug for Cloud<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cloud")
            .field("provider", &self.provider.name())
            .field("tag", &self.tag)
            .field("key_pair", &*self.key_pair.read())
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}
