//! Session fixtures shared by integration tests.

use std::sync::Arc;

use camino::Utf8PathBuf;
use cloudlift::test_support::{FakeProvider, channel_config, lifecycle_config};
use cloudlift::{Cloud, CommandRunner, LaunchRequest, ProviderAdapter};
use tempfile::TempDir;

/// Temporary directory holding a public key file.
pub struct KeyDir {
    _dir: TempDir,
    /// Path of the written public key.
    pub public: Utf8PathBuf,
}

impl KeyDir {
    /// Writes a throwaway ed25519 public key.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let public = Utf8PathBuf::from_path_buf(dir.path().join("session.pub"))
            .unwrap_or_else(|path| panic!("temp path not UTF-8: {}", path.display()));
        std::fs::write(&public, "ssh-ed25519 AAAAC3Nza session@example\n").expect("write key");
        Self { _dir: dir, public }
    }
}

/// Starts a session against the fake provider with `runner` for SSH.
pub fn session<R: CommandRunner + 'static>(
    provider: &Arc<FakeProvider>,
    keys: &KeyDir,
    runner: R,
) -> Cloud<R> {
    let adapter: Arc<dyn ProviderAdapter> = provider.clone();
    Cloud::new(
        adapter,
        &lifecycle_config(keys.public.as_str()),
        channel_config(),
        runner,
    )
    .expect("session should start")
}

/// Minimal launch request for an Ubuntu image.
pub fn request() -> LaunchRequest {
    LaunchRequest::builder()
        .image_id("ubuntu-24.04")
        .build()
        .expect("request builds")
}

