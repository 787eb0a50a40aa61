//! SSH identity used to authenticate against launched instances.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::LifecycleError;
use crate::util::{expand_tilde, local_user_name};

const PUBLIC_SUFFIX: &str = ".pub";

/// Candidate public keys under `~/.ssh`, in order of preference.
pub const DEFAULT_PUBLIC_KEYS: [&str; 2] = ["id_ed25519.pub", "id_rsa.pub"];

/// One SSH identity: public key, private key, and the name it is known by
/// on the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyPair {
    name: String,
    public_key_path: Utf8PathBuf,
    private_key_path: Utf8PathBuf,
}

impl KeyPair {
    /// Creates a key pair, expanding `~/` in both paths.
    ///
    /// When `private_key_path` is `None` it is derived from the public key
    /// path by stripping a trailing `.pub`.
    #[must_use]
    pub fn new(
        public_key_path: &str,
        private_key_path: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        let public = Utf8PathBuf::from(expand_tilde(public_key_path));
        let private = private_key_path
            .filter(|path| !path.trim().is_empty())
            .map_or_else(
                || derive_private_path(&public),
                |path| Utf8PathBuf::from(expand_tilde(path)),
            );
        Self {
            name: name.into(),
            public_key_path: public,
            private_key_path: private,
        }
    }

    /// Discovers the conventional identity of the local user.
    ///
    /// Looks for `~/.ssh/id_ed25519.pub` and then `~/.ssh/id_rsa.pub`; when
    /// neither exists the `id_rsa.pub` path is used anyway so the failure
    /// surfaces when the key is first read. The name is the local user name.
    #[must_use]
    pub fn discover() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| String::from("."));
        Self::discover_in(Utf8Path::new(&home), &local_user_name())
    }

    /// Discovers the conventional identity below `home`, naming it `user`.
    #[must_use]
    pub fn discover_in(home: &Utf8Path, user: &str) -> Self {
        let ssh_dir = home.join(".ssh");
        let public = DEFAULT_PUBLIC_KEYS
            .iter()
            .map(|candidate| ssh_dir.join(candidate))
            .find(|candidate| candidate.is_file())
            .unwrap_or_else(|| ssh_dir.join("id_rsa.pub"));
        Self::new(public.as_str(), None, user)
    }

    /// Returns a copy of this key pair under a different name.
    #[must_use]
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Name the key is referenced by on the provider.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path to the public key.
    #[must_use]
    pub fn public_key_path(&self) -> &Utf8Path {
        &self.public_key_path
    }

    /// Path to the private key.
    #[must_use]
    pub fn private_key_path(&self) -> &Utf8Path {
        &self.private_key_path
    }

    /// Reads the public key material.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::KeyMaterial`] when the file cannot be read
    /// or is empty.
    pub async fn public_key_content(&self) -> Result<String, LifecycleError> {
        let content = tokio::fs::read_to_string(&self.public_key_path)
            .await
            .map_err(|err| LifecycleError::KeyMaterial {
                path: self.public_key_path.to_string(),
                message: err.to_string(),
            })?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(LifecycleError::KeyMaterial {
                path: self.public_key_path.to_string(),
                message: String::from("public key file is empty"),
            });
        }
        Ok(trimmed.to_owned())
    }
}

impl fmt::Display for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KeyPair({}, {}, name={})",
            self.private_key_path, self.public_key_path, self.name
        )
    }
}

fn derive_private_path(public: &Utf8Path) -> Utf8PathBuf {
    public
        .as_str()
        .strip_suffix(PUBLIC_SUFFIX)
        .map_or_else(|| public.to_path_buf(), Utf8PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn utf8_home(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp dir not UTF-8: {}", path.display()))
    }

    #[rstest]
    #[case("/keys/ci.pub", None, "/keys/ci")]
    #[case("/keys/ci.pub", Some("/secret/ci"), "/secret/ci")]
    #[case("/keys/ci.pub", Some("  "), "/keys/ci")]
    #[case("/keys/ci", None, "/keys/ci")]
    fn derives_private_key_path(
        #[case] public: &str,
        #[case] private: Option<&str>,
        #[case] expected: &str,
    ) {
        let key = KeyPair::new(public, private, "ci");
        assert_eq!(key.private_key_path(), Utf8Path::new(expected));
        assert_eq!(key.public_key_path(), Utf8Path::new(public));
    }

    #[rstest]
    fn discovery_prefers_ed25519() {
        let home = TempDir::new().expect("temp home");
        let root = utf8_home(&home);
        std::fs::create_dir_all(root.join(".ssh")).expect("ssh dir");
        std::fs::write(root.join(".ssh/id_rsa.pub"), "ssh-rsa AAAA").expect("rsa key");
        std::fs::write(root.join(".ssh/id_ed25519.pub"), "ssh-ed25519 AAAA").expect("ed key");

        let key = KeyPair::discover_in(&root, "alice");
        assert_eq!(key.name(), "alice");
        assert_eq!(key.public_key_path(), root.join(".ssh/id_ed25519.pub"));
        assert_eq!(key.private_key_path(), root.join(".ssh/id_ed25519"));
    }

    #[rstest]
    fn discovery_falls_back_to_rsa_path() {
        let home = TempDir::new().expect("temp home");
        let root = utf8_home(&home);

        let key = KeyPair::discover_in(&root, "bob");
        assert_eq!(key.public_key_path(), root.join(".ssh/id_rsa.pub"));
        assert_eq!(key.private_key_path(), root.join(".ssh/id_rsa"));
    }

    #[tokio::test]
    async fn reads_trimmed_public_key() {
        let home = TempDir::new().expect("temp home");
        let root = utf8_home(&home);
        let path = root.join("ci.pub");
        std::fs::write(&path, "ssh-ed25519 AAAA ci@host\n").expect("write key");

        let key = KeyPair::new(path.as_str(), None, "ci");
        let content = key.public_key_content().await.expect("key should read");
        assert_eq!(content, "ssh-ed25519 AAAA ci@host");
    }

    #[tokio::test]
    async fn missing_public_key_reports_path() {
        let key = KeyPair::new("/nonexistent/cloudlift.pub", None, "ci");
        let err = key
            .public_key_content()
            .await
            .expect_err("missing key must fail");
        assert!(
            matches!(err, LifecycleError::KeyMaterial { ref path, .. } if path == "/nonexistent/cloudlift.pub"),
            "unexpected error: {err:?}"
        );
    }

    #[rstest]
    fn renamed_keeps_paths() {
        let key = KeyPair::new("/keys/ci.pub", None, "ci");
        let other = key.renamed("ci-2");
        assert_eq!(other.name(), "ci-2");
        assert_eq!(other.private_key_path(), key.private_key_path());
    }
}
