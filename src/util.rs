//! Utility functions for path expansion and resource naming.

use chrono::Local;

use crate::error::LifecycleError;

const MAX_TAG_LEN: usize = 63;
const FALLBACK_USER: &str = "cloudlift";

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If the `HOME` environment variable is not set, the function returns the
/// input string unchanged.
///
/// # Examples
///
/// ```
/// # use cloudlift::util::expand_tilde;
/// let home = std::env::var("HOME").expect("HOME should be set");
/// assert_eq!(expand_tilde("~/.ssh/id_ed25519"), format!("{home}/.ssh/id_ed25519"));
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Name of the local user, used as the default key name.
#[must_use]
pub fn local_user_name() -> String {
    ["USER", "LOGNAME", "USERNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|value| !value.trim().is_empty()))
        .unwrap_or_else(|| FALLBACK_USER.to_owned())
}

/// Appends a `-MMDD-HHMMSS` suffix based on local time.
#[must_use]
pub fn timestamped_tag(tag: &str) -> String {
    format!("{tag}-{}", Local::now().format("%m%d-%H%M%S"))
}

/// Ensures `tag` is usable as a resource name on every provider.
///
/// The rule is the strictest one in common use: lowercase letters, digits,
/// and hyphens, starting with a letter, not ending with a hyphen, and at most
/// 63 characters.
///
/// # Errors
///
/// Returns [`LifecycleError::InvalidTag`] naming the violated rule.
pub fn validate_tag(tag: &str) -> Result<(), LifecycleError> {
    let reject = |reason: &str| -> Result<(), LifecycleError> {
        Err(LifecycleError::InvalidTag {
            tag: tag.to_owned(),
            reason: reason.to_owned(),
        })
    };

    let Some(first) = tag.chars().next() else {
        return reject("tag must not be empty");
    };
    if tag.len() > MAX_TAG_LEN {
        return reject("tag must be at most 63 characters");
    }
    if !first.is_ascii_lowercase() {
        return reject("tag must start with a lowercase letter");
    }
    if tag.ends_with('-') {
        return reject("tag must not end with a hyphen");
    }
    if !tag
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
    {
        return reject("tag may only contain lowercase letters, digits, and hyphens");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("a")]
    #[case("ci-run-42")]
    #[case("cloudlift-1014-093011")]
    fn accepts_valid_tags(#[case] tag: &str) {
        assert!(validate_tag(tag).is_ok(), "{tag} should be accepted");
    }

    #[rstest]
    #[case("", "tag must not be empty")]
    #[case("-lead", "tag must start with a lowercase letter")]
    #[case("9lives", "tag must start with a lowercase letter")]
    #[case("trail-", "tag must not end with a hyphen")]
    #[case("Upper", "tag must start with a lowercase letter")]
    #[case("under_score", "tag may only contain lowercase letters, digits, and hyphens")]
    fn rejects_invalid_tags(#[case] tag: &str, #[case] reason: &str) {
        let err = validate_tag(tag).expect_err("tag should be rejected");
        assert_eq!(
            err,
            LifecycleError::InvalidTag {
                tag: tag.to_owned(),
                reason: reason.to_owned(),
            }
        );
    }

    #[rstest]
    fn rejects_overlong_tags() {
        let tag = "a".repeat(64);
        assert!(validate_tag(&tag).is_err());
        assert!(validate_tag(&"a".repeat(63)).is_ok());
    }

    #[rstest]
    fn timestamped_tags_remain_valid() {
        let tag = timestamped_tag("ci");
        assert!(tag.starts_with("ci-"));
        assert_eq!(tag.len(), "ci-".len() + "MMDD-HHMMSS".len());
        assert!(validate_tag(&tag).is_ok());
    }
}
