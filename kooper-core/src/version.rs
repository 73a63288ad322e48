//! Parsing and comparison of apiserver release versions

use std::{fmt, str::FromStr};

use thiserror::Error;

/// Oldest apiserver release that supports CustomResourceDefinitions
pub const MIN_CLUSTER_VERSION: ClusterVersion = ClusterVersion::new(1, 7, 0);

/// Failure to parse an apiserver version string
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("could not parse {input:?} as a version: {reason}")]
pub struct ParseVersionError {
    input: String,
    reason: &'static str,
}

/// The release of a Kubernetes apiserver, as reported in `gitVersion`
///
/// Parsing is lenient in the same way the apiserver's own generic version parser is:
/// a leading `v` is optional, the patch component may be missing, and anything trailing the
/// numeric components (`-rc.1`, `+k3s1`, `-gke.100`) is ignored.
///
/// ```
/// use kooper_core::version::{ClusterVersion, MIN_CLUSTER_VERSION};
/// let v = ClusterVersion::parse("v1.28.3+k3s1").unwrap();
/// assert_eq!(v, ClusterVersion::new(1, 28, 3));
/// assert!(v >= MIN_CLUSTER_VERSION);
/// assert!(ClusterVersion::parse("v1.6.13").unwrap() < MIN_CLUSTER_VERSION);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterVersion {
    /// Major release
    pub major: u32,
    /// Minor release
    pub minor: u32,
    /// Patch release, `0` when not reported
    pub patch: u32,
}

impl ClusterVersion {
    /// Construct a version from its components
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Parse a version string such as `v1.7.0` or `1.29`
    ///
    /// # Errors
    /// Fails when the string does not start with at least `<major>.<minor>`.
    pub fn parse(v: &str) -> Result<Self, ParseVersionError> {
        let err = |reason: &'static str| ParseVersionError {
            input: v.to_string(),
            reason,
        };
        let trimmed = v.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let numeric_len = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let numeric = &trimmed[..numeric_len];
        let rest = &trimmed[numeric_len..];
        if !(rest.is_empty() || rest.starts_with('-') || rest.starts_with('+')) {
            return Err(err("unexpected characters after version components"));
        }

        let mut components = numeric.split('.');
        let mut next = |name: &'static str| -> Result<Option<u32>, ParseVersionError> {
            match components.next() {
                None => Ok(None),
                Some("") => Err(err(name)),
                Some(c) => c.parse().map(Some).map_err(|_| err(name)),
            }
        };
        let major = next("invalid major component")?.ok_or_else(|| err("missing major component"))?;
        let minor = next("invalid minor component")?.ok_or_else(|| err("missing minor component"))?;
        let patch = next("invalid patch component")?.unwrap_or(0);
        if components.next().is_some() {
            return Err(err("too many version components"));
        }
        Ok(Self::new(major, minor, patch))
    }
}

impl FromStr for ClusterVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ClusterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}
