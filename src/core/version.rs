//! core::version
//!
//! Semantic versions and bump arithmetic.
//!
//! # Design
//!
//! [`Version`] wraps `semver::Version` so the rest of the crate never
//! manipulates version strings directly. [`BumpKind`] describes how the
//! next version is derived from the current one.
//!
//! # Example
//!
//! ```
//! use capstan::core::version::{BumpKind, Version};
//!
//! let current = Version::parse("1.0.0").unwrap();
//! let next = BumpKind::Minor.apply(&current);
//! assert_eq!(next.to_string(), "1.1.0");
//! assert_eq!(next.tag_name("v"), "v1.1.0");
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from version parsing.
#[derive(Debug, Error)]
pub enum VersionError {
    /// The string is not a valid semantic version.
    #[error("invalid version '{input}': {source}")]
    Parse {
        /// The offending input.
        input: String,
        /// The underlying semver error.
        source: semver::Error,
    },
}

/// A semantic version (major.minor.patch, optional pre-release and build).
///
/// Serialized as its string form in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version(semver::Version);

impl Version {
    /// Parse a version string, tolerating a leading `v` prefix.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError::Parse`] if the string is not valid semver.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.strip_prefix('v').unwrap_or(input);
        semver::Version::parse(trimmed)
            .map(Self)
            .map_err(|source| VersionError::Parse {
                input: input.to_string(),
                source,
            })
    }

    /// The zero version `0.0.0`, used when a repository has no release tag yet.
    pub fn zero() -> Self {
        Self(semver::Version::new(0, 0, 0))
    }

    /// Construct from explicit components.
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }

    /// The tag name for this version with the given prefix.
    pub fn tag_name(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.0)
    }

    /// Access the underlying semver value.
    pub fn as_semver(&self) -> &semver::Version {
        &self.0
    }
}

impl TryFrom<String> for Version {
    type Error = VersionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.0.to_string()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the next version is derived from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BumpKind {
    /// Breaking change: bump major, reset minor and patch.
    Major,
    /// New functionality: bump minor, reset patch.
    Minor,
    /// Fix only: bump patch.
    Patch,
    /// Increment (or start) a numeric pre-release counter.
    Prerelease,
    /// No version change.
    None,
}

impl BumpKind {
    /// Apply this bump to a version, producing the next version.
    ///
    /// Pre-release and build metadata are cleared by major/minor/patch
    /// bumps. A prerelease bump appends `-rc.1` to the next patch version,
    /// or increments a trailing numeric counter when one is present.
    ///
    /// # Example
    ///
    /// ```
    /// use capstan::core::version::{BumpKind, Version};
    ///
    /// let v = Version::parse("1.2.3").unwrap();
    /// assert_eq!(BumpKind::Major.apply(&v).to_string(), "2.0.0");
    /// assert_eq!(BumpKind::Minor.apply(&v).to_string(), "1.3.0");
    /// assert_eq!(BumpKind::Patch.apply(&v).to_string(), "1.2.4");
    /// assert_eq!(BumpKind::None.apply(&v).to_string(), "1.2.3");
    ///
    /// let rc = Version::parse("2.0.0-rc.1").unwrap();
    /// assert_eq!(BumpKind::Prerelease.apply(&rc).to_string(), "2.0.0-rc.2");
    /// ```
    pub fn apply(&self, current: &Version) -> Version {
        let cur = &current.0;
        let next = match self {
            BumpKind::Major => semver::Version::new(cur.major + 1, 0, 0),
            BumpKind::Minor => semver::Version::new(cur.major, cur.minor + 1, 0),
            BumpKind::Patch => semver::Version::new(cur.major, cur.minor, cur.patch + 1),
            BumpKind::Prerelease => {
                if cur.pre.is_empty() {
                    let mut v = semver::Version::new(cur.major, cur.minor, cur.patch + 1);
                    v.pre = semver::Prerelease::new("rc.1").expect("static prerelease");
                    v
                } else {
                    let mut v = semver::Version::new(cur.major, cur.minor, cur.patch);
                    v.pre = bump_prerelease(&cur.pre);
                    v
                }
            }
            BumpKind::None => cur.clone(),
        };
        Version(next)
    }

    /// The bump kind as serialized in snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            BumpKind::Major => "major",
            BumpKind::Minor => "minor",
            BumpKind::Patch => "patch",
            BumpKind::Prerelease => "prerelease",
            BumpKind::None => "none",
        }
    }
}

impl std::fmt::Display for BumpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Increment the trailing numeric component of a pre-release identifier,
/// e.g. `rc.1` -> `rc.2`, `beta` -> `beta.1`.
fn bump_prerelease(pre: &semver::Prerelease) -> semver::Prerelease {
    let s = pre.as_str();
    let next = match s.rsplit_once('.') {
        Some((head, tail)) => match tail.parse::<u64>() {
            Ok(n) => format!("{}.{}", head, n + 1),
            Err(_) => format!("{s}.1"),
        },
        None => match s.parse::<u64>() {
            Ok(n) => (n + 1).to_string(),
            Err(_) => format!("{s}.1"),
        },
    };
    semver::Prerelease::new(&next).unwrap_or_else(|_| pre.clone())
}
