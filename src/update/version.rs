//! Version tag parsing and ordering.
//!
//! Release tags look like `v1.2.3` or `1.2.3-beta.1`. Exactly three numeric
//! components are required; anything after the first `-` is the prerelease
//! label. A prerelease sorts strictly before the release with the same
//! numbers.

use crate::error::{Result, UpdateError};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A parsed `major.minor.patch[-prerelease]` version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionTag {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
    /// Prerelease label (text after the first `-`), if any.
    pub prerelease: Option<String>,
}

impl VersionTag {
    /// Parse a version string, accepting an optional leading `v`.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Version`] if there are not exactly three
    /// dot-separated numeric components or the prerelease label is empty.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if body.is_empty() {
            return Err(UpdateError::Version(format!("empty version string: {input:?}")));
        }

        let (core, prerelease) = match body.split_once('-') {
            Some((core, label)) => {
                if label.is_empty() {
                    return Err(UpdateError::Version(format!(
                        "empty prerelease label in {input:?}"
                    )));
                }
                (core, Some(label.to_owned()))
            }
            None => (body, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(UpdateError::Version(format!(
                "expected three numeric components in {input:?}, found {}",
                parts.len()
            )));
        }

        let mut numbers = [0_u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            // `u64::from_str` accepts a leading `+`, which is not a version.
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(UpdateError::Version(format!(
                    "non-numeric component {part:?} in {input:?}"
                )));
            }
            *slot = part.parse().map_err(|e| {
                UpdateError::Version(format!("component {part:?} in {input:?}: {e}"))
            })?;
        }

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            prerelease,
        })
    }

    /// The numeric `(major, minor, patch)` triple.
    pub fn triple(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }

    /// Returns `true` if this tag carries a prerelease label.
    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }
}

impl Ord for VersionTag {
    fn cmp(&self, other: &Self) -> Ordering {
        self.triple()
            .cmp(&other.triple())
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for VersionTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for VersionTag {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(label) = &self.prerelease {
            write!(f, "-{label}")?;
        }
        Ok(())
    }
}

/// Total order between two tags.
pub fn compare(a: &VersionTag, b: &VersionTag) -> Ordering {
    a.cmp(b)
}

/// Returns `true` iff `candidate` is strictly newer than `current`.
pub fn is_upgrade(current: &VersionTag, candidate: &VersionTag) -> bool {
    compare(candidate, current) == Ordering::Greater
}
