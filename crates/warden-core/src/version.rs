//! Deployer API versioning.
//!
//! The envelope and the node runtime must be built against the same deployer
//! API version. The check is exact equality of the `{major, minor, patch}`
//! triple: the deployer↔node protocol is treated as un-versioned within a
//! release, and a mismatch is fatal at init.

use serde::{Deserialize, Serialize};

use crate::protocol::messages;

/// The deployer API version this build speaks.
pub const DEPLOYER_VERSION: SemVer = SemVer {
    major: 0,
    minor: 24,
    patch: 0,
};

/// A semantic version triple, comparable by exact equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SemVer {
    /// Major version.
    pub major: i32,
    /// Minor version.
    pub minor: i32,
    /// Patch version.
    pub patch: i32,
}

impl std::fmt::Display for SemVer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl From<SemVer> for messages::SemVer {
    fn from(v: SemVer) -> Self {
        Self {
            major: v.major,
            minor: v.minor,
            patch: v.patch,
        }
    }
}

impl From<&messages::SemVer> for SemVer {
    fn from(v: &messages::SemVer) -> Self {
        Self {
            major: v.major,
            minor: v.minor,
            patch: v.patch,
        }
    }
}

/// Error returned when the node reports an incompatible version.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VersionError {
    /// The init reply carried no version at all.
    #[error("version mismatch: node reported no deployer API version")]
    Missing,

    /// The reported version differs from [`DEPLOYER_VERSION`].
    #[error(
        "version mismatch: deployer API version {expected} is incompatible \
         with node's deployer API version {got}"
    )]
    Incompatible {
        /// The version this build was compiled with.
        expected: SemVer,
        /// The version the node reported.
        got: SemVer,
    },
}

/// Check a node-reported version against [`DEPLOYER_VERSION`].
///
/// # Errors
///
/// Returns [`VersionError`] if the version is absent or differs from the
/// compiled version in any position.
pub fn check_version(v: Option<&messages::SemVer>) -> Result<(), VersionError> {
    let Some(v) = v else {
        return Err(VersionError::Missing);
    };
    let got = SemVer::from(v);
    if got != DEPLOYER_VERSION {
        return Err(VersionError::Incompatible {
            expected: DEPLOYER_VERSION,
            got,
        });
    }
    Ok(())
}
