//! Protocol versioning for Herald.
//!
//! Clients announce the version they speak in the `v` handshake parameter.
//! Versions sharing a major number are compatible.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Check if this version is compatible with another version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = &'static str;

    /// Parse `"1"` or `"1.2"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = match s.split_once('.') {
            Some((major, minor)) => (major, minor),
            None => (s, "0"),
        };
        let major = major.parse().map_err(|_| "Invalid major version")?;
        let minor = minor.parse().map_err(|_| "Invalid minor version")?;
        Ok(Self::new(major, minor))
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v1_0 = Version::new(1, 0);
        let v1_1 = Version::new(1, 1);
        let v2_0 = Version::new(2, 0);

        assert!(v1_0.is_compatible_with(&v1_1));
        assert!(v1_1.is_compatible_with(&v1_0));
        assert!(!v1_0.is_compatible_with(&v2_0));
    }

    #[test]
    fn test_version_parse() {
        assert_eq!("1".parse::<Version>(), Ok(Version::new(1, 0)));
        assert_eq!("1.2".parse::<Version>(), Ok(Version::new(1, 2)));
        assert!("one".parse::<Version>().is_err());
        assert_eq!(Version::new(1, 2).to_string(), "1.2");
    }
}
