//! Semantic Versions
//!
//! Three-component versions (`major.minor.patch`, each a non-negative
//! integer) with lexicographic ordering. The registry's merge policy only
//! ever moves a stored version upward, so `Ord` here is load-bearing.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A resolved library version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Version {
            major,
            minor,
            patch,
        }
    }

    /// Parse a `major.minor.patch` string.
    pub fn parse(text: &str) -> Result<Self> {
        let parts: Vec<&str> = text.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(Error::parse(format!(
                "Invalid version format: {} (expected major.minor.patch)",
                text
            )));
        }

        let component = |part: &str, label: &str| -> Result<u32> {
            part.parse().map_err(|_| {
                Error::parse(format!("Invalid {} version component: {}", label, part))
            })
        };

        Ok(Version {
            major: component(parts[0], "major")?,
            minor: component(parts[1], "minor")?,
            patch: component(parts[2], "patch")?,
        })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::str::FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Version::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        let version = Version::parse("1.2.3").unwrap();
        assert_eq!(version, Version::new(1, 2, 3));
        assert_eq!(version.to_string(), "1.2.3");
    }

    #[test]
    fn test_version_parse_rejects_malformed() {
        assert!(Version::parse("1.2").is_err());
        assert!(Version::parse("1.2.3.4").is_err());
        assert!(Version::parse("1.x.3").is_err());
        assert!(Version::parse("").is_err());
    }

    #[test]
    fn test_version_ordering_is_lexicographic() {
        assert!(Version::new(2, 0, 0) > Version::new(1, 9, 9));
        assert!(Version::new(1, 2, 0) > Version::new(1, 1, 9));
        assert!(Version::new(1, 1, 5) > Version::new(1, 1, 4));
        assert_eq!(Version::new(1, 1, 5), Version::parse("1.1.5").unwrap());
    }
}
