//! Release version handling for libraries and the engine itself.
//!
//! The accepted shape is `major.minor.patch` with an optional `-beta.N`
//! pre-release tag. Parsing is delegated to semver; this wrapper narrows the
//! pre-release grammar to the one shape the installer understands and keeps
//! formatting lossless.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// `Some(n)` for `-beta.n`; a beta orders below the matching release.
    pub beta: Option<u32>,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            beta: None,
        }
    }

    pub fn beta(major: u32, minor: u32, patch: u32, beta: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            beta: Some(beta),
        }
    }

    pub fn parse(text: &str) -> EngineResult<Self> {
        let parsed = semver::Version::parse(text.trim())
            .map_err(|e| EngineError::Api(format!("invalid version '{}': {}", text, e)))?;

        let beta = if parsed.pre.is_empty() {
            None
        } else {
            let pre = parsed.pre.as_str();
            let n = pre
                .strip_prefix("beta.")
                .and_then(|n| n.parse::<u32>().ok())
                .ok_or_else(|| {
                    EngineError::Api(format!("unsupported pre-release tag '{}'", pre))
                })?;
            Some(n)
        };

        if !parsed.build.is_empty() {
            return Err(EngineError::Api(format!(
                "build metadata not supported: '{}'",
                text
            )));
        }

        Ok(Self {
            major: parsed.major as u32,
            minor: parsed.minor as u32,
            patch: parsed.patch as u32,
            beta,
        })
    }

    fn to_semver(self) -> semver::Version {
        let mut v = semver::Version::new(self.major as u64, self.minor as u64, self.patch as u64);
        if let Some(n) = self.beta {
            v.pre = semver::Prerelease::new(&format!("beta.{}", n)).unwrap_or_default();
        }
        v
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.beta {
            Some(n) => write!(f, "{}.{}.{}-beta.{}", self.major, self.minor, self.patch, n),
            None => write!(f, "{}.{}.{}", self.major, self.minor, self.patch),
        }
    }
}

impl FromStr for Version {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_semver().cmp(&other.to_semver())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format_round_trip() {
        for text in ["0.1.0", "1.2.3", "10.0.99", "1.2.3-beta.1", "0.9.0-beta.12"] {
            let version = Version::parse(text).unwrap();
            assert_eq!(version.to_string(), text);
            assert_eq!(Version::parse(&version.to_string()).unwrap(), version);
        }
    }

    #[test]
    fn test_rejects_unsupported_shapes() {
        assert!(Version::parse("1.2").is_err());
        assert!(Version::parse("1.2.3-rc.1").is_err());
        assert!(Version::parse("1.2.3+build5").is_err());
        assert!(Version::parse("abc").is_err());
    }

    #[test]
    fn test_beta_orders_below_release() {
        let beta = Version::parse("1.2.3-beta.4").unwrap();
        let release = Version::parse("1.2.3").unwrap();
        assert!(beta < release);
        assert!(Version::parse("1.2.3-beta.5").unwrap() > beta);
    }

    #[test]
    fn test_ordering_by_triple() {
        assert!(Version::new(1, 3, 0) > Version::new(1, 2, 9));
        assert!(Version::new(2, 0, 0) > Version::new(1, 9, 9));
    }
}
