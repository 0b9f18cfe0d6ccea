//! Control-plane versions, used to gate test cases.

use std::{fmt, str::FromStr};

/// A `major.minor` version. Patch levels are parsed and ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    major: u32,
    minor: u32,
}

pub const SMCP_2_0: Version = Version::new(2, 0);
pub const SMCP_2_1: Version = Version::new(2, 1);
pub const SMCP_2_2: Version = Version::new(2, 2);
pub const SMCP_2_3: Version = Version::new(2, 3);
pub const SMCP_2_4: Version = Version::new(2, 4);
pub const SMCP_2_5: Version = Version::new(2, 5);
pub const SMCP_2_6: Version = Version::new(2, 6);

// === impl Version ===

impl Version {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }
}

/// Parses `v2.5`, `2.5` or `4.14.0`.
impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid version: {s} (expected MAJOR.MINOR, e.g. v2.6)");
        let mut parts = s.strip_prefix('v').unwrap_or(s).split('.');
        let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let minor = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        Ok(Self { major, minor })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}
