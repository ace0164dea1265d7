use hwvtep_southbound_error::ParseError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    cmp::Ordering,
    fmt::{self, Display, Formatter},
    str::FromStr,
};

const FORMAT: &str = r"(\d+)\.(\d+)\.(\d+)";

static PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)\.(\d+)\.(\d+)$").expect("version pattern is a valid regex")
});

/// Textual form of [`Version::NULL`].
pub const NULL_VERSION_STRING: &str = "0.0.0";

/// Three-part schema version as advertised by a device (RFC 7047 section 3.1).
///
/// Ordering is lexicographic over `(major, minor, patch)`; the derive relies
/// on field declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// Sentinel for "unknown / not negotiated".
    pub const NULL: Version = Version::new(0, 0, 0);

    #[inline]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `major.minor.patch`. The whole input must match.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let caps = PATTERN
            .captures(text)
            .ok_or_else(|| ParseError::new(text, FORMAT))?;
        let component = |idx: usize| -> Result<u32, ParseError> {
            caps.get(idx)
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .ok_or_else(|| ParseError::new(text, FORMAT))
        };
        Ok(Self::new(component(1)?, component(2)?, component(3)?))
    }

    /// Three-way comparison returning -1, 0 or 1.
    #[inline]
    pub fn compare(a: &Version, b: &Version) -> i32 {
        match a.cmp(b) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    /// Feature gate: true when this version is `min` or newer.
    #[inline]
    pub fn is_at_least(&self, min: &Version) -> bool {
        self >= min
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl FromStr for Version {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}
