//! Version tokens and the logical clock that issues them.
//!
//! A [`Version`] is a UTC timestamp with nanosecond precision. Its textual
//! form is RFC 3339 with exactly nine fractional digits and a `Z` suffix,
//! which makes it fixed width and lexicographically sortable: storage
//! backends may compare the text directly.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

/// Error produced when a version token cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Malformed version token {token:?}: {reason}")]
    Malformed { token: String, reason: String },
}

/// Opaque, totally ordered revision marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(DateTime<Utc>);

impl Version {
    /// The watermark of a client that has never synced.
    pub fn epoch() -> Self {
        Self::from_nanos(0)
    }

    fn from_nanos(nanos: i64) -> Self {
        Self(Utc.timestamp_nanos(nanos))
    }

    /// Nanoseconds since the Unix epoch. Saturates outside the i64 range.
    pub fn as_nanos(&self) -> i64 {
        self.0.timestamp_nanos_opt().unwrap_or(if self.0.timestamp() < 0 {
            i64::MIN
        } else {
            i64::MAX
        })
    }

    /// Whether this version was issued strictly after `other`.
    pub fn is_after(&self, other: &Version) -> bool {
        self > other
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Self(dt.with_timezone(&Utc)))
            .map_err(|e| VersionError::Malformed {
                token: s.to_string(),
                reason: e.to_string(),
            })
    }
}

impl From<DateTime<Utc>> for Version {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Strictly monotonic source of [`Version`] tokens.
///
/// Every tick is `max(now, previous + 1ns)`, so tokens keep increasing when
/// callers race or the wall clock steps backwards. One clock must back every
/// secret of a store: the reconciliation watermark compares versions across
/// secrets.
#[derive(Debug)]
pub struct VersionClock {
    last: AtomicI64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(i64::MIN),
        }
    }

    /// A clock whose every tick is after `version`.
    pub fn resume_after(version: Version) -> Self {
        Self {
            last: AtomicI64::new(version.as_nanos()),
        }
    }

    /// Issue the next version.
    pub fn tick(&self) -> Version {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = now.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Version::from_nanos(next),
                Err(current) => last = current,
            }
        }
    }
}

impl Default for VersionClock {
    fn default() -> Self {
        Self::new()
    }
}
