//! Millisecond timestamps used as record versions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// Timestamps double as the version of a metadata record during sync: the
/// record carrying the strictly greater `modified_time` wins.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Wall-clock time, clamped to the epoch if the clock is behind it.
    #[must_use]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self(duration.as_millis() as i64)
    }

    /// Returns a timestamp strictly greater than `previous`, using the wall
    /// clock when it is ahead.
    #[must_use]
    pub fn next_after(previous: Timestamp) -> Self {
        let now = Self::now();
        if now > previous {
            now
        } else {
            Self(previous.0.saturating_add(1))
        }
    }

    #[must_use]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Older than any real write.
    #[must_use]
    pub const fn epoch() -> Self {
        Self(0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}
