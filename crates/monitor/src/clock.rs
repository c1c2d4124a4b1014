// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Monotonic and wall-clock time, pinned to one fixed display time zone.
//!
//! All persisted timestamps use the same zone (§3: "comparisons and window
//! queries use that zone uniformly") so cutoff arithmetic never has to reason
//! about DST or per-row offsets.

use std::time::Instant;

use chrono::TimeZone;
use chrono_tz::Tz;

/// A timestamp in the system's one fixed display time zone.
pub type Timestamp = chrono::DateTime<Tz>;

/// Source of wall-clock and monotonic time.
///
/// A trait rather than bare `chrono::Utc::now()` calls so that tests can pin
/// time and assert exact staleness-cutoff and snapshot-interval behavior.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
    fn monotonic(&self) -> Instant;
    fn zone(&self) -> Tz;
}

/// Real wall-clock backed by the system clock, pinned to `zone`.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    zone: Tz,
}

impl SystemClock {
    pub fn new(zone: Tz) -> Self {
        Self { zone }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        self.zone.from_utc_datetime(&chrono::Utc::now().naive_utc())
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }

    fn zone(&self) -> Tz {
        self.zone
    }
}

/// A pinned clock for deterministic tests — staleness cutoffs and snapshot
/// cadence assertions need an exact, advanceable `now()`.
#[cfg(any(test, feature = "test-support"))]
pub struct FixedClock {
    pub at: Timestamp,
    pub zone: Tz,
}

#[cfg(any(test, feature = "test-support"))]
impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        self.at
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }

    fn zone(&self) -> Tz {
        self.zone
    }
}
