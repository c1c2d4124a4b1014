// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tunables (§6). One flag + one environment variable per tunable, following
//! this codebase's existing configuration-struct conventions.

use std::time::Duration;

use chrono_tz::Tz;

/// Configuration for the room monitoring supervisor.
#[derive(Debug, Clone, clap::Args)]
pub struct Config {
    /// Path to the sqlite database file. Use `:memory:` for an ephemeral
    /// in-process database (tests, dry runs).
    #[arg(long, default_value = "roomwatch.db", env = "ROOMWATCH_DB_PATH")]
    pub db_path: String,

    /// Reconnect cap per outage run.
    #[arg(long, default_value_t = 5, env = "ROOMWATCH_MAX_RETRIES")]
    pub max_retries: u32,

    /// Seconds to wait in `Backoff` before re-probing.
    #[arg(long, default_value_t = 30, env = "ROOMWATCH_RECONNECT_DELAY_SECS")]
    pub reconnect_delay_secs: u64,

    /// Seconds between offline probes in `Offline-Polling` / `Waiting`.
    #[arg(long, default_value_t = 60, env = "ROOMWATCH_POLL_INTERVAL_SECS")]
    pub poll_interval_secs: u64,

    /// Negative probes before giving up and terminating.
    #[arg(long, default_value_t = 60, env = "ROOMWATCH_MAX_POLL_ATTEMPTS")]
    pub max_poll_attempts: u32,

    /// Scheduler: seconds between `snapshot_stats` ticks.
    #[arg(long, default_value_t = 60, env = "ROOMWATCH_STATS_SNAPSHOT_INTERVAL_SECS")]
    pub stats_snapshot_interval_secs: u64,

    /// Scheduler: seconds between `restart_failed` ticks.
    #[arg(long, default_value_t = 30, env = "ROOMWATCH_RESTART_FAILED_INTERVAL_SECS")]
    pub restart_failed_interval_secs: u64,

    /// Scheduler: seconds between `purge_old` ticks.
    #[arg(long, default_value_t = 3600, env = "ROOMWATCH_PURGE_INTERVAL_SECS")]
    pub purge_interval_secs: u64,

    /// Days of history to retain; 0 = keep forever.
    #[arg(long, default_value_t = 90, env = "ROOMWATCH_DATA_RETENTION_DAYS")]
    pub data_retention_days: u32,

    /// Boot-time janitor: hours after which an open session is considered
    /// abandoned and force-closed.
    #[arg(long, default_value_t = 2, env = "ROOMWATCH_STALE_SESSION_HOURS")]
    pub stale_session_hours: u32,

    /// Capacity of the per-room recently-seen gift trace_id cache.
    #[arg(long, default_value_t = 4096, env = "ROOMWATCH_TRACE_CACHE_CAPACITY")]
    pub trace_cache_capacity: usize,

    /// Grace period in seconds for Manager shutdown to await Supervisor exit.
    #[arg(long, default_value_t = 10, env = "ROOMWATCH_SHUTDOWN_GRACE_SECS")]
    pub shutdown_grace_secs: u64,

    /// Number of top contributors included in stats snapshot/replay payloads.
    #[arg(long, default_value_t = 10, env = "ROOMWATCH_TOP_CONTRIBUTORS")]
    pub top_contributors: usize,

    /// Fixed display time zone (IANA name, e.g. `Asia/Shanghai`).
    #[arg(long, default_value = "Asia/Shanghai", env = "ROOMWATCH_TIMEZONE")]
    pub timezone: String,

    /// Room identifiers to register as `persistent`+auto-reconnect at boot.
    #[arg(long, env = "ROOMWATCH_AUTOSTART_ROOMS", value_delimiter = ',')]
    pub autostart_rooms: Vec<String>,
}

impl Config {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stats_snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.stats_snapshot_interval_secs)
    }

    pub fn restart_failed_interval(&self) -> Duration {
        Duration::from_secs(self.restart_failed_interval_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn data_retention(&self) -> Option<chrono::Duration> {
        if self.data_retention_days == 0 {
            None
        } else {
            Some(chrono::Duration::days(i64::from(self.data_retention_days)))
        }
    }

    pub fn stale_session_threshold(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.stale_session_hours))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Resolve the configured IANA zone name, falling back to UTC+8 (the
    /// platform this was originally built against) on a bad name rather than
    /// failing startup over a typo in an env var.
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(chrono_tz::Asia::Shanghai)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn defaults_match_spec() {
        let harness = Harness::parse_from(["roomwatch"]);
        assert_eq!(harness.config.max_retries, 5);
        assert_eq!(harness.config.reconnect_delay_secs, 30);
        assert_eq!(harness.config.poll_interval_secs, 60);
        assert_eq!(harness.config.data_retention_days, 90);
        assert_eq!(harness.config.tz(), chrono_tz::Asia::Shanghai);
    }

    #[test]
    fn zero_retention_disables_purge() {
        let harness = Harness::parse_from(["roomwatch", "--data-retention-days", "0"]);
        assert!(harness.config.data_retention().is_none());
    }

    #[test]
    fn bad_timezone_falls_back() {
        let harness = Harness::parse_from(["roomwatch", "--timezone", "not/a/zone"]);
        assert_eq!(harness.config.tz(), chrono_tz::Asia::Shanghai);
    }
}
