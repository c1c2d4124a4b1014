// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Core (§9): the single value that replaces the source's module-level
//! globals (shared config object, singleton database session, shared
//! logger). Every Supervisor and the Scheduler receive a reference to it;
//! nothing in this crate reaches for a global. Addresses rooms exclusively
//! by their stable external identifier (§9's API-duality consolidation) and
//! surfaces only the operator commands in §6 — callers never touch the
//! Manager, Gateway, or Bus directly.

use std::sync::Arc;

use crate::bus::SubscriberBus;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::domain::{MonitorMode, Room};
use crate::error::ManagerError;
use crate::fetcher::FetcherFactory;
use crate::manager::{RoomManager, RoomStatusView};
use crate::scheduler::Scheduler;
use crate::storage::sqlite::SqliteGateway;
use crate::storage::StorageGateway;
use crate::supervisor::SupervisorTuning;

/// Bundles Clock, Config, Storage Gateway, Subscriber Bus, Fetcher factory,
/// and Scheduler (§9) behind the five operator commands in §6.
pub struct Core {
    config: Config,
    gateway: Arc<dyn StorageGateway>,
    bus: Arc<SubscriberBus>,
    clock: Arc<dyn Clock>,
    manager: Arc<RoomManager>,
    scheduler: Scheduler,
    scheduler_handles: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Core {
    /// Opens the configured sqlite database (or `:memory:`), runs boot-time
    /// reconciliation (§4.5.2, S5), and returns a `Core` ready for
    /// `start_background_jobs`. Does not itself start any room.
    pub fn open(config: Config, fetcher_factory: Arc<dyn FetcherFactory>) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(config.tz()));
        let gateway: Arc<dyn StorageGateway> = Arc::new(SqliteGateway::open(&config.db_path, Arc::clone(&clock))?);
        Self::new(config, gateway, clock, fetcher_factory)
    }

    /// Assembles a `Core` around an already-open Gateway and Clock —
    /// the seam integration tests use to swap in a scripted Fetcher and an
    /// in-memory database without touching `open`.
    pub fn new(
        config: Config,
        gateway: Arc<dyn StorageGateway>,
        clock: Arc<dyn Clock>,
        fetcher_factory: Arc<dyn FetcherFactory>,
    ) -> anyhow::Result<Self> {
        let bus = Arc::new(SubscriberBus::new());
        let tuning = SupervisorTuning {
            max_retries: config.max_retries,
            reconnect_delay: config.reconnect_delay(),
            poll_interval: config.poll_interval(),
            max_poll_attempts: config.max_poll_attempts,
            trace_cache_capacity: config.trace_cache_capacity,
            top_contributors: config.top_contributors,
        };
        let manager = Arc::new(RoomManager::new(
            Arc::clone(&gateway),
            Arc::clone(&bus),
            Arc::clone(&clock),
            fetcher_factory,
            tuning,
            config.shutdown_grace(),
        ));
        let scheduler = Scheduler::new(Arc::clone(&manager), Arc::clone(&gateway), Arc::clone(&clock));

        Ok(Self {
            config,
            gateway,
            bus,
            clock,
            manager,
            scheduler,
            scheduler_handles: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Boot-time sequence (§4.5.2, §8 S5): close stale `live` sessions older
    /// than `StaleSessionHours`, then reconcile any `monitoring` Room left
    /// over from an unclean restart back to `stopped`.
    pub async fn reconcile_on_boot(&self) -> anyhow::Result<()> {
        let closed = self.gateway.close_stale_sessions(self.config.stale_session_threshold())?;
        if closed > 0 {
            tracing::info!(count = closed, "closed stale live sessions at boot");
        }
        let reset = self.manager.reconcile_on_boot().await?;
        if reset > 0 {
            tracing::info!(count = reset, "reconciled stale monitoring rooms at boot");
        }
        Ok(())
    }

    /// Starts the Scheduler's background jobs, including the once-at-boot
    /// `auto_start_persistent` sweep plus any `--autostart-rooms` ids that
    /// are not yet persisted as Rooms.
    pub async fn start_background_jobs(&self) -> anyhow::Result<()> {
        for id in &self.config.autostart_rooms {
            if self.gateway.get_room(id)?.is_none() {
                self.manager.add(id, MonitorMode::Persistent, true).await.ok();
            }
        }
        let handles = self.scheduler.start(&self.config).await;
        *self.scheduler_handles.lock().await = handles;
        Ok(())
    }

    /// AddRoom (§6): persist the Room if absent; does not start it.
    pub async fn add_room(&self, id: &str, mode: MonitorMode, auto_reconnect: bool) -> Result<Room, ManagerError> {
        self.manager.add(id, mode, auto_reconnect).await
    }

    /// StartRoom (§6): ensure a Supervisor exists for `id` and issue Start.
    pub async fn start_room(&self, id: &str) -> Result<(), ManagerError> {
        self.manager.start(id).await
    }

    /// StopRoom (§6): stop the Supervisor, reconciling status if none is
    /// registered.
    pub async fn stop_room(&self, id: &str) -> Result<(), ManagerError> {
        self.manager.stop(id).await
    }

    /// RemoveRoom (§6): stop (if active) and delete the Room row, cascading
    /// to its events, sessions, contributions, and snapshots.
    pub async fn remove_room(&self, id: &str) -> Result<(), ManagerError> {
        self.manager.remove(id).await
    }

    /// UpdateRoomConfig (§6): persist a new mode and/or auto-reconnect flag.
    /// Does not affect a currently running Supervisor's in-flight state; the
    /// new values take effect on the next Start.
    pub fn update_room_config(
        &self,
        id: &str,
        mode: Option<&str>,
        auto_reconnect: Option<bool>,
    ) -> Result<(), ManagerError> {
        let mode = match mode {
            Some(raw) => Some(MonitorMode::parse(raw).ok_or(ManagerError::InvalidMode)?),
            None => None,
        };
        self.gateway
            .update_room_config(id, mode, auto_reconnect)
            .map_err(|_| ManagerError::RoomNotFound)
    }

    pub async fn room_status(&self, id: &str) -> Result<Option<RoomStatusView>, ManagerError> {
        let room = self.gateway.get_room(id).map_err(|_| ManagerError::RoomNotFound)?;
        Ok(match room {
            Some(room) => {
                let is_active = self.manager.is_active(id).await;
                Some(RoomStatusView { room, is_active })
            }
            None => None,
        })
    }

    pub fn bus(&self) -> &Arc<SubscriberBus> {
        &self.bus
    }

    pub fn gateway(&self) -> &Arc<dyn StorageGateway> {
        &self.gateway
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Broadcasts Stop to every active Supervisor and cancels the
    /// Scheduler's jobs, each bounded by `ShutdownGraceSecs` (§5).
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        let handles = std::mem::take(&mut *self.scheduler_handles.lock().await);
        let grace = self.config.shutdown_grace();
        for handle in handles {
            if tokio::time::timeout(grace, handle).await.is_err() {
                tracing::warn!("scheduler job did not stop within grace period");
            }
        }
        self.manager.shutdown().await;
    }
}

/// Blocks until a Ctrl-C (or, on Unix, SIGTERM) signal arrives, then runs
/// `Core::shutdown`. Mirrors the teacher's graceful-shutdown wiring in
/// `lib.rs::run`.
pub async fn run_until_signal(core: &Core) -> anyhow::Result<()> {
    core.reconcile_on_boot().await?;
    core.start_background_jobs().await?;

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received ctrl-c, shutting down"),
            _ = sigterm.recv() => tracing::info!("received sigterm, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("received ctrl-c, shutting down");
    }

    core.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono_tz::Asia::Shanghai;

    use super::*;
    use crate::clock::SystemClock;
    use crate::fetcher::scripted::{ScriptedFetcher, ScriptedProbe, SingleScriptedFactory};
    use crate::storage::sqlite::SqliteGateway;

    fn test_config() -> Config {
        Config {
            db_path: ":memory:".into(),
            max_retries: 1,
            reconnect_delay_secs: 1,
            poll_interval_secs: 1,
            max_poll_attempts: 1,
            stats_snapshot_interval_secs: 3600,
            restart_failed_interval_secs: 3600,
            purge_interval_secs: 3600,
            data_retention_days: 0,
            stale_session_hours: 2,
            trace_cache_capacity: 500,
            shutdown_grace_secs: 1,
            top_contributors: 10,
            timezone: "Asia/Shanghai".into(),
            autostart_rooms: vec![],
        }
    }

    #[tokio::test]
    async fn add_start_stop_round_trip() -> anyhow::Result<()> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(Shanghai));
        let gateway: Arc<dyn StorageGateway> = Arc::new(SqliteGateway::open(":memory:", Arc::clone(&clock))?);
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_probe(ScriptedProbe { is_live: false, anchor_name: None, anchor_id: None });
        let factory: Arc<dyn FetcherFactory> = Arc::new(SingleScriptedFactory::new(fetcher));

        let core = Core::new(test_config(), gateway, clock, factory)?;
        core.reconcile_on_boot().await?;
        core.add_room("room1", MonitorMode::Manual, false).await?;
        core.start_room("room1").await?;

        let status = core.room_status("room1").await?.expect("room exists");
        assert!(status.is_active);

        core.stop_room("room1").await?;
        let status = core.room_status("room1").await?.expect("room exists");
        assert!(!status.is_active);

        core.remove_room("room1").await?;
        assert!(core.room_status("room1").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn update_room_config_rejects_bad_mode() -> anyhow::Result<()> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(Shanghai));
        let gateway: Arc<dyn StorageGateway> = Arc::new(SqliteGateway::open(":memory:", Arc::clone(&clock))?);
        let factory: Arc<dyn FetcherFactory> = Arc::new(SingleScriptedFactory::new(Arc::new(ScriptedFetcher::new())));
        let core = Core::new(test_config(), gateway, clock, factory)?;
        core.add_room("room1", MonitorMode::Manual, false).await?;

        let result = core.update_room_config("room1", Some("bogus"), None);
        assert!(matches!(result, Err(ManagerError::InvalidMode)));

        core.update_room_config("room1", Some("persistent"), Some(true))?;
        let status = core.room_status("room1").await?.expect("room exists");
        assert_eq!(status.room.mode, MonitorMode::Persistent);
        assert!(status.room.auto_reconnect);
        Ok(())
    }

    #[tokio::test]
    async fn start_background_jobs_autostarts_configured_rooms() -> anyhow::Result<()> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(Shanghai));
        let gateway: Arc<dyn StorageGateway> = Arc::new(SqliteGateway::open(":memory:", Arc::clone(&clock))?);
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_probe(ScriptedProbe { is_live: false, anchor_name: None, anchor_id: None });
        let factory: Arc<dyn FetcherFactory> = Arc::new(SingleScriptedFactory::new(fetcher));

        let mut config = test_config();
        config.autostart_rooms = vec!["room1".into()];
        let core = Core::new(config, gateway, clock, factory)?;
        core.reconcile_on_boot().await?;
        core.start_background_jobs().await?;

        let status = core.room_status("room1").await?.expect("autostarted");
        assert!(status.is_active);
        assert_eq!(status.room.mode, MonitorMode::Persistent);

        core.shutdown().await;
        Ok(())
    }
}
