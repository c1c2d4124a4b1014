// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Room Manager (§4.5): registry of active Supervisors, guarded by one
//! mutex so registry mutations and room-status reconciliation never race
//! each other. Grounded in
//! `examples/original_source/services/room_manager.py`'s `RoomManager`
//! class (`add_room`/`remove_room`/`start_room`/`stop_room`/
//! `restart_failed_rooms`/`_cleanup_stale_statuses`/`shutdown`); the
//! "serialize the registry, let the managed task do its async work outside
//! the lock" shape follows the teacher's `credential/broker.rs`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::bus::SubscriberBus;
use crate::clock::Clock;
use crate::domain::{MonitorMode, Room, RoomStatus};
use crate::error::ManagerError;
use crate::fetcher::FetcherFactory;
use crate::storage::StorageGateway;
use crate::supervisor::{RoomSupervisor, SupervisorHandle, SupervisorTuning};

/// Snapshot of one registered room, as surfaced by [`RoomManager::status_of`]
/// / [`RoomManager::all_statuses`].
#[derive(Debug, Clone)]
pub struct RoomStatusView {
    pub room: Room,
    pub is_active: bool,
}

struct Registry {
    handles: HashMap<String, SupervisorHandle>,
}

/// Owns the set of currently-supervised rooms. One instance per process,
/// held by [`crate::core::Core`].
pub struct RoomManager {
    gateway: Arc<dyn StorageGateway>,
    bus: Arc<SubscriberBus>,
    clock: Arc<dyn Clock>,
    fetcher_factory: Arc<dyn FetcherFactory>,
    tuning: SupervisorTuning,
    shutdown_grace: Duration,
    registry: Mutex<Registry>,
}

impl RoomManager {
    pub fn new(
        gateway: Arc<dyn StorageGateway>,
        bus: Arc<SubscriberBus>,
        clock: Arc<dyn Clock>,
        fetcher_factory: Arc<dyn FetcherFactory>,
        tuning: SupervisorTuning,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            gateway,
            bus,
            clock,
            fetcher_factory,
            tuning,
            shutdown_grace,
            registry: Mutex::new(Registry { handles: HashMap::new() }),
        }
    }

    /// §4.5.2: start-up reconciliation. Every Room persisted as `monitoring`
    /// with no in-memory Supervisor is stale — reset it to `stopped` and log
    /// why, so the dashboard can trust the status column again.
    pub async fn reconcile_on_boot(&self) -> Result<u64, ManagerError> {
        let registry = self.registry.lock().await;
        let stale = self
            .gateway
            .list_rooms(&crate::domain::RoomFilter { status: Some(RoomStatus::Monitoring), mode: None })
            .map_err(|e| ManagerError::AlreadyActive.log_cause(&e))?;

        let mut reset = 0u64;
        for room in stale {
            if registry.handles.contains_key(&room.identifier) {
                continue;
            }
            if let Err(e) = self.gateway.update_room_status(&room.identifier, RoomStatus::Stopped, Some("应用重启：状态重置")) {
                tracing::warn!(room = %room.identifier, err = %e, "failed to reconcile stale room status");
                continue;
            }
            let _ = self.gateway.append_system_event(
                Some(&room.identifier),
                "status_reset",
                Some("应用重启：检测到状态不一致，已重置为 stopped"),
            );
            reset += 1;
        }
        Ok(reset)
    }

    /// `add(id, mode, auto)` (§4.5.1): creates a persistent Room row if
    /// absent; rejects if already active.
    pub async fn add(&self, room_identifier: &str, mode: MonitorMode, auto_reconnect: bool) -> Result<Room, ManagerError> {
        let registry = self.registry.lock().await;
        if registry.handles.contains_key(room_identifier) {
            return Err(ManagerError::AlreadyActive);
        }
        drop(registry);

        self.gateway
            .upsert_room(room_identifier, mode, auto_reconnect)
            .map_err(|e| ManagerError::AlreadyActive.log_cause(&e))
    }

    /// `start(id)` (§4.5.1): creates or revives a Supervisor and issues
    /// Start.
    pub async fn start(&self, room_identifier: &str) -> Result<(), ManagerError> {
        let mut registry = self.registry.lock().await;
        if registry.handles.contains_key(room_identifier) {
            return Err(ManagerError::AlreadyActive);
        }

        let room = match self.gateway.get_room(room_identifier) {
            Ok(Some(room)) => room,
            Ok(None) => return Err(ManagerError::RoomNotFound),
            Err(e) => return Err(ManagerError::RoomNotFound.log_cause(&e)),
        };

        if room.status == RoomStatus::Monitoring {
            tracing::info!(room = room_identifier, "room status was monitoring with no active supervisor, resetting before start");
            let _ = self.gateway.update_room_status(room_identifier, RoomStatus::Stopped, Some("启动前重置状态"));
        }

        let fetcher = self.fetcher_factory.create(room_identifier);
        let handle = RoomSupervisor::spawn(
            room_identifier,
            fetcher,
            Arc::clone(&self.gateway),
            Arc::clone(&self.bus),
            Arc::clone(&self.clock),
            self.tuning,
        );
        registry.handles.insert(room_identifier.to_owned(), handle);
        Ok(())
    }

    /// `stop(id)` (§4.5.1): issues Stop; if no Supervisor is registered but
    /// the database still says `monitoring`, reconciles the inconsistency.
    pub async fn stop(&self, room_identifier: &str) -> Result<(), ManagerError> {
        let mut registry = self.registry.lock().await;
        match registry.handles.remove(room_identifier) {
            Some(handle) => {
                handle.cancel.cancel();
                drop(registry);
                let _ = handle.join.await;
                Ok(())
            }
            None => {
                drop(registry);
                match self.gateway.get_room(room_identifier) {
                    Ok(Some(room)) if room.status == RoomStatus::Monitoring => {
                        let _ = self.gateway.update_room_status(room_identifier, RoomStatus::Stopped, Some("状态不一致，已重置"));
                        Ok(())
                    }
                    Ok(Some(_)) => Err(ManagerError::NotActive),
                    Ok(None) => Err(ManagerError::RoomNotFound),
                    Err(e) => Err(ManagerError::NotActive.log_cause(&e)),
                }
            }
        }
    }

    /// `remove(id)` (§4.5.1): stops (if active) and deletes the Room row.
    pub async fn remove(&self, room_identifier: &str) -> Result<(), ManagerError> {
        let _ = self.stop(room_identifier).await;
        self.bus.remove_topic(room_identifier).await;
        self.gateway.delete_room(room_identifier).map_err(|e| ManagerError::RoomNotFound.log_cause(&e))
    }

    /// §4.6 `restart_failed`: for each registered Supervisor whose task has
    /// exited and whose Room still has auto-reconnect enabled, re-start it.
    pub async fn restart_failed(&self) -> u64 {
        let mut registry = self.registry.lock().await;
        let finished: Vec<String> = registry
            .handles
            .iter()
            .filter(|(_, h)| h.join.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        let mut restarted = 0u64;
        for room_identifier in finished {
            registry.handles.remove(&room_identifier);
            let room = match self.gateway.get_room(&room_identifier) {
                Ok(Some(room)) => room,
                _ => continue,
            };
            if !room.auto_reconnect {
                continue;
            }
            let fetcher = self.fetcher_factory.create(&room_identifier);
            let handle = RoomSupervisor::spawn(
                room_identifier.clone(),
                fetcher,
                Arc::clone(&self.gateway),
                Arc::clone(&self.bus),
                Arc::clone(&self.clock),
                self.tuning,
            );
            registry.handles.insert(room_identifier.clone(), handle);
            restarted += 1;
            tracing::info!(room = %room_identifier, "restarted failed supervisor");
        }
        restarted
    }

    /// §4.6 `auto_start_persistent`, run once at boot: ensure every
    /// persistent Room is registered and started.
    pub async fn auto_start_persistent(&self) -> u64 {
        let rooms = match self.gateway.list_persistent_rooms() {
            Ok(rooms) => rooms,
            Err(e) => {
                tracing::warn!(err = %e, "failed to list persistent rooms for auto-start");
                return 0;
            }
        };
        let mut started = 0u64;
        for room in rooms {
            if self.start(&room.identifier).await.is_ok() {
                started += 1;
            }
        }
        started
    }

    pub async fn is_active(&self, room_identifier: &str) -> bool {
        self.registry.lock().await.handles.contains_key(room_identifier)
    }

    pub async fn active_room_ids(&self) -> Vec<String> {
        self.registry.lock().await.handles.keys().cloned().collect()
    }

    pub async fn rolling_stats(&self, room_identifier: &str) -> Option<crate::processor::RollingStats> {
        let registry = self.registry.lock().await;
        let handle = registry.handles.get(room_identifier)?;
        Some(*handle.stats.read().await)
    }

    /// §4.5.4/§5: broadcast Stop to all Supervisors and await termination,
    /// bounded by `shutdown_grace`.
    pub async fn shutdown(&self) {
        let mut registry = self.registry.lock().await;
        let handles: Vec<(String, SupervisorHandle)> = registry.handles.drain().collect();
        drop(registry);

        for (_, handle) in &handles {
            handle.cancel.cancel();
        }

        let grace = self.shutdown_grace;
        for (room_identifier, handle) in handles {
            match tokio::time::timeout(grace, handle.join).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(room = %room_identifier, "supervisor did not stop within grace period");
                    let _ = self.gateway.append_system_event(
                        Some(&room_identifier),
                        "forced_exit",
                        Some("shutdown grace period elapsed"),
                    );
                }
            }
        }
    }
}

impl ManagerError {
    /// Logs the underlying storage failure and returns `self` unchanged —
    /// `ManagerError` itself carries no payload (§7), so the cause is only
    /// ever observable via tracing.
    fn log_cause(self, cause: &dyn std::fmt::Display) -> Self {
        tracing::warn!(err = %cause, "storage failure during manager operation");
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono_tz::Asia::Shanghai;

    use super::*;
    use crate::clock::SystemClock;
    use crate::fetcher::scripted::{ScriptedFetcher, ScriptedProbe, SingleScriptedFactory};
    use crate::storage::sqlite::SqliteGateway;

    fn tuning() -> SupervisorTuning {
        SupervisorTuning {
            max_retries: 1,
            reconnect_delay: Duration::from_millis(5),
            poll_interval: Duration::from_millis(5),
            max_poll_attempts: 1,
            trace_cache_capacity: 500,
            top_contributors: 10,
        }
    }

    fn manager_with(fetcher: Arc<ScriptedFetcher>) -> (RoomManager, Arc<dyn StorageGateway>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(Shanghai));
        let gateway: Arc<dyn StorageGateway> = Arc::new(SqliteGateway::open(":memory:", Arc::clone(&clock)).expect("open"));
        let bus = Arc::new(SubscriberBus::new());
        let factory: Arc<dyn FetcherFactory> = Arc::new(SingleScriptedFactory::new(fetcher));
        (RoomManager::new(Arc::clone(&gateway), bus, clock, factory, tuning(), Duration::from_millis(200)), gateway)
    }

    #[tokio::test]
    async fn add_then_start_creates_and_registers() -> anyhow::Result<()> {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_probe(ScriptedProbe { is_live: false, anchor_name: None, anchor_id: None });
        let (manager, gateway) = manager_with(fetcher);

        manager.add("room1", MonitorMode::Manual, false).await?;
        manager.start("room1").await?;
        assert!(manager.is_active("room1").await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let room = gateway.get_room("room1")?.expect("room exists");
        assert_eq!(room.status, RoomStatus::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn start_twice_rejects_second_call() -> anyhow::Result<()> {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_probe(ScriptedProbe { is_live: false, anchor_name: None, anchor_id: None });
        let (manager, _gateway) = manager_with(fetcher);

        manager.add("room1", MonitorMode::Manual, false).await?;
        manager.start("room1").await?;
        let result = manager.start("room1").await;
        assert!(matches!(result, Err(ManagerError::AlreadyActive)));
        Ok(())
    }

    #[tokio::test]
    async fn reconcile_on_boot_resets_stale_monitoring_rows() -> anyhow::Result<()> {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let (manager, gateway) = manager_with(fetcher);

        gateway.upsert_room("room1", MonitorMode::Persistent, true)?;
        gateway.update_room_status("room1", RoomStatus::Monitoring, None)?;

        let reset = manager.reconcile_on_boot().await?;
        assert_eq!(reset, 1);
        let room = gateway.get_room("room1")?.expect("room exists");
        assert_eq!(room.status, RoomStatus::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_stops_all_active_supervisors() -> anyhow::Result<()> {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_probe(ScriptedProbe { is_live: false, anchor_name: None, anchor_id: None });
        let (manager, _gateway) = manager_with(fetcher);

        manager.add("room1", MonitorMode::Manual, false).await?;
        manager.start("room1").await?;
        manager.shutdown().await;
        assert!(!manager.is_active("room1").await);
        Ok(())
    }
}
