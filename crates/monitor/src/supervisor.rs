// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Room Supervisor (§4.4): one task per actively watched room, driving the
//! probe/stream/backoff/poll state machine and writing the audit trail
//! around each transition. Grounded in
//! `examples/original_source/services/room_manager.py`'s `MonitoredRoom`
//! (`_monitor_loop`, `_poll_room_status`, `should_reconnect`); the
//! cancellable-sleep/reconnect idiom borrows from the teacher's
//! `upstream/feed.rs` and `upstream/bridge.rs` backoff loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::bus::SubscriberBus;
use crate::clock::Clock;
use crate::domain::{MonitorMode, RoomStatus};
use crate::fetcher::{ControlKind, Fetcher, FetcherEvent, ProbeResult};
use crate::processor::{EventProcessor, RollingStats};
use crate::storage::StorageGateway;

/// Mirrors the §4.4 state names for introspection and testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Probing,
    Streaming,
    OfflinePolling,
    Backoff,
    Waiting,
    Terminated,
}

/// Tunables the Supervisor needs, lifted out of [`crate::config::Config`] so
/// this module doesn't depend on `clap`.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorTuning {
    pub max_retries: u32,
    pub reconnect_delay: Duration,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub trace_cache_capacity: usize,
    pub top_contributors: usize,
}

/// Handle the Manager keeps for an active Supervisor (§4.5).
pub struct SupervisorHandle {
    pub cancel: CancellationToken,
    pub join: tokio::task::JoinHandle<()>,
    pub stats: Arc<RwLock<RollingStats>>,
    pub state: watch::Receiver<SupervisorState>,
}

enum StreamOutcome {
    /// The platform signaled `stream_ended` before the transport closed
    /// (§4.3.4, §7 `NotBroadcasting`) — not a failure, so it must not consume
    /// the reconnect budget.
    NotBroadcasting,
    /// The transport closed or errored without an explicit `stream_ended`
    /// signal (idle close, 502, parse failure) — drives the normal
    /// Backoff/Waiting reconnect path (§4.4, §7).
    Error,
    Cancelled,
}

enum PollOutcome {
    Detected,
    TimedOut,
    Cancelled,
}

/// Drives one room's lifecycle end to end. Constructed fresh by the Manager
/// at Start and dropped once the task exits.
pub struct RoomSupervisor {
    room_identifier: String,
    fetcher: Arc<dyn Fetcher>,
    gateway: Arc<dyn StorageGateway>,
    clock: Arc<dyn Clock>,
    tuning: SupervisorTuning,
    cancel: CancellationToken,
    state_tx: watch::Sender<SupervisorState>,
    stats: Arc<RwLock<RollingStats>>,
    processor: EventProcessor,
}

impl RoomSupervisor {
    /// Builds a Supervisor and spawns its task, returning a handle the
    /// Manager can use to observe and stop it.
    pub fn spawn(
        room_identifier: impl Into<String>,
        fetcher: Arc<dyn Fetcher>,
        gateway: Arc<dyn StorageGateway>,
        bus: Arc<SubscriberBus>,
        clock: Arc<dyn Clock>,
        tuning: SupervisorTuning,
    ) -> SupervisorHandle {
        let room_identifier = room_identifier.into();
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SupervisorState::Idle);
        let stats = Arc::new(RwLock::new(RollingStats::default()));

        let processor = EventProcessor::new(
            room_identifier.clone(),
            Arc::clone(&gateway),
            bus,
            tuning.trace_cache_capacity,
            tuning.top_contributors,
        );

        let supervisor = Self {
            room_identifier,
            fetcher,
            gateway,
            clock,
            tuning,
            cancel: cancel.clone(),
            state_tx,
            stats: Arc::clone(&stats),
            processor,
        };

        let join = tokio::spawn(supervisor.run());

        SupervisorHandle { cancel, join, stats, state: state_rx }
    }

    fn set_state(&self, state: SupervisorState) {
        let _ = self.state_tx.send(state);
    }

    async fn audit(&self, kind: &str, message: Option<&str>) {
        tracing::debug!(room = %self.room_identifier, kind, at = %self.clock.now(), "audit event");
        if let Err(e) = self.gateway.append_system_event(Some(&self.room_identifier), kind, message) {
            tracing::warn!(room = %self.room_identifier, err = %e, "failed to append system event");
        }
    }

    async fn set_status(&self, status: RoomStatus, error: Option<&str>) {
        if let Err(e) = self.gateway.update_room_status(&self.room_identifier, status, error) {
            tracing::warn!(room = %self.room_identifier, err = %e, "failed to update room status");
        }
    }

    async fn publish_rolling_stats(&self) {
        *self.stats.write().await = self.processor.rolling_stats();
    }

    async fn sleep_cancellable(&self, dur: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// The main loop (§4.4). Runs until the room is `Terminated`.
    pub async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                self.terminate_stopped("shutdown").await;
                return;
            }

            self.set_state(SupervisorState::Probing);
            let probe = match self.fetcher.probe_live(&self.room_identifier).await {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(room = %self.room_identifier, err = %e, "probe_live failed");
                    self.set_status(RoomStatus::Error, Some(&e.to_string())).await;
                    self.audit("error", Some(&e.to_string())).await;
                    if !self.reconnect_or_wait().await {
                        return;
                    }
                    continue;
                }
            };

            if !probe.is_live {
                self.set_status(RoomStatus::Offline, Some("主播未开播")).await;
                self.audit("not_live", None).await;

                if self.persistent_auto_reconnect().await {
                    self.set_state(SupervisorState::OfflinePolling);
                    match self.poll_until_live().await {
                        PollOutcome::Detected => {
                            self.reset_reconnect_counter().await;
                            continue;
                        }
                        PollOutcome::TimedOut => {
                            self.set_status(RoomStatus::Stopped, Some("轮询超时，未检测到开播")).await;
                            self.audit("poll_timeout", None).await;
                            self.set_state(SupervisorState::Terminated);
                            return;
                        }
                        PollOutcome::Cancelled => {
                            self.terminate_stopped("shutdown").await;
                            return;
                        }
                    }
                } else {
                    self.set_status(RoomStatus::Stopped, Some("主播未开播，停止监控")).await;
                    self.set_state(SupervisorState::Terminated);
                    return;
                }
            }

            self.set_state(SupervisorState::Streaming);
            self.set_status(RoomStatus::Monitoring, None).await;
            self.audit("connect", probe.anchor_name.as_deref()).await;
            if let Err(e) = self.gateway.record_connect(&self.room_identifier) {
                tracing::warn!(room = %self.room_identifier, err = %e, "record_connect failed");
            }

            let outcome = self.run_stream(probe).await;

            match outcome {
                StreamOutcome::Cancelled => {
                    self.terminate_stopped("shutdown").await;
                    return;
                }
                StreamOutcome::NotBroadcasting => {
                    // §7 NotBroadcasting: the platform told us the stream
                    // ended. This does not consume the reconnect budget —
                    // it routes exactly like an initial not-live probe.
                    self.audit("disconnect", Some("stream_ended")).await;
                    self.set_status(RoomStatus::Offline, Some("直播已结束")).await;

                    if self.persistent_auto_reconnect().await {
                        self.set_state(SupervisorState::OfflinePolling);
                        match self.poll_until_live().await {
                            PollOutcome::Detected => {
                                self.reset_reconnect_counter().await;
                                continue;
                            }
                            PollOutcome::TimedOut => {
                                self.set_status(RoomStatus::Stopped, Some("轮询超时，未检测到开播")).await;
                                self.audit("poll_timeout", None).await;
                                self.set_state(SupervisorState::Terminated);
                                return;
                            }
                            PollOutcome::Cancelled => {
                                self.terminate_stopped("shutdown").await;
                                return;
                            }
                        }
                    } else {
                        self.set_status(RoomStatus::Stopped, Some("直播已结束，停止监控")).await;
                        self.set_state(SupervisorState::Terminated);
                        return;
                    }
                }
                StreamOutcome::Error => {
                    self.audit("disconnect", None).await;
                    if !self.reconnect_or_wait().await {
                        return;
                    }
                }
            }
        }
    }

    async fn run_stream(&mut self, probe: ProbeResult) -> StreamOutcome {
        let fetcher = Arc::clone(&self.fetcher);
        let room_id = self.room_identifier.clone();
        let cancel = self.cancel.clone();
        let (tx, mut rx) = mpsc::channel(256);
        let mut open_fut = fetcher.open_stream(&room_id, tx, cancel);
        let mut stop_signaled = false;
        let mut not_broadcasting = false;

        if let Err(e) = self.processor.on_open(probe.anchor_name, probe.anchor_id).await {
            tracing::warn!(room = %self.room_identifier, err = %e, "on_open failed");
        }

        loop {
            tokio::select! {
                res = &mut open_fut => {
                    if not_broadcasting {
                        return StreamOutcome::NotBroadcasting;
                    }
                    return match res {
                        Ok(()) => StreamOutcome::Error,
                        Err(e) => {
                            tracing::warn!(room = %self.room_identifier, err = %e, transient = e.is_transient(), "stream closed with error");
                            StreamOutcome::Error
                        }
                    };
                }
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            if matches!(event, FetcherEvent::Control(ControlKind::StreamEnded)) {
                                not_broadcasting = true;
                            }
                            self.handle_event(event).await;
                            // The Processor requests we leave the streaming
                            // state once `stream_ended` lands (§4.3.4); ask
                            // the Fetcher to unwind rather than waiting on a
                            // remote close that may never come.
                            if not_broadcasting && !stop_signaled {
                                stop_signaled = true;
                                self.fetcher.stop();
                            }
                        }
                        None => {
                            if not_broadcasting {
                                return StreamOutcome::NotBroadcasting;
                            }
                            return StreamOutcome::Error;
                        }
                    }
                }
                _ = self.cancel.cancelled(), if !stop_signaled => {
                    stop_signaled = true;
                    self.fetcher.stop();
                }
            }
        }
    }

    async fn handle_event(&mut self, event: FetcherEvent) {
        match event {
            FetcherEvent::Open { anchor_name, anchor_id } => {
                if let Err(e) = self.processor.on_open(anchor_name, anchor_id).await {
                    tracing::warn!(room = %self.room_identifier, err = %e, "on_open failed");
                }
            }
            FetcherEvent::Chat(chat) => {
                if let Err(e) = self.processor.on_chat(chat).await {
                    tracing::warn!(room = %self.room_identifier, err = %e, "on_chat failed");
                }
                self.publish_rolling_stats().await;
            }
            FetcherEvent::Gift(gift) => {
                if let Err(e) = self.processor.on_gift(gift).await {
                    tracing::warn!(room = %self.room_identifier, err = %e, "on_gift failed");
                }
                self.publish_rolling_stats().await;
            }
            FetcherEvent::ViewerSeq { current, cumulative_raw } => {
                if let Err(e) = self.processor.on_viewer_seq(current, &cumulative_raw).await {
                    tracing::warn!(room = %self.room_identifier, err = %e, "on_viewer_seq failed");
                }
                self.publish_rolling_stats().await;
            }
            FetcherEvent::Control(ControlKind::StreamEnded) => {
                if let Err(e) = self.processor.on_stream_ended().await {
                    tracing::warn!(room = %self.room_identifier, err = %e, "on_stream_ended failed");
                }
                self.publish_rolling_stats().await;
            }
            FetcherEvent::Control(ControlKind::Other(_)) => {}
            FetcherEvent::Close(reason) => {
                tracing::debug!(room = %self.room_identifier, reason, "fetcher reported close");
            }
            FetcherEvent::Error(err) => {
                if err.is_transient() {
                    tracing::warn!(room = %self.room_identifier, err = %err, "transient fetcher error");
                } else {
                    tracing::error!(room = %self.room_identifier, err = %err, "fatal fetcher error");
                }
            }
        }
    }

    async fn persistent_auto_reconnect(&self) -> bool {
        match self.gateway.get_room(&self.room_identifier) {
            Ok(Some(room)) => room.mode == MonitorMode::Persistent && room.auto_reconnect,
            _ => false,
        }
    }

    async fn reset_reconnect_counter(&self) {
        if let Err(e) = self.gateway.reset_reconnect_count(&self.room_identifier) {
            tracing::warn!(room = %self.room_identifier, err = %e, "failed to reset reconnect counter");
        }
    }

    /// Decides between `Backoff → Probing` and `Waiting`/`Terminated`, per
    /// §4.4. Returns `true` if the caller should loop back to `Probing`.
    async fn reconnect_or_wait(&mut self) -> bool {
        let room = match self.gateway.get_room(&self.room_identifier) {
            Ok(Some(room)) => room,
            _ => {
                self.set_state(SupervisorState::Terminated);
                return false;
            }
        };

        if !room.auto_reconnect {
            self.set_status(RoomStatus::Stopped, Some("达到最大重连次数且未开启自动重连")).await;
            self.set_state(SupervisorState::Terminated);
            return false;
        }

        if room.reconnect_count < self.tuning.max_retries {
            let count = self.gateway.record_disconnect(&self.room_identifier).unwrap_or(room.reconnect_count + 1);
            self.audit("reconnect", Some(&format!("准备第 {count} 次重连"))).await;
            self.set_state(SupervisorState::Backoff);
            if !self.sleep_cancellable(self.tuning.reconnect_delay).await {
                return false;
            }
            true
        } else {
            self.set_status(RoomStatus::Waiting, Some("等待主播开播")).await;
            self.audit("waiting", Some("达到最大重连次数，开始轮询直播状态")).await;
            self.set_state(SupervisorState::Waiting);
            match self.poll_until_live().await {
                PollOutcome::Detected => {
                    self.reset_reconnect_counter().await;
                    true
                }
                PollOutcome::TimedOut => {
                    self.set_status(RoomStatus::Stopped, Some("轮询超时，未检测到开播")).await;
                    self.audit("poll_timeout", None).await;
                    self.set_state(SupervisorState::Terminated);
                    false
                }
                PollOutcome::Cancelled => false,
            }
        }
    }

    async fn poll_until_live(&mut self) -> PollOutcome {
        for _ in 0..self.tuning.max_poll_attempts {
            if self.cancel.is_cancelled() {
                return PollOutcome::Cancelled;
            }
            if let Ok(probe) = self.fetcher.probe_live(&self.room_identifier).await {
                if probe.is_live {
                    self.audit("detected", Some("检测到主播开播，准备重新连接")).await;
                    return PollOutcome::Detected;
                }
            }
            if !self.sleep_cancellable(self.tuning.poll_interval).await {
                return PollOutcome::Cancelled;
            }
        }
        PollOutcome::TimedOut
    }

    async fn terminate_stopped(&self, reason: &str) {
        self.set_status(RoomStatus::Stopped, Some(reason)).await;
        self.audit("disconnect", Some(reason)).await;
        self.set_state(SupervisorState::Terminated);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono_tz::Asia::Shanghai;

    use super::*;
    use crate::bus::SubscriberBus;
    use crate::clock::SystemClock;
    use crate::fetcher::scripted::{ScriptedFetcher, ScriptedProbe};
    use crate::storage::sqlite::SqliteGateway;

    fn tuning() -> SupervisorTuning {
        SupervisorTuning {
            max_retries: 2,
            reconnect_delay: Duration::from_millis(5),
            poll_interval: Duration::from_millis(5),
            max_poll_attempts: 2,
            trace_cache_capacity: 500,
            top_contributors: 10,
        }
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(SystemClock::new(Shanghai))
    }

    #[tokio::test]
    async fn not_live_manual_room_terminates_stopped() -> anyhow::Result<()> {
        let gateway: Arc<dyn StorageGateway> = Arc::new(SqliteGateway::open(":memory:", clock())?);
        gateway.upsert_room("room1", MonitorMode::Manual, false)?;

        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_probe(ScriptedProbe { is_live: false, anchor_name: None, anchor_id: None });

        let bus = Arc::new(SubscriberBus::new());
        let handle = RoomSupervisor::spawn(
            "room1",
            fetcher as Arc<dyn Fetcher>,
            Arc::clone(&gateway),
            bus,
            clock(),
            tuning(),
        );
        handle.join.await?;

        let room = gateway.get_room("room1")?.expect("room exists");
        assert_eq!(room.status, RoomStatus::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn live_room_streams_and_processes_chat() -> anyhow::Result<()> {
        let gateway: Arc<dyn StorageGateway> = Arc::new(SqliteGateway::open(":memory:", clock())?);
        gateway.upsert_room("room1", MonitorMode::Manual, false)?;

        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_probe(ScriptedProbe {
            is_live: true,
            anchor_name: Some("Anchor".into()),
            anchor_id: Some("a1".into()),
        });
        fetcher.push_event(FetcherEvent::Open { anchor_name: Some("Anchor".into()), anchor_id: Some("a1".into()) });
        fetcher.push_event(FetcherEvent::Chat(crate::fetcher::ChatPayload {
            user_id: "u1".into(),
            user_name: "Ann".into(),
            user_level: 3,
            text: "hello".into(),
        }));
        fetcher.push_event(FetcherEvent::Control(ControlKind::StreamEnded));

        let bus = Arc::new(SubscriberBus::new());
        let handle = RoomSupervisor::spawn(
            "room1",
            fetcher as Arc<dyn Fetcher>,
            Arc::clone(&gateway),
            bus,
            clock(),
            tuning(),
        );

        // `stream_ended` is a NotBroadcasting signal (§7), not a transport
        // error: the manual room should terminate on its own, with no
        // external Stop needed.
        tokio::time::timeout(Duration::from_secs(2), handle.join).await??;

        let room = gateway.get_room("room1")?.expect("room exists");
        assert_eq!(room.status, RoomStatus::Stopped);
        let stats = gateway.room_session_stats("room1")?;
        assert!(stats.open_session.is_none());
        let aggregated = gateway.aggregated_session_stats("room1", None)?;
        assert_eq!(aggregated.total_chat_count, 1);
        Ok(())
    }
}
