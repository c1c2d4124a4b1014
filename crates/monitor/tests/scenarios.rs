// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenario tests, each built around a `Core` wired to an
//! in-memory `SqliteGateway` and a `ScriptedFetcher`, driving one whole
//! room lifecycle the way a platform connection actually would.

use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Asia::Shanghai;

use roomwatch::clock::{Clock, SystemClock};
use roomwatch::config::Config;
use roomwatch::core::Core;
use roomwatch::domain::{MonitorMode, RoomStatus, SendMode, SessionStatus};
use roomwatch::fetcher::scripted::{ScriptedFetcher, ScriptedProbe, SingleScriptedFactory};
use roomwatch::fetcher::{ChatPayload, ControlKind, FetcherEvent, FetcherFactory, GiftPayload};
use roomwatch::storage::sqlite::SqliteGateway;
use roomwatch::storage::StorageGateway;

fn test_config() -> Config {
    Config {
        db_path: ":memory:".into(),
        max_retries: 2,
        reconnect_delay_secs: 0,
        poll_interval_secs: 0,
        max_poll_attempts: 2,
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

fn core_with(fetcher: Arc<ScriptedFetcher>) -> (Core, Arc<dyn StorageGateway>) {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(Shanghai));
    let gateway: Arc<dyn StorageGateway> = Arc::new(SqliteGateway::open(":memory:", Arc::clone(&clock)).expect("open"));
    let factory: Arc<dyn FetcherFactory> = Arc::new(SingleScriptedFactory::new(fetcher));
    let core = Core::new(test_config(), Arc::clone(&gateway), clock, factory).expect("core");
    (core, gateway)
}

async fn wait_until_stopped(gateway: &Arc<dyn StorageGateway>, room: &str) {
    for _ in 0..200 {
        if let Ok(Some(r)) = gateway.get_room(room) {
            if r.status == RoomStatus::Stopped {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room {room} did not reach Stopped in time");
}

/// S1 — clean session lifecycle: three anonymous-sentinel chat events, one
/// combo gift, one viewer sequence, then `stream_ended`.
#[tokio::test]
async fn s1_clean_session_lifecycle() -> anyhow::Result<()> {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.push_probe(ScriptedProbe { is_live: true, anchor_name: Some("Alice".into()), anchor_id: Some("a1".into()) });
    fetcher.push_event(FetcherEvent::Open { anchor_name: Some("Alice".into()), anchor_id: Some("a1".into()) });
    for _ in 0..3 {
        fetcher.push_event(FetcherEvent::Chat(ChatPayload {
            user_id: "0".into(),
            user_name: "Ann".into(),
            user_level: 3,
            text: "hi".into(),
        }));
    }
    fetcher.push_event(FetcherEvent::Gift(GiftPayload {
        user_id: "u1".into(),
        user_name: "Rich".into(),
        user_level: 1,
        gift_id: "rose".into(),
        gift_name: "Rose".into(),
        group_count: 2,
        unit_price: 10,
        combo_count: Some(1),
        group_id: Some("g1".into()),
        trace_id: Some("t1".into()),
        repeat_end: true,
    }));
    fetcher.push_event(FetcherEvent::ViewerSeq { current: 5, cumulative_raw: "1.5万".into() });
    fetcher.push_event(FetcherEvent::Control(ControlKind::StreamEnded));

    let (core, gateway) = core_with(fetcher);
    core.add_room("r1", MonitorMode::Manual, false).await?;

    let mut stats_rx = core.bus().subscribe_stats("r1").await.0;
    core.start_room("r1").await?;
    wait_until_stopped(&gateway, "r1").await;

    let session_stats = gateway.room_session_stats("r1")?;
    assert!(session_stats.open_session.is_none());
    let aggregated = gateway.aggregated_session_stats("r1", None)?;
    assert_eq!(aggregated.session_count, 1);
    assert_eq!(aggregated.total_chat_count, 3);
    assert_eq!(aggregated.total_gift_count, 2);
    assert_eq!(aggregated.total_income, 20);
    assert_eq!(aggregated.peak_viewer_count, 5);

    let events = gateway.recent_events("r1", None, 100)?;
    let chat_count = events.iter().filter(|e| matches!(e, roomwatch::storage::HistoryEvent::Chat(_))).count();
    assert_eq!(chat_count, 3);
    let gifts: Vec<_> = events
        .into_iter()
        .filter_map(|e| match e {
            roomwatch::storage::HistoryEvent::Gift(g) => Some(g),
            _ => None,
        })
        .collect();
    assert_eq!(gifts.len(), 1);
    assert_eq!(gifts[0].count, 2);
    assert_eq!(gifts[0].total_value, 20);
    assert_eq!(gifts[0].send_mode, SendMode::Combo);

    let contributors = gateway.top_contributors("r1", 10)?;
    let u1 = contributors.iter().find(|c| c.user_id == "u1").expect("u1 contribution");
    assert_eq!(u1.total_score, 20);
    assert_eq!(u1.gift_count, 2);
    assert_eq!(u1.chat_count, 0);
    let ann = contributors.iter().find(|c| c.user_id == "anon:Ann:3").expect("anon contribution");
    assert_eq!(ann.chat_count, 3);
    assert_eq!(ann.total_score, 0);

    let room = gateway.get_room("r1")?.expect("room");
    assert_eq!(room.status, RoomStatus::Stopped);

    // Drain the replayed/ticked stats payloads for the final one with the
    // locale-parsed cumulative viewer figure.
    let mut last = None;
    while let Ok(payload) = stats_rx.try_recv() {
        last = Some(payload);
    }
    let last = last.expect("at least one stats payload published");
    assert_eq!(last.cumulative_viewers, 15_000);
    Ok(())
}

/// S2 — combo merge: four messages sharing `group_id=g1` collapse into one
/// persisted row with count=9, total_value=45.
#[tokio::test]
async fn s2_combo_merge_collapses_to_one_row() -> anyhow::Result<()> {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.push_probe(ScriptedProbe { is_live: true, anchor_name: Some("Alice".into()), anchor_id: Some("a1".into()) });
    fetcher.push_event(FetcherEvent::Open { anchor_name: Some("Alice".into()), anchor_id: Some("a1".into()) });

    let combo = |trace: &str, combo_count: i64, group_count: i64, repeat_end: bool| {
        FetcherEvent::Gift(GiftPayload {
            user_id: "u1".into(),
            user_name: "Rich".into(),
            user_level: 1,
            gift_id: "rose".into(),
            gift_name: "Rose".into(),
            group_count,
            unit_price: 5,
            combo_count: Some(combo_count),
            group_id: Some("g1".into()),
            trace_id: Some(trace.into()),
            repeat_end,
        })
    };
    fetcher.push_event(combo("t1", 1, 3, false));
    fetcher.push_event(combo("t2", 1, 3, false));
    fetcher.push_event(combo("t3", 3, 3, false));
    fetcher.push_event(combo("t4", 3, 3, true));
    fetcher.push_event(FetcherEvent::Control(ControlKind::StreamEnded));

    let (core, gateway) = core_with(fetcher);
    core.add_room("r2", MonitorMode::Manual, false).await?;
    core.start_room("r2").await?;
    wait_until_stopped(&gateway, "r2").await;

    let gifts: Vec<_> = gateway
        .recent_events("r2", None, 100)?
        .into_iter()
        .filter_map(|e| match e {
            roomwatch::storage::HistoryEvent::Gift(g) => Some(g),
            _ => None,
        })
        .collect();
    assert_eq!(gifts.len(), 1, "all four combo messages must collapse to one row");
    assert_eq!(gifts[0].count, 9);
    assert_eq!(gifts[0].total_value, 45);

    let aggregated = gateway.aggregated_session_stats("r2", None)?;
    assert_eq!(aggregated.total_gift_count, 9);
    assert_eq!(aggregated.total_income, 45);
    Ok(())
}

/// S3 — transient disconnect and rejoin: the board and session survive a
/// mid-stream close that is not an explicit `stream_ended`.
#[tokio::test]
async fn s3_transient_disconnect_preserves_session_and_board() -> anyhow::Result<()> {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.push_probe(ScriptedProbe { is_live: true, anchor_name: Some("Alice".into()), anchor_id: Some("a1".into()) });
    fetcher.push_event(FetcherEvent::Open { anchor_name: Some("Alice".into()), anchor_id: Some("a1".into()) });
    fetcher.push_event(FetcherEvent::Gift(GiftPayload {
        user_id: "u1".into(),
        user_name: "Rich".into(),
        user_level: 1,
        gift_id: "rose".into(),
        gift_name: "Rose".into(),
        group_count: 1,
        unit_price: 5,
        combo_count: None,
        group_id: None,
        trace_id: Some("t1".into()),
        repeat_end: false,
    }));

    let (core, gateway) = core_with(Arc::clone(&fetcher));
    core.add_room("r3", MonitorMode::Persistent, true).await?;
    core.start_room("r3").await?;

    // Let the first gift land, then force a raw close (not `stream_ended`) —
    // this must land on the Backoff/reconnect path, not NotBroadcasting.
    tokio::time::sleep(Duration::from_millis(40)).await;
    fetcher.stop();

    // Script the reconnect's probe and stream so the Supervisor comes back
    // up and then ends cleanly.
    fetcher.push_probe(ScriptedProbe { is_live: true, anchor_name: Some("Alice".into()), anchor_id: Some("a1".into()) });
    fetcher.push_event(FetcherEvent::Control(ControlKind::StreamEnded));

    wait_until_stopped(&gateway, "r3").await;

    let session_stats = gateway.room_session_stats("r3")?;
    assert_eq!(session_stats.lifetime_session_count, 1, "reconnect must adopt the existing session, not start a new one");

    let room = gateway.get_room("r3")?.expect("room");
    assert!(room.reconnect_count >= 1);

    let events = gateway.system_events(Some("r3"), Some("reconnect"), 10)?;
    assert!(!events.is_empty(), "a reconnect audit event must be recorded");

    let aggregated = gateway.aggregated_session_stats("r3", None)?;
    assert_eq!(aggregated.total_gift_count, 1, "the board/session state from before the disconnect must survive");
    Ok(())
}

/// S4 — offline polling: a persistent+auto room that never goes live
/// terminates after `MaxPollAttempts` with a `poll_timeout` audit event.
#[tokio::test]
async fn s4_offline_polling_times_out_to_terminated() -> anyhow::Result<()> {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.push_probe(ScriptedProbe { is_live: false, anchor_name: None, anchor_id: None });

    let (core, gateway) = core_with(fetcher);
    core.add_room("r4", MonitorMode::Persistent, true).await?;
    core.start_room("r4").await?;
    wait_until_stopped(&gateway, "r4").await;

    let room = gateway.get_room("r4")?.expect("room");
    assert_eq!(room.status, RoomStatus::Stopped);

    let events = gateway.system_events(Some("r4"), Some("poll_timeout"), 10)?;
    assert_eq!(events.len(), 1);
    Ok(())
}

/// S5 — boot reconciliation: a stale `monitoring` room with a stale `live`
/// session is closed and reset to `stopped` before the Scheduler's jobs run.
#[tokio::test]
async fn s5_boot_reconciliation_closes_stale_session_and_room() -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(Shanghai));
    let gateway: Arc<dyn StorageGateway> = Arc::new(SqliteGateway::open(":memory:", Arc::clone(&clock))?);
    gateway.upsert_room("r5", MonitorMode::Persistent, true)?;
    gateway.update_room_status("r5", RoomStatus::Monitoring, None)?;
    let session = gateway.open_session("r5", Some("Alice"))?;
    assert_eq!(session.status, SessionStatus::Live);

    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.push_probe(ScriptedProbe { is_live: false, anchor_name: None, anchor_id: None });
    let factory: Arc<dyn FetcherFactory> = Arc::new(SingleScriptedFactory::new(fetcher));
    let mut config = test_config();
    // 0 hours means "older than now", so the boot janitor treats the session
    // opened a moment ago as stale.
    config.stale_session_hours = 0;
    let core = Core::new(config, Arc::clone(&gateway), clock, factory)?;
    core.reconcile_on_boot().await?;

    let room = gateway.get_room("r5")?.expect("room");
    assert_eq!(room.status, RoomStatus::Stopped);

    let session_stats = gateway.room_session_stats("r5")?;
    assert!(session_stats.open_session.is_none());

    let resets = gateway.system_events(Some("r5"), Some("status_reset"), 10)?;
    assert_eq!(resets.len(), 1);
    Ok(())
}

/// S6 — dedup across restart: the same `trace_id` delivered again after a
/// simulated crash/restart produces no duplicate row and no aggregate
/// drift.
#[tokio::test]
async fn s6_dedup_across_restart() -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(Shanghai));
    let gateway: Arc<dyn StorageGateway> = Arc::new(SqliteGateway::open(":memory:", Arc::clone(&clock))?);

    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.push_probe(ScriptedProbe { is_live: true, anchor_name: Some("Alice".into()), anchor_id: Some("a1".into()) });
    fetcher.push_event(FetcherEvent::Open { anchor_name: Some("Alice".into()), anchor_id: Some("a1".into()) });
    fetcher.push_event(FetcherEvent::Gift(GiftPayload {
        user_id: "u1".into(),
        user_name: "Rich".into(),
        user_level: 1,
        gift_id: "rose".into(),
        gift_name: "Rose".into(),
        group_count: 1,
        unit_price: 5,
        combo_count: None,
        group_id: None,
        trace_id: Some("t42".into()),
        repeat_end: false,
    }));
    fetcher.push_event(FetcherEvent::Control(ControlKind::StreamEnded));

    let factory: Arc<dyn FetcherFactory> = Arc::new(SingleScriptedFactory::new(fetcher));
    let core = Core::new(test_config(), Arc::clone(&gateway), Arc::clone(&clock), factory)?;
    core.add_room("r6", MonitorMode::Manual, false).await?;
    core.start_room("r6").await?;
    wait_until_stopped(&gateway, "r6").await;

    // Simulate a process restart: a fresh Supervisor (fresh in-memory trace
    // cache) replays the same trace_id against the same durable database.
    // Storage-level uniqueness on trace_id is the only thing standing
    // between this and a duplicate row, since the in-memory cache is gone.
    let result = gateway.append_gift(roomwatch::storage::NewGiftEvent {
        room_identifier: "r6",
        session_id: None,
        user_id: "u1",
        user_name: "Rich",
        user_level: 1,
        gift_id: "rose",
        gift_name: "Rose",
        count: 1,
        unit_price: 5,
        total_value: 5,
        send_mode: SendMode::Normal,
        group_id: None,
        trace_id: Some("t42"),
    });
    assert!(matches!(result, Err(roomwatch::error::StorageError::DuplicateTrace)));

    let gifts: Vec<_> = gateway
        .recent_events("r6", None, 100)?
        .into_iter()
        .filter(|e| matches!(e, roomwatch::storage::HistoryEvent::Gift(_)))
        .collect();
    assert_eq!(gifts.len(), 1);

    let aggregated = gateway.aggregated_session_stats("r6", None)?;
    assert_eq!(aggregated.total_gift_count, 1);
    Ok(())
}
