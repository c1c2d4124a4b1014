// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `SqliteGateway` (§4.1a): the one concrete `StorageGateway` this crate
//! ships. An embedded single-file database, appropriate for a monitoring
//! supervisor typically deployed as one process per fleet of watched rooms.
//!
//! Connection management follows `examples/Humans-Not-Required-local-agent-chat`'s
//! `db.rs` pragma/migration idiom, generalized from a single `Mutex<Connection>`
//! to an `r2d2` pool (§4.1a: "so a slow read query cannot stall a write from an
//! unrelated room's Processor"). Schema/column shapes are grounded in
//! `examples/original_source/models/database.py`.

use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};

use crate::clock::{Clock, Timestamp};
use crate::domain::{
    ChatEvent, ContributionDelta, GiftEvent, LiveSession, MonitorMode, Room, RoomFilter,
    RoomStatsSnapshot, RoomStatus, SendMode, SessionStatus, SystemEvent, UserContribution,
};
use crate::error::StorageError;

use super::{
    AggregatedSessionStats, HistoryEvent, NewChatEvent, NewGiftEvent, PurgeCounts,
    RoomSessionStats, StorageGateway,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rooms (
    identifier TEXT PRIMARY KEY,
    anchor_name TEXT,
    anchor_id TEXT,
    mode TEXT NOT NULL,
    auto_reconnect INTEGER NOT NULL,
    status TEXT NOT NULL,
    reconnect_count INTEGER NOT NULL DEFAULT 0,
    last_connect_at TEXT,
    last_disconnect_at TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS live_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    room_identifier TEXT NOT NULL REFERENCES rooms(identifier) ON DELETE CASCADE,
    start_time TEXT NOT NULL,
    end_time TEXT,
    status TEXT NOT NULL,
    total_income INTEGER NOT NULL DEFAULT 0,
    total_gift_count INTEGER NOT NULL DEFAULT 0,
    total_chat_count INTEGER NOT NULL DEFAULT 0,
    peak_viewer_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_sessions_room ON live_sessions(room_identifier);
CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_room_live ON live_sessions(room_identifier) WHERE status = 'live';

CREATE TABLE IF NOT EXISTS chat_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    room_identifier TEXT NOT NULL REFERENCES rooms(identifier) ON DELETE CASCADE,
    session_id INTEGER REFERENCES live_sessions(id) ON DELETE SET NULL,
    user_id TEXT NOT NULL,
    user_name TEXT NOT NULL,
    user_level INTEGER NOT NULL,
    text TEXT NOT NULL,
    is_gift_user INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chat_room_created ON chat_events(room_identifier, created_at);

CREATE TABLE IF NOT EXISTS gift_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    room_identifier TEXT NOT NULL REFERENCES rooms(identifier) ON DELETE CASCADE,
    session_id INTEGER REFERENCES live_sessions(id) ON DELETE SET NULL,
    user_id TEXT NOT NULL,
    user_name TEXT NOT NULL,
    user_level INTEGER NOT NULL,
    gift_id TEXT NOT NULL,
    gift_name TEXT NOT NULL,
    count INTEGER NOT NULL,
    unit_price INTEGER NOT NULL,
    total_value INTEGER NOT NULL,
    send_mode TEXT NOT NULL,
    group_id TEXT,
    trace_id TEXT,
    created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_gift_trace ON gift_events(trace_id) WHERE trace_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_gift_room_created ON gift_events(room_identifier, created_at);

CREATE TABLE IF NOT EXISTS user_contributions (
    room_identifier TEXT NOT NULL REFERENCES rooms(identifier) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    display_name TEXT NOT NULL,
    total_score INTEGER NOT NULL DEFAULT 0,
    gift_count INTEGER NOT NULL DEFAULT 0,
    chat_count INTEGER NOT NULL DEFAULT 0,
    avatar_url TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (room_identifier, user_id)
);

CREATE TABLE IF NOT EXISTS room_stats_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    room_identifier TEXT NOT NULL REFERENCES rooms(identifier) ON DELETE CASCADE,
    current_viewers INTEGER NOT NULL,
    cumulative_viewers INTEGER NOT NULL,
    total_income INTEGER NOT NULL,
    contributor_count INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_room_created ON room_stats_snapshots(room_identifier, created_at);

CREATE TABLE IF NOT EXISTS system_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    room_identifier TEXT REFERENCES rooms(identifier) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    message TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_system_events_room_created ON system_events(room_identifier, created_at);
";

/// Embedded, connection-pooled implementation of [`StorageGateway`].
pub struct SqliteGateway {
    pool: Pool<SqliteConnectionManager>,
    clock: Arc<dyn Clock>,
}

impl SqliteGateway {
    /// Opens (creating if absent) the database at `path` and runs migrations.
    /// Use `:memory:` for an ephemeral in-process database (tests).
    ///
    /// `:memory:` is special-cased to a single pooled connection: each
    /// physical connection SQLite opens against `:memory:` is a private,
    /// distinct database, so a pool of more than one would let a writer and
    /// a concurrent reader land on different in-memory databases and never
    /// observe each other's rows. A single connection (mirroring
    /// `examples/Humans-Not-Required-local-agent-chat`'s `Mutex<Connection>`)
    /// keeps everything on one database; real deployments use a file path
    /// and get the full pool.
    pub fn open(path: &str, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        });
        let pool_size = if path == ":memory:" { 1 } else { 8 };
        let pool = Pool::builder()
            .max_size(pool_size)
            .min_idle(Some(pool_size))
            .build(manager)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let gateway = Self { pool, clock };
        gateway.migrate()?;
        Ok(gateway)
    }

    fn migrate(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA).map_err(map_err)
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool.get().map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn now_str(&self) -> String {
        self.clock.now().to_rfc3339()
    }

    fn parse_ts(&self, s: &str) -> Result<Timestamp, StorageError> {
        chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&self.clock.zone()))
            .map_err(|e| StorageError::Backend(format!("bad timestamp {s:?}: {e}")))
    }

    fn parse_ts_opt(&self, s: Option<String>) -> Result<Option<Timestamp>, StorageError> {
        s.map(|s| self.parse_ts(&s)).transpose()
    }

    fn room_from_row(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRoom> {
        Ok(RawRoom {
            identifier: row.get(0)?,
            anchor_name: row.get(1)?,
            anchor_id: row.get(2)?,
            mode: row.get(3)?,
            auto_reconnect: row.get(4)?,
            status: row.get(5)?,
            reconnect_count: row.get(6)?,
            last_connect_at: row.get(7)?,
            last_disconnect_at: row.get(8)?,
            last_error: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn to_room(&self, raw: RawRoom) -> Result<Room, StorageError> {
        Ok(Room {
            identifier: raw.identifier,
            anchor_name: raw.anchor_name,
            anchor_id: raw.anchor_id,
            mode: MonitorMode::parse(&raw.mode).ok_or_else(|| StorageError::Backend(format!("bad mode {:?}", raw.mode)))?,
            auto_reconnect: raw.auto_reconnect,
            status: RoomStatus::parse(&raw.status).ok_or_else(|| StorageError::Backend(format!("bad status {:?}", raw.status)))?,
            reconnect_count: raw.reconnect_count,
            last_connect_at: self.parse_ts_opt(raw.last_connect_at)?,
            last_disconnect_at: self.parse_ts_opt(raw.last_disconnect_at)?,
            last_error: raw.last_error,
            created_at: self.parse_ts(&raw.created_at)?,
            updated_at: self.parse_ts(&raw.updated_at)?,
        })
    }

    fn session_from_row(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSession> {
        Ok(RawSession {
            id: row.get(0)?,
            room_identifier: row.get(1)?,
            start_time: row.get(2)?,
            end_time: row.get(3)?,
            status: row.get(4)?,
            total_income: row.get(5)?,
            total_gift_count: row.get(6)?,
            total_chat_count: row.get(7)?,
            peak_viewer_count: row.get(8)?,
        })
    }

    fn to_session(&self, raw: RawSession) -> Result<LiveSession, StorageError> {
        Ok(LiveSession {
            id: raw.id,
            room_identifier: raw.room_identifier,
            start_time: self.parse_ts(&raw.start_time)?,
            end_time: self.parse_ts_opt(raw.end_time)?,
            status: SessionStatus::parse(&raw.status).ok_or_else(|| StorageError::Backend(format!("bad session status {:?}", raw.status)))?,
            total_income: raw.total_income,
            total_gift_count: raw.total_gift_count,
            total_chat_count: raw.total_chat_count,
            peak_viewer_count: raw.peak_viewer_count,
        })
    }

}

struct RawRoom {
    identifier: String,
    anchor_name: Option<String>,
    anchor_id: Option<String>,
    mode: String,
    auto_reconnect: bool,
    status: String,
    reconnect_count: u32,
    last_connect_at: Option<String>,
    last_disconnect_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

struct RawSession {
    id: i64,
    room_identifier: String,
    start_time: String,
    end_time: Option<String>,
    status: String,
    total_income: i64,
    total_gift_count: i64,
    total_chat_count: i64,
    peak_viewer_count: i64,
}

fn map_err(e: rusqlite::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error { code: rusqlite::ErrorCode::ConstraintViolation, .. },
            _
        )
    )
}

const ROOM_COLUMNS: &str = "identifier, anchor_name, anchor_id, mode, auto_reconnect, status, reconnect_count, last_connect_at, last_disconnect_at, last_error, created_at, updated_at";
const SESSION_COLUMNS: &str = "id, room_identifier, start_time, end_time, status, total_income, total_gift_count, total_chat_count, peak_viewer_count";

impl StorageGateway for SqliteGateway {
    fn upsert_room(
        &self,
        identifier: &str,
        mode: MonitorMode,
        auto_reconnect: bool,
    ) -> Result<Room, StorageError> {
        let conn = self.conn()?;
        if let Some(existing) = self.get_room(identifier)? {
            return Ok(existing);
        }
        let now = self.now_str();
        conn.execute(
            "INSERT INTO rooms (identifier, mode, auto_reconnect, status, reconnect_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'stopped', 0, ?4, ?4)
             ON CONFLICT(identifier) DO NOTHING",
            params![identifier, mode.as_str(), auto_reconnect, now],
        )
        .map_err(map_err)?;
        self.get_room(identifier)?.ok_or(StorageError::NotFound)
    }

    fn get_room(&self, identifier: &str) -> Result<Option<Room>, StorageError> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE identifier = ?1"),
                params![identifier],
                |row| self.room_from_row(row),
            )
            .optional()
            .map_err(map_err)?;
        raw.map(|r| self.to_room(r)).transpose()
    }

    fn update_room_status(
        &self,
        identifier: &str,
        status: RoomStatus,
        error: Option<&str>,
    ) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let now = self.now_str();
        conn.execute(
            "UPDATE rooms SET status = ?1, last_error = ?2, updated_at = ?3 WHERE identifier = ?4",
            params![status.as_str(), error, now, identifier],
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn update_room_anchor(
        &self,
        identifier: &str,
        anchor_name: Option<&str>,
        anchor_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let now = self.now_str();
        conn.execute(
            "UPDATE rooms SET anchor_name = ?1, anchor_id = ?2, updated_at = ?3 WHERE identifier = ?4",
            params![anchor_name, anchor_id, now, identifier],
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn update_room_config(
        &self,
        identifier: &str,
        mode: Option<MonitorMode>,
        auto_reconnect: Option<bool>,
    ) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let now = self.now_str();
        if let Some(mode) = mode {
            conn.execute(
                "UPDATE rooms SET mode = ?1, updated_at = ?2 WHERE identifier = ?3",
                params![mode.as_str(), now, identifier],
            )
            .map_err(map_err)?;
        }
        if let Some(auto) = auto_reconnect {
            conn.execute(
                "UPDATE rooms SET auto_reconnect = ?1, updated_at = ?2 WHERE identifier = ?3",
                params![auto, now, identifier],
            )
            .map_err(map_err)?;
        }
        Ok(())
    }

    fn record_connect(&self, identifier: &str) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let now = self.now_str();
        conn.execute(
            "UPDATE rooms SET last_connect_at = ?1, updated_at = ?1 WHERE identifier = ?2",
            params![now, identifier],
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn reset_reconnect_count(&self, identifier: &str) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let now = self.now_str();
        conn.execute(
            "UPDATE rooms SET reconnect_count = 0, updated_at = ?1 WHERE identifier = ?2",
            params![now, identifier],
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn record_disconnect(&self, identifier: &str) -> Result<u32, StorageError> {
        let conn = self.conn()?;
        let now = self.now_str();
        conn.execute(
            "UPDATE rooms SET last_disconnect_at = ?1, reconnect_count = reconnect_count + 1, updated_at = ?1 WHERE identifier = ?2",
            params![now, identifier],
        )
        .map_err(map_err)?;
        conn.query_row(
            "SELECT reconnect_count FROM rooms WHERE identifier = ?1",
            params![identifier],
            |row| row.get(0),
        )
        .map_err(map_err)
    }

    fn delete_room(&self, identifier: &str) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM rooms WHERE identifier = ?1", params![identifier]).map_err(map_err)?;
        Ok(())
    }

    fn list_rooms(&self, filter: &RoomFilter) -> Result<Vec<Room>, StorageError> {
        let conn = self.conn()?;
        let mut sql = format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE 1=1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?1");
        }
        if filter.mode.is_some() {
            sql.push_str(if filter.status.is_some() { " AND mode = ?2" } else { " AND mode = ?1" });
        }
        let mut stmt = conn.prepare(&sql).map_err(map_err)?;
        let raws: Vec<RawRoom> = match (filter.status, filter.mode) {
            (Some(s), Some(m)) => stmt
                .query_map(params![s.as_str(), m.as_str()], |row| self.room_from_row(row))
                .map_err(map_err)?
                .collect::<Result<_, _>>()
                .map_err(map_err)?,
            (Some(s), None) => stmt
                .query_map(params![s.as_str()], |row| self.room_from_row(row))
                .map_err(map_err)?
                .collect::<Result<_, _>>()
                .map_err(map_err)?,
            (None, Some(m)) => stmt
                .query_map(params![m.as_str()], |row| self.room_from_row(row))
                .map_err(map_err)?
                .collect::<Result<_, _>>()
                .map_err(map_err)?,
            (None, None) => stmt
                .query_map([], |row| self.room_from_row(row))
                .map_err(map_err)?
                .collect::<Result<_, _>>()
                .map_err(map_err)?,
        };
        raws.into_iter().map(|r| self.to_room(r)).collect()
    }

    fn list_persistent_rooms(&self) -> Result<Vec<Room>, StorageError> {
        self.list_rooms(&RoomFilter { status: None, mode: Some(MonitorMode::Persistent) })
    }

    fn open_session(&self, room_identifier: &str, anchor_name: Option<&str>) -> Result<LiveSession, StorageError> {
        let conn = self.conn()?;
        if let Some(name) = anchor_name {
            tracing::debug!(room = room_identifier, anchor = name, "opening session");
        }
        let now = self.now_str();
        let result = conn.query_row(
            &format!(
                "INSERT INTO live_sessions (room_identifier, start_time, status, total_income, total_gift_count, total_chat_count, peak_viewer_count)
                 VALUES (?1, ?2, 'live', 0, 0, 0, 0)
                 RETURNING {SESSION_COLUMNS}"
            ),
            params![room_identifier, now],
            |row| self.session_from_row(row),
        );
        match result {
            Ok(raw) => self.to_session(raw),
            Err(e) if is_constraint_violation(&e) => Err(StorageError::ConflictingOpenSession),
            Err(e) => Err(map_err(e)),
        }
    }

    fn current_open_session(&self, room_identifier: &str) -> Result<Option<LiveSession>, StorageError> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM live_sessions WHERE room_identifier = ?1 AND status = 'live'"),
                params![room_identifier],
                |row| self.session_from_row(row),
            )
            .optional()
            .map_err(map_err)?;
        raw.map(|r| self.to_session(r)).transpose()
    }

    fn end_session(&self, session_id: i64, peak_viewers: Option<i64>) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let now = self.now_str();
        match peak_viewers {
            Some(p) => conn.execute(
                "UPDATE live_sessions SET status = 'ended', end_time = ?1, peak_viewer_count = MAX(peak_viewer_count, ?2) WHERE id = ?3 AND status = 'live'",
                params![now, p, session_id],
            ),
            None => conn.execute(
                "UPDATE live_sessions SET status = 'ended', end_time = ?1 WHERE id = ?2 AND status = 'live'",
                params![now, session_id],
            ),
        }
        .map_err(map_err)?;
        Ok(())
    }

    fn bump_session(
        &self,
        session_id: i64,
        delta_income: i64,
        delta_gifts: i64,
        delta_chats: i64,
    ) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE live_sessions SET total_income = total_income + ?1, total_gift_count = total_gift_count + ?2, total_chat_count = total_chat_count + ?3 WHERE id = ?4",
            params![delta_income, delta_gifts, delta_chats, session_id],
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn update_session_peak(&self, session_id: i64, peak_viewers: i64) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE live_sessions SET peak_viewer_count = MAX(peak_viewer_count, ?1) WHERE id = ?2",
            params![peak_viewers, session_id],
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn close_stale_sessions(&self, threshold: chrono::Duration) -> Result<u64, StorageError> {
        let conn = self.conn()?;
        let cutoff = self.clock.now() - threshold;
        let cutoff_str = cutoff.to_rfc3339();
        let mut stmt = conn
            .prepare("SELECT id, start_time FROM live_sessions WHERE status = 'live' AND start_time < ?1")
            .map_err(map_err)?;
        let rows: Vec<(i64, String)> = stmt
            .query_map(params![cutoff_str], |r| Ok((r.get(0)?, r.get(1)?)))
            .map_err(map_err)?
            .collect::<Result<_, _>>()
            .map_err(map_err)?;
        drop(stmt);
        let mut closed = 0u64;
        for (id, start_str) in rows {
            let start = self.parse_ts(&start_str)?;
            let end = start + threshold;
            conn.execute(
                "UPDATE live_sessions SET status = 'ended', end_time = ?1 WHERE id = ?2 AND status = 'live'",
                params![end.to_rfc3339(), id],
            )
            .map_err(map_err)?;
            closed += 1;
        }
        Ok(closed)
    }

    fn room_session_stats(&self, room_identifier: &str) -> Result<RoomSessionStats, StorageError> {
        let open_session = self.current_open_session(room_identifier)?;
        let conn = self.conn()?;
        let lifetime_session_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM live_sessions WHERE room_identifier = ?1",
                params![room_identifier],
                |row| row.get(0),
            )
            .map_err(map_err)?;
        Ok(RoomSessionStats {
            room_identifier: room_identifier.to_owned(),
            open_session,
            lifetime_session_count: lifetime_session_count as u64,
        })
    }

    fn aggregated_session_stats(
        &self,
        room_identifier: &str,
        limit: Option<usize>,
    ) -> Result<AggregatedSessionStats, StorageError> {
        let conn = self.conn()?;
        let sql = match limit {
            Some(n) => format!(
                "SELECT COUNT(*), COALESCE(SUM(total_income),0), COALESCE(SUM(total_gift_count),0), COALESCE(SUM(total_chat_count),0), COALESCE(MAX(peak_viewer_count),0)
                 FROM (SELECT * FROM live_sessions WHERE room_identifier = ?1 ORDER BY start_time DESC LIMIT {n})"
            ),
            None => "SELECT COUNT(*), COALESCE(SUM(total_income),0), COALESCE(SUM(total_gift_count),0), COALESCE(SUM(total_chat_count),0), COALESCE(MAX(peak_viewer_count),0)
                 FROM live_sessions WHERE room_identifier = ?1"
                .to_owned(),
        };
        conn.query_row(&sql, params![room_identifier], |row| {
            Ok(AggregatedSessionStats {
                session_count: row.get::<_, i64>(0)? as u64,
                total_income: row.get(1)?,
                total_gift_count: row.get(2)?,
                total_chat_count: row.get(3)?,
                peak_viewer_count: row.get(4)?,
            })
        })
        .map_err(map_err)
    }

    fn append_chat(&self, event: NewChatEvent<'_>) -> Result<ChatEvent, StorageError> {
        let conn = self.conn()?;
        let now = self.now_str();
        conn.query_row(
            "INSERT INTO chat_events (room_identifier, session_id, user_id, user_name, user_level, text, is_gift_user, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             RETURNING id, room_identifier, session_id, user_id, user_name, user_level, text, is_gift_user, created_at",
            params![
                event.room_identifier,
                event.session_id,
                event.user_id,
                event.user_name,
                event.user_level,
                event.text,
                event.is_gift_user,
                now,
            ],
            |row| Ok(row_to_owned_values(row)),
        )
        .map_err(map_err)
        .and_then(|row| self.to_chat(&row))
    }

    fn append_gift(&self, event: NewGiftEvent<'_>) -> Result<GiftEvent, StorageError> {
        let conn = self.conn()?;
        let now = self.now_str();
        let result = conn.query_row(
            "INSERT INTO gift_events (room_identifier, session_id, user_id, user_name, user_level, gift_id, gift_name, count, unit_price, total_value, send_mode, group_id, trace_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             RETURNING id, room_identifier, session_id, user_id, user_name, user_level, gift_id, gift_name, count, unit_price, total_value, send_mode, group_id, trace_id, created_at",
            params![
                event.room_identifier,
                event.session_id,
                event.user_id,
                event.user_name,
                event.user_level,
                event.gift_id,
                event.gift_name,
                event.count,
                event.unit_price,
                event.total_value,
                event.send_mode.as_str(),
                event.group_id,
                event.trace_id,
                now,
            ],
            |row| Ok(row_to_owned_values(row)),
        );
        match result {
            Ok(row) => self.to_gift(&row),
            Err(e) if is_constraint_violation(&e) => Err(StorageError::DuplicateTrace),
            Err(e) => Err(map_err(e)),
        }
    }

    fn update_gift_totals(&self, gift_row_id: i64, new_count: i64, new_total_value: i64) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE gift_events SET count = ?1, total_value = ?2 WHERE id = ?3",
            params![new_count, new_total_value, gift_row_id],
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn recent_events(
        &self,
        room_identifier: &str,
        since: Option<Timestamp>,
        limit: usize,
    ) -> Result<Vec<HistoryEvent>, StorageError> {
        let conn = self.conn()?;
        let since_str = since.map(|t| t.to_rfc3339());

        let mut chat_stmt = conn
            .prepare(
                "SELECT id, room_identifier, session_id, user_id, user_name, user_level, text, is_gift_user, created_at
                 FROM chat_events WHERE room_identifier = ?1 AND (?2 IS NULL OR created_at >= ?2)
                 ORDER BY created_at DESC LIMIT ?3",
            )
            .map_err(map_err)?;
        let chats: Vec<ChatEvent> = chat_stmt
            .query_map(params![room_identifier, since_str, limit as i64], |row| Ok(row_to_owned_values(row)))
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?
            .iter()
            .map(|row| self.to_chat(row))
            .collect::<Result<_, _>>()?;
        drop(chat_stmt);

        let mut gift_stmt = conn
            .prepare(
                "SELECT id, room_identifier, session_id, user_id, user_name, user_level, gift_id, gift_name, count, unit_price, total_value, send_mode, group_id, trace_id, created_at
                 FROM gift_events WHERE room_identifier = ?1 AND (?2 IS NULL OR created_at >= ?2)
                 ORDER BY created_at DESC LIMIT ?3",
            )
            .map_err(map_err)?;
        let gifts: Vec<GiftEvent> = gift_stmt
            .query_map(params![room_identifier, since_str, limit as i64], |row| Ok(row_to_owned_values(row)))
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?
            .iter()
            .map(|row| self.to_gift(row))
            .collect::<Result<_, _>>()?;
        drop(gift_stmt);

        let mut merged: Vec<HistoryEvent> =
            chats.into_iter().map(HistoryEvent::Chat).chain(gifts.into_iter().map(HistoryEvent::Gift)).collect();
        merged.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        merged.truncate(limit);
        Ok(merged)
    }

    fn record_contribution(&self, delta: ContributionDelta<'_>) -> Result<UserContribution, StorageError> {
        let conn = self.conn()?;
        let now = self.now_str();
        conn.query_row(
            "INSERT INTO user_contributions (room_identifier, user_id, display_name, total_score, gift_count, chat_count, avatar_url, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(room_identifier, user_id) DO UPDATE SET
                display_name = excluded.display_name,
                total_score = user_contributions.total_score + excluded.total_score,
                gift_count = user_contributions.gift_count + excluded.gift_count,
                chat_count = user_contributions.chat_count + excluded.chat_count,
                avatar_url = COALESCE(excluded.avatar_url, user_contributions.avatar_url),
                updated_at = excluded.updated_at
             RETURNING room_identifier, user_id, display_name, total_score, gift_count, chat_count, created_at, updated_at, avatar_url",
            params![
                delta.room_identifier,
                delta.user_id,
                delta.display_name,
                delta.score_delta,
                delta.gift_delta,
                delta.chat_delta,
                delta.avatar_url,
                now,
            ],
            |row| Ok(row_to_owned_values(row)),
        )
        .map_err(map_err)
        .and_then(|row| self.to_contribution(&row))
    }

    fn top_contributors(&self, room_identifier: &str, limit: usize) -> Result<Vec<UserContribution>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT room_identifier, user_id, display_name, total_score, gift_count, chat_count, created_at, updated_at, avatar_url
                 FROM user_contributions WHERE room_identifier = ?1 ORDER BY total_score DESC LIMIT ?2",
            )
            .map_err(map_err)?;
        let rows: Vec<OwnedRow> = stmt
            .query_map(params![room_identifier, limit as i64], |row| Ok(row_to_owned_values(row)))
            .map_err(map_err)?
            .collect::<Result<_, _>>()
            .map_err(map_err)?;
        rows.iter().map(|row| self.to_contribution(row)).collect()
    }

    fn append_snapshot(
        &self,
        room_identifier: &str,
        current_viewers: i64,
        cumulative_viewers: i64,
        total_income: i64,
        contributor_count: i64,
    ) -> Result<RoomStatsSnapshot, StorageError> {
        let conn = self.conn()?;
        let now = self.now_str();
        conn.query_row(
            "INSERT INTO room_stats_snapshots (room_identifier, current_viewers, cumulative_viewers, total_income, contributor_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             RETURNING id, room_identifier, current_viewers, cumulative_viewers, total_income, contributor_count, created_at",
            params![room_identifier, current_viewers, cumulative_viewers, total_income, contributor_count, now],
            |row| Ok(row_to_owned_values(row)),
        )
        .map_err(map_err)
        .and_then(|row| self.to_snapshot(&row))
    }

    fn append_system_event(
        &self,
        room_identifier: Option<&str>,
        kind: &str,
        message: Option<&str>,
    ) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let now = self.now_str();
        conn.execute(
            "INSERT INTO system_events (room_identifier, kind, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![room_identifier, kind, message, now],
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn system_events(
        &self,
        room_identifier: Option<&str>,
        kind: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SystemEvent>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, room_identifier, kind, message, created_at FROM system_events
                 WHERE (?1 IS NULL OR room_identifier = ?1) AND (?2 IS NULL OR kind = ?2)
                 ORDER BY created_at DESC LIMIT ?3",
            )
            .map_err(map_err)?;
        let rows: Vec<OwnedRow> = stmt
            .query_map(params![room_identifier, kind, limit as i64], |row| Ok(row_to_owned_values(row)))
            .map_err(map_err)?
            .collect::<Result<_, _>>()
            .map_err(map_err)?;
        rows.iter().map(|row| self.to_system_event(row)).collect()
    }

    fn purge_older_than(&self, cutoff: Timestamp) -> Result<PurgeCounts, StorageError> {
        let conn = self.conn()?;
        let cutoff_str = cutoff.to_rfc3339();
        let chat_events =
            conn.execute("DELETE FROM chat_events WHERE created_at < ?1", params![cutoff_str]).map_err(map_err)? as u64;
        let gift_events =
            conn.execute("DELETE FROM gift_events WHERE created_at < ?1", params![cutoff_str]).map_err(map_err)? as u64;
        let snapshots = conn
            .execute("DELETE FROM room_stats_snapshots WHERE created_at < ?1", params![cutoff_str])
            .map_err(map_err)? as u64;
        let system_events =
            conn.execute("DELETE FROM system_events WHERE created_at < ?1", params![cutoff_str]).map_err(map_err)? as u64;
        Ok(PurgeCounts { chat_events, gift_events, snapshots, system_events })
    }
}

/// A row captured as owned, dynamically-typed SQL values so it can outlive
/// the borrow of the connection used inside `query_row`'s closure — mapping
/// to a typed struct happens afterward via the `to_*` helpers above.
type OwnedRow = Vec<rusqlite::types::Value>;

fn row_to_owned_values(row: &rusqlite::Row<'_>) -> OwnedRow {
    let mut values = Vec::new();
    let mut i = 0;
    while let Ok(v) = row.get::<_, rusqlite::types::Value>(i) {
        values.push(v);
        i += 1;
    }
    values
}

impl SqliteGateway {
    fn to_chat(&self, row: &OwnedRow) -> Result<ChatEvent, StorageError> {
        Ok(ChatEvent {
            id: get_i64(row, 0)?,
            room_identifier: get_str(row, 1)?,
            session_id: get_i64_opt(row, 2)?,
            user_id: get_str(row, 3)?,
            user_name: get_str(row, 4)?,
            user_level: get_i64(row, 5)? as i32,
            text: get_str(row, 6)?,
            is_gift_user: get_i64(row, 7)? != 0,
            created_at: self.parse_ts(&get_str(row, 8)?)?,
        })
    }

    fn to_gift(&self, row: &OwnedRow) -> Result<GiftEvent, StorageError> {
        let send_mode = get_str(row, 11)?;
        Ok(GiftEvent {
            id: get_i64(row, 0)?,
            room_identifier: get_str(row, 1)?,
            session_id: get_i64_opt(row, 2)?,
            user_id: get_str(row, 3)?,
            user_name: get_str(row, 4)?,
            user_level: get_i64(row, 5)? as i32,
            gift_id: get_str(row, 6)?,
            gift_name: get_str(row, 7)?,
            count: get_i64(row, 8)?,
            unit_price: get_i64(row, 9)?,
            total_value: get_i64(row, 10)?,
            send_mode: SendMode::parse(&send_mode).ok_or_else(|| StorageError::Backend(format!("bad send_mode {send_mode:?}")))?,
            group_id: get_str_opt(row, 12)?,
            trace_id: get_str_opt(row, 13)?,
            created_at: self.parse_ts(&get_str(row, 14)?)?,
        })
    }

    fn to_contribution(&self, row: &OwnedRow) -> Result<UserContribution, StorageError> {
        Ok(UserContribution {
            room_identifier: get_str(row, 0)?,
            user_id: get_str(row, 1)?,
            display_name: get_str(row, 2)?,
            total_score: get_i64(row, 3)?,
            gift_count: get_i64(row, 4)?,
            chat_count: get_i64(row, 5)?,
            created_at: self.parse_ts(&get_str(row, 6)?)?,
            updated_at: self.parse_ts(&get_str(row, 7)?)?,
            avatar_url: get_str_opt(row, 8)?,
        })
    }

    fn to_snapshot(&self, row: &OwnedRow) -> Result<RoomStatsSnapshot, StorageError> {
        Ok(RoomStatsSnapshot {
            id: get_i64(row, 0)?,
            room_identifier: get_str(row, 1)?,
            current_viewers: get_i64(row, 2)?,
            cumulative_viewers: get_i64(row, 3)?,
            total_income: get_i64(row, 4)?,
            contributor_count: get_i64(row, 5)?,
            created_at: self.parse_ts(&get_str(row, 6)?)?,
        })
    }

    fn to_system_event(&self, row: &OwnedRow) -> Result<SystemEvent, StorageError> {
        Ok(SystemEvent {
            id: get_i64(row, 0)?,
            room_identifier: get_str_opt(row, 1)?,
            kind: get_str(row, 2)?,
            message: get_str_opt(row, 3)?,
            created_at: self.parse_ts(&get_str(row, 4)?)?,
        })
    }
}

fn get_i64(row: &OwnedRow, idx: usize) -> Result<i64, StorageError> {
    match row.get(idx) {
        Some(rusqlite::types::Value::Integer(v)) => Ok(*v),
        other => Err(StorageError::Backend(format!("column {idx}: expected integer, got {other:?}"))),
    }
}

fn get_i64_opt(row: &OwnedRow, idx: usize) -> Result<Option<i64>, StorageError> {
    match row.get(idx) {
        Some(rusqlite::types::Value::Integer(v)) => Ok(Some(*v)),
        Some(rusqlite::types::Value::Null) | None => Ok(None),
        other => Err(StorageError::Backend(format!("column {idx}: expected integer, got {other:?}"))),
    }
}

fn get_str(row: &OwnedRow, idx: usize) -> Result<String, StorageError> {
    match row.get(idx) {
        Some(rusqlite::types::Value::Text(v)) => Ok(v.clone()),
        other => Err(StorageError::Backend(format!("column {idx}: expected text, got {other:?}"))),
    }
}

fn get_str_opt(row: &OwnedRow, idx: usize) -> Result<Option<String>, StorageError> {
    match row.get(idx) {
        Some(rusqlite::types::Value::Text(v)) => Ok(Some(v.clone())),
        Some(rusqlite::types::Value::Null) | None => Ok(None),
        other => Err(StorageError::Backend(format!("column {idx}: expected text, got {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::domain::RoomFilter;

    fn gateway() -> SqliteGateway {
        SqliteGateway::open(":memory:", Arc::new(SystemClock::new(chrono_tz::Asia::Shanghai))).unwrap()
    }

    #[test]
    fn upsert_room_is_idempotent() {
        let gw = gateway();
        let a = gw.upsert_room("r1", MonitorMode::Manual, false).unwrap();
        let b = gw.upsert_room("r1", MonitorMode::Persistent, true).unwrap();
        assert_eq!(a.identifier, b.identifier);
        assert_eq!(b.mode, MonitorMode::Manual);
    }

    #[test]
    fn open_session_rejects_second_live_session() {
        let gw = gateway();
        gw.upsert_room("r1", MonitorMode::Manual, false).unwrap();
        gw.open_session("r1", None).unwrap();
        let err = gw.open_session("r1", None).unwrap_err();
        assert_eq!(err, StorageError::ConflictingOpenSession);
    }

    #[test]
    fn append_gift_rejects_duplicate_trace() {
        let gw = gateway();
        gw.upsert_room("r1", MonitorMode::Manual, false).unwrap();
        let new_gift = |trace: Option<&'static str>| NewGiftEvent {
            room_identifier: "r1",
            session_id: None,
            user_id: "u1",
            user_name: "Ann",
            user_level: 1,
            gift_id: "g1",
            gift_name: "Rose",
            count: 1,
            unit_price: 10,
            total_value: 10,
            send_mode: SendMode::Normal,
            group_id: None,
            trace_id: trace,
        };
        gw.append_gift(new_gift(Some("t1"))).unwrap();
        let err = gw.append_gift(new_gift(Some("t1"))).unwrap_err();
        assert_eq!(err, StorageError::DuplicateTrace);
        // A second gift with no trace_id at all is never considered a dup.
        gw.append_gift(new_gift(None)).unwrap();
        gw.append_gift(new_gift(None)).unwrap();
    }

    #[test]
    fn bump_session_is_additive() {
        let gw = gateway();
        gw.upsert_room("r1", MonitorMode::Manual, false).unwrap();
        let session = gw.open_session("r1", None).unwrap();
        gw.bump_session(session.id, 10, 1, 0).unwrap();
        gw.bump_session(session.id, 5, 0, 2).unwrap();
        let open = gw.current_open_session("r1").unwrap().unwrap();
        assert_eq!(open.total_income, 15);
        assert_eq!(open.total_gift_count, 1);
        assert_eq!(open.total_chat_count, 2);
    }

    #[test]
    fn end_session_is_idempotent() {
        let gw = gateway();
        gw.upsert_room("r1", MonitorMode::Manual, false).unwrap();
        let session = gw.open_session("r1", None).unwrap();
        gw.end_session(session.id, Some(5)).unwrap();
        gw.end_session(session.id, Some(50)).unwrap();
        let stats = gw.room_session_stats("r1").unwrap();
        assert!(stats.open_session.is_none());
    }

    #[test]
    fn record_contribution_upserts_additively() {
        let gw = gateway();
        gw.upsert_room("r1", MonitorMode::Manual, false).unwrap();
        gw.record_contribution(ContributionDelta {
            room_identifier: "r1",
            user_id: "u1",
            display_name: "Ann",
            score_delta: 10,
            gift_delta: 1,
            chat_delta: 0,
            avatar_url: None,
        })
        .unwrap();
        let contribution = gw
            .record_contribution(ContributionDelta {
                room_identifier: "r1",
                user_id: "u1",
                display_name: "Ann",
                score_delta: 5,
                gift_delta: 1,
                chat_delta: 2,
                avatar_url: Some("http://x/avatar.png"),
            })
            .unwrap();
        assert_eq!(contribution.total_score, 15);
        assert_eq!(contribution.gift_count, 2);
        assert_eq!(contribution.chat_count, 2);
        assert_eq!(contribution.avatar_url.as_deref(), Some("http://x/avatar.png"));
    }

    #[test]
    fn list_rooms_filters_by_mode() {
        let gw = gateway();
        gw.upsert_room("r1", MonitorMode::Manual, false).unwrap();
        gw.upsert_room("r2", MonitorMode::Persistent, true).unwrap();
        let persistent = gw.list_rooms(&RoomFilter { status: None, mode: Some(MonitorMode::Persistent) }).unwrap();
        assert_eq!(persistent.len(), 1);
        assert_eq!(persistent[0].identifier, "r2");
    }

    #[test]
    fn close_stale_sessions_uses_start_plus_threshold() {
        let gw = gateway();
        gw.upsert_room("r1", MonitorMode::Manual, false).unwrap();
        let session = gw.open_session("r1", None).unwrap();
        // Backdate the session's start_time by hand to simulate staleness.
        {
            let conn = gw.conn().unwrap();
            let old_start = (gw.clock.now() - chrono::Duration::hours(3)).to_rfc3339();
            conn.execute(
                "UPDATE live_sessions SET start_time = ?1 WHERE id = ?2",
                params![old_start, session.id],
            )
            .unwrap();
        }
        let closed = gw.close_stale_sessions(chrono::Duration::hours(2)).unwrap();
        assert_eq!(closed, 1);
        assert!(gw.current_open_session("r1").unwrap().is_none());
    }
}
