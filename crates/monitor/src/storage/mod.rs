// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Storage Gateway (§4.1): a narrow, strictly typed persistence interface.
//! Every operation here is synchronous from the caller's perspective and
//! atomic with respect to the single row/entity it touches. The core
//! programs against this trait, not a concrete database client — §4.1a names
//! the one implementation this crate ships, [`sqlite::SqliteGateway`].

pub mod sqlite;

use crate::clock::Timestamp;
use crate::domain::{
    ChatEvent, ContributionDelta, GiftEvent, LiveSession, Room, RoomFilter, RoomStatsSnapshot,
    RoomStatus, SystemEvent, UserContribution,
};
use crate::error::StorageError;

/// A not-yet-persisted chat row, as produced by the Processor (§4.3.1).
#[derive(Debug, Clone)]
pub struct NewChatEvent<'a> {
    pub room_identifier: &'a str,
    pub session_id: Option<i64>,
    pub user_id: &'a str,
    pub user_name: &'a str,
    pub user_level: i32,
    pub text: &'a str,
    pub is_gift_user: bool,
}

/// A not-yet-persisted gift row, as produced by the Processor (§4.3.2).
#[derive(Debug, Clone)]
pub struct NewGiftEvent<'a> {
    pub room_identifier: &'a str,
    pub session_id: Option<i64>,
    pub user_id: &'a str,
    pub user_name: &'a str,
    pub user_level: i32,
    pub gift_id: &'a str,
    pub gift_name: &'a str,
    pub count: i64,
    pub unit_price: i64,
    pub total_value: i64,
    pub send_mode: crate::domain::SendMode,
    pub group_id: Option<&'a str>,
    pub trace_id: Option<&'a str>,
}

/// A single row of the merged chat/gift history page (§3a `recent_events`).
#[derive(Debug, Clone)]
pub enum HistoryEvent {
    Chat(ChatEvent),
    Gift(GiftEvent),
}

impl HistoryEvent {
    pub fn created_at(&self) -> Timestamp {
        match self {
            Self::Chat(c) => c.created_at,
            Self::Gift(g) => g.created_at,
        }
    }
}

/// A single room's live-session snapshot (§3a `room_session_stats`).
#[derive(Debug, Clone)]
pub struct RoomSessionStats {
    pub room_identifier: String,
    pub open_session: Option<LiveSession>,
    pub lifetime_session_count: u64,
}

/// Totals across all of a room's sessions (§3a `aggregated_session_stats`).
#[derive(Debug, Clone, Default)]
pub struct AggregatedSessionStats {
    pub session_count: u64,
    pub total_income: i64,
    pub total_gift_count: i64,
    pub total_chat_count: i64,
    pub peak_viewer_count: i64,
}

/// Row counts removed by a `purge_older_than` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct PurgeCounts {
    pub chat_events: u64,
    pub gift_events: u64,
    pub snapshots: u64,
    pub system_events: u64,
}

/// The Storage Gateway contract (§4.1). Implementors MUST NOT retry on write
/// failure — the error is surfaced to the caller, which decides recovery.
pub trait StorageGateway: Send + Sync {
    // -- Room ----------------------------------------------------------

    /// Returns the existing Room if present; never duplicates.
    fn upsert_room(
        &self,
        identifier: &str,
        mode: crate::domain::MonitorMode,
        auto_reconnect: bool,
    ) -> Result<Room, StorageError>;

    fn get_room(&self, identifier: &str) -> Result<Option<Room>, StorageError>;

    /// Idempotent write of the room's observed status and optional error text.
    fn update_room_status(
        &self,
        identifier: &str,
        status: RoomStatus,
        error: Option<&str>,
    ) -> Result<(), StorageError>;

    fn update_room_anchor(
        &self,
        identifier: &str,
        anchor_name: Option<&str>,
        anchor_id: Option<&str>,
    ) -> Result<(), StorageError>;

    fn update_room_config(
        &self,
        identifier: &str,
        mode: Option<crate::domain::MonitorMode>,
        auto_reconnect: Option<bool>,
    ) -> Result<(), StorageError>;

    /// Stamps `last_connect_at = now`. Does not touch the reconnect counter —
    /// that only resets on a clean session end or poll-detected-live, per
    /// §4.4; a flapping reconnect loop must keep accumulating it.
    fn record_connect(&self, identifier: &str) -> Result<(), StorageError>;

    /// Resets the reconnect counter to 0, independent of `record_connect`.
    fn reset_reconnect_count(&self, identifier: &str) -> Result<(), StorageError>;

    /// Stamps `last_disconnect_at = now` and increments the reconnect
    /// counter, returning the new value.
    fn record_disconnect(&self, identifier: &str) -> Result<u32, StorageError>;

    fn delete_room(&self, identifier: &str) -> Result<(), StorageError>;

    fn list_rooms(&self, filter: &RoomFilter) -> Result<Vec<Room>, StorageError>;

    fn list_persistent_rooms(&self) -> Result<Vec<Room>, StorageError>;

    // -- Session ---------------------------------------------------------

    /// Creates a new `live` session. Fails with `ConflictingOpenSession` if
    /// one already exists for the room.
    fn open_session(
        &self,
        room_identifier: &str,
        anchor_name: Option<&str>,
    ) -> Result<LiveSession, StorageError>;

    fn current_open_session(
        &self,
        room_identifier: &str,
    ) -> Result<Option<LiveSession>, StorageError>;

    /// Sets `status=ended`, `end_time=now`; idempotent (no-op on an already
    /// ended session). `peak_viewers`, if given, is folded in as
    /// `max(existing, new)`.
    fn end_session(&self, session_id: i64, peak_viewers: Option<i64>) -> Result<(), StorageError>;

    /// Atomic additive update — a single arithmetic UPDATE, never
    /// read-modify-write (§5).
    fn bump_session(
        &self,
        session_id: i64,
        delta_income: i64,
        delta_gifts: i64,
        delta_chats: i64,
    ) -> Result<(), StorageError>;

    fn update_session_peak(&self, session_id: i64, peak_viewers: i64) -> Result<(), StorageError>;

    /// For every `live` session older than `threshold`, sets `ended` with a
    /// synthesized end time; returns the count closed. Called by the Manager
    /// at start-up (§4.5, S5).
    fn close_stale_sessions(&self, threshold: chrono::Duration) -> Result<u64, StorageError>;

    fn room_session_stats(&self, room_identifier: &str) -> Result<RoomSessionStats, StorageError>;

    fn aggregated_session_stats(
        &self,
        room_identifier: &str,
        limit: Option<usize>,
    ) -> Result<AggregatedSessionStats, StorageError>;

    // -- Events ------------------------------------------------------------

    /// Gifts with a `trace_id` MUST reject duplicates with `DuplicateTrace`.
    fn append_chat(&self, event: NewChatEvent<'_>) -> Result<ChatEvent, StorageError>;

    fn append_gift(&self, event: NewGiftEvent<'_>) -> Result<GiftEvent, StorageError>;

    /// Collapses combo progress into a single row (§4.3.2).
    fn update_gift_totals(
        &self,
        gift_row_id: i64,
        new_count: i64,
        new_total_value: i64,
    ) -> Result<(), StorageError>;

    fn recent_events(
        &self,
        room_identifier: &str,
        since: Option<Timestamp>,
        limit: usize,
    ) -> Result<Vec<HistoryEvent>, StorageError>;

    // -- Contribution board --------------------------------------------------

    /// Upsert with add semantics (§3): adds the deltas to any existing row,
    /// or creates one seeded with them.
    fn record_contribution(
        &self,
        delta: ContributionDelta<'_>,
    ) -> Result<UserContribution, StorageError>;

    fn top_contributors(
        &self,
        room_identifier: &str,
        limit: usize,
    ) -> Result<Vec<UserContribution>, StorageError>;

    // -- Snapshots & audit log -----------------------------------------------

    fn append_snapshot(
        &self,
        room_identifier: &str,
        current_viewers: i64,
        cumulative_viewers: i64,
        total_income: i64,
        contributor_count: i64,
    ) -> Result<RoomStatsSnapshot, StorageError>;

    fn append_system_event(
        &self,
        room_identifier: Option<&str>,
        kind: &str,
        message: Option<&str>,
    ) -> Result<(), StorageError>;

    fn system_events(
        &self,
        room_identifier: Option<&str>,
        kind: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SystemEvent>, StorageError>;

    // -- Retention -----------------------------------------------------------

    /// Bulk delete of chats, gifts, snapshots, and system events older than
    /// `cutoff`.
    fn purge_older_than(&self, cutoff: Timestamp) -> Result<PurgeCounts, StorageError>;
}
