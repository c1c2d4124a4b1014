// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event Processor (§4.3): the per-room ingestion pipeline. One instance per
//! Supervisor, owned exclusively by that Supervisor's task — no locks on the
//! hot path (§5, §9). Converts decoded [`crate::fetcher::FetcherEvent`]s into
//! persisted rows and aggregate deltas, and emits derived payloads to the
//! [`crate::bus::SubscriberBus`].
//!
//! The combo-merge algorithm (§4.3.2) is grounded line-for-line in
//! `examples/original_source/ws_handlers/handlers.py`'s `_handle_gift_message`
//! and `parse_formatted_number`; the bounded trace cache borrows the
//! teacher's `IndexMap`-backed LRU idiom from `upstream/prewarm.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::bus::{ContributionRow, RoomEvent, StatsPayload, SubscriberBus};
use crate::domain::{ContributionDelta, MonitorMode, RoomStatus, SendMode};
use crate::error::StorageError;
use crate::fetcher::{ChatPayload, GiftPayload};
use crate::storage::{NewChatEvent, NewGiftEvent, StorageGateway};

/// The two known "anonymous" sentinel raw user ids (§3, §9: applied
/// identically from both the chat and the gift ingestion paths).
const ANONYMOUS_SENTINELS: &[&str] = &["0", "111111"];

/// Canonicalizes a platform raw user id (§3, §9's uniform-canonicalization
/// resolution): anonymous sentinels become a synthetic `anon:<name>:<level>`
/// id; everything else passes through unchanged.
pub fn canonicalize_user_id(raw_id: &str, display_name: &str, level: i32) -> String {
    if ANONYMOUS_SENTINELS.contains(&raw_id) {
        format!("anon:{display_name}:{level}")
    } else {
        raw_id.to_owned()
    }
}

/// Parses a platform locale-formatted cumulative-viewer number (§4.3.3,
/// §8 property 6): a bare integer, or a real literal followed by exactly
/// `万` (×10⁴) or `亿` (×10⁸). Grounded on
/// `examples/original_source/ws_handlers/handlers.py::parse_formatted_number`.
pub fn parse_locale_number(raw: Option<&str>) -> i64 {
    let Some(raw) = raw else { return 0 };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0;
    }
    if let Some(num) = trimmed.strip_suffix('万') {
        return num.trim().parse::<f64>().map(|n| (n * 10_000.0) as i64).unwrap_or(0);
    }
    if let Some(num) = trimmed.strip_suffix('亿') {
        return num.trim().parse::<f64>().map(|n| (n * 100_000_000.0) as i64).unwrap_or(0);
    }
    trimmed.parse::<i64>().unwrap_or(0)
}

/// Per-combo-key running state (§4.3.2).
#[derive(Debug, Clone, Default)]
struct ComboState {
    last_combo_count: i64,
    persisted_gift_row_id: Option<i64>,
}

/// Running per-user contribution board entry, mirrored in memory alongside
/// the persisted `UserContribution` row (§4.3, §9: the in-memory board is a
/// read-through cache, the Gateway row is the source of truth).
#[derive(Debug, Clone)]
struct BoardEntry {
    display_name: String,
    cumulative_score: i64,
    gift_count: i64,
    avatar_url: Option<String>,
}

/// Bounded FIFO set of recently seen gift `trace_id`s (§4.3: capacity C,
/// soft-trim to C/2 on overflow). `IndexMap` gives O(1) insert/contains with
/// insertion-order iteration for the trim, matching the teacher's
/// `PrewarmCache` idiom in `upstream/prewarm.rs`.
struct TraceCache {
    seen: IndexMap<String, ()>,
    capacity: usize,
}

impl TraceCache {
    fn new(capacity: usize) -> Self {
        Self { seen: IndexMap::with_capacity(capacity.min(1024)), capacity }
    }

    /// Returns `true` if `trace_id` was already present (i.e. a duplicate).
    fn check_and_insert(&mut self, trace_id: &str) -> bool {
        if self.seen.contains_key(trace_id) {
            return true;
        }
        self.seen.insert(trace_id.to_owned(), ());
        if self.seen.len() > self.capacity {
            let target = self.capacity / 2;
            while self.seen.len() > target {
                self.seen.shift_remove_index(0);
            }
        }
        false
    }
}

/// Per-room ingestion pipeline (§4.3). Constructed fresh by the Supervisor at
/// Start and held for the lifetime of the room's monitoring run; combo state
/// and trace cache persist across reconnects within that run but not across
/// a full Supervisor restart (§9: "combo state lives per-stream").
pub struct EventProcessor {
    room_identifier: String,
    gateway: Arc<dyn StorageGateway>,
    bus: Arc<SubscriberBus>,
    top_contributors: usize,

    trace_cache: TraceCache,
    combo_state: HashMap<String, ComboState>,
    /// Dedup marker for non-combo-but-grouped gifts (§4.3.2 second bullet).
    grouped_seen: std::collections::HashSet<String>,
    board: HashMap<String, BoardEntry>,
    gift_users: std::collections::HashSet<String>,

    session_id: Option<i64>,
    anchor_name: Option<String>,
    current_viewers: i64,
    cumulative_viewers: i64,
    max_viewers: i64,
    total_income: i64,
}

/// A mirrored copy of a room's live rolling counters, exposed to the
/// Scheduler's periodic snapshot job (§4.6) without handing out the
/// Processor itself — the Processor's maps stay owned exclusively by the
/// Supervisor's task (§5).
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingStats {
    pub current_viewers: i64,
    pub cumulative_viewers: i64,
    pub total_income: i64,
    pub contributor_count: i64,
}

/// Outcome of bootstrapping a stream-open (§4.3.5), surfaced to the
/// Supervisor so it can classify a `ConflictingOpenSession` recovery.
pub struct BootstrapOutcome {
    pub session_id: i64,
    pub adopted_existing: bool,
}

impl EventProcessor {
    pub fn new(
        room_identifier: impl Into<String>,
        gateway: Arc<dyn StorageGateway>,
        bus: Arc<SubscriberBus>,
        trace_cache_capacity: usize,
        top_contributors: usize,
    ) -> Self {
        Self {
            room_identifier: room_identifier.into(),
            gateway,
            bus,
            top_contributors,
            trace_cache: TraceCache::new(trace_cache_capacity),
            combo_state: HashMap::new(),
            grouped_seen: std::collections::HashSet::new(),
            board: HashMap::new(),
            gift_users: std::collections::HashSet::new(),
            session_id: None,
            anchor_name: None,
            current_viewers: 0,
            cumulative_viewers: 0,
            max_viewers: 0,
            total_income: 0,
        }
    }

    pub fn session_id(&self) -> Option<i64> {
        self.session_id
    }

    pub fn rolling_stats(&self) -> RollingStats {
        RollingStats {
            current_viewers: self.current_viewers,
            cumulative_viewers: self.cumulative_viewers,
            total_income: self.total_income,
            contributor_count: self.board.len() as i64,
        }
    }

    /// §4.3.5: stream-open bootstrap. Adopts an existing `live` session
    /// (transient reconnect) or opens a fresh one (new stream). Per §7's
    /// `ConflictingOpenSession` note, a race against the janitor/a peer is
    /// handled by falling back to adopting whatever session now exists
    /// rather than erroring out.
    pub async fn on_open(
        &mut self,
        anchor_name: Option<String>,
        anchor_id: Option<String>,
    ) -> Result<BootstrapOutcome, StorageError> {
        self.anchor_name = anchor_name.clone();
        self.gateway.update_room_anchor(&self.room_identifier, anchor_name.as_deref(), anchor_id.as_deref())?;
        self.gateway.update_room_status(&self.room_identifier, RoomStatus::Monitoring, None)?;

        if let Some(existing) = self.gateway.current_open_session(&self.room_identifier)? {
            self.session_id = Some(existing.id);
            if self.board.is_empty() {
                self.warm_start_board().await?;
            }
            return Ok(BootstrapOutcome { session_id: existing.id, adopted_existing: true });
        }

        self.board.clear();
        self.gift_users.clear();
        self.max_viewers = 0;
        self.current_viewers = 0;
        self.total_income = 0;

        let session = match self.gateway.open_session(&self.room_identifier, self.anchor_name.as_deref()) {
            Ok(session) => session,
            Err(StorageError::ConflictingOpenSession) => self
                .gateway
                .current_open_session(&self.room_identifier)?
                .ok_or(StorageError::ConflictingOpenSession)?,
            Err(e) => return Err(e),
        };
        self.session_id = Some(session.id);
        Ok(BootstrapOutcome { session_id: session.id, adopted_existing: false })
    }

    async fn warm_start_board(&mut self) -> Result<(), StorageError> {
        let contributors = self.gateway.top_contributors(&self.room_identifier, 1000)?;
        for c in contributors {
            self.board.insert(
                c.user_id.clone(),
                BoardEntry {
                    display_name: c.display_name.clone(),
                    cumulative_score: c.total_score,
                    gift_count: c.gift_count,
                    avatar_url: c.avatar_url.clone(),
                },
            );
        }
        self.total_income = self.board.values().map(|b| b.cumulative_score).sum();
        Ok(())
    }

    /// §4.3.1: chat ingestion.
    pub async fn on_chat(&mut self, chat: ChatPayload) -> Result<(), StorageError> {
        let user_id = canonicalize_user_id(&chat.user_id, &chat.user_name, chat.user_level);
        let is_gift_user = self.gift_users.contains(&chat.user_name);

        let result = self.gateway.append_chat(NewChatEvent {
            room_identifier: &self.room_identifier,
            session_id: self.session_id,
            user_id: &user_id,
            user_name: &chat.user_name,
            user_level: chat.user_level,
            text: &chat.text,
            is_gift_user,
        });
        if let Err(e) = result {
            tracing::warn!(room = %self.room_identifier, err = %e, "storage write failure: append_chat");
        }

        if let Some(session_id) = self.session_id {
            if let Err(e) = self.gateway.bump_session(session_id, 0, 0, 1) {
                tracing::warn!(room = %self.room_identifier, err = %e, "storage write failure: bump_session (chat)");
            }
        }

        let entry = self.board.entry(user_id.clone()).or_insert_with(|| BoardEntry {
            display_name: chat.user_name.clone(),
            cumulative_score: 0,
            gift_count: 0,
            avatar_url: None,
        });
        entry.display_name = chat.user_name.clone();
        let _ = entry; // chat_count is tracked at the storage layer, not the board

        if let Err(e) = self.gateway.record_contribution(ContributionDelta {
            room_identifier: &self.room_identifier,
            user_id: &user_id,
            display_name: &chat.user_name,
            score_delta: 0,
            gift_delta: 0,
            chat_delta: 1,
            avatar_url: None,
        }) {
            tracing::warn!(room = %self.room_identifier, err = %e, "storage write failure: record_contribution (chat)");
        }

        self.bus
            .publish_event(
                &self.room_identifier,
                RoomEvent::Chat {
                    user_id,
                    user_name: chat.user_name,
                    text: chat.text,
                    is_gift_user,
                },
            )
            .await;
        Ok(())
    }

    /// §4.3.2: the gift ingestion algorithm. Returns `Ok(())` whether or not
    /// the event was dropped as a duplicate — duplicates are not errors.
    pub async fn on_gift(&mut self, gift: GiftPayload) -> Result<(), StorageError> {
        if let Some(trace_id) = gift.trace_id.as_deref() {
            if self.trace_cache.check_and_insert(trace_id) {
                tracing::debug!(room = %self.room_identifier, trace_id, "duplicate trace_id, dropping");
                return Ok(());
            }
        }

        let user_id = canonicalize_user_id(&gift.user_id, &gift.user_name, gift.user_level);

        enum Outcome {
            Dropped,
            Apply { count: i64, value: i64, combo_complete: bool },
        }

        let outcome = if let Some(group_id) = gift.group_id.as_deref() {
            let combo_key = format!("{group_id}\u{1}{}\u{1}{}", gift.user_id, gift.gift_id);

            if let Some(combo_count) = gift.combo_count {
                let existing_row_id = self.combo_state.get(&combo_key).map(|s| s.persisted_gift_row_id);
                let prior_count = self.combo_state.get(&combo_key).map(|s| s.last_combo_count).unwrap_or(0);

                if existing_row_id.is_some() && combo_count == prior_count {
                    // Repeated frame carries no new count, but `repeat_end`
                    // still closes the combo out of in-memory state (§4.3.2).
                    if gift.repeat_end {
                        self.combo_state.remove(&combo_key);
                    }
                    Outcome::Dropped
                } else {
                    let delta_combo = combo_count - prior_count;
                    let cumulative_count = combo_count * gift.group_count;
                    let cumulative_value = gift.unit_price * cumulative_count;
                    let delta_count = delta_combo * gift.group_count;
                    let delta_value = gift.unit_price * delta_count;

                    let row_id = match existing_row_id.flatten() {
                        None => {
                            let row = self.gateway.append_gift(NewGiftEvent {
                                room_identifier: &self.room_identifier,
                                session_id: self.session_id,
                                user_id: &user_id,
                                user_name: &gift.user_name,
                                user_level: gift.user_level,
                                gift_id: &gift.gift_id,
                                gift_name: &gift.gift_name,
                                count: cumulative_count,
                                unit_price: gift.unit_price,
                                total_value: cumulative_value,
                                send_mode: SendMode::Combo,
                                group_id: Some(group_id),
                                trace_id: gift.trace_id.as_deref(),
                            })?;
                            row.id
                        }
                        Some(row_id) => {
                            self.gateway.update_gift_totals(row_id, cumulative_count, cumulative_value)?;
                            row_id
                        }
                    };

                    let state = self.combo_state.entry(combo_key.clone()).or_default();
                    state.last_combo_count = combo_count;
                    state.persisted_gift_row_id = Some(row_id);

                    if gift.repeat_end {
                        self.combo_state.remove(&combo_key);
                    }

                    Outcome::Apply { count: delta_count, value: delta_value, combo_complete: gift.repeat_end }
                }
            } else {
                if self.grouped_seen.contains(&combo_key) {
                    Outcome::Dropped
                } else {
                    let count = gift.group_count;
                    let value = gift.unit_price * count;
                    self.gateway.append_gift(NewGiftEvent {
                        room_identifier: &self.room_identifier,
                        session_id: self.session_id,
                        user_id: &user_id,
                        user_name: &gift.user_name,
                        user_level: gift.user_level,
                        gift_id: &gift.gift_id,
                        gift_name: &gift.gift_name,
                        count,
                        unit_price: gift.unit_price,
                        total_value: value,
                        send_mode: SendMode::Normal,
                        group_id: Some(group_id),
                        trace_id: gift.trace_id.as_deref(),
                    })?;
                    self.grouped_seen.insert(combo_key.clone());
                    if gift.repeat_end {
                        self.grouped_seen.remove(&combo_key);
                    }
                    Outcome::Apply { count, value, combo_complete: gift.repeat_end }
                }
            }
        } else {
            let count = gift.group_count;
            let value = gift.unit_price * count;
            self.gateway.append_gift(NewGiftEvent {
                room_identifier: &self.room_identifier,
                session_id: self.session_id,
                user_id: &user_id,
                user_name: &gift.user_name,
                user_level: gift.user_level,
                gift_id: &gift.gift_id,
                gift_name: &gift.gift_name,
                count,
                unit_price: gift.unit_price,
                total_value: value,
                send_mode: SendMode::Normal,
                group_id: None,
                trace_id: gift.trace_id.as_deref(),
            })?;
            Outcome::Apply { count, value, combo_complete: false }
        };

        let (delta_count, delta_value, combo_complete) = match outcome {
            Outcome::Dropped => return Ok(()),
            Outcome::Apply { count, value, combo_complete } => (count, value, combo_complete),
        };

        self.gift_users.insert(gift.user_name.clone());

        if let Some(session_id) = self.session_id {
            if let Err(e) = self.gateway.bump_session(session_id, delta_value, delta_count, 0) {
                tracing::warn!(room = %self.room_identifier, err = %e, "storage write failure: bump_session (gift)");
            }
        }

        if let Err(e) = self.gateway.record_contribution(ContributionDelta {
            room_identifier: &self.room_identifier,
            user_id: &user_id,
            display_name: &gift.user_name,
            score_delta: delta_value,
            gift_delta: delta_count,
            chat_delta: 0,
            avatar_url: None,
        }) {
            tracing::warn!(room = %self.room_identifier, err = %e, "storage write failure: record_contribution (gift)");
        }

        let entry = self.board.entry(user_id.clone()).or_insert_with(|| BoardEntry {
            display_name: gift.user_name.clone(),
            cumulative_score: 0,
            gift_count: 0,
            avatar_url: None,
        });
        entry.display_name = gift.user_name.clone();
        entry.cumulative_score += delta_value;
        entry.gift_count += delta_count;
        self.total_income += delta_value;

        self.bus
            .publish_event(
                &self.room_identifier,
                RoomEvent::Gift {
                    user_id,
                    user_name: gift.user_name,
                    gift_name: gift.gift_name,
                    delta_count,
                    delta_value,
                    combo_complete,
                },
            )
            .await;
        Ok(())
    }

    /// §4.3.3: viewer sequence ingestion.
    pub async fn on_viewer_seq(&mut self, current: i64, cumulative_raw: &str) -> Result<(), StorageError> {
        self.current_viewers = current;
        if current > self.max_viewers {
            self.max_viewers = current;
            if let Some(session_id) = self.session_id {
                if let Err(e) = self.gateway.update_session_peak(session_id, self.max_viewers) {
                    tracing::warn!(room = %self.room_identifier, err = %e, "storage write failure: update_session_peak");
                }
            }
        }
        self.cumulative_viewers = parse_locale_number(Some(cumulative_raw));

        self.bus.publish_stats(&self.room_identifier, self.stats_payload(false)).await;
        Ok(())
    }

    /// §4.3.4: control ingestion (`stream_ended`). Closes the session and
    /// publishes a final stats snapshot; the Supervisor drives the actual
    /// state transition once this returns.
    pub async fn on_stream_ended(&mut self) -> Result<(), StorageError> {
        if let Some(session_id) = self.session_id {
            self.gateway.end_session(session_id, Some(self.max_viewers))?;
            self.bus.publish_stats(&self.room_identifier, self.stats_payload(true)).await;
            self.bus.publish_event(&self.room_identifier, RoomEvent::SessionEnded { session_id }).await;
        }
        self.session_id = None;
        Ok(())
    }

    fn stats_payload(&self, session_ended: bool) -> StatsPayload {
        let mut top: Vec<&BoardEntry> = self.board.values().collect();
        top.sort_by(|a, b| b.cumulative_score.cmp(&a.cumulative_score));
        let top_contributors = top
            .into_iter()
            .take(self.top_contributors)
            .enumerate()
            .map(|(_, b)| ContributionRow {
                user_id: String::new(),
                display_name: b.display_name.clone(),
                score: b.cumulative_score,
            })
            .collect();

        StatsPayload {
            current_viewers: self.current_viewers,
            cumulative_viewers: self.cumulative_viewers,
            total_income: self.total_income,
            contributor_count: self.board.len() as i64,
            top_contributors,
            session_ended,
        }
    }
}

/// Whether a room's mode/auto-reconnect combination qualifies it for
/// offline-polling rather than termination (§4.4 `Probing -> Offline-Polling`).
pub fn polls_when_offline(mode: MonitorMode, auto_reconnect: bool) -> bool {
    mode == MonitorMode::Persistent && auto_reconnect
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_passes_through_normal_ids() {
        assert_eq!(canonicalize_user_id("user123", "Ann", 5), "user123");
    }

    #[test]
    fn canonicalize_remaps_anonymous_sentinels() {
        assert_eq!(canonicalize_user_id("0", "Ann", 5), "anon:Ann:5");
        assert_eq!(canonicalize_user_id("111111", "Bob", 2), "anon:Bob:2");
    }

    #[test]
    fn locale_number_bare_integer() {
        assert_eq!(parse_locale_number(Some("123")), 123);
    }

    #[test]
    fn locale_number_wan_multiplier() {
        assert_eq!(parse_locale_number(Some("46.8万")), 468_000);
    }

    #[test]
    fn locale_number_yi_multiplier() {
        assert_eq!(parse_locale_number(Some("1.2亿")), 120_000_000);
    }

    #[test]
    fn locale_number_empty_and_none() {
        assert_eq!(parse_locale_number(Some("")), 0);
        assert_eq!(parse_locale_number(None), 0);
    }

    #[test]
    fn trace_cache_dedups_and_trims() {
        let mut cache = TraceCache::new(4);
        assert!(!cache.check_and_insert("a"));
        assert!(cache.check_and_insert("a"));
        assert!(!cache.check_and_insert("b"));
        assert!(!cache.check_and_insert("c"));
        assert!(!cache.check_and_insert("d"));
        // Overflow: len=5 > capacity=4, trims to capacity/2=2.
        assert!(!cache.check_and_insert("e"));
        assert!(cache.seen.len() <= 4);
        // The oldest entries ("a", "b", "c") should have been evicted.
        assert!(!cache.seen.contains_key("a"));
    }

    #[test]
    fn polls_when_offline_requires_persistent_and_auto() {
        assert!(polls_when_offline(MonitorMode::Persistent, true));
        assert!(!polls_when_offline(MonitorMode::Persistent, false));
        assert!(!polls_when_offline(MonitorMode::Manual, true));
    }
}
