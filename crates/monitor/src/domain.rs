// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persisted entity types (§3). Plain data — all mutation happens through
//! [`crate::storage::StorageGateway`].

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

/// Monitor mode for a [`Room`] — whether the Scheduler should keep it alive
/// across restarts (`persistent`) or only run it while explicitly started
/// (`manual`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    Manual,
    Persistent,
}

impl MonitorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Persistent => "persistent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "persistent" => Some(Self::Persistent),
            _ => None,
        }
    }
}

/// Observed status of a [`Room`], as surfaced to dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Stopped,
    Monitoring,
    Offline,
    Waiting,
    Error,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Monitoring => "monitoring",
            Self::Offline => "offline",
            Self::Waiting => "waiting",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(Self::Stopped),
            "monitoring" => Some(Self::Monitoring),
            "offline" => Some(Self::Offline),
            "waiting" => Some(Self::Waiting),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Persistent descriptor of a watched stream (§3 Room).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub identifier: String,
    pub anchor_name: Option<String>,
    pub anchor_id: Option<String>,
    pub mode: MonitorMode,
    pub auto_reconnect: bool,
    pub status: RoomStatus,
    pub reconnect_count: u32,
    pub last_connect_at: Option<Timestamp>,
    pub last_disconnect_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Status of a [`LiveSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Live,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "live" => Some(Self::Live),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }
}

/// One contiguous broadcast episode of a room (§3 LiveSession).
///
/// `id` is a storage-internal surrogate key; per §9's per-key-duality fix,
/// rooms are addressed externally by `room_identifier` only — this id never
/// crosses the operator-command boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveSession {
    pub id: i64,
    pub room_identifier: String,
    pub start_time: Timestamp,
    pub end_time: Option<Timestamp>,
    pub status: SessionStatus,
    pub total_income: i64,
    pub total_gift_count: i64,
    pub total_chat_count: i64,
    pub peak_viewer_count: i64,
}

/// Send mode of a [`GiftEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendMode {
    Normal,
    Combo,
}

impl SendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Combo => "combo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "combo" => Some(Self::Combo),
            _ => None,
        }
    }
}

/// Immutable, append-only chat record (§3 ChatEvent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    pub id: i64,
    pub room_identifier: String,
    pub session_id: Option<i64>,
    pub user_id: String,
    pub user_name: String,
    pub user_level: i32,
    pub text: String,
    pub is_gift_user: bool,
    pub created_at: Timestamp,
}

/// Immutable, append-only gift record (§3 GiftEvent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GiftEvent {
    pub id: i64,
    pub room_identifier: String,
    pub session_id: Option<i64>,
    pub user_id: String,
    pub user_name: String,
    pub user_level: i32,
    pub gift_id: String,
    pub gift_name: String,
    pub count: i64,
    pub unit_price: i64,
    pub total_value: i64,
    pub send_mode: SendMode,
    pub group_id: Option<String>,
    pub trace_id: Option<String>,
    pub created_at: Timestamp,
}

/// Per-(room,user) cumulative ranking entry (§3 UserContribution).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContribution {
    pub room_identifier: String,
    pub user_id: String,
    pub display_name: String,
    pub total_score: i64,
    pub gift_count: i64,
    pub chat_count: i64,
    pub avatar_url: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Sampled instantaneous viewer/income counters (§3 RoomStatsSnapshot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomStatsSnapshot {
    pub id: i64,
    pub room_identifier: String,
    pub current_viewers: i64,
    pub cumulative_viewers: i64,
    pub total_income: i64,
    pub contributor_count: i64,
    pub created_at: Timestamp,
}

/// Operational audit log entry (§3 SystemEvent). Append-only, purgeable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: i64,
    pub room_identifier: Option<String>,
    pub kind: String,
    pub message: Option<String>,
    pub created_at: Timestamp,
}

/// A (room, user) contribution delta, as computed by the Processor and
/// applied atomically by the Gateway's `record_contribution`.
#[derive(Debug, Clone)]
pub struct ContributionDelta<'a> {
    pub room_identifier: &'a str,
    pub user_id: &'a str,
    pub display_name: &'a str,
    pub score_delta: i64,
    pub gift_delta: i64,
    pub chat_delta: i64,
    pub avatar_url: Option<&'a str>,
}

/// Filter for [`crate::storage::StorageGateway::list_rooms`].
#[derive(Debug, Clone, Default)]
pub struct RoomFilter {
    pub status: Option<RoomStatus>,
    pub mode: Option<MonitorMode>,
}
