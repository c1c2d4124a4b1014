// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy (§7). Hand-written enums per subsystem, not `thiserror` —
//! matching this codebase's existing style. `anyhow` is reserved for
//! composing fallible calls at the binary/integration boundary.

use std::fmt;

/// Errors surfaced by [`crate::storage::StorageGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// `open_session` called while a `live` session already exists for the room.
    ConflictingOpenSession,
    /// `append_gift` called with a `trace_id` already present on another row.
    DuplicateTrace,
    /// The referenced room/session/entity does not exist.
    NotFound,
    /// The backend rejected the write (disk full, corruption, constraint
    /// violation other than the two above).
    Backend(String),
}

impl StorageError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConflictingOpenSession => "CONFLICTING_OPEN_SESSION",
            Self::DuplicateTrace => "DUPLICATE_TRACE",
            Self::NotFound => "NOT_FOUND",
            Self::Backend(_) => "STORAGE_WRITE_FAILURE",
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(msg) => write!(f, "{}: {msg}", self.as_str()),
            _ => f.write_str(self.as_str()),
        }
    }
}

impl std::error::Error for StorageError {}

/// Errors surfaced by a [`crate::fetcher::Fetcher`], as classified by the
/// Supervisor (§7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network drop, 502/gateway error, idle close. Drives `Backoff`.
    TransientTransport(String),
    /// Authentication/signature rejection, repeated parse failure. Drives
    /// `Terminated` with room status `error` once retries are exhausted.
    FatalTransport(String),
    /// Probe or control message indicates the stream ended.
    NotBroadcasting,
}

impl FetchError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientTransport(_) => "TRANSIENT_TRANSPORT",
            Self::FatalTransport(_) => "FATAL_TRANSPORT",
            Self::NotBroadcasting => "NOT_BROADCASTING",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientTransport(_))
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientTransport(msg) | Self::FatalTransport(msg) => {
                write!(f, "{}: {msg}", self.as_str())
            }
            Self::NotBroadcasting => f.write_str(self.as_str()),
        }
    }
}

impl std::error::Error for FetchError {}

/// Errors surfaced by the Room Manager in response to operator commands (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerError {
    /// `AddRoom`/`start` on a room that already has a running Supervisor.
    AlreadyActive,
    /// Operator command referenced a room identifier with no persisted Room.
    RoomNotFound,
    /// `StopRoom` on a room with no running Supervisor (soft error).
    NotActive,
    /// `UpdateRoomConfig` with a mode outside `{manual, persistent}`.
    InvalidMode,
}

impl ManagerError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyActive => "ALREADY_ACTIVE",
            Self::RoomNotFound => "ROOM_NOT_FOUND",
            Self::NotActive => "NOT_ACTIVE",
            Self::InvalidMode => "INVALID_MODE",
        }
    }
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ManagerError {}
