// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscriber Bus (§4.7): topic-addressed, fire-and-forget fan-out to
//! connected dashboard clients. One `room:<id>` broadcast channel for live
//! events, one `room:<id>:stats` channel for snapshots, plus a shared cache
//! of the last-known payload per room so a late joiner's replay doesn't
//! require going back to the Gateway (mirrors the teacher's
//! `Aggregator`/cache pairing in `events.rs`, generalized from one flat
//! aggregator to one entry per room).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::domain::UserContribution;

const ROOM_CHANNEL_CAPACITY: usize = 256;
const STATS_CHANNEL_CAPACITY: usize = 64;

/// A live-event payload published to `room:<id>` (§4.3.1, §4.3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomEvent {
    Chat { user_id: String, user_name: String, text: String, is_gift_user: bool },
    Gift {
        user_id: String,
        user_name: String,
        gift_name: String,
        delta_count: i64,
        delta_value: i64,
        combo_complete: bool,
    },
    SessionEnded { session_id: i64 },
}

/// A contribution board row, as surfaced in a stats snapshot payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionRow {
    pub user_id: String,
    pub display_name: String,
    pub score: i64,
}

impl From<&UserContribution> for ContributionRow {
    fn from(c: &UserContribution) -> Self {
        Self { user_id: c.user_id.clone(), display_name: c.display_name.clone(), score: c.total_score }
    }
}

/// A consolidated stats snapshot published to `room:<id>:stats` (§4.3.3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatsPayload {
    pub current_viewers: i64,
    pub cumulative_viewers: i64,
    pub total_income: i64,
    pub contributor_count: i64,
    pub top_contributors: Vec<ContributionRow>,
    pub session_ended: bool,
}

struct RoomTopic {
    room_tx: broadcast::Sender<RoomEvent>,
    stats_tx: broadcast::Sender<StatsPayload>,
    last_stats: Option<StatsPayload>,
}

impl RoomTopic {
    fn new() -> Self {
        let (room_tx, _) = broadcast::channel(ROOM_CHANNEL_CAPACITY);
        let (stats_tx, _) = broadcast::channel(STATS_CHANNEL_CAPACITY);
        Self { room_tx, stats_tx, last_stats: None }
    }
}

/// Topic-addressed publish/subscribe hub, one entry per watched room.
///
/// Publish never blocks the Processor (§5): `broadcast::Sender::send` returns
/// immediately and silently drops the payload for subscribers that are too
/// slow to keep up — acceptable per §4.7 because every published fact is
/// also durable in storage.
pub struct SubscriberBus {
    topics: RwLock<HashMap<String, RoomTopic>>,
}

impl SubscriberBus {
    pub fn new() -> Self {
        Self { topics: RwLock::new(HashMap::new()) }
    }

    /// Publish a live event to `room:<id>`. Fire-and-forget.
    pub async fn publish_event(&self, room_identifier: &str, event: RoomEvent) {
        let mut topics = self.topics.write().await;
        let topic = topics.entry(room_identifier.to_owned()).or_insert_with(RoomTopic::new);
        let _ = topic.room_tx.send(event);
    }

    /// Publish a stats snapshot to `room:<id>:stats`, caching it for replay.
    pub async fn publish_stats(&self, room_identifier: &str, stats: StatsPayload) {
        let mut topics = self.topics.write().await;
        let topic = topics.entry(room_identifier.to_owned()).or_insert_with(RoomTopic::new);
        topic.last_stats = Some(stats.clone());
        let _ = topic.stats_tx.send(stats);
    }

    /// Subscribe to `room:<id>` live events.
    pub async fn subscribe_room(&self, room_identifier: &str) -> broadcast::Receiver<RoomEvent> {
        let mut topics = self.topics.write().await;
        topics.entry(room_identifier.to_owned()).or_insert_with(RoomTopic::new).room_tx.subscribe()
    }

    /// Subscribe to `room:<id>:stats`, replaying the last-known snapshot once
    /// if one exists (§4.7: "current running snapshot is replayed once").
    pub async fn subscribe_stats(
        &self,
        room_identifier: &str,
    ) -> (broadcast::Receiver<StatsPayload>, Option<StatsPayload>) {
        let mut topics = self.topics.write().await;
        let topic = topics.entry(room_identifier.to_owned()).or_insert_with(RoomTopic::new);
        (topic.stats_tx.subscribe(), topic.last_stats.clone())
    }

    /// Drop a room's topic entirely (e.g. on `RemoveRoom`).
    pub async fn remove_topic(&self, room_identifier: &str) {
        self.topics.write().await.remove(room_identifier);
    }
}

impl Default for SubscriberBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscriber_does_not_block() {
        let bus = SubscriberBus::new();
        bus.publish_event(
            "r1",
            RoomEvent::Chat {
                user_id: "u1".into(),
                user_name: "Ann".into(),
                text: "hi".into(),
                is_gift_user: false,
            },
        )
        .await;
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = SubscriberBus::new();
        let mut rx = bus.subscribe_room("r1").await;
        bus.publish_event(
            "r1",
            RoomEvent::Chat {
                user_id: "u1".into(),
                user_name: "Ann".into(),
                text: "hi".into(),
                is_gift_user: false,
            },
        )
        .await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, RoomEvent::Chat { user_id, .. } if user_id == "u1"));
    }

    #[tokio::test]
    async fn stats_replay_on_join_returns_last_snapshot() {
        let bus = SubscriberBus::new();
        bus.publish_stats(
            "r1",
            StatsPayload { current_viewers: 5, total_income: 20, ..Default::default() },
        )
        .await;
        let (_, replay) = bus.subscribe_stats("r1").await;
        let replay = replay.expect("replay snapshot");
        assert_eq!(replay.current_viewers, 5);
        assert_eq!(replay.total_income, 20);
    }

    #[tokio::test]
    async fn stats_replay_on_first_join_is_none() {
        let bus = SubscriberBus::new();
        let (_, replay) = bus.subscribe_stats("r1").await;
        assert!(replay.is_none());
    }

    #[tokio::test]
    async fn rooms_are_isolated_topics() {
        let bus = SubscriberBus::new();
        let mut rx_r2 = bus.subscribe_room("r2").await;
        bus.publish_event(
            "r1",
            RoomEvent::SessionEnded { session_id: 1 },
        )
        .await;
        assert!(rx_r2.try_recv().is_err());
    }
}
