// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fetcher capability (§4.2): the external, platform-specific collaborator
//! the Supervisor drives. Per §9's callback→channel redesign note, the
//! callback list of the distilled spec (`on_open`/`on_chat`/.../`on_error`)
//! is realized here as a single `mpsc::Sender<FetcherEvent>` the Fetcher
//! pushes decoded events into, plus a `CancellationToken` it observes to
//! unwind `open_stream` promptly. One event ordering, one termination
//! signal, and the Processor gets a single `recv().await` loop as its one
//! consumer.
//!
//! The trait is written by hand with boxed futures rather than pulled in
//! via an `async_trait`-style macro (this codebase doesn't carry that
//! dependency outside of generated gRPC code) so that `Arc<dyn Fetcher>`
//! stays object-safe.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of a one-shot `probe_live` call.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    pub is_live: bool,
    pub anchor_name: Option<String>,
    pub anchor_id: Option<String>,
}

/// A decoded chat message, as delivered by the platform wire protocol.
#[derive(Debug, Clone)]
pub struct ChatPayload {
    pub user_id: String,
    pub user_name: String,
    pub user_level: i32,
    pub text: String,
}

/// A decoded gift message (§4.3.2 — the three wire shapes all arrive through
/// this one payload; `group_id`/`combo_count` presence selects the path).
#[derive(Debug, Clone)]
pub struct GiftPayload {
    pub user_id: String,
    pub user_name: String,
    pub user_level: i32,
    pub gift_id: String,
    pub gift_name: String,
    /// Per-combo unit multiplier (§4.3.2 `group_count`); 1 for a plain
    /// single-gift send.
    pub group_count: i64,
    pub unit_price: i64,
    /// Present only on combo-typed messages.
    pub combo_count: Option<i64>,
    /// Present on combo-typed and grouped-but-not-combo messages.
    pub group_id: Option<String>,
    /// Globally unique wire identifier, used for cross-delivery dedup.
    pub trace_id: Option<String>,
    /// Wire signal that this combo/group has finished.
    pub repeat_end: bool,
}

/// A decoded lifecycle control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlKind {
    StreamEnded,
    Other(String),
}

/// One decoded event pushed by a `Fetcher` into the Processor's channel.
#[derive(Debug, Clone)]
pub enum FetcherEvent {
    Open { anchor_name: Option<String>, anchor_id: Option<String> },
    Chat(ChatPayload),
    Gift(GiftPayload),
    ViewerSeq { current: i64, cumulative_raw: String },
    Control(ControlKind),
    Close(String),
    Error(FetchError),
}

/// The Supervisor's sole dependency on the outside world (§4.2).
///
/// Protocol-layer detail — signatures, framing, decoding, heartbeat cadence —
/// is wholly the Fetcher's concern. The core only requires that `open_stream`
/// is cooperatively cancellable and that events arrive in wire order.
pub trait Fetcher: Send + Sync {
    /// One-shot probe, independent of `open_stream`.
    fn probe_live<'a>(&'a self, room_identifier: &'a str) -> BoxFuture<'a, Result<ProbeResult, FetchError>>;

    /// Opens the push subscription and blocks until the stream terminates
    /// (remote close, fatal error, or `stop()`). Decoded events are pushed
    /// into `events` as they arrive; this method itself resolves only once
    /// the stream is fully torn down.
    fn open_stream<'a>(
        &'a self,
        room_identifier: &'a str,
        events: mpsc::Sender<FetcherEvent>,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<(), FetchError>>;

    /// Requests termination of an active stream. Safe to call from another
    /// task; idempotent.
    fn stop(&self);
}

/// Builds a fresh `Fetcher` for a given room. The Core holds one factory and
/// the Manager/Supervisor construct a per-room `Fetcher` from it at Start.
pub trait FetcherFactory: Send + Sync {
    fn create(&self, room_identifier: &str) -> Arc<dyn Fetcher>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod scripted {
    //! A scriptable in-memory `Fetcher` test double (§1a/§4.2): replays a
    //! fixed sequence of `FetcherEvent`s and simulated probe results. Not a
    //! real platform client — building one is out of scope per §1.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// One scripted probe outcome, consumed in order by successive
    /// `probe_live` calls. The last entry repeats once exhausted.
    #[derive(Debug, Clone)]
    pub struct ScriptedProbe {
        pub is_live: bool,
        pub anchor_name: Option<String>,
        pub anchor_id: Option<String>,
    }

    pub struct ScriptedFetcher {
        probes: Mutex<VecDeque<ScriptedProbe>>,
        last_probe: Mutex<ScriptedProbe>,
        stream: Mutex<VecDeque<FetcherEvent>>,
        stopped: AtomicBool,
        /// If set, `open_stream` returns this error immediately instead of
        /// draining `stream` — used to script transport failures.
        open_error: Mutex<Option<FetchError>>,
    }

    impl ScriptedFetcher {
        pub fn new() -> Self {
            Self {
                probes: Mutex::new(VecDeque::new()),
                last_probe: Mutex::new(ScriptedProbe { is_live: false, anchor_name: None, anchor_id: None }),
                stream: Mutex::new(VecDeque::new()),
                stopped: AtomicBool::new(false),
                open_error: Mutex::new(None),
            }
        }

        pub fn push_probe(&self, probe: ScriptedProbe) {
            self.probes.lock().unwrap_or_else(|e| e.into_inner()).push_back(probe);
        }

        pub fn push_event(&self, event: FetcherEvent) {
            self.stream.lock().unwrap_or_else(|e| e.into_inner()).push_back(event);
        }

        pub fn push_events(&self, events: impl IntoIterator<Item = FetcherEvent>) {
            let mut guard = self.stream.lock().unwrap_or_else(|e| e.into_inner());
            guard.extend(events);
        }

        pub fn fail_next_open(&self, err: FetchError) {
            *self.open_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
        }

        pub fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    impl Default for ScriptedFetcher {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Fetcher for ScriptedFetcher {
        fn probe_live<'a>(&'a self, _room_identifier: &'a str) -> BoxFuture<'a, Result<ProbeResult, FetchError>> {
            Box::pin(async move {
                let mut probes = self.probes.lock().unwrap_or_else(|e| e.into_inner());
                let probe = probes.pop_front().unwrap_or_else(|| {
                    self.last_probe.lock().unwrap_or_else(|e| e.into_inner()).clone()
                });
                *self.last_probe.lock().unwrap_or_else(|e| e.into_inner()) = probe.clone();
                Ok(ProbeResult {
                    is_live: probe.is_live,
                    anchor_name: probe.anchor_name,
                    anchor_id: probe.anchor_id,
                })
            })
        }

        fn open_stream<'a>(
            &'a self,
            _room_identifier: &'a str,
            events: mpsc::Sender<FetcherEvent>,
            cancel: CancellationToken,
        ) -> BoxFuture<'a, Result<(), FetchError>> {
            Box::pin(async move {
                self.stopped.store(false, Ordering::SeqCst);

                if let Some(err) = self.open_error.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    return Err(err);
                }

                let script: Vec<FetcherEvent> =
                    self.stream.lock().unwrap_or_else(|e| e.into_inner()).drain(..).collect();

                for event in script {
                    if cancel.is_cancelled() || self.stopped.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    if events.send(event).await.is_err() {
                        return Ok(());
                    }
                    // Yield so the Processor's consumer task gets a chance to
                    // run between events, matching real wire delivery.
                    tokio::task::yield_now().await;
                }

                tokio::select! {
                    _ = cancel.cancelled() => {}
                    () = wait_for_stop(&self.stopped) => {}
                }
                Ok(())
            })
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    async fn wait_for_stop(flag: &AtomicBool) {
        loop {
            if flag.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    /// A `FetcherFactory` that hands out one shared `Arc<ScriptedFetcher>`
    /// regardless of room identifier — sufficient for single-room scenario
    /// tests that only ever start one room at a time.
    pub struct SingleScriptedFactory {
        pub fetcher: Arc<ScriptedFetcher>,
    }

    impl SingleScriptedFactory {
        pub fn new(fetcher: Arc<ScriptedFetcher>) -> Self {
            Self { fetcher }
        }
    }

    impl FetcherFactory for SingleScriptedFactory {
        fn create(&self, _room_identifier: &str) -> Arc<dyn Fetcher> {
            Arc::clone(&self.fetcher) as Arc<dyn Fetcher>
        }
    }
}
