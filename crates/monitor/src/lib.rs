// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Roomwatch: headless monitoring supervisor for live-room broadcasts —
//! one Supervisor task per watched room, ingesting chat/gift/viewer events
//! into durable per-session stats, with a topic-addressed bus for
//! downstream dashboards.

pub mod bus;
pub mod clock;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod manager;
pub mod processor;
pub mod scheduler;
pub mod storage;
pub mod supervisor;

use std::sync::Arc;

use crate::config::Config;
use crate::core::{run_until_signal, Core};
use crate::fetcher::FetcherFactory;

/// Opens a `Core` against the configured database and an application's
/// choice of `FetcherFactory`, runs boot reconciliation and the Scheduler's
/// jobs, then blocks until shutdown.
pub async fn run(config: Config, fetcher_factory: Arc<dyn FetcherFactory>) -> anyhow::Result<()> {
    let core = Core::open(config, fetcher_factory)?;
    run_until_signal(&core).await
}
