// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Thin process bootstrap (§1 "out of scope (external collaborators)"):
//! parses argv/env, wires a `Core`, and runs it until shutdown. The
//! platform-specific wire protocol client is a genuine external
//! collaborator and out of scope here — `PendingFetcherFactory` below is the
//! seam where that client plugs in.

use std::sync::Arc;

use clap::Parser;
use tracing::error;

use roomwatch::config::Config;
use roomwatch::error::FetchError;
use roomwatch::fetcher::{BoxFuture, Fetcher, FetcherFactory, ProbeResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Stands in for the platform-specific wire client this binary eventually
/// links against. Every probe reports the room offline rather than opening a
/// stream, so the state machine and storage layer run end-to-end without a
/// network dependency — useful to validate a deployment's config and
/// database before the real client is wired in.
struct PendingFetcher;

impl Fetcher for PendingFetcher {
    fn probe_live<'a>(&'a self, _room_identifier: &'a str) -> BoxFuture<'a, Result<ProbeResult, FetchError>> {
        Box::pin(async { Ok(ProbeResult::default()) })
    }

    fn open_stream<'a>(
        &'a self,
        _room_identifier: &'a str,
        _events: mpsc::Sender<roomwatch::fetcher::FetcherEvent>,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<(), FetchError>> {
        Box::pin(async move {
            cancel.cancelled().await;
            Ok(())
        })
    }

    fn stop(&self) {}
}

struct PendingFetcherFactory;

impl FetcherFactory for PendingFetcherFactory {
    fn create(&self, _room_identifier: &str) -> Arc<dyn Fetcher> {
        Arc::new(PendingFetcher)
    }
}

#[tokio::main]
async fn main() {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let fetcher_factory: Arc<dyn FetcherFactory> = Arc::new(PendingFetcherFactory);
    if let Err(e) = roomwatch::run(config, fetcher_factory).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
