// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Heartbeat server.
//!
//! Synchronous pods run a sidecar that polls this endpoint and kills the
//! connector once the launcher stops answering, so a crashed launcher never
//! leaves orphaned pods running.

use axum::{Json, Router, routing::get};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn alive() -> Json<Value> {
    Json(json!({ "alive": true }))
}

/// Router answering `GET /`.
pub fn router() -> Router {
    Router::new().route("/", get(alive))
}

/// Serve heartbeats on `listener` until `shutdown` fires.
pub async fn serve(listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Heartbeat server listening");

    axum::serve(listener, router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Heartbeat server stopped");
    Ok(())
}
