//! Operational endpoint handlers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Stream status plus snapshot cache statistics |
//! | `GET` | `/metrics` | Flat JSON counters |

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::Uri;
use serde::Serialize;
use tickstream_cache::CacheStats;
use tickstream_types::TickId;

use crate::error::ApiError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

/// Snapshot limits reported by `/health`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthLimits {
    /// Maximum ticks a cached snapshot may lag the head and still be served.
    pub staleness_limit: u64,
    /// Compressed size above which snapshots are sent as `snapshotLarge`.
    pub large_threshold: usize,
}

/// Response body for `GET /health`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` while the server answers.
    pub status: &'static str,
    /// Stream served by this process.
    pub stream_id: String,
    /// Latest tick published by the source.
    pub head_tick: TickId,
    /// Connected sessions.
    pub sessions: usize,
    /// Seconds since startup.
    pub uptime_secs: u64,
    /// Snapshot cache statistics.
    pub snapshot: CacheStats,
    /// Configured snapshot limits.
    pub limits: HealthLimits,
}

/// Report stream and snapshot cache status.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let hub = &state.hub;
    let cache_config = hub.cache().config();
    Json(HealthResponse {
        status: "ok",
        stream_id: hub.stream_id().to_owned(),
        head_tick: hub.head(),
        sessions: hub.session_count(),
        uptime_secs: state.uptime_secs(),
        snapshot: hub.cache().stats(),
        limits: HealthLimits {
            staleness_limit: cache_config.staleness_limit,
            large_threshold: cache_config.large_snapshot_threshold,
        },
    })
}

// ---------------------------------------------------------------------------
// GET /metrics
// ---------------------------------------------------------------------------

/// Response body for `GET /metrics`.
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    /// Successful snapshot builds.
    pub snapshot_builds_total: u64,
    /// Failed snapshot builds.
    pub snapshot_errors_total: u64,
    /// Age of the cached snapshot, 0 when nothing is cached.
    pub snapshot_cache_age_ms: u64,
    /// Compressed size of the cached snapshot.
    pub snapshot_cache_size_bytes: usize,
    /// Uncompressed over compressed size of the cached snapshot.
    pub snapshot_compression_ratio: f64,
    /// Latest tick published by the source.
    pub stream_head_tick: TickId,
    /// Connected sessions.
    pub sessions_active: usize,
    /// Frames handed to connection tasks.
    pub messages_sent_total: u64,
    /// Queues collapsed to a snapshot.
    pub coalesce_total: u64,
    /// Connections closed for protocol violations.
    pub protocol_violations_total: u64,
    /// Sessions closed after a failed send.
    pub send_failures_total: u64,
    /// Sessions that completed the handshake.
    pub sessions_opened_total: u64,
    /// Largest round-trip time measured by the last ping of any session.
    pub ping_rtt_ms_max: u64,
}

/// Report counters.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<MetricsResponse> {
    let hub = &state.hub;
    let cache = hub.cache().stats();
    let counters = hub.metrics().snapshot();
    Json(MetricsResponse {
        snapshot_builds_total: cache.build_count,
        snapshot_errors_total: cache.error_count,
        snapshot_cache_age_ms: cache.cache_age_ms.unwrap_or(0),
        snapshot_cache_size_bytes: cache.cache_size,
        snapshot_compression_ratio: cache.compression_ratio,
        stream_head_tick: hub.head(),
        sessions_active: hub.session_count(),
        messages_sent_total: counters.messages_sent,
        coalesce_total: counters.coalesce,
        protocol_violations_total: counters.protocol_violations,
        send_failures_total: counters.send_failures,
        sessions_opened_total: counters.sessions_opened,
        ping_rtt_ms_max: hub.max_rtt_ms().unwrap_or(0),
    })
}

/// Fallback for unknown paths.
pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(uri.path().to_owned())
}
