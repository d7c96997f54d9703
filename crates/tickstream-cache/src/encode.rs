//! Snapshot frame encoding.
//!
//! A snapshot goes through three forms:
//!
//! 1. the uncompressed `snapshot` JSON frame
//!    (`{"type":"snapshot","tickId","timestamp","state":{...}}`), built
//!    item by item by [`serialize_chunked`];
//! 2. the zstd-compressed bytes of that frame ([`compress`]);
//! 3. the [`WireSnapshot`] actually queued on sessions: the frame itself
//!    for small snapshots, or a `snapshotLarge` envelope carrying the
//!    base64 of the compressed bytes once they exceed the large threshold.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tickstream_core::config::CacheConfig;
use tickstream_core::source::SourceSnapshot;
use tickstream_types::{
    LARGE_SNAPSHOT_ENCODING, ServerMessage, Snapshot, SnapshotLarge, StreamState, TickId,
};

use crate::error::BuildError;

/// A snapshot ready to be queued on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireSnapshot {
    /// Tick the snapshot belongs to.
    pub tick_id: TickId,
    /// Encoded text frame.
    pub frame: Arc<str>,
    /// Credit cost of the frame.
    pub weight: u32,
    /// Whether the frame is a `snapshotLarge` envelope.
    pub large: bool,
}

/// Serialize the `snapshot` frame for `state`, yielding to the runtime
/// every `chunk_items` nodes/edges and aborting if `cancel` is raised.
///
/// The output is byte-for-byte what serializing
/// [`ServerMessage::Snapshot`] would produce.
pub async fn serialize_chunked(
    tick_id: TickId,
    timestamp_ms: i64,
    state: &StreamState,
    chunk_items: usize,
    cancel: &AtomicBool,
) -> Result<String, BuildError> {
    let chunk_items = chunk_items.max(1);
    let mut since_yield: usize = 0;
    let mut buf: Vec<u8> = Vec::with_capacity(estimate_len(state));

    buf.extend_from_slice(br#"{"type":"snapshot","tickId":"#);
    serde_json::to_writer(&mut buf, &tick_id)?;
    buf.extend_from_slice(br#","timestamp":"#);
    serde_json::to_writer(&mut buf, &timestamp_ms)?;
    buf.extend_from_slice(br#","state":{"count":"#);
    serde_json::to_writer(&mut buf, &state.count)?;

    buf.extend_from_slice(br#","nodes":{"#);
    for (i, (id, node)) in state.nodes.iter().enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        serde_json::to_writer(&mut buf, id)?;
        buf.push(b':');
        serde_json::to_writer(&mut buf, node)?;
        pace(&mut since_yield, chunk_items, cancel).await?;
    }

    buf.extend_from_slice(br#"},"edges":{"#);
    for (i, (id, edge)) in state.edges.iter().enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        serde_json::to_writer(&mut buf, id)?;
        buf.push(b':');
        serde_json::to_writer(&mut buf, edge)?;
        pace(&mut since_yield, chunk_items, cancel).await?;
    }
    buf.extend_from_slice(b"}}}");

    String::from_utf8(buf).map_err(|_| BuildError::Utf8)
}

async fn pace(
    since_yield: &mut usize,
    chunk_items: usize,
    cancel: &AtomicBool,
) -> Result<(), BuildError> {
    *since_yield = since_yield.saturating_add(1);
    if *since_yield >= chunk_items {
        *since_yield = 0;
        tokio::task::yield_now().await;
        if cancel.load(Ordering::Acquire) {
            return Err(BuildError::Cancelled);
        }
    }
    Ok(())
}

/// Rough upper bound on the frame length, used to pre-size the buffer.
fn estimate_len(state: &StreamState) -> usize {
    state.item_count().saturating_mul(64).saturating_add(128)
}

/// Serialize a snapshot frame in one go. Used for inline snapshots taken
/// off the blocking pool.
pub fn serialize_frame(snapshot: SourceSnapshot, timestamp_ms: i64) -> Result<String, BuildError> {
    let msg = ServerMessage::Snapshot(Snapshot {
        tick_id: snapshot.tick_id,
        timestamp: timestamp_ms,
        state: snapshot.state,
    });
    Ok(msg.to_json()?)
}

/// Compression step run by the builder on the blocking pool. Defaults to
/// [`compress`].
pub type Compressor = Arc<dyn Fn(&[u8], i32) -> Result<Vec<u8>, BuildError> + Send + Sync>;

/// Compress `data` with a zstd stream encoder at `level`.
pub fn compress(data: &[u8], level: i32) -> Result<Vec<u8>, BuildError> {
    let mut encoder = zstd::stream::Encoder::new(Vec::new(), level)
        .map_err(|source| BuildError::Compress { source })?;
    encoder
        .write_all(data)
        .map_err(|source| BuildError::Compress { source })?;
    encoder
        .finish()
        .map_err(|source| BuildError::Compress { source })
}

/// Credit weight of a large snapshot: `max(1, ceil(size / unit))`.
pub fn large_weight(compressed_size: usize, weight_unit: usize) -> u32 {
    let units = compressed_size.div_ceil(weight_unit.max(1)).max(1);
    u32::try_from(units).unwrap_or(u32::MAX)
}

/// Pick the wire form of a snapshot from its frame and compressed bytes.
pub fn wire_snapshot(
    tick_id: TickId,
    frame: &Arc<str>,
    compressed: &[u8],
    config: &CacheConfig,
) -> Result<WireSnapshot, BuildError> {
    if compressed.len() <= config.large_snapshot_threshold {
        return Ok(WireSnapshot {
            tick_id,
            frame: Arc::clone(frame),
            weight: 1,
            large: false,
        });
    }

    let weight = large_weight(compressed.len(), config.weight_unit);
    let envelope = ServerMessage::SnapshotLarge(SnapshotLarge {
        tick_id,
        encoding: LARGE_SNAPSHOT_ENCODING.to_owned(),
        size: u64::try_from(compressed.len()).unwrap_or(u64::MAX),
        weight,
        bytes: STANDARD.encode(compressed),
    });
    Ok(WireSnapshot {
        tick_id,
        frame: Arc::from(envelope.to_json()?),
        weight,
        large: true,
    })
}

/// Encode a consistent source read straight to its wire form.
///
/// Synchronous and CPU bound; callers run it on the blocking pool.
pub fn encode_inline(
    snapshot: SourceSnapshot,
    config: &CacheConfig,
) -> Result<WireSnapshot, BuildError> {
    let tick_id = snapshot.tick_id;
    let frame: Arc<str> = Arc::from(serialize_frame(snapshot, now_ms())?);
    let compressed = compress(frame.as_bytes(), config.compression_level)?;
    wire_snapshot(tick_id, &frame, &compressed, config)
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::arithmetic_side_effects)]
mod tests {
    use std::io::Read;

    use super::*;
    use tickstream_types::{DeltaPayload, Edge, Node};

    fn sample_state(nodes: u64) -> StreamState {
        let mut state = StreamState::default();
        for tick in 1..=nodes {
            let id = format!("n{tick}");
            let edges = if tick > 1 {
                vec![Edge {
                    id: format!("e{tick}"),
                    from: format!("n{}", tick - 1),
                    to: id.clone(),
                }]
            } else {
                Vec::new()
            };
            state.apply_delta(&DeltaPayload {
                count: tick,
                nodes: vec![Node {
                    id,
                    value: tick * 7,
                    updated_at: tick,
                }],
                edges,
                removed_nodes: Vec::new(),
            });
        }
        state
    }

    #[tokio::test]
    async fn chunked_frame_matches_serde_encoding() {
        let state = sample_state(20);
        let cancel = AtomicBool::new(false);
        let chunked = serialize_chunked(20, 1_700_000_000_000, &state, 3, &cancel)
            .await
            .unwrap();
        let direct = serialize_frame(
            SourceSnapshot {
                tick_id: 20,
                state: state.clone(),
            },
            1_700_000_000_000,
        )
        .unwrap();
        assert_eq!(chunked, direct);

        match ServerMessage::parse(&chunked).unwrap() {
            ServerMessage::Snapshot(snapshot) => {
                assert_eq!(snapshot.tick_id, 20);
                assert_eq!(snapshot.state, state);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_state_serializes() {
        let cancel = AtomicBool::new(false);
        let frame = serialize_chunked(1, 0, &StreamState::default(), 50, &cancel)
            .await
            .unwrap();
        assert!(ServerMessage::parse(&frame).is_ok());
    }

    #[tokio::test]
    async fn cancel_is_honored_between_chunks() {
        let state = sample_state(10);
        let cancel = AtomicBool::new(true);
        let result = serialize_chunked(10, 0, &state, 2, &cancel).await;
        assert!(matches!(result, Err(BuildError::Cancelled)));
    }

    #[test]
    fn weight_rounds_up_with_floor_of_one() {
        assert_eq!(large_weight(0, 65_536), 1);
        assert_eq!(large_weight(1, 65_536), 1);
        assert_eq!(large_weight(65_536, 65_536), 1);
        assert_eq!(large_weight(65_537, 65_536), 2);
        assert_eq!(large_weight(10, 0), 10);
    }

    #[test]
    fn small_snapshot_ships_the_frame_itself() {
        let config = CacheConfig::default();
        let wire = encode_inline(
            SourceSnapshot {
                tick_id: 5,
                state: sample_state(5),
            },
            &config,
        )
        .unwrap();
        assert!(!wire.large);
        assert_eq!(wire.weight, 1);
        assert_eq!(ServerMessage::parse(&wire.frame).unwrap().tick_id(), Some(5));
    }

    #[test]
    fn large_snapshot_is_wrapped_and_weighted() {
        let config = CacheConfig {
            large_snapshot_threshold: 0,
            weight_unit: 16,
            ..CacheConfig::default()
        };
        let state = sample_state(40);
        let wire = encode_inline(
            SourceSnapshot {
                tick_id: 40,
                state: state.clone(),
            },
            &config,
        )
        .unwrap();
        assert!(wire.large);

        let ServerMessage::SnapshotLarge(large) = ServerMessage::parse(&wire.frame).unwrap() else {
            panic!("expected snapshotLarge");
        };
        assert_eq!(large.encoding, LARGE_SNAPSHOT_ENCODING);
        assert_eq!(large.weight, wire.weight);
        assert_eq!(u64::from(large.weight), large.size.div_ceil(16).max(1));

        let compressed = STANDARD.decode(&large.bytes).unwrap();
        assert_eq!(u64::try_from(compressed.len()).unwrap(), large.size);
        let mut inflated = String::new();
        zstd::stream::Decoder::new(compressed.as_slice())
            .unwrap()
            .read_to_string(&mut inflated)
            .unwrap();
        let ServerMessage::Snapshot(snapshot) = ServerMessage::parse(&inflated).unwrap() else {
            panic!("expected inner snapshot");
        };
        assert_eq!(snapshot.state, state);
    }
}
