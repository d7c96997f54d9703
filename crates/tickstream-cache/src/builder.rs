//! Periodic snapshot builder and the cache it publishes to.
//!
//! [`SnapshotCache`] reads a consistent copy of the [`TickSource`] state,
//! serializes it in chunks with cooperative yields, compresses it on the
//! blocking pool, and publishes the result through a single
//! [`ArcSwapOption`]. Readers load that pointer and never wait on a build.
//!
//! At most one build runs at a time. The timer runs builds inline and
//! skips ticks that fire while one is running; a [`build_now`] call that
//! arrives during a build returns [`BuildOutcome::InFlight`].
//!
//! [`build_now`]: SnapshotCache::build_now

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tickstream_core::config::CacheConfig;
use tickstream_core::source::TickSource;
use tickstream_types::TickId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::encode::{self, Compressor, WireSnapshot};
use crate::error::BuildError;

/// One published snapshot. Immutable once built.
#[derive(Debug)]
pub struct CachedSnapshot {
    /// Tick the snapshot belongs to.
    pub tick_id: TickId,
    /// Build timestamp in Unix milliseconds.
    pub timestamp_ms: i64,
    /// zstd-compressed `snapshot` frame.
    pub compressed: Vec<u8>,
    /// Length of the uncompressed frame in bytes.
    pub uncompressed_size: usize,
    /// When the build finished.
    pub built_at: Instant,
    /// Form queued on sessions.
    pub wire: WireSnapshot,
}

impl CachedSnapshot {
    /// Compressed size in bytes.
    pub fn size(&self) -> usize {
        self.compressed.len()
    }

    /// Milliseconds since the build finished.
    pub fn age_ms(&self) -> u64 {
        u64::try_from(self.built_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// The latest snapshot together with its distance from the head tick.
#[derive(Debug, Clone)]
pub struct SnapshotView {
    /// The cached snapshot.
    pub snapshot: Arc<CachedSnapshot>,
    /// `head - snapshot.tick_id`.
    pub staleness: u64,
    /// Staleness above which the snapshot must be treated as absent.
    pub staleness_limit: u64,
}

impl SnapshotView {
    /// Whether the snapshot is recent enough to serve.
    pub const fn usable(&self) -> bool {
        self.staleness <= self.staleness_limit
    }
}

/// What a build attempt did.
#[derive(Debug)]
pub enum BuildOutcome {
    /// A new snapshot was published.
    Built(Arc<CachedSnapshot>),
    /// Another build was already running.
    InFlight,
    /// The source has not produced a tick yet.
    NoTicks,
}

/// Point-in-time counters for health and metrics endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Whether a snapshot has been published.
    pub cached: bool,
    /// Whether a build is currently running.
    pub building: bool,
    /// Successful builds.
    pub build_count: u64,
    /// Failed builds.
    pub error_count: u64,
    /// Age of the cached snapshot.
    pub cache_age_ms: Option<u64>,
    /// Compressed size of the cached snapshot.
    pub cache_size: usize,
    /// Uncompressed size of the cached snapshot.
    pub uncompressed_size: usize,
    /// `uncompressed_size / cache_size`, 0 when nothing is cached.
    pub compression_ratio: f64,
    /// Tick of the cached snapshot.
    pub last_tick_id: Option<TickId>,
    /// Configured build period.
    pub interval_ms: u64,
    /// Distance from the head tick.
    pub staleness: Option<u64>,
}

/// Snapshot builder and cache.
pub struct SnapshotCache {
    source: Arc<TickSource>,
    config: CacheConfig,
    current: ArcSwapOption<CachedSnapshot>,
    building: AtomicBool,
    cancel: AtomicBool,
    build_count: AtomicU64,
    error_count: AtomicU64,
    compressor: Compressor,
    timer: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl SnapshotCache {
    /// Create an empty cache over `source`.
    pub fn new(source: Arc<TickSource>, config: CacheConfig) -> Self {
        Self {
            source,
            config,
            current: ArcSwapOption::empty(),
            building: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            build_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            compressor: Arc::new(encode::compress),
            timer: Mutex::new(None),
        }
    }

    /// Replace the compression step.
    #[must_use]
    pub fn with_compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = compressor;
        self
    }

    /// Cache settings.
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Timer
    // -----------------------------------------------------------------------

    /// Start periodic builds every `interval`. Returns `false` if the timer
    /// is already running.
    pub fn start(self: &Arc<Self>, interval: Duration) -> bool {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() {
            return false;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let cache = Arc::clone(self);
        let period = interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        // Errors are logged and counted inside.
                        let _ = cache.build_now().await;
                    }
                }
            }
            debug!("snapshot timer stopped");
        });

        info!(
            interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            "Snapshot builder started"
        );
        *timer = Some((stop_tx, handle));
        true
    }

    /// Stop periodic builds. An in-flight build is cancelled at its next
    /// chunk boundary and the cache keeps its last snapshot.
    pub async fn stop(&self) {
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.cancel.store(true, Ordering::Release);
        if let Some((stop_tx, handle)) = timer {
            let _ = stop_tx.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "snapshot timer task failed");
            }
            info!("Snapshot builder stopped");
        }
    }

    /// Whether the periodic timer is running.
    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    // -----------------------------------------------------------------------
    // Build
    // -----------------------------------------------------------------------

    /// Build and publish a snapshot now, unless one is already building.
    ///
    /// On failure the previous snapshot stays published and the error
    /// counter is incremented.
    pub async fn build_now(&self) -> Result<BuildOutcome, BuildError> {
        if self
            .building
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("snapshot build already in flight, skipping");
            return Ok(BuildOutcome::InFlight);
        }
        let _flight = InFlight(&self.building);
        self.cancel.store(false, Ordering::Release);

        match self.build_once().await {
            Ok(Some(snapshot)) => {
                self.current.store(Some(Arc::clone(&snapshot)));
                self.build_count.fetch_add(1, Ordering::Relaxed);
                debug!(
                    tick = snapshot.tick_id,
                    size = snapshot.size(),
                    uncompressed = snapshot.uncompressed_size,
                    large = snapshot.wire.large,
                    "snapshot published"
                );
                Ok(BuildOutcome::Built(snapshot))
            }
            Ok(None) => Ok(BuildOutcome::NoTicks),
            Err(e) => {
                if e.is_failure() {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "snapshot build failed, keeping previous cache");
                } else {
                    debug!("snapshot build cancelled");
                }
                Err(e)
            }
        }
    }

    async fn build_once(&self) -> Result<Option<Arc<CachedSnapshot>>, BuildError> {
        let read = self.source.snapshot();
        if read.tick_id == 0 {
            return Ok(None);
        }

        let tick_id = read.tick_id;
        let timestamp_ms = encode::now_ms();
        let frame = encode::serialize_chunked(
            tick_id,
            timestamp_ms,
            &read.state,
            self.config.chunk_items,
            &self.cancel,
        )
        .await?;
        drop(read);

        let level = self.config.compression_level;
        let compressor = Arc::clone(&self.compressor);
        let (frame, compressed) = tokio::task::spawn_blocking(move || {
            let compressed = compressor(frame.as_bytes(), level);
            (frame, compressed)
        })
        .await
        .map_err(|e| BuildError::Task(e.to_string()))?;
        let compressed = compressed?;

        let uncompressed_size = frame.len();
        let frame: Arc<str> = Arc::from(frame);
        let wire = encode::wire_snapshot(tick_id, &frame, &compressed, &self.config)?;

        Ok(Some(Arc::new(CachedSnapshot {
            tick_id,
            timestamp_ms,
            compressed,
            uncompressed_size,
            built_at: Instant::now(),
            wire,
        })))
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    /// Latest snapshot, or `None` if nothing has been built yet.
    pub fn latest(&self) -> Option<Arc<CachedSnapshot>> {
        self.current.load_full()
    }

    /// Latest snapshot plus its staleness against the current head.
    pub fn view(&self) -> Option<SnapshotView> {
        let snapshot = self.latest()?;
        let staleness = self.source.head().saturating_sub(snapshot.tick_id);
        Some(SnapshotView {
            snapshot,
            staleness,
            staleness_limit: self.config.staleness_limit,
        })
    }

    /// Latest snapshot if it is within the staleness limit.
    pub fn usable(&self) -> Option<SnapshotView> {
        self.view().filter(SnapshotView::usable)
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let view = self.view();
        let snapshot = view.as_ref().map(|v| &v.snapshot);
        let cache_size = snapshot.map_or(0, |s| s.size());
        let uncompressed_size = snapshot.map_or(0, |s| s.uncompressed_size);
        CacheStats {
            cached: snapshot.is_some(),
            building: self.building.load(Ordering::Acquire),
            build_count: self.build_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            cache_age_ms: snapshot.map(|s| s.age_ms()),
            cache_size,
            uncompressed_size,
            compression_ratio: ratio(uncompressed_size, cache_size),
            last_tick_id: snapshot.map(|s| s.tick_id),
            interval_ms: self.config.interval_ms,
            staleness: view.as_ref().map(|v| v.staleness),
        }
    }
}

impl std::fmt::Debug for SnapshotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCache")
            .field("last_tick_id", &self.latest().map(|s| s.tick_id))
            .field("building", &self.building.load(Ordering::Acquire))
            .field("build_count", &self.build_count.load(Ordering::Relaxed))
            .field("error_count", &self.error_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Clears the in-flight flag when a build ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(uncompressed: usize, compressed: usize) -> f64 {
    if compressed == 0 {
        return 0.0;
    }
    uncompressed as f64 / compressed as f64
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use tickstream_core::synthetic::SyntheticMutator;
    use tickstream_types::ServerMessage;

    fn setup(config: CacheConfig) -> (Arc<TickSource>, Arc<SnapshotCache>) {
        let source = Arc::new(TickSource::new(
            "test",
            Box::new(SyntheticMutator::new(11, 64)),
        ));
        let cache = Arc::new(SnapshotCache::new(Arc::clone(&source), config));
        (source, cache)
    }

    fn advance(source: &TickSource, n: u64) {
        for _ in 0..n {
            source.advance();
        }
    }

    #[tokio::test]
    async fn no_cache_before_first_build() {
        let (source, cache) = setup(CacheConfig::default());
        assert!(cache.view().is_none());
        assert!(matches!(cache.build_now().await, Ok(BuildOutcome::NoTicks)));
        advance(&source, 3);
        assert!(cache.view().is_none());
        assert!(!cache.stats().cached);
    }

    #[tokio::test]
    async fn build_publishes_the_current_tick() {
        let (source, cache) = setup(CacheConfig::default());
        advance(&source, 5);
        let Ok(BuildOutcome::Built(built)) = cache.build_now().await else {
            panic!("expected a build");
        };
        assert_eq!(built.tick_id, 5);

        let view = cache.view().unwrap();
        assert_eq!(view.snapshot.tick_id, 5);
        assert_eq!(view.staleness, 0);
        assert!(view.usable());

        let ServerMessage::Snapshot(msg) = ServerMessage::parse(&view.snapshot.wire.frame).unwrap()
        else {
            panic!("expected inline snapshot");
        };
        assert_eq!(msg.state, source.snapshot().state);
    }

    #[tokio::test]
    async fn staleness_limit_is_inclusive() {
        let (source, cache) = setup(CacheConfig {
            staleness_limit: 100,
            ..CacheConfig::default()
        });
        advance(&source, 1);
        cache.build_now().await.unwrap();

        advance(&source, 100);
        assert_eq!(cache.view().unwrap().staleness, 100);
        assert!(cache.usable().is_some());

        advance(&source, 1);
        assert_eq!(cache.view().unwrap().staleness, 101);
        assert!(cache.usable().is_none());
        assert!(cache.view().is_some());
    }

    #[tokio::test]
    async fn concurrent_build_is_skipped() {
        let (source, cache) = setup(CacheConfig {
            chunk_items: 1,
            ..CacheConfig::default()
        });
        advance(&source, 40);

        let (first, second) = tokio::join!(cache.build_now(), cache.build_now());
        assert!(matches!(first, Ok(BuildOutcome::Built(_))));
        assert!(matches!(second, Ok(BuildOutcome::InFlight)));
        assert_eq!(cache.stats().build_count, 1);
        assert!(!cache.stats().building);
    }

    #[tokio::test]
    async fn rebuild_swaps_atomically() {
        let (source, cache) = setup(CacheConfig::default());
        advance(&source, 2);
        cache.build_now().await.unwrap();
        let old = cache.latest().unwrap();

        advance(&source, 3);
        cache.build_now().await.unwrap();
        let new = cache.latest().unwrap();

        assert_eq!(old.tick_id, 2);
        assert_eq!(new.tick_id, 5);
        assert!(ServerMessage::parse(&old.wire.frame).is_ok());
    }

    #[tokio::test]
    async fn failed_build_keeps_the_previous_snapshot() {
        let source = Arc::new(TickSource::new(
            "test",
            Box::new(SyntheticMutator::new(11, 64)),
        ));
        let failing = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failing);
        let cache = SnapshotCache::new(Arc::clone(&source), CacheConfig::default())
            .with_compressor(Arc::new(move |data: &[u8], level: i32| {
                if flag.load(Ordering::Acquire) {
                    return Err(BuildError::Compress {
                        source: std::io::Error::other("encoder gone"),
                    });
                }
                encode::compress(data, level)
            }));

        advance(&source, 3);
        cache.build_now().await.unwrap();

        failing.store(true, Ordering::Release);
        advance(&source, 2);
        let err = cache.build_now().await.unwrap_err();
        assert!(matches!(err, BuildError::Compress { .. }));

        assert_eq!(cache.latest().unwrap().tick_id, 3);
        let stats = cache.stats();
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.build_count, 1);
        assert!(!stats.building);
        assert_eq!(stats.staleness, Some(2));

        failing.store(false, Ordering::Release);
        cache.build_now().await.unwrap();
        assert_eq!(cache.latest().unwrap().tick_id, 5);
    }

    #[tokio::test]
    async fn stats_report_sizes_and_ratio() {
        let (source, cache) = setup(CacheConfig::default());
        advance(&source, 50);
        cache.build_now().await.unwrap();

        let stats = cache.stats();
        assert!(stats.cached);
        assert_eq!(stats.build_count, 1);
        assert_eq!(stats.error_count, 0);
        assert_eq!(stats.last_tick_id, Some(50));
        assert!(stats.cache_size > 0);
        assert!(stats.uncompressed_size > stats.cache_size);
        assert!(stats.compression_ratio > 1.0);
    }

    #[tokio::test]
    async fn timer_builds_until_stopped() {
        let (source, cache) = setup(CacheConfig::default());
        advance(&source, 10);

        assert!(cache.start(Duration::from_millis(10)));
        assert!(!cache.start(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(80)).await;
        cache.stop().await;
        assert!(!cache.is_running());

        let builds = cache.stats().build_count;
        assert!(builds >= 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.stats().build_count, builds);
        assert_eq!(cache.latest().unwrap().tick_id, 10);
    }
}
