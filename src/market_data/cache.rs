// =============================================================================
// Market Data Cache — one fetch per interval, fan-out to every agent
// =============================================================================
//
// Holds at most one snapshot and no history. Within a refresh interval every
// caller sees the identical Arc'd snapshot, so there is no tearing between
// agents. A refresh issues all upstream reads concurrently and is
// all-or-nothing: any failed component keeps the previous snapshot in place
// and surfaces the error to the caller, who decides whether stale data is
// acceptable.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::BTC_REFERENCE_PAIR;
use crate::market_data::{MarketSnapshot, MarketSource, Timeframe};

/// Minimum interval between upstream refreshes.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

struct Cached {
    snapshot: Arc<MarketSnapshot>,
    fetched: Instant,
}

/// Process-wide snapshot cache. One instance serves every agent.
pub struct MarketDataCache {
    source: Arc<dyn MarketSource>,
    pair: String,
    min_refresh: Duration,
    cached: RwLock<Option<Cached>>,
    /// Serialises refreshes so concurrent callers cannot double-fetch.
    refresh_gate: tokio::sync::Mutex<()>,
}

static GLOBAL: OnceLock<Arc<MarketDataCache>> = OnceLock::new();

impl MarketDataCache {
    pub fn new(source: Arc<dyn MarketSource>, pair: impl Into<String>) -> Self {
        Self {
            source,
            pair: pair.into(),
            min_refresh: MIN_REFRESH_INTERVAL,
            cached: RwLock::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Cache with a non-default refresh interval (tests).
    pub fn with_min_refresh(
        source: Arc<dyn MarketSource>,
        pair: impl Into<String>,
        min_refresh: Duration,
    ) -> Self {
        let mut cache = Self::new(source, pair);
        cache.min_refresh = min_refresh;
        cache
    }

    /// Register the process-wide instance. The first registration wins;
    /// later calls return the already-installed cache, so re-entrant startup
    /// (hot reload) never creates a second cache.
    pub fn install(cache: Arc<MarketDataCache>) -> Arc<MarketDataCache> {
        GLOBAL.get_or_init(|| cache).clone()
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    /// Last cached snapshot without touching upstream.
    pub fn peek(&self) -> Option<Arc<MarketSnapshot>> {
        self.cached.read().as_ref().map(|c| c.snapshot.clone())
    }

    /// Return the cached snapshot when it is fresh enough, otherwise refresh
    /// from upstream. `force_refresh` bypasses the freshness check but still
    /// coalesces with an in-flight refresh.
    pub async fn fetch(&self, force_refresh: bool) -> Result<Arc<MarketSnapshot>> {
        if !force_refresh {
            if let Some(snap) = self.fresh() {
                return Ok(snap);
            }
        }

        let _gate = self.refresh_gate.lock().await;

        // A concurrent caller may have refreshed while we waited on the gate.
        if !force_refresh {
            if let Some(snap) = self.fresh() {
                return Ok(snap);
            }
        }

        match self.refresh().await {
            Ok(snap) => Ok(snap),
            Err(e) => {
                warn!(error = %e, pair = %self.pair, "market refresh failed — keeping stale snapshot");
                Err(e)
            }
        }
    }

    fn fresh(&self) -> Option<Arc<MarketSnapshot>> {
        let cached = self.cached.read();
        cached.as_ref().and_then(|c| {
            (c.fetched.elapsed() < self.min_refresh).then(|| c.snapshot.clone())
        })
    }

    /// Issue all upstream reads concurrently, compute indicators, store.
    async fn refresh(&self) -> Result<Arc<MarketSnapshot>> {
        let started = Instant::now();

        let (m5, m15, h1, h4, d1, ticker, btc_ticker) = tokio::join!(
            self.source.fetch_candles(&self.pair, Timeframe::M5.minutes()),
            self.source.fetch_candles(&self.pair, Timeframe::M15.minutes()),
            self.source.fetch_candles(&self.pair, Timeframe::H1.minutes()),
            self.source.fetch_candles(&self.pair, Timeframe::H4.minutes()),
            self.source.fetch_candles(&self.pair, Timeframe::D1.minutes()),
            self.source.fetch_ticker(&self.pair),
            self.source.fetch_ticker(BTC_REFERENCE_PAIR),
        );

        let mut candles = BTreeMap::new();
        candles.insert(Timeframe::M5, m5?);
        candles.insert(Timeframe::M15, m15?);
        candles.insert(Timeframe::H1, h1?);
        candles.insert(Timeframe::H4, h4?);
        candles.insert(Timeframe::D1, d1?);

        let snapshot = Arc::new(MarketSnapshot::assemble(
            &self.pair,
            ticker?,
            btc_ticker?,
            candles,
        ));

        *self.cached.write() = Some(Cached {
            snapshot: snapshot.clone(),
            fetched: Instant::now(),
        });

        info!(
            pair = %self.pair,
            price = snapshot.last_price,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "market snapshot refreshed"
        );
        debug!(btc_trend = ?snapshot.btc_trend, "reference trend");

        Ok(snapshot)
    }
}

// =============================================================================
// Tests
// =============================================================================
