//! Incremental fetch-and-partition engine.
//!
//! For every requested `(data kind, symbol)` pair the engine walks the date
//! range in partition-sized windows, decides per window whether a (re)fetch
//! is needed, drives a paginated pull loop against the exchange provider
//! behind the shared rate limiter, trims the result to the window and
//! persists it atomically. All pairs run as concurrent pipelines; within a
//! pipeline windows are fetched strictly in chronological order because each
//! page's cursor derives from the previous page's last row.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::limiter::RateLimiter;
use crate::partition::{date_token, partition_path, window_is_open, DataKind};
use crate::provider::{DataError, ExchangeProvider};
use crate::store;
use crate::window::{duration_from_label, partition_window, period_start};

/// Engine configuration, passed explicitly to [`FetchEngine::new`].
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Root directory for partition files. Created on first use.
    pub download_dir: PathBuf,
    /// Candle timeframe label (e.g. `1m`, `4h`).
    pub timeframe: String,
    /// Page size cap for trade pagination.
    pub trade_page_limit: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            download_dir: home.join(".tickvault"),
            timeframe: "1m".to_string(),
            trade_page_limit: 1000,
        }
    }
}

/// Outcome of a fetch run: per-pipeline successes and failures.
///
/// A failed pipeline never aborts its siblings; its error is recorded here
/// and logged when it occurs.
#[derive(Debug)]
pub struct FetchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<(String, DataError)>,
}

impl FetchSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// The fetch engine. Cheap to construct; all state lives on disk.
pub struct FetchEngine {
    provider: Arc<dyn ExchangeProvider>,
    limiter: Arc<RateLimiter>,
    config: FetchConfig,
}

impl FetchEngine {
    pub fn new(
        provider: Arc<dyn ExchangeProvider>,
        limiter: Arc<RateLimiter>,
        config: FetchConfig,
    ) -> Self {
        Self { provider, limiter, config }
    }

    /// Fetch all requested kinds for all symbols over `[start, end)`.
    ///
    /// Loads market metadata once up front so configuration mistakes surface
    /// before any pipeline starts, then runs one pipeline per
    /// `(kind, symbol)` pair to completion.
    pub async fn run(
        &self,
        kinds: &[DataKind],
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FetchSummary, DataError> {
        self.provider.load_markets().await?;
        fs::create_dir_all(&self.config.download_dir)
            .map_err(|e| DataError::StoreError(format!("failed to create download dir: {e}")))?;

        let start_dt = midnight_utc(start);
        let end_dt = midnight_utc(end);

        let mut tasks = JoinSet::new();
        for &kind in kinds {
            for symbol in symbols {
                let provider = Arc::clone(&self.provider);
                let limiter = Arc::clone(&self.limiter);
                let config = self.config.clone();
                let symbol = symbol.clone();
                tasks.spawn(async move {
                    let label = format!("{kind} {symbol}");
                    let result =
                        fetch_series(provider, limiter, config, kind, symbol, start_dt, end_dt)
                            .await;
                    (label, result)
                });
            }
        }

        let total = kinds.len() * symbols.len();
        let mut succeeded = 0;
        let mut errors: Vec<(String, DataError)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => succeeded += 1,
                Ok((label, Err(e))) => {
                    error!(pipeline = %label, "fetch pipeline failed: {e}");
                    errors.push((label, e));
                }
                Err(e) => {
                    error!("fetch task aborted: {e}");
                    errors.push(("<task>".to_string(), DataError::Provider(e.to_string())));
                }
            }
        }

        let failed = errors.len();
        Ok(FetchSummary { total, succeeded, failed, errors })
    }
}

/// Blocking wrapper around [`FetchEngine::run`] for synchronous callers.
pub fn download(
    provider: Arc<dyn ExchangeProvider>,
    kinds: &[DataKind],
    symbols: &[String],
    start: NaiveDate,
    end: NaiveDate,
    config: FetchConfig,
    limiter: Option<Arc<RateLimiter>>,
) -> Result<FetchSummary, DataError> {
    let limiter = limiter.unwrap_or_else(|| Arc::new(RateLimiter::default()));
    let engine = FetchEngine::new(provider, limiter, config);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| DataError::Configuration(format!("failed to build async runtime: {e}")))?;
    runtime.block_on(engine.run(kinds, symbols, start, end))
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0).unwrap().and_utc()
}

/// One pipeline: walk `[start, end)` in windows for a single series.
async fn fetch_series(
    provider: Arc<dyn ExchangeProvider>,
    limiter: Arc<RateLimiter>,
    config: FetchConfig,
    kind: DataKind,
    symbol: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<(), DataError> {
    // Candle windows are sized from the timeframe and walked on aligned
    // period starts; trade and funding partitions are plain daily files
    // stepped from the (already date-aligned) range start.
    let (granularity, window) = match kind {
        DataKind::Candles => {
            let granularity = duration_from_label(&config.timeframe)?;
            (granularity, partition_window(granularity))
        }
        DataKind::Trades | DataKind::Funding => (Duration::days(1), Duration::days(1)),
    };

    let mut cursor = match kind {
        DataKind::Candles => period_start(granularity, start),
        DataKind::Trades | DataKind::Funding => start,
    };
    while cursor < end {
        fetch_window(&*provider, &limiter, &config, kind, &symbol, cursor, window, granularity)
            .await?;
        cursor = match kind {
            DataKind::Candles => period_start(granularity, cursor + window),
            DataKind::Trades | DataKind::Funding => cursor + window,
        };
    }
    Ok(())
}

/// Fetch and persist one partition window, unless it is already archived.
#[allow(clippy::too_many_arguments)]
async fn fetch_window(
    provider: &dyn ExchangeProvider,
    limiter: &RateLimiter,
    config: &FetchConfig,
    kind: DataKind,
    symbol: &str,
    window_start: DateTime<Utc>,
    window: Duration,
    granularity: Duration,
) -> Result<(), DataError> {
    let exchange = provider.exchange_id().to_string();
    let date = date_token(window_start);
    let sub_kind = match kind {
        DataKind::Candles => Some(config.timeframe.as_str()),
        DataKind::Trades | DataKind::Funding => None,
    };

    let complete_path =
        partition_path(&config.download_dir, &exchange, kind, sub_kind, &date, symbol, false);
    if complete_path.exists() {
        info!("{kind} for {symbol} on {exchange} starting {date} already exist, skipping");
        return Ok(());
    }
    let incomplete_path =
        partition_path(&config.download_dir, &exchange, kind, sub_kind, &date, symbol, true);
    if incomplete_path.exists() {
        // Superseded wholesale by this fetch, never patched in place.
        debug!("removing previously incomplete partition {}", incomplete_path.display());
        fs::remove_file(&incomplete_path)
            .map_err(|e| DataError::StoreError(format!("failed to remove incomplete file: {e}")))?;
    }

    debug!("fetching {kind} for {symbol} on {exchange} starting {date}");

    let start_ts = window_start.timestamp_millis();
    let end_ts = (window_start + window).timestamp_millis();

    // The `_incomplete` marker is re-derived from the wall clock at write
    // time, after the pull loop, so a window that elapses mid-fetch is still
    // named correctly.
    match kind {
        DataKind::Candles => {
            let mut rows = Vec::new();
            let mut current_ts = start_ts;
            let granularity_ms = granularity.num_milliseconds().max(1);
            while current_ts < end_ts {
                let page_limit = ((end_ts - current_ts) / granularity_ms + 1) as u32;
                limiter.acquire().await;
                let page = provider
                    .fetch_ohlcv(symbol, &config.timeframe, current_ts, page_limit)
                    .await?;
                let Some(last) = page.last() else { break };
                current_ts = last.timestamp + 1;
                rows.extend(page);
            }
            rows.retain(|r| start_ts <= r.timestamp && r.timestamp < end_ts);
            if rows.is_empty() {
                info!("no {} candles for {symbol} on {exchange} found on {date}", config.timeframe);
                return Ok(());
            }
            rows.sort_by_key(|r| r.timestamp);
            let path = write_path(config, &exchange, kind, sub_kind, &date, symbol, window_start, window);
            store::write_candles(&path, &exchange, symbol, &rows)?;
        }
        DataKind::Trades => {
            let mut rows = Vec::new();
            let mut current_ts = start_ts;
            while current_ts < end_ts {
                limiter.acquire().await;
                let page = provider
                    .fetch_trades(symbol, current_ts, config.trade_page_limit)
                    .await?;
                let Some(last) = page.last() else { break };
                current_ts = last.timestamp + 1;
                rows.extend(page);
            }
            rows.retain(|r| start_ts <= r.timestamp && r.timestamp < end_ts);
            if rows.is_empty() {
                info!("no trades for {symbol} on {exchange} found on {date}");
                return Ok(());
            }
            rows.sort_by_key(|r| r.timestamp);
            let path = write_path(config, &exchange, kind, sub_kind, &date, symbol, window_start, window);
            store::write_trades(&path, &exchange, &rows)?;
        }
        DataKind::Funding => {
            let mut rows = Vec::new();
            let mut current_ts = start_ts;
            while current_ts < end_ts {
                limiter.acquire().await;
                let page = provider.fetch_funding_history(symbol, current_ts).await?;
                let Some(last) = page.last() else { break };
                current_ts = last.timestamp + 1;
                rows.extend(page);
            }
            rows.retain(|r| start_ts <= r.timestamp && r.timestamp < end_ts);
            if rows.is_empty() {
                info!("no funding rate data for {symbol} on {exchange} found on {date}");
                return Ok(());
            }
            rows.sort_by_key(|r| r.timestamp);
            let path = write_path(config, &exchange, kind, sub_kind, &date, symbol, window_start, window);
            store::write_funding(&path, &exchange, &rows)?;
        }
    }

    info!("finished downloading {kind} for {symbol} on {exchange} starting {date}");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_path(
    config: &FetchConfig,
    exchange: &str,
    kind: DataKind,
    sub_kind: Option<&str>,
    date: &str,
    symbol: &str,
    window_start: DateTime<Utc>,
    window: Duration,
) -> PathBuf {
    let incomplete = window_is_open(window_start, window, Utc::now());
    partition_path(&config.download_dir, exchange, kind, sub_kind, date, symbol, incomplete)
}
