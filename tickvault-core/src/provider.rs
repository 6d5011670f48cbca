//! Exchange provider trait, record types and structured errors.
//!
//! The `ExchangeProvider` trait abstracts over upstream exchange clients so
//! the fetch and load engines can be exercised against a mock in tests and
//! against any venue in production. Providers own the wire protocol, retry
//! policy and symbol conventions; the engines only rely on paginated
//! `(symbol, since-timestamp, limit)` queries returning ascending rows.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One OHLCV bar. `timestamp` is the bar start in Unix milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleRecord {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// One trade print. Timestamps may repeat within a symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub timestamp: i64,
    pub symbol: String,
    pub side: String,
    pub price: f64,
    pub amount: f64,
    pub cost: f64,
    pub fee: f64,
}

/// One funding-rate event for a perpetual swap.
#[derive(Debug, Clone, PartialEq)]
pub struct FundingRecord {
    pub timestamp: i64,
    pub symbol: String,
    pub funding_rate: f64,
}

/// Structured error types for fetch, store and load operations.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported timeframe label '{0}'")]
    UnsupportedTimeframe(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("store error: {0}")]
    StoreError(String),

    #[error("parquet I/O error: {0}")]
    ParquetError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

/// Market segment of a listed instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Swap,
    Future,
}

/// A listed instrument in unified symbol form (e.g. `BTC/USDT:USDT`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub symbol: String,
    pub market_type: MarketType,
}

/// A 24h ticker snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    pub quote_volume: f64,
}

/// Upstream exchange client.
///
/// Paginated fetches take a `since` millisecond timestamp and return rows in
/// ascending timestamp order; an empty page means the requested range is
/// exhausted. Implementations must be cheap to share across concurrent
/// pipeline tasks.
#[async_trait]
pub trait ExchangeProvider: Send + Sync {
    /// Lowercase venue identifier used in partition file names.
    fn exchange_id(&self) -> &str;

    /// Load instrument metadata. Called once per fetch run, before any
    /// pipeline starts, so configuration mistakes surface synchronously.
    async fn load_markets(&self) -> Result<Vec<Market>, DataError>;

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since_ms: i64,
        limit: u32,
    ) -> Result<Vec<CandleRecord>, DataError>;

    async fn fetch_trades(
        &self,
        symbol: &str,
        since_ms: i64,
        limit: u32,
    ) -> Result<Vec<TradeRecord>, DataError>;

    async fn fetch_funding_history(
        &self,
        symbol: &str,
        since_ms: i64,
    ) -> Result<Vec<FundingRecord>, DataError>;

    async fn fetch_tickers(&self, market_type: MarketType) -> Result<Vec<Ticker>, DataError>;
}

/// List the symbols available on a venue for one market type.
pub async fn get_symbols(
    provider: &dyn ExchangeProvider,
    market_type: MarketType,
) -> Result<Vec<String>, DataError> {
    Ok(provider
        .load_markets()
        .await?
        .into_iter()
        .filter(|m| m.market_type == market_type)
        .map(|m| m.symbol)
        .collect())
}

/// Tickers for one market type with 24h quote volume above `threshold`,
/// sorted descending by quote volume.
pub async fn get_tickers(
    provider: &dyn ExchangeProvider,
    threshold: f64,
    market_type: MarketType,
) -> Result<Vec<Ticker>, DataError> {
    let mut tickers: Vec<Ticker> = provider
        .fetch_tickers(market_type)
        .await?
        .into_iter()
        .filter(|t| t.quote_volume > threshold)
        .collect();
    tickers.sort_by(|a, b| {
        b.quote_volume
            .partial_cmp(&a.quote_volume)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(tickers)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticProvider;

    #[async_trait]
    impl ExchangeProvider for StaticProvider {
        fn exchange_id(&self) -> &str {
            "staticx"
        }

        async fn load_markets(&self) -> Result<Vec<Market>, DataError> {
            Ok(vec![
                Market { symbol: "BTC/USDT:USDT".into(), market_type: MarketType::Swap },
                Market { symbol: "ETH/USDT:USDT".into(), market_type: MarketType::Swap },
                Market { symbol: "BTC/USDT".into(), market_type: MarketType::Spot },
            ])
        }

        async fn fetch_ohlcv(
            &self,
            _symbol: &str,
            _timeframe: &str,
            _since_ms: i64,
            _limit: u32,
        ) -> Result<Vec<CandleRecord>, DataError> {
            Ok(Vec::new())
        }

        async fn fetch_trades(
            &self,
            _symbol: &str,
            _since_ms: i64,
            _limit: u32,
        ) -> Result<Vec<TradeRecord>, DataError> {
            Ok(Vec::new())
        }

        async fn fetch_funding_history(
            &self,
            _symbol: &str,
            _since_ms: i64,
        ) -> Result<Vec<FundingRecord>, DataError> {
            Ok(Vec::new())
        }

        async fn fetch_tickers(&self, _market_type: MarketType) -> Result<Vec<Ticker>, DataError> {
            Ok(vec![
                Ticker { symbol: "ETH/USDT:USDT".into(), last: 1650.0, quote_volume: 900.0 },
                Ticker { symbol: "BTC/USDT:USDT".into(), last: 26000.0, quote_volume: 5000.0 },
                Ticker { symbol: "DOGE/USDT:USDT".into(), last: 0.06, quote_volume: 10.0 },
            ])
        }
    }

    #[tokio::test]
    async fn symbols_filtered_by_market_type() {
        let symbols = get_symbols(&StaticProvider, MarketType::Swap).await.unwrap();
        assert_eq!(symbols, vec!["BTC/USDT:USDT", "ETH/USDT:USDT"]);

        let spot = get_symbols(&StaticProvider, MarketType::Spot).await.unwrap();
        assert_eq!(spot, vec!["BTC/USDT"]);
    }

    #[tokio::test]
    async fn tickers_sorted_desc_and_filtered_by_threshold() {
        let tickers = get_tickers(&StaticProvider, 100.0, MarketType::Swap).await.unwrap();
        let symbols: Vec<&str> = tickers.iter().map(|t| t.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BTC/USDT:USDT", "ETH/USDT:USDT"]);
    }
}
