//! Bybit exchange provider over the public v5 REST API.
//!
//! Covers the market-data endpoints the fetch engine needs: instrument
//! metadata, paginated klines, recent trades, funding-rate history and 24h
//! tickers. No authentication — these are all public endpoints.
//!
//! Symbols use the unified `BASE/QUOTE[:SETTLE]` form everywhere outside this
//! module; the settle suffix selects the linear-derivatives category, its
//! absence the spot category.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::provider::{
    CandleRecord, DataError, ExchangeProvider, FundingRecord, Market, MarketType, Ticker,
    TradeRecord,
};

const DEFAULT_BASE_URL: &str = "https://api.bybit.com";

/// Bybit market-data client.
pub struct BybitProvider {
    client: reqwest::Client,
    base_url: String,
}

impl BybitProvider {
    pub fn new() -> Result<Self, DataError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Point the client at a different host. Used to exercise the provider
    /// against a local stub server.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, DataError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("tickvault/0.1")
            .build()
            .map_err(|e| DataError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, base_url: base_url.into() })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, DataError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).query(query).send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                DataError::NetworkUnreachable(e.to_string())
            } else {
                DataError::Provider(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(DataError::Provider(format!("HTTP {status} from {path}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| DataError::ResponseFormatChanged(format!("{path}: {e}")))
    }

    async fn instruments(&self, category: &str) -> Result<Vec<Instrument>, DataError> {
        let response: V5Response<InstrumentResult> = self
            .get_json(
                "/v5/market/instruments-info",
                &[("category", category.to_string()), ("limit", "1000".to_string())],
            )
            .await?;
        Ok(unwrap_result(response, "instruments-info")?.list)
    }
}

#[async_trait]
impl ExchangeProvider for BybitProvider {
    fn exchange_id(&self) -> &str {
        "bybit"
    }

    async fn load_markets(&self) -> Result<Vec<Market>, DataError> {
        let mut markets = Vec::new();
        for category in ["spot", "linear"] {
            for instrument in self.instruments(category).await? {
                if !instrument.is_trading() {
                    continue;
                }
                markets.push(Market {
                    symbol: instrument.unified_symbol(category),
                    market_type: instrument.market_type(category),
                });
            }
        }
        Ok(markets)
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since_ms: i64,
        limit: u32,
    ) -> Result<Vec<CandleRecord>, DataError> {
        let interval = bybit_interval(timeframe)?;
        let market = exchange_symbol(symbol);
        let response: V5Response<KlineResult> = self
            .get_json(
                "/v5/market/kline",
                &[
                    ("category", market.category.to_string()),
                    ("symbol", market.symbol),
                    ("interval", interval.to_string()),
                    ("start", since_ms.to_string()),
                    ("limit", limit.min(1000).to_string()),
                ],
            )
            .await?;
        parse_klines(unwrap_result(response, "kline")?)
    }

    /// Bybit's public REST surface only exposes *recent* trades — there is no
    /// time cursor, so `since_ms` cannot be honoured here. The fetch engine's
    /// window trim drops anything outside the requested day regardless.
    async fn fetch_trades(
        &self,
        symbol: &str,
        _since_ms: i64,
        limit: u32,
    ) -> Result<Vec<TradeRecord>, DataError> {
        let market = exchange_symbol(symbol);
        let response: V5Response<TradeResult> = self
            .get_json(
                "/v5/market/recent-trade",
                &[
                    ("category", market.category.to_string()),
                    ("symbol", market.symbol),
                    ("limit", limit.min(1000).to_string()),
                ],
            )
            .await?;
        parse_trades(unwrap_result(response, "recent-trade")?, symbol)
    }

    async fn fetch_funding_history(
        &self,
        symbol: &str,
        since_ms: i64,
    ) -> Result<Vec<FundingRecord>, DataError> {
        let market = exchange_symbol(symbol);
        if market.category != "linear" {
            return Err(DataError::Configuration(format!(
                "funding history requires a swap symbol, got '{symbol}'"
            )));
        }
        let response: V5Response<FundingResult> = self
            .get_json(
                "/v5/market/funding/history",
                &[
                    ("category", market.category.to_string()),
                    ("symbol", market.symbol),
                    ("startTime", since_ms.to_string()),
                    ("limit", "200".to_string()),
                ],
            )
            .await?;
        parse_funding(unwrap_result(response, "funding/history")?, symbol)
    }

    async fn fetch_tickers(&self, market_type: MarketType) -> Result<Vec<Ticker>, DataError> {
        let category = match market_type {
            MarketType::Spot => "spot",
            MarketType::Swap | MarketType::Future => "linear",
        };
        let by_exchange_symbol: HashMap<String, Market> = self
            .instruments(category)
            .await?
            .into_iter()
            .map(|i| {
                (
                    i.symbol.clone(),
                    Market {
                        symbol: i.unified_symbol(category),
                        market_type: i.market_type(category),
                    },
                )
            })
            .collect();

        let response: V5Response<TickerResult> = self
            .get_json("/v5/market/tickers", &[("category", category.to_string())])
            .await?;
        let mut tickers = Vec::new();
        for raw in unwrap_result(response, "tickers")?.list {
            let Some(market) = by_exchange_symbol.get(&raw.symbol) else {
                debug!("skipping ticker for unlisted symbol {}", raw.symbol);
                continue;
            };
            if market.market_type != market_type {
                continue;
            }
            let (Ok(last), Ok(quote_volume)) =
                (raw.last_price.parse::<f64>(), raw.turnover_24h.parse::<f64>())
            else {
                debug!("skipping ticker with non-numeric fields for {}", raw.symbol);
                continue;
            };
            tickers.push(Ticker { symbol: market.symbol.clone(), last, quote_volume });
        }
        Ok(tickers)
    }
}

// ── Wire models ─────────────────────────────────────────────────────

/// Envelope every v5 endpoint responds with.
#[derive(Debug, Deserialize)]
struct V5Response<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: T,
}

fn unwrap_result<T>(response: V5Response<T>, endpoint: &str) -> Result<T, DataError> {
    if response.ret_code != 0 {
        return Err(DataError::Provider(format!(
            "{endpoint}: {} (retCode {})",
            response.ret_msg, response.ret_code
        )));
    }
    Ok(response.result)
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    /// Kline rows as positional string arrays, newest first:
    /// `[startTime, open, high, low, close, volume, turnover]`
    list: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct InstrumentResult {
    list: Vec<Instrument>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instrument {
    symbol: String,
    base_coin: String,
    quote_coin: String,
    #[serde(default)]
    settle_coin: Option<String>,
    #[serde(default)]
    contract_type: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl Instrument {
    fn is_trading(&self) -> bool {
        self.status.as_deref().map_or(true, |s| s == "Trading")
    }

    fn unified_symbol(&self, category: &str) -> String {
        if category == "linear" {
            let settle = self.settle_coin.as_deref().unwrap_or(&self.quote_coin);
            format!("{}/{}:{}", self.base_coin, self.quote_coin, settle)
        } else {
            format!("{}/{}", self.base_coin, self.quote_coin)
        }
    }

    fn market_type(&self, category: &str) -> MarketType {
        if category != "linear" {
            return MarketType::Spot;
        }
        match self.contract_type.as_deref() {
            Some(contract) if contract.contains("Futures") => MarketType::Future,
            _ => MarketType::Swap,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TradeResult {
    list: Vec<BybitTrade>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitTrade {
    side: String,
    size: String,
    price: String,
    time: String,
}

#[derive(Debug, Deserialize)]
struct FundingResult {
    list: Vec<BybitFunding>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitFunding {
    funding_rate: String,
    funding_rate_timestamp: String,
}

#[derive(Debug, Deserialize)]
struct TickerResult {
    list: Vec<BybitTicker>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitTicker {
    symbol: String,
    last_price: String,
    turnover_24h: String,
}

// ── Mapping helpers ─────────────────────────────────────────────────

struct ExchangeSymbol {
    category: &'static str,
    symbol: String,
}

/// `BTC/USDT:USDT` → linear `BTCUSDT`; `BTC/USDT` → spot `BTCUSDT`.
fn exchange_symbol(unified: &str) -> ExchangeSymbol {
    let (pair, linear) = match unified.split_once(':') {
        Some((pair, _settle)) => (pair, true),
        None => (unified, false),
    };
    ExchangeSymbol {
        category: if linear { "linear" } else { "spot" },
        symbol: pair.replace('/', "").to_uppercase(),
    }
}

/// Map a timeframe label onto Bybit's kline interval codes.
fn bybit_interval(timeframe: &str) -> Result<&'static str, DataError> {
    Ok(match timeframe {
        "1m" => "1",
        "3m" => "3",
        "5m" => "5",
        "15m" => "15",
        "30m" => "30",
        "1h" => "60",
        "2h" => "120",
        "4h" => "240",
        "6h" => "360",
        "12h" => "720",
        "1d" => "D",
        "1w" => "W",
        _ => return Err(DataError::UnsupportedTimeframe(timeframe.to_string())),
    })
}

fn kline_field(row: &[String], idx: usize, name: &str) -> Result<f64, DataError> {
    row.get(idx)
        .ok_or_else(|| DataError::ResponseFormatChanged(format!("kline missing {name}")))?
        .parse()
        .map_err(|_| DataError::ResponseFormatChanged(format!("kline {name} is not a number")))
}

fn parse_klines(result: KlineResult) -> Result<Vec<CandleRecord>, DataError> {
    let mut rows = Vec::with_capacity(result.list.len());
    for raw in &result.list {
        let timestamp: i64 = raw
            .first()
            .ok_or_else(|| DataError::ResponseFormatChanged("empty kline row".into()))?
            .parse()
            .map_err(|_| {
                DataError::ResponseFormatChanged("kline start time is not a number".into())
            })?;
        rows.push(CandleRecord {
            timestamp,
            open: kline_field(raw, 1, "open")?,
            high: kline_field(raw, 2, "high")?,
            low: kline_field(raw, 3, "low")?,
            close: kline_field(raw, 4, "close")?,
            volume: kline_field(raw, 5, "volume")?,
        });
    }
    // Bybit returns klines newest first; the engine needs ascending rows.
    rows.sort_by_key(|r| r.timestamp);
    Ok(rows)
}

fn parse_trades(result: TradeResult, unified_symbol: &str) -> Result<Vec<TradeRecord>, DataError> {
    let mut rows = Vec::with_capacity(result.list.len());
    for raw in result.list {
        let timestamp: i64 = raw.time.parse().map_err(|_| {
            DataError::ResponseFormatChanged("trade time is not a number".into())
        })?;
        let price: f64 = raw.price.parse().map_err(|_| {
            DataError::ResponseFormatChanged("trade price is not a number".into())
        })?;
        let amount: f64 = raw.size.parse().map_err(|_| {
            DataError::ResponseFormatChanged("trade size is not a number".into())
        })?;
        rows.push(TradeRecord {
            timestamp,
            symbol: unified_symbol.to_string(),
            side: raw.side.to_lowercase(),
            price,
            amount,
            cost: price * amount,
            fee: 0.0,
        });
    }
    rows.sort_by_key(|r| r.timestamp);
    Ok(rows)
}

fn parse_funding(
    result: FundingResult,
    unified_symbol: &str,
) -> Result<Vec<FundingRecord>, DataError> {
    let mut rows = Vec::with_capacity(result.list.len());
    for raw in result.list {
        let timestamp: i64 = raw.funding_rate_timestamp.parse().map_err(|_| {
            DataError::ResponseFormatChanged("funding timestamp is not a number".into())
        })?;
        let funding_rate: f64 = raw.funding_rate.parse().map_err(|_| {
            DataError::ResponseFormatChanged("funding rate is not a number".into())
        })?;
        rows.push(FundingRecord { timestamp, symbol: unified_symbol.to_string(), funding_rate });
    }
    rows.sort_by_key(|r| r.timestamp);
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unified_symbols_map_to_categories() {
        let linear = exchange_symbol("BTC/USDT:USDT");
        assert_eq!(linear.category, "linear");
        assert_eq!(linear.symbol, "BTCUSDT");

        let spot = exchange_symbol("eth/usdt");
        assert_eq!(spot.category, "spot");
        assert_eq!(spot.symbol, "ETHUSDT");
    }

    #[test]
    fn interval_mapping() {
        assert_eq!(bybit_interval("1m").unwrap(), "1");
        assert_eq!(bybit_interval("1h").unwrap(), "60");
        assert_eq!(bybit_interval("4h").unwrap(), "240");
        assert_eq!(bybit_interval("1d").unwrap(), "D");
        assert!(matches!(bybit_interval("2x"), Err(DataError::UnsupportedTimeframe(_))));
    }

    #[test]
    fn parses_kline_response_ascending() {
        let json = r#"{
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "symbol": "BTCUSDT",
                "category": "linear",
                "list": [
                    ["1672502400000", "16800.00", "16900.50", "16750.00", "16850.00", "1234.56", "20800000.00"],
                    ["1672416000000", "16700.00", "16850.00", "16650.00", "16800.00", "2345.67", "39300000.00"]
                ]
            }
        }"#;

        let response: V5Response<KlineResult> = serde_json::from_str(json).unwrap();
        let rows = parse_klines(unwrap_result(response, "kline").unwrap()).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, 1672416000000);
        assert_eq!(rows[1].timestamp, 1672502400000);
        assert!((rows[1].open - 16800.0).abs() < 1e-9);
        assert!((rows[1].volume - 1234.56).abs() < 1e-9);
    }

    #[test]
    fn malformed_kline_is_a_format_error() {
        let result = KlineResult {
            list: vec![vec!["1672502400000".to_string(), "not_a_number".to_string()]],
        };
        assert!(matches!(parse_klines(result), Err(DataError::ResponseFormatChanged(_))));
    }

    #[test]
    fn nonzero_ret_code_is_a_provider_error() {
        let json = r#"{
            "retCode": 10001,
            "retMsg": "params error",
            "result": {"list": []}
        }"#;
        let response: V5Response<KlineResult> = serde_json::from_str(json).unwrap();
        assert!(matches!(unwrap_result(response, "kline"), Err(DataError::Provider(_))));
    }

    #[test]
    fn parses_trade_response() {
        let json = r#"{
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "category": "linear",
                "list": [
                    {"execId": "a", "symbol": "BTCUSDT", "price": "26000.5", "size": "0.25", "side": "Buy", "time": "1693526400123", "isBlockTrade": false},
                    {"execId": "b", "symbol": "BTCUSDT", "price": "26001.0", "size": "0.10", "side": "Sell", "time": "1693526400000", "isBlockTrade": false}
                ]
            }
        }"#;

        let response: V5Response<TradeResult> = serde_json::from_str(json).unwrap();
        let rows = parse_trades(unwrap_result(response, "recent-trade").unwrap(), "BTC/USDT:USDT")
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, 1693526400000);
        assert_eq!(rows[0].side, "sell");
        assert_eq!(rows[1].symbol, "BTC/USDT:USDT");
        assert!((rows[1].cost - 26000.5 * 0.25).abs() < 1e-9);
    }

    #[test]
    fn parses_funding_response() {
        let json = r#"{
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "category": "linear",
                "list": [
                    {"symbol": "BTCUSDT", "fundingRate": "0.0001", "fundingRateTimestamp": "1693555200000"},
                    {"symbol": "BTCUSDT", "fundingRate": "-0.00005", "fundingRateTimestamp": "1693526400000"}
                ]
            }
        }"#;

        let response: V5Response<FundingResult> = serde_json::from_str(json).unwrap();
        let rows = parse_funding(unwrap_result(response, "funding/history").unwrap(), "BTC/USDT:USDT")
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, 1693526400000);
        assert!((rows[0].funding_rate + 0.00005).abs() < 1e-12);
    }

    #[test]
    fn instrument_unified_symbols() {
        let json = r#"{
            "symbol": "BTCUSDT",
            "baseCoin": "BTC",
            "quoteCoin": "USDT",
            "settleCoin": "USDT",
            "contractType": "LinearPerpetual",
            "status": "Trading"
        }"#;
        let instrument: Instrument = serde_json::from_str(json).unwrap();

        assert_eq!(instrument.unified_symbol("linear"), "BTC/USDT:USDT");
        assert_eq!(instrument.market_type("linear"), MarketType::Swap);
        assert_eq!(instrument.unified_symbol("spot"), "BTC/USDT");
        assert_eq!(instrument.market_type("spot"), MarketType::Spot);
        assert!(instrument.is_trading());
    }
}
