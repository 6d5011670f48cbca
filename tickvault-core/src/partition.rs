//! Partition identity and file naming.
//!
//! A partition is one Parquet file covering a single symbol, data kind and
//! aligned time window. Everything about a partition's identity — including
//! whether it was written while its window was still open — is encoded in
//! the file name:
//!
//! `{exchange}_{subkind_}{kind}_{date}_{symbol}[_incomplete].parquet`
//!
//! Textual components are lower-cased and the symbol separators `/` and `:`
//! are percent-escaped so any exchange symbol survives as a file name. A `*`
//! component passes through untouched, which keeps the same builder usable
//! for discovery patterns.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};

/// The kinds of market data the archive knows how to partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    /// OHLCV candlestick bars at a named timeframe.
    Candles,
    /// Individual trade prints.
    Trades,
    /// Funding-rate history for perpetual swaps.
    Funding,
}

impl DataKind {
    pub const ALL: [DataKind; 3] = [DataKind::Candles, DataKind::Trades, DataKind::Funding];

    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::Candles => "candles",
            DataKind::Trades => "trades",
            DataKind::Funding => "funding",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CONVERSIONS: [(&str, &str); 2] = [("/", "%2F"), (":", "%3A")];

/// Escape symbol separators so the string can be used in a file name.
pub fn escape(s: &str) -> String {
    CONVERSIONS
        .iter()
        .fold(s.to_string(), |acc, (raw, sub)| acc.replace(raw, sub))
}

/// The exact inverse of [`escape`].
pub fn unescape(s: &str) -> String {
    CONVERSIONS
        .iter()
        .fold(s.to_string(), |acc, (raw, sub)| acc.replace(sub, raw))
}

fn component(s: &str) -> String {
    if s == "*" {
        return s.to_string();
    }
    escape(&s.to_lowercase())
}

/// Format a partition period start as the date token used in file names.
pub fn date_token(period_start: DateTime<Utc>) -> String {
    period_start.format("%Y-%m-%d").to_string()
}

/// Build a partition file name.
///
/// `date` is either a `YYYY-MM-DD` token or `*`; `symbol` is the unified
/// symbol (e.g. `BTC/USDT:USDT`) or `*`.
pub fn partition_file_name(
    exchange: &str,
    kind: DataKind,
    sub_kind: Option<&str>,
    date: &str,
    symbol: &str,
    incomplete: bool,
) -> String {
    let sub = sub_kind
        .map(|s| format!("{}_", component(s)))
        .unwrap_or_default();
    let suffix = if incomplete { "_incomplete" } else { "" };
    format!(
        "{}_{}{}_{}_{}{}.parquet",
        component(exchange),
        sub,
        kind.as_str(),
        date,
        component(symbol),
        suffix,
    )
}

/// Build the full path of a partition file under `dir`.
pub fn partition_path(
    dir: &Path,
    exchange: &str,
    kind: DataKind,
    sub_kind: Option<&str>,
    date: &str,
    symbol: &str,
    incomplete: bool,
) -> PathBuf {
    dir.join(partition_file_name(exchange, kind, sub_kind, date, symbol, incomplete))
}

/// The shared `{exchange}_{subkind_}{kind}_` file-name prefix of a series,
/// used when scanning the download directory for matching partitions.
pub fn partition_prefix(exchange: &str, kind: DataKind, sub_kind: Option<&str>) -> String {
    let sub = sub_kind
        .map(|s| format!("{}_", component(s)))
        .unwrap_or_default();
    format!("{}_{}{}_", component(exchange), sub, kind.as_str())
}

/// Whether a partition window still contains `now`.
///
/// A partition written while this holds is named `_incomplete` and replaced
/// wholesale by the next fetch covering the same window. The flag is derived
/// from the wall clock at write time and again at load time rather than
/// persisted, so a partition written in the final instants of its window can
/// be judged differently by a later reader; the replace-on-refetch policy
/// makes that harmless.
pub fn window_is_open(period_start: DateTime<Utc>, window: Duration, now: DateTime<Utc>) -> bool {
    period_start <= now && now < period_start + window
}
