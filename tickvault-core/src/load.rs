//! Partition discovery and reassembly.
//!
//! Maps an `(exchange, data kind, symbols?, date range?)` query back onto the
//! set of partition files, loads whichever of them exist, and returns one
//! time-ordered, deduplicated table. Missing files are skipped silently —
//! absence of data is an empty table, never an error. Files that exist but
//! fail to parse are logged and skipped.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};
use polars::prelude::*;
use tracing::{debug, warn};

use crate::partition::{escape, partition_path, partition_prefix, DataKind};
use crate::provider::DataError;
use crate::store;

/// A load query. `symbols` are unified symbols; `start`/`end` bound the
/// half-open date range `[start, end)`; `sub_kind` is the candle timeframe
/// label when loading candles.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub exchange: String,
    pub kind: DataKind,
    pub symbols: Option<Vec<String>>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub sub_kind: Option<String>,
    pub include_incomplete: bool,
}

impl LoadRequest {
    pub fn new(exchange: impl Into<String>, kind: DataKind) -> Self {
        Self {
            exchange: exchange.into(),
            kind,
            symbols: None,
            start: None,
            end: None,
            sub_kind: None,
            include_incomplete: false,
        }
    }
}

/// Load every matching partition under `download_dir` into one table,
/// sorted ascending by timestamp and deduplicated.
pub fn load_data(download_dir: &Path, request: &LoadRequest) -> Result<DataFrame, DataError> {
    let files = resolve_files(download_dir, request)?;

    let mut combined: Option<DataFrame> = None;
    for path in files {
        if !path.exists() {
            // Computed candidate that was never fetched; nothing to load.
            continue;
        }
        let df = match store::read_partition(&path) {
            Ok(df) => df,
            Err(e) => {
                warn!("skipping unreadable partition {}: {e}", path.display());
                continue;
            }
        };
        combined = Some(match combined {
            Some(acc) => match acc.vstack(&df) {
                Ok(stacked) => stacked,
                Err(e) => {
                    warn!("skipping schema-incompatible partition {}: {e}", path.display());
                    acc
                }
            },
            None => df,
        });
    }

    let Some(df) = combined else {
        return Ok(store::empty_frame(request.kind));
    };

    let df = df
        .sort(["timestamp"], SortMultipleOptions::default())
        .map_err(|e| DataError::ValidationError(format!("sort by timestamp: {e}")))?;

    // A query pinned to one symbol dedups on timestamp alone; anything that
    // can mix symbols in one table must keep one row per (timestamp, symbol).
    let single_symbol = matches!(&request.symbols, Some(symbols) if symbols.len() == 1);
    let subset: Vec<String> = if single_symbol {
        vec!["timestamp".to_string()]
    } else {
        vec!["timestamp".to_string(), "symbol".to_string()]
    };
    df.unique_stable(Some(subset.as_slice()), UniqueKeepStrategy::First, None)
        .map_err(|e| DataError::ValidationError(format!("deduplicate: {e}")))
}

/// Resolve the candidate partition paths for a request.
fn resolve_files(download_dir: &Path, request: &LoadRequest) -> Result<Vec<PathBuf>, DataError> {
    let sub_kind = request.sub_kind.as_deref();
    let prefix = partition_prefix(&request.exchange, request.kind, sub_kind);

    match (request.start, request.end, &request.symbols) {
        (Some(start), Some(end), Some(symbols)) => {
            // Exact cross-product of date buckets and symbols; existence is
            // checked by the load step, so never-fetched days drop out.
            let mut files = Vec::new();
            for date in date_range(start, end) {
                for symbol in symbols {
                    let complete = partition_path(
                        download_dir,
                        &request.exchange,
                        request.kind,
                        sub_kind,
                        &date,
                        symbol,
                        false,
                    );
                    if request.include_incomplete && !complete.exists() {
                        let incomplete = partition_path(
                            download_dir,
                            &request.exchange,
                            request.kind,
                            sub_kind,
                            &date,
                            symbol,
                            true,
                        );
                        if incomplete.exists() {
                            debug!(
                                "substituting incomplete partition for missing {}",
                                complete.display()
                            );
                            files.push(incomplete);
                            continue;
                        }
                    }
                    files.push(complete);
                }
            }
            Ok(files)
        }
        (Some(start), Some(end), None) => {
            let dates = date_range(start, end);
            Ok(scan_dir(download_dir, &prefix)?
                .into_iter()
                .filter(|name| dates.iter().any(|date| name.contains(date.as_str())))
                .map(|name| download_dir.join(name))
                .collect())
        }
        (_, _, Some(symbols)) => {
            let suffixes: Vec<String> = symbols
                .iter()
                .map(|s| format!("_{}.parquet", escape(&s.to_lowercase())))
                .collect();
            Ok(scan_dir(download_dir, &prefix)?
                .into_iter()
                .filter(|name| suffixes.iter().any(|suffix| name.ends_with(suffix.as_str())))
                .map(|name| download_dir.join(name))
                .collect())
        }
        (_, _, None) => Ok(scan_dir(download_dir, &prefix)?
            .into_iter()
            .map(|name| download_dir.join(name))
            .collect()),
    }
}

/// File names under `dir` that belong to one series, in sorted order.
/// A missing download directory means nothing has been fetched yet.
fn scan_dir(dir: &Path, prefix: &str) -> Result<Vec<String>, DataError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DataError::StoreError(format!("read dir: {e}"))),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DataError::StoreError(format!("dir entry: {e}")))?;
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(prefix) && name.ends_with(".parquet") {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Daily `YYYY-MM-DD` tokens covering `[start, end)`.
fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<String> {
    let mut dates = Vec::new();
    let mut current = start;
    while current < end {
        dates.push(current.format("%Y-%m-%d").to_string());
        current += Duration::days(1);
    }
    dates
}

/// Pivot a multi-symbol candle table into one column per symbol, indexed by
/// timestamp, forward-filling gaps. A reshaping convenience for analysis
/// code, fed by the output of [`load_data`].
pub fn flatten(df: &DataFrame, value_column: &str) -> Result<DataFrame, DataError> {
    use std::collections::{BTreeMap, BTreeSet};

    let stamps_col = df
        .column("timestamp")
        .map_err(|e| DataError::ValidationError(format!("column read: {e}")))?
        .datetime()
        .map_err(|e| DataError::ValidationError(format!("timestamp column type: {e}")))?
        .clone();
    let symbols = df
        .column("symbol")
        .map_err(|e| DataError::ValidationError(format!("column read: {e}")))?
        .str()
        .map_err(|e| DataError::ValidationError(format!("symbol column type: {e}")))?
        .clone();
    let values = df
        .column(value_column)
        .map_err(|e| DataError::ValidationError(format!("column read: {e}")))?
        .f64()
        .map_err(|e| DataError::ValidationError(format!("value column type: {e}")))?
        .clone();

    let mut all_stamps: BTreeSet<i64> = BTreeSet::new();
    let mut per_symbol: BTreeMap<String, BTreeMap<i64, f64>> = BTreeMap::new();
    for i in 0..df.height() {
        let (Some(stamp), Some(symbol)) = (stamps_col.get(i), symbols.get(i)) else {
            continue;
        };
        all_stamps.insert(stamp);
        let series = per_symbol.entry(symbol.to_string()).or_default();
        if let Some(value) = values.get(i) {
            series.insert(stamp, value);
        }
    }

    let stamps: Vec<i64> = all_stamps.into_iter().collect();
    let mut columns = vec![Column::new("timestamp".into(), stamps.clone())
        .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
        .map_err(|e| DataError::ParquetError(format!("timestamp cast: {e}")))?];
    for (symbol, series) in &per_symbol {
        let mut last_seen: Option<f64> = None;
        let filled: Vec<Option<f64>> = stamps
            .iter()
            .map(|stamp| {
                if let Some(value) = series.get(stamp) {
                    last_seen = Some(*value);
                }
                last_seen
            })
            .collect();
        columns.push(Column::new(symbol.as_str().into(), filled));
    }
    DataFrame::new(columns).map_err(|e| DataError::ValidationError(format!("flatten: {e}")))
}
