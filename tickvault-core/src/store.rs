//! Parquet persistence for partition files.
//!
//! Converts typed record rows into DataFrames (timestamp as a
//! millisecond-precision Datetime column, venue metadata attached) and writes
//! them atomically: write to `.tmp`, rename into place. Reads validate that
//! the file has rows and a `timestamp` column before handing it to the query
//! engine.

use std::fs;
use std::path::Path;

use polars::prelude::*;

use crate::partition::DataKind;
use crate::provider::{CandleRecord, DataError, FundingRecord, TradeRecord};

fn timestamp_dtype() -> DataType {
    DataType::Datetime(TimeUnit::Milliseconds, None)
}

fn timestamp_column(stamps: Vec<i64>) -> Result<Column, DataError> {
    Column::new("timestamp".into(), stamps)
        .cast(&timestamp_dtype())
        .map_err(|e| DataError::ParquetError(format!("timestamp cast: {e}")))
}

/// Write candle rows for one `(exchange, symbol)` partition.
pub fn write_candles(
    path: &Path,
    exchange: &str,
    symbol: &str,
    rows: &[CandleRecord],
) -> Result<(), DataError> {
    if rows.is_empty() {
        return Err(DataError::ValidationError("no rows to persist".into()));
    }
    let df = DataFrame::new(vec![
        timestamp_column(rows.iter().map(|r| r.timestamp).collect())?,
        Column::new("open".into(), rows.iter().map(|r| r.open).collect::<Vec<f64>>()),
        Column::new("high".into(), rows.iter().map(|r| r.high).collect::<Vec<f64>>()),
        Column::new("low".into(), rows.iter().map(|r| r.low).collect::<Vec<f64>>()),
        Column::new("close".into(), rows.iter().map(|r| r.close).collect::<Vec<f64>>()),
        Column::new("volume".into(), rows.iter().map(|r| r.volume).collect::<Vec<f64>>()),
        Column::new("exchange".into(), vec![exchange.to_string(); rows.len()]),
        Column::new("symbol".into(), vec![symbol.to_string(); rows.len()]),
    ])
    .map_err(|e| DataError::ParquetError(format!("dataframe creation: {e}")))?;
    write_atomic(df, path)
}

/// Write trade rows for one partition. Rows carry their own symbol.
pub fn write_trades(path: &Path, exchange: &str, rows: &[TradeRecord]) -> Result<(), DataError> {
    if rows.is_empty() {
        return Err(DataError::ValidationError("no rows to persist".into()));
    }
    let df = DataFrame::new(vec![
        timestamp_column(rows.iter().map(|r| r.timestamp).collect())?,
        Column::new("symbol".into(), rows.iter().map(|r| r.symbol.clone()).collect::<Vec<String>>()),
        Column::new("side".into(), rows.iter().map(|r| r.side.clone()).collect::<Vec<String>>()),
        Column::new("price".into(), rows.iter().map(|r| r.price).collect::<Vec<f64>>()),
        Column::new("amount".into(), rows.iter().map(|r| r.amount).collect::<Vec<f64>>()),
        Column::new("cost".into(), rows.iter().map(|r| r.cost).collect::<Vec<f64>>()),
        Column::new("fee".into(), rows.iter().map(|r| r.fee).collect::<Vec<f64>>()),
        Column::new("exchange".into(), vec![exchange.to_string(); rows.len()]),
    ])
    .map_err(|e| DataError::ParquetError(format!("dataframe creation: {e}")))?;
    write_atomic(df, path)
}

/// Write funding-rate rows for one partition.
pub fn write_funding(path: &Path, exchange: &str, rows: &[FundingRecord]) -> Result<(), DataError> {
    if rows.is_empty() {
        return Err(DataError::ValidationError("no rows to persist".into()));
    }
    let df = DataFrame::new(vec![
        timestamp_column(rows.iter().map(|r| r.timestamp).collect())?,
        Column::new("symbol".into(), rows.iter().map(|r| r.symbol.clone()).collect::<Vec<String>>()),
        Column::new("funding_rate".into(), rows.iter().map(|r| r.funding_rate).collect::<Vec<f64>>()),
        Column::new("exchange".into(), vec![exchange.to_string(); rows.len()]),
    ])
    .map_err(|e| DataError::ParquetError(format!("dataframe creation: {e}")))?;
    write_atomic(df, path)
}

/// Atomic Parquet write: write to `.tmp`, then rename into place.
fn write_atomic(mut df: DataFrame, path: &Path) -> Result<(), DataError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| DataError::StoreError(format!("failed to create dir: {e}")))?;
    }
    let tmp_path = path.with_extension("parquet.tmp");
    let file = fs::File::create(&tmp_path)
        .map_err(|e| DataError::ParquetError(format!("create file: {e}")))?;
    ParquetWriter::new(file)
        .finish(&mut df)
        .map_err(|e| DataError::ParquetError(format!("write parquet: {e}")))?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        DataError::StoreError(format!("atomic rename failed: {e}"))
    })?;
    Ok(())
}

/// Read one partition file and validate its basic shape.
pub fn read_partition(path: &Path) -> Result<DataFrame, DataError> {
    let file =
        fs::File::open(path).map_err(|e| DataError::ParquetError(format!("open: {e}")))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| DataError::ParquetError(format!("read: {e}")))?;
    if df.height() == 0 {
        return Err(DataError::ValidationError("empty parquet file".into()));
    }
    if df.column("timestamp").is_err() {
        return Err(DataError::ValidationError("missing column 'timestamp'".into()));
    }
    Ok(df)
}

/// A zero-row frame with the well-defined column schema of `kind`, returned
/// by the query engine when no partition matched.
pub fn empty_frame(kind: DataKind) -> DataFrame {
    let ts = Field::new("timestamp".into(), timestamp_dtype());
    let fields = match kind {
        DataKind::Candles => vec![
            ts,
            Field::new("open".into(), DataType::Float64),
            Field::new("high".into(), DataType::Float64),
            Field::new("low".into(), DataType::Float64),
            Field::new("close".into(), DataType::Float64),
            Field::new("volume".into(), DataType::Float64),
            Field::new("exchange".into(), DataType::String),
            Field::new("symbol".into(), DataType::String),
        ],
        DataKind::Trades => vec![
            ts,
            Field::new("symbol".into(), DataType::String),
            Field::new("side".into(), DataType::String),
            Field::new("price".into(), DataType::Float64),
            Field::new("amount".into(), DataType::Float64),
            Field::new("cost".into(), DataType::Float64),
            Field::new("fee".into(), DataType::Float64),
            Field::new("exchange".into(), DataType::String),
        ],
        DataKind::Funding => vec![
            ts,
            Field::new("symbol".into(), DataType::String),
            Field::new("funding_rate".into(), DataType::Float64),
            Field::new("exchange".into(), DataType::String),
        ],
    };
    DataFrame::empty_with_schema(&Schema::from_iter(fields))
}

/// Extract the `timestamp` column as Unix milliseconds.
pub fn timestamps_ms(df: &DataFrame) -> Result<Vec<i64>, DataError> {
    let column = df
        .column("timestamp")
        .map_err(|e| DataError::ValidationError(format!("column read: {e}")))?;
    let ca = column
        .datetime()
        .map_err(|e| DataError::ValidationError(format!("timestamp column type: {e}")))?;
    Ok(ca.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = env::temp_dir().join(format!("tickvault_store_{}_{id}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sample_candles() -> Vec<CandleRecord> {
        vec![
            CandleRecord {
                timestamp: 1_693_526_400_000,
                open: 100.0,
                high: 102.0,
                low: 99.0,
                close: 101.0,
                volume: 10.0,
            },
            CandleRecord {
                timestamp: 1_693_526_460_000,
                open: 101.0,
                high: 103.0,
                low: 100.0,
                close: 102.0,
                volume: 11.0,
            },
        ]
    }

    #[test]
    fn candle_write_read_roundtrip() {
        let dir = temp_dir();
        let path = dir.join("x_1m_candles_2023-09-01_btc%2Fusdt.parquet");

        write_candles(&path, "bybit", "BTC/USDT", &sample_candles()).unwrap();
        let df = read_partition(&path).unwrap();

        assert_eq!(df.height(), 2);
        assert_eq!(
            timestamps_ms(&df).unwrap(),
            vec![1_693_526_400_000, 1_693_526_460_000]
        );
        assert_eq!(df.column("open").unwrap().f64().unwrap().get(0), Some(100.0));
        assert_eq!(
            df.column("exchange").unwrap().str().unwrap().get(0),
            Some("bybit")
        );
        assert_eq!(
            df.column("symbol").unwrap().str().unwrap().get(1),
            Some("BTC/USDT")
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn trades_roundtrip_keeps_repeated_timestamps() {
        let dir = temp_dir();
        let path = dir.join("x_trades_2023-09-01_btc%2Fusdt.parquet");
        let rows = vec![
            TradeRecord {
                timestamp: 1_693_526_400_123,
                symbol: "BTC/USDT".into(),
                side: "buy".into(),
                price: 26_000.0,
                amount: 0.5,
                cost: 13_000.0,
                fee: 0.0,
            },
            TradeRecord {
                timestamp: 1_693_526_400_123,
                symbol: "BTC/USDT".into(),
                side: "sell".into(),
                price: 26_001.0,
                amount: 0.1,
                cost: 2_600.1,
                fee: 0.0,
            },
        ];

        write_trades(&path, "bybit", &rows).unwrap();
        let df = read_partition(&path).unwrap();

        assert_eq!(df.height(), 2);
        assert_eq!(df.column("side").unwrap().str().unwrap().get(1), Some("sell"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn funding_roundtrip() {
        let dir = temp_dir();
        let path = dir.join("x_funding_2023-09-01_btc%2Fusdt%3Ausdt.parquet");
        let rows = vec![FundingRecord {
            timestamp: 1_693_526_400_000,
            symbol: "BTC/USDT:USDT".into(),
            funding_rate: 0.0001,
        }];

        write_funding(&path, "bybit", &rows).unwrap();
        let df = read_partition(&path).unwrap();

        assert_eq!(df.height(), 1);
        assert_eq!(
            df.column("funding_rate").unwrap().f64().unwrap().get(0),
            Some(0.0001)
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_row_set_is_rejected() {
        let dir = temp_dir();
        let path = dir.join("x_1m_candles_2023-09-01_btc%2Fusdt.parquet");

        let result = write_candles(&path, "bybit", "BTC/USDT", &[]);
        assert!(matches!(result, Err(DataError::ValidationError(_))));
        assert!(!path.exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let dir = temp_dir();
        let path = dir.join("x_1m_candles_2023-09-01_btc%2Fusdt.parquet");

        write_candles(&path, "bybit", "BTC/USDT", &sample_candles()).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("parquet.tmp").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_file_fails_to_read() {
        let dir = temp_dir();
        let path = dir.join("x_1m_candles_2023-09-01_btc%2Fusdt.parquet");
        fs::write(&path, b"not a parquet file").unwrap();

        assert!(matches!(
            read_partition(&path),
            Err(DataError::ParquetError(_))
        ));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_frames_carry_kind_schemas() {
        let candles = empty_frame(DataKind::Candles);
        assert_eq!(candles.height(), 0);
        assert!(candles.column("close").is_ok());
        assert!(candles.column("symbol").is_ok());

        let trades = empty_frame(DataKind::Trades);
        assert!(trades.column("side").is_ok());

        let funding = empty_frame(DataKind::Funding);
        assert!(funding.column("funding_rate").is_ok());
    }
}
