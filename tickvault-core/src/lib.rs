//! TickVault Core — windowed market-data downloads into a partitioned
//! Parquet archive, and reassembly of arbitrary slices back into one table.
//!
//! The crate is organised around two engines sharing pure utilities:
//! - The fetch engine walks a date range in exchange-appropriate windows,
//!   paginates a rate-limited provider until each window is exhausted, and
//!   persists one Parquet partition per `(kind, symbol, window)` — skipping
//!   windows already archived and replacing ones that were written while
//!   their window was still open.
//! - The query engine maps an `(exchange, kind, symbols?, dates?)` request
//!   back onto partition files and returns a time-ordered, deduplicated
//!   table, treating missing data as an empty table rather than an error.

pub mod bybit;
pub mod fetch;
pub mod limiter;
pub mod load;
pub mod partition;
pub mod provider;
pub mod store;
pub mod window;

pub use bybit::BybitProvider;
pub use fetch::{download, FetchConfig, FetchEngine, FetchSummary};
pub use limiter::RateLimiter;
pub use load::{flatten, load_data, LoadRequest};
pub use partition::DataKind;
pub use provider::{
    get_symbols, get_tickers, CandleRecord, DataError, ExchangeProvider, FundingRecord, Market,
    MarketType, Ticker, TradeRecord,
};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: everything that crosses a pipeline task boundary
    /// is Send + Sync. Pipelines share the provider, limiter and config
    /// across spawned tasks, so a regression here breaks the build loudly.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<RateLimiter>();
        require_sync::<RateLimiter>();
        require_send::<FetchConfig>();
        require_sync::<FetchConfig>();
        require_send::<DataKind>();
        require_sync::<DataKind>();
        require_send::<CandleRecord>();
        require_sync::<CandleRecord>();
        require_send::<TradeRecord>();
        require_sync::<TradeRecord>();
        require_send::<FundingRecord>();
        require_sync::<FundingRecord>();
        require_send::<Market>();
        require_sync::<Market>();
        require_send::<Ticker>();
        require_sync::<Ticker>();
        require_send::<BybitProvider>();
        require_sync::<BybitProvider>();
        require_send::<std::sync::Arc<dyn ExchangeProvider>>();
        require_sync::<std::sync::Arc<dyn ExchangeProvider>>();
    }
}
