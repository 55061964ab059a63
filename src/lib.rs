//! Relative strength of NSE sector indices and ETFs against a benchmark,
//! with completeness checks on every run and a persisted refresh log.

pub mod analyzer;
pub mod candles;
pub mod clock;
pub mod error;
pub mod etf;
pub mod market_data;
pub mod market_hours;
pub mod refresh_tracker;
pub mod relative_strength;
pub mod report;
pub mod retry;
pub mod storage_utils;
pub mod validator;

pub use analyzer::{AnalysisContext, AnalysisOutcome, Category, InstrumentRef, RsPeriods, RsResult, SectorAnalyzer};
pub use error::{ConfigError, FetchError};
pub use market_data::{AngelOneClient, BrokerCredentials, CandleSource};
pub use refresh_tracker::{DatasetKey, Freshness, RefreshRecord, RefreshStatus, RefreshTracker};
pub use storage_utils::{AppConfig, AsyncStorageManager};
pub use validator::{Completeness, check_completeness, enforce_complete};
