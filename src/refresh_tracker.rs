//! Last-refresh bookkeeping per dataset, shared by every process that reads
//! or refreshes the analysis results.

use crate::candles::deserialize_f64_lenient;
use crate::clock::{Clock, SystemClock, ist};
use crate::storage_utils::AsyncStorageManager;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const NEVER: &str = "Never";
const TZ_SUFFIX: &str = "IST";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

static TZ_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*IST\b").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKey {
    Sectors,
    Etfs,
    Comprehensive,
}

impl DatasetKey {
    pub const ALL: [DatasetKey; 3] = [Self::Sectors, Self::Etfs, Self::Comprehensive];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sectors => "sectors",
            Self::Etfs => "etfs",
            Self::Comprehensive => "comprehensive",
        }
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshStatus {
    Success,
    Failed,
    Unknown,
}

impl RefreshStatus {
    fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "success" => Self::Success,
            "failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    Stale,
    Unknown,
}

impl Freshness {
    fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fresh" => Self::Fresh,
            "stale" => Self::Stale,
            _ => Self::Unknown,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshRecord {
    pub dataset: DatasetKey,
    /// `YYYY-MM-DD HH:MM IST`, or `Never`.
    pub last_refresh: String,
    pub status: RefreshStatus,
    pub count: u64,
    pub freshness: Freshness,
}

impl RefreshRecord {
    pub fn never(dataset: DatasetKey) -> Self {
        Self {
            dataset,
            last_refresh: NEVER.to_string(),
            status: RefreshStatus::Unknown,
            count: 0,
            freshness: Freshness::Unknown,
        }
    }

    pub fn last_refresh_at(&self) -> Option<DateTime<FixedOffset>> {
        parse_timestamp(&self.last_refresh)
    }
}

/// On-disk shape of one record. Every field is optional so a hand-edited or
/// half-migrated file still loads.
#[derive(Debug, Default, Deserialize)]
struct StoredRecord {
    #[serde(default)]
    last_refresh: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, deserialize_with = "deserialize_f64_lenient")]
    count: Option<f64>,
    #[serde(default)]
    freshness: Option<String>,
}

impl StoredRecord {
    fn into_record(self, dataset: DatasetKey) -> RefreshRecord {
        RefreshRecord {
            dataset,
            last_refresh: clean_timestamp(self.last_refresh.as_deref().unwrap_or(NEVER)),
            status: self
                .status
                .as_deref()
                .map_or(RefreshStatus::Unknown, RefreshStatus::parse_lenient),
            count: self
                .count
                .filter(|c| c.is_finite() && *c >= 0.0)
                .map_or(0, |c| c as u64),
            freshness: self
                .freshness
                .as_deref()
                .map_or(Freshness::Unknown, Freshness::parse_lenient),
        }
    }
}

/// Collapses any number of timezone suffixes into exactly one. Applying it
/// to its own output changes nothing.
pub fn clean_timestamp(raw: &str) -> String {
    let stripped = TZ_SUFFIX_RE.replace_all(raw, "");
    let stripped = stripped.trim();
    if stripped.is_empty() || stripped.eq_ignore_ascii_case(NEVER) {
        return NEVER.to_string();
    }
    format!("{stripped} {TZ_SUFFIX}")
}

pub fn format_timestamp(at: DateTime<FixedOffset>) -> String {
    format!("{} {}", at.format(TIMESTAMP_FORMAT), TZ_SUFFIX)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let cleaned = clean_timestamp(raw);
    if cleaned == NEVER {
        return None;
    }
    let bare = TZ_SUFFIX_RE.replace_all(&cleaned, "");
    let bare = bare.trim();
    let naive = NaiveDateTime::parse_from_str(bare, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(bare, "%Y-%m-%d %H:%M:%S"))
        .ok()?;
    ist().from_local_datetime(&naive).single()
}

/// Persistence for the record set. Implementations replace the whole set on
/// save; partial writes must never be observable.
#[async_trait]
pub trait RefreshStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    async fn load(&self) -> anyhow::Result<Option<BTreeMap<String, Value>>>;
    async fn save(&self, records: &BTreeMap<String, Value>) -> anyhow::Result<()>;
}

/// One JSON file, replaced by temp-file rename on every write.
pub struct JsonFileStore {
    storage: AsyncStorageManager,
    name: String,
}

impl JsonFileStore {
    pub fn new(storage: AsyncStorageManager, name: impl Into<String>) -> Self {
        Self {
            storage,
            name: name.into(),
        }
    }
}

#[async_trait]
impl RefreshStore for JsonFileStore {
    async fn load(&self) -> anyhow::Result<Option<BTreeMap<String, Value>>> {
        self.storage.load_optional(&self.name).await
    }

    async fn save(&self, records: &BTreeMap<String, Value>) -> anyhow::Result<()> {
        self.storage.save(&self.name, records).await
    }
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Option<BTreeMap<String, Value>>>,
}

#[async_trait]
impl RefreshStore for MemoryStore {
    async fn load(&self) -> anyhow::Result<Option<BTreeMap<String, Value>>> {
        Ok(self.records.lock().await.clone())
    }

    async fn save(&self, records: &BTreeMap<String, Value>) -> anyhow::Result<()> {
        *self.records.lock().await = Some(records.clone());
        Ok(())
    }
}

pub struct RefreshTracker<S, C = SystemClock> {
    store: S,
    clock: C,
    write_lock: Mutex<()>,
}

impl<S: RefreshStore> RefreshTracker<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, SystemClock)
    }
}

impl<S: RefreshStore, C: Clock> RefreshTracker<S, C> {
    pub fn with_clock(store: S, clock: C) -> Self {
        Self {
            store,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// Unreadable storage reads as empty.
    async fn load_all(&self) -> BTreeMap<String, Value> {
        match self.store.load().await {
            Ok(Some(records)) => records,
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!(error = %e, "refresh tracker storage unreadable, treating as never refreshed");
                BTreeMap::new()
            }
        }
    }

    /// Overwrites the record for `dataset` with the current time. Freshly
    /// written records are always `fresh`.
    pub async fn record_refresh(
        &self,
        dataset: DatasetKey,
        status: RefreshStatus,
        count: u64,
    ) -> anyhow::Result<RefreshRecord> {
        let record = RefreshRecord {
            dataset,
            last_refresh: format_timestamp(self.clock.now_ist()),
            status,
            count,
            freshness: Freshness::Fresh,
        };

        let _guard = self.write_lock.lock().await;
        let mut records = self.load_all().await;
        records.insert(
            dataset.as_str().to_string(),
            serde_json::json!({
                "last_refresh": record.last_refresh,
                "status": record.status.as_str(),
                "count": record.count,
                "freshness": record.freshness.as_str(),
            }),
        );
        self.store.save(&records).await?;

        info!(
            dataset = %dataset,
            status = record.status.as_str(),
            count,
            at = %record.last_refresh,
            "recorded refresh"
        );
        Ok(record)
    }

    pub async fn get_status(&self, dataset: DatasetKey) -> RefreshRecord {
        let mut records = self.load_all().await;
        let Some(raw) = records.remove(dataset.as_str()) else {
            return RefreshRecord::never(dataset);
        };
        match serde_json::from_value::<StoredRecord>(raw) {
            Ok(stored) => stored.into_record(dataset),
            Err(e) => {
                warn!(dataset = %dataset, error = %e, "malformed refresh record");
                RefreshRecord::never(dataset)
            }
        }
    }

    pub async fn all_statuses(&self) -> Vec<RefreshRecord> {
        let mut out = Vec::with_capacity(DatasetKey::ALL.len());
        for key in DatasetKey::ALL {
            out.push(self.get_status(key).await);
        }
        out
    }

    pub async fn last_refresh_at(&self, dataset: DatasetKey) -> Option<DateTime<FixedOffset>> {
        let record = self.get_status(dataset).await;
        let parsed = record.last_refresh_at();
        if parsed.is_none() && record.last_refresh != NEVER {
            warn!(dataset = %dataset, raw = %record.last_refresh, "unparseable refresh timestamp");
        }
        parsed
    }

    /// Whole minutes since the last refresh, `-1` if never refreshed.
    pub async fn get_age_minutes(&self, dataset: DatasetKey) -> i64 {
        match self.last_refresh_at(dataset).await {
            Some(at) => (self.clock.now_ist() - at).num_minutes().max(0),
            None => -1,
        }
    }

    /// Freshness derived from age alone; storage is not touched.
    pub async fn current_freshness(&self, dataset: DatasetKey, stale_after_minutes: i64) -> Freshness {
        freshness_for_age(self.get_age_minutes(dataset).await, stale_after_minutes)
    }
}

pub fn freshness_for_age(age_minutes: i64, stale_after_minutes: i64) -> Freshness {
    if age_minutes < 0 {
        Freshness::Unknown
    } else if age_minutes >= stale_after_minutes {
        Freshness::Stale
    } else {
        Freshness::Fresh
    }
}
