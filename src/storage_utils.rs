use crate::analyzer::{AnalysisContext, InstrumentRef, RsPeriods};
use crate::error::ConfigError;
use crate::retry::{MAX_FETCH_RETRIES, RetryPolicy};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs;

// CONFIGURATION STRUCTS

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub benchmark: InstrumentRef,
    pub periods: RsPeriods,
    pub exchange: String,
    pub lookback_days: u32,
    /// Pause between per-instrument requests.
    pub pacing_ms: u64,
    /// One entry per extra attempt on a broker server error.
    pub retry_backoff_secs: Vec<u64>,
    pub completeness_retries: u32,
    pub auto_refresh_minutes: u32,
    pub stale_after_minutes: i64,
    pub sectors: Vec<InstrumentRef>,
    pub etfs: Vec<InstrumentRef>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            benchmark: InstrumentRef::new("NIFTY 50", "99926000", "NIFTY 50"),
            periods: RsPeriods::default(),
            exchange: "NSE".to_string(),
            lookback_days: 400,
            pacing_ms: 200,
            retry_backoff_secs: vec![60, 90],
            completeness_retries: 2,
            auto_refresh_minutes: 2,
            stale_after_minutes: 30,
            sectors: default_sectors(),
            etfs: Vec::new(),
        }
    }
}

fn default_sectors() -> Vec<InstrumentRef> {
    [
        ("Nifty Auto", "99926029", "Auto"),
        ("NIFTY Bank", "99926009", "Bank"),
        ("NIFTY FMCG", "99926021", "FMCG"),
        ("NIFTY IT", "99926008", "IT"),
        ("NIFTY 50", "99926000", "Nifty 50"),
        ("NIFTY FIN SERVICE", "99926037", "Financial Services"),
        ("NIFTY Next 50", "99926013", "Next 50"),
        ("NIFTY Midcap 50", "99926014", "Mid 50"),
        ("NIFTY MEDIA", "99926031", "Media"),
        ("NIFTY METAL", "99926030", "Metal"),
        ("NIFTY PHARMA", "99926023", "Pharma"),
        ("NIFTY PSU BANK", "99926025", "PSU Bank"),
        ("NIFTY PVT BANK", "99926047", "Private Bank"),
        ("NIFTY REALTY", "99926018", "Realty"),
        ("NIFTY ENERGY", "99926020", "Energy"),
        ("NIFTY INFRA", "99926019", "Infrastructure"),
        ("NIFTY COMMODITIES", "99926035", "Commodities"),
        ("NIFTY CONSUMPTION", "99926036", "Consumption"),
        ("NIFTY CPSE", "99926041", "CPSE"),
        ("NIFTY OIL AND GAS", "99919051", "Oil & Gas"),
        ("NIFTY HEALTHCARE", "99919011", "Healthcare"),
        ("NIFTY CONSR DURBL", "99919008", "Consumer Durables"),
    ]
    .into_iter()
    .map(|(symbol, token, name)| InstrumentRef::new(symbol, token, name))
    .collect()
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for p in self.periods.as_array() {
            if p == 0 {
                return Err(ConfigError::ZeroPeriod(p));
            }
        }
        if self.lookback_days == 0 {
            return Err(ConfigError::ZeroLookback);
        }
        if self.retry_backoff_secs.len() > MAX_FETCH_RETRIES {
            return Err(ConfigError::TooManyRetries {
                got: self.retry_backoff_secs.len(),
                max: MAX_FETCH_RETRIES,
            });
        }
        if self.sectors.is_empty() {
            return Err(ConfigError::NoInstruments("sectors"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_secs(&self.retry_backoff_secs)
    }

    /// Completeness re-runs reuse the broker backoff schedule, cycling it
    /// when more re-runs than entries are configured.
    pub fn completeness_policy(&self) -> RetryPolicy {
        let n = self.completeness_retries as usize;
        if self.retry_backoff_secs.is_empty() {
            return RetryPolicy::new(vec![Duration::ZERO; n]);
        }
        let secs: Vec<u64> = self.retry_backoff_secs.iter().copied().cycle().take(n).collect();
        RetryPolicy::from_secs(&secs)
    }

    pub fn sector_context(&self) -> AnalysisContext {
        self.context("sectors", self.sectors.clone())
    }

    pub fn etf_context(&self) -> AnalysisContext {
        self.context("etfs", self.etfs.clone())
    }

    fn context(&self, label: &'static str, instruments: Vec<InstrumentRef>) -> AnalysisContext {
        AnalysisContext {
            label,
            benchmark: self.benchmark.clone(),
            periods: self.periods,
            instruments,
            exchange: self.exchange.clone(),
            lookback_days: self.lookback_days,
            pacing: Duration::from_millis(self.pacing_ms),
        }
    }
}

// STORAGE MANAGER

/// Per-process sequence so concurrent saves never share a temp file.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct AsyncStorageManager {
    pub base_dir: PathBuf,
}

impl AsyncStorageManager {
    /// Storage directory next to the running executable.
    pub async fn new_relative<P: AsRef<Path>>(relative_path: P) -> anyhow::Result<Self> {
        let exe_path = std::env::current_exe()?;
        let base_dir = exe_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Could not find binary directory"))?
            .join(relative_path);
        Self::new(base_dir).await
    }

    pub async fn new<P: Into<PathBuf>>(base_dir: P) -> anyhow::Result<Self> {
        let base_dir = base_dir.into();
        // Create once here so save() never has to check.
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir).await?;
        }
        Ok(Self { base_dir })
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", name))
    }

    /// Writes a temp file unique to this process and call, then renames it
    /// over `name.json`. Readers see either the old file or the new one, and
    /// concurrent writers end as last-writer-wins.
    pub async fn save<T: Serialize + ?Sized>(&self, name: &str, data: &T) -> anyhow::Result<()> {
        let final_path = self.path_for(name);
        let tmp_path = self.base_dir.join(format!(
            "{}.json.{}.{}.tmp",
            name,
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        let json_bytes = serde_json::to_vec_pretty(data)?;
        fs::write(&tmp_path, json_bytes).await?;
        if let Err(e) = fs::rename(&tmp_path, final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        Ok(())
    }

    pub async fn load<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        // Bytes, not String: serde_json validates UTF-8 while parsing anyway.
        let content = fs::read(self.path_for(name)).await?;
        let data = serde_json::from_slice(&content)?;
        Ok(data)
    }

    /// Like `load`, but a missing file is `Ok(None)`.
    pub async fn load_optional<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        match fs::read(self.path_for(name)).await {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads `name`, writing `T::default()` first when the file is missing.
    pub async fn load_or_init<T>(&self, name: &str) -> anyhow::Result<T>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        match self.load_optional(name).await? {
            Some(data) => Ok(data),
            None => {
                let data = T::default();
                self.save(name, &data).await?;
                Ok(data)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn save_replaces_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path().join("storage")).await.unwrap();

        let mut first = BTreeMap::new();
        first.insert("sectors", 19);
        storage.save("counts", &first).await.unwrap();
        first.insert("etfs", 34);
        storage.save("counts", &first).await.unwrap();

        let loaded: BTreeMap<String, u32> = storage.load("counts").await.unwrap();
        assert_eq!(loaded.get("etfs"), Some(&34));
        assert_eq!(leftover_tmp_files(&storage.base_dir), 0);
    }

    fn leftover_tmp_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
            .count()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_to_one_file_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let mut handles = Vec::new();
        for writer in 0..8u32 {
            // Separate managers, as separate worker processes would have.
            let storage = AsyncStorageManager::new(dir.path()).await.unwrap();
            handles.push(tokio::spawn(async move {
                let mut failures = 0;
                for n in 0..25u32 {
                    if storage.save("shared", &vec![writer, n]).await.is_err() {
                        failures += 1;
                    }
                }
                failures
            }));
        }

        let mut failures = 0;
        for handle in handles {
            failures += handle.await.unwrap();
        }
        assert_eq!(failures, 0);

        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();
        let last: Vec<u32> = storage.load("shared").await.unwrap();
        assert_eq!(last.len(), 2);
        assert_eq!(leftover_tmp_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn missing_file_is_none_but_corrupt_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();

        let missing: Option<Vec<u32>> = storage.load_optional("nothing").await.unwrap();
        assert!(missing.is_none());

        tokio::fs::write(storage.path_for("broken"), b"{not json").await.unwrap();
        assert!(storage.load_optional::<Vec<u32>>("broken").await.is_err());
    }

    #[tokio::test]
    async fn config_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();

        let config: AppConfig = storage.load_or_init("config").await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(storage.path_for("config").exists());
        assert_eq!(config.sectors.len(), 22);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"periods": [10, 20, 30], "pacing_ms": 500}"#).unwrap();
        assert_eq!(config.periods.as_array(), [10, 20, 30]);
        assert_eq!(config.sector_context().pacing, Duration::from_millis(500));
        assert_eq!(config.exchange, "NSE");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = AppConfig {
            lookback_days: 0,
            ..AppConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroLookback));

        config.lookback_days = 400;
        config.retry_backoff_secs = vec![60, 90, 120];
        assert_eq!(
            config.validate(),
            Err(ConfigError::TooManyRetries { got: 3, max: 2 })
        );

        config.retry_backoff_secs = vec![30];
        assert!(config.validate().is_ok());
        config.sectors.clear();
        assert_eq!(config.validate(), Err(ConfigError::NoInstruments("sectors")));
    }

    #[test]
    fn completeness_policy_cycles_backoff() {
        let config = AppConfig {
            retry_backoff_secs: vec![60, 90],
            completeness_retries: 3,
            ..AppConfig::default()
        };
        assert_eq!(config.completeness_policy(), RetryPolicy::from_secs(&[60, 90, 60]));
        assert_eq!(config.retry_policy().max_retries(), 2);
    }
}
