use anyhow::{Context, bail};
use sector_rs::analyzer::{
    AnalysisContext, AnalysisOutcome, RsResult, SectorAnalyzer, sort_by_medium_rs,
};
use sector_rs::clock::{SystemClock, TokioSleeper};
use sector_rs::etf::etf_rows;
use sector_rs::market_data::{AngelOneClient, BrokerCredentials, CandleSource};
use sector_rs::market_hours::{RefreshSchedule, is_market_open};
use sector_rs::refresh_tracker::{
    DatasetKey, JsonFileStore, RefreshStatus, RefreshTracker, freshness_for_age,
};
use sector_rs::retry::RetryPolicy;
use sector_rs::storage_utils::{AppConfig, AsyncStorageManager};
use sector_rs::validator::{EnforcedStatus, clean_results, enforce_complete, validation_report};
use sector_rs::{clock::Clock, report};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const STORAGE_DIR: &str = "storage";
const CONFIG_FILE: &str = "config";
const TRACKER_FILE: &str = "refresh_tracker";
const SECTOR_FILE: &str = "sector_analysis";
const ETF_FILE: &str = "etf_analysis";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Sectors,
    Etfs,
    All,
    Status,
}

impl Mode {
    fn parse(arg: Option<&str>) -> anyhow::Result<Self> {
        match arg.unwrap_or("all") {
            "sectors" => Ok(Self::Sectors),
            "etfs" => Ok(Self::Etfs),
            "all" => Ok(Self::All),
            "status" => Ok(Self::Status),
            other => bail!("unknown mode '{other}', expected sectors|etfs|all|status"),
        }
    }
}

type Tracker = RefreshTracker<JsonFileStore>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let arg = std::env::args().nth(1);
    let mode = Mode::parse(arg.as_deref())?;

    let storage = AsyncStorageManager::new_relative(STORAGE_DIR).await?;
    let config: AppConfig = storage
        .load_or_init(CONFIG_FILE)
        .await
        .context("loading config")?;
    config.validate()?;

    let tracker = RefreshTracker::new(JsonFileStore::new(storage.clone(), TRACKER_FILE));

    if mode == Mode::Status {
        print_status(&tracker, &config).await;
        return Ok(());
    }

    let credentials = BrokerCredentials::from_env()?;
    let client = AngelOneClient::new(credentials, config.retry_policy())?;
    let analyzer = SectorAnalyzer::new(client);
    let completeness = config.completeness_policy();

    let mut refreshed = Vec::new();

    if matches!(mode, Mode::Sectors | Mode::All) {
        println!("\n--- Sector Relative Strength ---");
        let ctx = config.sector_context();
        let outcome = run_dataset(&analyzer, &ctx, &completeness, &storage, SECTOR_FILE).await?;
        println!("{}", report::sector_table(&outcome.results, outcome.periods));
        record(&tracker, DatasetKey::Sectors, &outcome).await;
        refreshed.push(outcome.len());
    }

    if matches!(mode, Mode::Etfs | Mode::All) {
        if config.etfs.is_empty() {
            warn!("no ETFs configured, skipping ETF analysis");
        } else {
            println!("\n--- ETF Relative Strength ---");
            let ctx = config.etf_context();
            let outcome = run_dataset(&analyzer, &ctx, &completeness, &storage, ETF_FILE).await?;
            let rows = etf_rows(&outcome.results);
            println!("{}", report::etf_table(&rows, outcome.periods));
            record(&tracker, DatasetKey::Etfs, &outcome).await;
            refreshed.push(outcome.len());
        }
    }

    if refreshed.len() == 2 {
        let total: usize = refreshed.iter().sum();
        let status = if total > 0 { RefreshStatus::Success } else { RefreshStatus::Failed };
        if let Err(e) = tracker
            .record_refresh(DatasetKey::Comprehensive, status, total as u64)
            .await
        {
            error!(error = %e, "could not record comprehensive refresh");
        }
    }

    print_status(&tracker, &config).await;
    Ok(())
}

/// Runs one analysis with completeness enforcement, restores rate-limited
/// instruments from the previous saved run and saves the result.
async fn run_dataset<S: CandleSource>(
    analyzer: &SectorAnalyzer<S>,
    ctx: &AnalysisContext,
    completeness: &RetryPolicy,
    storage: &AsyncStorageManager,
    file: &str,
) -> anyhow::Result<AnalysisOutcome> {
    let initial = analyzer.analyze(ctx).await;
    let enforced = enforce_complete(initial, completeness, &TokioSleeper, || analyzer.analyze(ctx)).await;
    if enforced.status == EnforcedStatus::IncompleteAfterRetries {
        warn!(
            run = ctx.label,
            got = enforced.outcome.len(),
            expected = enforced.outcome.expected,
            "publishing incomplete results"
        );
    }

    let mut outcome = enforced.outcome;
    if outcome.skipped.iter().any(|s| s.rate_limited) {
        let previous = load_previous(storage, file).await;
        outcome.fill_from_cache(&previous);
    }
    clean_results(&mut outcome.results);
    sort_by_medium_rs(&mut outcome.results);
    println!("{}", validation_report(&outcome));
    storage.save(file, &outcome).await?;
    Ok(outcome)
}

/// Rows from the last saved run, empty when there is none or it is unreadable.
async fn load_previous(storage: &AsyncStorageManager, file: &str) -> Vec<RsResult> {
    match storage.load_optional::<AnalysisOutcome>(file).await {
        Ok(Some(previous)) => previous.results,
        Ok(None) => Vec::new(),
        Err(e) => {
            warn!(file, error = %e, "previous results unreadable, no cached fallback");
            Vec::new()
        }
    }
}

/// An empty run is logged as a failure with zero rows.
async fn record(tracker: &Tracker, key: DatasetKey, outcome: &AnalysisOutcome) {
    let (status, count) = if outcome.is_empty() {
        (RefreshStatus::Failed, 0)
    } else {
        (RefreshStatus::Success, outcome.len() as u64)
    };
    if let Err(e) = tracker.record_refresh(key, status, count).await {
        error!(dataset = %key, error = %e, "could not record refresh");
    }
}

async fn print_status(tracker: &Tracker, config: &AppConfig) {
    let mut records = tracker.all_statuses().await;
    let mut ages = Vec::with_capacity(records.len());
    for record in &mut records {
        let age = tracker.get_age_minutes(record.dataset).await;
        // Stored freshness is only ever "fresh"; show what the age implies.
        record.freshness = freshness_for_age(age, config.stale_after_minutes);
        ages.push(age);
    }

    println!("\n--- Refresh Status ---");
    println!("{}", report::refresh_status_table(&records, &ages));

    let market_open = is_market_open(&SystemClock.now());
    let schedule = RefreshSchedule::new(config.auto_refresh_minutes);
    for (record, age) in records.iter().zip(&ages) {
        if schedule.is_due(*age, market_open) {
            info!(dataset = %record.dataset, age, "refresh due");
        }
    }
    info!(market_open, "market session");
}
