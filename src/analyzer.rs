//! Sector/ETF relative strength analysis against a single benchmark.

use crate::candles::CandleSeries;
use crate::clock::{Clock, Sleeper, SystemClock, TokioSleeper};
use crate::error::ConfigError;
use crate::market_data::CandleSource;
use crate::relative_strength::{self, round2};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

pub const CACHED_NARRATIVE: &str = "Using cached data";

/// Rough trading bars per calendar year on NSE.
const TRADING_BARS_PER_YEAR: u32 = 250;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentRef {
    pub symbol: String,
    pub token: String,
    pub name: String,
}

impl InstrumentRef {
    pub fn new(symbol: impl Into<String>, token: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            token: token.into(),
            name: name.into(),
        }
    }
}

/// Short, medium and long lookbacks in trading bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "[usize; 3]", into = "[usize; 3]")]
pub struct RsPeriods {
    short: usize,
    medium: usize,
    long: usize,
}

impl RsPeriods {
    pub fn new(short: usize, medium: usize, long: usize) -> Result<Self, ConfigError> {
        for p in [short, medium, long] {
            if p == 0 {
                return Err(ConfigError::ZeroPeriod(p));
            }
        }
        Ok(Self { short, medium, long })
    }

    pub fn short(&self) -> usize {
        self.short
    }

    pub fn medium(&self) -> usize {
        self.medium
    }

    pub fn long(&self) -> usize {
        self.long
    }

    pub fn as_array(&self) -> [usize; 3] {
        [self.short, self.medium, self.long]
    }

    pub fn max(&self) -> usize {
        self.short.max(self.medium).max(self.long)
    }
}

impl Default for RsPeriods {
    fn default() -> Self {
        Self {
            short: 21,
            medium: 55,
            long: 123,
        }
    }
}

impl TryFrom<[usize; 3]> for RsPeriods {
    type Error = ConfigError;

    fn try_from([short, medium, long]: [usize; 3]) -> Result<Self, Self::Error> {
        Self::new(short, medium, long)
    }
}

impl From<RsPeriods> for [usize; 3] {
    fn from(p: RsPeriods) -> Self {
        p.as_array()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Outperforming,
    Mixed,
    Underperforming,
}

impl Category {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Outperforming => "Outperforming",
            Self::Mixed => "Mixed",
            Self::Underperforming => "Underperforming",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeriodRs {
    pub period: usize,
    pub rs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RsResult {
    pub instrument: InstrumentRef,
    pub ltp: f64,
    pub pct_change_from_prev_close: f64,
    /// Ordered short, medium, long.
    pub rs_by_period: [PeriodRs; 3],
    pub category: Category,
    pub narrative: String,
    pub moving_average_20: Option<f64>,
    pub pct_from_moving_average: Option<f64>,
    pub computed_at: DateTime<Utc>,
    /// Carried over from an earlier run because the live fetch was rate limited.
    #[serde(default)]
    pub cached: bool,
}

impl RsResult {
    pub fn short_rs(&self) -> Option<f64> {
        self.rs_by_period[0].rs
    }

    pub fn medium_rs(&self) -> Option<f64> {
        self.rs_by_period[1].rs
    }

    pub fn long_rs(&self) -> Option<f64> {
        self.rs_by_period[2].rs
    }

    pub fn rs_for(&self, period: usize) -> Option<f64> {
        self.rs_by_period
            .iter()
            .find(|p| p.period == period)
            .and_then(|p| p.rs)
    }
}

/// Strictly positive on all three periods, strictly negative on all three,
/// or neither. A missing value counts toward neither side.
pub fn classify(rs_values: &[Option<f64>; 3]) -> Category {
    let pos = rs_values.iter().filter(|rs| matches!(rs, Some(v) if *v > 0.0)).count();
    let neg = rs_values.iter().filter(|rs| matches!(rs, Some(v) if *v < 0.0)).count();

    if pos == rs_values.len() {
        Category::Outperforming
    } else if neg == rs_values.len() {
        Category::Underperforming
    } else {
        Category::Mixed
    }
}

/// Missing RS values read as zero here.
pub fn narrative(category: Category, short_rs: Option<f64>, medium_rs: Option<f64>) -> &'static str {
    let rs1 = short_rs.unwrap_or(0.0);
    let rs2 = medium_rs.unwrap_or(0.0);

    match category {
        Category::Outperforming if rs2 >= 3.0 => {
            "VERY STRONG momentum - Leading market across all timeframes"
        }
        Category::Outperforming if rs2 >= 1.5 => "STRONG momentum - Consistently outperforming",
        Category::Outperforming => "MODERATELY STRONG - Positive across periods",
        Category::Underperforming if rs2 <= -3.0 => "VERY WEAK - Significantly lagging market",
        Category::Underperforming if rs2 <= -1.5 => "WEAK - Underperforming across periods",
        Category::Underperforming => "MODERATELY WEAK - Lagging benchmark",
        Category::Mixed if rs1 > 0.0 && rs2 > 0.0 => {
            "Gaining momentum - Watch for sustained breakout"
        }
        Category::Mixed if rs1 < 0.0 && rs2 < 0.0 => "Losing momentum - Former strength fading",
        Category::Mixed => "Volatile pattern - Inconsistent performance",
    }
}

/// Calendar days needed to cover `bars` trading bars, with weekend and
/// holiday headroom.
pub fn calendar_days_for_bars(bars: usize) -> u32 {
    let bars = u32::try_from(bars).unwrap_or(u32::MAX);
    bars.saturating_mul(365).div_ceil(TRADING_BARS_PER_YEAR)
}

/// Everything one analysis run needs, passed in by the caller.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub label: &'static str,
    pub benchmark: InstrumentRef,
    pub periods: RsPeriods,
    pub instruments: Vec<InstrumentRef>,
    pub exchange: String,
    pub lookback_days: u32,
    pub pacing: Duration,
}

impl AnalysisContext {
    /// Lookback wide enough for `max(periods) + 2` bars, never narrower than
    /// the configured floor.
    pub fn effective_lookback_days(&self) -> u32 {
        self.lookback_days
            .max(calendar_days_for_bars(self.periods.max() + 2))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedInstrument {
    pub instrument: InstrumentRef,
    pub reason: String,
    pub rate_limited: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub periods: RsPeriods,
    pub expected: usize,
    pub results: Vec<RsResult>,
    pub skipped: Vec<SkippedInstrument>,
    pub benchmark_available: bool,
}

impl AnalysisOutcome {
    fn benchmark_missing(ctx: &AnalysisContext) -> Self {
        Self {
            periods: ctx.periods,
            expected: ctx.instruments.len(),
            results: Vec::new(),
            skipped: Vec::new(),
            benchmark_available: false,
        }
    }

    /// Rows computed in this run. Cached rows are not counted.
    pub fn len(&self) -> usize {
        self.results.iter().filter(|r| !r.cached).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cached_count(&self) -> usize {
        self.results.iter().filter(|r| r.cached).count()
    }

    /// Puts back the last known row for every instrument that was skipped
    /// because the broker rate limited it. Rows come back flagged `cached`,
    /// so completeness still reflects only live data. Returns how many were
    /// restored.
    pub fn fill_from_cache(&mut self, previous: &[RsResult]) -> usize {
        let mut restored = 0;
        for skipped in self.skipped.iter().filter(|s| s.rate_limited) {
            let token = &skipped.instrument.token;
            if self.results.iter().any(|r| &r.instrument.token == token) {
                continue;
            }
            let Some(old) = previous.iter().find(|r| &r.instrument.token == token) else {
                warn!(token = %token, name = %skipped.instrument.name, "rate limited with no cached row");
                continue;
            };
            info!(token = %token, name = %skipped.instrument.name, "using cached row");
            self.results.push(RsResult {
                narrative: CACHED_NARRATIVE.to_string(),
                cached: true,
                ..old.clone()
            });
            restored += 1;
        }
        if restored > 0 {
            sort_by_medium_rs(&mut self.results);
        }
        restored
    }
}

pub struct SectorAnalyzer<S, Z = TokioSleeper, C = SystemClock> {
    source: S,
    sleeper: Z,
    clock: C,
}

impl<S: CandleSource> SectorAnalyzer<S> {
    pub fn new(source: S) -> Self {
        Self::with_parts(source, TokioSleeper, SystemClock)
    }
}

impl<S: CandleSource, Z: Sleeper> SectorAnalyzer<S, Z> {
    pub fn with_sleeper(source: S, sleeper: Z) -> Self {
        Self::with_parts(source, sleeper, SystemClock)
    }
}

impl<S: CandleSource, Z: Sleeper, C: Clock> SectorAnalyzer<S, Z, C> {
    pub fn with_parts(source: S, sleeper: Z, clock: C) -> Self {
        Self {
            source,
            sleeper,
            clock,
        }
    }

    /// Fetches the benchmark once, then each instrument in order with a fixed
    /// pause between requests. Instruments that fail to fetch are left out
    /// and listed in `skipped`; a missing benchmark yields an empty outcome.
    pub async fn analyze(&self, ctx: &AnalysisContext) -> AnalysisOutcome {
        let lookback = ctx.effective_lookback_days();
        info!(
            run = ctx.label,
            benchmark = %ctx.benchmark.token,
            instruments = ctx.instruments.len(),
            lookback,
            "starting relative strength analysis"
        );

        let benchmark = match self
            .source
            .fetch_candles(&ctx.benchmark.token, lookback, &ctx.exchange)
            .await
        {
            Ok(series) => series,
            Err(e) => {
                error!(
                    run = ctx.label,
                    token = %ctx.benchmark.token,
                    error = %e,
                    "benchmark unavailable, aborting analysis"
                );
                return AnalysisOutcome::benchmark_missing(ctx);
            }
        };

        let total = ctx.instruments.len();
        let mut results = Vec::with_capacity(total);
        let mut skipped = Vec::new();

        for (idx, instrument) in ctx.instruments.iter().enumerate() {
            self.sleeper.sleep(ctx.pacing).await;
            info!(run = ctx.label, "[{}/{}] {}", idx + 1, total, instrument.name);

            let series = match self
                .source
                .fetch_candles(&instrument.token, lookback, &ctx.exchange)
                .await
            {
                Ok(series) => series,
                Err(e) => {
                    warn!(
                        run = ctx.label,
                        token = %instrument.token,
                        name = %instrument.name,
                        error = %e,
                        "skipping instrument"
                    );
                    skipped.push(SkippedInstrument {
                        instrument: instrument.clone(),
                        reason: e.to_string(),
                        rate_limited: e.is_rate_limited(),
                    });
                    continue;
                }
            };

            match evaluate(instrument, &series, &benchmark, ctx.periods, self.clock.now()) {
                Some(result) => results.push(result),
                None => skipped.push(SkippedInstrument {
                    instrument: instrument.clone(),
                    reason: "no valid bars".to_string(),
                    rate_limited: false,
                }),
            }
        }

        sort_by_medium_rs(&mut results);

        info!(
            run = ctx.label,
            succeeded = results.len(),
            skipped = skipped.len(),
            "analysis finished"
        );

        AnalysisOutcome {
            periods: ctx.periods,
            expected: total,
            results,
            skipped,
            benchmark_available: true,
        }
    }
}

/// Builds one result row from an instrument series and the benchmark.
pub fn evaluate(
    instrument: &InstrumentRef,
    series: &CandleSeries,
    benchmark: &CandleSeries,
    periods: RsPeriods,
    computed_at: DateTime<Utc>,
) -> Option<RsResult> {
    let last_close = series.last_close()?;
    let ltp = round2(last_close);
    let pct_change = round2(relative_strength::day_change_pct(series).unwrap_or(0.0));

    let rs_by_period = periods.as_array().map(|period| PeriodRs {
        period,
        rs: match relative_strength::try_compute_rs(series, benchmark, period) {
            Ok(rs) => Some(rs),
            Err(gap) => {
                if gap.is_data_problem() {
                    warn!(token = %instrument.token, period, ?gap, "unusable closes, RS left empty");
                }
                None
            }
        },
    });
    let values = rs_by_period.map(|p| p.rs);
    let category = classify(&values);

    let moving_average_20 = relative_strength::moving_average_20(series);
    let pct_from_moving_average = moving_average_20
        .and_then(|ma| relative_strength::pct_from_moving_average(last_close, ma))
        .map(round2);

    Some(RsResult {
        instrument: instrument.clone(),
        ltp,
        pct_change_from_prev_close: pct_change,
        rs_by_period,
        category,
        narrative: narrative(category, values[0], values[1]).to_string(),
        moving_average_20: moving_average_20.map(round2),
        pct_from_moving_average,
        computed_at,
        cached: false,
    })
}

/// Descending by medium-period RS; a missing value ranks as zero.
pub fn sort_by_medium_rs(results: &mut [RsResult]) {
    results.sort_by(|a, b| {
        let a = a.medium_rs().unwrap_or(0.0);
        let b = b.medium_rs().unwrap_or(0.0);
        b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal)
    });
}
