//! Relative strength and the small price statistics that sit beside it.

use crate::candles::CandleSeries;
use ta::Next;
use ta::indicators::SimpleMovingAverage;

pub const MOVING_AVERAGE_BARS: usize = 20;

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Inner join on date: `(instrument_close, benchmark_close)` for every date
/// both series carry, ascending.
pub fn align(instrument: &CandleSeries, benchmark: &CandleSeries) -> Vec<(f64, f64)> {
    let a = instrument.candles();
    let b = benchmark.candles();
    let mut joined = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);

    while i < a.len() && j < b.len() {
        match a[i].timestamp.cmp(&b[j].timestamp) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                joined.push((a[i].close, b[j].close));
                i += 1;
                j += 1;
            }
        }
    }
    joined
}

fn period_return(last: f64, reference: f64) -> f64 {
    (last / reference - 1.0) * 100.0
}

/// Why an RS value could not be produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RsGap {
    /// The join holds `period` bars or fewer. Not a data problem.
    InsufficientHistory,
    NonPositiveReference { instrument: f64, benchmark: f64 },
    NotFinite,
}

impl RsGap {
    pub fn is_data_problem(&self) -> bool {
        !matches!(self, Self::InsufficientHistory)
    }
}

/// Instrument return minus benchmark return over `period` aligned bars,
/// rounded to two decimals.
pub fn try_compute_rs(
    instrument: &CandleSeries,
    benchmark: &CandleSeries,
    period: usize,
) -> Result<f64, RsGap> {
    let joined = align(instrument, benchmark);
    if period == 0 || joined.len() <= period {
        return Err(RsGap::InsufficientHistory);
    }

    let last = joined.len() - 1;
    let (inst_last, bench_last) = joined[last];
    let (inst_ref, bench_ref) = joined[last - period];

    if inst_ref <= 0.0 || bench_ref <= 0.0 {
        return Err(RsGap::NonPositiveReference {
            instrument: inst_ref,
            benchmark: bench_ref,
        });
    }

    let rs = period_return(inst_last, inst_ref) - period_return(bench_last, bench_ref);
    if !rs.is_finite() {
        return Err(RsGap::NotFinite);
    }
    Ok(round2(rs))
}

/// `try_compute_rs` without the reason. `None` when the join holds `period`
/// bars or fewer.
pub fn compute_rs(instrument: &CandleSeries, benchmark: &CandleSeries, period: usize) -> Option<f64> {
    try_compute_rs(instrument, benchmark, period).ok()
}

/// Mean of the last 20 closes.
pub fn moving_average_20(series: &CandleSeries) -> Option<f64> {
    moving_average(series, MOVING_AVERAGE_BARS)
}

pub fn moving_average(series: &CandleSeries, bars: usize) -> Option<f64> {
    let closes = series.closes();
    if bars == 0 || closes.len() < bars {
        return None;
    }

    let mut sma = SimpleMovingAverage::new(bars).ok()?;
    let mut last = None;
    for close in &closes[closes.len() - bars..] {
        last = Some(sma.next(*close));
    }
    last
}

pub fn pct_from_moving_average(last_close: f64, moving_average: f64) -> Option<f64> {
    if moving_average == 0.0 || !moving_average.is_finite() {
        return None;
    }
    Some((last_close - moving_average) / moving_average * 100.0)
}

/// Last close against the one before it. One bar yields 0%.
pub fn day_change_pct(series: &CandleSeries) -> Option<f64> {
    let last = series.last_close()?;
    let previous = series.previous_close()?;
    if previous == 0.0 {
        return Some(0.0);
    }
    Some((last - previous) / previous * 100.0)
}
