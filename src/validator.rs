//! Completeness checks and row cleaning for analysis outcomes.

use crate::analyzer::{AnalysisOutcome, RsResult};
use crate::clock::Sleeper;
use crate::retry::RetryPolicy;
use comfy_table::{Cell, CellAlignment, Table, presets::ASCII_MARKDOWN};
use std::fmt::Write as _;
use std::future::Future;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Valid { count: usize },
    Incomplete { count: usize, expected: usize },
    /// More rows than expected. Logged, never fatal.
    Excess { count: usize, expected: usize },
}

impl Completeness {
    pub fn count(&self) -> usize {
        match *self {
            Self::Valid { count } | Self::Incomplete { count, .. } | Self::Excess { count, .. } => count,
        }
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }

    pub fn message(&self) -> String {
        match *self {
            Self::Valid { count } => format!("VALID: {count} rows"),
            Self::Incomplete { count, expected } => {
                format!("INCOMPLETE: got {count} of {expected}, missing {}", expected - count)
            }
            Self::Excess { count, expected } => {
                format!("EXCESS: got {count} rows (expected {expected}, excess {})", count - expected)
            }
        }
    }
}

pub fn check_completeness(expected: usize, actual: usize) -> Completeness {
    use std::cmp::Ordering::*;
    match actual.cmp(&expected) {
        Less => Completeness::Incomplete {
            count: actual,
            expected,
        },
        Equal => Completeness::Valid { count: actual },
        Greater => Completeness::Excess {
            count: actual,
            expected,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcedStatus {
    Valid,
    IncompleteAfterRetries,
}

#[derive(Debug, Clone)]
pub struct Enforced {
    pub status: EnforcedStatus,
    pub outcome: AnalysisOutcome,
    /// Re-runs performed on top of the initial attempt.
    pub retries: u32,
}

/// Re-runs an incomplete analysis up to `policy.max_retries()` times, waiting
/// the policy's backoff before each re-run. Keeps the attempt with the most
/// rows; never pads.
pub async fn enforce_complete<F, Fut, Z>(
    initial: AnalysisOutcome,
    policy: &RetryPolicy,
    sleeper: &Z,
    mut rerun: F,
) -> Enforced
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AnalysisOutcome>,
    Z: Sleeper + ?Sized,
{
    let expected = initial.expected;
    let first = check_completeness(expected, initial.len());
    if !first.is_incomplete() {
        if let Completeness::Excess { .. } = first {
            warn!("{}", first.message());
        }
        return Enforced {
            status: EnforcedStatus::Valid,
            outcome: initial,
            retries: 0,
        };
    }

    warn!(got = initial.len(), expected, "incomplete analysis, retrying");
    let mut best = initial;

    for retry in 1..=policy.max_retries() {
        if let Some(wait) = policy.backoff_for(retry) {
            sleeper.sleep(wait).await;
        }
        info!(retry, max = policy.max_retries(), "re-running analysis");

        let attempt = rerun().await;
        let check = check_completeness(expected, attempt.len());
        if !check.is_incomplete() {
            info!(retry, "{}", check.message());
            return Enforced {
                status: EnforcedStatus::Valid,
                outcome: attempt,
                retries: retry,
            };
        }

        warn!(retry, got = attempt.len(), expected, "retry still incomplete");
        if attempt.len() > best.len() {
            best = attempt;
        }
    }

    error!(
        best = best.len(),
        expected,
        retries = policy.max_retries(),
        "could not complete analysis"
    );
    Enforced {
        status: EnforcedStatus::IncompleteAfterRetries,
        outcome: best,
        retries: policy.max_retries(),
    }
}

/// Drops rows whose price fields are not finite and blanks non-finite RS
/// values. Returns how many rows were dropped.
pub fn clean_results(results: &mut Vec<RsResult>) -> usize {
    let before = results.len();
    results.retain(|r| r.ltp.is_finite() && r.pct_change_from_prev_close.is_finite());
    for row in results.iter_mut() {
        for p in row.rs_by_period.iter_mut() {
            if p.rs.is_some_and(|v| !v.is_finite()) {
                p.rs = None;
            }
        }
        if row.moving_average_20.is_some_and(|v| !v.is_finite()) {
            row.moving_average_20 = None;
        }
        if row.pct_from_moving_average.is_some_and(|v| !v.is_finite()) {
            row.pct_from_moving_average = None;
        }
    }
    let dropped = before - results.len();
    if dropped > 0 {
        info!(dropped, kept = results.len(), "cleaned invalid rows");
    }
    dropped
}

struct ColumnStats {
    min: Option<f64>,
    max: Option<f64>,
    nulls: usize,
}

fn column_stats(values: impl Iterator<Item = Option<f64>>) -> ColumnStats {
    let mut stats = ColumnStats {
        min: None,
        max: None,
        nulls: 0,
    };
    for v in values {
        match v {
            Some(v) if v.is_finite() => {
                stats.min = Some(stats.min.map_or(v, |m| m.min(v)));
                stats.max = Some(stats.max.map_or(v, |m| m.max(v)));
            }
            _ => stats.nulls += 1,
        }
    }
    stats
}

/// Plain-text report: completeness line plus min/max/null count per numeric
/// column.
pub fn validation_report(outcome: &AnalysisOutcome) -> String {
    let mut out = String::new();
    let rule = "=".repeat(70);
    let _ = writeln!(out, "{rule}\nVALIDATION REPORT\n{rule}");

    if outcome.is_empty() {
        let reason = if outcome.benchmark_available {
            "no instrument returned data"
        } else {
            "benchmark unavailable"
        };
        let _ = writeln!(out, "FAILED: result set is empty ({reason})");
        return out;
    }

    let _ = writeln!(out, "{} rows", outcome.len());
    let _ = writeln!(out, "{}", check_completeness(outcome.expected, outcome.len()).message());
    let cached = outcome.cached_count();
    if cached > 0 {
        let _ = writeln!(out, "{cached} rows from cache (not counted as complete)");
    }
    for skipped in &outcome.skipped {
        let _ = writeln!(out, "  skipped {}: {}", skipped.instrument.name, skipped.reason);
    }

    let rows = &outcome.results;
    let [p1, p2, p3] = outcome.periods.as_array();
    let columns: Vec<(String, ColumnStats)> = vec![
        ("LTP".into(), column_stats(rows.iter().map(|r| Some(r.ltp)))),
        (
            "% Change".into(),
            column_stats(rows.iter().map(|r| Some(r.pct_change_from_prev_close))),
        ),
        (format!("RS_{p1}"), column_stats(rows.iter().map(RsResult::short_rs))),
        (format!("RS_{p2}"), column_stats(rows.iter().map(RsResult::medium_rs))),
        (format!("RS_{p3}"), column_stats(rows.iter().map(RsResult::long_rs))),
        (
            "% Change 20 DMA".into(),
            column_stats(rows.iter().map(|r| r.pct_from_moving_average)),
        ),
    ];

    let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.2}"));
    let mut table = Table::new();
    table.load_preset(ASCII_MARKDOWN).set_header(vec!["Column", "Min", "Max", "Nulls"]);
    for (name, stats) in columns {
        table.add_row(vec![
            Cell::new(name),
            Cell::new(fmt(stats.min)).set_alignment(CellAlignment::Right),
            Cell::new(fmt(stats.max)).set_alignment(CellAlignment::Right),
            Cell::new(stats.nulls).set_alignment(CellAlignment::Right),
        ]);
    }
    let _ = writeln!(out, "\n{table}\n{rule}\nEND VALIDATION REPORT\n{rule}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::tests::{context, inst, trend, FakeSource};
    use crate::analyzer::{RsPeriods, SectorAnalyzer};
    use crate::clock::testing::RecordingSleeper;
    use std::cell::Cell as StdCell;
    use std::time::Duration;

    fn outcome_with(rows: usize, expected: usize) -> AnalysisOutcome {
        let bench = crate::candles::tests::series(&trend(20, 0.5));
        let inst_series = crate::candles::tests::series(&trend(20, 1.0));
        let results = (0..rows)
            .map(|i| {
                crate::analyzer::evaluate(
                    &inst(&format!("S{i}")),
                    &inst_series,
                    &bench,
                    RsPeriods::new(2, 5, 10).unwrap(),
                    chrono::Utc::now(),
                )
                .unwrap()
            })
            .collect();
        AnalysisOutcome {
            periods: RsPeriods::new(2, 5, 10).unwrap(),
            expected,
            results,
            skipped: Vec::new(),
            benchmark_available: true,
        }
    }

    #[test]
    fn completeness_classes() {
        assert_eq!(check_completeness(19, 17), Completeness::Incomplete { count: 17, expected: 19 });
        assert_eq!(check_completeness(19, 19), Completeness::Valid { count: 19 });
        assert_eq!(check_completeness(19, 20), Completeness::Excess { count: 20, expected: 19 });
        assert_eq!(check_completeness(19, 17).count(), 17);
        assert!(check_completeness(19, 17).message().contains("missing 2"));
    }

    #[tokio::test]
    async fn complete_first_try_never_reruns() {
        let sleeper = RecordingSleeper::default();
        let runs = StdCell::new(0);
        let enforced = enforce_complete(outcome_with(3, 3), &RetryPolicy::default(), &sleeper, || {
            runs.set(runs.get() + 1);
            async { outcome_with(3, 3) }
        })
        .await;

        assert_eq!(enforced.status, EnforcedStatus::Valid);
        assert_eq!(enforced.retries, 0);
        assert_eq!(runs.get(), 0);
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn excess_is_accepted_without_retry() {
        let sleeper = RecordingSleeper::default();
        let enforced = enforce_complete(outcome_with(4, 3), &RetryPolicy::default(), &sleeper, || async {
            outcome_with(0, 3)
        })
        .await;
        assert_eq!(enforced.status, EnforcedStatus::Valid);
        assert_eq!(enforced.outcome.len(), 4);
    }

    #[tokio::test]
    async fn retry_that_completes_wins() {
        let sleeper = RecordingSleeper::default();
        let enforced = enforce_complete(outcome_with(1, 3), &RetryPolicy::from_secs(&[5, 10]), &sleeper, || async {
            outcome_with(3, 3)
        })
        .await;

        assert_eq!(enforced.status, EnforcedStatus::Valid);
        assert_eq!(enforced.retries, 1);
        assert_eq!(enforced.outcome.len(), 3);
        assert_eq!(sleeper.calls(), vec![Duration::from_secs(5)]);
    }

    #[tokio::test]
    async fn keeps_best_attempt_when_still_incomplete() {
        let sleeper = RecordingSleeper::default();
        let sizes = StdCell::new(vec![2, 1]);
        let enforced = enforce_complete(outcome_with(1, 3), &RetryPolicy::from_secs(&[1, 1]), &sleeper, || {
            let mut remaining = sizes.take();
            let n = remaining.remove(0);
            sizes.set(remaining);
            async move { outcome_with(n, 3) }
        })
        .await;

        assert_eq!(enforced.status, EnforcedStatus::IncompleteAfterRetries);
        assert_eq!(enforced.outcome.len(), 2);
        assert_eq!(enforced.retries, 2);
    }

    #[tokio::test]
    async fn seventeen_of_nineteen_is_reported_incomplete() {
        let mut source = FakeSource::default().with("B", trend(20, 0.5));
        let mut instruments = Vec::new();
        for i in 0..19 {
            let token = format!("S{i}");
            instruments.push(inst(&token));
            if i != 4 && i != 11 {
                source = source.with(&token, trend(20, 1.0));
            }
        }
        let analyzer = SectorAnalyzer::with_sleeper(source, RecordingSleeper::default());
        let ctx = context(instruments);
        let outcome = analyzer.analyze(&ctx).await;

        assert_eq!(
            check_completeness(ctx.instruments.len(), outcome.len()),
            Completeness::Incomplete { count: 17, expected: 19 }
        );

        let sleeper = RecordingSleeper::default();
        let enforced = enforce_complete(outcome, &RetryPolicy::none(), &sleeper, || analyzer.analyze(&ctx)).await;
        assert_eq!(enforced.status, EnforcedStatus::IncompleteAfterRetries);
        assert_eq!(enforced.outcome.len(), 17);
    }

    #[test]
    fn cleaning_drops_non_finite_rows() {
        let mut outcome = outcome_with(3, 3);
        outcome.results[0].ltp = f64::NAN;
        outcome.results[1].rs_by_period[2].rs = Some(f64::INFINITY);

        let dropped = clean_results(&mut outcome.results);
        assert_eq!(dropped, 1);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].long_rs(), None);
    }

    #[test]
    fn report_lists_columns_and_completeness() {
        let mut outcome = outcome_with(2, 3);
        outcome.results[1].rs_by_period[2].rs = None;
        let report = validation_report(&outcome);

        assert!(report.contains("INCOMPLETE: got 2 of 3"));
        assert!(report.contains("RS_10"));
        assert!(report.contains("% Change 20 DMA"));
        assert!(report.contains("END VALIDATION REPORT"));
    }

    #[test]
    fn cached_rows_do_not_make_a_run_complete() {
        let mut outcome = outcome_with(3, 3);
        outcome.results[2].cached = true;
        let report = validation_report(&outcome);

        assert_eq!(outcome.len(), 2);
        assert!(report.contains("INCOMPLETE: got 2 of 3"));
        assert!(report.contains("1 rows from cache"));
    }

    #[test]
    fn report_on_empty_outcome_names_the_cause() {
        let mut outcome = outcome_with(0, 3);
        outcome.benchmark_available = false;
        assert!(validation_report(&outcome).contains("benchmark unavailable"));
    }
}
