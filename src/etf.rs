use crate::analyzer::{CACHED_NARRATIVE, RsResult};
use serde::{Deserialize, Serialize};

/// ETF-facing view of an analysis row, with the moving-average columns and
/// a price-action outlook in place of the sector narrative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtfRow {
    pub code: String,
    pub theme: String,
    pub ltp: f64,
    pub pct_change: f64,
    pub dma_20: Option<f64>,
    pub pct_from_dma_20: Option<f64>,
    pub rs_short: Option<f64>,
    pub rs_medium: Option<f64>,
    pub rs_long: Option<f64>,
    pub outlook: String,
}

impl From<&RsResult> for EtfRow {
    fn from(r: &RsResult) -> Self {
        Self {
            code: r.instrument.symbol.clone(),
            theme: r.instrument.name.clone(),
            ltp: r.ltp,
            pct_change: r.pct_change_from_prev_close,
            dma_20: r.moving_average_20,
            pct_from_dma_20: r.pct_from_moving_average,
            rs_short: r.short_rs(),
            rs_medium: r.medium_rs(),
            rs_long: r.long_rs(),
            outlook: if r.cached {
                CACHED_NARRATIVE.to_string()
            } else {
                etf_outlook(r.short_rs(), r.medium_rs(), r.long_rs(), r.pct_change_from_prev_close)
                    .to_string()
            },
        }
    }
}

pub fn etf_rows(results: &[RsResult]) -> Vec<EtfRow> {
    results.iter().map(EtfRow::from).collect()
}

/// First matching rule wins. Missing values count as zero.
pub fn etf_outlook(
    rs_short: Option<f64>,
    rs_medium: Option<f64>,
    rs_long: Option<f64>,
    pct_change: f64,
) -> &'static str {
    let rs21 = rs_short.unwrap_or(0.0);
    let rs55 = rs_medium.unwrap_or(0.0);
    let rs123 = rs_long.unwrap_or(0.0);
    let change = if pct_change.is_finite() { pct_change } else { 0.0 };

    if rs55 >= 3.0 && rs21 > 0.0 && rs123 > 0.0 {
        "Very strong momentum - Multi-timeframe leader"
    } else if rs55 >= 1.5 && rs21 > 0.0 {
        "Strong uptrend - Buy on dips"
    } else if rs55 <= -3.0 {
        "Severe underperformance - Avoid for now"
    } else if rs55 <= -1.5 && rs21 < 0.0 {
        "Weak trend - Lagging benchmark"
    } else if change > 1.0 && rs21 > 0.0 {
        "Short-term surge - Watch follow-through"
    } else if change < -1.0 && rs21 < 0.0 {
        "Short-term pressure - Avoid fresh entries"
    } else {
        "Sideways / volatile - Wait for clear trend"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{RsPeriods, evaluate};
    use crate::analyzer::tests::{inst, trend};
    use crate::candles::tests::series;

    #[test]
    fn outlook_rules_in_order() {
        assert_eq!(
            etf_outlook(Some(1.0), Some(3.0), Some(2.0), 0.0),
            "Very strong momentum - Multi-timeframe leader"
        );
        // Long RS negative drops the leader rule but the uptrend still holds.
        assert_eq!(
            etf_outlook(Some(1.0), Some(3.0), Some(-2.0), 0.0),
            "Strong uptrend - Buy on dips"
        );
        assert_eq!(
            etf_outlook(Some(2.0), Some(-3.5), Some(1.0), 0.0),
            "Severe underperformance - Avoid for now"
        );
        assert_eq!(
            etf_outlook(Some(-0.5), Some(-1.6), None, 0.0),
            "Weak trend - Lagging benchmark"
        );
        assert_eq!(
            etf_outlook(Some(0.2), Some(0.1), None, 1.4),
            "Short-term surge - Watch follow-through"
        );
        assert_eq!(
            etf_outlook(Some(-0.2), Some(0.1), None, -1.4),
            "Short-term pressure - Avoid fresh entries"
        );
        assert_eq!(
            etf_outlook(None, None, None, f64::NAN),
            "Sideways / volatile - Wait for clear trend"
        );
    }

    #[test]
    fn row_carries_moving_average_columns() {
        let bench = series(&trend(30, 0.2));
        let result = evaluate(
            &inst("GOLDBEES"),
            &series(&trend(30, 1.0)),
            &bench,
            RsPeriods::default(),
            chrono::Utc::now(),
        )
        .unwrap();
        let row = EtfRow::from(&result);

        assert_eq!(row.code, "NIFTY GOLDBEES");
        assert!(row.dma_20.is_some());
        assert!(row.pct_from_dma_20.unwrap() > 0.0);
        // 30 bars cannot cover 21/55/123-bar windows past the short one.
        assert!(row.rs_short.is_some());
        assert_eq!(row.rs_medium, None);
        assert_eq!(etf_rows(&[result.clone()]).len(), 1);

        let cached = RsResult { cached: true, ..result };
        assert_eq!(EtfRow::from(&cached).outlook, CACHED_NARRATIVE);
    }
}
