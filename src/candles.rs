use chrono::NaiveDate;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Candle {
    pub fn has_valid_close(&self) -> bool {
        self.close.is_finite() && self.close > 0.0
    }
}

/// Daily bars for one instrument: ascending, one bar per date, every close
/// strictly positive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandleSeries {
    candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new(mut candles: Vec<Candle>) -> Self {
        let raw_len = candles.len();
        candles.retain(Candle::has_valid_close);

        // Stable sort keeps arrival order within a date, so the later bar wins.
        candles.sort_by_key(|c| c.timestamp);
        let mut deduped: Vec<Candle> = Vec::with_capacity(candles.len());
        for candle in candles {
            match deduped.last_mut() {
                Some(last) if last.timestamp == candle.timestamp => *last = candle,
                _ => deduped.push(candle),
            }
        }

        if deduped.len() != raw_len {
            debug!(
                raw = raw_len,
                kept = deduped.len(),
                "dropped invalid or duplicate bars"
            );
        }

        Self { candles: deduped }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.candles.last().map(|c| c.close)
    }

    /// Close of the bar before the last one. A single-bar series reports its
    /// own close so the day change degenerates to zero.
    pub fn previous_close(&self) -> Option<f64> {
        match self.candles.len() {
            0 => None,
            1 => self.last_close(),
            n => Some(self.candles[n - 2].close),
        }
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.candles.last().map(|c| c.timestamp)
    }
}

impl FromIterator<Candle> for CandleSeries {
    fn from_iter<I: IntoIterator<Item = Candle>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

// --- Lenient numeric parsing for broker payloads ---

struct LenientF64Visitor;

impl<'de> Visitor<'de> for LenientF64Visitor {
    type Value = Option<f64>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a float, an integer, or a string representing a number")
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E> {
        Ok(Some(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
        Ok(Some(v as f64))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Some(v as f64))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v.trim().is_empty() {
            Ok(None)
        } else {
            v.trim().parse::<f64>().map(Some).map_err(E::custom)
        }
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_none<E>(self) -> Result<Self::Value, E> {
        Ok(None)
    }
}

pub(crate) fn deserialize_f64_lenient<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(LenientF64Visitor)
}

/// One `[timestamp, open, high, low, close, volume]` row as the broker sends it.
#[derive(Deserialize, Debug)]
pub(crate) struct RawCandle(
    String,
    #[serde(deserialize_with = "deserialize_f64_lenient")] Option<f64>,
    #[serde(deserialize_with = "deserialize_f64_lenient")] Option<f64>,
    #[serde(deserialize_with = "deserialize_f64_lenient")] Option<f64>,
    #[serde(deserialize_with = "deserialize_f64_lenient")] Option<f64>,
    #[serde(deserialize_with = "deserialize_f64_lenient")] Option<f64>,
);

impl RawCandle {
    /// Missing close or an unreadable timestamp drops the row. Missing
    /// open/high/low fall back to the close.
    pub(crate) fn into_candle(self) -> Option<Candle> {
        let RawCandle(ts, open, high, low, close, volume) = self;
        let timestamp = parse_bar_date(&ts)?;
        let close = close?;
        Some(Candle {
            timestamp,
            open: open.unwrap_or(close),
            high: high.unwrap_or(close),
            low: low.unwrap_or(close),
            close,
            volume: volume.filter(|v| v.is_finite() && *v >= 0.0).unwrap_or(0.0) as u64,
        })
    }
}

fn parse_bar_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    // Fall back to the leading `YYYY-MM-DD`.
    raw.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}
