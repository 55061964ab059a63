use crate::candles::{Candle, CandleSeries, RawCandle};
use crate::clock::{Clock, Sleeper, SystemClock, TokioSleeper};
use crate::error::{ConfigError, FetchError};
use crate::retry::{RetryPolicy, fetch_with_retry};
use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_BASE_URL: &str = "https://apiconnect.angelone.in";
const CANDLE_PATH: &str = "/rest/secure/angelbroking/historical/v1/getCandleData";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

static RATE_LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)exceed(ing|ed)?\s+access\s+rate").expect("static regex"));
static SERVER_ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)something\s+went\s+wrong|AB1004").expect("static regex"));

/// Anything that can hand back daily candles for a broker token.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn fetch_candles(
        &self,
        token: &str,
        lookback_days: u32,
        exchange: &str,
    ) -> Result<CandleSeries, FetchError>;
}

#[async_trait]
impl<T: CandleSource + ?Sized> CandleSource for Arc<T> {
    async fn fetch_candles(
        &self,
        token: &str,
        lookback_days: u32,
        exchange: &str,
    ) -> Result<CandleSeries, FetchError> {
        (**self).fetch_candles(token, lookback_days, exchange).await
    }
}

#[derive(Debug, Clone)]
pub struct BrokerCredentials {
    pub api_key: String,
    pub jwt_token: String,
}

impl BrokerCredentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: env_required("ANGEL_API_KEY")?,
            jwt_token: env_required("ANGEL_JWT_TOKEN")?,
        })
    }
}

fn env_required(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(ConfigError::MissingEnv(name))
}

#[derive(Serialize)]
struct CandleRequest<'a> {
    exchange: &'a str,
    symboltoken: &'a str,
    interval: &'a str,
    fromdate: String,
    todate: String,
}

#[derive(Deserialize, Debug)]
struct CandleResponse {
    #[serde(default)]
    status: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    errorcode: String,
    #[serde(default)]
    data: Option<Vec<Value>>,
}

/// SmartAPI historical-candle client. Stateless between calls apart from the
/// pooled HTTP connection.
pub struct AngelOneClient<Z = TokioSleeper, C = SystemClock> {
    http: Client,
    base_url: String,
    credentials: BrokerCredentials,
    policy: RetryPolicy,
    sleeper: Z,
    clock: C,
}

impl AngelOneClient {
    pub fn new(credentials: BrokerCredentials, policy: RetryPolicy) -> anyhow::Result<Self> {
        let base_url = std::env::var("ANGEL_BASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self::with_parts(base_url, credentials, policy, TokioSleeper, SystemClock)
    }
}

impl<Z: Sleeper, C: Clock> AngelOneClient<Z, C> {
    pub fn with_parts(
        base_url: impl Into<String>,
        credentials: BrokerCredentials,
        policy: RetryPolicy,
        sleeper: Z,
        clock: C,
    ) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            policy,
            sleeper,
            clock,
        })
    }

    fn build_request<'a>(&self, token: &'a str, lookback_days: u32, exchange: &'a str) -> CandleRequest<'a> {
        let to = self.clock.now_ist().date_naive();
        let from = to - chrono::Duration::days(i64::from(lookback_days));
        CandleRequest {
            exchange,
            symboltoken: token,
            interval: "ONE_DAY",
            fromdate: format!("{} 09:15", from.format("%Y-%m-%d")),
            todate: format!("{} 15:30", to.format("%Y-%m-%d")),
        }
    }

    async fn request_once(
        &self,
        token: &str,
        lookback_days: u32,
        exchange: &str,
        attempt: u32,
    ) -> Result<CandleSeries, FetchError> {
        let url = format!("{}{}", self.base_url, CANDLE_PATH);
        let body = self.build_request(token, lookback_days, exchange);
        debug!(token, attempt, from = %body.fromdate, to = %body.todate, "requesting candles");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.credentials.jwt_token)
            .header("X-PrivateKey", &self.credentials.api_key)
            .header("X-UserType", "USER")
            .header("X-SourceID", "WEB")
            .header("X-ClientLocalIP", "127.0.0.1")
            .header("X-ClientPublicIP", "127.0.0.1")
            .header("X-MACAddress", "00:00:00:00:00:00")
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        classify_response(token, status, &text)
    }
}

#[async_trait]
impl<Z: Sleeper, C: Clock> CandleSource for AngelOneClient<Z, C> {
    async fn fetch_candles(
        &self,
        token: &str,
        lookback_days: u32,
        exchange: &str,
    ) -> Result<CandleSeries, FetchError> {
        if lookback_days == 0 {
            return Err(FetchError::InvalidRequest(
                "lookback_days must be positive".into(),
            ));
        }
        if token.trim().is_empty() {
            return Err(FetchError::InvalidRequest("empty instrument token".into()));
        }

        let series = fetch_with_retry(&self.policy, &self.sleeper, token, |attempt| {
            self.request_once(token, lookback_days, exchange, attempt)
        })
        .await;

        match &series {
            Ok(s) => info!(token, bars = s.len(), "fetched candles"),
            Err(e) => warn!(token, error = %e, "candle fetch failed"),
        }
        series
    }
}

/// Maps a raw HTTP outcome onto the fetch error taxonomy.
fn classify_response(token: &str, status: StatusCode, text: &str) -> Result<CandleSeries, FetchError> {
    if status == StatusCode::TOO_MANY_REQUESTS || RATE_LIMIT_RE.is_match(text) {
        return Err(FetchError::RateLimited {
            token: token.to_string(),
        });
    }
    if status.is_server_error() {
        return Err(FetchError::TransientServer {
            token: token.to_string(),
            message: format!("HTTP {}", status.as_u16()),
        });
    }

    let parsed: CandleResponse = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(e) if !status.is_success() => {
            return Err(FetchError::Rejected {
                token: token.to_string(),
                code: status.as_u16().to_string(),
                message: e.to_string(),
            });
        }
        Err(e) => {
            return Err(FetchError::Malformed {
                token: token.to_string(),
                message: e.to_string(),
            });
        }
    };

    if !parsed.status {
        if SERVER_ERROR_RE.is_match(&parsed.errorcode) || SERVER_ERROR_RE.is_match(&parsed.message) {
            return Err(FetchError::TransientServer {
                token: token.to_string(),
                message: format!("{} {}", parsed.errorcode, parsed.message).trim().to_string(),
            });
        }
        return Err(FetchError::Rejected {
            token: token.to_string(),
            code: parsed.errorcode,
            message: parsed.message,
        });
    }

    let rows = match parsed.data {
        Some(rows) if !rows.is_empty() => rows,
        _ => {
            return Err(FetchError::NoData {
                token: token.to_string(),
            });
        }
    };

    let row_count = rows.len();
    let candles: Vec<Candle> = rows
        .into_iter()
        .filter_map(|row| serde_json::from_value::<RawCandle>(row).ok())
        .filter_map(RawCandle::into_candle)
        .collect();

    let series = CandleSeries::new(candles);
    if series.is_empty() {
        return Err(FetchError::Malformed {
            token: token.to_string(),
            message: format!("none of {row_count} rows held a usable close"),
        });
    }
    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::{FixedClock, RecordingSleeper};
    use chrono::{TimeZone, Utc};

    const OK_BODY: &str = r#"{
        "status": true, "message": "SUCCESS", "errorcode": "",
        "data": [
            ["2024-03-04T00:00:00+05:30", 22300, 22400, 22250, 22405.6, 0],
            ["2024-03-01T00:00:00+05:30", 22000, 22350, 21990, "22338.75", 0]
        ]
    }"#;

    #[test]
    fn success_payload_is_sorted_ascending() {
        let series = classify_response("99926000", StatusCode::OK, OK_BODY).unwrap();
        assert_eq!(series.closes(), vec![22338.75, 22405.6]);
    }

    #[test]
    fn access_rate_message_is_rate_limited() {
        let err = classify_response(
            "1",
            StatusCode::FORBIDDEN,
            "Access denied because of exceeding access rate",
        )
        .unwrap_err();
        assert!(matches!(err, FetchError::RateLimited { .. }));

        let err = classify_response("1", StatusCode::TOO_MANY_REQUESTS, "").unwrap_err();
        assert!(matches!(err, FetchError::RateLimited { .. }));
    }

    #[test]
    fn server_failures_are_transient() {
        let err = classify_response("1", StatusCode::BAD_GATEWAY, "").unwrap_err();
        assert!(err.is_retryable());

        let body = r#"{"status": false, "message": "Something Went Wrong, Please Try After Sometime", "errorcode": "AB1004", "data": null}"#;
        let err = classify_response("1", StatusCode::OK, body).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn empty_data_is_no_data() {
        let body = r#"{"status": true, "message": "SUCCESS", "errorcode": "", "data": []}"#;
        let err = classify_response("1", StatusCode::OK, body).unwrap_err();
        assert!(matches!(err, FetchError::NoData { .. }));

        let body = r#"{"status": true, "message": "SUCCESS", "errorcode": "", "data": null}"#;
        let err = classify_response("1", StatusCode::OK, body).unwrap_err();
        assert!(matches!(err, FetchError::NoData { .. }));
    }

    #[test]
    fn other_broker_errors_are_rejections() {
        let body = r#"{"status": false, "message": "Invalid Token", "errorcode": "AG8001", "data": null}"#;
        let err = classify_response("1", StatusCode::OK, body).unwrap_err();
        assert!(matches!(err, FetchError::Rejected { ref code, .. } if code == "AG8001"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn garbage_body_is_malformed() {
        let err = classify_response("1", StatusCode::OK, "<html>").unwrap_err();
        assert!(matches!(err, FetchError::Malformed { .. }));

        let body = r#"{"status": true, "data": [["bad", 1, 1, 1, null, 1]]}"#;
        let err = classify_response("1", StatusCode::OK, body).unwrap_err();
        assert!(matches!(err, FetchError::Malformed { .. }));
    }

    fn client() -> AngelOneClient<RecordingSleeper, FixedClock> {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 5, 4, 0, 0).unwrap());
        AngelOneClient::with_parts(
            "http://127.0.0.1:9/",
            BrokerCredentials {
                api_key: "key".into(),
                jwt_token: "jwt".into(),
            },
            RetryPolicy::default(),
            RecordingSleeper::default(),
            clock,
        )
        .unwrap()
    }

    #[test]
    fn request_window_spans_lookback_in_ist() {
        let c = client();
        let req = c.build_request("99926009", 400, "NSE");
        assert_eq!(req.todate, "2024-03-05 15:30");
        assert_eq!(req.fromdate, "2023-01-30 09:15");
        assert_eq!(req.interval, "ONE_DAY");
        assert_eq!(c.base_url, "http://127.0.0.1:9");
    }

    #[tokio::test]
    async fn zero_lookback_is_rejected_before_any_request() {
        let err = client().fetch_candles("1", 0, "NSE").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest(_)));
        let err = client().fetch_candles("  ", 10, "NSE").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }
}
