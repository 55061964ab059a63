use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("rate limited by broker for token {token}")]
    RateLimited { token: String },

    #[error("broker server error for token {token}: {message}")]
    TransientServer { token: String, message: String },

    #[error("no candle data returned for token {token}")]
    NoData { token: String },

    #[error("malformed candle payload for token {token}: {message}")]
    Malformed { token: String, message: String },

    #[error("broker rejected request for token {token} ({code}): {message}")]
    Rejected {
        token: String,
        code: String,
        message: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("giving up on token {token} after {attempts} attempts: {last}")]
    RetriesExhausted {
        token: String,
        attempts: u32,
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Only upstream server hiccups are worth another attempt. Rate limits
    /// must fall back to cached data immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientServer { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::RetriesExhausted { last, .. } => last.is_rate_limited(),
            _ => false,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("RS period must be a positive bar count, got {0}")]
    ZeroPeriod(usize),

    #[error("lookback_days must be positive")]
    ZeroLookback,

    #[error("instrument list for {0} is empty")]
    NoInstruments(&'static str),

    #[error("at most {max} broker retries are allowed, got {got}")]
    TooManyRetries { got: usize, max: usize },

    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        let transient = FetchError::TransientServer {
            token: "1".into(),
            message: "AB1004".into(),
        };
        let limited = FetchError::RateLimited { token: "1".into() };
        let empty = FetchError::NoData { token: "1".into() };

        assert!(transient.is_retryable());
        assert!(!limited.is_retryable());
        assert!(!empty.is_retryable());
    }

    #[test]
    fn exhausted_wrapper_keeps_rate_limit_flag() {
        let err = FetchError::RetriesExhausted {
            token: "1".into(),
            attempts: 3,
            last: Box::new(FetchError::RateLimited { token: "1".into() }),
        };
        assert!(err.is_rate_limited());
        assert!(!err.is_retryable());
    }

    #[test]
    fn display_includes_token() {
        let err = FetchError::NoData {
            token: "99926009".into(),
        };
        assert_eq!(err.to_string(), "no candle data returned for token 99926009");
    }
}
