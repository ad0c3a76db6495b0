use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Upstream API key not configured. Set FAIRWAY_UPSTREAM_KEY or upstream.api_key in the config file.")]
    NoApiKey,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid or unreadable session token")]
    InvalidSession,

    #[error("Rate limit exceeded. Please try again later.")]
    RateLimited {
        retry_after_secs: u64,
        remaining: u64,
    },

    #[error("Upstream returned client error {status}")]
    Upstream4xx { status: u16, body: String },

    #[error("Upstream returned server error {status}")]
    Upstream5xx { status: u16 },

    #[error("Upstream request timed out after {0} seconds")]
    UpstreamTimeout(u64),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Upstream unavailable after {attempts} attempts")]
    UpstreamUnavailable { attempts: u32 },

    #[error("Circuit breaker is open for endpoint '{0}'")]
    CircuitOpen(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Encryption failure: {0}")]
    Crypto(String),

    #[error("Transformation failed: {0}")]
    Transform(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Check if the error is retryable against the upstream
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::UpstreamTimeout(_) | Self::Upstream5xx { .. } => true,
            // 429 from upstream is retryable with backoff; other 4xx are not
            Self::Upstream4xx { status, .. } => *status == 429,
            _ => false,
        }
    }

    /// HTTP status code surfaced to the client for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::InvalidSession => 401,
            Self::RateLimited { .. } => 429,
            Self::Upstream4xx { status, .. } => *status,
            Self::CircuitOpen(_) => 503,
            Self::Upstream5xx { .. }
            | Self::UpstreamTimeout(_)
            | Self::Network(_)
            | Self::UpstreamUnavailable { .. } => 502,
            _ => 500,
        }
    }

    /// Stable machine-readable code used in the response envelope
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoApiKey => "NO_API_KEY",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::InvalidSession => "INVALID_SESSION",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Upstream4xx { .. } => "UPSTREAM_CLIENT_ERROR",
            Self::Upstream5xx { .. } => "UPSTREAM_SERVER_ERROR",
            Self::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
            Self::Network(_) => "UPSTREAM_NETWORK",
            Self::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
            Self::Config(_) => "CONFIG",
            Self::Crypto(_) => "CRYPTO",
            Self::Transform(_) => "TRANSFORM",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Io(_) => "IO",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Client-safe message. Internal detail (paths, key material, upstream
    /// bodies) stays in the logs.
    pub fn sanitized_message(&self) -> String {
        match self {
            Self::BadRequest(msg) => format!("Bad request: {msg}"),
            Self::InvalidSession => "Session token was missing or invalid".to_string(),
            Self::RateLimited {
                retry_after_secs, ..
            } => {
                format!("Rate limit exceeded; retry after {retry_after_secs} seconds")
            }
            Self::Upstream4xx { status, .. } => {
                format!("Upstream rejected the request with status {status}")
            }
            Self::CircuitOpen(endpoint) => {
                format!("Service temporarily unavailable for '{endpoint}'")
            }
            Self::Upstream5xx { .. }
            | Self::UpstreamTimeout(_)
            | Self::Network(_)
            | Self::UpstreamUnavailable { .. } => "Upstream data feed is unavailable".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProxyError::Upstream5xx { status: 500 }.is_retryable());
        assert!(ProxyError::UpstreamTimeout(30).is_retryable());
        assert!(ProxyError::Upstream4xx {
            status: 429,
            body: String::new()
        }
        .is_retryable());
        assert!(!ProxyError::Upstream4xx {
            status: 404,
            body: String::new()
        }
        .is_retryable());
        assert!(!ProxyError::BadRequest("x".into()).is_retryable());
        assert!(!ProxyError::CircuitOpen("rankings".into()).is_retryable());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ProxyError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(ProxyError::InvalidSession.status_code(), 401);
        assert_eq!(
            ProxyError::RateLimited {
                retry_after_secs: 60,
                remaining: 0
            }
            .status_code(),
            429
        );
        assert_eq!(
            ProxyError::Upstream4xx {
                status: 404,
                body: String::new()
            }
            .status_code(),
            404
        );
        assert_eq!(ProxyError::CircuitOpen("x".into()).status_code(), 503);
        assert_eq!(
            ProxyError::UpstreamUnavailable { attempts: 3 }.status_code(),
            502
        );
    }

    #[test]
    fn sanitized_messages_hide_detail() {
        let err = ProxyError::Internal("panic in transformer at src/transform/mod.rs".into());
        assert_eq!(err.sanitized_message(), "Internal server error");

        let err = ProxyError::Upstream5xx { status: 503 };
        assert!(!err.sanitized_message().contains("503"));
    }
}
