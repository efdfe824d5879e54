// =============================================================================
// Error taxonomy for connectors
// =============================================================================
//
// REST failures never leave the connector as errors: `RestClient` logs them
// and hands callers `None`. The typed variants exist so the single logging
// site can say exactly what went wrong.
// =============================================================================

use thiserror::Error;

/// Failure of one REST round trip.
#[derive(Debug, Error)]
pub enum RestError {
    /// DNS, connect, reset, timeout. The outcome on the exchange is unknown.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-2xx response, including signature rejections.
    #[error("HTTP {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    /// 2xx response whose body is not the JSON we expected.
    #[error("undecodable response body: {0}")]
    Decode(String),
}

/// Errors surfaced while building a connector.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
