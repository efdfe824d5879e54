// =============================================================================
// Request signing — HMAC-SHA256 over request parameters
// =============================================================================
//
// Two schemes share one trait:
//   - Query signature (Binance): timestamp + recvWindow are appended to the
//     parameters, the urlencoded string is signed, and the hex digest rides
//     along as the final `signature` parameter.
//   - Header expiry (BitMEX): `verb + path [+ "?" + query] + expires` is
//     signed, and key / expiry / signature travel as headers.
//
// SECURITY: the secret is never logged or serialized.
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::rest::HttpMethod;
use crate::error::ConnectorError;

type HmacSha256 = Hmac<Sha256>;

/// Ordered request parameters. Order is significant: it is the order that is
/// both signed and transmitted.
pub type Params = Vec<(String, String)>;

/// Default recv-window sent with every query-signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Seconds added to "now" to form a BitMEX `api-expires` value.
const EXPIRY_SKEW_SECS: u64 = 5;

/// API key + secret pair. Both must be non-empty.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    secret: String,
}

impl Credentials {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Result<Self, ConnectorError> {
        let api_key = api_key.into();
        let secret = secret.into();
        if api_key.trim().is_empty() {
            return Err(ConnectorError::MissingCredential("api key"));
        }
        if secret.trim().is_empty() {
            return Err(ConnectorError::MissingCredential("api secret"));
        }
        Ok(Self { api_key, secret })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Output of a signer: the exact parameters to transmit plus auth headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignedRequest {
    pub query: Params,
    pub headers: Vec<(&'static str, String)>,
}

/// Per-exchange authentication scheme.
pub trait RequestSigner: Send + Sync {
    /// Sign as if the clock read `now`.
    fn sign_at(
        &self,
        method: HttpMethod,
        path: &str,
        params: Params,
        now: SystemTime,
    ) -> SignedRequest;

    fn sign(&self, method: HttpMethod, path: &str, params: Params) -> SignedRequest {
        self.sign_at(method, path, params, SystemTime::now())
    }
}

/// Hex-encoded HMAC-SHA256 of `message` under `secret`.
pub fn hmac_sha256_hex(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// `application/x-www-form-urlencoded` rendering, identical to what reqwest
/// puts on the wire for `.query(&params)`.
pub fn encode_params(params: &[(String, String)]) -> String {
    serde_urlencoded::to_string(params).unwrap_or_default()
}

fn since_epoch(now: SystemTime) -> Duration {
    now.duration_since(UNIX_EPOCH).unwrap_or_default()
}

// -----------------------------------------------------------------------------
// Query-signature scheme
// -----------------------------------------------------------------------------

/// Binance-style signer: `signature` is appended as the last query parameter.
#[derive(Debug, Clone)]
pub struct QuerySigner {
    credentials: Credentials,
    recv_window: Option<u64>,
}

impl QuerySigner {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            recv_window: Some(RECV_WINDOW),
        }
    }

    /// Omit `recvWindow`; the exchange then applies its own default.
    pub fn without_recv_window(mut self) -> Self {
        self.recv_window = None;
        self
    }
}

impl RequestSigner for QuerySigner {
    fn sign_at(
        &self,
        _method: HttpMethod,
        _path: &str,
        mut params: Params,
        now: SystemTime,
    ) -> SignedRequest {
        let ts = since_epoch(now).as_millis();
        params.push(("timestamp".into(), ts.to_string()));
        if let Some(window) = self.recv_window {
            params.push(("recvWindow".into(), window.to_string()));
        }

        let signature = hmac_sha256_hex(&self.credentials.secret, &encode_params(&params));
        params.push(("signature".into(), signature));

        SignedRequest {
            query: params,
            headers: vec![("X-MBX-APIKEY", self.credentials.api_key.clone())],
        }
    }
}

// -----------------------------------------------------------------------------
// Header-expiry scheme
// -----------------------------------------------------------------------------

/// BitMEX-style signer: parameters are sent untouched, proof goes in headers.
#[derive(Debug, Clone)]
pub struct ExpirySigner {
    credentials: Credentials,
    skew_secs: u64,
}

impl ExpirySigner {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            skew_secs: EXPIRY_SKEW_SECS,
        }
    }

    fn message(method: HttpMethod, path: &str, params: &[(String, String)], expires: &str) -> String {
        if params.is_empty() {
            format!("{}{path}{expires}", method.as_str())
        } else {
            format!("{}{path}?{}{expires}", method.as_str(), encode_params(params))
        }
    }
}

impl RequestSigner for ExpirySigner {
    fn sign_at(
        &self,
        method: HttpMethod,
        path: &str,
        params: Params,
        now: SystemTime,
    ) -> SignedRequest {
        let expires = (since_epoch(now).as_secs() + self.skew_secs).to_string();
        let message = Self::message(method, path, &params, &expires);
        let signature = hmac_sha256_hex(&self.credentials.secret, &message);

        SignedRequest {
            query: params,
            headers: vec![
                ("api-expires", expires),
                ("api-key", self.credentials.api_key.clone()),
                ("api-signature", signature),
            ],
        }
    }
}
