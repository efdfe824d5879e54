// =============================================================================
// REST client — one request primitive shared by every connector
// =============================================================================
//
// Callers get `Option<Value>`: `None` means "the operation did not happen as
// far as we know", never "it happened and returned nothing". The typed
// `RestError` only exists up to the single logging site in `request`.
// =============================================================================

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, Instrument, Span};

use super::signer::{Params, RequestSigner, SignedRequest};
use crate::error::{ConnectorError, RestError};
use crate::types::Exchange;

/// The HTTP verbs the exchanges' order APIs need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "DELETE" => Ok(Self::Delete),
            other => anyhow::bail!("unsupported HTTP method '{other}'"),
        }
    }
}

/// HTTP client bound to one exchange's base URL and signing scheme.
#[derive(Clone)]
pub struct RestClient {
    exchange: Exchange,
    base_url: String,
    signer: Arc<dyn RequestSigner>,
    client: reqwest::Client,
    span: Span,
}

impl RestClient {
    /// Build a client whose every request gives up after `timeout`.
    pub fn new(
        exchange: Exchange,
        base_url: impl Into<String>,
        signer: Arc<dyn RequestSigner>,
        timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        debug!(%exchange, base_url = %base_url, "RestClient initialised");

        Ok(Self {
            exchange,
            base_url,
            signer,
            client,
            span: Span::none(),
        })
    }

    /// Log every request inside `span` (the owning connector's span).
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Unauthenticated request.
    pub async fn request(&self, method: HttpMethod, endpoint: &str, params: Params) -> Option<Value> {
        let unsigned = SignedRequest {
            query: params,
            headers: Vec::new(),
        };
        self.dispatch(method, endpoint, unsigned).await
    }

    /// Request authenticated with this exchange's signing scheme. Signing
    /// happens immediately before transmission so the signed and sent
    /// payloads are the same bytes.
    pub async fn signed_request(
        &self,
        method: HttpMethod,
        endpoint: &str,
        params: Params,
    ) -> Option<Value> {
        let signed = self.signer.sign(method, endpoint, params);
        self.dispatch(method, endpoint, signed).await
    }

    async fn dispatch(&self, method: HttpMethod, endpoint: &str, req: SignedRequest) -> Option<Value> {
        let result = self
            .execute(method, endpoint, req)
            .instrument(self.span.clone())
            .await;

        let _entered = self.span.enter();
        match result {
            Ok(body) => Some(body),
            Err(RestError::Status { status, body }) => {
                error!(
                    exchange = %self.exchange,
                    %method,
                    endpoint,
                    code = status.as_u16(),
                    body = %body,
                    "exchange rejected request"
                );
                None
            }
            Err(e) => {
                error!(exchange = %self.exchange, %method, endpoint, error = %e, "request failed");
                None
            }
        }
    }

    async fn execute(
        &self,
        method: HttpMethod,
        endpoint: &str,
        req: SignedRequest,
    ) -> Result<Value, RestError> {
        let url = format!("{}{}", self.base_url, endpoint);

        let mut builder = match method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Delete => self.client.delete(&url),
        };
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        for (name, value) in &req.headers {
            builder = builder.header(*name, value);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(RestError::Status { status, body: text });
        }

        let body = serde_json::from_str(&text).map_err(|e| RestError::Decode(format!("{e}: {text}")))?;
        debug!(exchange = %self.exchange, %method, endpoint, "request succeeded");
        Ok(body)
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("exchange", &self.exchange)
            .field("base_url", &self.base_url)
            .finish()
    }
}
