//! Outbound connection to the `OpenAI`-compatible backend.
//!
//! [`Backend`] is the seam between the gateway and the network: [`HttpBackend`] talks to a
//! real endpoint with `reqwest`, tests plug in their own implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{self, BoxStream, Stream, StreamExt};

use crate::config::{BackendEndpoint, GatewayConfig};
use crate::error::{GatewayError, Result};
use crate::tiers::Tier;
use crate::translate::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatErrorResponse,
};

/// One item of a backend stream.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Chunk(ChatCompletionChunk),
    /// An error payload sent in place of a chunk.
    Error(ChatErrorResponse),
}

type AbortHook = Box<dyn FnOnce() + Send>;

/// A lazy sequence of backend chunks that can be aborted.
pub struct UpstreamStream {
    events: BoxStream<'static, Result<UpstreamEvent>>,
    on_abort: Option<AbortHook>,
    aborted: bool,
}

impl UpstreamStream {
    pub fn new(events: impl Stream<Item = Result<UpstreamEvent>> + Send + 'static) -> Self {
        Self {
            events: events.boxed(),
            on_abort: None,
            aborted: false,
        }
    }

    /// Run `hook` when the stream is aborted.
    #[must_use]
    pub fn with_abort_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_abort = Some(Box::new(hook));
        self
    }

    pub async fn next(&mut self) -> Option<Result<UpstreamEvent>> {
        self.events.next().await
    }

    /// Drop the underlying connection. Returns `false` if it was already aborted.
    pub fn abort(&mut self) -> bool {
        if self.aborted {
            return false;
        }
        self.aborted = true;
        self.events = stream::empty().boxed();
        if let Some(hook) = self.on_abort.take() {
            hook();
        }
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }
}

impl std::fmt::Debug for UpstreamStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamStream")
            .field("aborted", &self.aborted)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Issue a non-streaming request.
    async fn complete(&self, req: &ChatCompletionRequest) -> Result<ChatCompletionResponse>;

    /// Issue a streaming request. Resolves once the backend has accepted it.
    async fn stream(&self, req: &ChatCompletionRequest) -> Result<UpstreamStream>;
}

pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: BackendEndpoint,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(client: reqwest::Client, endpoint: BackendEndpoint, timeout: Duration) -> Self {
        Self {
            client,
            endpoint,
            timeout,
        }
    }

    fn url(&self) -> String {
        let base = self.endpoint.base_url.trim_end_matches('/');
        match self.endpoint.azure_api_version {
            Some(ref version) => format!("{base}/chat/completions?api-version={version}"),
            None => format!("{base}/chat/completions"),
        }
    }

    fn request(&self, req: &ChatCompletionRequest) -> reqwest::RequestBuilder {
        let builder = self.client.post(self.url()).json(req);
        if self.endpoint.azure_api_version.is_some() {
            builder.header("api-key", &self.endpoint.api_key)
        } else {
            builder.bearer_auth(&self.endpoint.api_key)
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), body_len = body.len(), "Backend returned an error");
        Err(GatewayError::upstream(status.as_u16(), body))
    }
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn complete(&self, req: &ChatCompletionRequest) -> Result<ChatCompletionResponse> {
        tracing::debug!(url = %self.endpoint.base_url, model = %req.model, "POST chat/completions");

        let response = self.request(req).timeout(self.timeout).send().await?;
        let response = Self::check_status(response).await?;
        let body = response.text().await?;

        serde_json::from_str(&body).map_err(|e| {
            tracing::warn!(error = %e, body_len = body.len(), "Backend response did not parse");
            GatewayError::malformed(e.to_string())
        })
    }

    async fn stream(&self, req: &ChatCompletionRequest) -> Result<UpstreamStream> {
        tracing::debug!(url = %self.endpoint.base_url, model = %req.model, "POST chat/completions (streaming)");

        // The timeout covers connecting and the response headers; the body may stream for longer.
        let response = tokio::time::timeout(self.timeout, self.request(req).send())
            .await
            .map_err(|_| GatewayError::Timeout)??;
        let response = Self::check_status(response).await?;

        Ok(UpstreamStream::new(decode_sse(response.bytes_stream())))
    }
}

/// Turn the backend's SSE body into chunks. `[DONE]` ends the stream.
fn decode_sse<S, E>(bytes: S) -> impl Stream<Item = Result<UpstreamEvent>> + Send + 'static
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let events = bytes.eventsource();
        tokio::pin!(events);

        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    let data = event.data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    if data == "[DONE]" {
                        break;
                    }
                    if let Some(decoded) = decode_data(data) {
                        yield Ok(decoded);
                    }
                }
                Err(e) => {
                    yield Err(GatewayError::stream(e.to_string()));
                    break;
                }
            }
        }
    }
}

/// Decode one `data:` payload. Unparseable payloads are logged and skipped.
fn decode_data(data: &str) -> Option<UpstreamEvent> {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping unparseable stream chunk");
            return None;
        }
    };

    let decoded = if value.get("error").is_some() {
        serde_json::from_value(value).map(UpstreamEvent::Error)
    } else {
        serde_json::from_value(value).map(UpstreamEvent::Chunk)
    };

    match decoded {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping stream chunk with an unexpected shape");
            None
        }
    }
}

/// The backends a gateway talks to: one by default, optionally a separate one for the
/// small tier. Built once at startup and shared read-only.
#[derive(Clone)]
pub struct Backends {
    default: Arc<dyn Backend>,
    small: Option<Arc<dyn Backend>>,
}

impl Backends {
    pub fn new(default: Arc<dyn Backend>) -> Self {
        Self {
            default,
            small: None,
        }
    }

    #[must_use]
    pub fn with_small(mut self, small: Arc<dyn Backend>) -> Self {
        self.small = Some(small);
        self
    }

    pub fn from_config(config: &GatewayConfig, client: reqwest::Client) -> Result<Self> {
        let timeout = config.request_timeout();
        let endpoint = config.backend_endpoint()?;
        tracing::info!(base_url = %endpoint.base_url, "Backend configured");

        let mut backends = Self::new(Arc::new(HttpBackend::new(client.clone(), endpoint, timeout)));
        if let Some(small) = config.small_backend_endpoint()? {
            tracing::info!(base_url = %small.base_url, "Separate small-tier backend configured");
            backends = backends.with_small(Arc::new(HttpBackend::new(client, small, timeout)));
        }
        Ok(backends)
    }

    pub fn for_tier(&self, tier: Tier) -> &Arc<dyn Backend> {
        match (tier, &self.small) {
            (Tier::Small, Some(small)) => small,
            _ => &self.default,
        }
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("separate_small", &self.small.is_some())
            .finish()
    }
}
