//! Fetch Orchestration
//!
//! One logical resource fetch: persistent cache first, network second, and —
//! when the interpreter approves — a compressed write-back through the cache
//! context (evicting older groups if the budget requires it).
//!
//! The orchestrator mutates no record state itself. It reports a disposition
//! the caller applies to the relevant [`Status`], which keeps the borrow of
//! the build record inside the interpret closure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::build::Status;
use crate::cache::CacheContext;
use crate::error::{Error, Result};
use crate::signal::ChangeSignal;

// =============================================================================
// Transport
// =============================================================================

/// Why a GET produced no payload
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server answered with a non-success status
    #[error("HTTP status {0}")]
    Status(u16),
    /// The request never completed
    #[error("Network error: {0}")]
    Network(String),
}

impl TransportError {
    /// HTTP status code, when the failure was an HTTP answer
    pub fn http_status(&self) -> Option<u16> {
        match self {
            TransportError::Status(code) => Some(*code),
            TransportError::Network(_) => None,
        }
    }
}

/// Text-fetching seam. Production uses [`HttpTransport`]; tests use
/// [`MockTransport`] to script responses and record issued requests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET a URL expecting a raw text body
    async fn get_text(&self, url: &str) -> std::result::Result<String, TransportError>;
}

/// reqwest-backed transport with a per-request timeout
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with the given request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::HttpClient)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_text(&self, url: &str) -> std::result::Result<String, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))
    }
}

/// Scripted transport for tests and offline runs: canned responses per URL,
/// with every issued request recorded.
#[derive(Default)]
pub struct MockTransport {
    responses: parking_lot::Mutex<std::collections::HashMap<String, MockResponse>>,
    requests: parking_lot::Mutex<Vec<String>>,
}

enum MockResponse {
    Body(String),
    Status(u16),
}

impl MockTransport {
    /// Empty transport; unknown URLs answer 404
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a 200 response for a URL
    pub fn insert(&self, url: &str, body: &str) {
        self.responses
            .lock()
            .insert(url.to_string(), MockResponse::Body(body.to_string()));
    }

    /// Script a failing status code for a URL
    pub fn insert_status(&self, url: &str, code: u16) {
        self.responses
            .lock()
            .insert(url.to_string(), MockResponse::Status(code));
    }

    /// Every URL requested so far, in order
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    /// How many times a specific URL was requested
    pub fn request_count(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|r| *r == url).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get_text(&self, url: &str) -> std::result::Result<String, TransportError> {
        self.requests.lock().push(url.to_string());
        match self.responses.lock().get(url) {
            Some(MockResponse::Body(body)) => Ok(body.clone()),
            Some(MockResponse::Status(code)) => Err(TransportError::Status(*code)),
            None => Err(TransportError::Status(404)),
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// What the interpret hook tells the orchestrator about a fresh payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheVerdict {
    /// Payload is known-final; persist it under the group's timestamp.
    /// Carrying the timestamp here (instead of sharing it between closures)
    /// keeps the per-fetch state explicit.
    Store { timestamp: i64 },
    /// Payload interpreted fine but may still change; do not cache
    Skip,
}

/// How one resource fetch concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDisposition {
    /// Served from the persistent cache
    CacheHit,
    /// Fetched over the network; `persisted` is false when the budget or the
    /// backend declined the cache write (fetch still succeeded)
    Fetched { persisted: bool },
    /// Payload arrived but the interpret hook rejected it
    InterpretFailed { from_cache: bool },
    /// The request failed; `http_status` is set for HTTP-level answers
    TransportFailed { http_status: Option<u16> },
}

impl FetchDisposition {
    /// Whether this outcome counts as a failed fetch
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            FetchDisposition::InterpretFailed { .. } | FetchDisposition::TransportFailed { .. }
        )
    }

    /// Fold this outcome into a status object. Every disposition is
    /// terminal for the attempt, so `loaded` is always set.
    pub fn apply_to(&self, status: &mut Status) {
        if self.is_failure() {
            status.mark_failed();
        } else {
            status.mark_loaded();
        }
    }
}

/// Cache-first fetcher shared by all lanes
pub struct FetchOrchestrator<T: Transport> {
    ctx: Arc<CacheContext>,
    transport: T,
    signal: Arc<ChangeSignal>,
}

impl<T: Transport> FetchOrchestrator<T> {
    /// Create an orchestrator over a cache context and transport
    pub fn new(ctx: Arc<CacheContext>, transport: T, signal: Arc<ChangeSignal>) -> Self {
        Self {
            ctx,
            transport,
            signal,
        }
    }

    /// The shared cache context
    pub fn context(&self) -> &CacheContext {
        &self.ctx
    }

    /// The underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The change signal consumers wait on
    pub fn signal(&self) -> &Arc<ChangeSignal> {
        &self.signal
    }

    /// GET a URL with no cache involvement. Used for index endpoints whose
    /// payloads change on every poll.
    pub async fn fetch_uncached(&self, url: &str) -> std::result::Result<String, TransportError> {
        debug!(url, "Fetching uncached");
        self.transport.get_text(url).await
    }

    /// Resolve one resource (`kind` of resource group `group`): cache first,
    /// then network, then — on a `Store` verdict — write-back with eviction.
    ///
    /// `interpret` runs exactly once, on whichever payload was obtained. Its
    /// error return marks the attempt failed and suppresses caching, so a
    /// malformed payload is retried on the next load instead of poisoning
    /// the cache.
    #[instrument(level = "debug", skip(self, interpret))]
    pub async fn fetch<F>(&self, group: &str, kind: &str, url: &str, interpret: F) -> FetchDisposition
    where
        F: FnOnce(&str) -> Result<CacheVerdict>,
    {
        if let Some(text) = self.ctx.lookup(group, kind) {
            // Verdict ignored: the payload is already cached.
            let disposition = match interpret(&text) {
                Ok(_) => FetchDisposition::CacheHit,
                Err(e) => {
                    warn!(group, kind, error = %e, "Failed to interpret cached payload");
                    FetchDisposition::InterpretFailed { from_cache: true }
                }
            };
            self.signal.mark();
            return disposition;
        }

        debug!(group, kind, url, "Fetching");
        let disposition = match self.transport.get_text(url).await {
            Ok(text) => match interpret(&text) {
                Ok(CacheVerdict::Store { timestamp }) => {
                    // Register before persisting: even if the write is then
                    // declined, the group stays accounted for eviction.
                    self.ctx.register_group(timestamp, group);
                    let persisted = self.ctx.persist(group, kind, &text, timestamp);
                    FetchDisposition::Fetched { persisted }
                }
                Ok(CacheVerdict::Skip) => FetchDisposition::Fetched { persisted: false },
                Err(e) => {
                    warn!(url, error = %e, "Failed to interpret fetched payload");
                    FetchDisposition::InterpretFailed { from_cache: false }
                }
            },
            Err(e) => {
                warn!(url, error = %e, "Failed to fetch");
                FetchDisposition::TransportFailed {
                    http_status: e.http_status(),
                }
            }
        };

        self.signal.mark();
        disposition
    }
}

// =============================================================================
// Tests
// =============================================================================
