//! JSON-over-HTTP push client.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use url::Url;

use super::envelope::Envelope;
use super::sender::RemoteClient;
use crate::exporter::ExportError;

/// Default request timeout (10 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum response body length kept in a status error.
const MAX_ERROR_BODY: usize = 256;

#[derive(Serialize)]
struct PushPayload<'a> {
    points: &'a [Envelope],
}

/// Buffers submitted envelopes and POSTs them as `{"points": [...]}` on
/// flush.
pub struct HttpPushClient {
    client: Client,
    endpoint: Url,
    headers: BTreeMap<String, String>,
    timeout: Duration,
    pending: Mutex<Vec<Envelope>>,
}

impl std::fmt::Debug for HttpPushClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPushClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpPushClient {
    /// Create a client.
    ///
    /// # Errors
    /// Returns `ExportError::Request` if the HTTP client cannot be built.
    pub fn new(
        endpoint: Url,
        headers: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, ExportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExportError::Request(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            headers,
            timeout,
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn take_pending(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait::async_trait]
impl RemoteClient for HttpPushClient {
    async fn submit(&self, envelope: &Envelope) -> Result<(), ExportError> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(envelope.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), ExportError> {
        let points = self.take_pending();
        if points.is_empty() {
            return Ok(());
        }

        let body = serde_json::to_vec(&PushPayload { points: &points })
            .map_err(|e| ExportError::Encode(e.to_string()))?;

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(classify(e)),
            Err(_) => return Err(ExportError::Timeout(format!("{:?}", self.timeout))),
        };

        let status = response.status();
        if status.is_success() {
            tracing::trace!(endpoint = %self.endpoint, points = points.len(), "Push accepted");
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if let Some((idx, _)) = body.char_indices().nth(MAX_ERROR_BODY) {
            body.truncate(idx);
        }
        Err(ExportError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn classify(e: reqwest::Error) -> ExportError {
    if e.is_timeout() {
        ExportError::Timeout(e.to_string())
    } else if e.is_connect() {
        ExportError::Connect(e.to_string())
    } else if let Some(status) = e.status() {
        ExportError::Status {
            status: status.as_u16(),
            body: e.to_string(),
        }
    } else {
        ExportError::Request(e.to_string())
    }
}
