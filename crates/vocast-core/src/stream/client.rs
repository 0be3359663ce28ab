//! HTTP client for the generation endpoints

use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use tracing::{debug, info};

use super::event::{Feature, StreamEvent};
use super::sse;
use crate::config::StreamConfig;
use crate::error::{Error, Result};

/// Ordered events of one generation
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// A generation request: the feature selects the endpoint, the body is
/// forwarded to the backend as is.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub feature: Feature,
    pub body: Value,
}

impl GenerationRequest {
    pub fn new(feature: Feature, body: Value) -> Self {
        Self { feature, body }
    }

    /// Request with the common `{"text": ...}` body
    pub fn text(feature: Feature, text: impl Into<String>) -> Self {
        Self::new(feature, serde_json::json!({ "text": text.into() }))
    }
}

/// Starts generations and exposes their SSE bodies as event streams
#[derive(Clone)]
pub struct GenerationClient {
    http: reqwest::Client,
    config: StreamConfig,
}

impl GenerationClient {
    pub fn new(config: StreamConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// POST the request and return its event stream
    ///
    /// Non-2xx responses are reported as [`Error::UpstreamStatus`] before any
    /// event is read.
    pub async fn start(&self, request: &GenerationRequest) -> Result<EventStream> {
        let url = self.config.url(request.feature);
        info!("Starting {} generation at {}", request.feature, url);

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request.body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        debug!("Generation stream opened ({})", status);
        Ok(Box::pin(sse::events(response.bytes_stream())))
    }
}
