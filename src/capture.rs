//! Capture client for the external screenshot provider
//!
//! Turns a [`CaptureRequest`] into raw image bytes with a single attempt.
//! Two provider response shapes are supported, selected once by
//! [`CaptureMode`]:
//!
//! - `Direct`: `GET {endpoint}?access_key=..&url=..` answers with the image.
//! - `Envelope`: `POST {endpoint}` with a JSON body answers with
//!   `{"screenshot": {"url": "..."}}`, which is then fetched.

use crate::{
    redact_secrets, truncate_diagnostic, CaptureMode, CaptureRequest, CaptureSettings,
    OutputFormat, PipelineError, Viewport,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Source of rendered page images
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    async fn capture(&self, request: &CaptureRequest) -> Result<Vec<u8>, PipelineError>;
}

/// HTTP client for the capture provider
pub struct HttpCaptureClient {
    client: reqwest::Client,
    settings: CaptureSettings,
    secrets: Vec<String>,
}

#[derive(Serialize)]
struct EnvelopeRequest<'a> {
    url: &'a str,
    viewport: &'a Viewport,
    #[serde(rename = "fullPage")]
    full_page: bool,
    format: OutputFormat,
}

#[derive(Deserialize)]
struct CaptureEnvelope {
    screenshot: Option<ScreenshotPointer>,
}

#[derive(Deserialize)]
struct ScreenshotPointer {
    url: Option<String>,
}

impl HttpCaptureClient {
    pub fn new(settings: CaptureSettings) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| PipelineError::ConfigurationError(e.to_string()))?;
        let secrets = vec![settings.api_key.clone()];

        Ok(Self {
            client,
            settings,
            secrets,
        })
    }

    pub fn mode(&self) -> CaptureMode {
        self.settings.mode
    }

    async fn capture_direct(&self, request: &CaptureRequest) -> Result<Vec<u8>, PipelineError> {
        let query = [
            ("access_key", self.settings.api_key.clone()),
            ("url", request.url.clone()),
            ("viewport_width", request.viewport.width.to_string()),
            ("viewport_height", request.viewport.height.to_string()),
            ("full_page", request.full_page.to_string()),
            ("format", request.format.extension().to_string()),
        ];

        let response = self
            .client
            .get(&self.settings.endpoint)
            .query(&query)
            .send()
            .await
            .map_err(|e| self.network_error(e))?;

        self.read_image(response).await
    }

    async fn capture_envelope(&self, request: &CaptureRequest) -> Result<Vec<u8>, PipelineError> {
        let body = EnvelopeRequest {
            url: &request.url,
            viewport: &request.viewport,
            full_page: request.full_page,
            format: request.format,
        };

        let response = self
            .client
            .post(&self.settings.endpoint)
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.network_error(e))?;

        let response = self.check_status(response).await?;
        let raw = response.bytes().await.map_err(|e| self.network_error(e))?;

        let envelope: CaptureEnvelope = serde_json::from_slice(&raw).map_err(|e| {
            PipelineError::ProviderResponseMalformed(format!("envelope is not valid JSON: {e}"))
        })?;
        let image_url = envelope
            .screenshot
            .and_then(|s| s.url)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                PipelineError::ProviderResponseMalformed(
                    "envelope has no screenshot.url".to_string(),
                )
            })?;

        debug!("Following screenshot pointer for {}", request.url);

        let response = self
            .client
            .get(&image_url)
            .send()
            .await
            .map_err(|e| self.network_error(e))?;

        self.read_image(response).await
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, PipelineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(PipelineError::ProviderRequestFailed {
            status: status.as_u16(),
            body: redact_secrets(&truncate_diagnostic(&body), &self.secrets),
        })
    }

    async fn read_image(&self, response: reqwest::Response) -> Result<Vec<u8>, PipelineError> {
        let response = self.check_status(response).await?;
        let bytes = response.bytes().await.map_err(|e| self.network_error(e))?;

        if bytes.is_empty() {
            return Err(PipelineError::ProviderResponseMalformed(
                "provider returned an empty image".to_string(),
            ));
        }

        Ok(bytes.to_vec())
    }

    fn network_error(&self, err: reqwest::Error) -> PipelineError {
        let prefix = if err.is_timeout() { "timed out: " } else { "" };
        // The request URL carries the access key in direct mode.
        let detail = err.without_url().to_string();
        PipelineError::NetworkError(format!(
            "{prefix}{}",
            redact_secrets(&detail, &self.secrets)
        ))
    }
}

#[async_trait]
impl CaptureProvider for HttpCaptureClient {
    async fn capture(&self, request: &CaptureRequest) -> Result<Vec<u8>, PipelineError> {
        debug!(
            "Capturing {} ({}x{}, full_page={}, mode={:?})",
            request.url,
            request.viewport.width,
            request.viewport.height,
            request.full_page,
            self.settings.mode
        );

        match self.settings.mode {
            CaptureMode::Direct => self.capture_direct(request).await,
            CaptureMode::Envelope => self.capture_envelope(request).await,
        }
    }
}
