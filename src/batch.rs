//! Batch orchestrator fanning the capture pipeline out over a URL list
//!
//! Each URL runs `capture -> segment -> publish` independently under a
//! bounded number of permits. Per-URL and per-segment failures are folded
//! into the result; only a malformed batch or an internal fault is returned
//! as an error.

use crate::{
    redact_secrets, scope_for_url, segment, validate_url, CaptureProvider, CaptureRequest,
    Config, FailureReason, HttpCaptureClient, PipelineError, PipelineMetrics, StoragePublisher,
};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of one URL inside a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlStage {
    Pending,
    Capturing,
    Segmenting,
    Publishing,
    Done,
    Failed,
}

/// Result of publishing one segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AssetStatus {
    Stored { key: String, reference: String },
    Failed { error: FailureReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedAsset {
    pub index: usize,
    pub top_offset: u32,
    pub height: u32,
    #[serde(flatten)]
    pub status: AssetStatus,
}

impl PublishedAsset {
    pub fn reference(&self) -> Option<&str> {
        match &self.status {
            AssetStatus::Stored { reference, .. } => Some(reference),
            AssetStatus::Failed { .. } => None,
        }
    }
}

/// Terminal state of one input URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UrlOutcome {
    /// The page was captured and every segment went through the publisher;
    /// individual segments may still have failed.
    Completed {
        url: String,
        scope: String,
        #[serde(rename = "stored")]
        assets: Vec<PublishedAsset>,
    },
    Failed {
        url: String,
        stage: UrlStage,
        error: FailureReason,
    },
}

impl UrlOutcome {
    pub fn url(&self) -> &str {
        match self {
            UrlOutcome::Completed { url, .. } | UrlOutcome::Failed { url, .. } => url,
        }
    }

    pub fn references(&self) -> Vec<&str> {
        match self {
            UrlOutcome::Completed { assets, .. } => {
                assets.iter().filter_map(|a| a.reference()).collect()
            }
            UrlOutcome::Failed { .. } => Vec::new(),
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            UrlOutcome::Failed { error, .. } => Some(error),
            UrlOutcome::Completed { .. } => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            UrlOutcome::Failed { .. } => "failed",
            UrlOutcome::Completed { assets, .. } => {
                let stored = assets.iter().filter(|a| a.reference().is_some()).count();
                if stored == assets.len() {
                    "succeeded"
                } else if stored == 0 {
                    "failed"
                } else {
                    "partial"
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
}

/// One entry per input URL, in input order
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub batch_id: Uuid,
    pub summary: BatchSummary,
    pub results: Vec<UrlOutcome>,
}

impl BatchResult {
    fn new(batch_id: Uuid, results: Vec<UrlOutcome>) -> Self {
        let mut summary = BatchSummary {
            total: results.len(),
            ..Default::default()
        };
        for outcome in &results {
            match outcome.label() {
                "succeeded" => summary.succeeded += 1,
                "partial" => summary.partial += 1,
                _ => summary.failed += 1,
            }
        }
        Self {
            batch_id,
            summary,
            results,
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Check an inbound request body and extract its URL list.
///
/// The body must be an object whose `urls` field is an array of strings.
/// Entries are trimmed but never dropped; a blank entry keeps its slot and
/// fails later as an invalid URL.
pub fn validate_batch(body: &Value, allow_empty: bool) -> Result<Vec<String>, PipelineError> {
    let urls = body
        .get("urls")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            PipelineError::InvalidBatch("URLs must be provided as an array".to_string())
        })?;

    let mut cleaned = Vec::with_capacity(urls.len());
    for (i, entry) in urls.iter().enumerate() {
        let url = entry.as_str().ok_or_else(|| {
            PipelineError::InvalidBatch(format!("urls[{i}] must be a string"))
        })?;
        cleaned.push(url.trim().to_string());
    }

    if cleaned.is_empty() && !allow_empty {
        return Err(PipelineError::InvalidBatch(
            "At least one URL must be provided".to_string(),
        ));
    }

    Ok(cleaned)
}

/// Drives the capture pipeline over a batch of URLs
///
/// # Examples
///
/// ```rust,no_run
/// use page_capture::{BatchOrchestrator, Config};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let orchestrator = BatchOrchestrator::from_config(Config::from_env()?)?;
///     let result = orchestrator.run(vec!["https://example.com".to_string()]).await?;
///     println!("{}", serde_json::to_string_pretty(&result)?);
///     Ok(())
/// }
/// ```
pub struct BatchOrchestrator {
    config: Arc<Config>,
    capture: Arc<dyn CaptureProvider>,
    publisher: Arc<StoragePublisher>,
    metrics: PipelineMetrics,
    secrets: Arc<Vec<String>>,
}

impl BatchOrchestrator {
    pub fn new(
        config: Config,
        capture: Arc<dyn CaptureProvider>,
        publisher: StoragePublisher,
    ) -> Self {
        let secrets = Arc::new(config.secrets());
        Self {
            config: Arc::new(config),
            capture,
            publisher: Arc::new(publisher),
            metrics: PipelineMetrics::new(),
            secrets,
        }
    }

    pub fn from_config(config: Config) -> Result<Self, PipelineError> {
        config.validate()?;
        let capture = Arc::new(HttpCaptureClient::new(config.capture.clone())?);
        let publisher = StoragePublisher::from_config(&config)?;
        Ok(Self::new(config, capture, publisher))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run every URL through the pipeline and return one outcome per URL in
    /// input order.
    pub async fn run(&self, urls: Vec<String>) -> Result<BatchResult, PipelineError> {
        if urls.is_empty() && !self.config.allow_empty_batch {
            return Err(PipelineError::InvalidBatch(
                "At least one URL must be provided".to_string(),
            ));
        }

        let batch_id = Uuid::new_v4();
        let started = Instant::now();
        let deadline = self.config.batch_timeout.map(|t| started + t);
        info!(
            "Starting batch {} with {} URLs (concurrency {})",
            batch_id,
            urls.len(),
            self.config.max_concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));

        // Dropping the set aborts every pipeline, so a cancelled batch stops
        // capturing and uploading.
        let mut tasks = JoinSet::new();
        for (index, url) in urls.iter().cloned().enumerate() {
            let this = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move { (index, this.run_url(url, semaphore, deadline).await) });
        }

        // Each task owns the slot at its input index.
        let mut slots: Vec<Option<UrlOutcome>> = vec![None; urls.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => error!("Pipeline task of batch {} aborted: {}", batch_id, e),
            }
        }

        let results: Vec<UrlOutcome> = slots
            .into_iter()
            .zip(urls)
            .map(|(slot, url)| {
                slot.unwrap_or_else(|| {
                    self.failed(
                        url,
                        UrlStage::Pending,
                        PipelineError::Internal("pipeline task aborted".to_string()),
                    )
                })
            })
            .collect();

        let result = BatchResult::new(batch_id, results);
        info!(
            "Batch {} finished in {}: {} succeeded, {} partial, {} failed",
            batch_id,
            crate::format_duration(started.elapsed()),
            result.summary.succeeded,
            result.summary.partial,
            result.summary.failed
        );
        Ok(result)
    }

    async fn run_url(
        &self,
        url: String,
        semaphore: Arc<Semaphore>,
        deadline: Option<Instant>,
    ) -> UrlOutcome {
        let _permit = match within(deadline, semaphore.acquire_owned()).await {
            Some(Ok(permit)) => permit,
            Some(Err(e)) => return self.failed(url, UrlStage::Pending, e.into()),
            None => {
                return self.timed_out(url, UrlStage::Pending, "not started before the deadline")
            }
        };

        self.metrics.url_started();
        let started = Instant::now();
        let mut stage = UrlStage::Pending;

        let pipeline = AssertUnwindSafe(self.process_url(&url, &mut stage)).catch_unwind();
        let finished = within(deadline, pipeline).await;
        let outcome = match finished {
            Some(Ok(outcome)) => outcome,
            Some(Err(panic)) => {
                error!("Pipeline for {} panicked while {:?}", url, stage);
                self.failed(
                    url,
                    stage,
                    PipelineError::Internal(format!(
                        "pipeline panicked: {}",
                        panic_message(panic.as_ref())
                    )),
                )
            }
            None => self.timed_out(url, stage, "aborted in flight at the deadline"),
        };

        self.metrics.url_finished(started.elapsed(), outcome.label());
        outcome
    }

    async fn process_url(&self, url: &str, stage: &mut UrlStage) -> UrlOutcome {
        *stage = UrlStage::Capturing;
        debug!("{} -> {:?}", url, stage);

        if let Err(e) = validate_url(url) {
            return self.failed(url.to_string(), *stage, e);
        }
        let scope = scope_for_url(url).unwrap_or_else(|| "unknown".to_string());

        let request = CaptureRequest::new(url, &self.config);
        let image = match self.capture.capture(&request).await {
            Ok(bytes) => bytes,
            Err(e) => return self.failed(url.to_string(), *stage, e),
        };
        debug!(
            "Captured {} ({})",
            url,
            crate::format_bytes(image.len())
        );

        *stage = UrlStage::Segmenting;
        debug!("{} -> {:?}", url, stage);

        let segment_height = self.config.effective_segment_height();
        let format = self.config.output_format;
        let segmented =
            tokio::task::spawn_blocking(move || segment(&image, segment_height, format)).await;
        let segments = match segmented {
            Ok(Ok(segments)) => segments,
            Ok(Err(e)) => return self.failed(url.to_string(), *stage, e),
            Err(e) => {
                return self.failed(
                    url.to_string(),
                    *stage,
                    PipelineError::Internal(format!("segmentation task aborted: {e}")),
                )
            }
        };

        *stage = UrlStage::Publishing;
        debug!("{} -> {:?} ({} segments)", url, stage, segments.len());

        // A failed segment is recorded in its own slot; the rest still publish.
        let mut assets = Vec::with_capacity(segments.len());
        for part in segments {
            let name = format!("part-{}", part.index);
            let status = match self.publisher.publish(part.bytes, &scope, &name).await {
                Ok(stored) => {
                    self.metrics.record_segment_uploaded();
                    AssetStatus::Stored {
                        key: stored.key,
                        reference: stored.reference,
                    }
                }
                Err(e) => {
                    warn!("Publishing {} of {} failed: {}", name, url, e);
                    self.metrics.record_failure(e.kind());
                    AssetStatus::Failed {
                        error: self.failure_reason(&e),
                    }
                }
            };
            assets.push(PublishedAsset {
                index: part.index,
                top_offset: part.top_offset,
                height: part.height,
                status,
            });
        }

        *stage = UrlStage::Done;
        debug!("{} -> {:?}", url, stage);

        UrlOutcome::Completed {
            url: url.to_string(),
            scope,
            assets,
        }
    }

    fn failure_reason(&self, err: &PipelineError) -> FailureReason {
        let mut reason = err.to_failure();
        reason.message = redact_secrets(&reason.message, &self.secrets);
        reason
    }

    fn failed(&self, url: String, stage: UrlStage, err: PipelineError) -> UrlOutcome {
        warn!("{} failed while {:?}: {}", url, stage, err);
        self.metrics.record_failure(err.kind());
        UrlOutcome::Failed {
            url,
            stage,
            error: self.failure_reason(&err),
        }
    }

    fn timed_out(&self, url: String, stage: UrlStage, detail: &str) -> UrlOutcome {
        let err = PipelineError::BatchTimeout {
            deadline: self.config.batch_timeout.unwrap_or_default(),
            detail: detail.to_string(),
        };
        self.failed(url, stage, err)
    }
}

impl Clone for BatchOrchestrator {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            capture: self.capture.clone(),
            publisher: self.publisher.clone(),
            metrics: self.metrics.clone(),
            secrets: self.secrets.clone(),
        }
    }
}

/// Await `fut`, giving up at `deadline` when one is set.
async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_batch_accepts_string_array() {
        let body = json!({ "urls": [" https://a.test ", "", "https://b.test"] });
        let urls = validate_batch(&body, false).unwrap();
        assert_eq!(urls, vec!["https://a.test", "", "https://b.test"]);
    }

    #[test]
    fn test_validate_batch_rejects_malformed_input() {
        for body in [
            json!({}),
            json!({ "urls": "https://a.test" }),
            json!({ "urls": { "0": "https://a.test" } }),
            json!({ "urls": ["https://a.test", 7] }),
            json!(["https://a.test"]),
            json!(null),
        ] {
            let err = validate_batch(&body, false).unwrap_err();
            assert!(matches!(err, PipelineError::InvalidBatch(_)), "{body}");
        }
    }

    #[test]
    fn test_validate_batch_empty_policy() {
        let body = json!({ "urls": [] });
        assert!(matches!(
            validate_batch(&body, false),
            Err(PipelineError::InvalidBatch(_))
        ));
        assert_eq!(validate_batch(&body, true).unwrap(), Vec::<String>::new());

        let blanks = json!({ "urls": ["  ", ""] });
        assert_eq!(validate_batch(&blanks, false).unwrap(), vec!["", ""]);
    }

    #[test]
    fn test_outcome_wire_shape() {
        let outcome = UrlOutcome::Completed {
            url: "https://example.com".to_string(),
            scope: "example.com".to_string(),
            assets: vec![
                PublishedAsset {
                    index: 0,
                    top_offset: 0,
                    height: 1000,
                    status: AssetStatus::Stored {
                        key: "example.com/part-0.png".to_string(),
                        reference: "https://cdn.test/example.com/part-0.png".to_string(),
                    },
                },
                PublishedAsset {
                    index: 1,
                    top_offset: 1000,
                    height: 200,
                    status: AssetStatus::Failed {
                        error: FailureReason {
                            kind: "upload_failed".to_string(),
                            message: "denied".to_string(),
                        },
                    },
                },
            ],
        };

        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["url"], "https://example.com");
        assert_eq!(value["stored"][0]["status"], "stored");
        assert_eq!(
            value["stored"][0]["reference"],
            "https://cdn.test/example.com/part-0.png"
        );
        assert_eq!(value["stored"][1]["status"], "failed");
        assert_eq!(value["stored"][1]["top_offset"], 1000);
        assert_eq!(value["stored"][1]["error"]["kind"], "upload_failed");
        assert_eq!(outcome.label(), "partial");

        let failed = UrlOutcome::Failed {
            url: "https://a.test".to_string(),
            stage: UrlStage::Capturing,
            error: FailureReason {
                kind: "network_error".to_string(),
                message: "connection reset".to_string(),
            },
        };
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["stage"], "capturing");
        assert_eq!(value["error"]["kind"], "network_error");
    }
}
