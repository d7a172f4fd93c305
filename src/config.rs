//! Configuration management with serde serialization/deserialization
//!
//! This module holds the immutable configuration object built once at startup
//! and handed to the capture client, the storage publisher and the batch
//! orchestrator, plus the per-URL `CaptureRequest` derived from it.

use crate::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const REDACTED: &str = "[REDACTED]";

/// Main configuration structure for the capture pipeline
///
/// Built from the environment with [`Config::from_env`] and never mutated
/// afterwards; share it by cloning or behind an `Arc`.
///
/// # Examples
///
/// ```rust
/// use page_capture::Config;
///
/// let config = Config {
///     max_concurrency: 2,
///     segment_height: Some(1000),
///     ..Default::default()
/// };
/// assert_eq!(config.effective_segment_height(), 1000);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Capture provider endpoint, credential and transport mode
    pub capture: CaptureSettings,

    /// Viewport used when rendering pages
    pub viewport: Viewport,

    /// Capture the whole scrollable page instead of the viewport (default: true)
    pub full_page: bool,

    /// Output image format (default: PNG)
    pub output_format: OutputFormat,

    /// Height of each stored segment in pixels (default: none)
    ///
    /// `None` stores every capture as a single image.
    pub segment_height: Option<u32>,

    /// Maximum number of URLs processed at once
    ///
    /// Bounds the fan-out against the capture provider and the object store.
    pub max_concurrency: usize,

    /// Overall deadline for one batch (default: none)
    pub batch_timeout: Option<Duration>,

    /// Accept an empty `urls` list instead of rejecting it (default: false)
    pub allow_empty_batch: bool,

    /// Where captured images are stored
    pub storage: StorageSettings,

    /// Listen address for the HTTP server (default: 127.0.0.1:3000)
    pub bind_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureSettings::default(),
            viewport: Viewport::default(),
            full_page: true,
            output_format: OutputFormat::Png,
            segment_height: None,
            max_concurrency: default_concurrency(),
            batch_timeout: None,
            allow_empty_batch: false,
            storage: StorageSettings::default(),
            bind_address: "127.0.0.1:3000".to_string(),
        }
    }
}

fn default_concurrency() -> usize {
    num_cpus::get().clamp(2, 8)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureSettings {
    pub endpoint: String,
    pub api_key: String,
    pub mode: CaptureMode,
    /// Timeout for a single outbound call to the provider (default: 60 seconds)
    pub timeout: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            mode: CaptureMode::Direct,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Response shape of the capture provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// `GET` with query parameters; the response body is the image
    Direct,
    /// `POST` with a JSON body; the response is a JSON envelope whose
    /// `screenshot.url` points at the rendered image
    Envelope,
}

impl FromStr for CaptureMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(CaptureMode::Direct),
            "envelope" => Ok(CaptureMode::Envelope),
            other => Err(PipelineError::ConfigurationError(format!(
                "unknown capture mode '{other}' (expected 'direct' or 'envelope')"
            ))),
        }
    }
}

/// Browser viewport used by the capture provider
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1280)
    pub width: u32,

    /// Viewport height in pixels (default: 1024)
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 1024,
        }
    }
}

/// Supported output image formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// PNG format - lossless compression
    Png,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
        }
    }

    pub fn image_format(&self) -> image::ImageFormat {
        match self {
            OutputFormat::Png => image::ImageFormat::Png,
        }
    }
}

impl FromStr for OutputFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            other => Err(PipelineError::ConfigurationError(format!(
                "unsupported output format '{other}'"
            ))),
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageSettings {
    /// Files under `root`, referenced as `{public_base_url}/{key}`
    Local {
        root: PathBuf,
        public_base_url: String,
    },
    /// Remote object store reached over HTTP with a signed upload
    Remote {
        endpoint: String,
        account: String,
        key: String,
        secret: String,
        /// Timeout for one upload call (default: 60 seconds)
        timeout: Duration,
    },
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings::Local {
            root: PathBuf::from("screenshots"),
            public_base_url: "file://screenshots".to_string(),
        }
    }
}

/// One immutable capture job, built once per URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub url: String,
    pub viewport: Viewport,
    pub full_page: bool,
    pub format: OutputFormat,
}

impl CaptureRequest {
    pub fn new(url: impl Into<String>, config: &Config) -> Self {
        Self {
            url: url.into(),
            viewport: config.viewport.clone(),
            full_page: config.full_page,
            format: config.output_format,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// A `.env` file in the working directory is read first when present.
    pub fn from_env() -> Result<Self, PipelineError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |name: &str| {
            get(name).ok_or_else(|| {
                PipelineError::ConfigurationError(format!("{name} must be set"))
            })
        };

        let capture = CaptureSettings {
            endpoint: require("CAPTURE_ENDPOINT")?,
            api_key: require("CAPTURE_API_KEY")?,
            mode: get("CAPTURE_MODE")
                .map(|v| v.parse::<CaptureMode>())
                .transpose()?
                .unwrap_or(CaptureMode::Direct),
            timeout: Duration::from_secs(parse_var(&get, "CAPTURE_TIMEOUT_SECS", 60)?),
        };

        let viewport = Viewport {
            width: parse_var(&get, "VIEWPORT_WIDTH", defaults.viewport.width)?,
            height: parse_var(&get, "VIEWPORT_HEIGHT", defaults.viewport.height)?,
        };

        let segment_height = match parse_var::<u32>(&get, "SEGMENT_HEIGHT", 0)? {
            0 => None,
            height => Some(height),
        };

        let batch_timeout = match parse_var::<u64>(&get, "BATCH_TIMEOUT_SECS", 0)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let storage = match get("STORAGE_BACKEND").as_deref().unwrap_or("local") {
            "local" => {
                let root = PathBuf::from(
                    get("STORAGE_LOCAL_DIR").unwrap_or_else(|| "screenshots".to_string()),
                );
                let public_base_url = match get("STORAGE_PUBLIC_BASE_URL") {
                    Some(base) => base,
                    None => file_url_for(&root)?,
                };
                StorageSettings::Local {
                    root,
                    public_base_url,
                }
            }
            "remote" => StorageSettings::Remote {
                endpoint: require("STORAGE_ENDPOINT")?,
                account: require("STORAGE_ACCOUNT")?,
                key: require("STORAGE_KEY")?,
                secret: require("STORAGE_SECRET")?,
                timeout: Duration::from_secs(parse_var(&get, "STORAGE_TIMEOUT_SECS", 60)?),
            },
            other => {
                return Err(PipelineError::ConfigurationError(format!(
                    "unknown storage backend '{other}' (expected 'local' or 'remote')"
                )))
            }
        };

        let config = Config {
            capture,
            viewport,
            full_page: parse_bool(&get, "FULL_PAGE", defaults.full_page)?,
            output_format: get("OUTPUT_FORMAT")
                .map(|v| v.parse::<OutputFormat>())
                .transpose()?
                .unwrap_or(OutputFormat::Png),
            segment_height,
            max_concurrency: parse_var(&get, "MAX_CONCURRENCY", defaults.max_concurrency)?,
            batch_timeout,
            allow_empty_batch: parse_bool(&get, "ALLOW_EMPTY_BATCH", false)?,
            storage,
            bind_address: get("BIND_ADDRESS").unwrap_or(defaults.bind_address),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.capture.endpoint.is_empty() {
            return Err(PipelineError::ConfigurationError(
                "capture endpoint must be set".to_string(),
            ));
        }
        if url::Url::parse(&self.capture.endpoint).is_err() {
            return Err(PipelineError::ConfigurationError(format!(
                "capture endpoint '{}' is not a URL",
                self.capture.endpoint
            )));
        }
        if self.capture.api_key.is_empty() {
            return Err(PipelineError::ConfigurationError(
                "capture API key must be set".to_string(),
            ));
        }
        if self.capture.timeout.is_zero() {
            return Err(PipelineError::ConfigurationError(
                "capture timeout must be greater than 0".to_string(),
            ));
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(PipelineError::ConfigurationError(
                "viewport dimensions must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(PipelineError::ConfigurationError(
                "max concurrency must be greater than 0".to_string(),
            ));
        }
        if let StorageSettings::Remote {
            endpoint, timeout, ..
        } = &self.storage
        {
            if url::Url::parse(endpoint).is_err() {
                return Err(PipelineError::ConfigurationError(format!(
                    "storage endpoint '{endpoint}' is not a URL"
                )));
            }
            if timeout.is_zero() {
                return Err(PipelineError::ConfigurationError(
                    "storage timeout must be greater than 0".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Segment height handed to the segmenter; "no segmentation" is an
    /// unbounded height, which always yields one whole-image segment.
    pub fn effective_segment_height(&self) -> u32 {
        self.segment_height.unwrap_or(u32::MAX)
    }

    /// Every credential in the configuration, for scrubbing diagnostics.
    pub fn secrets(&self) -> Vec<String> {
        let mut secrets = vec![self.capture.api_key.clone()];
        if let StorageSettings::Remote { key, secret, .. } = &self.storage {
            secrets.push(key.clone());
            secrets.push(secret.clone());
        }
        secrets.retain(|s| !s.is_empty());
        secrets
    }

    /// Copy of the configuration with credentials masked, safe to print.
    pub fn redacted(&self) -> Config {
        let mut config = self.clone();
        if !config.capture.api_key.is_empty() {
            config.capture.api_key = REDACTED.to_string();
        }
        if let StorageSettings::Remote { key, secret, .. } = &mut config.storage {
            *key = REDACTED.to_string();
            *secret = REDACTED.to_string();
        }
        config
    }
}

fn parse_var<T>(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, PipelineError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        Some(raw) => raw.parse().map_err(|e| {
            PipelineError::ConfigurationError(format!("{name}='{raw}' is invalid: {e}"))
        }),
        None => Ok(default),
    }
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: bool,
) -> Result<bool, PipelineError> {
    match get(name).map(|v| v.to_ascii_lowercase()).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(PipelineError::ConfigurationError(format!(
            "{name}='{other}' is not a boolean"
        ))),
    }
}

fn file_url_for(root: &std::path::Path) -> Result<String, PipelineError> {
    let absolute = if root.is_absolute() {
        root.to_path_buf()
    } else {
        std::env::current_dir()?.join(root)
    };
    url::Url::from_directory_path(&absolute)
        .map(|u| u.as_str().trim_end_matches('/').to_string())
        .map_err(|_| {
            PipelineError::ConfigurationError(format!(
                "cannot build a file URL for {}",
                absolute.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("CAPTURE_ENDPOINT", "https://capture.test/api"),
        ("CAPTURE_API_KEY", "secret-key"),
    ];

    #[test]
    fn test_defaults_from_minimal_environment() {
        let config = Config::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.capture.mode, CaptureMode::Direct);
        assert_eq!(config.capture.timeout, Duration::from_secs(60));
        assert_eq!(config.viewport, Viewport::default());
        assert!(config.full_page);
        assert_eq!(config.output_format, OutputFormat::Png);
        assert_eq!(config.segment_height, None);
        assert_eq!(config.effective_segment_height(), u32::MAX);
        assert!(config.batch_timeout.is_none());
        assert!(!config.allow_empty_batch);
        assert!(matches!(config.storage, StorageSettings::Local { .. }));
    }

    #[test]
    fn test_full_environment() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("CAPTURE_MODE", "envelope"),
            ("VIEWPORT_WIDTH", "1440"),
            ("VIEWPORT_HEIGHT", "900"),
            ("FULL_PAGE", "false"),
            ("SEGMENT_HEIGHT", "1000"),
            ("MAX_CONCURRENCY", "3"),
            ("BATCH_TIMEOUT_SECS", "120"),
            ("ALLOW_EMPTY_BATCH", "yes"),
            ("STORAGE_BACKEND", "remote"),
            ("STORAGE_ENDPOINT", "https://store.test/v1_1"),
            ("STORAGE_ACCOUNT", "acme"),
            ("STORAGE_KEY", "store-key"),
            ("STORAGE_SECRET", "store-secret"),
            ("STORAGE_TIMEOUT_SECS", "15"),
        ]);
        let config = Config::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.capture.mode, CaptureMode::Envelope);
        assert_eq!(config.viewport.width, 1440);
        assert_eq!(config.viewport.height, 900);
        assert!(!config.full_page);
        assert_eq!(config.effective_segment_height(), 1000);
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.batch_timeout, Some(Duration::from_secs(120)));
        assert!(config.allow_empty_batch);
        assert_eq!(
            config.secrets(),
            vec!["secret-key", "store-key", "store-secret"]
        );
        assert!(matches!(
            config.storage,
            StorageSettings::Remote { timeout, .. } if timeout == Duration::from_secs(15)
        ));
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let err = Config::from_lookup(lookup(&[("CAPTURE_ENDPOINT", "https://capture.test")]))
            .unwrap_err();
        assert!(err.to_string().contains("CAPTURE_API_KEY"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("MAX_CONCURRENCY", "0"));
        assert!(Config::from_lookup(lookup(&vars)).is_err());

        let mut vars = REQUIRED.to_vec();
        vars.push(("VIEWPORT_WIDTH", "wide"));
        assert!(Config::from_lookup(lookup(&vars)).is_err());

        let mut vars = REQUIRED.to_vec();
        vars.push(("STORAGE_BACKEND", "ftp"));
        assert!(Config::from_lookup(lookup(&vars)).is_err());

        let mut vars = REQUIRED.to_vec();
        vars.push(("OUTPUT_FORMAT", "gif"));
        assert!(Config::from_lookup(lookup(&vars)).is_err());

        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("STORAGE_BACKEND", "remote"),
            ("STORAGE_ENDPOINT", "https://store.test/v1_1"),
            ("STORAGE_ACCOUNT", "acme"),
            ("STORAGE_KEY", "store-key"),
            ("STORAGE_SECRET", "store-secret"),
            ("STORAGE_TIMEOUT_SECS", "0"),
        ]);
        let err = Config::from_lookup(lookup(&vars)).unwrap_err();
        assert!(err.to_string().contains("storage timeout"));
    }

    #[test]
    fn test_redacted_masks_credentials() {
        let config = Config {
            capture: CaptureSettings {
                endpoint: "https://capture.test".to_string(),
                api_key: "secret-key".to_string(),
                ..Default::default()
            },
            storage: StorageSettings::Remote {
                endpoint: "https://store.test".to_string(),
                account: "acme".to_string(),
                key: "store-key".to_string(),
                secret: "store-secret".to_string(),
                timeout: Duration::from_secs(30),
            },
            ..Default::default()
        };
        let printed = serde_json::to_string(&config.redacted()).unwrap();
        assert!(!printed.contains("secret-key"));
        assert!(!printed.contains("store-key"));
        assert!(!printed.contains("store-secret"));
        assert!(printed.contains("acme"));
    }

    #[test]
    fn test_capture_request_from_config() {
        let config = Config::default();
        let request = CaptureRequest::new("https://example.com", &config);
        assert_eq!(request.url, "https://example.com");
        assert_eq!(request.viewport, config.viewport);
        assert!(request.full_page);
        assert_eq!(request.format, OutputFormat::Png);
    }
}
