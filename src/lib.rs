//! # Page Capture
//!
//! Batch web page capture: every submitted URL is rendered by an external
//! capture provider, the returned image is cut into fixed-height horizontal
//! segments, and each segment is pushed to durable object storage. The batch
//! result lists the public references of the stored images per URL.
//!
//! ## Failure isolation
//!
//! A batch never fails because one of its URLs did. Each URL ends in either
//! a `completed` entry (with per-segment `stored`/`failed` slots) or a
//! `failed` entry naming the pipeline stage that broke. Only a malformed
//! request or an internal fault rejects the batch as a whole.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use page_capture::{BatchOrchestrator, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let orchestrator = BatchOrchestrator::from_config(config)?;
//!
//!     let result = orchestrator
//!         .run(vec![
//!             "https://example.com".to_string(),
//!             "https://www.rust-lang.org".to_string(),
//!         ])
//!         .await?;
//!
//!     for outcome in &result.results {
//!         println!("{}: {:?}", outcome.url(), outcome.references());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ### HTTP server
//! ```bash
//! page-capture serve --bind 0.0.0.0:3000
//! curl -X POST localhost:3000/api/screenshot \
//!      -H 'content-type: application/json' \
//!      -d '{"urls": ["https://example.com"]}'
//! ```
//!
//! ### Batch Processing
//! ```bash
//! page-capture batch --input urls.txt --output result.json
//! ```

/// Configuration loaded from the environment
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Capture provider client
pub mod capture;

/// Image segmentation into fixed-height strips
pub mod segment;

/// Object storage backends and the storage publisher
pub mod storage;

/// Batch orchestration with per-URL failure isolation
pub mod batch;

/// HTTP API and form page
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Pipeline metrics through the `metrics` facade
pub mod metrics;

/// Utility functions and helpers
pub mod utils;


pub use batch::*;
pub use capture::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use self::metrics::*;
pub use segment::*;
pub use server::*;
pub use storage::*;
pub use utils::*;
