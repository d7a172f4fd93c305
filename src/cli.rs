use crate::{
    install_prometheus_recorder, serve, AppState, BatchOrchestrator, Config, PipelineError,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

pub type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "page-capture")]
#[command(about = "Capture web pages, segment them and publish the images")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        #[arg(long, help = "Bind address (overrides BIND_ADDRESS)")]
        bind: Option<String>,
    },

    /// Capture every URL listed in a file
    Batch {
        #[arg(short, long, help = "Input file containing URLs (one per line)")]
        input: PathBuf,

        #[arg(short, long, help = "Write the JSON result here instead of stdout")]
        output: Option<PathBuf>,
    },

    /// Print the loaded configuration with credentials masked
    Config,
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self, command: Commands) -> CliResult<()> {
        match command {
            Commands::Serve { bind } => self.run_server(bind).await,
            Commands::Batch { input, output } => self.run_batch(&input, output.as_deref()).await,
            Commands::Config => self.show_config(),
        }
    }

    pub async fn run_server(mut self, bind: Option<String>) -> CliResult<()> {
        if let Some(bind) = bind {
            self.config.bind_address = bind;
        }
        let bind_address = self.config.bind_address.clone();

        let orchestrator = BatchOrchestrator::from_config(self.config)?;
        let mut state = AppState::new(orchestrator);
        match install_prometheus_recorder() {
            Ok(handle) => state = state.with_metrics(handle),
            Err(e) => warn!("Metrics endpoint disabled: {}", e),
        }

        serve(state, &bind_address, shutdown_signal()).await?;
        Ok(())
    }

    pub async fn run_batch(self, input: &Path, output: Option<&Path>) -> CliResult<()> {
        let urls = Self::read_urls_from_file(input).await?;
        info!("Loaded {} URLs from {}", urls.len(), input.display());

        let orchestrator = BatchOrchestrator::from_config(self.config)?;

        let result = tokio::select! {
            result = orchestrator.run(urls) => result?,
            _ = shutdown_signal() => {
                warn!("Batch interrupted before completion");
                return Err(PipelineError::Internal("batch interrupted".to_string()).into());
            }
        };

        let json = serde_json::to_string_pretty(&result)?;
        match output {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(path, json).await?;
                info!("Result written to {}", path.display());
            }
            None => println!("{json}"),
        }

        info!(
            "Batch processing completed. Succeeded: {}, Partial: {}, Failed: {}",
            result.summary.succeeded, result.summary.partial, result.summary.failed
        );
        Ok(())
    }

    pub fn show_config(&self) -> CliResult<()> {
        println!("{}", serde_json::to_string_pretty(&self.config.redacted())?);
        Ok(())
    }

    /// One URL per line; blank lines and `#` comments are skipped.
    pub async fn read_urls_from_file(path: &Path) -> Result<Vec<String>, PipelineError> {
        let content = fs::read_to_string(path).await?;
        Ok(parse_url_list(&content))
    }
}

pub fn parse_url_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub fn setup_logging(verbose: bool) -> CliResult<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    // stdout is reserved for batch results.
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()?;

    Ok(())
}

/// Resolves on SIGINT or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_list_skips_comments_and_blanks() {
        let content = "# staging\nhttps://a.test\n\n   https://b.test  \n#https://c.test\n";
        assert_eq!(
            parse_url_list(content),
            vec!["https://a.test", "https://b.test"]
        );
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "page-capture",
            "--verbose",
            "serve",
            "--bind",
            "0.0.0.0:8080",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Serve { bind: Some(ref b) } if b == "0.0.0.0:8080"
        ));

        let cli = Cli::try_parse_from(["page-capture", "batch", "-i", "urls.txt"]).unwrap();
        assert!(!cli.verbose);
        match cli.command {
            Commands::Batch { input, output } => {
                assert_eq!(input, PathBuf::from("urls.txt"));
                assert!(output.is_none());
            }
            _ => panic!("expected batch"),
        }

        assert!(Cli::try_parse_from(["page-capture", "batch"]).is_err());
    }

    #[tokio::test]
    async fn test_read_urls_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.txt");
        std::fs::write(&path, "https://a.test\n# skip\n\nhttps://b.test\n").unwrap();

        let urls = CliRunner::read_urls_from_file(&path).await.unwrap();
        assert_eq!(urls, vec!["https://a.test", "https://b.test"]);

        let missing = CliRunner::read_urls_from_file(&dir.path().join("nope.txt")).await;
        assert!(matches!(missing, Err(PipelineError::IoError(_))));
    }
}
