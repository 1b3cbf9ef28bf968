use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use config::ConfigManager;
use logging::{init_logging, LogConfig, LogFormat};
use mass_dispatch::{expand_prompts, parse_prompts, GenerationOrchestrator};

/// Dispatch a batch of image generation prompts across providers
#[derive(Debug, Parser)]
#[command(name = "mass-dispatch", version, about)]
struct Cli {
    /// TOML configuration file (defaults to the per-user config, if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Provider catalog JSON file (defaults to the built-in catalog)
    #[arg(long)]
    providers: Option<PathBuf>,

    /// Directory holding `<provider>_keys.json` credential files
    #[arg(long)]
    credentials_dir: Option<PathBuf>,

    /// File with one prompt per line
    #[arg(long)]
    prompts: PathBuf,

    /// Repeat the prompts until this many jobs are queued
    #[arg(long)]
    count: Option<usize>,

    /// Worker count the scaler adapts around
    #[arg(long)]
    base_workers: Option<usize>,

    /// How long to wait for the batch before reporting
    #[arg(long, default_value_t = 3600)]
    timeout_secs: u64,

    /// Log output format: human, compact or json
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log filter, e.g. `info` or `inference_engine=debug`
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn config_manager(&self) -> Result<ConfigManager> {
        let config_manager = match &self.config {
            Some(path) => ConfigManager::from_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
            None => ConfigManager::new().context("Failed to load configuration")?,
        };

        // Command line flags win over file and environment settings
        if let Some(path) = &self.providers {
            config_manager.set("providers.catalog", path.display().to_string());
        }
        if let Some(dir) = &self.credentials_dir {
            config_manager.set("providers.credentials_dir", dir.display().to_string());
        }
        if let Some(workers) = self.base_workers {
            config_manager.set("scaling.base_workers", workers);
        }
        if let Some(format) = self.log_format {
            config_manager.set("logging.format", format.to_string());
        }
        if let Some(level) = &self.log_level {
            config_manager.set("logging.level", level.clone());
        }

        Ok(config_manager)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_manager = cli.config_manager()?;

    let log_config = LogConfig::from_config(&config_manager).context("Invalid logging configuration")?;
    let _log_guard = init_logging(&log_config).context("Failed to initialize logging")?;

    let content = std::fs::read_to_string(&cli.prompts)
        .with_context(|| format!("Failed to read prompts from {}", cli.prompts.display()))?;
    let prompts = expand_prompts(parse_prompts(&content), cli.count);
    if prompts.is_empty() {
        bail!("No prompts found in {}", cli.prompts.display());
    }

    let orchestrator = GenerationOrchestrator::new(Arc::new(config_manager))?;
    orchestrator.start()?;

    info!("Dispatching {} prompts", prompts.len());
    let summary = orchestrator
        .run_prompts(prompts, Duration::from_secs(cli.timeout_secs))
        .await?;

    if !orchestrator.shutdown().await {
        warn!("Some jobs were abandoned at shutdown");
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
