//! Tributary command line: run the pipeline service or a single pipeline.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tributary::config::ServiceConfig;
use tributary::logging::{LogFormat, init_logging};
use tributary::manager::PipelineManager;
use tributary::pipeline::{Pipeline, PipelineRequest};
use tributary::plugin::NodeResolver;
use tributary::service;
use tributary::synchroniser::SynchroniserRegistry;

#[derive(Parser)]
#[command(name = "tributary")]
#[command(about = "Node-based streaming pipeline engine")]
#[command(after_help = "\
EXAMPLES:
  tributary serve --port 1234               # Accept pipelines over HTTP
  tributary serve --config service.toml     # Same, settings from a file
  tributary run pipeline.json               # Run one pipeline until idle or Ctrl-C")]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Start the HTTP pipeline service
  Serve {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(flatten)]
    overrides: Overrides,
  },
  /// Build and run one pipeline locally
  Run {
    /// JSON pipeline request
    pipeline: PathBuf,
    /// Keep running after the pipeline went idle, until Ctrl-C
    #[arg(long)]
    follow: bool,
    #[command(flatten)]
    overrides: Overrides,
  },
}

#[derive(clap::Args)]
struct Overrides {
  /// Address to bind
  #[arg(long)]
  host: Option<String>,
  /// Port to bind
  #[arg(short, long)]
  port: Option<u16>,
  /// Base folder for pipeline artifacts
  #[arg(short, long, value_name = "DIR")]
  folder: Option<PathBuf>,
  /// Additional plugin root (repeatable)
  #[arg(long = "plugins", value_name = "DIR")]
  plugins: Vec<PathBuf>,
  /// Log level: off, error, warn, info, debug, trace
  #[arg(long)]
  log_level: Option<String>,
  /// Log format: text, compact, json
  #[arg(long)]
  log_format: Option<LogFormat>,
  /// Write logs to this file instead of stderr
  #[arg(long, value_name = "FILE")]
  log_file: Option<PathBuf>,
}

impl Overrides {
  fn apply(self, config: &mut ServiceConfig) {
    if let Some(host) = self.host {
      config.host = host;
    }
    if let Some(port) = self.port {
      config.port = port;
    }
    if let Some(folder) = self.folder {
      config.folder = folder;
    }
    config.plugins.extend(self.plugins);
    if let Some(level) = self.log_level {
      config.log_level = level;
    }
    if let Some(format) = self.log_format {
      config.log_format = format;
    }
    if self.log_file.is_some() {
      config.log_file = self.log_file;
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  match cli.command {
    Commands::Serve { config, overrides } => {
      let mut settings = match config {
        Some(path) => ServiceConfig::load(&path)?,
        None => ServiceConfig::default(),
      };
      overrides.apply(&mut settings);
      let _guard = init_logging(&settings.log_level, settings.log_format, settings.log_file.as_deref());
      serve(settings).await
    }
    Commands::Run {
      pipeline,
      follow,
      overrides,
    } => {
      let mut settings = ServiceConfig::default();
      overrides.apply(&mut settings);
      let _guard = init_logging(&settings.log_level, settings.log_format, settings.log_file.as_deref());
      run(settings, pipeline, follow).await
    }
  }
}

async fn serve(settings: ServiceConfig) -> Result<()> {
  let manager = PipelineManager::new(&settings.folder).with_plugin_roots(settings.plugins.clone());
  manager
    .set_base_folder(&settings.folder)
    .await
    .with_context(|| format!("cannot create base folder {}", settings.folder.display()))?;

  let address = settings.address()?;
  let listener = TcpListener::bind(address)
    .await
    .with_context(|| format!("cannot bind {address}"))?;
  service::serve(listener, Arc::new(manager), shutdown_signal()).await?;
  Ok(())
}

async fn run(settings: ServiceConfig, path: PathBuf, follow: bool) -> Result<()> {
  let bytes = tokio::fs::read(&path)
    .await
    .with_context(|| format!("cannot read {}", path.display()))?;
  let mut request = PipelineRequest::from_json(&bytes)?;
  request.plugins.extend(settings.plugins.iter().cloned());

  let id = uuid::Uuid::new_v4().to_string();
  let folder = settings.folder.join(&id);
  tokio::fs::create_dir_all(&folder).await?;

  let mut pipeline = Pipeline::build(
    id,
    &request,
    &folder,
    &NodeResolver::default(),
    &SynchroniserRegistry::with_builtins(),
  )
  .await?;
  pipeline.start()?;

  if follow {
    shutdown_signal().await;
  } else {
    tokio::select! {
      _ = shutdown_signal() => {}
      _ = pipeline.wait_idle(Duration::from_millis(100)) => info!(pipeline = %pipeline.id(), "pipeline idle"),
    }
  }

  pipeline.destroy().await;
  println!("{}", serde_json::to_string_pretty(&pipeline.report())?);
  Ok(())
}

async fn shutdown_signal() {
  if tokio::signal::ctrl_c().await.is_err() {
    std::future::pending::<()>().await;
  }
  info!("shutdown requested");
}
