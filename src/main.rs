//! convoy CLI - categorized test-suite runner.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use convoy::config::{self, CategorySelection, RunConfiguration, RunOverrides};
use convoy::discovery::SuiteDiscoverer;
use convoy::environment::EnvironmentController;
use convoy::orchestrator::RunController;
use convoy::report::ConsoleReporter;

const DEFAULT_CONFIG: &str = "convoy.toml";

#[derive(Parser)]
#[command(name = "convoy")]
#[command(about = "Categorized test-suite runner", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path [default: convoy.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Stream suite output, prefixed with the suite id
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Debug logging (implies --verbose)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Copy)]
struct CategoryArgs {
    /// Run unit suites
    #[arg(long)]
    unit: bool,

    /// Run integration suites
    #[arg(long)]
    integration: bool,

    /// Run validation suites
    #[arg(long)]
    validation: bool,

    /// Run every category (the default when no category is given)
    #[arg(long)]
    all: bool,
}

impl From<CategoryArgs> for CategorySelection {
    fn from(args: CategoryArgs) -> Self {
        CategorySelection {
            unit: args.unit,
            integration: args.integration,
            validation: args.validation,
            all: args.all,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run test suites
    Run {
        #[command(flatten)]
        categories: CategoryArgs,

        /// Run the suites of each category concurrently
        #[arg(short, long)]
        parallel: bool,

        /// Enable coverage collection
        #[arg(long)]
        coverage: bool,

        /// Keep stale reports and snapshot backups
        #[arg(long)]
        no_cleanup: bool,

        /// Report formats: console|text, junit|xml, html (repeatable or comma-separated)
        #[arg(short, long = "report", value_name = "FORMAT", value_delimiter = ',')]
        reports: Vec<String>,

        /// Per-suite timeout in seconds
        #[arg(short, long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
        timeout: Option<u64>,
    },

    /// Discover suites without running them
    List {
        #[command(flatten)]
        categories: CategoryArgs,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (config_path, explicit) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG), false),
    };

    match cli.command {
        Commands::Run {
            categories,
            parallel,
            coverage,
            no_cleanup,
            reports,
            timeout,
        } => {
            let overrides = RunOverrides {
                categories: categories.into(),
                parallel,
                coverage,
                verbose: cli.verbose,
                debug: cli.debug,
                no_cleanup,
                formats: reports,
                timeout_secs: timeout,
            };
            run_suites(&config_path, explicit, overrides).await
        }
        Commands::List { categories, format } => {
            list_suites(&config_path, explicit, categories.into(), &format).await
        }
        Commands::Validate => validate_config(&config_path, explicit),
    }
}

async fn run_suites(config_path: &Path, explicit: bool, overrides: RunOverrides) -> Result<()> {
    let config = config::load_config_or_default(config_path, explicit)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let settings = RunConfiguration::resolve(config, &overrides);

    info!(
        "Categories: {}",
        settings
            .categories
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let environment = EnvironmentController::new(settings.environment.clone(), settings.cleanup);
    let reporter = Arc::new(ConsoleReporter::new(settings.verbosity.streams_output()));
    let token = CancellationToken::new();

    // The first interrupt stops the suites and lets the controller release
    // the environment; a second one exits immediately.
    let mut signals = ShutdownSignals::install()?;
    let signal_token = token.clone();
    tokio::spawn(async move {
        signals.recv().await;
        warn!("Interrupt received, stopping suites and releasing the environment");
        signal_token.cancel();

        signals.recv().await;
        error!("Second interrupt received, exiting without cleanup");
        std::process::exit(130);
    });

    let controller =
        RunController::new(settings, environment, reporter).with_cancellation_token(token);
    let outcome = controller.run().await?;

    std::io::stdout().flush()?;
    std::process::exit(outcome.exit_code());
}

/// Interrupt sources: Ctrl-C everywhere, plus SIGTERM and SIGHUP on Unix.
struct ShutdownSignals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    fn install() -> Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            Ok(Self {
                terminate: signal(SignalKind::terminate())
                    .context("Failed to install SIGTERM handler")?,
                hangup: signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Waits for the next interrupt.
    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = self.terminate.recv() => {}
                _ = self.hangup.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

async fn list_suites(
    config_path: &Path,
    explicit: bool,
    selection: CategorySelection,
    format: &str,
) -> Result<()> {
    let config = config::load_config_or_default(config_path, explicit)?;
    let overrides = RunOverrides {
        categories: selection,
        ..Default::default()
    };
    let settings = RunConfiguration::resolve(config, &overrides);
    let discoverer = SuiteDiscoverer::new(&settings.suites.pattern)?;

    let mut found = Vec::new();
    for category in settings.categories {
        found.push(discoverer.discover(category, settings.suites.dir(category)).await);
    }

    match format {
        "json" => {
            let suites: Vec<_> = found.iter().flat_map(|c| c.suites.iter()).collect();
            let json = serde_json::to_string_pretty(&suites)?;
            println!("{}", json);
        }
        _ => {
            let total: usize = found.iter().map(|c| c.suites.len()).sum();
            println!("Discovered {} suites:", total);
            for category in &found {
                println!(
                    "  {} ({}): {}",
                    category.category,
                    category.dir.display(),
                    category.state.label()
                );
                for suite in &category.suites {
                    println!("    {}", suite.id);
                }
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path, explicit: bool) -> Result<()> {
    let loaded = config::load_config_or_default(config_path, explicit).and_then(|config| {
        SuiteDiscoverer::new(&config.suites.pattern)?;
        Ok(config)
    });

    match loaded {
        Ok(config) => {
            let settings = RunConfiguration::resolve(config, &RunOverrides::default());

            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Timeout: {}s", settings.timeout.as_secs());
            println!("  Grace period: {}s", settings.grace_period.as_secs());
            println!("  Mode: {:?}", settings.mode);
            println!("  Cleanup: {}", settings.cleanup);
            println!("  Validation dir: {}", settings.suites.validation.display());
            println!("  Unit dir: {}", settings.suites.unit.display());
            println!("  Integration dir: {}", settings.suites.integration.display());
            println!("  Pattern: {}", settings.suites.pattern);
            println!(
                "  Network: {}",
                settings.environment.network.as_deref().unwrap_or("none")
            );
            println!("  Snapshots: {}", settings.environment.snapshot.len());
            println!(
                "  Reports: {} -> {}",
                settings
                    .formats
                    .iter()
                    .map(|f| f.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                settings.output_dir.display()
            );

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}
