//! hzz4l CLI

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hzz4l::{config::AnalysisConfig, pipeline, workspace::Workspace};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

#[derive(Parser)]
#[command(name = "hzz4l")]
#[command(about = "Four-lepton Higgs analysis: histograms, workspace and signal-strength fit")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    /// Worker threads for delivery and processing (0 = all cores)
    #[arg(long, global = true, default_value = "0")]
    threads: usize,

    /// Maximum number of minimizer steps per fit
    #[arg(long, global = true)]
    max_steps: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deliver the fileset and fill the four-lepton mass histograms
    Histograms {
        /// Analysis configuration (YAML)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Build the workspace from saved histograms
    Workspace {
        /// Analysis configuration (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Output workspace (overrides WorkspacePath)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Fit the signal strength of a workspace
    Fit {
        /// Input workspace (pyhf JSON)
        #[arg(short, long)]
        workspace: PathBuf,

        /// Measurement to fit (defaults to the first)
        #[arg(short, long)]
        measurement: Option<String>,

        /// Output file for results (pretty JSON)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also compute the observed and expected discovery significance
        #[arg(long)]
        significance: bool,
    },
    /// Run every stage from delivery to the fit
    Run {
        /// Analysis configuration (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Output file for fit results (pretty JSON)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(
            cli.log_level,
            std::env::var("RUST_LOG").ok().as_deref(),
        ))
        .with_target(false)
        .init();
    pipeline::configure_threads(cli.threads).context("failed to configure worker threads")?;

    match cli.command {
        Commands::Histograms { config } => {
            let config = load_config(&config)?;
            let (_, cutflow) = pipeline::histograms(&config)?;
            println!("{cutflow}");
        }
        Commands::Workspace { config, output } => {
            let config = load_config(&config)?;
            let histograms = pipeline::load_histograms(&config)
                .context("failed to load histograms, run `hzz4l histograms` first")?;
            let workspace = pipeline::workspace(&config, &histograms)?;
            match output {
                Some(path) => workspace.save(path)?,
                None if config.general.workspace_path.is_none() => {
                    println!("{}", serde_json::to_string_pretty(&workspace)?)
                }
                None => {}
            }
        }
        Commands::Fit {
            workspace,
            measurement,
            output,
            significance,
        } => {
            let workspace = Workspace::load(&workspace)
                .with_context(|| format!("failed to read {}", workspace.display()))?;
            fit_and_report(
                &workspace,
                measurement.as_deref(),
                cli.max_steps,
                output,
                significance,
            )?;
        }
        Commands::Run { config, output } => {
            let config = load_config(&config)?;
            let (histograms, cutflow) = pipeline::histograms(&config)?;
            println!("{cutflow}");
            let workspace = pipeline::workspace(&config, &histograms)?;
            fit_and_report(&workspace, None, cli.max_steps, output, true)?;
        }
    }
    Ok(())
}

/// The `RUST_LOG` directives when set and valid, otherwise a global `level`.
fn log_filter(level: tracing::Level, rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()))
}

fn load_config(path: &Path) -> Result<AnalysisConfig> {
    AnalysisConfig::from_file(path).with_context(|| format!("failed to read {}", path.display()))
}

fn fit_and_report(
    workspace: &Workspace,
    measurement: Option<&str>,
    max_steps: Option<usize>,
    output: Option<PathBuf>,
    significance: bool,
) -> Result<()> {
    let results = pipeline::fit(workspace, measurement, max_steps)?;
    print!("{results}");
    let (mu, sigma) = results.poi();
    println!(
        "{} = {:.3} +/- {:.3}",
        results.labels[results.poi_index], mu, sigma
    );
    if significance {
        print!("{}", pipeline::discovery(workspace, measurement)?);
    }
    if let Some(path) = output {
        results.save(path)?;
    }
    Ok(())
}
