//! trainrun CLI: run, preflight, and inspect training runs.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use trainrun_core::driver::preflight;
use trainrun_core::registry::{MetricRegistry, ModelRegistry};
use trainrun_core::{RunConfig, TrainingLoopDriver};

/// trainrun: bounded-step training runs over file-backed datasets
#[derive(Parser, Debug)]
#[command(name = "trainrun", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Execute a training run
    Run {
        /// Run configuration file (TOML)
        #[arg(short, long)]
        config: PathBuf,
        /// Resume from a checkpoint before training
        #[arg(long)]
        resume: bool,
        /// Checkpoint to resume from (defaults to the latest in the run
        /// directory)
        #[arg(long, requires = "resume")]
        checkpoint: Option<PathBuf>,
    },
    /// Validate a configuration against its dataset files without training
    Check {
        /// Run configuration file (TOML)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the metadata of a checkpoint file
    Inspect {
        /// Checkpoint path
        checkpoint: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (verbose, quiet) = (cli.verbose, cli.quiet);

    match cli.command {
        Commands::Run {
            config,
            resume,
            checkpoint,
        } => {
            let config = RunConfig::load(Some(&config))?;
            let _guard = init_tracing(verbose, quiet, Some(&config));
            run(config, resume, checkpoint.as_deref()).await
        }
        Commands::Check { config } => {
            let config = RunConfig::load(Some(&config))?;
            let _guard = init_tracing(verbose, quiet, Some(&config));
            check(&config)
        }
        Commands::Inspect { checkpoint } => {
            let _guard = init_tracing(verbose, quiet, None);
            inspect(&checkpoint)
        }
    }
}

/// Stderr filter: the flags win over the configured verbosity.
fn log_filter(verbose: u8, quiet: bool, config: Option<&RunConfig>) -> String {
    match verbose {
        0 if quiet => "error".to_string(),
        0 => config
            .map(|c| c.logging_verbosity.clone())
            .unwrap_or_else(|| "info".to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Human-readable stderr layer plus a JSON file layer under the run's
/// output directory. The returned guard keeps the file writer alive.
fn init_tracing(
    verbose: u8,
    quiet: bool,
    config: Option<&RunConfig>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = log_filter(verbose, quiet, config);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let registry = tracing_subscriber::registry().with(stderr_layer);
    match config {
        Some(config) => {
            let log_dir = config.output_dir.join("logs");
            let _ = std::fs::create_dir_all(&log_dir);
            let appender = tracing_appender::rolling::daily(&log_dir, "trainrun.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            registry.with(file_layer).init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

async fn run(config: RunConfig, resume: bool, checkpoint: Option<&Path>) -> anyhow::Result<()> {
    let metric_registry = MetricRegistry::with_builtins();
    let model_registry = ModelRegistry::with_builtins();

    let mut driver = TrainingLoopDriver::new(config, &metric_registry, &model_registry)
        .context("run initialization failed")?;
    if resume {
        driver.resume(checkpoint).context("resume failed")?;
    }

    let stop = driver.stop_handle();
    let mut training = tokio::task::spawn_blocking(move || {
        let outcome = driver.run();
        (driver, outcome)
    });

    let (driver, outcome) = tokio::select! {
        joined = &mut training => joined?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, stopping at the next step boundary");
            stop.stop();
            training.await?
        }
    };

    let outcome = outcome?;
    println!(
        "run {}: {} steps ({} failed){}",
        if outcome.stopped_early {
            "stopped"
        } else {
            "complete"
        },
        outcome.steps_completed,
        outcome.failed_steps,
        match outcome.best_metric {
            Some(best) => format!(", best metric {best:.6}"),
            None => String::new(),
        },
    );
    if let Some(report) = &outcome.final_report {
        for (name, value) in &report.values {
            println!("  test {name} = {value:.6}");
        }
    }
    println!("artifacts in {}", driver.run_dir().display());
    Ok(())
}

fn check(config: &RunConfig) -> anyhow::Result<()> {
    let summary = preflight(config).context("configuration check failed")?;
    println!(
        "ok: train {} / validate {} / test {} examples, inputs {}x{}, {} targets",
        summary.train_len,
        summary.validate_len,
        summary.test_len,
        summary.seq_len,
        summary.channels,
        summary.n_targets,
    );
    Ok(())
}

fn inspect(checkpoint: &Path) -> anyhow::Result<()> {
    let meta = trainrun_core::checkpoint::read_meta(checkpoint)
        .with_context(|| format!("cannot inspect {}", checkpoint.display()))?;
    let mut keys: Vec<_> = meta.keys().collect();
    keys.sort();
    for key in keys {
        println!("{key}: {}", meta[key]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_configured_verbosity() {
        let mut config = RunConfig::default();
        config.logging_verbosity = "warn".to_string();

        assert_eq!(log_filter(0, false, Some(&config)), "warn");
        assert_eq!(log_filter(0, true, Some(&config)), "error");
        assert_eq!(log_filter(1, false, Some(&config)), "debug");
        assert_eq!(log_filter(2, false, None), "trace");
        assert_eq!(log_filter(0, false, None), "info");
    }
}
