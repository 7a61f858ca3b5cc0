//! CROPROW: simulated crop-row tracking with a SIR particle filter.
//!
//! A ground-truth row scene moves down the camera image by a commanded distance
//! every step. The filter receives the same command plus either a noisy
//! position of the tracked plant or a rendered binary plant image, depending on
//! the configured measurement model. Truth, estimate and diagnostics of every
//! step can be written to CSV.
//!
//! Parameters come from a configuration file (TOML/JSON/YAML) with optional
//! command line overrides.

use anyhow::{Context, Result};
use clap::Parser;
use croprow::particle::AveragingStrategy;
use croprow::resampling::ResamplingAlgorithm;
use croprow::sim::{SimulationConfig, StepRecord, run_simulation};
use croprow::sir::DegeneracyRule;
use log::info;
use std::path::PathBuf;

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Simulated crop-row geometry tracking with a SIR particle filter.")]
struct Cli {
    /// Simulation configuration file (TOML/JSON/YAML). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of time steps, overriding the configuration
    #[arg(long)]
    steps: Option<usize>,

    /// Number of particles, overriding the configuration
    #[arg(short = 'n', long)]
    particles: Option<usize>,

    /// Resampling algorithm, overriding the configuration
    #[arg(long, value_enum)]
    resampling: Option<ResamplingAlgorithm>,

    /// Estimate extraction strategy, overriding the configuration
    #[arg(long, value_enum)]
    averaging: Option<AveragingStrategy>,

    /// When a collapsed weight set is reset to uniform weights
    #[arg(long, value_enum)]
    degeneracy: Option<DegeneracyRule>,

    /// Seed of the filter and scene random generators
    #[arg(long)]
    seed: Option<u64>,

    /// Evaluate particles on the rayon thread pool
    #[arg(long)]
    parallel: bool,

    /// CSV file receiving one record per step
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write the resolved configuration to this file (TOML/JSON/YAML) and exit
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Initialize env_logger with a timestamped format, optionally appending to a file.
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .with_context(|| format!("cannot open log file {}", log_path.display()))?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<SimulationConfig> {
    let mut config = match &cli.config {
        Some(path) => SimulationConfig::from_file(path)
            .with_context(|| format!("cannot read configuration {}", path.display()))?,
        None => SimulationConfig::default(),
    };
    if let Some(steps) = cli.steps {
        config.steps = steps;
    }
    if let Some(particles) = cli.particles {
        config.filter.num_particles = particles;
    }
    if let Some(resampling) = cli.resampling {
        config.filter.resampling = resampling;
    }
    if let Some(averaging) = cli.averaging {
        config.filter.averaging = averaging;
    }
    if let Some(degeneracy) = cli.degeneracy {
        config.filter.degeneracy = degeneracy;
    }
    if let Some(seed) = cli.seed {
        config.filter.seed = seed;
    }
    if cli.parallel {
        config.filter.parallel = true;
    }
    if let Some(output) = &cli.output {
        config.output = Some(output.clone());
    }
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    let config = resolve_config(&cli)?;
    if let Some(path) = &cli.write_config {
        config
            .to_file(path)
            .with_context(|| format!("cannot write configuration {}", path.display()))?;
        info!("Configuration written to {}", path.display());
        return Ok(());
    }

    let records = run_simulation(&config)?;
    if let Some(last) = records.last() {
        let mean_error = records.iter().map(StepRecord::position_error).sum::<f64>() / records.len() as f64;
        info!(
            "Finished {} steps: final position error {:.2} px, mean position error {:.2} px, final max weight {:.3}",
            records.len(),
            last.position_error(),
            mean_error,
            last.max_weight
        );
    }
    if let Some(path) = &config.output {
        StepRecord::to_csv(&records, path)
            .with_context(|| format!("cannot write results to {}", path.display()))?;
        info!("Results written to {}", path.display());
    }
    Ok(())
}
