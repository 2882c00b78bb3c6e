/*!
 * Breakwater CLI - Command Line Interface
 *
 * Exercises pools from a TOML config against a simulated downstream.
 */

use breakwater::{
    config::{AppConfig, LogLevel, LoggingConfig},
    error::{BreakwaterError, Result, EXIT_SUCCESS},
    logging,
    resilience::{ClassifyFn, PoolRegistry},
    simulate::{
        classify_sim_error, run_load, DownstreamProfile, LoadPlan, SimError, SimulatedClient,
        SimulatedDownstream,
    },
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "breakwater")]
#[command(version, about = "Resilient outbound-call pool with circuit-breaker protection", long_about = None)]
struct Cli {
    /// Log level (overrides the config file; RUST_LOG overrides both)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Path to log file (default: stderr)
    #[arg(long, value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Enable verbose logging (equivalent to --log-level=debug)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a pool with simulated load and print its metrics
    Simulate {
        /// Config file (default: built-in defaults)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Target to simulate (default: first target in the config)
        #[arg(long)]
        target: Option<String>,

        /// Total logical calls
        #[arg(long, default_value = "200")]
        calls: usize,

        /// Concurrent callers
        #[arg(long, default_value = "16")]
        concurrency: usize,

        /// Base downstream latency in milliseconds
        #[arg(long, default_value = "20")]
        latency_ms: u64,

        /// Random extra latency in milliseconds
        #[arg(long, default_value = "10")]
        jitter_ms: u64,

        /// Probability that a downstream call fails (0.0 - 1.0)
        #[arg(long, default_value = "0.1")]
        failure_rate: f64,

        /// Share of failures that are fatal (0.0 - 1.0)
        #[arg(long, default_value = "0.0")]
        fatal_rate: f64,

        /// Per-attempt deadline in milliseconds
        #[arg(long, default_value = "2000")]
        deadline_ms: u64,

        /// Grace period for draining the pool at exit, in milliseconds
        #[arg(long, default_value = "5000")]
        grace_ms: u64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Exit with a partial-failure code if any call failed
        #[arg(long)]
        fail_on_error: bool,
    },

    /// Load and validate a config file
    CheckConfig {
        /// Config file to check
        file: PathBuf,
    },

    /// Write a starter config file
    InitConfig {
        /// Where to write the config
        file: PathBuf,

        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn rate(name: &str, value: f64) -> Result<f64> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(BreakwaterError::Config(format!(
            "{} must be between 0.0 and 1.0, got {}",
            name, value
        )))
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            ref config,
            ref target,
            calls,
            concurrency,
            latency_ms,
            jitter_ms,
            failure_rate,
            fatal_rate,
            deadline_ms,
            grace_ms,
            json,
            fail_on_error,
        } => {
            let app_config = match config {
                Some(path) => AppConfig::from_file(path)?,
                None => AppConfig::default(),
            };
            init_logging(&cli, &app_config.logging)?;

            let target_config = match target {
                Some(name) => app_config
                    .target(name)
                    .ok_or_else(|| BreakwaterError::UnknownTarget(name.clone()))?,
                None => app_config
                    .targets
                    .first()
                    .ok_or_else(|| BreakwaterError::Config("no [[targets]] defined".to_string()))?,
            };

            let profile = DownstreamProfile {
                latency: Duration::from_millis(latency_ms),
                jitter: Duration::from_millis(jitter_ms),
                failure_rate: rate("--failure-rate", failure_rate)?,
                fatal_rate: rate("--fatal-rate", fatal_rate)?,
            };
            let plan = LoadPlan {
                calls,
                concurrency,
                deadline: Duration::from_millis(deadline_ms),
            };

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(simulate(
                target_config.name.clone(),
                target_config.to_pool_config()?,
                profile,
                plan,
                Duration::from_millis(grace_ms),
                json,
                fail_on_error,
            ))
        }

        Commands::CheckConfig { ref file } => {
            let app_config = AppConfig::from_file(file)?;
            let targets = app_config.validate()?;
            println!("{}: OK", file.display());
            for (name, pool) in targets {
                println!(
                    "  {}: {}..{} connections, acquire {:?}, {} retries, breaker {}",
                    name,
                    pool.min_connections,
                    pool.max_connections,
                    pool.acquire_timeout,
                    pool.max_retries,
                    if pool.circuit_breaker_enabled {
                        format!(
                            "after {} failures, {:?} cooldown",
                            pool.circuit_breaker_failure_threshold,
                            pool.circuit_breaker_recovery_timeout
                        )
                    } else {
                        "disabled".to_string()
                    }
                );
            }
            Ok(())
        }

        Commands::InitConfig { ref file, force } => {
            AppConfig::write_template(file, force)?;
            println!("Wrote {}", file.display());
            Ok(())
        }
    }
}

fn init_logging(cli: &Cli, from_file: &LoggingConfig) -> Result<()> {
    let mut log_config = from_file.clone();
    if let Some(level) = cli.log_level {
        log_config.level = level.into();
    }
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    if cli.log.is_some() {
        log_config.file = cli.log.clone();
    }
    logging::init_logging(&log_config)
}

async fn simulate(
    target: String,
    pool_config: breakwater::resilience::PoolConfig,
    profile: DownstreamProfile,
    plan: LoadPlan,
    grace: Duration,
    json: bool,
    fail_on_error: bool,
) -> Result<()> {
    let downstream = SimulatedDownstream::new(profile);
    let registry: PoolRegistry<SimulatedClient, SimError> = PoolRegistry::new();
    let classify: ClassifyFn<SimError> = Arc::new(classify_sim_error);

    let pool = registry
        .get_or_create(&target, pool_config, downstream.factory(), classify)
        .await?;
    let report = run_load(pool, plan).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
        println!(
            "Downstream: {} calls, {} failed, {} clients created",
            downstream.calls(),
            downstream.failures(),
            downstream.clients_created()
        );
    }

    if registry.shutdown_all(grace).await {
        info!("All pools drained");
    } else {
        warn!("Shutdown grace period elapsed with calls still in flight");
    }

    let failed = report.outcomes.failed();
    if fail_on_error && failed > 0 {
        return Err(BreakwaterError::PartialFailure {
            failed,
            total: report.outcomes.total(),
        });
    }
    Ok(())
}
