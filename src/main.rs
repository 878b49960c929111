mod classifier;
mod config;
mod metrics;
mod preflight;
mod report;
mod resolver;
mod sampler;
mod supervisor;
mod termination;
mod verdict;

use clap::Parser;
use config::{Config, TargetConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::Supervisor;
use tracing_subscriber::EnvFilter;

/// Run programs under a CPU counter tool, watch their threads, and report
/// whether each one finished, deadlocked, raced or timed out.
#[derive(Parser, Debug)]
#[command(name = "threadwatch", version, about)]
pub struct Cli {
    /// Program to supervise (overrides [[targets]] from the config)
    #[arg(value_name = "PROGRAM")]
    program: Option<PathBuf>,

    /// Arguments passed to PROGRAM; `{threads}` is replaced with --threads
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "threadwatch.toml")]
    config: PathBuf,

    /// Label for PROGRAM in the summary
    #[arg(long)]
    name: Option<String>,

    /// Worker thread count handed to targets (overrides config)
    #[arg(short, long)]
    threads: Option<u32>,

    /// Seconds between thread-state checks (overrides config)
    #[arg(long)]
    interval: Option<f64>,

    /// Global timeout in seconds (overrides config)
    #[arg(long)]
    timeout: Option<f64>,

    /// Consecutive blocked checks needed to confirm a deadlock (overrides config)
    #[arg(long)]
    threshold: Option<u32>,

    /// Run targets directly instead of under the counter tool
    #[arg(long)]
    no_counter: bool,

    /// Print full run results as JSON
    #[arg(long)]
    json: bool,

    /// Extra logging (per-check samples, resolution attempts)
    #[arg(short, long)]
    verbose: bool,

    /// Only errors and the summary
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        let s = &mut config.supervisor;
        if let Some(threads) = self.threads {
            s.threads = threads;
        }
        if let Some(interval) = self.interval {
            s.check_interval_secs = interval;
        }
        if let Some(timeout) = self.timeout {
            s.global_timeout_secs = timeout;
        }
        if let Some(threshold) = self.threshold {
            s.confidence_threshold = threshold;
        }
        if self.no_counter {
            config.counter.enabled = false;
        }
        if let Some(program) = &self.program {
            let name = self
                .name
                .clone()
                .unwrap_or_else(|| resolver::program_name(program));
            config.targets = vec![TargetConfig {
                name,
                program: program.clone(),
                args: self.args.clone(),
            }];
        }
    }
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose {
        "threadwatch=debug"
    } else if cli.quiet {
        "threadwatch=warn"
    } else {
        "threadwatch=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return ExitCode::from(2);
        }
    };
    cli.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "configuration error");
        return ExitCode::from(2);
    }

    if config.targets.is_empty() {
        tracing::error!("nothing to run: pass a PROGRAM or add [[targets]] to the config");
        return ExitCode::from(2);
    }

    if let Err(e) = preflight::check_counter_tool(&config.counter) {
        tracing::error!(error = %e, "environment check failed");
        return ExitCode::from(2);
    }

    let supervisor = Supervisor::new(&config);
    let mut results = Vec::with_capacity(config.targets.len());
    for (i, target) in config.targets.iter().enumerate() {
        tracing::info!(
            run = i + 1,
            total = config.targets.len(),
            name = %target.name,
            "starting run"
        );
        results.push(supervisor.run(target).await);
    }

    if cli.json {
        match report::render_json(&results) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize results");
                return ExitCode::FAILURE;
            }
        }
    } else {
        print!("{}", report::render_summary(&results));
    }

    if results.iter().all(|r| r.succeeded() && !r.deadlock_detected && !r.data_race_detected) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
