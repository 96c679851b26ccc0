//! colocate-sim: run localization scenarios on a virtual clock.

use clap::{Parser, Subcommand};
use colocate_sim::scenarios::ScenarioId;
use colocate_sim::{ScenarioResult, ScenarioRunner, SimConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "colocate-sim")]
#[command(about = "Deterministic localization scenarios for Colocate", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every scenario with its description
    List,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// First seed (0 picks one from the wall clock)
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Scenario name or alias, or "all"
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Run each scenario on this many consecutive seeds
    #[arg(long, default_value_t = 1)]
    seeds: u64,

    /// JSON file with a SimConfig; flags below override its link settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// One-way latency of new links, in milliseconds
    #[arg(long)]
    latency_ms: Option<u64>,

    /// Largest chunk a send is split into (0 = never split)
    #[arg(long)]
    max_chunk: Option<usize>,

    /// Log handshake progress
    #[arg(short, long)]
    verbose: bool,

    /// Print a JSON summary on stdout
    #[arg(long)]
    json: bool,
}

fn init_logging(verbose: bool) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("tracing already initialized: {}", e);
    }
}

fn list_scenarios() {
    for scenario in ScenarioId::all() {
        println!("{:<22} {}", scenario.name(), scenario.description());
    }
}

fn select_scenarios(name: &str) -> Result<Vec<ScenarioId>, String> {
    if name.eq_ignore_ascii_case("all") {
        return Ok(ScenarioId::all());
    }
    name.parse().map(|scenario| vec![scenario])
}

fn load_config(args: &RunArgs) -> Result<SimConfig, String> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
            serde_json::from_str(&text).map_err(|e| format!("{}: {}", path.display(), e))?
        }
        None => SimConfig::default(),
    };
    if let Some(latency) = args.latency_ms {
        config.link.latency = Duration::from_millis(latency);
    }
    if let Some(max_chunk) = args.max_chunk {
        config.link.max_chunk = max_chunk;
    }
    Ok(config)
}

fn first_seed(seed: u64) -> u64 {
    if seed != 0 {
        return seed;
    }
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

fn report(result: &ScenarioResult) {
    match &result.failure_reason {
        None => info!(
            "PASS {} seed={} ({:.2}s virtual, {} sends)",
            result.scenario, result.seed, result.final_time_secs, result.metrics.sends
        ),
        Some(reason) => error!("FAIL {} seed={}: {}", result.scenario, result.seed, reason),
    }
}

fn summarize_json(results: &[ScenarioResult]) {
    let failed = results.iter().filter(|r| !r.passed).count();
    let summary = serde_json::json!({
        "total": results.len(),
        "passed": results.len() - failed,
        "failed": failed,
        "results": results,
    });
    match serde_json::to_string_pretty(&summary) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("cannot encode summary: {}", e),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Some(Command::List) = cli.command {
        list_scenarios();
        return ExitCode::SUCCESS;
    }
    let args = cli.run;
    init_logging(args.verbose);

    let scenarios = match select_scenarios(&args.scenario) {
        Ok(scenarios) => scenarios,
        Err(e) => {
            eprintln!("{} (try `colocate-sim list`)", e);
            return ExitCode::from(2);
        }
    };
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("bad config {}", e);
            return ExitCode::from(2);
        }
    };

    let base = first_seed(args.seed);
    info!(
        "colocate-sim v{}: {} scenario(s) x {} seed(s) from {}",
        env!("CARGO_PKG_VERSION"),
        scenarios.len(),
        args.seeds,
        base
    );

    let mut results = Vec::new();
    for offset in 0..args.seeds {
        let runner = ScenarioRunner::new(base.wrapping_add(offset)).with_config(config.clone());
        for scenario in &scenarios {
            let result = runner.run(*scenario);
            if !args.json {
                report(&result);
            }
            results.push(result);
        }
    }

    let failed: Vec<&ScenarioResult> = results.iter().filter(|r| !r.passed).collect();
    if args.json {
        summarize_json(&results);
    } else if failed.is_empty() {
        info!("all {} runs passed", results.len());
    } else {
        warn!("{} of {} runs failed", failed.len(), results.len());
        for result in &failed {
            warn!(
                "  rerun with: colocate-sim -S {} -s {}",
                result.scenario, result.seed
            );
        }
    }

    if failed.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
