use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tern_sim::{run, Scenario, ScenarioDetail, ScenarioReport};
use tracing::{error, info};

mod config;

use crate::config::HarnessConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (TOML, or a `.env` file)
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Print a JSON summary instead of text
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish many messages and consume them all
    Publish {
        #[arg(long)]
        count: Option<usize>,
    },
    /// Check every published message reaches an acking callback
    Subscribe {
        #[arg(long)]
        count: Option<usize>,
    },
    /// Check callbacks for different messages overlap
    AsyncCallbacks,
    /// Check pending messages never exceed the flow-control ceiling
    MaxMessages {
        #[arg(long)]
        max_messages: Option<usize>,
        /// Reshape the batches randomly with this seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Check a failing callback surfaces through the subscription result
    CallbackError,
    /// Run the configured scenarios (default)
    All,
}

#[derive(Serialize)]
struct Failure {
    scenario: Scenario,
    error: String,
}

#[derive(Serialize)]
struct Summary {
    passed: bool,
    reports: Vec<ScenarioReport>,
    failures: Vec<Failure>,
}

fn describe(detail: &ScenarioDetail) -> String {
    match detail {
        ScenarioDetail::Publish {
            published,
            observed,
        } => format!("published={published} observed={observed}"),
        ScenarioDetail::Subscribe { published, calls } => {
            format!("published={published} calls={calls}")
        }
        ScenarioDetail::AsyncCallbacks {
            start_gap_ms,
            sleep_ms,
        } => format!("start_gap={start_gap_ms}ms sleep={sleep_ms}ms"),
        ScenarioDetail::MaxMessages {
            total,
            max_messages,
            completed_calls,
            max_pending_ack,
            peak_pending,
            ideal_ms,
        } => format!(
            "total={total} max_messages={max_messages} completed={completed_calls} \
             max_pending_ack={max_pending_ack} peak_pending={peak_pending} ideal={ideal_ms}ms"
        ),
        ScenarioDetail::CallbackError {
            error,
            callback_calls,
        } => format!("error=\"{error}\" calls={callback_calls}"),
    }
}

fn main() -> ExitCode {
    let filter = std::env::var("TERN_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let mut cfg = match HarnessConfig::new(cli.config.clone()) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let scenarios = match cli.command.unwrap_or(Commands::All) {
        Commands::Publish { count } => {
            if let Some(count) = count {
                cfg.publish_count = count;
            }
            vec![Scenario::Publish]
        }
        Commands::Subscribe { count } => {
            if let Some(count) = count {
                cfg.subscribe_count = count;
            }
            vec![Scenario::Subscribe]
        }
        Commands::AsyncCallbacks => vec![Scenario::AsyncCallbacks],
        Commands::MaxMessages { max_messages, seed } => {
            if let Some(max_messages) = max_messages {
                cfg.max_messages = max_messages;
            }
            if seed.is_some() {
                cfg.batch_seed = seed;
            }
            vec![Scenario::MaxMessages]
        }
        Commands::CallbackError => vec![Scenario::CallbackError],
        Commands::All => cfg.scenarios.clone(),
    };

    let settings = cfg.scenario_settings();
    info!(
        scenarios = scenarios.len(),
        time_unit = ?settings.time_unit,
        "starting harness"
    );

    let mut summary = Summary {
        passed: true,
        reports: Vec::new(),
        failures: Vec::new(),
    };
    for scenario in scenarios {
        match run(scenario, &settings) {
            Ok(report) => summary.reports.push(report),
            Err(err) => {
                error!(%scenario, "scenario failed: {err}");
                summary.passed = false;
                summary.failures.push(Failure {
                    scenario,
                    error: err.to_string(),
                });
            }
        }
    }

    if cli.json {
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                error!("failed to encode summary: {err}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        for report in &summary.reports {
            println!(
                "PASS {:<16} {:>6}ms  {}",
                report.scenario.as_str(),
                report.elapsed_ms,
                describe(&report.detail)
            );
        }
        for failure in &summary.failures {
            println!("FAIL {:<16} {}", failure.scenario.as_str(), failure.error);
        }
    }

    if summary.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
