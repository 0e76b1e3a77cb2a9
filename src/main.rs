// =============================================================================
// Sentinel — orchestrator entry point
// =============================================================================
//
// Subcommands:
//   sentinel continuous [--broker MODE] [INTERVAL]   run the loop
//   sentinel test                                    single cycle, then exit
//   sentinel health                                  validate config and exit
//   sentinel status                                  print the last snapshot
// =============================================================================

use std::process::ExitCode;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sentinel_bot::config::Config;
use sentinel_bot::orchestrator::Orchestrator;
use sentinel_bot::store::Store;
use sentinel_bot::types::BrokerMode;

fn config_path() -> String {
    std::env::var("SENTINEL_CONFIG").unwrap_or_else(|_| "sentinel_config.json".to_string())
}

/// Load config, falling back to defaults when the file simply does not
/// exist. A malformed file is fatal — refusing to run beats running with
/// half-applied settings.
fn load_config() -> Result<Config, anyhow::Error> {
    let path = config_path();
    if !std::path::Path::new(&path).exists() {
        warn!(path = %path, "config file not found — using defaults");
        let mut config = Config::default();
        config.apply_env_overrides();
        return Ok(config);
    }
    Config::load(&path)
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let subcommand = args.first().map(String::as_str).unwrap_or("continuous");

    match subcommand {
        "health" => run_health(),
        "status" => run_status(),
        "test" => run_single_cycle().await,
        "continuous" => run_continuous(&args[1..]).await,
        other => {
            eprintln!("Unknown subcommand: {other}");
            eprintln!("Usage: sentinel <continuous [--broker MODE] [INTERVAL] | test | health | status>");
            ExitCode::FAILURE
        }
    }
}

fn run_health() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "config load failed");
            return ExitCode::FAILURE;
        }
    };
    match config.validate() {
        Ok(()) => {
            info!("config valid");
            println!("OK");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "config invalid");
            println!("INVALID: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_status() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "config load failed");
            return ExitCode::FAILURE;
        }
    };
    let store = match Store::open(&config.db_path) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "store open failed");
            return ExitCode::FAILURE;
        }
    };
    match store.latest_snapshot() {
        Ok(Some(snapshot)) => {
            println!("{}", serde_json::to_string_pretty(&snapshot).unwrap_or_default());
        }
        _ => println!("No monitoring data yet"),
    }
    ExitCode::SUCCESS
}

async fn run_single_cycle() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "config load failed");
            return ExitCode::FAILURE;
        }
    };
    let orchestrator = match Orchestrator::new(config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "orchestrator startup failed");
            return ExitCode::FAILURE;
        }
    };

    info!("test mode — running a single monitoring cycle");
    orchestrator.run_monitoring_cycle().await;
    match orchestrator.store().latest_snapshot() {
        Ok(Some(snapshot)) => {
            info!(
                defcon = snapshot.defcon_level,
                composite = snapshot.composite_score,
                "test cycle complete"
            );
            ExitCode::SUCCESS
        }
        _ => {
            error!("test cycle produced no snapshot");
            ExitCode::FAILURE
        }
    }
}

async fn run_continuous(args: &[String]) -> ExitCode {
    let mut config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "config load failed");
            return ExitCode::FAILURE;
        }
    };

    // continuous [--broker MODE] [INTERVAL]
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--broker" => {
                let Some(mode) = iter.next().and_then(|m| BrokerMode::parse(m)) else {
                    eprintln!("Invalid --broker mode. Choose: disabled, semi_auto, full_auto");
                    return ExitCode::FAILURE;
                };
                config.broker_mode = mode;
            }
            value => {
                let Ok(minutes) = value.parse::<u64>() else {
                    eprintln!("Unexpected argument: {value}");
                    return ExitCode::FAILURE;
                };
                config.monitoring_interval_minutes = minutes;
            }
        }
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "config invalid");
        return ExitCode::FAILURE;
    }

    info!(
        broker_mode = %config.broker_mode,
        interval_minutes = config.monitoring_interval_minutes,
        "Sentinel starting"
    );

    let orchestrator = match Orchestrator::new(config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "orchestrator startup failed");
            return ExitCode::FAILURE;
        }
    };

    // Ctrl+C behaves like a graceful `stop`.
    let run = orchestrator.run_continuous();
    tokio::select! {
        result = run => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "fatal orchestrator error");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received — shutting down");
            ExitCode::SUCCESS
        }
    }
}
