// =============================================================================
// sentinel-cmd — operator command client
// =============================================================================
//
// Single-shot invocation: drop a command file for the running orchestrator,
// wait briefly for the response file, print it.
//
//   sentinel-cmd status
//   sentinel-cmd mode semi_auto
//   sentinel-cmd buy AAPL 10 @ 190.50
//   sentinel-cmd estop
// =============================================================================

use std::process::ExitCode;
use std::time::Duration;

use sentinel_bot::commands::{Command, CommandBus, CommandRequest};
use sentinel_bot::config::Config;

fn command_dir() -> String {
    if let Ok(dir) = std::env::var("SENTINEL_COMMAND_DIR") {
        return dir;
    }
    let config_path =
        std::env::var("SENTINEL_CONFIG").unwrap_or_else(|_| "sentinel_config.json".to_string());
    Config::load(&config_path)
        .map(|c| c.command_dir)
        .unwrap_or_else(|_| Config::default().command_dir)
}

/// Info commands answer fast; anything that can trigger model calls or
/// trades gets a longer window.
fn response_timeout(command: Command) -> Duration {
    match command {
        Command::Status
        | Command::Portfolio
        | Command::Defcon
        | Command::Trades
        | Command::Broker
        | Command::Help => Duration::from_secs(5),
        _ => Duration::from_secs(30),
    }
}

fn main() -> ExitCode {
    let _ = dotenv::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(name) = args.first() else {
        eprintln!("Usage: sentinel-cmd CMD [ARGS]");
        eprintln!("{}", Command::help_text());
        return ExitCode::FAILURE;
    };

    let Some(command) = Command::parse(name) else {
        eprintln!("Unknown command: {name}. Run `sentinel-cmd help` for the list.");
        return ExitCode::FAILURE;
    };

    if command == Command::Help {
        println!("{}", Command::help_text());
        return ExitCode::SUCCESS;
    }

    let bus = match CommandBus::new(command_dir()) {
        Ok(bus) => bus,
        Err(e) => {
            eprintln!("Command directory unavailable: {e}");
            return ExitCode::FAILURE;
        }
    };

    let request = CommandRequest::new(command, &args[1..].join(" "));
    if let Err(e) = bus.send(&request) {
        eprintln!("Failed to send command: {e}");
        return ExitCode::FAILURE;
    }
    println!(
        "Sent: {}{}",
        command.as_str(),
        if request.args.is_empty() {
            String::new()
        } else {
            format!(" {}", request.args)
        }
    );

    match bus.wait_for_response(response_timeout(command)) {
        Some(response) => {
            let icon = if response.ok { "OK " } else { "ERR" };
            println!("[{icon}] {}", response.message);
            if let Some(data) = &response.data {
                match data {
                    serde_json::Value::String(text) => println!("{text}"),
                    serde_json::Value::Array(items) => {
                        for item in items {
                            match item {
                                serde_json::Value::String(line) => println!("  - {line}"),
                                other => println!("  - {other}"),
                            }
                        }
                    }
                    serde_json::Value::Object(map) => {
                        for (key, value) in map {
                            println!("  {key}: {value}");
                        }
                    }
                    other => println!("{other}"),
                }
            }
            if response.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        None => {
            println!("Command sent. The orchestrator will process it on its next wake-up.");
            ExitCode::SUCCESS
        }
    }
}
