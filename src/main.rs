//! GG-CTX command line entry point.
//!
//! ## CLI Subcommands
//!
//! - `gg-ctx-cli demo` - Run a scripted orchestration scenario (default)
//! - `gg-ctx-cli config show|defaults|validate` - Inspect configuration
//! - `gg-ctx-cli version` - Print the version

use std::process::ExitCode;

use gg_ctx::cli::{self, config_cmd, DemoOptions};
use gg_ctx::config as ctx_config;
use gg_ctx::telemetry::init_logging;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("demo");
    let rest = args.get(2..).unwrap_or(&[]).to_vec();

    match command {
        "demo" => {
            let config_file = cli::config_file_arg(&rest);
            let config = match config_cmd::load_from(config_file.as_deref()) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Configuration error: {}", e);
                    return ExitCode::from(2u8);
                }
            };
            let options = match DemoOptions::parse(&cli::strip_config_arg(&rest)) {
                Ok(options) => options,
                Err(e) => {
                    eprintln!("{}", e);
                    print_command_help("demo");
                    return ExitCode::FAILURE;
                }
            };
            if let Err(e) = init_logging(&config.log_config()) {
                eprintln!("Logging setup failed: {}", e);
                return ExitCode::from(2u8);
            }
            let code = cli::run_demo(config, options).await;
            ExitCode::from(code as u8)
        }
        "config" => {
            let subcommand = rest.first().map(|s| s.as_str()).unwrap_or("show");
            let config_file = cli::config_file_arg(&rest);
            match subcommand {
                "show" => ExitCode::from(config_cmd::run_show(config_file.as_deref()) as u8),
                "defaults" => {
                    config_cmd::run_defaults();
                    ExitCode::SUCCESS
                }
                "validate" => {
                    ExitCode::from(config_cmd::run_validate(config_file.as_deref()) as u8)
                }
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("gg-ctx {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "gg-ctx-cli - inference context orchestration v{}

USAGE:
    gg-ctx-cli [COMMAND] [OPTIONS]

COMMANDS:
    demo         Run a scripted orchestration scenario (default)
    config       Inspect configuration (show, defaults, validate)
    version      Show version information
    help         Show this help message

OPTIONS:
    -h, --help     Show help for command
    -V, --version  Show version information

ENVIRONMENT:
    {}",
        version,
        ctx_config::ENV_KEYS.join("\n    ")
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "demo" => {
            eprintln!(
                "gg-ctx-cli demo - Run a scripted orchestration scenario

USAGE:
    gg-ctx-cli demo [OPTIONS]

OPTIONS:
    --prompt TEXT   Prompt for the completion (tokens are its words)
    --parallel N    Also run N queued completions in parallel mode
    --json          Print events as JSON lines
    --config FILE   Load configuration from a TOML file

DESCRIPTION:
    Creates one context on the scripted engine with load progress
    enabled, runs a completion and a tokenize call, optionally queued
    completions, then releases the context, shuts down and prints
    every event delivered to the sink.

EXAMPLES:
    gg-ctx-cli demo
    gg-ctx-cli demo --prompt \"once upon a time\" --parallel 3 --json
"
            );
        }
        "config" => {
            eprintln!(
                "gg-ctx-cli config - Inspect configuration

USAGE:
    gg-ctx-cli config [show|defaults|validate] [--config FILE]

DESCRIPTION:
    show       Print effective values as KEY=VALUE
    defaults   Print built-in defaults
    validate   Check for misconfiguration (exit 1 on warnings)

EXIT CODES:
    0  Valid
    1  Warnings found
    2  Configuration file could not be loaded
"
            );
        }
        _ => {
            eprintln!("No detailed help for '{}'.", command);
            print_usage();
        }
    }
}
