use smcfuzz_core::call::{CallId, ParamVector};
use smcfuzz_core::channel::{ControlChannel, Response};
use smcfuzz_core::config::{CommandGateSettings, GateType, SmcFuzzConfig};
use smcfuzz_core::controller::Controller;
use smcfuzz_core::corpus::{OPTEE_SMC_CALL_WITH_ARG, OPTEE_SMC_GET_SHM_CONFIG, optee_name};
use smcfuzz_core::gate::{CallGate, CommandGate, FnGate};
use smcfuzz_core::generator::PAGE_SIZE;

use clap::Parser;
use std::io::{BufRead, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Forward calls to this helper instead of the simulated monitor.
    #[clap(long)]
    gate_command: Option<String>,
    /// Iterations for the default campaign.
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(long)]
    seed: Option<u64>,
    #[clap(short, long)]
    verbose: bool,
    /// Read one command per line from stdin.
    #[clap(long, conflicts_with = "commands")]
    stdin: bool,
    /// Print the final status as JSON.
    #[clap(long)]
    json: bool,
    /// Commands to send in order, e.g. "fuzz 100" test reset.
    commands: Vec<String>,
}

/// Returned by the simulated monitor for its planted GET_SHM_CONFIG fault.
const SIMULATED_FAULT_RESULT: u64 = 0x0bad_c0de;

/// Stand-in for a secure monitor when no helper command is configured.
///
/// Known OP-TEE ids succeed, everything else is rejected, and a couple of
/// planted quirks give the oracle something to find.
fn simulated_monitor(id: CallId, params: &ParamVector) -> u64 {
    if id == OPTEE_SMC_CALL_WITH_ARG && params[0] == PAGE_SIZE {
        return PAGE_SIZE;
    }
    if id == OPTEE_SMC_GET_SHM_CONFIG && params[0] == u64::MAX && params[1] == u64::MAX {
        return SIMULATED_FAULT_RESULT;
    }
    match optee_name(id) {
        Some(_) => 0,
        None => u64::MAX,
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<SmcFuzzConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            tracing::info!("Loading configuration from specified path: {config_path:?}");
            SmcFuzzConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("smcfuzz.toml");
            if default_config_path.exists() {
                tracing::info!(
                    "No config file specified via CLI, loading default: {default_config_path:?}"
                );
                SmcFuzzConfig::load_from_file(&default_config_path)?
            } else {
                tracing::debug!(
                    "No config file specified and default 'smcfuzz.toml' not found, using built-in defaults."
                );
                SmcFuzzConfig::default()
            }
        }
    };

    if let Some(iterations) = cli.iterations {
        config.campaign.default_iterations = iterations;
    }
    if let Some(seed) = cli.seed {
        config.campaign.seed = Some(seed);
    }
    if let Some(gate_command) = &cli.gate_command {
        let command: Vec<String> = gate_command.split_whitespace().map(String::from).collect();
        config.gate.gate_type = GateType::Command;
        match config.gate.command_settings.as_mut() {
            Some(settings) => settings.command = command,
            None => {
                config.gate.command_settings = Some(CommandGateSettings {
                    command,
                    timeout_ms: 2000,
                    working_dir: None,
                })
            }
        }
    }
    config.validate()?;
    tracing::debug!("Effective configuration: {config:#?}");
    Ok(config)
}

fn build_gate(config: &SmcFuzzConfig) -> Result<Box<dyn CallGate>, anyhow::Error> {
    let gate: Box<dyn CallGate> = match config.command_gate_config()? {
        Some(gate_config) => {
            tracing::info!("Using command gate: {:?}", gate_config.command);
            Box::new(CommandGate::new(gate_config)?)
        }
        None => Box::new(FnGate::new("simulated-monitor", simulated_monitor)),
    };
    Ok(gate)
}

fn report(response: &Response) {
    match response {
        Response::Campaign(report) => {
            println!(
                "Campaign: {}/{} iterations in {:.2?} ({} yields){}",
                report.executed,
                report.requested,
                report.elapsed,
                report.yields,
                if report.interrupted() {
                    format!(", stopped: {:?}", report.stop_reason)
                } else {
                    String::new()
                }
            );
        }
        Response::SelfTest(report) => {
            println!("Self-test:");
            for result in &report.results {
                match &result.result {
                    Ok(value) => println!(
                        "  {} {:<22} -> {:#x}",
                        result.entry.id, result.entry.name, value
                    ),
                    Err(fault) => println!(
                        "  {} {:<22} -> {}",
                        result.entry.id, result.entry.name, fault
                    ),
                }
            }
        }
        Response::Enabled => println!("Fuzzing enabled"),
        Response::Disabled => println!("Fuzzing disabled"),
        Response::Reset => println!("Statistics reset"),
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    let gate = build_gate(&config)?;
    let controller = Arc::new(Controller::from_config(&config, gate)?);
    let channel = ControlChannel::new(Arc::clone(&controller));

    let commands: Vec<String> = if cli.stdin {
        std::io::stdin()
            .lock()
            .lines()
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .collect()
    } else if cli.commands.is_empty() {
        vec![
            "test".to_string(),
            format!("fuzz {}", config.campaign.default_iterations),
        ]
    } else {
        cli.commands.clone()
    };

    let mut rejected = 0usize;
    for command in &commands {
        match channel.submit(command.as_bytes()) {
            Ok(response) => report(&response),
            Err(e) => {
                tracing::error!("Command {command:?} rejected: {e}");
                rejected += 1;
            }
        }
    }

    if cli.json {
        println!("{}", channel.read_json()?);
    } else {
        print!("{}", channel.read());
    }
    controller.shutdown();

    if rejected > 0 {
        anyhow::bail!("{rejected} command(s) rejected");
    }
    Ok(())
}
