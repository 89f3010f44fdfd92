//! privcpu - CLI Entry Point
//!
//! `privcpu <program> <interval>` loads a program file and runs it with a
//! timer interrupt every `<interval>` user-mode instructions.

use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::Parser;
use privcpu::cpu::Snapshot;
use privcpu::{disassemble, load_program, Engine, EngineConfig, RunOutcome};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const USAGE_MESSAGE: &str = "Please input with format: [file_name] [interrupt_time]";
const INTERVAL_MESSAGE: &str = "Interrupt time must be integer and >= 0!";

#[derive(Parser)]
#[command(name = "privcpu")]
#[command(version)]
#[command(about = "A virtual CPU with user, timer-interrupt and system-call modes")]
struct Cli {
    /// Path to the program file
    program: PathBuf,

    /// User-mode instructions between timer interrupts
    #[arg(allow_hyphen_values = true, value_parser = parse_interval)]
    interval: u32,

    /// Log every retired instruction to stderr
    #[arg(short, long)]
    trace: bool,

    /// Stop after this many instructions
    #[arg(long)]
    max_steps: Option<u64>,

    /// Seed for the random-value instruction
    #[arg(long)]
    seed: Option<u64>,

    /// Print the final CPU state as JSON
    #[arg(long)]
    dump_state: bool,

    /// Print a listing of the program instead of running it
    #[arg(long)]
    disasm: bool,

    /// After a fault, run the diagnostic program that prints the fault
    #[arg(long)]
    replay_diagnostic: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    outcome: &'a RunOutcome,
    state: Snapshot,
}

fn parse_interval(value: &str) -> Result<u32, String> {
    value.trim().parse().map_err(|_| INTERVAL_MESSAGE.to_string())
}

/// True when the positional interval is the argument clap rejected.
fn is_interval_error(e: &clap::Error) -> bool {
    matches!(
        e.get(ContextKind::InvalidArg),
        Some(ContextValue::String(arg)) if arg.starts_with("<INTERVAL>")
    )
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => e.exit(),
            ErrorKind::ValueValidation if is_interval_error(&e) => {
                println!("{}", INTERVAL_MESSAGE);
                std::process::exit(1);
            }
            ErrorKind::ValueValidation => e.exit(),
            _ => {
                println!("{}", USAGE_MESSAGE);
                std::process::exit(1);
            }
        },
    };

    init_tracing(cli.trace);

    if !run(&cli) {
        std::process::exit(1);
    }
}

fn init_tracing(trace: bool) {
    let default = if trace { "privcpu=trace" } else { "privcpu=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load and run the program. Returns false if anything went wrong.
fn run(cli: &Cli) -> bool {
    let program = match load_program(&cli.program) {
        Ok(program) => program,
        Err(e) => {
            println!("{}", e);
            return false;
        }
    };
    tracing::info!(words = program.len(), path = %cli.program.display(), "loaded program");

    if cli.disasm {
        print!("{}", disassemble(&program));
        return true;
    }

    let mem = match program.to_memory() {
        Ok(mem) => mem,
        Err(e) => {
            println!("{}", e);
            return false;
        }
    };

    let config = EngineConfig {
        interrupt_interval: cli.interval,
        rng_seed: cli.seed,
        stage_diagnostics: true,
        max_steps: cli.max_steps,
    };
    let mut engine = Engine::new(mem, config);
    let outcome = engine.run();

    let ok = match &outcome {
        RunOutcome::Halted { .. } => true,
        RunOutcome::Faulted { fault, .. } => {
            if cli.replay_diagnostic {
                engine.run();
                println!();
            } else {
                println!("{}", fault);
            }
            false
        }
        RunOutcome::StepLimit { retired } => {
            println!("Stopped after {} instructions (--max-steps)", retired);
            true
        }
    };

    if cli.dump_state {
        let report = Report {
            outcome: &outcome,
            state: engine.snapshot(),
        };
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => println!("failed to serialize state: {}", e),
        }
    }

    ok
}
