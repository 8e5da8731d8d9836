use std::path::PathBuf;
use std::{fs, process};

use clap::{Parser, Subcommand};
use tether_core::backend::replay::{ReplayBackend, ReplayScript};
use tether_core::events::EventKind;
use tether_core::{Address, EntityKind, RunCtrls, Session, SessionConfig};
use tether_utils::{LogLevel, LogSettings, info, init_logging_with, warn};

/// Drive the Tether process-control core from recorded debug sessions.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version)]
#[command(about = "Drive the Tether process-control core from recorded debug sessions", long_about = None)]
struct Cli
{
    /// Log level (error, warn, info, debug, trace); defaults to RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Replay a JSON script through a session and print the events
    Replay
    {
        /// Path to the replay script
        script: PathBuf,
        /// Print one JSON object per event instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Plant a trap for every run, as PID:ADDRESS (address in hex or decimal)
        #[arg(long = "break", value_name = "PID:ADDRESS")]
        breaks: Vec<String>,
        /// Stop after this many runs (default: one per scripted run)
        #[arg(long)]
        max_runs: Option<usize>,
    },
    /// Load a script and print what it contains
    Check
    {
        /// Path to the replay script
        script: PathBuf,
    },
}

fn main()
{
    let cli = Cli::parse();

    let settings = LogSettings {
        level: cli.log_level,
        file: cli.log_file.clone().or_else(|| LogSettings::from_env().file),
        ..LogSettings::from_env()
    };
    let _guard = match init_logging_with(&settings) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run_command(cli.command) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(command: Commands) -> Result<(), Box<dyn std::error::Error>>
{
    match command {
        Commands::Replay {
            script,
            json,
            breaks,
            max_runs,
        } => {
            let script = load_script(&script)?;
            let traps = breaks
                .iter()
                .map(String::as_str)
                .map(parse_trap)
                .collect::<Result<Vec<_>, _>>()?;
            replay(script, &traps, json, max_runs)
        }
        Commands::Check { script } => {
            let script = load_script(&script)?;
            println!("Attach:   {:?}", script.attach);
            println!("Runs:     {}", script.runs.len());
            for (n, run) in script.runs.iter().enumerate() {
                let failure = run.failure.as_ref().map_or_else(String::new, |f| format!(" then fails: {f}"));
                println!("  #{}: {} native events{failure}", n + 1, run.events.len());
            }
            println!("Memory:   {} regions", script.memory.len());
            println!("Threads:  {}", script.threads.len());
            println!("Modules:  {}", script.modules.len());
            Ok(())
        }
    }
}

fn load_script(path: &PathBuf) -> Result<ReplayScript, Box<dyn std::error::Error>>
{
    let text = fs::read_to_string(path)?;
    let script: ReplayScript = serde_json::from_str(&text)?;
    info!("Loaded {} with {} runs", path.display(), script.runs.len());
    Ok(script)
}

fn parse_address(text: &str) -> Result<u64, std::num::ParseIntError>
{
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    }
}

fn parse_trap(arg: &str) -> Result<(u32, Address), String>
{
    let (pid, address) = arg
        .split_once(':')
        .ok_or_else(|| format!("bad trap '{arg}', expected PID:ADDRESS"))?;
    let pid = pid.trim().parse().map_err(|e| format!("bad pid in '{arg}': {e}"))?;
    let address = parse_address(address.trim()).map_err(|e| format!("bad address in '{arg}': {e}"))?;
    Ok((pid, Address::new(address)))
}

fn replay(
    script: ReplayScript,
    traps: &[(u32, Address)],
    json: bool,
    max_runs: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>>
{
    let runs = max_runs.unwrap_or(script.runs.len());
    let attach = script.attach.clone();
    let session = Session::new(ReplayBackend::from_script(script), SessionConfig::from_env()?)?;
    for pid in attach {
        session.attach_process(pid)?;
    }

    for n in 1..=runs {
        let mut ctrls = RunCtrls::default();
        for (id, (pid, address)) in traps.iter().enumerate() {
            // A process only has a handle once its creation has been reported.
            if let Some(process) = session.find(EntityKind::Process, u64::from(*pid)) {
                ctrls = ctrls.with_trap(process, *address, Some(id as u64));
            }
        }

        let events = session.run(&ctrls)?;
        for event in &events {
            if json {
                println!("{}", serde_json::to_string(event)?);
            } else {
                println!("[run {n}] {}", event.describe());
            }
        }
        if events.of_kind(EventKind::Error).next().is_some() {
            warn!("Stopping replay after run {n}: the core reported an error");
            break;
        }
    }

    if !json {
        print_summary(&session)?;
    }
    Ok(())
}

fn print_summary(session: &Session<ReplayBackend>) -> Result<(), Box<dyn std::error::Error>>
{
    let processes = session.all_processes();
    println!("\nSession summary (step {}):", session.step_counter());
    println!("  Processes: {}", processes.len());
    for process in processes {
        let pid = session.id_from_object(process)?;
        let arch = session.arch_from_object(process)?;
        let threads = session.threads_from_process(process)?;
        let modules = session.modules_from_process(process)?;
        println!(
            "  - pid {pid} [{arch}]: {} threads, {} modules",
            threads.len(),
            modules.len()
        );
        for module in modules {
            let (start, end) = session.vaddr_range_from_module(module)?;
            let path = session.full_path_from_module(module).unwrap_or_default();
            println!("      {start}..{end} {path}");
        }
    }
    Ok(())
}
