use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use probe_core::address::{parse_address, parse_number};
use probe_core::logging::{LogConfig, LogLevel};
use probe_core::HarnessConfig;
use std::path::PathBuf;

mod commands;
mod report;

#[derive(Parser)]
#[command(name = "dosprobe", version, about)]
struct Args {
    /// Harness configuration (JSON); defaults are used when the file is missing
    #[arg(long, default_value = "dosprobe.json")]
    config: PathBuf,

    /// Level for the harness log categories: off, error, warn, info, debug, trace
    #[arg(long, default_value = "info", value_parser = parse_level)]
    log_level: LogLevel,

    /// Also append harness logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Override the monitor socket path
    #[arg(long)]
    qmp_socket: Option<PathBuf>,

    /// Override the gdb stub port
    #[arg(long)]
    gdb_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Save a screendump of the guest display
    Screenshot {
        #[arg(default_value = "screenshot.ppm")]
        output: PathBuf,
    },
    /// Halt the guest and dump a block of physical memory
    DumpMemory {
        /// Linear address (0x hex or decimal) or SSSS:OOOO
        #[arg(value_parser = parse_addr)]
        address: u32,
        #[arg(value_parser = parse_size)]
        size: u32,
        output: PathBuf,
    },
    /// Send keys to the guest
    InjectKeys {
        /// Whitespace-separated qcodes, e.g. "right right ret"
        #[arg(default_value = "")]
        keys: String,
        /// Milliseconds between keys
        #[arg(long, default_value_t = 150)]
        delay: u64,
        /// Text typed after the keys
        #[arg(long)]
        text: Option<String>,
    },
    /// Run one ad-hoc capture
    Capture(CaptureArgs),
    /// Halt the guest and print its registers
    Registers,
    /// Save or load a VM snapshot
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
    /// Run every scenario in a file
    Run {
        scenarios: PathBuf,
        /// Store results as the new goldens
        #[arg(long, conflicts_with = "verify")]
        record: bool,
        /// Compare results against the stored goldens
        #[arg(long)]
        verify: bool,
    },
    /// Compare two binary dumps byte for byte
    Compare { golden: PathBuf, actual: PathBuf },
}

#[derive(ClapArgs)]
pub(crate) struct CaptureArgs {
    /// Snapshot to load first
    #[arg(short, long)]
    snapshot: Option<String>,
    /// Capture when execution reaches this address instead of interrupting
    #[arg(short, long, value_parser = parse_addr)]
    breakpoint: Option<u32>,
    /// Whitespace-separated qcodes sent after loading
    #[arg(short, long)]
    keys: Option<String>,
    /// Seconds to wait after the keys before halting
    #[arg(short, long)]
    wait: Option<f64>,
    /// Skip the screendump
    #[arg(long)]
    no_screenshot: bool,
    /// Leave the guest halted afterwards
    #[arg(long)]
    no_resume: bool,
}

#[derive(Subcommand)]
enum SnapshotAction {
    Save { name: String },
    Load { name: String },
}

fn parse_level(text: &str) -> Result<LogLevel, String> {
    LogLevel::from_str(text).ok_or_else(|| format!("unknown log level {:?}", text))
}

fn parse_addr(text: &str) -> Result<u32, String> {
    parse_address(text).map_err(|e| e.to_string())
}

fn parse_size(text: &str) -> Result<u32, String> {
    parse_number(text).map_err(|e| e.to_string())
}

fn init_logging(args: &Args) -> Result<()> {
    env_logger::init();
    let logs = LogConfig::global();
    logs.set_global_level(args.log_level);
    if let Some(path) = &args.log_file {
        logs.set_log_file(path.clone())
            .with_context(|| format!("opening log file {}", path.display()))?;
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<HarnessConfig> {
    let mut config = HarnessConfig::load(&args.config)?;
    if let Some(socket) = &args.qmp_socket {
        config.control.socket_path = socket.clone();
        config.control.tcp_address = None;
    }
    if let Some(port) = args.gdb_port {
        config.debug.port = port;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    let config = load_config(&args)?;
    log::debug!("configuration: {:?}", config);

    let result = match args.command {
        Command::Screenshot { output } => commands::screenshot(&config, &output),
        Command::DumpMemory {
            address,
            size,
            output,
        } => commands::dump_memory(&config, address, size as usize, &output),
        Command::InjectKeys { keys, delay, text } => {
            commands::inject_keys(&config, &keys, delay, text.as_deref())
        }
        Command::Capture(capture) => commands::capture(&config, capture),
        Command::Registers => commands::registers(&config),
        Command::Snapshot { action } => match action {
            SnapshotAction::Save { name } => commands::snapshot(&config, &name, true),
            SnapshotAction::Load { name } => commands::snapshot(&config, &name, false),
        },
        Command::Run {
            scenarios,
            record,
            verify,
        } => {
            let mode = if record {
                report::RunMode::Record
            } else if verify {
                report::RunMode::Verify
            } else {
                report::RunMode::Capture
            };
            commands::run(&config, &scenarios, mode)
        }
        Command::Compare { golden, actual } => commands::compare(&golden, &actual),
    };

    LogConfig::global().clear_log_file();
    result
}
