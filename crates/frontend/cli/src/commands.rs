use crate::report::{RunMode, RunSummary};
use crate::CaptureArgs;
use anyhow::{bail, Context, Result};
use probe_capture::{load_scenarios, CaptureSession, Scenario};
use probe_core::golden::{compare as compare_bytes, GoldenStore};
use probe_core::{CaptureResult, HarnessConfig, NamedRegion, RegisterSet};
use probe_gdb::DebugChannel;
use probe_qmp::ControlChannel;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn connect_control(config: &HarnessConfig) -> Result<ControlChannel> {
    let channel = ControlChannel::connect(&config.control).context("connecting to the monitor")?;
    if let Some(version) = channel.greeting().qemu_version() {
        log::info!("monitor: QEMU {}", version);
    }
    Ok(channel)
}

/// Connect and collect the stop the stub reports on attach.
fn connect_debug(config: &HarnessConfig) -> Result<DebugChannel> {
    let mut channel = DebugChannel::connect(&config.debug).context("connecting to the gdb stub")?;
    let stop = channel.halt_reason().context("querying halt reason")?;
    log::info!("debug stub attached: {}", stop);
    Ok(channel)
}

/// Relative outputs land in the captures directory; QEMU resolves paths
/// against its own working directory, so the result is made absolute.
fn output_path(config: &HarnessConfig, output: &Path) -> Result<PathBuf> {
    let path = if output.is_absolute() {
        output.to_path_buf()
    } else {
        config.capture.captures_dir.join(output)
    };
    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()?.join(path)
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(path)
}

fn split_keys(keys: &str) -> Vec<String> {
    keys.split_whitespace().map(str::to_string).collect()
}

pub fn screenshot(config: &HarnessConfig, output: &Path) -> Result<()> {
    let path = output_path(config, output)?;
    let mut control = connect_control(config)?;
    control.screendump(&path)?;
    control.close();
    println!("Saved screenshot to {}", path.display());
    Ok(())
}

pub fn dump_memory(config: &HarnessConfig, address: u32, size: usize, output: &Path) -> Result<()> {
    let path = output_path(config, output)?;
    let debug = connect_debug(config)?;
    let mut session = CaptureSession::debug_only(debug, config.capture.clone());
    let region = NamedRegion::new("dump", address, size);
    let result = session.capture_now("dump", &[region], false, true)?;
    let data = result.buffer("dump").unwrap_or_default();
    fs::write(&path, data).with_context(|| format!("writing {}", path.display()))?;
    println!("Saved {} bytes to {}", data.len(), path.display());
    session.into_channels().1.close();
    Ok(())
}

pub fn inject_keys(
    config: &HarnessConfig,
    keys: &str,
    delay_ms: u64,
    text: Option<&str>,
) -> Result<()> {
    let keys = split_keys(keys);
    if keys.is_empty() && text.is_none() {
        bail!("nothing to send: give keys and/or --text");
    }
    let mut control = connect_control(config)?;
    let hold = config.capture.key_hold();
    let delay = Duration::from_millis(delay_ms);
    control.send_keys(&keys, hold, delay)?;
    if let Some(text) = text {
        control.type_text(text, hold, delay)?;
    }
    control.close();
    println!("Injected {} keystrokes", keys.len() + text.map_or(0, |t| t.chars().count()));
    Ok(())
}

pub fn capture(config: &HarnessConfig, args: CaptureArgs) -> Result<()> {
    let name = args.snapshot.clone().unwrap_or_else(|| "capture".to_string());
    let mut scenario = Scenario::new(name);
    scenario.snapshot = args.snapshot;
    scenario.keys = args.keys.as_deref().map(split_keys).unwrap_or_default();
    scenario.wait_ms = args.wait.map(|secs| (secs.max(0.0) * 1000.0) as u64);
    scenario.breakpoint = args.breakpoint;
    scenario.screenshot = !args.no_screenshot;
    scenario.resume = !args.no_resume;

    let mut session = CaptureSession::new(
        connect_control(config)?,
        connect_debug(config)?,
        config.capture.clone(),
    );
    let outcome = session.run_scenario(&scenario);
    close(session);

    let result = outcome?;
    save_capture(config, &result)?;
    print_capture(&result);
    Ok(())
}

pub fn registers(config: &HarnessConfig) -> Result<()> {
    let debug = connect_debug(config)?;
    let mut session = CaptureSession::debug_only(debug, config.capture.clone());
    let result = session.capture_now("registers", &[], true, true)?;
    session.into_channels().1.close();
    if let Some(registers) = result.registers() {
        print_registers(registers);
    }
    Ok(())
}

pub fn snapshot(config: &HarnessConfig, name: &str, save: bool) -> Result<()> {
    let mut control = connect_control(config)?;
    if save {
        control.save_snapshot(name)?;
        println!("Snapshot saved: {}", name);
    } else {
        control.load_snapshot(name)?;
        println!("Snapshot loaded: {}", name);
    }
    control.close();
    Ok(())
}

pub fn run(config: &HarnessConfig, scenarios_path: &Path, mode: RunMode) -> Result<()> {
    let scenarios = load_scenarios(scenarios_path)?;
    log::info!("{} scenario(s) from {}", scenarios.len(), scenarios_path.display());

    let mut session = CaptureSession::new(
        connect_control(config)?,
        connect_debug(config)?,
        config.capture.clone(),
    );
    let report = session.run_all(&scenarios);
    close(session);

    let goldens = GoldenStore::new(&config.capture.golden_dir);
    let captures = GoldenStore::new(&config.capture.captures_dir);
    let mut summary = RunSummary::new(mode, report.aborted);
    for outcome in &report.outcomes {
        let entry = summary.push(&outcome.name, &outcome.result);
        let Ok(result) = &outcome.result else { continue };
        captures.record(result)?;
        match mode {
            RunMode::Capture => {}
            RunMode::Record => {
                goldens.record(result)?;
            }
            RunMode::Verify => {
                let verdict = goldens.verify(result)?;
                entry.add_verification(&verdict);
            }
        }
    }

    for entry in &summary.scenarios {
        println!("{}", entry);
    }
    let skipped = scenarios.len() - report.outcomes.len();
    if skipped > 0 {
        println!("{} scenario(s) not run: a channel was lost", skipped);
    }

    let path = output_path(config, Path::new("run_report.json"))?;
    summary.write(&path)?;
    println!("Report written to {}", path.display());

    if !summary.passed() {
        bail!("{} of {} scenario(s) failed", summary.failures(), scenarios.len());
    }
    Ok(())
}

pub fn compare(golden: &Path, actual: &Path) -> Result<()> {
    let expected = fs::read(golden).with_context(|| format!("reading {}", golden.display()))?;
    let got = fs::read(actual).with_context(|| format!("reading {}", actual.display()))?;
    let verdict = compare_bytes(&expected, &got);
    println!("{}", verdict);
    if !verdict.is_match() {
        bail!("{} differs from {}", actual.display(), golden.display());
    }
    Ok(())
}

fn close(session: CaptureSession) {
    let (control, debug) = session.into_channels();
    if let Some(control) = control {
        control.close();
    }
    debug.close();
}

fn save_capture(config: &HarnessConfig, result: &CaptureResult) -> Result<()> {
    let store = GoldenStore::new(&config.capture.captures_dir);
    for path in store.record(result)? {
        println!("Saved {}", path.display());
    }
    if let Some(shot) = result.screenshot() {
        println!("Saved {}", shot.display());
    }
    Ok(())
}

fn print_capture(result: &CaptureResult) {
    if let Some(stop) = result.stop_reason() {
        println!("Stopped: {}", stop);
    }
    for (name, data) in result.buffers() {
        println!("  {:12} {} bytes", name, data.len());
    }
    if let Some(registers) = result.registers() {
        print_registers(registers);
    }
}

fn print_registers(registers: &RegisterSet) {
    for (name, value) in registers.iter() {
        if RegisterSet::is_segment(name) {
            println!("  {:8} = 0x{:04X}", name, value);
        } else {
            println!("  {:8} = 0x{:08X}", name, value);
        }
    }
}
