use crate::error::{CaptureCause, CaptureError, CaptureStep};
use crate::scenario::{Scenario, Timing};
use probe_core::logging::{log, LogCategory, LogLevel};
use probe_core::{CaptureBuilder, CaptureConfig, CaptureResult, ErrorKind, NamedRegion, StopReason};
use probe_gdb::DebugChannel;
use probe_qmp::ControlChannel;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Sequences captures across the control and debug channels.
///
/// The session owns both channels for its lifetime. Memory and registers are
/// only read while the debug channel holds a confirmed stop.
pub struct CaptureSession {
    control: Option<ControlChannel>,
    debug: DebugChannel,
    config: CaptureConfig,
}

/// Per-capture accumulator; turns a failure into a [`CaptureError`] carrying
/// whatever was captured so far.
struct Progress {
    scenario: String,
    builder: CaptureBuilder,
}

impl Progress {
    fn new(scenario: &str) -> Self {
        Self {
            scenario: scenario.to_string(),
            builder: CaptureBuilder::new(scenario),
        }
    }

    fn fail(&self, step: CaptureStep, cause: impl Into<CaptureCause>) -> CaptureError {
        let err = CaptureError {
            scenario: self.scenario.clone(),
            step,
            cause: cause.into(),
            partial: self.builder.clone().build(),
        };
        log(LogCategory::Capture, LogLevel::Error, || err.to_string());
        err
    }
}

/// Outcome of one scenario within [`CaptureSession::run_all`].
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub name: String,
    pub result: Result<CaptureResult, CaptureError>,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<ScenarioOutcome>,
    /// Set when a failure left a channel unusable and the remaining
    /// scenarios were not attempted
    pub aborted: bool,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn all_passed(&self) -> bool {
        !self.aborted && self.failed() == 0
    }
}

impl CaptureSession {
    pub fn new(control: ControlChannel, debug: DebugChannel, config: CaptureConfig) -> Self {
        Self {
            control: Some(control),
            debug,
            config,
        }
    }

    /// A session without a control channel: breakpoint and immediate captures
    /// only.
    pub fn debug_only(debug: DebugChannel, config: CaptureConfig) -> Self {
        Self {
            control: None,
            debug,
            config,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn debug(&mut self) -> &mut DebugChannel {
        &mut self.debug
    }

    pub fn control(&mut self) -> Option<&mut ControlChannel> {
        self.control.as_mut()
    }

    /// Give the channels back, e.g. to close them explicitly.
    pub fn into_channels(self) -> (Option<ControlChannel>, DebugChannel) {
        (self.control, self.debug)
    }

    /// Interrupt the guest wherever it is and capture.
    pub fn capture_now(
        &mut self,
        name: &str,
        regions: &[NamedRegion],
        registers: bool,
        resume: bool,
    ) -> Result<CaptureResult, CaptureError> {
        let mut progress = Progress::new(name);
        let stop_timeout = self.config.stop_timeout();
        self.halt_now(&mut progress, stop_timeout)?;
        self.read_into(&mut progress, regions, registers)?;
        if resume {
            self.resume(&progress)?;
        }
        Ok(progress.builder.build())
    }

    /// Run to `address` and capture there. The breakpoint is removed
    /// before returning, on success and on failure alike when the channel
    /// still allows it.
    pub fn capture_at_breakpoint(
        &mut self,
        name: &str,
        address: u32,
        regions: &[NamedRegion],
        registers: bool,
        resume: bool,
    ) -> Result<CaptureResult, CaptureError> {
        let mut progress = Progress::new(name);
        let timeout = self.config.breakpoint_timeout();
        self.halt_at_breakpoint(&mut progress, address, timeout)?;
        let captured = self.read_into(&mut progress, regions, registers);
        self.finish_breakpoint(&progress, address, captured)?;
        if resume {
            self.resume(&progress)?;
        }
        Ok(progress.builder.build())
    }

    /// Read the given state from an already halted guest.
    ///
    /// Fails with [`CaptureCause::NotHalted`] without touching the channel
    /// unless a stop has been confirmed since the guest was last resumed.
    pub fn read_state(
        &mut self,
        name: &str,
        regions: &[NamedRegion],
        registers: bool,
    ) -> Result<CaptureResult, CaptureError> {
        let mut progress = Progress::new(name);
        if let Some(stop) = self.debug.confirmed_stop() {
            progress.builder.stop_reason(stop.clone());
        }
        self.read_into(&mut progress, regions, registers)?;
        Ok(progress.builder.build())
    }

    /// Snapshot, keys, wait, halt, capture, optional screenshot, resume.
    ///
    /// A guest still halted from an earlier capture (or from attaching) is
    /// resumed before any input is delivered.
    pub fn run_scenario(&mut self, scenario: &Scenario) -> Result<CaptureResult, CaptureError> {
        let timing = scenario.timing(&self.config);
        let mut progress = Progress::new(&scenario.name);
        log(LogCategory::Capture, LogLevel::Info, || {
            format!("scenario {:?}", scenario.name)
        });

        if scenario.needs_control() && self.control.is_none() {
            let step = if scenario.snapshot.is_some() {
                CaptureStep::LoadSnapshot
            } else if !scenario.keys.is_empty() || scenario.text.is_some() {
                CaptureStep::InjectKeys
            } else {
                CaptureStep::Screenshot
            };
            return Err(progress.fail(step, CaptureCause::NoControlChannel));
        }

        self.prepare_inputs(&progress, scenario, &timing)?;

        match scenario.breakpoint {
            Some(address) => {
                self.halt_at_breakpoint(&mut progress, address, timing.breakpoint_timeout)?;
                let captured = self
                    .read_into(&mut progress, &scenario.regions, scenario.registers)
                    .and_then(|_| self.screenshot_if(&mut progress, scenario));
                self.finish_breakpoint(&progress, address, captured)?;
            }
            None => {
                self.halt_now(&mut progress, timing.stop_timeout)?;
                self.read_into(&mut progress, &scenario.regions, scenario.registers)?;
                self.screenshot_if(&mut progress, scenario)?;
            }
        }

        if scenario.resume {
            self.resume(&progress)?;
        }

        let result = progress.builder.build();
        log(LogCategory::Capture, LogLevel::Info, || {
            format!(
                "scenario {:?} captured {} buffer(s)",
                scenario.name,
                result.buffer_count()
            )
        });
        Ok(result)
    }

    /// Run scenarios in order. A command-level failure is recorded and the
    /// run moves on; any other failure stops the run, since one of the
    /// channels can no longer be trusted.
    pub fn run_all(&mut self, scenarios: &[Scenario]) -> RunReport {
        let mut report = RunReport::default();
        for scenario in scenarios {
            let result = self.run_scenario(scenario);
            let fatal = matches!(&result, Err(e) if !e.is_recoverable());
            report.outcomes.push(ScenarioOutcome {
                name: scenario.name.clone(),
                result,
            });
            if fatal {
                log(LogCategory::Capture, LogLevel::Error, || {
                    format!(
                        "aborting run: {} scenario(s) not attempted",
                        scenarios.len() - report.outcomes.len()
                    )
                });
                report.aborted = true;
                break;
            }
        }
        report
    }

    fn prepare_inputs(
        &mut self,
        progress: &Progress,
        scenario: &Scenario,
        timing: &Timing,
    ) -> Result<(), CaptureError> {
        let Some(control) = self.control.as_mut() else {
            thread::sleep(timing.wait);
            return Ok(());
        };

        if let Some(snapshot) = &scenario.snapshot {
            control
                .load_snapshot(snapshot)
                .map_err(|e| progress.fail(CaptureStep::LoadSnapshot, e))?;
            thread::sleep(timing.settle);
        }

        // Input is only consumed by a running guest
        if scenario.has_input() && self.debug.confirmed_stop().is_some() {
            self.debug
                .continue_execution()
                .map_err(|e| progress.fail(CaptureStep::Resume, e))?;
        }

        if !scenario.keys.is_empty() {
            log(LogCategory::Capture, LogLevel::Debug, || {
                format!("injecting keys {:?}", scenario.keys)
            });
            control
                .send_keys(&scenario.keys, timing.key_hold, timing.key_delay)
                .map_err(|e| progress.fail(CaptureStep::InjectKeys, e))?;
        }
        if let Some(text) = &scenario.text {
            control
                .type_text(text, timing.key_hold, timing.key_delay)
                .map_err(|e| progress.fail(CaptureStep::InjectKeys, e))?;
        }

        thread::sleep(timing.wait);
        Ok(())
    }

    fn halt_now(&mut self, progress: &mut Progress, timeout: Duration) -> Result<(), CaptureError> {
        if let Some(stop) = self.debug.confirmed_stop() {
            log(LogCategory::Capture, LogLevel::Debug, || {
                format!("guest already halted ({})", stop)
            });
            progress.builder.stop_reason(stop.clone());
            return Ok(());
        }
        self.debug
            .stop()
            .map_err(|e| progress.fail(CaptureStep::Halt, e))?;
        let stop = self
            .debug
            .wait_for_stop(timeout)
            .map_err(|e| progress.fail(CaptureStep::WaitForStop, e))?;
        self.accept_stop(progress, stop)
    }

    fn halt_at_breakpoint(
        &mut self,
        progress: &mut Progress,
        address: u32,
        timeout: Duration,
    ) -> Result<(), CaptureError> {
        self.debug
            .set_breakpoint(address)
            .map_err(|e| progress.fail(CaptureStep::SetBreakpoint, e))?;

        let resumed = self.debug.continue_execution();
        if let Err(e) = resumed {
            let err = progress.fail(CaptureStep::Resume, e);
            self.release_breakpoint(address);
            return Err(err);
        }

        log(LogCategory::Capture, LogLevel::Info, || {
            format!("waiting up to {:?} for breakpoint at {:#x}", timeout, address)
        });
        let stop = match self.debug.wait_for_stop(timeout) {
            Ok(stop) => stop,
            Err(e) => {
                let cause = if e.kind() == ErrorKind::Timeout {
                    CaptureCause::BreakpointNeverHit {
                        address,
                        waited: timeout,
                    }
                } else {
                    CaptureCause::Channel(e)
                };
                let err = progress.fail(CaptureStep::WaitForStop, cause);
                self.release_breakpoint(address);
                return Err(err);
            }
        };

        if let Some(eip) = stop.register(probe_core::types::EIP_INDEX) {
            if eip != address {
                log(LogCategory::Capture, LogLevel::Warn, || {
                    format!("stopped at {:#x}, not at breakpoint {:#x}", eip, address)
                });
            }
        }
        if let Err(err) = self.accept_stop(progress, stop) {
            self.release_breakpoint(address);
            return Err(err);
        }
        Ok(())
    }

    fn accept_stop(&mut self, progress: &mut Progress, stop: StopReason) -> Result<(), CaptureError> {
        if !stop.is_halt() {
            return Err(progress.fail(CaptureStep::WaitForStop, CaptureCause::UnexpectedStop(stop)));
        }
        log(LogCategory::Capture, LogLevel::Info, || format!("halted: {}", stop));
        progress.builder.stop_reason(stop);
        Ok(())
    }

    fn read_into(
        &mut self,
        progress: &mut Progress,
        regions: &[NamedRegion],
        registers: bool,
    ) -> Result<(), CaptureError> {
        if self.debug.confirmed_stop().is_none() {
            let step = if registers {
                CaptureStep::ReadRegisters
            } else {
                CaptureStep::ReadMemory
            };
            return Err(progress.fail(step, CaptureCause::NotHalted));
        }

        if registers {
            let regs = self
                .debug
                .read_registers()
                .map_err(|e| progress.fail(CaptureStep::ReadRegisters, e))?;
            log(LogCategory::Capture, LogLevel::Info, || {
                format!("EIP=0x{:08X} CS=0x{:04X}", regs.eip, regs.cs)
            });
            progress.builder.registers(regs);
        }

        for region in regions {
            let data = self
                .debug
                .read_memory(region.region.address, region.region.length)
                .map_err(|e| progress.fail(CaptureStep::ReadMemory, e))?;
            log(LogCategory::Capture, LogLevel::Debug, || {
                format!(
                    "{}: {:#x}+{:#x}",
                    region.name, region.region.address, region.region.length
                )
            });
            progress.builder.push_buffer(region.name.clone(), data);
        }
        Ok(())
    }

    fn screenshot_if(&mut self, progress: &mut Progress, scenario: &Scenario) -> Result<(), CaptureError> {
        if !scenario.screenshot {
            return Ok(());
        }
        let Some(control) = self.control.as_mut() else {
            return Err(progress.fail(CaptureStep::Screenshot, CaptureCause::NoControlChannel));
        };

        let dir = absolute(&self.config.captures_dir);
        fs::create_dir_all(&dir).map_err(|source| {
            progress.fail(
                CaptureStep::Screenshot,
                CaptureCause::Io {
                    path: dir.clone(),
                    source,
                },
            )
        })?;
        let path = dir.join(format!("{}_screenshot.ppm", scenario.name));
        control
            .screendump(&path)
            .map_err(|e| progress.fail(CaptureStep::Screenshot, e))?;
        progress.builder.screenshot(path);
        Ok(())
    }

    /// Remove the breakpoint after a capture attempt; the capture's own
    /// error takes precedence over a removal error.
    fn finish_breakpoint(
        &mut self,
        progress: &Progress,
        address: u32,
        captured: Result<(), CaptureError>,
    ) -> Result<(), CaptureError> {
        if let Err(err) = captured {
            self.release_breakpoint(address);
            return Err(err);
        }
        self.debug
            .remove_breakpoint(address)
            .map_err(|e| progress.fail(CaptureStep::RemoveBreakpoint, e))
    }

    /// Best-effort removal on a failure path.
    fn release_breakpoint(&mut self, address: u32) {
        if !self.debug.is_usable() {
            log(LogCategory::Capture, LogLevel::Warn, || {
                format!(
                    "breakpoint at {:#x} left in place: debug channel needs a reconnect",
                    address
                )
            });
            return;
        }
        if let Err(e) = self.debug.remove_breakpoint(address) {
            log(LogCategory::Capture, LogLevel::Warn, || {
                format!("could not remove breakpoint at {:#x}: {}", address, e)
            });
        }
    }

    fn resume(&mut self, progress: &Progress) -> Result<(), CaptureError> {
        self.debug
            .continue_execution()
            .map_err(|e| progress.fail(CaptureStep::Resume, e))
    }
}

fn absolute(path: &std::path::Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
