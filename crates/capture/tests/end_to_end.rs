//! Full capture sequences against the fake monitor and fake debug stub.

use probe_capture::{CaptureCause, CaptureSession, CaptureStep, Scenario};
use probe_core::golden::GoldenStore;
use probe_core::{CaptureConfig, ControlConfig, DebugConfig, ErrorKind, NamedRegion, RegisterSet};
use probe_gdb::fake::{FakeStub, StubLog, StubScript};
use probe_gdb::DebugChannel;
use probe_qmp::fake::{FakeMonitor, MonitorLog, MonitorScript};
use probe_qmp::ControlChannel;
use std::path::PathBuf;
use std::time::Duration;

const BREAKPOINT: u32 = 0x1A3F0;

fn frame() -> Vec<u8> {
    (0..64000u32).map(|i| (i % 256) as u8).collect()
}

fn scratch_dir(test: &str) -> PathBuf {
    std::env::temp_dir().join(format!("probe_e2e_{}_{}", test, std::process::id()))
}

fn capture_config(dir: &PathBuf) -> CaptureConfig {
    CaptureConfig {
        captures_dir: dir.join("captures"),
        golden_dir: dir.join("golden"),
        settle_ms: 0,
        key_delay_ms: 10,
        wait_ms: 0,
        stop_timeout_ms: 2_000,
        breakpoint_timeout_ms: 2_000,
        ..CaptureConfig::default()
    }
}

fn debug_channel(stub: &FakeStub) -> DebugChannel {
    let config = DebugConfig {
        read_timeout_ms: 2_000,
        ..DebugConfig::default()
    };
    DebugChannel::connect_tcp(&stub.address(), &config).unwrap()
}

fn control_channel(monitor: &FakeMonitor) -> ControlChannel {
    let config = ControlConfig {
        tcp_address: Some(monitor.address()),
        handshake_timeout_ms: 2_000,
        reply_timeout_ms: 2_000,
        ..ControlConfig::default()
    };
    ControlChannel::connect(&config).unwrap()
}

struct Rig {
    session: CaptureSession,
    monitor: FakeMonitor,
    stub: FakeStub,
}

impl Rig {
    fn new(monitor: MonitorScript, stub: StubScript, config: CaptureConfig) -> Self {
        let monitor = FakeMonitor::spawn(monitor).unwrap();
        let stub = FakeStub::spawn(stub).unwrap();
        let mut debug = debug_channel(&stub);
        // Attaching halts the guest
        debug.halt_reason().unwrap();
        let session = CaptureSession::new(control_channel(&monitor), debug, config);
        Self {
            session,
            monitor,
            stub,
        }
    }

    fn finish(self) -> (MonitorLog, StubLog) {
        let (control, debug) = self.session.into_channels();
        if let Some(control) = control {
            control.close();
        }
        debug.close();
        (self.monitor.join(), self.stub.join())
    }
}

fn game_start() -> Scenario {
    let mut scenario = Scenario::new("game_start");
    scenario.snapshot = Some("game_start".to_string());
    scenario.keys = vec!["right".to_string(); 3];
    scenario.wait_ms = Some(500);
    scenario.breakpoint = Some(BREAKPOINT);
    scenario.regions = vec![NamedRegion::new("framebuffer", 0xA0000, 64000)];
    scenario
}

#[test]
fn test_game_start_scenario_captures_framebuffer_at_breakpoint() {
    let dir = scratch_dir("game_start");
    let mut rig = Rig::new(
        MonitorScript::new().snapshot("game_start"),
        StubScript::new().fill(0xA0000, &frame()),
        capture_config(&dir),
    );

    let result = rig.session.run_scenario(&game_start()).unwrap();
    assert_eq!(result.scenario(), "game_start");
    assert_eq!(result.buffer("framebuffer").unwrap(), frame().as_slice());
    assert_eq!(result.registers().unwrap().eip, BREAKPOINT);
    assert_eq!(result.stop_reason().unwrap().register(8), Some(BREAKPOINT));

    let (monitor, stub) = rig.finish();
    assert_eq!(monitor.snapshots_loaded, vec!["game_start"]);
    assert_eq!(monitor.keys, vec!["right", "right", "right"]);
    assert_eq!(stub.count("m"), 16);
    assert!(stub.breakpoints.is_empty());
    assert_eq!(stub.commands.last().map(String::as_str), Some("c"));
    assert_eq!(stub.ack_violations, 0);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_reading_without_confirmed_stop_is_refused() {
    let stub = FakeStub::spawn(StubScript::new()).unwrap();
    let mut session = CaptureSession::debug_only(debug_channel(&stub), CaptureConfig::default());

    let err = session
        .read_state("peek", &[NamedRegion::framebuffer()], true)
        .unwrap_err();
    assert!(matches!(err.cause, CaptureCause::NotHalted));
    assert_eq!(err.step, CaptureStep::ReadRegisters);
    assert!(err.partial.is_empty());

    let (_, debug) = session.into_channels();
    debug.close();
    assert!(stub.join().commands.is_empty());
}

#[test]
fn test_failure_returns_partial_capture_and_removes_breakpoint() {
    let dir = scratch_dir("partial");
    let mut rig = Rig::new(
        MonitorScript::new().snapshot("game_start"),
        StubScript::new()
            .fill(0xA0000, &frame())
            .memory_error_at(0x2A400),
        capture_config(&dir),
    );

    let mut scenario = game_start();
    scenario.wait_ms = Some(0);
    scenario
        .regions
        .push(NamedRegion::new("state", 0x2A400, 256));

    let err = rig.session.run_scenario(&scenario).unwrap_err();
    assert_eq!(err.step, CaptureStep::ReadMemory);
    match &err.cause {
        CaptureCause::Channel(e) => {
            assert_eq!(e.kind(), ErrorKind::Command);
            assert_eq!(e.address(), Some(0x2A400));
        }
        other => panic!("unexpected cause {:?}", other),
    }
    assert!(err.is_recoverable());
    assert_eq!(err.partial.buffer("framebuffer").unwrap().len(), 64000);
    assert!(err.partial.buffer("state").is_none());
    assert_eq!(err.partial.registers().unwrap().eip, BREAKPOINT);

    let (_, stub) = rig.finish();
    assert!(stub.breakpoints.is_empty());
    // Resumed for input and for the breakpoint, never after the failure
    assert_eq!(stub.count("c"), 2);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_breakpoint_never_hit() {
    let dir = scratch_dir("never_hit");
    let mut config = capture_config(&dir);
    config.breakpoint_timeout_ms = 300;
    let mut rig = Rig::new(MonitorScript::new(), StubScript::new().silent(), config);

    let mut scenario = Scenario::new("stuck");
    scenario.breakpoint = Some(BREAKPOINT);
    let err = rig.session.run_scenario(&scenario).unwrap_err();

    assert_eq!(err.step, CaptureStep::WaitForStop);
    assert!(matches!(
        err.cause,
        CaptureCause::BreakpointNeverHit { address: BREAKPOINT, .. }
    ));
    assert!(err.to_string().contains("never hit"), "{}", err);
    assert!(!err.is_recoverable());
    assert!(err.partial.is_empty());
    assert!(!rig.session.debug().is_usable());

    let (_, stub) = rig.finish();
    // The channel was poisoned, so removal was not attempted
    assert_eq!(stub.breakpoints, vec![BREAKPOINT]);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_immediate_capture_interrupts_and_resumes() {
    let registers = RegisterSet {
        eip: 0x0042,
        cs: 0x1A00,
        ..Default::default()
    };
    let stub = FakeStub::spawn(StubScript::new().registers(registers)).unwrap();
    let mut session = CaptureSession::debug_only(debug_channel(&stub), CaptureConfig::default());

    // The guest is running before the capture
    session.debug().continue_execution().unwrap();
    let result = session
        .capture_now("now", &[NamedRegion::new("ivt", 0, 1024)], true, true)
        .unwrap();
    assert_eq!(result.buffer("ivt").unwrap().len(), 1024);
    assert_eq!(result.registers().unwrap().cs, 0x1A00);
    assert!(session.debug().confirmed_stop().is_none());

    let (_, debug) = session.into_channels();
    debug.close();
    let log = stub.join();
    assert_eq!(log.interrupts, 1);
    assert_eq!(log.count("c"), 2);
}

#[test]
fn test_capture_at_breakpoint_without_resume_stays_halted() {
    let stub = FakeStub::spawn(StubScript::new().fill(0x2A400, &[7; 16])).unwrap();
    let mut session = CaptureSession::debug_only(debug_channel(&stub), CaptureConfig::default());

    let regions = [NamedRegion::new("state", 0x2A400, 16)];
    let result = session
        .capture_at_breakpoint("bp", BREAKPOINT, &regions, false, false)
        .unwrap();
    assert_eq!(result.buffer("state").unwrap(), &[7u8; 16][..]);
    assert!(result.registers().is_none());
    assert!(session.debug().confirmed_stop().is_some());
    assert_eq!(session.debug().active_breakpoints().count(), 0);

    // Still halted, so a further read needs no interrupt
    let again = session.capture_now("again", &[], true, false).unwrap();
    assert_eq!(again.registers().unwrap().eip, BREAKPOINT);

    let (_, debug) = session.into_channels();
    debug.close();
    assert_eq!(stub.join().interrupts, 0);
}

#[test]
fn test_screenshot_is_taken_while_halted() {
    let dir = scratch_dir("screenshot");
    let mut rig = Rig::new(MonitorScript::new(), StubScript::new(), capture_config(&dir));

    let mut scenario = Scenario::new("shot");
    scenario.screenshot = true;
    scenario.regions.clear();
    let result = rig.session.run_scenario(&scenario).unwrap();

    let path = result.screenshot().unwrap().to_path_buf();
    assert!(path.ends_with("shot_screenshot.ppm"));
    assert!(std::fs::read(&path).unwrap().starts_with(b"P6"));

    let (monitor, _) = rig.finish();
    assert_eq!(monitor.executed(), vec!["qmp_capabilities", "screendump"]);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_scenario_needing_control_without_one_fails_early() {
    let stub = FakeStub::spawn(StubScript::new()).unwrap();
    let mut session = CaptureSession::debug_only(debug_channel(&stub), CaptureConfig::default());

    let mut scenario = Scenario::new("keys");
    scenario.keys = vec!["ret".to_string()];
    let err = session.run_scenario(&scenario).unwrap_err();
    assert!(matches!(err.cause, CaptureCause::NoControlChannel));
    assert_eq!(err.step, CaptureStep::InjectKeys);

    let (_, debug) = session.into_channels();
    debug.close();
    assert!(stub.join().commands.is_empty());
}

#[test]
fn test_run_all_continues_past_command_errors() {
    let dir = scratch_dir("run_all");
    let mut rig = Rig::new(
        MonitorScript::new().snapshot("game_start"),
        StubScript::new().fill(0xA0000, &frame()),
        capture_config(&dir),
    );

    let mut missing = Scenario::new("missing");
    missing.snapshot = Some("no_such_snapshot".to_string());
    let mut idle = Scenario::new("idle");
    idle.snapshot = Some("game_start".to_string());

    let report = rig.session.run_all(&[missing, idle]);
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.succeeded(), 1);
    assert!(!report.aborted);
    assert!(!report.all_passed());

    let failure = report.outcomes[0].result.as_ref().unwrap_err();
    assert_eq!(failure.step, CaptureStep::LoadSnapshot);
    let idle = report.outcomes[1].result.as_ref().unwrap();
    assert_eq!(idle.buffer("framebuffer").unwrap(), frame().as_slice());

    rig.finish();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_run_all_aborts_when_channel_is_lost() {
    let dir = scratch_dir("abort");
    let mut config = capture_config(&dir);
    config.stop_timeout_ms = 200;
    let mut rig = Rig::new(MonitorScript::new(), StubScript::new().silent(), config);

    // The first capture uses the stop from attaching; the second has to
    // interrupt a stub that never answers
    let report = rig.session.run_all(&[
        Scenario::new("first"),
        Scenario::new("second"),
        Scenario::new("third"),
    ]);
    assert!(report.aborted);
    assert_eq!(report.outcomes.len(), 2);
    assert!(report.outcomes[0].result.is_ok());
    assert_eq!(report.outcomes[1].name, "second");
    let err = report.outcomes[1].result.as_ref().unwrap_err();
    assert!(matches!(&err.cause, CaptureCause::Channel(e) if e.kind() == ErrorKind::Timeout));
    assert_eq!(err.step, CaptureStep::WaitForStop);

    rig.finish();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_recorded_capture_verifies_against_itself() {
    let dir = scratch_dir("golden");
    let mut rig = Rig::new(
        MonitorScript::new().snapshot("game_start"),
        StubScript::new().fill(0xA0000, &frame()),
        capture_config(&dir),
    );
    let mut scenario = game_start();
    scenario.wait_ms = Some(0);
    let result = rig.session.run_scenario(&scenario).unwrap();
    rig.finish();

    let store = GoldenStore::new(dir.join("golden"));
    store.record(&result).unwrap();
    let report = store.verify(&result).unwrap();
    assert!(report.passed());

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_zero_wait_is_honored() {
    let dir = scratch_dir("timing");
    let mut config = capture_config(&dir);
    config.wait_ms = 10_000;
    let mut rig = Rig::new(MonitorScript::new(), StubScript::new(), config);

    let mut scenario = Scenario::new("quick");
    scenario.wait_ms = Some(0);
    scenario.regions.clear();
    let started = std::time::Instant::now();
    rig.session.run_scenario(&scenario).unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    rig.finish();
    let _ = std::fs::remove_dir_all(&dir);
}
