use probe_core::{CaptureResult, ChannelError, StopReason};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The step of a capture sequence that was executing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureStep {
    LoadSnapshot,
    InjectKeys,
    SetBreakpoint,
    Resume,
    Halt,
    WaitForStop,
    ReadRegisters,
    ReadMemory,
    Screenshot,
    RemoveBreakpoint,
}

impl fmt::Display for CaptureStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureStep::LoadSnapshot => "load snapshot",
            CaptureStep::InjectKeys => "inject keys",
            CaptureStep::SetBreakpoint => "set breakpoint",
            CaptureStep::Resume => "resume",
            CaptureStep::Halt => "halt",
            CaptureStep::WaitForStop => "wait for stop",
            CaptureStep::ReadRegisters => "read registers",
            CaptureStep::ReadMemory => "read memory",
            CaptureStep::Screenshot => "screenshot",
            CaptureStep::RemoveBreakpoint => "remove breakpoint",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum CaptureCause {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("breakpoint at {address:#x} never hit within {waited:?}")]
    BreakpointNeverHit { address: u32, waited: Duration },

    #[error("guest is not halted: no confirmed stop on the debug channel")]
    NotHalted,

    #[error("guest did not halt: {0}")]
    UnexpectedStop(StopReason),

    #[error("scenario needs the control channel but none is connected")]
    NoControlChannel,

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CaptureCause {
    /// Whether both channels can still be used for another scenario.
    pub fn is_recoverable(&self) -> bool {
        match self {
            CaptureCause::Channel(e) => e.is_recoverable(),
            CaptureCause::NotHalted | CaptureCause::NoControlChannel | CaptureCause::Io { .. } => {
                true
            }
            CaptureCause::BreakpointNeverHit { .. } | CaptureCause::UnexpectedStop(_) => false,
        }
    }
}

/// A failed capture. `partial` holds everything captured before the failure.
#[derive(Debug, Error)]
#[error("scenario {scenario:?} failed at {step}: {cause}")]
pub struct CaptureError {
    pub scenario: String,
    pub step: CaptureStep,
    #[source]
    pub cause: CaptureCause,
    pub partial: CaptureResult,
}

impl CaptureError {
    pub fn is_recoverable(&self) -> bool {
        self.cause.is_recoverable()
    }
}
