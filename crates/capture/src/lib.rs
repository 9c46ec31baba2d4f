//! Capture orchestration over a VM's control and debug channels.
//!
//! A capture halts the guest (at a breakpoint or by interrupt), reads
//! registers and memory regions while the halt is confirmed, optionally
//! takes a screenshot, and resumes. Scenarios add snapshot restore and key
//! injection in front of that.

pub mod error;
pub mod scenario;
pub mod session;

pub use error::{CaptureCause, CaptureError, CaptureStep};
pub use scenario::{load_scenarios, parse_scenarios, Scenario, ScenarioError, Timing};
pub use session::{CaptureSession, RunReport, ScenarioOutcome};
