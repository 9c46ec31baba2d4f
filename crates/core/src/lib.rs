//! Shared building blocks for driving a VM over its control and debug
//! channels: the error taxonomy, the deadline-bounded transport, capture
//! value types, configuration, logging and golden-file comparison.

pub mod address;
pub mod config;
pub mod error;
pub mod golden;
pub mod logging;
pub mod transport;
pub mod types;

pub use config::{CaptureConfig, ControlConfig, DebugConfig, HarnessConfig};
pub use error::{ChannelError, ErrorKind, Result};
pub use transport::{Deadline, Link, Transport};
pub use types::{
    CaptureBuilder, CaptureResult, MemoryRegion, NamedRegion, RegisterSet, StopReason,
    REGISTER_NAMES,
};
