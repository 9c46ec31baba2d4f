//! QEMU Machine Protocol client.
//!
//! Drives the VM from outside the guest: keystrokes, snapshot save/load,
//! screendumps and physical-memory dumps. Commands are correlated with their
//! replies by id; asynchronous events are queued rather than discarded.

pub mod channel;
pub mod keys;
pub mod message;

#[cfg(feature = "fake")]
pub mod fake;

pub use channel::ControlChannel;
pub use message::{ControlCommand, Event, Greeting, KeyValue, RunState};
