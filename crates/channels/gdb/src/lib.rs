//! Client for a VM's GDB remote serial protocol stub.
//!
//! Covers what a state capture needs from an i386 guest: chunked memory
//! reads, the general register file, software breakpoints, resume, single
//! step and asynchronous interrupt with a deadline-bounded wait for the
//! resulting stop.

pub mod channel;
pub mod command;
pub mod packet;
pub mod registers;

#[cfg(feature = "fake")]
pub mod fake;

pub use channel::DebugChannel;
pub use command::{DebugCommand, Reply};
pub use registers::{decode_registers, encode_registers, REGISTER_BLOB_LEN};
