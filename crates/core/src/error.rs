//! Error taxonomy shared by both channel clients.
//!
//! Every variant carries the operation that failed and, where the remote side
//! answered, the raw reply text. A failed capture is debugged from these
//! messages alone, so they must never be reduced to a bare status.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a [`ChannelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport unreachable, closed, or handshake malformed
    Connection,
    /// Framing, checksum, acknowledgment or correlation fault
    Protocol,
    /// No reply or stop notification within the deadline
    Timeout,
    /// Well-formed error reply from the remote side
    Command,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Command => "command",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("{operation}: protocol fault: {detail} (raw: {raw:?})")]
    Protocol {
        operation: String,
        detail: String,
        raw: String,
    },

    #[error("{operation}: no reply within {waited:?}")]
    Timeout { operation: String, waited: Duration },

    #[error("{operation}{}: remote error {reply:?}", at_address(.address))]
    Command {
        operation: String,
        address: Option<u32>,
        reply: String,
    },

    #[error("memory access error at {address:#x}: remote error {reply:?}")]
    MemoryAccess { address: u32, reply: String },

    #[error("{operation}: invalid argument: {detail}")]
    InvalidArgument { operation: String, detail: String },
}

fn at_address(address: &Option<u32>) -> String {
    match address {
        Some(address) => format!(" at {:#x}", address),
        None => String::new(),
    }
}

impl ChannelError {
    pub fn connection(endpoint: impl Into<String>, reason: impl fmt::Display) -> Self {
        ChannelError::Connection {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(
        operation: impl Into<String>,
        detail: impl Into<String>,
        raw: impl Into<String>,
    ) -> Self {
        ChannelError::Protocol {
            operation: operation.into(),
            detail: detail.into(),
            raw: raw.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, waited: Duration) -> Self {
        ChannelError::Timeout {
            operation: operation.into(),
            waited,
        }
    }

    pub fn command(
        operation: impl Into<String>,
        address: Option<u32>,
        reply: impl Into<String>,
    ) -> Self {
        ChannelError::Command {
            operation: operation.into(),
            address,
            reply: reply.into(),
        }
    }

    pub fn invalid_argument(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        ChannelError::InvalidArgument {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::Connection { .. } => ErrorKind::Connection,
            ChannelError::Protocol { .. } => ErrorKind::Protocol,
            ChannelError::Timeout { .. } => ErrorKind::Timeout,
            ChannelError::Command { .. }
            | ChannelError::MemoryAccess { .. }
            | ChannelError::InvalidArgument { .. } => ErrorKind::Command,
        }
    }

    /// Whether the channel is still usable after this error.
    ///
    /// Only command-level failures leave the request/response alternation
    /// intact; everything else requires a reconnect.
    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::Command
    }

    /// The guest address involved, if any.
    pub fn address(&self) -> Option<u32> {
        match self {
            ChannelError::Command { address, .. } => *address,
            ChannelError::MemoryAccess { address, .. } => Some(*address),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
