//! Byte transport shared by both channel clients.
//!
//! A [`Link`] owns exactly one stream, buffers inbound bytes, and bounds every
//! blocking read by a [`Deadline`]. The socket read timeout is re-armed with
//! the time remaining before each read, so an operation as a whole never
//! outlives its budget even when the peer trickles bytes. Writes are bounded
//! by a fixed write timeout, re-armed before each send.
//!
//! Once an operation fails with anything other than a command-level error the
//! link is poisoned and refuses further traffic until the owner reconnects.

use crate::error::{ChannelError, Result};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

/// A blocking byte stream with adjustable read and write timeouts.
pub trait Transport: Read + Write + Send {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn shutdown(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

#[cfg(unix)]
impl Transport for std::os::unix::net::UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both)
    }
}

/// Upper bound on one operation, fixed when the operation starts.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.started.elapsed())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

const READ_CHUNK: usize = 4096;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Link {
    transport: Box<dyn Transport>,
    endpoint: String,
    rx: VecDeque<u8>,
    write_timeout: Duration,
    poisoned: Option<String>,
}

impl Link {
    pub fn new(transport: Box<dyn Transport>, endpoint: impl Into<String>) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            rx: VecDeque::new(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            poisoned: None,
        }
    }

    /// Bound each [`send`](Self::send) by `timeout`; zero is raised to 1 ms.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Human-readable peer description (socket path or host:port)
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Number of received bytes not yet consumed
    pub fn buffered(&self) -> usize {
        self.rx.len()
    }

    /// Remove and return everything currently buffered.
    pub fn drain_buffered(&mut self) -> Vec<u8> {
        self.rx.drain(..).collect()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    pub fn poison(&mut self, reason: impl Into<String>) {
        if self.poisoned.is_none() {
            self.poisoned = Some(reason.into());
        }
    }

    /// Fail fast if an earlier fault left the stream in an unknown state.
    pub fn check(&self, operation: &str) -> Result<()> {
        match &self.poisoned {
            Some(reason) => Err(ChannelError::protocol(
                operation,
                format!("channel unusable after earlier fault; reconnect required ({reason})"),
                "",
            )),
            None => Ok(()),
        }
    }

    /// Pass `result` through, poisoning the link on any non-recoverable error.
    pub fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if !err.is_recoverable() {
                self.poison(err.to_string());
            }
        }
        result
    }

    /// Write all of `bytes`; a peer that stops reading yields a timeout.
    pub fn send(&mut self, operation: &str, bytes: &[u8]) -> Result<()> {
        let started = Instant::now();
        let written = self
            .transport
            .set_write_timeout(Some(self.write_timeout))
            .and_then(|_| self.transport.write_all(bytes))
            .and_then(|_| self.transport.flush());
        written.map_err(|e| self.io_error(operation, e, started.elapsed()))
    }

    pub fn read_byte(&mut self, operation: &str, deadline: &Deadline) -> Result<u8> {
        loop {
            if let Some(byte) = self.rx.pop_front() {
                return Ok(byte);
            }
            self.fill(operation, deadline)?;
        }
    }

    /// Read up to and excluding the next `\n`. A trailing `\r` is stripped.
    pub fn read_line(
        &mut self,
        operation: &str,
        deadline: &Deadline,
        max_len: usize,
    ) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let byte = self.read_byte(operation, deadline)?;
            if byte == b'\n' {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(line);
            }
            if line.len() >= max_len {
                return Err(ChannelError::protocol(
                    operation,
                    format!("line exceeds {} bytes without terminator", max_len),
                    String::from_utf8_lossy(&line[..line.len().min(64)]).into_owned(),
                ));
            }
            line.push(byte);
        }
    }

    fn fill(&mut self, operation: &str, deadline: &Deadline) -> Result<()> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return Err(ChannelError::timeout(operation, deadline.elapsed()));
            }
            self.transport
                .set_read_timeout(Some(remaining))
                .map_err(|e| self.io_error(operation, e, deadline.elapsed()))?;
            match self.transport.read(&mut buf) {
                Ok(0) => {
                    return Err(ChannelError::connection(
                        self.endpoint.clone(),
                        format!("{operation}: peer closed the connection"),
                    ))
                }
                Ok(n) => {
                    self.rx.extend(&buf[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(operation, e, deadline.elapsed())),
            }
        }
    }

    fn io_error(&self, operation: &str, err: io::Error, waited: Duration) -> ChannelError {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                ChannelError::timeout(operation, waited)
            }
            _ => ChannelError::connection(self.endpoint.clone(), format!("{operation}: {err}")),
        }
    }

    pub fn shutdown(&mut self) {
        let _ = self.transport.shutdown();
    }
}
