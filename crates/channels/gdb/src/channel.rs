use crate::command::{DebugCommand, Reply};
use crate::packet::{self, ACK, INTERRUPT, NAK, PACKET_END, PACKET_START};
use crate::registers::decode_registers;
use probe_core::logging::{log, LogCategory, LogLevel};
use probe_core::{ChannelError, Deadline, DebugConfig, Link, RegisterSet, Result, StopReason, Transport};
use std::collections::BTreeSet;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Largest reply accepted before the frame is declared malformed.
/// A 4096-byte chunk is 8192 hex characters; `g` on i386 is under 1 KB.
const MAX_FRAME_LEN: usize = 1 << 20;

/// Client for a GDB remote serial protocol stub.
///
/// Acknowledgment is strict: after every frame sent the next inbound byte
/// must be `+`, and every frame received is acknowledged before anything
/// else is written. Any deviation is a protocol fault and the channel stays
/// unusable until reconnected.
pub struct DebugChannel {
    link: Link,
    read_timeout: Duration,
    chunk_size: usize,
    breakpoints: BTreeSet<u32>,
    confirmed_stop: Option<StopReason>,
}

impl DebugChannel {
    pub fn connect(config: &DebugConfig) -> Result<Self> {
        Self::connect_tcp(&config.address(), config)
    }

    pub fn connect_tcp(address: &str, config: &DebugConfig) -> Result<Self> {
        let addrs = address
            .to_socket_addrs()
            .map_err(|e| ChannelError::connection(address, e))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, config.connect_timeout()) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    log(LogCategory::Debug, LogLevel::Info, || {
                        format!("connected to {}", address)
                    });
                    return Ok(Self::with_transport(Box::new(stream), address, config));
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(ChannelError::connection(
            address,
            last_error.map_or_else(|| "no addresses resolved".to_string(), |e| e.to_string()),
        ))
    }

    pub fn with_transport(
        transport: Box<dyn Transport>,
        endpoint: impl Into<String>,
        config: &DebugConfig,
    ) -> Self {
        Self {
            link: Link::new(transport, endpoint).with_write_timeout(config.read_timeout()),
            read_timeout: config.read_timeout(),
            chunk_size: config.chunk_size.max(1),
            breakpoints: BTreeSet::new(),
            confirmed_stop: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.link.endpoint()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The stop notification received since the guest was last resumed, if
    /// any. `None` means the guest may be running.
    pub fn confirmed_stop(&self) -> Option<&StopReason> {
        self.confirmed_stop.as_ref()
    }

    pub fn active_breakpoints(&self) -> impl Iterator<Item = u32> + '_ {
        self.breakpoints.iter().copied()
    }

    pub fn is_usable(&self) -> bool {
        !self.link.is_poisoned()
    }

    /// Read `length` bytes at linear `address`, one packet per chunk.
    pub fn read_memory(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        if address as u64 + length as u64 > 1 << 32 {
            return Err(ChannelError::invalid_argument(
                "read memory",
                format!("range {:#x}+{:#x} leaves the 32-bit space", address, length),
            ));
        }

        let mut data = Vec::with_capacity(length);
        let mut offset = 0usize;
        while offset < length {
            let count = self.chunk_size.min(length - offset);
            let chunk_address = address.wrapping_add(offset as u32);

            let command = DebugCommand::ReadMemory {
                address: chunk_address,
                length: count,
            };
            let reply = self.transact(&command)?;
            match Reply::parse_data(&reply) {
                Reply::Data(hex) => {
                    let bytes = self.decode_hex(&command, &hex)?;
                    if bytes.len() != count {
                        return self.fault(
                            &command,
                            format!("asked for {} bytes, got {}", count, bytes.len()),
                            reply,
                        );
                    }
                    data.extend_from_slice(&bytes);
                }
                Reply::Error(_) => {
                    log(LogCategory::Debug, LogLevel::Warn, || {
                        format!("memory read error at {:#x}: {}", chunk_address, reply)
                    });
                    return Err(ChannelError::MemoryAccess {
                        address: chunk_address,
                        reply,
                    });
                }
                _ => {
                    return Err(ChannelError::command(
                        command.operation(),
                        Some(chunk_address),
                        reply,
                    ))
                }
            }
            offset += count;
        }

        log(LogCategory::Debug, LogLevel::Debug, || {
            format!(
                "read {:#x}+{:#x} in {} packet(s)",
                address,
                length,
                length.div_ceil(self.chunk_size)
            )
        });
        Ok(data)
    }

    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.expect_ok(&DebugCommand::WriteMemory {
            address,
            data: data.to_vec(),
        })
    }

    pub fn read_registers(&mut self) -> Result<RegisterSet> {
        let command = DebugCommand::ReadRegisters;
        let reply = self.transact(&command)?;
        match Reply::parse_data(&reply) {
            Reply::Data(hex) => {
                let blob = self.decode_hex(&command, &hex)?;
                match decode_registers(&blob) {
                    Some(registers) => Ok(registers),
                    None => self.fault(
                        &command,
                        format!("register blob is {} bytes, need at least 64", blob.len()),
                        reply,
                    ),
                }
            }
            _ => Err(ChannelError::command(command.operation(), None, reply)),
        }
    }

    pub fn set_breakpoint(&mut self, address: u32) -> Result<()> {
        self.expect_ok(&DebugCommand::InsertBreakpoint { address })?;
        self.breakpoints.insert(address);
        log(LogCategory::Debug, LogLevel::Info, || {
            format!("breakpoint set at {:#x}", address)
        });
        Ok(())
    }

    /// Remove a breakpoint this channel inserted. Removing one that was
    /// never inserted (or already removed) is a no-op.
    pub fn remove_breakpoint(&mut self, address: u32) -> Result<()> {
        if !self.breakpoints.contains(&address) {
            log(LogCategory::Debug, LogLevel::Debug, || {
                format!("no breakpoint at {:#x} to remove", address)
            });
            return Ok(());
        }
        self.expect_ok(&DebugCommand::RemoveBreakpoint { address })?;
        self.breakpoints.remove(&address);
        log(LogCategory::Debug, LogLevel::Info, || {
            format!("breakpoint removed at {:#x}", address)
        });
        Ok(())
    }

    /// Resume the guest. Returns once the stub has acknowledged the command;
    /// the stop notification, if any, is collected by [`wait_for_stop`].
    ///
    /// [`wait_for_stop`]: DebugChannel::wait_for_stop
    pub fn continue_execution(&mut self) -> Result<()> {
        let command = DebugCommand::Continue;
        self.link.check(command.operation())?;
        self.confirmed_stop = None;
        let deadline = Deadline::after(self.read_timeout);
        let result = self
            .send_frame(command.operation(), &command.payload())
            .and_then(|_| self.expect_ack(command.operation(), &deadline));
        self.link.guard(result)
    }

    /// Ask the guest to halt at its next instruction boundary.
    /// Asynchronous: follow with [`wait_for_stop`](DebugChannel::wait_for_stop).
    pub fn stop(&mut self) -> Result<()> {
        self.link.check("interrupt")?;
        let result = self.link.send("interrupt", &[INTERRUPT]);
        self.link.guard(result)
    }

    /// Block until the next stop notification or `timeout`.
    ///
    /// This is the only proof that the guest has halted. A timeout leaves
    /// the stub mid-exchange, so the channel is unusable afterwards.
    pub fn wait_for_stop(&mut self, timeout: Duration) -> Result<StopReason> {
        let operation = "wait for stop";
        self.link.check(operation)?;
        let deadline = Deadline::after(timeout);
        let result = self.read_frame(operation, &deadline);
        let payload = self.link.guard(result)?;
        self.accept_stop(operation, payload)
    }

    /// Execute one instruction and return the resulting stop.
    pub fn step(&mut self) -> Result<StopReason> {
        self.confirmed_stop = None;
        let payload = self.transact(&DebugCommand::Step)?;
        self.accept_stop("step", payload)
    }

    /// Ask the stub why the guest last stopped (`?`).
    ///
    /// An all-stop stub halts the guest when a debugger attaches and only
    /// answers packets while halted, so a reply here confirms the stop. Send
    /// this first after connecting.
    pub fn halt_reason(&mut self) -> Result<StopReason> {
        let payload = self.transact(&DebugCommand::HaltReason)?;
        self.accept_stop("query halt reason", payload)
    }

    pub fn close(mut self) {
        self.link.shutdown();
    }

    fn accept_stop(&mut self, operation: &str, payload: String) -> Result<StopReason> {
        match Reply::parse_stop(&payload) {
            Reply::Stop(stop) => {
                log(LogCategory::Debug, LogLevel::Info, || {
                    format!("guest stopped: {}", stop)
                });
                if stop.is_halt() {
                    self.confirmed_stop = Some(stop.clone());
                }
                Ok(stop)
            }
            Reply::Error(_) => Err(ChannelError::command(operation, None, payload)),
            _ => {
                let err =
                    ChannelError::protocol(operation, "expected a stop notification", payload);
                self.link.guard(Err(err))
            }
        }
    }

    fn expect_ok(&mut self, command: &DebugCommand) -> Result<()> {
        let reply = self.transact(command)?;
        if reply == "OK" {
            Ok(())
        } else {
            Err(ChannelError::command(
                command.operation(),
                command.address(),
                reply,
            ))
        }
    }

    /// One request/response exchange: frame out, ack in, frame in, ack out.
    fn transact(&mut self, command: &DebugCommand) -> Result<String> {
        let operation = command.operation();
        self.link.check(operation)?;
        let deadline = Deadline::after(self.read_timeout);
        let payload = command.payload();
        let result = self
            .send_frame(operation, &payload)
            .and_then(|_| self.expect_ack(operation, &deadline))
            .and_then(|_| self.read_frame(operation, &deadline));
        self.link.guard(result)
    }

    fn send_frame(&mut self, operation: &str, payload: &str) -> Result<()> {
        if self.link.buffered() > 0 {
            // Bytes nobody asked for: an unsolicited stop or a late reply
            let stray = self.link.drain_buffered();
            return Err(ChannelError::protocol(
                operation,
                "unexpected bytes pending before command; channel desynchronized",
                String::from_utf8_lossy(&stray).into_owned(),
            ));
        }
        log(LogCategory::Packets, LogLevel::Trace, || {
            format!("-> ${}", truncate(payload))
        });
        self.link.send(operation, &packet::encode(payload))
    }

    fn expect_ack(&mut self, operation: &str, deadline: &Deadline) -> Result<()> {
        match self.link.read_byte(operation, deadline)? {
            ACK => Ok(()),
            NAK => Err(ChannelError::protocol(
                operation,
                "stub rejected the frame (NAK)",
                "-",
            )),
            other => Err(ChannelError::protocol(
                operation,
                "expected '+' acknowledgment",
                String::from_utf8_lossy(&[other]).into_owned(),
            )),
        }
    }

    fn read_frame(&mut self, operation: &str, deadline: &Deadline) -> Result<String> {
        let first = self.link.read_byte(operation, deadline)?;
        if first != PACKET_START {
            return Err(ChannelError::protocol(
                operation,
                "expected '$' frame start",
                String::from_utf8_lossy(&[first]).into_owned(),
            ));
        }

        let mut body = Vec::new();
        loop {
            let byte = self.link.read_byte(operation, deadline)?;
            if byte == PACKET_END {
                break;
            }
            if body.len() >= MAX_FRAME_LEN {
                return Err(ChannelError::protocol(
                    operation,
                    "frame exceeds maximum length",
                    String::from_utf8_lossy(&body[..64]).into_owned(),
                ));
            }
            body.push(byte);
        }
        let field = [
            self.link.read_byte(operation, deadline)?,
            self.link.read_byte(operation, deadline)?,
        ];

        let payload = packet::verify(&body, field).map_err(|e| {
            let raw = format!(
                "${}#{}",
                String::from_utf8_lossy(&body),
                String::from_utf8_lossy(&field)
            );
            ChannelError::protocol(operation, e.to_string(), raw)
        })?;
        self.link.send(operation, &[ACK])?;

        log(LogCategory::Packets, LogLevel::Trace, || {
            format!("<- ${}", truncate(&payload))
        });
        Ok(payload)
    }

    fn decode_hex(&mut self, command: &DebugCommand, hex: &str) -> Result<Vec<u8>> {
        match hex::decode(hex) {
            Ok(bytes) => Ok(bytes),
            Err(e) => self.fault(command, format!("reply is not hex data: {}", e), hex.to_string()),
        }
    }

    /// Report a malformed reply and poison the channel.
    fn fault<T>(&mut self, command: &DebugCommand, detail: impl Into<String>, raw: String) -> Result<T> {
        let err = ChannelError::protocol(command.operation(), detail, raw);
        self.link.guard(Err(err))
    }
}

fn truncate(payload: &str) -> &str {
    match payload.char_indices().nth(80) {
        Some((idx, _)) => &payload[..idx],
        None => payload,
    }
}
