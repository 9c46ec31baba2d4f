//! In-process debug stub for tests.
//!
//! Listens on a loopback TCP port, serves one client, and records what it
//! saw. Memory is a flat physical image starting at address 0.

use crate::packet::{self, ACK, INTERRUPT, NAK, PACKET_END, PACKET_START};
use crate::registers::encode_registers;
use probe_core::RegisterSet;
use std::collections::BTreeSet;
use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How the stub behaves.
#[derive(Debug, Clone)]
pub struct StubScript {
    memory: Vec<u8>,
    registers: RegisterSet,
    error_at: Option<u32>,
    replies: Vec<(String, String)>,
    corrupt_replies: bool,
    silent: bool,
    hit_delay: Duration,
    idle_timeout: Duration,
}

impl Default for StubScript {
    fn default() -> Self {
        Self {
            memory: vec![0; 0x11_0000],
            registers: RegisterSet {
                eip: 0x0100,
                esp: 0xFFFE,
                eflags: 0x0202,
                cs: 0x1000,
                ss: 0x1000,
                ds: 0x1000,
                es: 0x1000,
                ..Default::default()
            },
            error_at: None,
            replies: Vec::new(),
            corrupt_replies: false,
            silent: false,
            hit_delay: Duration::from_millis(20),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl StubScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes` at `address`, growing the image if needed.
    pub fn fill(mut self, address: u32, bytes: &[u8]) -> Self {
        let start = address as usize;
        let end = start + bytes.len();
        if self.memory.len() < end {
            self.memory.resize(end, 0);
        }
        self.memory[start..end].copy_from_slice(bytes);
        self
    }

    pub fn registers(mut self, registers: RegisterSet) -> Self {
        self.registers = registers;
        self
    }

    /// Any `m` request covering `address` is answered with `E14`.
    pub fn memory_error_at(mut self, address: u32) -> Self {
        self.error_at = Some(address);
        self
    }

    /// Answer any command starting with `prefix` with `reply` verbatim,
    /// ahead of the built-in handling. The first matching prefix wins.
    pub fn reply_to(mut self, prefix: &str, reply: &str) -> Self {
        self.replies.push((prefix.to_string(), reply.to_string()));
        self
    }

    /// Send every reply with a checksum off by one.
    pub fn corrupt_replies(mut self) -> Self {
        self.corrupt_replies = true;
        self
    }

    /// Acknowledge everything but never report a stop.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Time between `c` and the breakpoint hit.
    pub fn hit_delay(mut self, delay: Duration) -> Self {
        self.hit_delay = delay;
        self
    }
}

/// What the stub observed, returned by [`FakeStub::join`].
#[derive(Debug, Clone, Default)]
pub struct StubLog {
    /// Decoded payloads of every frame received, in order
    pub commands: Vec<String>,
    pub interrupts: usize,
    /// Frames received before the previous reply was acknowledged
    pub ack_violations: usize,
    /// Breakpoints still inserted when the client disconnected
    pub breakpoints: Vec<u32>,
}

impl StubLog {
    pub fn count(&self, prefix: &str) -> usize {
        self.commands.iter().filter(|c| c.starts_with(prefix)).count()
    }
}

pub struct FakeStub {
    addr: SocketAddr,
    handle: JoinHandle<StubLog>,
}

impl FakeStub {
    pub fn spawn(script: StubScript) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let handle = thread::Builder::new()
            .name("fake-gdb-stub".to_string())
            .spawn(move || match listener.accept() {
                Ok((stream, _)) => StubSession::new(script).serve(stream),
                Err(_) => StubLog::default(),
            })?;
        Ok(Self { addr, handle })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` form accepted by `DebugChannel::connect_tcp`.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Wait for the client to disconnect and return the log.
    pub fn join(self) -> StubLog {
        self.handle.join().unwrap_or_default()
    }
}

struct StubSession {
    script: StubScript,
    breakpoints: BTreeSet<u32>,
    running: bool,
    awaiting_ack: bool,
    log: StubLog,
}

enum Inbound {
    Frame(String),
    Interrupt,
    Ack,
    Nak,
    Closed,
}

impl StubSession {
    fn new(script: StubScript) -> Self {
        Self {
            script,
            breakpoints: BTreeSet::new(),
            running: false,
            awaiting_ack: false,
            log: StubLog::default(),
        }
    }

    fn serve(mut self, stream: TcpStream) -> StubLog {
        let _ = stream.set_read_timeout(Some(self.script.idle_timeout));
        let mut writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(_) => return self.log,
        };
        let mut reader = BufReader::new(stream);

        loop {
            match next_inbound(&mut reader) {
                Inbound::Closed => break,
                Inbound::Ack => self.awaiting_ack = false,
                Inbound::Nak => self.log.ack_violations += 1,
                Inbound::Interrupt => {
                    self.log.interrupts += 1;
                    if self.running && !self.script.silent {
                        self.running = false;
                        let stop = self.stop_reply(2);
                        if self.reply(&mut writer, &stop).is_err() {
                            break;
                        }
                    }
                }
                Inbound::Frame(payload) => {
                    if self.awaiting_ack {
                        self.log.ack_violations += 1;
                    }
                    if writer.write_all(&[ACK]).is_err() {
                        break;
                    }
                    self.log.commands.push(payload.clone());
                    if self.handle(&mut writer, &payload).is_err() {
                        break;
                    }
                }
            }
        }

        self.log.breakpoints = self.breakpoints.iter().copied().collect();
        self.log
    }

    fn handle(&mut self, writer: &mut TcpStream, payload: &str) -> io::Result<()> {
        let scripted = self
            .script
            .replies
            .iter()
            .find(|(prefix, _)| payload.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone());
        if let Some(reply) = scripted {
            return self.reply(writer, &reply);
        }
        let (kind, args) = payload.split_at(payload.len().min(1));
        let response = match kind {
            "m" => Some(self.read_memory(args)),
            "M" => Some(self.write_memory(args)),
            "g" => Some(hex::encode(&encode_registers(&self.script.registers))),
            "Z" | "z" => Some(self.breakpoint(kind == "Z", args)),
            "?" => Some(self.stop_reply(5)),
            "s" => {
                self.script.registers.eip = self.script.registers.eip.wrapping_add(1);
                Some(self.stop_reply(5))
            }
            "c" => {
                self.running = true;
                if let Some(&address) = self.breakpoints.iter().next() {
                    if !self.script.silent {
                        thread::sleep(self.script.hit_delay);
                        self.running = false;
                        self.script.registers.eip = address;
                        Some(self.stop_reply(5))
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
            _ => Some(String::new()),
        };
        match response {
            Some(reply) => self.reply(writer, &reply),
            None => Ok(()),
        }
    }

    fn read_memory(&self, args: &str) -> String {
        let Some((address, length)) = parse_pair(args) else {
            return "E01".to_string();
        };
        let (start, end) = (address as usize, address as usize + length as usize);
        if let Some(bad) = self.script.error_at {
            if (address..address.saturating_add(length)).contains(&bad) {
                return "E14".to_string();
            }
        }
        match self.script.memory.get(start..end) {
            Some(bytes) => hex::encode(bytes),
            None => "E14".to_string(),
        }
    }

    fn write_memory(&mut self, args: &str) -> String {
        let Some((range, data)) = args.split_once(':') else {
            return "E01".to_string();
        };
        let (Some((address, length)), Some(bytes)) = (parse_pair(range), hex::decode(data).ok()) else {
            return "E01".to_string();
        };
        if bytes.len() != length as usize {
            return "E01".to_string();
        }
        let start = address as usize;
        match self.script.memory.get_mut(start..start + bytes.len()) {
            Some(target) => {
                target.copy_from_slice(&bytes);
                "OK".to_string()
            }
            None => "E14".to_string(),
        }
    }

    fn breakpoint(&mut self, insert: bool, args: &str) -> String {
        let mut fields = args.split(',');
        if fields.next() != Some("0") {
            return String::new();
        }
        let Some(address) = fields.next().and_then(|a| u32::from_str_radix(a, 16).ok()) else {
            return "E01".to_string();
        };
        if insert {
            self.breakpoints.insert(address);
        } else {
            self.breakpoints.remove(&address);
        }
        "OK".to_string()
    }

    fn stop_reply(&self, signal: u8) -> String {
        format!(
            "T{:02x}08:{};",
            signal,
            hex::encode(&self.script.registers.eip.to_le_bytes())
        )
    }

    fn reply(&mut self, writer: &mut TcpStream, payload: &str) -> io::Result<()> {
        let mut frame = packet::encode(payload);
        if self.script.corrupt_replies {
            let len = frame.len();
            let sum = packet::checksum(&frame[1..len - 3]).wrapping_add(1);
            frame.truncate(len - 2);
            frame.extend_from_slice(format!("{:02x}", sum).as_bytes());
        }
        self.awaiting_ack = true;
        writer.write_all(&frame)?;
        writer.flush()
    }
}

fn next_inbound(reader: &mut impl Read) -> Inbound {
    let mut byte = [0u8; 1];
    loop {
        if reader.read_exact(&mut byte).is_err() {
            return Inbound::Closed;
        }
        match byte[0] {
            ACK => return Inbound::Ack,
            NAK => return Inbound::Nak,
            INTERRUPT => return Inbound::Interrupt,
            PACKET_START => break,
            _ => continue,
        }
    }

    let mut body = Vec::new();
    loop {
        if reader.read_exact(&mut byte).is_err() {
            return Inbound::Closed;
        }
        if byte[0] == PACKET_END {
            break;
        }
        body.push(byte[0]);
    }
    let mut field = [0u8; 2];
    if reader.read_exact(&mut field).is_err() {
        return Inbound::Closed;
    }
    match packet::verify(&body, field) {
        Ok(payload) => Inbound::Frame(payload),
        // A real stub would NAK; the client under test never sends bad frames
        Err(_) => Inbound::Nak,
    }
}

fn parse_pair(args: &str) -> Option<(u32, u32)> {
    let (address, length) = args.split_once(',')?;
    Some((
        u32::from_str_radix(address, 16).ok()?,
        u32::from_str_radix(length, 16).ok()?,
    ))
}
