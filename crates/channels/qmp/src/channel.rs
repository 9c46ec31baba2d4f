use crate::keys::{self, KeyChord};
use crate::message::{self, ControlCommand, Event, Greeting, Incoming, KeyValue, RunState};
use probe_core::logging::{log, LogCategory, LogLevel};
use probe_core::{ChannelError, ControlConfig, Deadline, Link, Result, Transport};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Longest line accepted from the monitor
const MAX_LINE: usize = 8 << 20;

/// Client for a QEMU Machine Protocol socket.
///
/// One command is in flight at a time. Events that arrive while waiting for
/// a reply are queued and can be drained with [`take_events`].
///
/// [`take_events`]: ControlChannel::take_events
pub struct ControlChannel {
    link: Link,
    greeting: Greeting,
    reply_timeout: Duration,
    next_id: u64,
    events: VecDeque<Event>,
    event_backlog: usize,
    dropped_events: usize,
}

impl ControlChannel {
    /// Connect over TCP when `tcp_address` is set, else over the Unix socket.
    pub fn connect(config: &ControlConfig) -> Result<Self> {
        match &config.tcp_address {
            Some(address) => Self::connect_tcp(address, config),
            None => Self::connect_unix(&config.socket_path, config),
        }
    }

    #[cfg(unix)]
    pub fn connect_unix(path: &Path, config: &ControlConfig) -> Result<Self> {
        let endpoint = path.display().to_string();
        let stream = std::os::unix::net::UnixStream::connect(path)
            .map_err(|e| ChannelError::connection(endpoint.as_str(), e))?;
        Self::with_transport(Box::new(stream), endpoint, config)
    }

    #[cfg(not(unix))]
    pub fn connect_unix(path: &Path, _config: &ControlConfig) -> Result<Self> {
        Err(ChannelError::connection(
            path.display().to_string(),
            "unix sockets are not available on this platform; set control.tcp_address",
        ))
    }

    pub fn connect_tcp(address: &str, config: &ControlConfig) -> Result<Self> {
        let addrs = address
            .to_socket_addrs()
            .map_err(|e| ChannelError::connection(address, e))?;
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, config.handshake_timeout()) {
                Ok(stream) => return Self::with_transport(Box::new(stream), address, config),
                Err(e) => last_error = Some(e),
            }
        }
        Err(ChannelError::connection(
            address,
            last_error.map_or_else(|| "no addresses resolved".to_string(), |e| e.to_string()),
        ))
    }

    /// Take over an open stream and perform the greeting/capabilities
    /// handshake on it.
    pub fn with_transport(
        transport: Box<dyn Transport>,
        endpoint: impl Into<String>,
        config: &ControlConfig,
    ) -> Result<Self> {
        let mut link = Link::new(transport, endpoint).with_write_timeout(config.reply_timeout());
        let endpoint = link.endpoint().to_string();
        let deadline = Deadline::after(config.handshake_timeout());

        let greeting = match read_greeting(&mut link, &deadline) {
            Ok(greeting) => greeting,
            Err(e) => {
                link.shutdown();
                return Err(ChannelError::connection(endpoint, format!("handshake: {}", e)));
            }
        };

        let mut channel = Self {
            link,
            greeting,
            reply_timeout: config.reply_timeout(),
            next_id: 0,
            events: VecDeque::new(),
            event_backlog: config.event_backlog,
            dropped_events: 0,
        };

        let request = command_value(&ControlCommand::Capabilities)?;
        if let Err(e) = channel.round_trip("qmp_capabilities", request, &deadline) {
            channel.link.shutdown();
            return Err(ChannelError::connection(endpoint, format!("handshake: {}", e)));
        }

        log(LogCategory::Control, LogLevel::Info, || {
            format!(
                "connected to {} (QEMU {})",
                endpoint,
                channel
                    .greeting
                    .qemu_version()
                    .unwrap_or_else(|| "unknown".to_string())
            )
        });
        Ok(channel)
    }

    pub fn endpoint(&self) -> &str {
        self.link.endpoint()
    }

    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    pub fn is_usable(&self) -> bool {
        !self.link.is_poisoned()
    }

    /// Send one command and wait for its reply. Returns the `return` value.
    pub fn execute(&mut self, command: &ControlCommand) -> Result<Value> {
        let request = command_value(command)?;
        let deadline = Deadline::after(self.reply_timeout);
        self.round_trip(command.name(), request, &deadline)
    }

    /// Send a command this client has no typed form for.
    pub fn execute_raw(&mut self, name: &str, arguments: Option<Value>) -> Result<Value> {
        if name.is_empty() {
            return Err(ChannelError::invalid_argument("execute", "empty command name"));
        }
        let request = match arguments {
            Some(arguments) => json!({ "execute": name, "arguments": arguments }),
            None => json!({ "execute": name }),
        };
        let deadline = Deadline::after(self.reply_timeout);
        self.round_trip(name, request, &deadline)
    }

    /// Events received so far, oldest first.
    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// Number of events discarded because the queue was full
    pub fn dropped_events(&self) -> usize {
        self.dropped_events
    }

    /// Press and release one key. `key` is a qcode (`right`, `ret`, `a`) or
    /// one of the aliases `space`, `enter`, `escape`.
    pub fn send_key(&mut self, key: &str, hold: Duration) -> Result<()> {
        self.send_chord(&[keys::qcode(key)], hold)
    }

    /// Send each key in turn, pausing `delay` after every key.
    pub fn send_keys<S: AsRef<str>>(
        &mut self,
        keys: &[S],
        hold: Duration,
        delay: Duration,
    ) -> Result<()> {
        for key in keys {
            self.send_key(key.as_ref(), hold)?;
            thread::sleep(delay);
        }
        log(LogCategory::Control, LogLevel::Debug, || {
            format!("sent {} key(s)", keys.len())
        });
        Ok(())
    }

    /// Type ASCII text, using shift chords for capitals and symbols.
    /// Nothing is sent if any character has no key.
    pub fn type_text(&mut self, text: &str, hold: Duration, delay: Duration) -> Result<()> {
        let chords = keys::text_to_chords(text).map_err(|c| {
            ChannelError::invalid_argument("type text", format!("no key for {:?}", c))
        })?;
        for chord in &chords {
            self.send_key_chord(chord, hold)?;
            thread::sleep(delay);
        }
        Ok(())
    }

    pub fn save_snapshot(&mut self, name: &str) -> Result<()> {
        self.snapshot_command("save snapshot", "savevm", name)
    }

    pub fn load_snapshot(&mut self, name: &str) -> Result<()> {
        self.snapshot_command("load snapshot", "loadvm", name)
    }

    /// Run a human-monitor command line and return its text output.
    pub fn human_monitor(&mut self, command_line: &str) -> Result<String> {
        let reply = self.execute(&ControlCommand::HumanMonitorCommand {
            command_line: command_line.to_string(),
        })?;
        Ok(reply.as_str().unwrap_or_default().to_string())
    }

    /// Write a screenshot (PPM) to `path` on the VM host.
    pub fn screendump(&mut self, path: &Path) -> Result<()> {
        self.execute(&ControlCommand::Screendump {
            filename: path.to_string_lossy().into_owned(),
        })?;
        Ok(())
    }

    /// Have the VM host write `size` bytes of guest physical memory to `path`.
    pub fn dump_physical_memory(&mut self, address: u64, size: u64, path: &Path) -> Result<()> {
        self.execute(&ControlCommand::Pmemsave {
            val: address,
            size,
            filename: path.to_string_lossy().into_owned(),
        })?;
        Ok(())
    }

    pub fn query_status(&mut self) -> Result<RunState> {
        let reply = self.execute(&ControlCommand::QueryStatus)?;
        serde_json::from_value(reply.clone()).map_err(|e| {
            let err = ChannelError::protocol("query-status", e.to_string(), reply.to_string());
            self.link.poison(err.to_string());
            err
        })
    }

    /// Ask QEMU to exit. The connection is closed afterwards.
    pub fn quit(mut self) -> Result<()> {
        let result = self.execute(&ControlCommand::Quit).map(|_| ());
        self.link.shutdown();
        result
    }

    pub fn close(mut self) {
        self.link.shutdown();
    }

    fn send_key_chord(&mut self, chord: &KeyChord, hold: Duration) -> Result<()> {
        self.send_chord(&chord.qcodes(), hold)
    }

    fn send_chord(&mut self, qcodes: &[&str], hold: Duration) -> Result<()> {
        if qcodes.iter().any(|k| k.is_empty()) {
            return Err(ChannelError::invalid_argument("send-key", "empty key name"));
        }
        let hold_ms = u32::try_from(hold.as_millis()).unwrap_or(u32::MAX);
        self.execute(&ControlCommand::SendKey {
            keys: qcodes
                .iter()
                .map(|k| KeyValue::Qcode(k.to_string()))
                .collect(),
            hold_time: Some(hold_ms),
        })?;
        Ok(())
    }

    fn snapshot_command(&mut self, operation: &str, verb: &str, name: &str) -> Result<()> {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(ChannelError::invalid_argument(
                operation,
                format!("snapshot name {:?} must be a single non-empty word", name),
            ));
        }
        let output = self.human_monitor(&format!("{} {}", verb, name))?;
        // HMP reports failures as text with a successful QMP return
        let output = output.trim();
        if !output.is_empty() {
            return Err(ChannelError::command(operation, None, output));
        }
        log(LogCategory::Control, LogLevel::Info, || {
            format!("{} {:?}", operation, name)
        });
        Ok(())
    }

    fn round_trip(&mut self, operation: &str, mut request: Value, deadline: &Deadline) -> Result<Value> {
        self.link.check(operation)?;

        let id = self.next_id;
        self.next_id += 1;
        if let Value::Object(object) = &mut request {
            object.insert("id".to_string(), json!(id));
        }

        let mut line = request.to_string().into_bytes();
        log(LogCategory::Control, LogLevel::Trace, || {
            format!("-> {}", String::from_utf8_lossy(&line))
        });
        line.push(b'\n');

        let result = self
            .link
            .send(operation, &line)
            .and_then(|_| self.await_reply(operation, id, deadline));
        self.link.guard(result)
    }

    fn await_reply(&mut self, operation: &str, id: u64, deadline: &Deadline) -> Result<Value> {
        loop {
            let line = self.link.read_line(operation, deadline, MAX_LINE)?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            log(LogCategory::Control, LogLevel::Trace, || {
                format!("<- {}", String::from_utf8_lossy(&line))
            });

            let raw = || String::from_utf8_lossy(&line).into_owned();
            match message::classify(&line) {
                Ok(Incoming::Event(event)) => self.queue_event(event),
                Ok(Incoming::Notification(_)) => {
                    log(LogCategory::Control, LogLevel::Debug, || {
                        format!("skipping notification {}", String::from_utf8_lossy(&line))
                    });
                }
                Ok(Incoming::Return { id: echoed, value }) => {
                    check_id(operation, id, echoed.as_ref(), raw)?;
                    return Ok(value);
                }
                Ok(Incoming::Error {
                    id: echoed,
                    class,
                    desc,
                }) => {
                    check_id(operation, id, echoed.as_ref(), raw)?;
                    log(LogCategory::Control, LogLevel::Warn, || {
                        format!("{} failed: {}: {}", operation, class, desc)
                    });
                    return Err(ChannelError::command(
                        operation,
                        None,
                        format!("{}: {}", class, desc),
                    ));
                }
                Ok(Incoming::Greeting(_)) => {
                    return Err(ChannelError::protocol(
                        operation,
                        "unexpected greeting while awaiting reply",
                        raw(),
                    ))
                }
                Err(detail) => return Err(ChannelError::protocol(operation, detail, raw())),
            }
        }
    }

    fn queue_event(&mut self, event: Event) {
        log(LogCategory::Control, LogLevel::Debug, || {
            format!("event {}", event.event)
        });
        if self.event_backlog == 0 {
            self.dropped_events += 1;
            return;
        }
        if self.events.len() >= self.event_backlog {
            self.events.pop_front();
            self.dropped_events += 1;
        }
        self.events.push_back(event);
    }
}

fn read_greeting(link: &mut Link, deadline: &Deadline) -> Result<Greeting> {
    let line = link.read_line("greeting", deadline, MAX_LINE)?;
    match message::classify(&line) {
        Ok(Incoming::Greeting(greeting)) => Ok(greeting),
        Ok(_) => Err(ChannelError::protocol(
            "greeting",
            "first message is not a QMP greeting",
            String::from_utf8_lossy(&line).into_owned(),
        )),
        Err(detail) => Err(ChannelError::protocol(
            "greeting",
            detail,
            String::from_utf8_lossy(&line).into_owned(),
        )),
    }
}

fn command_value(command: &ControlCommand) -> Result<Value> {
    serde_json::to_value(command)
        .map_err(|e| ChannelError::invalid_argument(command.name(), e.to_string()))
}

/// A reply without an id belongs to the single command in flight.
fn check_id(
    operation: &str,
    expected: u64,
    echoed: Option<&Value>,
    raw: impl FnOnce() -> String,
) -> Result<()> {
    match echoed {
        None => Ok(()),
        Some(value) if value.as_u64() == Some(expected) => Ok(()),
        Some(value) => Err(ChannelError::protocol(
            operation,
            format!("reply id {} does not match request id {} (stale reply)", value, expected),
            raw(),
        )),
    }
}
