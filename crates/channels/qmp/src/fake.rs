//! In-process QMP monitor for tests.
//!
//! Serves one client on a loopback TCP port: sends a greeting, answers the
//! commands this crate issues, and records what it was asked to do.

use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DEFAULT_GREETING: &str = r#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 2, "major": 8}, "package": ""}, "capabilities": ["oob"]}}"#;

#[derive(Debug, Clone)]
pub struct MonitorScript {
    greeting: String,
    events_per_reply: usize,
    stale_ids: bool,
    omit_ids: bool,
    unresponsive: bool,
    snapshots: BTreeSet<String>,
    failing: Option<String>,
    before_reply: Vec<(String, String)>,
    running: bool,
}

impl Default for MonitorScript {
    fn default() -> Self {
        Self {
            greeting: DEFAULT_GREETING.to_string(),
            events_per_reply: 0,
            stale_ids: false,
            omit_ids: false,
            unresponsive: false,
            snapshots: BTreeSet::new(),
            failing: None,
            before_reply: Vec::new(),
            running: true,
        }
    }
}

impl MonitorScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the greeting line verbatim.
    pub fn greeting(mut self, line: &str) -> Self {
        self.greeting = line.to_string();
        self
    }

    /// Emit this many events before every reply after the handshake.
    pub fn events_per_reply(mut self, count: usize) -> Self {
        self.events_per_reply = count;
        self
    }

    /// Echo a wrong id on every reply after the handshake.
    pub fn stale_ids(mut self) -> Self {
        self.stale_ids = true;
        self
    }

    /// Leave the id out of every reply.
    pub fn omit_ids(mut self) -> Self {
        self.omit_ids = true;
        self
    }

    /// Complete the handshake, then never answer again.
    pub fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }

    /// A snapshot that already exists in the image.
    pub fn snapshot(mut self, name: &str) -> Self {
        self.snapshots.insert(name.to_string());
        self
    }

    /// Send `line` verbatim just before the reply to `command`.
    pub fn line_before(mut self, command: &str, line: &str) -> Self {
        self.before_reply.push((command.to_string(), line.to_string()));
        self
    }

    /// Answer `command` with a `GenericError`.
    pub fn failing(mut self, command: &str) -> Self {
        self.failing = Some(command.to_string());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct MonitorLog {
    /// Every request received, including the handshake
    pub requests: Vec<Value>,
    /// Keys pressed, chords joined with `+`
    pub keys: Vec<String>,
    pub snapshots_saved: Vec<String>,
    pub snapshots_loaded: Vec<String>,
    pub quit: bool,
}

impl MonitorLog {
    pub fn executed(&self) -> Vec<&str> {
        self.requests
            .iter()
            .filter_map(|r| r["execute"].as_str())
            .collect()
    }
}

pub struct FakeMonitor {
    addr: SocketAddr,
    handle: JoinHandle<MonitorLog>,
}

impl FakeMonitor {
    pub fn spawn(script: MonitorScript) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let handle = thread::Builder::new()
            .name("fake-qmp-monitor".to_string())
            .spawn(move || match listener.accept() {
                Ok((stream, _)) => MonitorSession::new(script).serve(stream),
                Err(_) => MonitorLog::default(),
            })?;
        Ok(Self { addr, handle })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Wait for the client to disconnect and return the log.
    pub fn join(self) -> MonitorLog {
        self.handle.join().unwrap_or_default()
    }
}

struct MonitorSession {
    script: MonitorScript,
    negotiated: bool,
    log: MonitorLog,
}

impl MonitorSession {
    fn new(script: MonitorScript) -> Self {
        Self {
            script,
            negotiated: false,
            log: MonitorLog::default(),
        }
    }

    fn serve(mut self, stream: TcpStream) -> MonitorLog {
        let _ = stream.set_read_timeout(Some(Duration::from_secs(30)));
        let mut writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(_) => return self.log,
        };
        if send_line(&mut writer, &self.script.greeting).is_err() {
            return self.log;
        }

        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            let Ok(request) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            self.log.requests.push(request.clone());

            if self.negotiated && self.script.unresponsive {
                continue;
            }
            if self.negotiated {
                for n in 0..self.script.events_per_reply {
                    let event = json!({
                        "event": "RTC_CHANGE",
                        "data": {"offset": n},
                        "timestamp": timestamp(),
                    });
                    if send_line(&mut writer, &event.to_string()).is_err() {
                        return self.log;
                    }
                }
            }

            let execute = request["execute"].as_str().unwrap_or_default();
            for (_, extra) in self.script.before_reply.iter().filter(|(c, _)| c == execute) {
                if send_line(&mut writer, extra).is_err() {
                    return self.log;
                }
            }

            let mut reply = self.answer(&request);
            self.tag_reply(&mut reply, request.get("id"));
            if send_line(&mut writer, &reply.to_string()).is_err() {
                break;
            }

            if self.log.quit {
                let shutdown = json!({
                    "event": "SHUTDOWN",
                    "data": {"guest": false, "reason": "host-qmp-quit"},
                    "timestamp": timestamp(),
                });
                let _ = send_line(&mut writer, &shutdown.to_string());
                break;
            }
        }
        self.log
    }

    fn answer(&mut self, request: &Value) -> Value {
        let execute = request["execute"].as_str().unwrap_or_default();
        let args = &request["arguments"];

        if self.script.failing.as_deref() == Some(execute) {
            return json!({"error": {"class": "GenericError", "desc": format!("{} failed", execute)}});
        }

        match execute {
            "qmp_capabilities" => {
                self.negotiated = true;
                json!({"return": {}})
            }
            "send-key" => {
                let chord: Vec<&str> = args["keys"]
                    .as_array()
                    .map(|keys| keys.iter().filter_map(|k| k["data"].as_str()).collect())
                    .unwrap_or_default();
                self.log.keys.push(chord.join("+"));
                json!({"return": {}})
            }
            "human-monitor-command" => {
                let line = args["command-line"].as_str().unwrap_or_default();
                json!({"return": self.human_monitor(line)})
            }
            "screendump" => {
                let path = args["filename"].as_str().unwrap_or_default();
                // 320x200 black PPM
                let mut image = b"P6\n320 200\n255\n".to_vec();
                image.resize(image.len() + 320 * 200 * 3, 0);
                match fs::write(path, image) {
                    Ok(()) => json!({"return": {}}),
                    Err(e) => json!({"error": {"class": "GenericError", "desc": e.to_string()}}),
                }
            }
            "pmemsave" => {
                let path = args["filename"].as_str().unwrap_or_default();
                let size = args["size"].as_u64().unwrap_or(0) as usize;
                match fs::write(path, vec![0u8; size]) {
                    Ok(()) => json!({"return": {}}),
                    Err(e) => json!({"error": {"class": "GenericError", "desc": e.to_string()}}),
                }
            }
            "query-status" => json!({"return": {
                "running": self.script.running,
                "singlestep": false,
                "status": if self.script.running { "running" } else { "paused" },
            }}),
            "stop" => {
                self.script.running = false;
                json!({"return": {}})
            }
            "cont" => {
                self.script.running = true;
                json!({"return": {}})
            }
            "quit" => {
                self.log.quit = true;
                json!({"return": {}})
            }
            other => json!({"error": {
                "class": "CommandNotFound",
                "desc": format!("The command {} has not been found", other),
            }}),
        }
    }

    fn human_monitor(&mut self, line: &str) -> String {
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("savevm"), Some(name)) => {
                self.script.snapshots.insert(name.to_string());
                self.log.snapshots_saved.push(name.to_string());
                String::new()
            }
            (Some("loadvm"), Some(name)) => {
                if self.script.snapshots.contains(name) {
                    self.log.snapshots_loaded.push(name.to_string());
                    String::new()
                } else {
                    format!("Error: Snapshot '{}' does not exist in one or more devices\r\n", name)
                }
            }
            (Some("info"), Some("snapshots")) => self
                .script
                .snapshots
                .iter()
                .map(|name| format!("{}\r\n", name))
                .collect(),
            (Some(command), _) => format!("unknown command: '{}'\r\n", command),
            (None, _) => String::new(),
        }
    }

    fn tag_reply(&self, reply: &mut Value, id: Option<&Value>) {
        let Some(id) = id else { return };
        let Value::Object(object) = reply else { return };
        if self.script.omit_ids {
            return;
        }
        // The capabilities request is always id 0
        if self.script.stale_ids && id.as_u64() != Some(0) {
            object.insert("id".to_string(), json!(id.as_u64().unwrap_or(0) + 1000));
        } else {
            object.insert("id".to_string(), id.clone());
        }
    }
}

fn timestamp() -> Value {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    json!({"seconds": now.as_secs(), "microseconds": now.subsec_micros()})
}

fn send_line(writer: &mut TcpStream, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}
