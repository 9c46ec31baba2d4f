//! QMP wire messages.
//!
//! Requests are `{"execute": <name>, "arguments": {...}, "id": n}`, one JSON
//! object per line. The server answers with `{"return": ...}` or
//! `{"error": {"class", "desc"}}`, and interleaves asynchronous events that
//! carry neither key.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "execute", content = "arguments", rename_all = "kebab-case")]
pub enum ControlCommand {
    #[serde(rename = "qmp_capabilities")]
    Capabilities,
    SendKey {
        keys: Vec<KeyValue>,
        #[serde(rename = "hold-time", skip_serializing_if = "Option::is_none")]
        hold_time: Option<u32>,
    },
    HumanMonitorCommand {
        #[serde(rename = "command-line")]
        command_line: String,
    },
    Screendump {
        filename: String,
    },
    Pmemsave {
        val: u64,
        size: u64,
        filename: String,
    },
    QueryStatus,
    Quit,
}

impl ControlCommand {
    /// The `execute` name, for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::Capabilities => "qmp_capabilities",
            ControlCommand::SendKey { .. } => "send-key",
            ControlCommand::HumanMonitorCommand { .. } => "human-monitor-command",
            ControlCommand::Screendump { .. } => "screendump",
            ControlCommand::Pmemsave { .. } => "pmemsave",
            ControlCommand::QueryStatus => "query-status",
            ControlCommand::Quit => "quit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum KeyValue {
    Qcode(String),
    Number(u32),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Greeting {
    #[serde(rename = "QMP")]
    pub qmp: GreetingBody,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GreetingBody {
    #[serde(default)]
    pub version: Value,
    #[serde(default)]
    pub capabilities: Vec<Value>,
}

impl Greeting {
    /// `major.minor.micro` of the QEMU that sent the greeting.
    pub fn qemu_version(&self) -> Option<String> {
        let qemu = self.qmp.version.get("qemu")?;
        Some(format!(
            "{}.{}.{}",
            qemu.get("major")?.as_u64()?,
            qemu.get("minor")?.as_u64()?,
            qemu.get("micro")?.as_u64()?
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub microseconds: i64,
}

/// Asynchronous notification (`STOP`, `RESUME`, `SHUTDOWN`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

/// Result of `query-status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub running: bool,
    pub status: String,
    #[serde(default)]
    pub singlestep: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Greeting(Greeting),
    Return { id: Option<Value>, value: Value },
    Error {
        id: Option<Value>,
        class: String,
        desc: String,
    },
    Event(Event),
    /// An object with neither `return` nor `error` that is not a well-formed
    /// event; skipped by the reader
    Notification(Value),
}

/// Classify one received line. `Err` carries a description of what is wrong
/// with it.
pub fn classify(line: &[u8]) -> Result<Incoming, String> {
    let value: Value =
        serde_json::from_slice(line).map_err(|e| format!("reply is not JSON: {}", e))?;
    let Value::Object(mut object) = value else {
        return Err("reply is not a JSON object".to_string());
    };

    let id = object.remove("id");
    if let Some(value) = object.remove("return") {
        return Ok(Incoming::Return { id, value });
    }
    if let Some(error) = object.remove("error") {
        let field = |key: &str| {
            error
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        return Ok(Incoming::Error {
            id,
            class: field("class"),
            desc: field("desc"),
        });
    }
    if object.contains_key("QMP") {
        return serde_json::from_value(Value::Object(object))
            .map(Incoming::Greeting)
            .map_err(|e| format!("malformed greeting: {}", e));
    }
    let notification = Value::Object(object);
    match Event::deserialize(&notification) {
        Ok(event) => Ok(Incoming::Event(event)),
        Err(_) => Ok(Incoming::Notification(notification)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_serialization() {
        let cmd = ControlCommand::SendKey {
            keys: vec![KeyValue::Qcode("ret".to_string())],
            hold_time: Some(100),
        };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({
                "execute": "send-key",
                "arguments": {"keys": [{"type": "qcode", "data": "ret"}], "hold-time": 100}
            })
        );

        let hmp = ControlCommand::HumanMonitorCommand {
            command_line: "savevm level1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&hmp).unwrap(),
            json!({"execute": "human-monitor-command", "arguments": {"command-line": "savevm level1"}})
        );

        assert_eq!(
            serde_json::to_value(&ControlCommand::Capabilities).unwrap(),
            json!({"execute": "qmp_capabilities"})
        );
        assert_eq!(
            serde_json::to_value(&ControlCommand::QueryStatus).unwrap(),
            json!({"execute": "query-status"})
        );
        assert_eq!(
            serde_json::to_value(&ControlCommand::Pmemsave {
                val: 0xA0000,
                size: 64000,
                filename: "/tmp/fb.bin".to_string()
            })
            .unwrap(),
            json!({"execute": "pmemsave", "arguments": {"val": 655360, "size": 64000, "filename": "/tmp/fb.bin"}})
        );
    }

    #[test]
    fn test_names_match_serialized_tag() {
        let commands = [
            ControlCommand::Capabilities,
            ControlCommand::SendKey {
                keys: vec![],
                hold_time: None,
            },
            ControlCommand::HumanMonitorCommand {
                command_line: String::new(),
            },
            ControlCommand::Screendump {
                filename: String::new(),
            },
            ControlCommand::Pmemsave {
                val: 0,
                size: 0,
                filename: String::new(),
            },
            ControlCommand::QueryStatus,
            ControlCommand::Quit,
        ];
        for cmd in commands {
            let value = serde_json::to_value(&cmd).unwrap();
            assert_eq!(value["execute"], cmd.name());
        }
    }

    #[test]
    fn test_classify_replies_and_events() {
        assert_eq!(
            classify(br#"{"return": {}, "id": 3}"#).unwrap(),
            Incoming::Return {
                id: Some(json!(3)),
                value: json!({})
            }
        );
        assert_eq!(
            classify(br#"{"error": {"class": "GenericError", "desc": "no such snapshot"}}"#)
                .unwrap(),
            Incoming::Error {
                id: None,
                class: "GenericError".to_string(),
                desc: "no such snapshot".to_string()
            }
        );
        match classify(
            br#"{"event": "STOP", "timestamp": {"seconds": 1700000000, "microseconds": 5}}"#,
        )
        .unwrap()
        {
            Incoming::Event(event) => {
                assert_eq!(event.event, "STOP");
                assert_eq!(event.timestamp.unwrap().microseconds, 5);
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_greeting() {
        let line = br#"{"QMP": {"version": {"qemu": {"micro": 1, "minor": 2, "major": 8}, "package": ""}, "capabilities": ["oob"]}}"#;
        match classify(line).unwrap() {
            Incoming::Greeting(greeting) => {
                assert_eq!(greeting.qemu_version().as_deref(), Some("8.2.1"));
                assert_eq!(greeting.qmp.capabilities.len(), 1);
            }
            other => panic!("expected greeting, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_rejects_garbage() {
        assert!(classify(b"not json").is_err());
        assert!(classify(b"[1, 2]").is_err());
    }

    #[test]
    fn test_objects_without_return_or_error_are_notifications() {
        let line = br#"{"timestamp": {"seconds": 1700000000, "microseconds": 5}, "data": {}}"#;
        match classify(line).unwrap() {
            Incoming::Notification(value) => assert_eq!(value["data"], json!({})),
            other => panic!("expected notification, got {:?}", other),
        }
        assert!(matches!(
            classify(br#"{"hello": 1}"#).unwrap(),
            Incoming::Notification(_)
        ));
        // An event name of the wrong type is still skippable
        assert!(matches!(
            classify(br#"{"event": 7}"#).unwrap(),
            Incoming::Notification(_)
        ));
    }
}
