//! The subset of the remote protocol this client speaks, as typed values.

use probe_core::StopReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugCommand {
    ReadMemory { address: u32, length: usize },
    WriteMemory { address: u32, data: Vec<u8> },
    ReadRegisters,
    InsertBreakpoint { address: u32 },
    RemoveBreakpoint { address: u32 },
    Continue,
    Step,
    HaltReason,
}

impl DebugCommand {
    pub fn payload(&self) -> String {
        match self {
            DebugCommand::ReadMemory { address, length } => format!("m{:x},{:x}", address, length),
            DebugCommand::WriteMemory { address, data } => {
                format!("M{:x},{:x}:{}", address, data.len(), hex::encode(data))
            }
            DebugCommand::ReadRegisters => "g".to_string(),
            DebugCommand::InsertBreakpoint { address } => format!("Z0,{:x},1", address),
            DebugCommand::RemoveBreakpoint { address } => format!("z0,{:x},1", address),
            DebugCommand::Continue => "c".to_string(),
            DebugCommand::Step => "s".to_string(),
            DebugCommand::HaltReason => "?".to_string(),
        }
    }

    /// Operation name used in error messages and logs
    pub fn operation(&self) -> &'static str {
        match self {
            DebugCommand::ReadMemory { .. } => "read memory",
            DebugCommand::WriteMemory { .. } => "write memory",
            DebugCommand::ReadRegisters => "read registers",
            DebugCommand::InsertBreakpoint { .. } => "set breakpoint",
            DebugCommand::RemoveBreakpoint { .. } => "remove breakpoint",
            DebugCommand::Continue => "continue",
            DebugCommand::Step => "step",
            DebugCommand::HaltReason => "query halt reason",
        }
    }

    pub fn address(&self) -> Option<u32> {
        match self {
            DebugCommand::ReadMemory { address, .. }
            | DebugCommand::WriteMemory { address, .. }
            | DebugCommand::InsertBreakpoint { address }
            | DebugCommand::RemoveBreakpoint { address } => Some(*address),
            _ => None,
        }
    }
}

/// A reply payload, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    /// `Exx`, `E.<text>` or any other `E` payload that cannot be hex data;
    /// the code is present only for the numeric forms
    Error(Option<u8>),
    /// Empty payload: command not supported by the stub
    Unsupported,
    Stop(StopReason),
    /// Anything else, typically hex data
    Data(String),
}

impl Reply {
    /// Classify a reply to a data-returning command (`m`, `g`).
    ///
    /// `E` plus one or two hex digits is always an error. Any other payload
    /// starting with `E` is an error unless it is well-formed hex data, so
    /// `E1E2` stays data while `E.Cannot access memory` does not.
    pub fn parse_data(payload: &str) -> Reply {
        if let Some(code) = parse_error(payload) {
            return Reply::Error(code);
        }
        match payload {
            "" => Reply::Unsupported,
            "OK" => Reply::Ok,
            _ => Reply::Data(payload.to_string()),
        }
    }

    /// Classify a reply expected to be a stop notification.
    pub fn parse_stop(payload: &str) -> Reply {
        if let Some(code) = parse_error(payload) {
            return Reply::Error(code);
        }
        match parse_stop_reason(payload) {
            Some(stop) => Reply::Stop(stop),
            None if payload.is_empty() => Reply::Unsupported,
            None if payload == "OK" => Reply::Ok,
            None => Reply::Data(payload.to_string()),
        }
    }
}

/// `Some(code)` when `payload` is an error reply.
fn parse_error(payload: &str) -> Option<Option<u8>> {
    let rest = payload.strip_prefix('E')?;
    if (1..=2).contains(&rest.len()) && rest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Some(u8::from_str_radix(rest, 16).ok());
    }
    if is_hex_data(payload) {
        None
    } else {
        Some(None)
    }
}

fn is_hex_data(payload: &str) -> bool {
    payload.len() % 2 == 0 && payload.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse `S<sig>`, `T<sig><key>:<value>;...`, `W<code>` or `X<sig>`.
pub fn parse_stop_reason(payload: &str) -> Option<StopReason> {
    let kind = payload.chars().next()?;
    let rest = &payload[1..];
    let number = rest.get(..2).and_then(|s| u8::from_str_radix(s, 16).ok());
    match kind {
        'S' if rest.len() == 2 => Some(StopReason::Signal {
            signal: number?,
            info: Vec::new(),
        }),
        'T' => {
            let signal = number?;
            let info = rest[2..]
                .split(';')
                .filter(|pair| !pair.is_empty())
                .map(|pair| match pair.split_once(':') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (pair.to_string(), String::new()),
                })
                .collect();
            Some(StopReason::Signal { signal, info })
        }
        // W and X may carry ";process:pid" after the code
        'W' => Some(StopReason::Exited(number?)),
        'X' => Some(StopReason::Terminated(number?)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payloads_match_wire_grammar() {
        assert_eq!(
            DebugCommand::ReadMemory {
                address: 0xA0000,
                length: 4096
            }
            .payload(),
            "ma0000,1000"
        );
        assert_eq!(
            DebugCommand::WriteMemory {
                address: 0x2A400,
                data: vec![0xDE, 0xAD]
            }
            .payload(),
            "M2a400,2:dead"
        );
        assert_eq!(DebugCommand::ReadRegisters.payload(), "g");
        assert_eq!(
            DebugCommand::InsertBreakpoint { address: 0x1A3F0 }.payload(),
            "Z0,1a3f0,1"
        );
        assert_eq!(
            DebugCommand::RemoveBreakpoint { address: 0x1A3F0 }.payload(),
            "z0,1a3f0,1"
        );
        assert_eq!(DebugCommand::Continue.payload(), "c");
        assert_eq!(DebugCommand::Step.payload(), "s");
        assert_eq!(DebugCommand::HaltReason.payload(), "?");
    }

    #[test]
    fn test_operation_names_and_addresses() {
        let cmd = DebugCommand::InsertBreakpoint { address: 0x10 };
        assert_eq!(cmd.operation(), "set breakpoint");
        assert_eq!(cmd.address(), Some(0x10));
        assert_eq!(DebugCommand::Continue.address(), None);
    }

    #[test]
    fn test_data_reply_classification() {
        assert_eq!(Reply::parse_data("E14"), Reply::Error(Some(0x14)));
        assert_eq!(Reply::parse_data("OK"), Reply::Ok);
        assert_eq!(Reply::parse_data(""), Reply::Unsupported);
        // Uppercase hex data that happens to start with E
        assert_eq!(
            Reply::parse_data("E1E2"),
            Reply::Data("E1E2".to_string())
        );
        assert_eq!(Reply::parse_data("e1"), Reply::Data("e1".to_string()));
    }

    #[test]
    fn test_textual_and_short_errors() {
        assert_eq!(
            Reply::parse_data("E.Cannot access memory at 0xa1000"),
            Reply::Error(None)
        );
        assert_eq!(Reply::parse_data("E1"), Reply::Error(Some(1)));
        assert_eq!(Reply::parse_data("E"), Reply::Error(None));
        assert_eq!(Reply::parse_data("EZZZ"), Reply::Error(None));
        assert_eq!(Reply::parse_stop("E.not stopped"), Reply::Error(None));
        assert_eq!(
            Reply::parse_data("EEEE"),
            Reply::Data("EEEE".to_string())
        );
    }

    #[test]
    fn test_stop_reason_parsing() {
        assert_eq!(
            parse_stop_reason("S05"),
            Some(StopReason::Signal {
                signal: 5,
                info: vec![]
            })
        );
        assert_eq!(
            parse_stop_reason("T02thread:01;08:f0a30100;"),
            Some(StopReason::Signal {
                signal: 2,
                info: vec![
                    ("thread".to_string(), "01".to_string()),
                    ("08".to_string(), "f0a30100".to_string())
                ]
            })
        );
        assert_eq!(parse_stop_reason("W00"), Some(StopReason::Exited(0)));
        assert_eq!(
            parse_stop_reason("X09;process:1"),
            Some(StopReason::Terminated(9))
        );
        assert_eq!(parse_stop_reason("OK"), None);
        assert_eq!(parse_stop_reason("T"), None);
        assert_eq!(parse_stop_reason(""), None);
    }

    #[test]
    fn test_stop_reply_classification() {
        assert!(matches!(Reply::parse_stop("T05"), Reply::Stop(_)));
        assert_eq!(Reply::parse_stop("E01"), Reply::Error(Some(1)));
        assert_eq!(Reply::parse_stop("OK"), Reply::Ok);
        assert_eq!(
            Reply::parse_stop("0000"),
            Reply::Data("0000".to_string())
        );
    }
}
