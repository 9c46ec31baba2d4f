//! Remote serial protocol framing: `$<payload>#<hh>`.
//!
//! The checksum is the byte sum of the payload modulo 256, written as two
//! lowercase hex digits. Inbound payloads may be run-length encoded
//! (`X*<n>` repeats `X` `n - 29` more times) and may escape a byte as `}`
//! followed by the byte XOR 0x20. The checksum covers the encoded form, so
//! unescaping and expansion happen only after verification.

use thiserror::Error;

pub const PACKET_START: u8 = b'$';
pub const PACKET_END: u8 = b'#';
pub const ACK: u8 = b'+';
pub const NAK: u8 = b'-';
pub const ESCAPE: u8 = b'}';
const ESCAPE_XOR: u8 = 0x20;
/// Out-of-band interrupt request, sent unframed
pub const INTERRUPT: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame does not start with '$'")]
    MissingStart,
    #[error("frame has no '#' terminator")]
    MissingEnd,
    #[error("checksum field {0:?} is not two hex digits")]
    BadChecksumField(String),
    #[error("checksum mismatch: frame says {expected:02x}, payload sums to {actual:02x}")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("run-length marker without a preceding byte")]
    DanglingRepeat,
    #[error("escape character at the end of the payload")]
    DanglingEscape,
    #[error("payload is not ASCII")]
    NotAscii,
}

pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

fn needs_escape(byte: u8) -> bool {
    matches!(byte, PACKET_START | PACKET_END | ESCAPE | b'*')
}

/// Frame `payload` for the wire, escaping the framing characters.
pub fn encode(payload: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len());
    for byte in payload.bytes() {
        if needs_escape(byte) {
            body.push(ESCAPE);
            body.push(byte ^ ESCAPE_XOR);
        } else {
            body.push(byte);
        }
    }
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.push(PACKET_START);
    frame.extend_from_slice(&body);
    frame.push(PACKET_END);
    frame.extend_from_slice(format!("{:02x}", checksum(&body)).as_bytes());
    frame
}

/// Parse the two checksum characters following `#`.
pub fn parse_checksum(field: [u8; 2]) -> Result<u8, FrameError> {
    std::str::from_utf8(&field)
        .ok()
        .and_then(|s| u8::from_str_radix(s, 16).ok())
        .ok_or_else(|| FrameError::BadChecksumField(String::from_utf8_lossy(&field).into_owned()))
}

/// Verify a received body against its checksum and return the decoded
/// payload.
pub fn verify(body: &[u8], field: [u8; 2]) -> Result<String, FrameError> {
    let expected = parse_checksum(field)?;
    let actual = checksum(body);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }
    let expanded = expand_run_length(body)?;
    let expanded = unescape(&expanded)?;
    if !expanded.is_ascii() {
        return Err(FrameError::NotAscii);
    }
    // ASCII is valid UTF-8
    Ok(String::from_utf8(expanded).unwrap_or_default())
}

/// Decode one complete frame (`$...#hh`) into its payload.
pub fn decode(frame: &[u8]) -> Result<String, FrameError> {
    let rest = frame.strip_prefix(&[PACKET_START]).ok_or(FrameError::MissingStart)?;
    let end = rest
        .iter()
        .rposition(|&b| b == PACKET_END)
        .ok_or(FrameError::MissingEnd)?;
    let (body, tail) = (&rest[..end], &rest[end + 1..]);
    let field: [u8; 2] = tail
        .try_into()
        .map_err(|_| FrameError::BadChecksumField(String::from_utf8_lossy(tail).into_owned()))?;
    verify(body, field)
}

pub fn expand_run_length(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    if !body.contains(&b'*') {
        return Ok(body.to_vec());
    }
    let mut out = Vec::with_capacity(body.len() * 2);
    let mut iter = body.iter().copied();
    while let Some(byte) = iter.next() {
        if byte != b'*' {
            out.push(byte);
            continue;
        }
        let last = *out.last().ok_or(FrameError::DanglingRepeat)?;
        let count = iter.next().ok_or(FrameError::DanglingRepeat)?;
        let repeats = count.saturating_sub(29) as usize;
        out.extend(std::iter::repeat(last).take(repeats));
    }
    Ok(out)
}

/// Resolve `}`-escaped bytes.
pub fn unescape(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    if !body.contains(&ESCAPE) {
        return Ok(body.to_vec());
    }
    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.iter().copied();
    while let Some(byte) = iter.next() {
        if byte == ESCAPE {
            let escaped = iter.next().ok_or(FrameError::DanglingEscape)?;
            out.push(escaped ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_frames() {
        assert_eq!(encode("g"), b"$g#67");
        assert_eq!(encode("c"), b"$c#63");
        assert_eq!(encode("OK"), b"$OK#9a");
        assert_eq!(encode(""), b"$#00");
    }

    #[test]
    fn test_round_trip_for_command_payloads() {
        let payloads = [
            "m a0000,1000",
            "ma0000,1000",
            "Z0,1a3f0,1",
            "z0,1a3f0,1",
            "M2a400,4:deadbeef",
            "T05thread:01;",
            "qSupported:multiprocess+;swbreak+",
        ];
        for payload in payloads {
            let frame = encode(payload);
            assert_eq!(decode(&frame).unwrap(), payload);
            let sum: u32 = payload.bytes().map(u32::from).sum();
            let suffix = format!("#{:02x}", sum % 256);
            assert!(frame.ends_with(suffix.as_bytes()));
        }
    }

    #[test]
    fn test_checksum_wraps() {
        let payload = "z".repeat(300);
        assert_eq!(checksum(payload.as_bytes()), ((0x7Au32 * 300) % 256) as u8);
        assert_eq!(decode(&encode(&payload)).unwrap(), payload);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert_eq!(decode(b"OK#9a"), Err(FrameError::MissingStart));
        assert_eq!(decode(b"$OK"), Err(FrameError::MissingEnd));
        assert_eq!(
            decode(b"$OK#9b"),
            Err(FrameError::ChecksumMismatch {
                expected: 0x9b,
                actual: 0x9a
            })
        );
        assert!(matches!(
            decode(b"$OK#zz"),
            Err(FrameError::BadChecksumField(_))
        ));
        assert!(matches!(
            decode(b"$OK#9"),
            Err(FrameError::BadChecksumField(_))
        ));
    }

    #[test]
    fn test_run_length_expansion() {
        // '0' followed by "* " (32 - 29 = 3 more zeros)
        assert_eq!(expand_run_length(b"0* ").unwrap(), b"0000");
        assert_eq!(expand_run_length(b"ab*\"c").unwrap(), b"abbbbbbc");
        assert_eq!(expand_run_length(b"*x"), Err(FrameError::DanglingRepeat));

        let body = b"0* 1";
        let mut frame = vec![b'$'];
        frame.extend_from_slice(body);
        frame.extend_from_slice(format!("#{:02x}", checksum(body)).as_bytes());
        assert_eq!(decode(&frame).unwrap(), "00001");
    }

    #[test]
    fn test_escaped_bytes_are_resolved_after_checksum() {
        // "}\x03" is '#' escaped; the checksum covers the escaped form
        let body = b"a}\x03b";
        let mut frame = vec![b'$'];
        frame.extend_from_slice(body);
        frame.extend_from_slice(format!("#{:02x}", checksum(body)).as_bytes());
        assert_eq!(decode(&frame).unwrap(), "a#b");

        assert_eq!(unescape(b"}]}\x04").unwrap(), b"}$");
        assert_eq!(unescape(b"ab}"), Err(FrameError::DanglingEscape));
    }

    #[test]
    fn test_encode_escapes_framing_characters() {
        let frame = encode("a#b}");
        assert_eq!(&frame[..7], b"$a}\x03b}]");
        assert_eq!(decode(&frame).unwrap(), "a#b}");
        assert_eq!(decode(&encode("x*y$")).unwrap(), "x*y$");
    }
}
