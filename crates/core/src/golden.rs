//! Golden-file comparison and storage.
//!
//! [`compare`] is the whole comparison contract: exact bytes, exact length, no
//! tolerance. [`GoldenStore`] persists captures in a flat directory:
//!
//! ```text
//! <scenario>_<buffer>.bin        raw bytes
//! <scenario>_registers.json      register name -> integer
//! <scenario>_checksums.json      buffer name -> sha256 hex
//! ```

use crate::logging::{log, LogCategory, LogLevel};
use crate::types::{CaptureResult, RegisterSet};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Outcome of comparing a golden buffer against a captured one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Match,
    LengthMismatch {
        expected_len: usize,
        actual_len: usize,
    },
    ByteMismatch {
        offset: usize,
        expected: u8,
        actual: u8,
    },
}

impl Verdict {
    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Match => f.write_str("match"),
            Verdict::LengthMismatch {
                expected_len,
                actual_len,
            } => write!(
                f,
                "length mismatch: golden {} bytes, actual {} bytes",
                expected_len, actual_len
            ),
            Verdict::ByteMismatch {
                offset,
                expected,
                actual,
            } => write!(
                f,
                "mismatch at offset {} ({:#x}): golden=0x{:02X} actual=0x{:02X}",
                offset, offset, expected, actual
            ),
        }
    }
}

/// Compare `actual` against `expected` byte for byte.
///
/// Buffers of different length never match and are not scanned.
pub fn compare(expected: &[u8], actual: &[u8]) -> Verdict {
    if expected.len() != actual.len() {
        return Verdict::LengthMismatch {
            expected_len: expected.len(),
            actual_len: actual.len(),
        };
    }
    match expected.iter().zip(actual).position(|(a, b)| a != b) {
        None => Verdict::Match,
        Some(offset) => Verdict::ByteMismatch {
            offset,
            expected: expected[offset],
            actual: actual[offset],
        },
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Error)]
pub enum GoldenError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no golden record {name:?} for scenario {scenario:?}")]
    Missing { scenario: String, name: String },
    #[error("golden {path} does not match its recorded checksum (recorded {recorded}, actual {actual})")]
    Corrupt {
        path: PathBuf,
        recorded: String,
        actual: String,
    },
}

/// A named golden buffer and its checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoldenRecord {
    pub name: String,
    pub bytes: Vec<u8>,
    pub checksum: String,
}

impl GoldenRecord {
    pub fn compare(&self, actual: &[u8]) -> Verdict {
        compare(&self.bytes, actual)
    }
}

/// Result of checking one capture against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoldenReport {
    pub scenario: String,
    pub buffers: Vec<(String, Verdict)>,
    /// Differing registers as (name, golden, actual); `None` when either side
    /// has no register record
    pub registers: Option<Vec<(&'static str, u32, u32)>>,
}

impl GoldenReport {
    pub fn passed(&self) -> bool {
        self.buffers.iter().all(|(_, v)| v.is_match())
            && self.registers.as_ref().map_or(true, |d| d.is_empty())
    }
}

pub struct GoldenStore {
    root: PathBuf,
}

impl GoldenStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn buffer_path(&self, scenario: &str, name: &str) -> PathBuf {
        self.root.join(format!("{}_{}.bin", scenario, name))
    }

    pub fn registers_path(&self, scenario: &str) -> PathBuf {
        self.root.join(format!("{}_registers.json", scenario))
    }

    pub fn checksums_path(&self, scenario: &str) -> PathBuf {
        self.root.join(format!("{}_checksums.json", scenario))
    }

    /// Persist every buffer, the register record and the checksum index.
    /// Returns the files written.
    pub fn record(&self, capture: &CaptureResult) -> Result<Vec<PathBuf>, GoldenError> {
        fs::create_dir_all(&self.root).map_err(|source| GoldenError::Io {
            path: self.root.clone(),
            source,
        })?;

        let scenario = capture.scenario();
        let mut written = Vec::new();
        let mut checksums = BTreeMap::new();

        for (name, data) in capture.buffers() {
            let path = self.buffer_path(scenario, name);
            write_file(&path, data)?;
            let checksum = sha256_hex(data);
            log(LogCategory::Golden, LogLevel::Info, || {
                format!(
                    "{} ({} bytes, sha256 {}...)",
                    path.display(),
                    data.len(),
                    &checksum[..16]
                )
            });
            checksums.insert(name.to_string(), checksum);
            written.push(path);
        }

        if let Some(registers) = capture.registers() {
            let path = self.registers_path(scenario);
            write_json(&path, registers)?;
            written.push(path);
        }

        let path = self.checksums_path(scenario);
        write_json(&path, &checksums)?;
        written.push(path);

        Ok(written)
    }

    /// Load one golden buffer, verifying it against the checksum index when
    /// one exists.
    pub fn load(&self, scenario: &str, name: &str) -> Result<GoldenRecord, GoldenError> {
        let path = self.buffer_path(scenario, name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(GoldenError::Missing {
                    scenario: scenario.to_string(),
                    name: name.to_string(),
                })
            }
            Err(source) => return Err(GoldenError::Io { path, source }),
        };
        let checksum = sha256_hex(&bytes);

        if let Some(recorded) = self.load_checksums(scenario)?.remove(name) {
            if recorded != checksum {
                return Err(GoldenError::Corrupt {
                    path,
                    recorded,
                    actual: checksum,
                });
            }
        }

        Ok(GoldenRecord {
            name: name.to_string(),
            bytes,
            checksum,
        })
    }

    pub fn load_registers(&self, scenario: &str) -> Result<Option<RegisterSet>, GoldenError> {
        read_json_if_present(&self.registers_path(scenario))
    }

    fn load_checksums(&self, scenario: &str) -> Result<BTreeMap<String, String>, GoldenError> {
        Ok(read_json_if_present(&self.checksums_path(scenario))?.unwrap_or_default())
    }

    /// Compare every buffer (and registers, when both sides have them) of
    /// `capture` against the stored goldens for its scenario.
    pub fn verify(&self, capture: &CaptureResult) -> Result<GoldenReport, GoldenError> {
        let scenario = capture.scenario();
        let mut buffers = Vec::new();
        for (name, data) in capture.buffers() {
            let verdict = self.load(scenario, name)?.compare(data);
            let level = if verdict.is_match() {
                LogLevel::Info
            } else {
                LogLevel::Warn
            };
            log(LogCategory::Golden, level, || {
                format!("{}/{}: {}", scenario, name, verdict)
            });
            buffers.push((name.to_string(), verdict));
        }

        let registers = match (self.load_registers(scenario)?, capture.registers()) {
            (Some(golden), Some(actual)) => Some(golden.diff(actual)),
            _ => None,
        };

        Ok(GoldenReport {
            scenario: scenario.to_string(),
            buffers,
            registers,
        })
    }
}

fn write_file(path: &Path, data: &[u8]) -> Result<(), GoldenError> {
    fs::write(path, data).map_err(|source| GoldenError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), GoldenError> {
    let text = serde_json::to_string_pretty(value).map_err(|source| GoldenError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_file(path, text.as_bytes())
}

fn read_json_if_present<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, GoldenError> {
    match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| GoldenError::Json {
                path: path.to_path_buf(),
                source,
            }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(GoldenError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CaptureBuilder;

    fn temp_store(tag: &str) -> GoldenStore {
        let dir = std::env::temp_dir().join(format!(
            "probe_golden_{}_{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        GoldenStore::new(dir)
    }

    #[test]
    fn test_identical_buffers_match() {
        assert_eq!(compare(b"", b""), Verdict::Match);
        assert_eq!(compare(&[1, 2, 3], &[1, 2, 3]), Verdict::Match);
    }

    #[test]
    fn test_first_differing_offset_is_reported() {
        let golden = vec![0u8; 100];
        let mut actual = golden.clone();
        actual[42] = 0x11;
        actual[90] = 0x22;
        assert_eq!(
            compare(&golden, &actual),
            Verdict::ByteMismatch {
                offset: 42,
                expected: 0,
                actual: 0x11
            }
        );
    }

    #[test]
    fn test_length_mismatch_is_not_scanned() {
        // Differ at index 0 too, but length wins
        assert_eq!(
            compare(&[1, 2, 3], &[9, 2]),
            Verdict::LengthMismatch {
                expected_len: 3,
                actual_len: 2
            }
        );
        assert!(!compare(&[1, 2], &[1, 2, 0]).is_match());
    }

    #[test]
    fn test_exhaustive_small_buffers() {
        // Every pair of 2-byte buffers over a small alphabet
        let alphabet = [0u8, 1, 0xFF];
        for a0 in alphabet {
            for a1 in alphabet {
                for b0 in alphabet {
                    for b1 in alphabet {
                        let a = [a0, a1];
                        let b = [b0, b1];
                        let verdict = compare(&a, &b);
                        assert_eq!(verdict.is_match(), a == b);
                        if let Verdict::ByteMismatch { offset, .. } = verdict {
                            let first = if a0 != b0 { 0 } else { 1 };
                            assert_eq!(offset, first);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_verdict_display() {
        let v = Verdict::ByteMismatch {
            offset: 16,
            expected: 0xAB,
            actual: 0x01,
        };
        assert_eq!(
            v.to_string(),
            "mismatch at offset 16 (0x10): golden=0xAB actual=0x01"
        );
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_record_then_verify_capture() {
        let store = temp_store("roundtrip");
        let mut builder = CaptureBuilder::new("move_right");
        builder
            .push_buffer("fb", vec![7u8; 64])
            .push_buffer("state", vec![1, 2, 3, 4])
            .registers(RegisterSet {
                eip: 0x1A3F0,
                ..Default::default()
            });
        let capture = builder.build();

        let written = store.record(&capture).unwrap();
        assert_eq!(written.len(), 4);
        assert!(store.buffer_path("move_right", "fb").exists());

        let record = store.load("move_right", "state").unwrap();
        assert_eq!(record.bytes, vec![1, 2, 3, 4]);
        assert_eq!(record.checksum, sha256_hex(&[1, 2, 3, 4]));

        let report = store.verify(&capture).unwrap();
        assert!(report.passed());
        assert_eq!(report.registers, Some(vec![]));

        let mut changed = CaptureBuilder::new("move_right");
        changed
            .push_buffer("fb", vec![7u8; 64])
            .push_buffer("state", vec![1, 2, 9, 4]);
        let report = store.verify(&changed.build()).unwrap();
        assert!(!report.passed());
        assert_eq!(
            report.buffers[1].1,
            Verdict::ByteMismatch {
                offset: 2,
                expected: 3,
                actual: 9
            }
        );
        assert_eq!(report.registers, None);

        fs::remove_dir_all(store.root()).unwrap();
    }

    #[test]
    fn test_missing_and_corrupt_goldens() {
        let store = temp_store("corrupt");
        assert!(matches!(
            store.load("idle", "fb"),
            Err(GoldenError::Missing { .. })
        ));

        let mut builder = CaptureBuilder::new("idle");
        builder.push_buffer("fb", vec![0u8; 8]);
        store.record(&builder.build()).unwrap();
        fs::write(store.buffer_path("idle", "fb"), [1u8; 8]).unwrap();

        assert!(matches!(
            store.load("idle", "fb"),
            Err(GoldenError::Corrupt { .. })
        ));

        fs::remove_dir_all(store.root()).unwrap();
    }
}
