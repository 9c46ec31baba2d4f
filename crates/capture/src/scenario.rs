//! Scenario files: what to load, what to press, where to stop, what to read.
//!
//! ```json
//! [
//!   {
//!     "name": "move_right",
//!     "snapshot": "game_start",
//!     "keys": ["right", "right", "right"],
//!     "wait_ms": 500,
//!     "breakpoint": "1A3F:0000",
//!     "regions": [
//!       {"name": "framebuffer", "address": "0xA0000", "length": 64000},
//!       {"name": "state", "address": "2A30:0100", "length": 256}
//!     ]
//!   }
//! ]
//! ```
//!
//! Timing fields left out fall back to the harness configuration.

use probe_core::address::deserialize_optional_address;
use probe_core::{CaptureConfig, NamedRegion};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub snapshot: Option<String>,
    /// qcodes sent one at a time
    #[serde(default)]
    pub keys: Vec<String>,
    /// Typed after `keys`
    #[serde(default)]
    pub text: Option<String>,
    /// Halt here instead of interrupting after `wait`
    #[serde(default, deserialize_with = "deserialize_optional_address")]
    pub breakpoint: Option<u32>,
    #[serde(default = "default_regions")]
    pub regions: Vec<NamedRegion>,
    #[serde(default = "enabled")]
    pub registers: bool,
    #[serde(default)]
    pub screenshot: bool,
    #[serde(default = "enabled")]
    pub resume: bool,
    #[serde(default)]
    pub settle_ms: Option<u64>,
    #[serde(default)]
    pub key_delay_ms: Option<u64>,
    #[serde(default)]
    pub wait_ms: Option<u64>,
    #[serde(default)]
    pub stop_timeout_ms: Option<u64>,
    #[serde(default)]
    pub breakpoint_timeout_ms: Option<u64>,
}

fn default_regions() -> Vec<NamedRegion> {
    vec![NamedRegion::framebuffer()]
}

fn enabled() -> bool {
    true
}

impl Scenario {
    /// A scenario that captures the framebuffer and registers with default
    /// timing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            snapshot: None,
            keys: Vec::new(),
            text: None,
            breakpoint: None,
            regions: default_regions(),
            registers: true,
            screenshot: false,
            resume: true,
            settle_ms: None,
            key_delay_ms: None,
            wait_ms: None,
            stop_timeout_ms: None,
            breakpoint_timeout_ms: None,
        }
    }

    /// Whether anything is delivered to the guest before the halt.
    pub fn has_input(&self) -> bool {
        self.snapshot.is_some() || !self.keys.is_empty() || self.text.is_some()
    }

    /// Whether any step needs the control channel.
    pub fn needs_control(&self) -> bool {
        self.has_input() || self.screenshot
    }

    pub fn timing(&self, defaults: &CaptureConfig) -> Timing {
        let ms = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        Timing {
            settle: ms(self.settle_ms, defaults.settle()),
            key_delay: ms(self.key_delay_ms, defaults.key_delay()),
            key_hold: defaults.key_hold(),
            wait: ms(self.wait_ms, defaults.wait()),
            stop_timeout: ms(self.stop_timeout_ms, defaults.stop_timeout()),
            breakpoint_timeout: ms(self.breakpoint_timeout_ms, defaults.breakpoint_timeout()),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() || self.name.contains(['/', '\\']) {
            return Err("name must be non-empty and contain no path separators".to_string());
        }
        if let Some(snapshot) = &self.snapshot {
            if snapshot.is_empty() || snapshot.chars().any(char::is_whitespace) {
                return Err(format!("snapshot name {:?} must be a single word", snapshot));
            }
        }
        let mut seen = HashSet::new();
        for region in &self.regions {
            if region.name.is_empty() || !seen.insert(region.name.as_str()) {
                return Err(format!("region name {:?} is empty or repeated", region.name));
            }
            if region.region.end().is_none() {
                return Err(format!("region {:?} extends past 4 GiB", region.name));
            }
        }
        Ok(())
    }
}

/// Resolved pacing for one scenario run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub settle: Duration,
    pub key_delay: Duration,
    pub key_hold: Duration,
    pub wait: Duration,
    pub stop_timeout: Duration,
    pub breakpoint_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("scenario {name:?}: {reason}")]
    Invalid { name: String, reason: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScenarioFile {
    List(Vec<Scenario>),
    Wrapped { scenarios: Vec<Scenario> },
}

/// Parse a scenario list: either a bare JSON array or `{"scenarios": [...]}`.
pub fn parse_scenarios(text: &str) -> Result<Vec<Scenario>, serde_json::Error> {
    let file: ScenarioFile = serde_json::from_str(text)?;
    Ok(match file {
        ScenarioFile::List(list) => list,
        ScenarioFile::Wrapped { scenarios } => scenarios,
    })
}

pub fn load_scenarios(path: &Path) -> Result<Vec<Scenario>, ScenarioError> {
    let text = fs::read_to_string(path).map_err(|source| ScenarioError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let scenarios = parse_scenarios(&text).map_err(|source| ScenarioError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut names = HashSet::new();
    for scenario in &scenarios {
        scenario.validate().map_err(|reason| ScenarioError::Invalid {
            name: scenario.name.clone(),
            reason,
        })?;
        if !names.insert(scenario.name.as_str()) {
            return Err(ScenarioError::Invalid {
                name: scenario.name.clone(),
                reason: "duplicate scenario name".to_string(),
            });
        }
    }
    Ok(scenarios)
}
