//! `run_report.json`: one entry per attempted scenario.

use anyhow::{Context, Result};
use chrono::Utc;
use probe_capture::CaptureError;
use probe_core::golden::GoldenReport;
use probe_core::CaptureResult;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Capture,
    Record,
    Verify,
}

#[derive(Debug, Serialize)]
pub struct ScenarioEntry {
    pub name: String,
    pub captured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub buffers: Vec<String>,
    /// Buffer name -> verdict text; only in verify mode
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mismatches: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub register_diffs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
}

impl ScenarioEntry {
    pub fn passed(&self) -> bool {
        self.captured && self.verified.unwrap_or(true)
    }

    pub fn add_verification(&mut self, report: &GoldenReport) {
        for (name, verdict) in &report.buffers {
            if !verdict.is_match() {
                self.mismatches.push((name.clone(), verdict.to_string()));
            }
        }
        if let Some(diffs) = &report.registers {
            self.register_diffs = diffs
                .iter()
                .map(|(name, golden, actual)| format!("{}: {:#x} -> {:#x}", name, golden, actual))
                .collect();
        }
        self.verified = Some(report.passed());
    }
}

impl fmt::Display for ScenarioEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match (&self.error, self.verified) {
            (Some(_), _) => "FAIL",
            (None, Some(false)) => "MISMATCH",
            (None, Some(true)) => "PASS",
            (None, None) => "OK",
        };
        write!(f, "[{:8}] {}", status, self.name)?;
        if let Some(error) = &self.error {
            write!(f, ": {}", error)?;
        }
        for (name, verdict) in &self.mismatches {
            write!(f, "\n    {}: {}", name, verdict)?;
        }
        for diff in &self.register_diffs {
            write!(f, "\n    {}", diff)?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub generated_at: String,
    pub mode: RunMode,
    pub aborted: bool,
    pub scenarios: Vec<ScenarioEntry>,
}

impl RunSummary {
    pub fn new(mode: RunMode, aborted: bool) -> Self {
        Self {
            generated_at: Utc::now().to_rfc3339(),
            mode,
            aborted,
            scenarios: Vec::new(),
        }
    }

    pub fn push(
        &mut self,
        name: &str,
        result: &Result<CaptureResult, CaptureError>,
    ) -> &mut ScenarioEntry {
        let (captured, error, buffers) = match result {
            Ok(capture) => (
                true,
                None,
                capture.buffers().map(|(name, _)| name.to_string()).collect(),
            ),
            Err(e) => (
                false,
                Some(e.to_string()),
                e.partial.buffers().map(|(name, _)| name.to_string()).collect(),
            ),
        };
        self.scenarios.push(ScenarioEntry {
            name: name.to_string(),
            captured,
            error,
            buffers,
            mismatches: Vec::new(),
            register_diffs: Vec::new(),
            verified: None,
        });
        let last = self.scenarios.len() - 1;
        &mut self.scenarios[last]
    }

    pub fn failures(&self) -> usize {
        self.scenarios.iter().filter(|s| !s.passed()).count()
    }

    pub fn passed(&self) -> bool {
        !self.aborted && self.failures() == 0
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("writing {}", path.display()))
    }
}
