//! Finding types produced by analysis passes and tracked by the review queue.
//!
//! ## Types
//!
//! - [`Severity`]: four-level severity, ordered most severe first
//! - [`Finding`]: one issue at a location, keyed by pass + file + line + description
//! - [`PassReport`]: the raw output of one analysis pass
//! - [`SeverityCounts`]: open findings bucketed by severity
//!
//! ## Example
//!
//! ```
//! use conductor::review::{Finding, Severity};
//!
//! let finding = Finding::new("security", Severity::High, "src/auth.rs", "Token logged in plain text")
//!     .with_line(42)
//!     .with_suggestion("Redact the token before logging");
//!
//! assert!(finding.is_open());
//! assert_eq!(finding.location(), "src/auth.rs:42");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a finding.
///
/// The derived ordering puts `Critical` first, so sorting ascending yields
/// the order in which fixes are applied.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
    ];

    /// The more severe of `self` and `other`.
    pub fn max_severity(self, other: Severity) -> Severity {
        self.min(other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a finding still needs a fix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingStatus {
    #[default]
    Open,
    FalsePositive,
}

/// Identity of a finding within a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FindingKey {
    pub pass: String,
    pub file: String,
    pub line: Option<u32>,
    pub description: String,
}

/// A single issue reported by an analysis pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub pass: String,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub severity: Severity,
    #[serde(default)]
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub suggestion: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub status: FindingStatus,
}

fn default_confidence() -> f64 {
    1.0
}

impl Finding {
    pub fn new(
        pass: impl Into<String>,
        severity: Severity,
        file: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            pass: pass.into(),
            file: file.into(),
            line: None,
            severity,
            category: String::new(),
            description: description.into(),
            suggestion: String::new(),
            confidence: default_confidence(),
            status: FindingStatus::Open,
        }
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = suggestion.into();
        self
    }

    /// Set the confidence, clamped to `0.0..=1.0`.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        self
    }

    pub fn false_positive(mut self) -> Self {
        self.status = FindingStatus::FalsePositive;
        self
    }

    pub fn key(&self) -> FindingKey {
        FindingKey {
            pass: self.pass.clone(),
            file: self.file.clone(),
            line: self.line,
            description: self.description.clone(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == FindingStatus::Open
    }

    pub fn location(&self) -> String {
        match self.line {
            Some(line) => format!("{}:{}", self.file, line),
            None => self.file.clone(),
        }
    }

    /// Fold a later duplicate into this finding.
    ///
    /// Keeps the more severe severity and the higher confidence; status and
    /// suggestion follow the later report.
    pub fn merge(&mut self, later: Finding) {
        self.severity = self.severity.max_severity(later.severity);
        self.confidence = self.confidence.max(later.confidence);
        self.status = later.status;
        if !later.suggestion.is_empty() {
            self.suggestion = later.suggestion;
        }
        if self.category.is_empty() {
            self.category = later.category;
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: {}",
            self.severity,
            self.pass,
            self.location(),
            self.description
        )
    }
}

/// One finding as reported on the analysis pass wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassFinding {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub severity: Severity,
    #[serde(default)]
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub suggestion: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub false_positive: bool,
}

/// Output of one analysis pass over a scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub pass: String,
    #[serde(default)]
    pub findings: Vec<PassFinding>,
}

impl PassReport {
    pub fn new(pass: impl Into<String>) -> Self {
        Self {
            pass: pass.into(),
            findings: Vec::new(),
        }
    }

    pub fn with_finding(mut self, finding: PassFinding) -> Self {
        self.findings.push(finding);
        self
    }

    /// Convert to queue findings. Anything below `min_confidence` is flagged
    /// as a false positive.
    pub fn into_findings(self, min_confidence: f64) -> Vec<Finding> {
        let pass = self.pass;
        self.findings
            .into_iter()
            .map(|raw| {
                let finding = Finding::new(pass.clone(), raw.severity, raw.file, raw.description)
                    .with_category(raw.category)
                    .with_suggestion(raw.suggestion)
                    .with_confidence(raw.confidence);
                let finding = match raw.line {
                    Some(line) => finding.with_line(line),
                    None => finding,
                };
                if raw.false_positive || finding.confidence < min_confidence {
                    finding.false_positive()
                } else {
                    finding
                }
            })
            .collect()
    }
}

impl PassFinding {
    pub fn new(severity: Severity, file: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: None,
            severity,
            category: String::new(),
            description: description.into(),
            suggestion: String::new(),
            confidence: default_confidence(),
            false_positive: false,
        }
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

/// Open findings counted per severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl SeverityCounts {
    /// Count the open findings in `findings`; false positives are ignored.
    pub fn from_open<'a>(findings: impl IntoIterator<Item = &'a Finding>) -> Self {
        let mut counts = Self::default();
        for finding in findings.into_iter().filter(|f| f.is_open()) {
            *counts.slot(finding.severity) += 1;
        }
        counts
    }

    fn slot(&mut self, severity: Severity) -> &mut u32 {
        match severity {
            Severity::Critical => &mut self.critical,
            Severity::High => &mut self.high,
            Severity::Medium => &mut self.medium,
            Severity::Low => &mut self.low,
        }
    }

    pub fn get(&self, severity: Severity) -> u32 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        }
    }

    pub fn total(&self) -> u32 {
        self.critical + self.high + self.medium + self.low
    }
}

impl fmt::Display for SeverityCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "critical: {}, high: {}, medium: {}, low: {}",
            self.critical, self.high, self.medium, self.low
        )
    }
}
