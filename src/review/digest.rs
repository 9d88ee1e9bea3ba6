//! Order-independent fingerprint of the open finding set, used for stall detection.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::findings::{Finding, Severity};

/// Which finding fields feed the stall digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestMode {
    /// Pass, file, line, severity and the normalized description.
    #[default]
    Full,
    /// Pass, file, line and severity. Rewording a description does not
    /// count as progress.
    Location,
}

#[derive(Serialize, PartialEq, Eq, PartialOrd, Ord)]
struct DigestEntry<'a> {
    pass: &'a str,
    file: &'a str,
    line: Option<u32>,
    severity: Severity,
    description: Option<String>,
}

/// Lowercase and collapse whitespace runs.
fn normalize(description: &str) -> String {
    description
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// SHA-256 over the sorted open findings, as lowercase hex.
///
/// False positives are excluded. Two sets with the same members digest
/// equally regardless of order or duplicate entries.
pub fn open_set_digest(items: &[Finding], mode: DigestMode) -> String {
    let mut entries: Vec<DigestEntry<'_>> = items
        .iter()
        .filter(|f| f.is_open())
        .map(|f| DigestEntry {
            pass: &f.pass,
            file: &f.file,
            line: f.line,
            severity: f.severity,
            description: match mode {
                DigestMode::Full => Some(normalize(&f.description)),
                DigestMode::Location => None,
            },
        })
        .collect();
    entries.sort();
    entries.dedup();

    let mut hasher = Sha256::new();
    for entry in &entries {
        // Struct fields serialize in declaration order, so each line is canonical.
        let line = serde_json::to_vec(entry)
            .expect("digest entry holds only strings, integers and unit variants");
        hasher.update(&line);
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
