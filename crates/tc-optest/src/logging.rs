use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tc_runtime::{EvidenceEntry, now_unix_ms};

use crate::HarnessError;

pub const CASE_LOG_SCHEMA_VERSION: &str = "tc-optest/case-log/v1";

/// One machine-readable line per case, written as JSONL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredCaseLog {
    pub schema_version: &'static str,
    pub ts_unix_ms: u128,
    pub suite_id: String,
    pub case_id: String,
    pub fixture_id: String,
    pub target: String,
    pub seed: Option<u64>,
    pub outcome: &'static str,
    pub reason_code: String,
    pub replay_command: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &str,
        case_id: &str,
        fixture_id: &str,
        target: &str,
        seed: Option<u64>,
        outcome: &'static str,
        reason_code: impl Into<String>,
    ) -> Self {
        let seed_arg = seed.map_or_else(String::new, |seed| format!(" --seed {seed}"));
        Self {
            schema_version: CASE_LOG_SCHEMA_VERSION,
            ts_unix_ms: now_unix_ms(),
            suite_id: suite_id.to_owned(),
            case_id: case_id.to_owned(),
            fixture_id: fixture_id.to_owned(),
            target: target.to_owned(),
            seed,
            outcome,
            reason_code: reason_code.into(),
            replay_command: format!(
                "cargo run -p tc-optest --bin run_matmul_parity -- --target {target}{seed_arg}"
            ),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extra_fields(mut self, extra_fields: BTreeMap<String, Value>) -> Self {
        self.extra_fields.extend(extra_fields);
        self
    }
}

pub(crate) fn evidence_field(entries: &[EvidenceEntry]) -> Value {
    Value::Array(
        entries
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "kind": entry.kind.label(),
                    "summary": entry.summary,
                })
            })
            .collect(),
    )
}

/// Writes `logs` as JSON lines, creating parent directories as needed.
pub fn write_jsonl(path: &Path, logs: &[StructuredCaseLog]) -> Result<(), HarnessError> {
    let mut lines = String::new();
    for entry in logs {
        let line = serde_json::to_string(entry).map_err(|error| HarnessError::Serialize {
            what: "structured case log",
            message: error.to_string(),
        })?;
        lines.push_str(&line);
        lines.push('\n');
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| HarnessError::Io {
            path: parent.to_path_buf(),
            message: error.to_string(),
        })?;
    }
    fs::write(path, lines).map_err(|error| HarnessError::Io {
        path: path.to_path_buf(),
        message: error.to_string(),
    })
}
