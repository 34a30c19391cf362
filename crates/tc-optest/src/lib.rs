#![forbid(unsafe_code)]

mod case;
mod compare;
mod gate;
mod lifecycle;
mod logging;
mod matmul;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tc_device::Target;
use tc_runtime::EvidenceLedger;
use thiserror::Error;

pub use case::{CaseError, CaseInput, CaseSpec, InputSpec, TestCase, init_case};
pub use compare::{
    CompareError, TensorComparison, TensorKind, ToleranceSpec, ToleranceViolation,
    compare_tensors,
};
pub use gate::{CapabilityGate, CapabilityProbe, GateDecision};
pub use lifecycle::{CaseLifecycle, CaseState, LifecycleError};
pub use logging::{CASE_LOG_SCHEMA_VERSION, StructuredCaseLog, write_jsonl};
pub use matmul::{
    CaseFailure, CompiledProgram, ExecutionResult, MATMUL_FIXTURE, MatmulSuite, ReferenceProgram,
    SuiteFixture, build_compiled, build_reference,
};

const MAX_FIXTURE_BYTES: u64 = 1_048_576;

pub const SEED_ENV: &str = "TC_OPTEST_SEED";
pub const ATOL_ENV: &str = "TC_OPTEST_ATOL";
pub const RTOL_ENV: &str = "TC_OPTEST_RTOL";
pub const CHECK_GRADS_ENV: &str = "TC_OPTEST_CHECK_GRADS";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HarnessError {
    #[error("failed reading {}: {message}", path.display())]
    Io { path: PathBuf, message: String },
    #[error("fixture {} exceeds max bytes: actual={actual} max={max}", path.display())]
    FixtureTooLarge { path: PathBuf, actual: u64, max: u64 },
    #[error("failed parsing fixture {}: {message}", path.display())]
    FixtureParse { path: PathBuf, message: String },
    #[error("failed to serialize {what}: {message}")]
    Serialize { what: &'static str, message: String },
    #[error("invalid {var}={value:?}: {message}")]
    Config {
        var: &'static str,
        value: String,
        message: String,
    },
}

/// Per-field tolerance overrides layered on top of a suite's fixture values.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ToleranceOverride {
    pub atol: Option<f64>,
    pub rtol: Option<f64>,
    pub check_grads: Option<bool>,
}

impl ToleranceOverride {
    #[must_use]
    pub fn apply(&self, base: ToleranceSpec) -> ToleranceSpec {
        ToleranceSpec {
            atol: self.atol.unwrap_or(base.atol),
            rtol: self.rtol.unwrap_or(base.rtol),
            check_grads: self.check_grads.unwrap_or(base.check_grads),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub log_path: Option<PathBuf>,
    pub seed: Option<u64>,
    pub tolerance: ToleranceOverride,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            log_path: None,
            seed: None,
            tolerance: ToleranceOverride::default(),
        }
    }

    /// Default paths overlaid with `TC_OPTEST_*` environment variables.
    pub fn from_env() -> Result<Self, HarnessError> {
        Self::default_paths().with_overrides(|var| std::env::var(var).ok())
    }

    /// Applies overrides read through `lookup`; unset variables keep the
    /// current value.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, HarnessError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(seed) = parse_var(&lookup, SEED_ENV, |raw| raw.parse::<u64>().ok())? {
            self.seed = Some(seed);
        }
        if let Some(atol) = parse_var(&lookup, ATOL_ENV, parse_tolerance)? {
            self.tolerance.atol = Some(atol);
        }
        if let Some(rtol) = parse_var(&lookup, RTOL_ENV, parse_tolerance)? {
            self.tolerance.rtol = Some(rtol);
        }
        if let Some(check) = parse_var(&lookup, CHECK_GRADS_ENV, parse_flag)? {
            self.tolerance.check_grads = Some(check);
        }
        Ok(self)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

fn parse_var<F, T>(
    lookup: &F,
    var: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, HarnessError>
where
    F: Fn(&'static str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    parse(raw.trim()).map(Some).ok_or_else(|| HarnessError::Config {
        var,
        value: raw.clone(),
        message: "unparseable value".to_owned(),
    })
}

fn parse_tolerance(raw: &str) -> Option<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value >= 0.0)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Skip,
}

impl Verdict {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GradCheck {
    Compared,
    /// The compiled path has no gradient support; not a failure.
    Exempt { reason: String },
    NotRequested,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseReport {
    pub suite: String,
    pub case: String,
    pub verdict: Verdict,
    pub input_shapes: String,
    pub output_shape: Option<Vec<usize>>,
    pub comparisons: Vec<TensorComparison>,
    /// `None` when the case ended before gradients were compared.
    pub grad_check: Option<GradCheck>,
    pub diagnostic: Option<String>,
    pub state_trail: Vec<CaseState>,
    pub evidence: EvidenceLedger,
    #[serde(skip)]
    pub forensic_log: StructuredCaseLog,
}

impl CaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuiteReport {
    pub suite: String,
    pub target: Target,
    pub gate: GateDecision,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cases: Vec<CaseReport>,
}

impl SuiteReport {
    #[must_use]
    pub fn new(suite: &str, target: Target, gate: GateDecision, cases: Vec<CaseReport>) -> Self {
        let count = |verdict: Verdict| cases.iter().filter(|case| case.verdict == verdict).count();
        Self {
            suite: suite.to_owned(),
            target,
            gate,
            total: cases.len(),
            passed: count(Verdict::Pass),
            failed: count(Verdict::Fail),
            skipped: count(Verdict::Skip),
            cases,
        }
    }

    /// No case failed. A fully skipped suite is green.
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.failed == 0
    }

    #[must_use]
    pub fn case(&self, name: &str) -> Option<&CaseReport> {
        self.cases.iter().find(|case| case.case == name)
    }

    #[must_use]
    pub fn forensic_logs(&self) -> Vec<StructuredCaseLog> {
        self.cases
            .iter()
            .map(|case| case.forensic_log.clone())
            .collect()
    }
}

pub fn load_fixture<T>(path: &Path) -> Result<T, HarnessError>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| HarnessError::Io {
        path: path.to_path_buf(),
        message: error.to_string(),
    })?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(HarnessError::FixtureTooLarge {
            path: path.to_path_buf(),
            actual: size,
            max: MAX_FIXTURE_BYTES,
        });
    }

    let raw = fs::read_to_string(path).map_err(|error| HarnessError::Io {
        path: path.to_path_buf(),
        message: error.to_string(),
    })?;
    serde_json::from_str::<T>(&raw).map_err(|error| HarnessError::FixtureParse {
        path: path.to_path_buf(),
        message: error.to_string(),
    })
}

pub fn load_matmul_suite(config: &HarnessConfig) -> Result<MatmulSuite, HarnessError> {
    let fixture: SuiteFixture = load_fixture(&config.fixture_root.join(MATMUL_FIXTURE))?;
    Ok(MatmulSuite::new(fixture, config))
}

/// Loads the matmul fixture, runs it and, when the config names a log path,
/// writes one JSONL line per case there.
pub fn run_matmul_suite(config: &HarnessConfig) -> Result<SuiteReport, HarnessError> {
    let report = load_matmul_suite(config)?.run();
    if let Some(path) = &config.log_path {
        write_jsonl(path, &report.forensic_logs())?;
    }
    Ok(report)
}
