use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Per-case state. `Skip` is only reachable from `Init`; `Fail` from any
/// non-terminal state; `Pass` only from `Compared`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    Init,
    BuiltReference,
    BuiltCompiled,
    ExecutedBoth,
    Compared,
    Pass,
    Fail,
    Skip,
}

impl CaseState {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::BuiltReference => "BUILT_REFERENCE",
            Self::BuiltCompiled => "BUILT_COMPILED",
            Self::ExecutedBoth => "EXECUTED_BOTH",
            Self::Compared => "COMPARED",
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Skip => "SKIP",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Pass | Self::Fail | Self::Skip)
    }

    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Init, Self::BuiltReference | Self::Skip)
                | (Self::BuiltReference, Self::BuiltCompiled)
                | (Self::BuiltCompiled, Self::ExecutedBoth)
                | (Self::ExecutedBoth, Self::Compared)
                | (Self::Compared, Self::Pass)
        ) || (!self.is_terminal() && matches!(next, Self::Fail))
    }
}

impl fmt::Display for CaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal case transition {from} -> {to}")]
pub struct LifecycleError {
    pub from: CaseState,
    pub to: CaseState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseLifecycle {
    trail: Vec<CaseState>,
}

impl Default for CaseLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl CaseLifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            trail: vec![CaseState::Init],
        }
    }

    #[must_use]
    pub fn state(&self) -> CaseState {
        self.trail.last().copied().unwrap_or(CaseState::Init)
    }

    #[must_use]
    pub fn trail(&self) -> &[CaseState] {
        &self.trail
    }

    pub fn advance(&mut self, next: CaseState) -> Result<(), LifecycleError> {
        let from = self.state();
        if !from.can_advance_to(next) {
            return Err(LifecycleError { from, to: next });
        }
        self.trail.push(next);
        Ok(())
    }
}
