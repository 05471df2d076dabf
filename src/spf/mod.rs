//! SPF (RFC 7208): record parsing, the macro language, and the `check_host`
//! evaluator with its lookup budgets.

mod eval;
mod macros;
mod record;

use thiserror::Error;

pub use eval::{check_host, SpfEvaluator};
pub use macros::{
    expand_tokens, parse_macro_string, MacroContext, MacroExpr, MacroPurpose, MacroToken,
};
pub use record::{Mechanism, MechanismEntry, Modifier, ModifierEntry, Qualifier, SpfRecord};

/// SPF evaluation status (RFC 7208 §2.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfStatus {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl std::fmt::Display for SpfStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SpfStatus::Pass => "pass",
            SpfStatus::Fail => "fail",
            SpfStatus::SoftFail => "softfail",
            SpfStatus::Neutral => "neutral",
            SpfStatus::None => "none",
            SpfStatus::TempError => "temperror",
            SpfStatus::PermError => "permerror",
        };
        f.write_str(s)
    }
}

/// The outcome of an SPF check: a status plus a human-readable reason. The
/// reason carries the `exp=` explanation on explained failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfResult {
    pub status: SpfStatus,
    pub reason: String,
}

impl SpfResult {
    pub fn new(status: SpfStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

/// A status-bearing failure raised while parsing or evaluating; converts
/// directly into the terminal [`SpfResult`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}: {reason}")]
pub struct SpfError {
    pub status: SpfStatus,
    pub reason: String,
}

impl SpfError {
    pub fn permerror(reason: impl Into<String>) -> Self {
        Self {
            status: SpfStatus::PermError,
            reason: reason.into(),
        }
    }

    pub fn temperror(reason: impl Into<String>) -> Self {
        Self {
            status: SpfStatus::TempError,
            reason: reason.into(),
        }
    }

    pub fn none(reason: impl Into<String>) -> Self {
        Self {
            status: SpfStatus::None,
            reason: reason.into(),
        }
    }
}

impl From<SpfError> for SpfResult {
    fn from(e: SpfError) -> Self {
        SpfResult {
            status: e.status,
            reason: e.reason,
        }
    }
}
