//! Step-level error diagnostics
//!
//! All execution failures (fragment evaluation, undefined variables, scope
//! bookkeeping) funnel through a single `StepError` shape carrying the source
//! location of the step that owns the failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A failure attributed to a step (or, wholesale, to a branch).
///
/// `fail_branch_now` requests that the owning branch fail immediately,
/// skipping its remaining steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message} [{filename}:{line_number}]")]
pub struct StepError {
    pub message: String,
    pub filename: String,
    pub line_number: u32,
    #[serde(default)]
    pub fail_branch_now: bool,
}

impl StepError {
    pub fn new(message: impl Into<String>, filename: impl Into<String>, line_number: u32) -> Self {
        StepError {
            message: message.into(),
            filename: filename.into(),
            line_number,
            fail_branch_now: false,
        }
    }

    pub fn fail_branch_now(mut self) -> Self {
        self.fail_branch_now = true;
        self
    }
}
