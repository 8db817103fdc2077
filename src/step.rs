//! Step model and outcome classification

use serde::{Deserialize, Serialize};

use crate::error::StepError;

/// One variable assignment declared by a step, e.g. `{x}='foo'`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarBeingSet {
    pub name: String,
    /// Literal value as written (quotes included) when the step has no code
    /// fragment; ignored for fragment-backed assignments.
    #[serde(default)]
    pub value: String,
    /// true for `{{x}}` (local), false for `{x}` (global)
    #[serde(default)]
    pub is_local: bool,
}

/// Smallest unit of execution.
///
/// Structural fields are fixed once a branch is handed out for execution;
/// only the outcome fields (`is_passed`, `as_expected`, `error`, `log`)
/// mutate, and they mutate in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub text: String,

    /// Embedded code fragment, evaluated by the sandboxed fragment evaluator
    #[serde(default)]
    pub code_block: Option<String>,

    #[serde(default)]
    pub vars_being_set: Vec<VarBeingSet>,

    /// Nesting depth within the branch; drives local frame push/pop
    #[serde(default)]
    pub branch_indents: u32,

    #[serde(default)]
    pub is_function_call: bool,

    /// Breakpoint: pause before executing this step
    #[serde(default)]
    pub is_debug: bool,

    /// Pass/fail criteria invert for this step
    #[serde(default)]
    pub is_expected_fail: bool,

    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub line_number: u32,

    // Outcome fields, mutated in place during execution
    #[serde(default)]
    pub is_passed: Option<bool>,
    #[serde(default)]
    pub as_expected: Option<bool>,
    #[serde(default)]
    pub error: Option<StepError>,
    #[serde(default)]
    pub log: String,
}

impl Step {
    pub fn new(text: impl Into<String>) -> Self {
        Step {
            text: text.into(),
            code_block: None,
            vars_being_set: Vec::new(),
            branch_indents: 0,
            is_function_call: false,
            is_debug: false,
            is_expected_fail: false,
            filename: String::new(),
            line_number: 0,
            is_passed: None,
            as_expected: None,
            error: None,
            log: String::new(),
        }
    }

    /// Append a line to this step's accumulated log
    pub fn append_log(&mut self, line: &str) {
        self.log.push_str(line);
        self.log.push('\n');
    }
}

/// Classified result of one step execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub is_passed: bool,
    pub as_expected: bool,
    pub error: Option<StepError>,
}

impl Outcome {
    /// Combine the two outcome axes (pass/fail and expected/unexpected).
    ///
    /// | expected-fail | error | is_passed | as_expected |
    /// |---|---|---|---|
    /// | false | yes | false | false |
    /// | false | no  | true  | true  |
    /// | true  | yes | false | true  |
    /// | true  | no  | true  | false (error synthesized) |
    pub fn classify(step: &Step, error: Option<StepError>) -> Outcome {
        if step.is_expected_fail {
            match error {
                Some(e) => Outcome {
                    is_passed: false,
                    as_expected: true,
                    error: Some(e),
                },
                None => Outcome {
                    is_passed: true,
                    as_expected: false,
                    error: Some(StepError::new(
                        "This step passed, but it was expected to fail (#)",
                        step.filename.clone(),
                        step.line_number,
                    )),
                },
            }
        } else {
            match error {
                Some(e) => Outcome {
                    is_passed: false,
                    as_expected: false,
                    error: Some(e),
                },
                None => Outcome {
                    is_passed: true,
                    as_expected: true,
                    error: None,
                },
            }
        }
    }

    /// A reportable defect is anything not as expected
    pub fn is_defect(&self) -> bool {
        !self.is_passed || !self.as_expected
    }
}
