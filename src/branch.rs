//! Branch model: one concrete, linear execution path

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StepError;
use crate::step::Step;

/// An owned, ordered sequence of steps representing one end-to-end path
/// through the tree, plus the hook branches attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// Dispatch bookkeeping key; the tree source tracks cursors and
    /// in-flight state by id
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    #[serde(default)]
    pub steps: Vec<Step>,

    /// Branch that must run before this one, if any
    #[serde(default)]
    pub prev_sequential_branch: Option<Box<Branch>>,

    /// After-Every-Branch hook branches
    #[serde(default)]
    pub after_branches: Vec<Branch>,

    /// After-Every-Step hook branches
    #[serde(default)]
    pub after_every_step: Vec<Branch>,

    /// Opaque scheduling tag, consumed only by the external tree source
    #[serde(default)]
    pub frequency: Option<String>,

    // Terminal result fields
    #[serde(default)]
    pub is_passed: Option<bool>,
    #[serde(default)]
    pub error: Option<StepError>,
    #[serde(default)]
    pub log: String,
}

impl Branch {
    pub fn new() -> Self {
        Branch {
            id: Uuid::new_v4(),
            steps: Vec::new(),
            prev_sequential_branch: None,
            after_branches: Vec::new(),
            after_every_step: Vec::new(),
            frequency: None,
            is_passed: None,
            error: None,
            log: String::new(),
        }
    }

    pub fn with_steps(steps: Vec<Step>) -> Self {
        let mut b = Branch::new();
        b.steps = steps;
        b
    }

    /// Non-destructive append: copies of `other`'s steps, in order, land at
    /// the end of `self`. `other` is left untouched.
    pub fn merge_to_end(&mut self, other: &Branch) {
        self.steps.extend(other.steps.iter().cloned());
    }

    /// Append a line to this branch's accumulated log
    pub fn append_log(&mut self, line: &str) {
        self.log.push_str(line);
        self.log.push('\n');
    }
}

impl Default for Branch {
    fn default() -> Self {
        Branch::new()
    }
}

// Branch derives Clone: the derive is already a pure deep structural copy
// (steps, prev_sequential_branch, and every hook branch are owned), so
// mutating outcome fields on a clone can never touch the source.

#[cfg(test)]
mod tests {
    use super::*;

    fn step(text: &str) -> Step {
        Step::new(text)
    }

    #[test]
    fn merge_to_end_appends_in_order() {
        let mut branch1 = Branch::with_steps(vec![step("A")]);
        let branch2 = Branch::with_steps(vec![step("B"), step("C")]);

        branch1.merge_to_end(&branch2);

        let texts: Vec<&str> = branch1.steps.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["A", "B", "C"]);
        assert_eq!(branch1.steps.len(), 3);
        // other branch unmodified
        assert_eq!(branch2.steps.len(), 2);
        assert_eq!(branch2.steps[0].text, "B");
    }

    #[test]
    fn clones_an_empty_branch() {
        let branch = Branch::new();
        let cloned = branch.clone();

        assert!(cloned.steps.is_empty());
        assert!(cloned.prev_sequential_branch.is_none());
        assert!(cloned.after_branches.is_empty());
        assert!(cloned.frequency.is_none());
        assert_eq!(branch.steps.len(), 0);
    }

    #[test]
    fn clones_a_branch_with_steps() {
        let branch = Branch::with_steps(vec![step("A"), step("B")]);
        let cloned = branch.clone();

        assert_eq!(cloned.steps.len(), 2);
        assert_eq!(cloned.steps[0].text, "A");
        assert_eq!(cloned.steps[1].text, "B");
        // source untouched
        assert_eq!(branch.steps.len(), 2);
        assert_eq!(branch.steps[0].text, "A");
    }

    #[test]
    fn clones_a_branch_with_all_member_vars_set() {
        let prev = Branch::with_steps(vec![step("C")]);
        let after1 = Branch::with_steps(vec![step("D"), step("E")]);
        let after2 = Branch::with_steps(vec![step("F")]);

        let mut branch = Branch::with_steps(vec![step("A"), step("B")]);
        branch.prev_sequential_branch = Some(Box::new(prev));
        branch.after_branches = vec![after1, after2];
        branch.frequency = Some("high".to_string());

        let cloned = branch.clone();

        assert_eq!(cloned.steps.len(), 2);
        let cloned_prev = cloned.prev_sequential_branch.as_ref().unwrap();
        assert_eq!(cloned_prev.steps[0].text, "C");
        assert_eq!(cloned.after_branches.len(), 2);
        assert_eq!(cloned.after_branches[0].steps[1].text, "E");
        assert_eq!(cloned.after_branches[1].steps[0].text, "F");
        assert_eq!(cloned.frequency.as_deref(), Some("high"));

        // source fully intact
        assert_eq!(branch.steps.len(), 2);
        assert_eq!(branch.after_branches.len(), 2);
        assert_eq!(
            branch.prev_sequential_branch.as_ref().unwrap().steps[0].text,
            "C"
        );
    }

    #[test]
    fn clone_outcome_mutation_is_independent() {
        let branch = Branch::with_steps(vec![step("A")]);
        let mut cloned = branch.clone();

        cloned.steps[0].is_passed = Some(false);
        cloned.steps[0].error = Some(crate::error::StepError::new("x", "f", 1));
        cloned.is_passed = Some(false);

        assert_eq!(branch.steps[0].is_passed, None);
        assert!(branch.steps[0].error.is_none());
        assert_eq!(branch.is_passed, None);
    }
}
