//! Tree source interface and the in-memory implementation
//!
//! The tree of candidate branches is built by an external compiler; the
//! engine only pulls from it. `TreeSource` is the seam: it owns branch
//! dispatch (including the `Wait` back-pressure signal when concurrent
//! instances have drained the queue but work is still in flight), per-branch
//! step cursors, and result bookkeeping. At-most-one-dispatch of a branch is
//! the tree source's obligation, not the engine's.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::branch::Branch;
use crate::error::StepError;

/// What `next_branch()` hands back
#[derive(Debug)]
pub enum Dispatch {
    /// A branch to execute; the caller owns it for the duration of the run
    Branch(Branch),
    /// Nothing available right now, but other instances still hold work;
    /// back off and retry
    Wait,
    /// No more work anywhere
    Done,
}

/// External tree collaborator, shared by all concurrent run instances
pub trait TreeSource: Send + Sync {
    fn next_branch(&self) -> Dispatch;

    /// Next step index to execute within `branch`, or `None` when the branch
    /// is complete (also the point where the branch's terminal result is
    /// recorded)
    fn next_step(&self, branch: &mut Branch) -> Option<usize>;

    /// Record one step's outcome on `branch.steps[idx]`
    #[allow(clippy::too_many_arguments)]
    fn mark_step(
        &self,
        branch: &mut Branch,
        idx: usize,
        is_passed: bool,
        as_expected: bool,
        error: Option<StepError>,
        fail_branch_now: bool,
        is_hook_step: bool,
    );

    /// Record a branch-level result (used for failures with no owning step)
    fn mark_branch(&self, branch: &mut Branch, is_passed: bool);
}

/// Run counters kept by the in-memory tree
#[derive(Debug, Clone, Default, Serialize)]
pub struct TreeStats {
    pub branches_dispatched: usize,
    pub branches_passed: usize,
    pub branches_failed: usize,
    pub steps_passed: usize,
    pub steps_failed: usize,
    /// Steps whose outcome was not as expected (reportable defects)
    pub defects: usize,
}

struct TreeState {
    pending: VecDeque<Branch>,
    cursors: HashMap<Uuid, usize>,
    in_flight: HashSet<Uuid>,
    /// Terminal result per branch id; re-recording flips the counters
    results: HashMap<Uuid, bool>,
    stats: TreeStats,
}

/// FIFO tree source over a pre-built branch list
pub struct InMemoryTree {
    state: Mutex<TreeState>,
    started_at: DateTime<Utc>,
}

impl InMemoryTree {
    pub fn new(branches: Vec<Branch>) -> Self {
        InMemoryTree {
            state: Mutex::new(TreeState {
                pending: branches.into(),
                cursors: HashMap::new(),
                in_flight: HashSet::new(),
                results: HashMap::new(),
                stats: TreeStats::default(),
            }),
            started_at: Utc::now(),
        }
    }

    pub fn stats(&self) -> TreeStats {
        self.state.lock().expect("tree lock").stats.clone()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

fn record_result(state: &mut TreeState, id: Uuid, passed: bool) {
    match state.results.insert(id, passed) {
        Some(prev) if prev == passed => {}
        Some(true) => {
            state.stats.branches_passed -= 1;
            state.stats.branches_failed += 1;
        }
        Some(false) => {
            state.stats.branches_failed -= 1;
            state.stats.branches_passed += 1;
        }
        None => {
            if passed {
                state.stats.branches_passed += 1;
            } else {
                state.stats.branches_failed += 1;
            }
        }
    }
}

impl TreeSource for InMemoryTree {
    fn next_branch(&self) -> Dispatch {
        let mut state = self.state.lock().expect("tree lock");
        if let Some(branch) = state.pending.pop_front() {
            state.in_flight.insert(branch.id);
            state.cursors.insert(branch.id, 0);
            state.stats.branches_dispatched += 1;
            tracing::debug!(branch = %branch.id, "dispatching branch");
            Dispatch::Branch(branch)
        } else if !state.in_flight.is_empty() {
            Dispatch::Wait
        } else {
            Dispatch::Done
        }
    }

    fn next_step(&self, branch: &mut Branch) -> Option<usize> {
        let mut state = self.state.lock().expect("tree lock");

        // A fail-branch-now error skips the remaining steps
        let exhausted = branch.is_passed == Some(false)
            || *state.cursors.entry(branch.id).or_insert(0) >= branch.steps.len();

        if exhausted {
            if state.in_flight.remove(&branch.id) {
                let passed = branch
                    .is_passed
                    .unwrap_or_else(|| branch.steps.iter().all(|s| s.as_expected == Some(true)));
                branch.is_passed = Some(passed);
                record_result(&mut state, branch.id, passed);
                tracing::debug!(branch = %branch.id, passed, "branch complete");
            }
            return None;
        }

        let cursor = state.cursors.get_mut(&branch.id).expect("cursor present");
        let idx = *cursor;
        *cursor += 1;
        Some(idx)
    }

    fn mark_step(
        &self,
        branch: &mut Branch,
        idx: usize,
        is_passed: bool,
        as_expected: bool,
        error: Option<StepError>,
        fail_branch_now: bool,
        is_hook_step: bool,
    ) {
        let step = &mut branch.steps[idx];
        step.is_passed = Some(is_passed);
        step.as_expected = Some(as_expected);
        step.error = error.clone();

        let mut state = self.state.lock().expect("tree lock");
        if !is_hook_step {
            if is_passed {
                state.stats.steps_passed += 1;
            } else {
                state.stats.steps_failed += 1;
            }
            if !is_passed || !as_expected {
                state.stats.defects += 1;
            }
        }
        drop(state);

        if fail_branch_now {
            branch.error = error;
            self.mark_branch(branch, false);
        }
    }

    fn mark_branch(&self, branch: &mut Branch, is_passed: bool) {
        branch.is_passed = Some(is_passed);
        let mut state = self.state.lock().expect("tree lock");
        // Only adjust counters once the branch has a recorded result or is
        // being failed ahead of completion
        if state.results.contains_key(&branch.id) || !is_passed {
            record_result(&mut state, branch.id, is_passed);
        }
    }
}
