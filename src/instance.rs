//! Run instance: the execution loop
//!
//! One `RunInstance` is a logical thread walking the shared tree. It pulls
//! branches and steps from the tree source, maintains this instance's
//! scopes, evaluates embedded fragments, classifies outcomes, runs hook
//! branches, and cooperates with the pause policy at step boundaries.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::branch::Branch;
use crate::error::StepError;
use crate::fragment::eval_fragment;
use crate::resolver::{self, strip_quotes, ResolveCtx};
use crate::runner::Runner;
use crate::scope::Scopes;
use crate::step::Outcome;
use crate::tree::Dispatch;
use crate::value::Val;

/// Fixed backoff while the tree source has no branch available
const WAIT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Idle,
    Running,
    Paused,
    Completed,
}

/// Where a step's failure lands when the step is not its own bookkeeping
/// target (hook steps, injected steps)
enum ErrorSink<'a> {
    /// Attribute to `branch.steps[idx]`
    Step(&'a mut Branch, usize),
    /// No owning step: attribute wholesale to the branch
    Branch(&'a mut Branch),
}

pub struct RunInstance {
    pub runner: Arc<Runner>,
    pub scopes: Scopes,
    state: ExecState,
    /// Branch currently being executed; retained across a pause for
    /// inspection and resume
    pub curr_branch: Option<Branch>,
    /// Index of the step most recently dispatched within `curr_branch`
    pub curr_step_idx: Option<usize>,
    /// Branches this instance has run to completion
    completed: Vec<Branch>,
    id: Uuid,
}

impl RunInstance {
    pub fn new(runner: Arc<Runner>) -> Self {
        let persistent = Arc::clone(&runner.persistent);
        RunInstance {
            runner,
            scopes: Scopes::new(persistent),
            state: ExecState::Idle,
            curr_branch: None,
            curr_step_idx: None,
            completed: Vec::new(),
            id: Uuid::new_v4(),
        }
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state == ExecState::Paused
    }

    pub fn completed_branches(&self) -> &[Branch] {
        &self.completed
    }

    /// Grab branches and steps from the tree source and execute them until
    /// nothing is left or a pause occurs.
    ///
    /// Returns `true` once everything is done, `false` if a pause returned
    /// control early (current branch/step stay inspectable on the instance).
    pub async fn run(&mut self) -> bool {
        self.state = ExecState::Running;
        tracing::debug!(instance = %self.id, "run instance starting");

        // Resume a branch left paused by an earlier run() call
        if let Some(mut branch) = self.curr_branch.take() {
            if !self.drive_branch(&mut branch) {
                self.curr_branch = Some(branch);
                return false;
            }
            self.completed.push(branch);
            self.scopes.reset_branch();
        }

        loop {
            match self.runner.tree.next_branch() {
                Dispatch::Wait => {
                    tracing::debug!(instance = %self.id, "no branch available, backing off");
                    tokio::time::sleep(WAIT_BACKOFF).await;
                }
                Dispatch::Done => break,
                Dispatch::Branch(mut branch) => {
                    if !self.drive_branch(&mut branch) {
                        self.curr_branch = Some(branch);
                        return false;
                    }
                    self.completed.push(branch);
                    // Clear branch-scoped variable state before the next one
                    self.scopes.reset_branch();
                }
            }
        }

        self.state = ExecState::Completed;
        tracing::debug!(instance = %self.id, branches = self.completed.len(), "run instance done");
        true
    }

    /// Execute a branch's steps and, on completion, its After-Every-Branch
    /// hooks. Returns false when a pause interrupted the branch.
    fn drive_branch(&mut self, branch: &mut Branch) -> bool {
        while let Some(idx) = self.runner.tree.next_step(branch) {
            self.curr_step_idx = Some(idx);
            self.run_step(branch, idx);
            if self.state == ExecState::Paused {
                return false;
            }
        }

        self.run_after_branch_hooks(branch);
        self.state != ExecState::Paused
    }

    /// Single-step protocol for a step on the main path: the step is its own
    /// error-attribution target.
    fn run_step(&mut self, branch: &mut Branch, idx: usize) {
        let Some(outcome) = self.execute_step_body(branch, idx) else {
            // Breakpoint: paused before executing
            return;
        };

        let fail_branch_now = outcome
            .error
            .as_ref()
            .map(|e| e.fail_branch_now)
            .unwrap_or(false);
        self.runner.tree.mark_step(
            branch,
            idx,
            outcome.is_passed,
            outcome.as_expected,
            outcome.error.clone(),
            fail_branch_now,
            false,
        );

        // One-shot: pause on the first failed or unexpected outcome
        if outcome.is_defect() && self.runner.take_pause_on_fail() {
            self.state = ExecState::Paused;
            return;
        }

        self.run_after_step_hooks(branch, idx);
        if self.state == ExecState::Paused {
            return;
        }

        self.runner.reporter.generate_report();

        // One-shot: pause after exactly one step
        if self.runner.take_run_one_step() {
            self.state = ExecState::Paused;
        }
    }

    /// Steps a–e of the protocol: breakpoint check, scope maintenance,
    /// assignment realization, fragment evaluation, outcome classification.
    ///
    /// Returns `None` when a breakpoint paused the instance before the step
    /// executed.
    fn execute_step_body(&mut self, branch: &mut Branch, idx: usize) -> Option<Outcome> {
        if branch.steps[idx].is_debug {
            self.state = ExecState::Paused;
            tracing::info!(instance = %self.id, step = %branch.steps[idx].text, "paused at breakpoint");
            return None;
        }

        let mut logs: Vec<String> = Vec::new();
        let mut error: Option<StepError> = None;

        // Adjust the local frame stack for the indent change since the
        // previous step in this branch
        if idx >= 1 {
            let prev = branch.steps[idx - 1].branch_indents;
            let cur = branch.steps[idx].branch_indents;
            if let Err(e) = self.scopes.shift_indent(prev, cur) {
                let step = &branch.steps[idx];
                error = Some(StepError::new(
                    e.to_string(),
                    step.filename.clone(),
                    step.line_number,
                ));
            }
        }

        // Plain assignment step: realize the declared literals now; lazy
        // forward realization stays with the resolver
        let has_code = branch.steps[idx].code_block.is_some();
        if error.is_none() && !has_code && !branch.steps[idx].vars_being_set.is_empty() {
            let decls = branch.steps[idx].vars_being_set.clone();
            for var in decls {
                let raw = strip_quotes(&var.value).to_string();
                let mut ctx = ResolveCtx {
                    scopes: &mut self.scopes,
                    logs: &mut logs,
                    fuel: self.runner.fragment_fuel,
                };
                match resolver::replace_vars(&mut ctx, &raw, branch, idx) {
                    Ok(text) => self.scopes.set(&var.name, var.is_local, Val::Str(text)),
                    Err(e) => {
                        error = Some(e);
                        break;
                    }
                }
            }
        }

        // Fragment evaluation in the sandboxed evaluator; failures become
        // the step's error and never propagate further
        if error.is_none() {
            if let Some(code) = branch.steps[idx].code_block.clone() {
                match eval_fragment(
                    &code,
                    &mut self.scopes,
                    &mut logs,
                    self.runner.fragment_fuel,
                ) {
                    Ok(ret) => {
                        // `{var} = Func` with a code block: the fragment's
                        // return value becomes the variable
                        let step = &branch.steps[idx];
                        if step.vars_being_set.len() == 1 {
                            let var = step.vars_being_set[0].clone();
                            self.scopes.set(&var.name, var.is_local, ret);
                        }
                    }
                    Err(e) => {
                        let step = &branch.steps[idx];
                        let mut se =
                            StepError::new(e.message, step.filename.clone(), step.line_number);
                        if e.fail_branch_now {
                            se = se.fail_branch_now();
                        }
                        error = Some(se);
                    }
                }
            }
        }

        for line in &logs {
            branch.steps[idx].append_log(line);
        }

        Some(Outcome::classify(&branch.steps[idx], error))
    }

    /// After-Every-Step hooks: target = the just-run step.
    fn run_after_step_hooks(&mut self, branch: &mut Branch, idx: usize) {
        if branch.after_every_step.is_empty() {
            return;
        }

        // Expose the triggering step's result to hook steps
        let step = &branch.steps[idx];
        self.scopes
            .set("successful", true, Val::Bool(step.is_passed.unwrap_or(false)));
        if let Some(e) = &step.error {
            self.scopes.set("error", true, Val::Str(e.message.clone()));
        }

        let mut hooks = std::mem::take(&mut branch.after_every_step);
        'outer: for hook in &mut hooks {
            for j in 0..hook.steps.len() {
                self.run_hook_step(hook, j, ErrorSink::Step(&mut *branch, idx));
                if self.state == ExecState::Paused {
                    break 'outer;
                }
            }
        }
        branch.after_every_step = hooks;
    }

    /// After-Every-Branch hooks: no owning step, failures attribute to the
    /// branch wholesale.
    fn run_after_branch_hooks(&mut self, branch: &mut Branch) {
        self.scopes.set(
            "successful",
            true,
            Val::Bool(branch.is_passed.unwrap_or(false)),
        );
        if let Some(e) = &branch.error {
            self.scopes.set("error", true, Val::Str(e.message.clone()));
        }

        let mut hooks = std::mem::take(&mut branch.after_branches);
        'outer: for hook in &mut hooks {
            for j in 0..hook.steps.len() {
                self.run_hook_step(hook, j, ErrorSink::Branch(&mut *branch));
                if self.state == ExecState::Paused {
                    break 'outer;
                }
            }
        }
        branch.after_branches = hooks;
    }

    /// Single-step protocol for a hook step. The outcome is always recorded
    /// on the hook step itself; a defect additionally lands on the sink.
    fn run_hook_step(&mut self, hook: &mut Branch, idx: usize, sink: ErrorSink<'_>) {
        let Some(outcome) = self.execute_step_body(hook, idx) else {
            return;
        };

        let step = &mut hook.steps[idx];
        step.is_passed = Some(outcome.is_passed);
        step.as_expected = Some(outcome.as_expected);
        step.error = outcome.error.clone();

        if outcome.is_defect() {
            let fail_branch_now = outcome
                .error
                .as_ref()
                .map(|e| e.fail_branch_now)
                .unwrap_or(false);
            match sink {
                ErrorSink::Step(target, target_idx) => {
                    self.runner.tree.mark_step(
                        target,
                        target_idx,
                        outcome.is_passed,
                        outcome.as_expected,
                        outcome.error.clone(),
                        fail_branch_now,
                        true,
                    );
                }
                ErrorSink::Branch(target) => {
                    if let Some(e) = &outcome.error {
                        target.error = Some(e.clone());
                        target.append_log(&format!("hook failure: {}", e));
                    }
                    self.runner.tree.mark_branch(target, false);
                }
            }
        }

        if outcome.is_defect() && self.runner.take_pause_on_fail() {
            self.state = ExecState::Paused;
            return;
        }

        self.runner.reporter.generate_report();
    }

    /// Run caller-supplied steps against the paused state, then stay paused.
    ///
    /// Injected steps take their own errors; they are outside the tree's
    /// pass/fail bookkeeping. No-op when the instance is not paused.
    pub fn inject_and_run(&mut self, branch: &mut Branch) {
        if self.state != ExecState::Paused {
            return;
        }

        for idx in 0..branch.steps.len() {
            let Some(outcome) = self.execute_step_body(branch, idx) else {
                continue;
            };
            self.runner.tree.mark_step(
                branch,
                idx,
                outcome.is_passed,
                outcome.as_expected,
                outcome.error,
                false,
                true,
            );
            self.runner.reporter.generate_report();
        }

        self.state = ExecState::Paused;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::{NoopReporter, Reporter};
    use crate::step::{Step, VarBeingSet};
    use crate::tree::InMemoryTree;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn plain(text: &str) -> Step {
        let mut s = Step::new(text);
        s.filename = "inst.trellis".to_string();
        s.line_number = 1;
        s
    }

    fn code(text: &str, fragment: &str) -> Step {
        let mut s = plain(text);
        s.code_block = Some(fragment.to_string());
        s
    }

    fn runner_for(branches: Vec<Branch>) -> Arc<Runner> {
        Arc::new(Runner::new(
            Arc::new(InMemoryTree::new(branches)),
            Arc::new(NoopReporter),
        ))
    }

    #[tokio::test]
    async fn runs_branches_to_completion() {
        let branch = Branch::with_steps(vec![plain("a"), code("b", "1 + 1")]);
        let runner = runner_for(vec![branch]);
        let mut instance = RunInstance::new(Arc::clone(&runner));

        assert!(instance.run().await);
        assert_eq!(instance.state(), ExecState::Completed);
        let done = &instance.completed_branches()[0];
        assert_eq!(done.is_passed, Some(true));
        assert_eq!(done.steps[1].as_expected, Some(true));
    }

    #[tokio::test]
    async fn breakpoint_pauses_before_executing() {
        let mut bp = code("stop here", "fail('must not run')");
        bp.is_debug = true;
        let branch = Branch::with_steps(vec![plain("a"), bp, plain("c")]);
        let runner = runner_for(vec![branch]);
        let mut instance = RunInstance::new(Arc::clone(&runner));

        assert!(!instance.run().await);
        assert!(instance.is_paused());

        let paused = instance.curr_branch.as_ref().unwrap();
        // breakpoint step never executed, trailing step never dispatched
        assert_eq!(paused.steps[1].is_passed, None);
        assert_eq!(paused.steps[2].is_passed, None);
        assert_eq!(instance.curr_step_idx, Some(1));
    }

    #[tokio::test]
    async fn fragment_failure_becomes_step_error() {
        let branch = Branch::with_steps(vec![code("boom", "fail('response mismatch')")]);
        let runner = runner_for(vec![branch]);
        let mut instance = RunInstance::new(Arc::clone(&runner));

        assert!(instance.run().await);
        let done = &instance.completed_branches()[0];
        assert_eq!(done.is_passed, Some(false));
        let err = done.steps[0].error.as_ref().unwrap();
        assert_eq!(err.message, "response mismatch");
        assert_eq!(err.filename, "inst.trellis");
    }

    #[tokio::test]
    async fn expected_fail_inverts_outcome() {
        let mut failing = code("known bad", "fail('still broken')");
        failing.is_expected_fail = true;
        let branch = Branch::with_steps(vec![failing]);
        let runner = runner_for(vec![branch]);
        let mut instance = RunInstance::new(Arc::clone(&runner));

        assert!(instance.run().await);
        let done = &instance.completed_branches()[0];
        let step = &done.steps[0];
        assert_eq!(step.is_passed, Some(false));
        assert_eq!(step.as_expected, Some(true));
        // the branch as a whole is fine: everything went as expected
        assert_eq!(done.is_passed, Some(true));
    }

    #[tokio::test]
    async fn pause_on_fail_is_one_shot() {
        let branch = Branch::with_steps(vec![
            code("bad", "fail('x')"),
            code("also bad", "fail('y')"),
            plain("tail"),
        ]);
        let runner = runner_for(vec![branch]);
        runner.arm_pause_on_fail();
        let mut instance = RunInstance::new(Arc::clone(&runner));

        // First failure pauses and disarms
        assert!(!instance.run().await);
        assert!(instance.is_paused());
        assert!(!runner.pause_on_fail_armed());

        // Resume: second failure no longer pauses
        assert!(instance.run().await);
        assert_eq!(instance.state(), ExecState::Completed);
        let done = &instance.completed_branches()[0];
        assert_eq!(done.steps[2].is_passed, Some(true));
    }

    #[tokio::test]
    async fn run_one_step_pauses_after_each_step() {
        let branch = Branch::with_steps(vec![plain("a"), plain("b")]);
        let runner = runner_for(vec![branch]);
        runner.arm_run_one_step();
        let mut instance = RunInstance::new(Arc::clone(&runner));

        assert!(!instance.run().await);
        assert_eq!(instance.curr_step_idx, Some(0));

        runner.arm_run_one_step();
        assert!(!instance.run().await);
        assert_eq!(instance.curr_step_idx, Some(1));

        assert!(instance.run().await);
    }

    #[tokio::test]
    async fn function_call_assigns_return_value() {
        let mut call = code("{token} = Login", "return 'abc123'");
        call.is_function_call = true;
        call.vars_being_set = vec![VarBeingSet {
            name: "token".to_string(),
            value: String::new(),
            is_local: false,
        }];
        let check = code("verify", "token == 'abc123' || fail('token missing')");

        let branch = Branch::with_steps(vec![call, check]);
        let runner = runner_for(vec![branch]);
        let mut instance = RunInstance::new(Arc::clone(&runner));

        assert!(instance.run().await);
        assert_eq!(instance.completed_branches()[0].is_passed, Some(true));
    }

    #[tokio::test]
    async fn assignment_steps_realize_literals() {
        let mut decl = plain("{greeting}='hello {name}'");
        decl.vars_being_set = vec![VarBeingSet {
            name: "greeting".to_string(),
            value: "'hello {name}'".to_string(),
            is_local: false,
        }];
        let mut name_decl = plain("{name}='ada'");
        name_decl.vars_being_set = vec![VarBeingSet {
            name: "name".to_string(),
            value: "'ada'".to_string(),
            is_local: false,
        }];
        let check = code("check", "greeting == 'hello ada' || fail(greeting)");

        let branch = Branch::with_steps(vec![decl, name_decl, check]);
        let runner = runner_for(vec![branch]);
        let mut instance = RunInstance::new(Arc::clone(&runner));

        assert!(instance.run().await);
        assert_eq!(instance.completed_branches()[0].is_passed, Some(true));
    }

    #[tokio::test]
    async fn branch_state_resets_between_branches() {
        let b1 = Branch::with_steps(vec![code("set", "set('left_over', 1)")]);
        // the bare reference fails once branch 1's globals are gone
        let b2 = Branch::with_steps(vec![code("check", "left_over")]);

        let runner = runner_for(vec![b1, b2]);
        let mut instance = RunInstance::new(Arc::clone(&runner));

        assert!(instance.run().await);
        let done = instance.completed_branches();
        assert_eq!(done[0].is_passed, Some(true));
        // branch 2 fails because the global vanished with branch 1
        assert_eq!(done[1].is_passed, Some(false));
        assert!(done[1].steps[0]
            .error
            .as_ref()
            .unwrap()
            .message
            .contains("not defined"));
    }

    #[tokio::test]
    async fn persistent_survives_across_branches() {
        let b1 = Branch::with_steps(vec![code("check1", "base == 'x' || fail('missing')")]);
        let b2 = Branch::with_steps(vec![code("check2", "base == 'x' || fail('missing')")]);
        let runner = runner_for(vec![b1, b2]);
        runner.set_persistent("base", Val::Str("x".into()));
        let mut instance = RunInstance::new(Arc::clone(&runner));

        assert!(instance.run().await);
        for b in instance.completed_branches() {
            assert_eq!(b.is_passed, Some(true));
        }
    }

    #[tokio::test]
    async fn fatal_fragment_fails_branch_immediately() {
        let branch = Branch::with_steps(vec![
            code("bad", "fatal('environment gone')"),
            plain("never runs"),
        ]);
        let runner = runner_for(vec![branch]);
        let mut instance = RunInstance::new(Arc::clone(&runner));

        assert!(instance.run().await);
        let done = &instance.completed_branches()[0];
        assert_eq!(done.is_passed, Some(false));
        assert!(done.error.is_some());
        assert_eq!(done.steps[1].is_passed, None);
    }

    #[tokio::test]
    async fn after_step_hooks_see_step_result() {
        let hook = Branch::with_steps(vec![code(
            "assert hook saw failure",
            "successful || log('step failed: ' + error)",
        )]);
        let mut branch = Branch::with_steps(vec![code("bad", "fail('nope')")]);
        branch.after_every_step = vec![hook];

        let runner = runner_for(vec![branch]);
        let mut instance = RunInstance::new(Arc::clone(&runner));

        assert!(instance.run().await);
        let done = &instance.completed_branches()[0];
        let hook_step = &done.after_every_step[0].steps[0];
        assert_eq!(hook_step.is_passed, Some(true));
        assert!(hook_step.log.contains("step failed: nope"));
    }

    #[tokio::test]
    async fn failing_after_branch_hook_fails_the_branch() {
        let hook = Branch::with_steps(vec![code("cleanup", "fail('teardown broke')")]);
        let mut branch = Branch::with_steps(vec![plain("fine")]);
        branch.after_branches = vec![hook];

        let runner = runner_for(vec![branch]);
        let mut instance = RunInstance::new(Arc::clone(&runner));

        assert!(instance.run().await);
        let done = &instance.completed_branches()[0];
        // the branch passed its steps, then the hook failure landed on it
        assert_eq!(done.is_passed, Some(false));
        assert!(done.error.as_ref().unwrap().message.contains("teardown broke"));
        // and the failure also surfaces on the hook step itself
        assert_eq!(done.after_branches[0].steps[0].is_passed, Some(false));
    }

    #[tokio::test]
    async fn inject_and_run_only_when_paused() {
        let mut bp = plain("stop");
        bp.is_debug = true;
        let branch = Branch::with_steps(vec![bp]);
        let runner = runner_for(vec![branch]);
        let mut instance = RunInstance::new(Arc::clone(&runner));

        let mut probe = Branch::with_steps(vec![code("probe", "set('probed', true)")]);

        // not paused yet: no-op
        instance.inject_and_run(&mut probe);
        assert!(instance.scopes.get("probed", false).is_none());

        assert!(!instance.run().await);
        instance.inject_and_run(&mut probe);
        assert!(instance.is_paused());
        assert_eq!(instance.scopes.get("probed", false), Some(Val::Bool(true)));
        assert_eq!(probe.steps[0].is_passed, Some(true));
    }

    #[tokio::test]
    async fn reporter_notified_per_step() {
        struct CountingReporter(AtomicUsize);
        impl Reporter for CountingReporter {
            fn generate_report(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let reporter = Arc::new(CountingReporter(AtomicUsize::new(0)));
        let branch = Branch::with_steps(vec![plain("a"), plain("b"), plain("c")]);
        let runner = Arc::new(Runner::new(
            Arc::new(InMemoryTree::new(vec![branch])),
            Arc::clone(&reporter) as Arc<dyn Reporter>,
        ));
        let mut instance = RunInstance::new(runner);

        assert!(instance.run().await);
        assert_eq!(reporter.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn indent_underflow_is_a_step_error() {
        let mut a = plain("outer");
        a.branch_indents = 2;
        let mut b = plain("way back out");
        b.branch_indents = 0;
        let branch = Branch::with_steps(vec![a, b]);
        let runner = runner_for(vec![branch]);
        let mut instance = RunInstance::new(Arc::clone(&runner));

        assert!(instance.run().await);
        let done = &instance.completed_branches()[0];
        assert_eq!(done.steps[1].is_passed, Some(false));
        assert!(done.steps[1]
            .error
            .as_ref()
            .unwrap()
            .message
            .contains("underflow"));
    }
}
