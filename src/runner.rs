//! Shared orchestrator context
//!
//! One `Runner` is shared by every concurrent `RunInstance`: the tree
//! source, the reporter, the persistent namespace, and the one-shot pause
//! policy flags. Each instance owns its global/local scopes; this is the
//! only state they share.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::fragment::DEFAULT_FUEL;
use crate::instance::RunInstance;
use crate::reporter::Reporter;
use crate::scope::{new_persistent, Persistent};
use crate::tree::TreeSource;
use crate::value::Val;

pub struct Runner {
    pub tree: Arc<dyn TreeSource>,
    pub reporter: Arc<dyn Reporter>,
    pub persistent: Persistent,
    /// One-shot: pause the triggering instance on the next failed or
    /// unexpected outcome
    pause_on_fail: AtomicBool,
    /// One-shot: pause the triggering instance after exactly one step
    run_one_step: AtomicBool,
    /// Per-invocation fragment evaluation budget
    pub fragment_fuel: u32,
}

impl Runner {
    pub fn new(tree: Arc<dyn TreeSource>, reporter: Arc<dyn Reporter>) -> Self {
        Runner {
            tree,
            reporter,
            persistent: new_persistent(),
            pause_on_fail: AtomicBool::new(false),
            run_one_step: AtomicBool::new(false),
            fragment_fuel: DEFAULT_FUEL,
        }
    }

    /// Set a whole-run variable, visible to every instance
    pub fn set_persistent(&self, name: &str, value: Val) {
        self.persistent
            .write()
            .expect("persistent lock")
            .insert(name.to_string(), value);
    }

    pub fn arm_pause_on_fail(&self) {
        self.pause_on_fail.store(true, Ordering::SeqCst);
    }

    pub fn arm_run_one_step(&self) {
        self.run_one_step.store(true, Ordering::SeqCst);
    }

    /// Disarm-and-read: returns whether the flag was armed, clearing it
    pub(crate) fn take_pause_on_fail(&self) -> bool {
        self.pause_on_fail.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn take_run_one_step(&self) -> bool {
        self.run_one_step.swap(false, Ordering::SeqCst)
    }

    pub fn pause_on_fail_armed(&self) -> bool {
        self.pause_on_fail.load(Ordering::SeqCst)
    }

    /// Run `count` concurrent instances against the shared tree.
    ///
    /// Returns whether every instance ran to completion (false when any
    /// paused) along with the instances themselves, so callers can inspect
    /// completed branches and paused positions.
    pub async fn run_all(self: &Arc<Self>, count: usize) -> (bool, Vec<RunInstance>) {
        let mut set = JoinSet::new();
        for _ in 0..count.max(1) {
            let mut instance = RunInstance::new(Arc::clone(self));
            set.spawn(async move {
                let completed = instance.run().await;
                (completed, instance)
            });
        }

        let mut all_completed = true;
        let mut instances = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (completed, instance) = joined.expect("run instance task panicked");
            all_completed &= completed;
            instances.push(instance);
        }
        (all_completed, instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::Branch;
    use crate::reporter::NoopReporter;
    use crate::step::Step;
    use crate::tree::InMemoryTree;

    fn code_step(text: &str, fragment: &str) -> Step {
        let mut s = Step::new(text);
        s.code_block = Some(fragment.to_string());
        s
    }

    fn tree_of(branches: Vec<Branch>) -> Arc<InMemoryTree> {
        Arc::new(InMemoryTree::new(branches))
    }

    #[tokio::test(start_paused = true)]
    async fn two_instances_drain_the_tree() {
        let branches: Vec<Branch> = (0..6)
            .map(|i| Branch::with_steps(vec![code_step(&format!("b{}", i), "1 + 1")]))
            .collect();
        let tree = tree_of(branches);
        let runner = Arc::new(Runner::new(
            Arc::clone(&tree) as Arc<dyn TreeSource>,
            Arc::new(NoopReporter),
        ));

        let (completed, instances) = runner.run_all(2).await;
        assert!(completed);
        assert_eq!(instances.len(), 2);

        let total: usize = instances.iter().map(|i| i.completed_branches().len()).sum();
        assert_eq!(total, 6);

        let stats = tree.stats();
        assert_eq!(stats.branches_dispatched, 6);
        assert_eq!(stats.branches_passed, 6);
        assert_eq!(stats.branches_failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_instance_waits_out_the_last_branch() {
        // One branch, two instances: the idle one must spin on Wait until
        // the busy one finishes, then see Done
        let tree = tree_of(vec![Branch::with_steps(vec![code_step("only", "1")])]);
        let runner = Arc::new(Runner::new(
            Arc::clone(&tree) as Arc<dyn TreeSource>,
            Arc::new(NoopReporter),
        ));

        let (completed, instances) = runner.run_all(2).await;
        assert!(completed);
        let total: usize = instances.iter().map(|i| i.completed_branches().len()).sum();
        assert_eq!(total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_is_shared_across_instances() {
        let branches: Vec<Branch> = (0..4)
            .map(|i| {
                Branch::with_steps(vec![code_step(
                    &format!("check{}", i),
                    "env == 'staging' || fail('wrong env')",
                )])
            })
            .collect();
        let tree = tree_of(branches);
        let runner = Arc::new(Runner::new(
            Arc::clone(&tree) as Arc<dyn TreeSource>,
            Arc::new(NoopReporter),
        ));
        runner.set_persistent("env", Val::Str("staging".into()));

        let (completed, _) = runner.run_all(2).await;
        assert!(completed);
        assert_eq!(tree.stats().branches_failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_count_still_runs_one_instance() {
        let tree = tree_of(vec![Branch::with_steps(vec![code_step("x", "1")])]);
        let runner = Arc::new(Runner::new(
            Arc::clone(&tree) as Arc<dyn TreeSource>,
            Arc::new(NoopReporter),
        ));

        let (completed, instances) = runner.run_all(0).await;
        assert!(completed);
        assert_eq!(instances.len(), 1);
        assert_eq!(tree.stats().branches_passed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_instance_reports_incomplete() {
        let mut bp = Step::new("stop");
        bp.is_debug = true;
        let tree = tree_of(vec![Branch::with_steps(vec![bp])]);
        let runner = Arc::new(Runner::new(
            Arc::clone(&tree) as Arc<dyn TreeSource>,
            Arc::new(NoopReporter),
        ));

        let (completed, instances) = runner.run_all(1).await;
        assert!(!completed);
        assert!(instances[0].is_paused());
    }
}
