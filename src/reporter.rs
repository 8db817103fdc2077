//! Reporter notification seam
//!
//! Rendering is an external concern; the engine only signals that run state
//! changed after every executed step.

pub trait Reporter: Send + Sync {
    /// Called whenever step/branch state changed and a report could be
    /// regenerated
    fn generate_report(&self);
}

/// Default reporter: surfaces state changes on the debug log
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn generate_report(&self) {
        tracing::debug!("run state changed");
    }
}

/// Reporter that drops every notification (tests, headless runs)
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn generate_report(&self) {}
}
