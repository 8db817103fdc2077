pub mod branch;
pub mod cli;
pub mod config;
pub mod error;
pub mod fragment;
pub mod instance;
pub mod reporter;
pub mod resolver;
pub mod runner;
pub mod scope;
pub mod step;
pub mod tree;
pub mod value;

// Re-export main types
pub use branch::Branch;
pub use config::EngineConfig;
pub use error::StepError;
pub use instance::{ExecState, RunInstance};
pub use runner::Runner;
pub use scope::{new_persistent, Persistent, Scopes};
pub use step::{Outcome, Step, VarBeingSet};
pub use tree::{Dispatch, InMemoryTree, TreeSource, TreeStats};
pub use value::Val;
