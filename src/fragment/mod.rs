//! Sandboxed evaluator for embedded step code fragments
//!
//! A fragment is a small expression language with a fixed capability
//! surface: it can read variables from the surrounding scopes, write
//! globals/locals through `set`/`set_local`, log, and raise step failures
//! through `fail`/`fatal`. Evaluation is synchronous and fuel-bounded so
//! one runaway fragment cannot block the engine.

pub mod eval;
pub mod parser;

pub use eval::{eval_fragment, FragmentError, DEFAULT_FUEL};
pub use parser::{parse_fragment, Expr, Stmt};
