//! Variable scope management
//!
//! Three lifetimes: `persistent` (whole run, shared across instances),
//! `global` (one branch), `local` (one nesting level, kept on a frame
//! stack). The frame stack follows the branch's indentation: an indent
//! increase of any magnitude pushes exactly one fresh frame; a decrease of
//! k pops exactly k frames.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::value::Val;

/// Shared whole-run namespace, set by the orchestrator
pub type Persistent = Arc<RwLock<HashMap<String, Val>>>;

pub fn new_persistent() -> Persistent {
    Arc::new(RwLock::new(HashMap::new()))
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("local scope stack underflow: indent dropped by {wanted} but only {available} frame(s) were open")]
pub struct ScopeUnderflow {
    pub wanted: usize,
    pub available: usize,
}

/// Per-instance scope state
#[derive(Debug)]
pub struct Scopes {
    pub persistent: Persistent,
    pub global: HashMap<String, Val>,
    pub local: HashMap<String, Val>,
    stack: Vec<HashMap<String, Val>>,
}

impl Scopes {
    pub fn new(persistent: Persistent) -> Self {
        Scopes {
            persistent,
            global: HashMap::new(),
            local: HashMap::new(),
            stack: Vec::new(),
        }
    }

    /// Adjust the local frame stack for a move from a step at `prev` indents
    /// to a step at `cur` indents.
    pub fn shift_indent(&mut self, prev: u32, cur: u32) -> Result<(), ScopeUnderflow> {
        if cur > prev {
            // One new frame regardless of the jump size
            self.stack.push(std::mem::take(&mut self.local));
        } else if cur < prev {
            let diff = (prev - cur) as usize;
            if diff > self.stack.len() {
                return Err(ScopeUnderflow {
                    wanted: diff,
                    available: self.stack.len(),
                });
            }
            for _ in 0..diff {
                self.local = self.stack.pop().unwrap_or_default();
            }
        }
        Ok(())
    }

    /// Clear all branch-scoped state; persistent survives
    pub fn reset_branch(&mut self) {
        self.global.clear();
        self.local.clear();
        self.stack.clear();
    }

    pub fn frame_depth(&self) -> usize {
        self.stack.len()
    }

    /// Read a variable from the namespace matching the reference form.
    ///
    /// Local lookups see only the top frame. Global lookups fall through to
    /// persistent so whole-run variables are visible everywhere.
    pub fn get(&self, name: &str, is_local: bool) -> Option<Val> {
        if is_local {
            self.local.get(name).cloned()
        } else {
            self.global.get(name).cloned().or_else(|| {
                self.persistent
                    .read()
                    .ok()
                    .and_then(|p| p.get(name).cloned())
            })
        }
    }

    /// Fragment-evaluator ident lookup: local, then global, then persistent
    pub fn lookup_ident(&self, name: &str) -> Option<Val> {
        self.local
            .get(name)
            .cloned()
            .or_else(|| self.get(name, false))
    }

    pub fn set(&mut self, name: &str, is_local: bool, value: Val) {
        if is_local {
            self.local.insert(name.to_string(), value);
        } else {
            self.global.insert(name.to_string(), value);
        }
    }
}
