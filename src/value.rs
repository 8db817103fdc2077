//! Runtime value types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Runtime value type
///
/// This is the currency of the engine: scope namespaces hold `Val`s, the
/// variable resolver produces them, and the fragment evaluator computes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Val {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<Val>),
    Obj(HashMap<String, Val>),
}

impl Val {
    /// Check if value is truthy (for conditionals)
    pub fn is_truthy(&self) -> bool {
        match self {
            Val::Bool(b) => *b,
            Val::Null => false,
            _ => true,
        }
    }

    /// Render the value as substitution text.
    ///
    /// Strings render without quotes (they get spliced into step text);
    /// whole numbers render without a trailing `.0`.
    pub fn as_text(&self) -> String {
        match self {
            Val::Null => "null".to_string(),
            Val::Bool(b) => b.to_string(),
            Val::Num(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Val::Str(s) => s.clone(),
            Val::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.as_text()).collect();
                format!("[{}]", parts.join(", "))
            }
            Val::Obj(_) => serde_json::to_string(self).unwrap_or_else(|_| "{..}".to_string()),
        }
    }
}

impl From<&str> for Val {
    fn from(s: &str) -> Self {
        Val::Str(s.to_string())
    }
}

impl From<String> for Val {
    fn from(s: String) -> Self {
        Val::Str(s)
    }
}

impl From<f64> for Val {
    fn from(n: f64) -> Self {
        Val::Num(n)
    }
}

impl From<bool> for Val {
    fn from(b: bool) -> Self {
        Val::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Val::Null.is_truthy());
        assert!(!Val::Bool(false).is_truthy());
        assert!(Val::Bool(true).is_truthy());
        assert!(Val::Num(0.0).is_truthy());
        assert!(Val::Str(String::new()).is_truthy());
    }

    #[test]
    fn text_rendering() {
        assert_eq!(Val::Str("abc".into()).as_text(), "abc");
        assert_eq!(Val::Num(5.0).as_text(), "5");
        assert_eq!(Val::Num(2.5).as_text(), "2.5");
        assert_eq!(Val::Null.as_text(), "null");
        assert_eq!(
            Val::List(vec![Val::Num(1.0), Val::Str("x".into())]).as_text(),
            "[1, x]"
        );
    }
}
