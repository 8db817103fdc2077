//! Lazy variable resolution
//!
//! Step text refers to variables as `{name}` (global) or `{{name}}` (local).
//! A reference may appear before the step that declares the variable: the
//! resolver scans the branch forward from the referencing step and realizes
//! the declared value on demand, evaluating fragment-backed declarations at
//! lookup time. Resolution is branch-local and forward-only, and realized
//! values are never cached across lookups, so a fragment-backed declaration
//! re-evaluates on every independent lookup.

use std::sync::LazyLock;

use regex::Regex;

use crate::branch::Branch;
use crate::error::StepError;
use crate::fragment::eval_fragment;
use crate::scope::Scopes;
use crate::value::Val;

/// Matches `{name}` and `{{name}}` references in step text
pub static VAR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{[^{}]+\}\}|\{[^{}]+\}").expect("variable pattern compiles"));

/// Definition chains longer than this are treated as circular
const MAX_RESOLVE_DEPTH: usize = 50;

/// Everything resolution needs from the running instance
pub struct ResolveCtx<'a> {
    pub scopes: &'a mut Scopes,
    /// Log lines produced during resolution; the caller routes them to the
    /// referencing step
    pub logs: &'a mut Vec<String>,
    /// Fragment evaluation budget
    pub fuel: u32,
}

/// Replace every variable reference in `text` with its resolved value.
///
/// `step_idx` is the position of the referencing step within `branch`;
/// forward scanning starts there (inclusive).
pub fn replace_vars(
    ctx: &mut ResolveCtx<'_>,
    text: &str,
    branch: &Branch,
    step_idx: usize,
) -> Result<String, StepError> {
    replace_vars_at(ctx, text, branch, step_idx, 0)
}

/// Resolve a single variable at the given step and branch.
pub fn find_var_value(
    ctx: &mut ResolveCtx<'_>,
    name: &str,
    is_local: bool,
    branch: &Branch,
    step_idx: usize,
) -> Result<Val, StepError> {
    find_var_value_at(ctx, name, is_local, branch, step_idx, 0)
}

fn replace_vars_at(
    ctx: &mut ResolveCtx<'_>,
    text: &str,
    branch: &Branch,
    step_idx: usize,
    depth: usize,
) -> Result<String, StepError> {
    let matches: Vec<String> = VAR_REGEX
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect();

    let mut out = text.to_string();
    for reference in matches {
        let is_local = reference.starts_with("{{");
        let name = reference
            .trim_matches(|c| c == '{' || c == '}')
            .trim()
            .to_string();
        let value = find_var_value_at(ctx, &name, is_local, branch, step_idx, depth)?;
        out = out.replacen(&reference, &value.as_text(), 1);
    }
    Ok(out)
}

fn find_var_value_at(
    ctx: &mut ResolveCtx<'_>,
    name: &str,
    is_local: bool,
    branch: &Branch,
    step_idx: usize,
    depth: usize,
) -> Result<Val, StepError> {
    // Already set in the applicable namespace: return it immediately
    if let Some(value) = ctx.scopes.get(name, is_local) {
        return Ok(value);
    }

    let reference = if is_local {
        format!("{{{{{}}}}}", name)
    } else {
        format!("{{{}}}", name)
    };

    let (ref_file, ref_line) = branch
        .steps
        .get(step_idx)
        .map(|s| (s.filename.clone(), s.line_number))
        .unwrap_or_default();

    if depth >= MAX_RESOLVE_DEPTH {
        return Err(StepError::new(
            format!(
                "The variable {} has a circular or too-deep definition chain",
                reference
            ),
            ref_file,
            ref_line,
        ));
    }

    // Go down the branch looking for a matching declaration
    for decl in &branch.steps[step_idx.min(branch.steps.len())..] {
        for var in &decl.vars_being_set {
            if var.name != name || var.is_local != is_local {
                continue;
            }

            // Fragment-backed declarations evaluate now, not at declaration
            // time, and on every lookup
            let value = match &decl.code_block {
                Some(code) => eval_fragment(code, ctx.scopes, ctx.logs, ctx.fuel).map_err(|e| {
                    let err = StepError::new(
                        format!("error evaluating the value of {}: {}", reference, e.message),
                        decl.filename.clone(),
                        decl.line_number,
                    );
                    if e.fail_branch_now {
                        err.fail_branch_now()
                    } else {
                        err
                    }
                })?,
                None => Val::Str(strip_quotes(&var.value).to_string()),
            };

            // Chained definitions: resolve references inside the value,
            // still scanning from the original referencing step
            let value = match value {
                Val::Str(s) => Val::Str(replace_vars_at(ctx, &s, branch, step_idx, depth + 1)?),
                other => other,
            };

            ctx.logs.push(format!(
                "The value of variable {} is being set by a later step at {}:{}",
                reference, decl.filename, decl.line_number
            ));
            return Ok(value);
        }
    }

    Err(StepError::new(
        format!(
            "The variable {} is never set, but is needed for this step",
            reference
        ),
        ref_file,
        ref_line,
    ))
}

/// Strip one pair of surrounding quotes (single, double, or backtick)
pub fn strip_quotes(s: &str) -> &str {
    let t = s.trim();
    for q in ['\'', '"', '`'] {
        if t.len() >= 2 && t.starts_with(q) && t.ends_with(q) {
            return &t[1..t.len() - 1];
        }
    }
    t
}
