//! Fragment evaluation
//!
//! Walks the fragment AST over `Val`s against an instance's scopes. Every
//! AST node costs one unit of fuel; running out is an ordinary evaluation
//! error, so a runaway fragment surfaces as a step failure instead of
//! hanging the execution loop.

use std::collections::HashMap;

use thiserror::Error;

use super::parser::{parse_fragment, BinOp, Expr, LogicalOp, Stmt, UnaryOp};
use crate::scope::Scopes;
use crate::value::Val;

/// Default per-invocation op budget
pub const DEFAULT_FUEL: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct FragmentError {
    pub message: String,
    /// Set by the `fatal` builtin: the owning branch should fail immediately
    pub fail_branch_now: bool,
}

impl FragmentError {
    pub fn parse(message: impl Into<String>) -> Self {
        FragmentError {
            message: message.into(),
            fail_branch_now: false,
        }
    }

    fn runtime(message: impl Into<String>) -> Self {
        FragmentError {
            message: message.into(),
            fail_branch_now: false,
        }
    }
}

/// Evaluate a code fragment.
///
/// Returns the `return` value, or the value of the last statement. Log lines
/// emitted by the fragment are appended to `logs`; the caller routes them to
/// the owning step.
pub fn eval_fragment(
    code: &str,
    scopes: &mut Scopes,
    logs: &mut Vec<String>,
    fuel: u32,
) -> Result<Val, FragmentError> {
    let stmts = parse_fragment(code)?;
    let mut ev = Evaluator {
        scopes,
        logs,
        bindings: HashMap::new(),
        fuel,
    };
    ev.run(&stmts)
}

enum Flow {
    Normal(Val),
    Return(Val),
}

struct Evaluator<'a> {
    scopes: &'a mut Scopes,
    logs: &'a mut Vec<String>,
    /// Fragment-local bindings from `x = expr` statements
    bindings: HashMap<String, Val>,
    fuel: u32,
}

impl<'a> Evaluator<'a> {
    fn run(&mut self, stmts: &[Stmt]) -> Result<Val, FragmentError> {
        let mut last = Val::Null;
        for stmt in stmts {
            match self.eval_stmt(stmt)? {
                Flow::Return(v) => return Ok(v),
                Flow::Normal(v) => last = v,
            }
        }
        Ok(last)
    }

    fn eval_stmt(&mut self, stmt: &Stmt) -> Result<Flow, FragmentError> {
        match stmt {
            Stmt::Return(expr) => Ok(Flow::Return(self.eval_expr(expr)?)),
            Stmt::Assign { name, expr } => {
                let v = self.eval_expr(expr)?;
                self.bindings.insert(name.clone(), v);
                Ok(Flow::Normal(Val::Null))
            }
            Stmt::Expr(expr) => Ok(Flow::Normal(self.eval_expr(expr)?)),
        }
    }

    fn burn(&mut self) -> Result<(), FragmentError> {
        if self.fuel == 0 {
            return Err(FragmentError::runtime(
                "fragment exceeded its evaluation budget",
            ));
        }
        self.fuel -= 1;
        Ok(())
    }

    fn eval_expr(&mut self, expr: &Expr) -> Result<Val, FragmentError> {
        self.burn()?;
        match expr {
            Expr::LitNull => Ok(Val::Null),
            Expr::LitBool(b) => Ok(Val::Bool(*b)),
            Expr::LitNum(n) => Ok(Val::Num(*n)),
            Expr::LitStr(s) => Ok(Val::Str(s.clone())),
            Expr::List(items) => {
                let vals = items
                    .iter()
                    .map(|e| self.eval_expr(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Val::List(vals))
            }
            Expr::Ident(name) => self
                .bindings
                .get(name)
                .cloned()
                .or_else(|| self.scopes.lookup_ident(name))
                .ok_or_else(|| FragmentError::runtime(format!("'{}' is not defined", name))),
            Expr::Member { object, property } => {
                let obj = self.eval_expr(object)?;
                match obj {
                    Val::Obj(map) => map.get(property).cloned().ok_or_else(|| {
                        FragmentError::runtime(format!("property '{}' not found", property))
                    }),
                    other => Err(FragmentError::runtime(format!(
                        "cannot access property '{}' on {}",
                        property,
                        type_name(&other)
                    ))),
                }
            }
            Expr::Index { object, index } => {
                let obj = self.eval_expr(object)?;
                let idx = self.eval_expr(index)?;
                match (obj, idx) {
                    (Val::List(items), Val::Num(n)) => {
                        let i = n as usize;
                        items.get(i).cloned().ok_or_else(|| {
                            FragmentError::runtime(format!("list index {} out of bounds", i))
                        })
                    }
                    (Val::Obj(map), Val::Str(key)) => map.get(&key).cloned().ok_or_else(|| {
                        FragmentError::runtime(format!("key '{}' not found", key))
                    }),
                    (obj, idx) => Err(FragmentError::runtime(format!(
                        "cannot index {} with {}",
                        type_name(&obj),
                        type_name(&idx)
                    ))),
                }
            }
            Expr::Call { callee, args } => {
                let Expr::Ident(name) = callee.as_ref() else {
                    return Err(FragmentError::runtime(
                        "only builtin functions are callable in a fragment",
                    ));
                };
                let argv = args
                    .iter()
                    .map(|e| self.eval_expr(e))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call_builtin(name, argv)
            }
            Expr::Unary { op, operand } => {
                let v = self.eval_expr(operand)?;
                match op {
                    UnaryOp::Not => Ok(Val::Bool(!v.is_truthy())),
                    UnaryOp::Neg => match v {
                        Val::Num(n) => Ok(Val::Num(-n)),
                        other => Err(FragmentError::runtime(format!(
                            "cannot negate {}",
                            type_name(&other)
                        ))),
                    },
                }
            }
            Expr::Logical { op, left, right } => {
                let l = self.eval_expr(left)?;
                match op {
                    // Short-circuit: right side only evaluates when needed
                    LogicalOp::And => {
                        if !l.is_truthy() {
                            return Ok(Val::Bool(false));
                        }
                        Ok(Val::Bool(self.eval_expr(right)?.is_truthy()))
                    }
                    LogicalOp::Or => {
                        if l.is_truthy() {
                            return Ok(Val::Bool(true));
                        }
                        Ok(Val::Bool(self.eval_expr(right)?.is_truthy()))
                    }
                }
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval_expr(left)?;
                let r = self.eval_expr(right)?;
                self.binary(*op, l, r)
            }
        }
    }

    fn binary(&mut self, op: BinOp, l: Val, r: Val) -> Result<Val, FragmentError> {
        match op {
            BinOp::Eq => Ok(Val::Bool(l == r)),
            BinOp::Ne => Ok(Val::Bool(l != r)),
            BinOp::Add => match (l, r) {
                (Val::Num(a), Val::Num(b)) => Ok(Val::Num(a + b)),
                // String concatenation when either side is a string
                (Val::Str(a), b) => Ok(Val::Str(format!("{}{}", a, b.as_text()))),
                (a, Val::Str(b)) => Ok(Val::Str(format!("{}{}", a.as_text(), b))),
                (a, b) => Err(type_error("+", &a, &b)),
            },
            BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
                let (Val::Num(a), Val::Num(b)) = (&l, &r) else {
                    return Err(type_error(op_name(op), &l, &r));
                };
                let (a, b) = (*a, *b);
                match op {
                    BinOp::Sub => Ok(Val::Num(a - b)),
                    BinOp::Mul => Ok(Val::Num(a * b)),
                    BinOp::Div => {
                        if b == 0.0 {
                            Err(FragmentError::runtime("division by zero"))
                        } else {
                            Ok(Val::Num(a / b))
                        }
                    }
                    BinOp::Rem => {
                        if b == 0.0 {
                            Err(FragmentError::runtime("division by zero"))
                        } else {
                            Ok(Val::Num(a % b))
                        }
                    }
                    _ => unreachable!(),
                }
            }
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
                let (Val::Num(a), Val::Num(b)) = (&l, &r) else {
                    return Err(type_error(op_name(op), &l, &r));
                };
                Ok(Val::Bool(match op {
                    BinOp::Lt => a < b,
                    BinOp::Gt => a > b,
                    BinOp::Le => a <= b,
                    BinOp::Ge => a >= b,
                    _ => unreachable!(),
                }))
            }
        }
    }

    fn call_builtin(&mut self, name: &str, args: Vec<Val>) -> Result<Val, FragmentError> {
        match name {
            "log" => {
                for v in &args {
                    self.logs.push(v.as_text());
                }
                Ok(Val::Null)
            }
            "fail" => Err(FragmentError::runtime(
                args.first().map(|v| v.as_text()).unwrap_or_else(|| "fail() called".to_string()),
            )),
            "fatal" => Err(FragmentError {
                message: args
                    .first()
                    .map(|v| v.as_text())
                    .unwrap_or_else(|| "fatal() called".to_string()),
                fail_branch_now: true,
            }),
            "set" | "set_local" => {
                let mut it = args.into_iter();
                let (Some(Val::Str(var)), Some(value)) = (it.next(), it.next()) else {
                    return Err(FragmentError::runtime(format!(
                        "{}(name, value) takes a string name and a value",
                        name
                    )));
                };
                self.scopes.set(&var, name == "set_local", value);
                Ok(Val::Null)
            }
            "len" => match args.first() {
                Some(Val::Str(s)) => Ok(Val::Num(s.chars().count() as f64)),
                Some(Val::List(items)) => Ok(Val::Num(items.len() as f64)),
                Some(Val::Obj(map)) => Ok(Val::Num(map.len() as f64)),
                other => Err(FragmentError::runtime(format!(
                    "len() takes a string, list or object, got {}",
                    other.map(type_name).unwrap_or("nothing")
                ))),
            },
            "str" => Ok(Val::Str(
                args.first().map(|v| v.as_text()).unwrap_or_default(),
            )),
            "num" => match args.first() {
                Some(Val::Num(n)) => Ok(Val::Num(*n)),
                Some(Val::Str(s)) => s
                    .trim()
                    .parse::<f64>()
                    .map(Val::Num)
                    .map_err(|_| FragmentError::runtime(format!("num() cannot parse '{}'", s))),
                Some(Val::Bool(b)) => Ok(Val::Num(if *b { 1.0 } else { 0.0 })),
                other => Err(FragmentError::runtime(format!(
                    "num() cannot convert {}",
                    other.map(type_name).unwrap_or("nothing")
                ))),
            },
            other => Err(FragmentError::runtime(format!(
                "'{}' is not a fragment builtin",
                other
            ))),
        }
    }
}

fn type_name(v: &Val) -> &'static str {
    match v {
        Val::Null => "null",
        Val::Bool(_) => "bool",
        Val::Num(_) => "number",
        Val::Str(_) => "string",
        Val::List(_) => "list",
        Val::Obj(_) => "object",
    }
}

fn type_error(op: &str, l: &Val, r: &Val) -> FragmentError {
    FragmentError::runtime(format!(
        "cannot apply '{}' to {} and {}",
        op,
        type_name(l),
        type_name(r)
    ))
}

fn op_name(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Rem => "%",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Gt => ">",
        BinOp::Le => "<=",
        BinOp::Ge => ">=",
    }
}
