//! Fragment parser: pest grammar to AST

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use super::eval::FragmentError;

#[derive(Parser)]
#[grammar = "fragment/fragment.pest"]
struct FragmentParser;

/// Statement AST node
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Return(Expr),
    /// Fragment-local binding `x = expr`
    Assign { name: String, expr: Expr },
    Expr(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Expression AST node
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    LitNull,
    LitBool(bool),
    LitNum(f64),
    LitStr(String),
    List(Vec<Expr>),
    Ident(String),
    Member {
        object: Box<Expr>,
        property: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

/// Parse a fragment source into a statement list
pub fn parse_fragment(source: &str) -> Result<Vec<Stmt>, FragmentError> {
    let mut pairs = FragmentParser::parse(Rule::program, source)
        .map_err(|e| FragmentError::parse(format!("fragment parse error: {}", e)))?;

    let program = pairs.next().expect("program rule always present");
    let mut stmts = Vec::new();
    for pair in program.into_inner() {
        match pair.as_rule() {
            Rule::stmt => stmts.push(build_stmt(pair)?),
            Rule::EOI => {}
            other => unreachable!("unexpected rule under program: {:?}", other),
        }
    }
    Ok(stmts)
}

fn build_stmt(pair: Pair<Rule>) -> Result<Stmt, FragmentError> {
    let inner = pair.into_inner().next().expect("stmt has one alternative");
    match inner.as_rule() {
        Rule::ret_stmt => {
            let expr = inner
                .into_inner()
                .find(|p| p.as_rule() == Rule::expr)
                .expect("return carries an expression");
            Ok(Stmt::Return(build_expr(expr)?))
        }
        Rule::assign_stmt => {
            let mut parts = inner.into_inner();
            let name = parts.next().expect("assign target").as_str().to_string();
            let expr = parts.next().expect("assign value");
            Ok(Stmt::Assign {
                name,
                expr: build_expr(expr)?,
            })
        }
        Rule::expr_stmt => {
            let expr = inner.into_inner().next().expect("expression");
            Ok(Stmt::Expr(build_expr(expr)?))
        }
        other => unreachable!("unexpected stmt alternative: {:?}", other),
    }
}

/// Fold a left-associative operator chain: operand (op operand)*
fn fold_binary(pair: Pair<Rule>) -> Result<Expr, FragmentError> {
    let mut parts = pair.into_inner();
    let mut left = build_expr(parts.next().expect("leading operand"))?;

    while let Some(op_pair) = parts.next() {
        let right = build_expr(parts.next().expect("trailing operand"))?;
        left = match op_pair.as_rule() {
            Rule::op_or => Expr::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            },
            Rule::op_and => Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            },
            Rule::cmp_op | Rule::add_op | Rule::mul_op => Expr::Binary {
                op: bin_op(op_pair.as_str()),
                left: Box::new(left),
                right: Box::new(right),
            },
            other => unreachable!("unexpected operator rule: {:?}", other),
        };
    }
    Ok(left)
}

fn bin_op(text: &str) -> BinOp {
    match text {
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        "*" => BinOp::Mul,
        "/" => BinOp::Div,
        "%" => BinOp::Rem,
        "==" => BinOp::Eq,
        "!=" => BinOp::Ne,
        "<=" => BinOp::Le,
        ">=" => BinOp::Ge,
        "<" => BinOp::Lt,
        ">" => BinOp::Gt,
        other => unreachable!("unknown binary operator: {}", other),
    }
}

fn build_expr(pair: Pair<Rule>) -> Result<Expr, FragmentError> {
    match pair.as_rule() {
        Rule::expr | Rule::and_expr | Rule::cmp_expr | Rule::add_expr | Rule::mul_expr => {
            fold_binary(pair)
        }
        Rule::unary_expr => {
            let mut ops = Vec::new();
            let mut operand = None;
            for p in pair.into_inner() {
                match p.as_rule() {
                    Rule::unary_op => ops.push(match p.as_str() {
                        "!" => UnaryOp::Not,
                        "-" => UnaryOp::Neg,
                        other => unreachable!("unknown unary operator: {}", other),
                    }),
                    _ => operand = Some(build_expr(p)?),
                }
            }
            let mut expr = operand.expect("unary operand");
            for op in ops.into_iter().rev() {
                expr = Expr::Unary {
                    op,
                    operand: Box::new(expr),
                };
            }
            Ok(expr)
        }
        Rule::postfix_expr => {
            let mut parts = pair.into_inner();
            let mut expr = build_expr(parts.next().expect("primary"))?;
            for postfix in parts {
                let inner = postfix.into_inner().next().expect("postfix op");
                expr = match inner.as_rule() {
                    Rule::call_args => {
                        let args = match inner.into_inner().next() {
                            Some(list) => list
                                .into_inner()
                                .map(build_expr)
                                .collect::<Result<Vec<_>, _>>()?,
                            None => Vec::new(),
                        };
                        Expr::Call {
                            callee: Box::new(expr),
                            args,
                        }
                    }
                    Rule::member => {
                        let property = inner
                            .into_inner()
                            .next()
                            .expect("member name")
                            .as_str()
                            .to_string();
                        Expr::Member {
                            object: Box::new(expr),
                            property,
                        }
                    }
                    Rule::index => {
                        let idx = inner.into_inner().next().expect("index expression");
                        Expr::Index {
                            object: Box::new(expr),
                            index: Box::new(build_expr(idx)?),
                        }
                    }
                    other => unreachable!("unexpected postfix rule: {:?}", other),
                };
            }
            Ok(expr)
        }
        Rule::primary => build_expr(pair.into_inner().next().expect("primary alternative")),
        Rule::paren => build_expr(pair.into_inner().next().expect("inner expression")),
        Rule::list => {
            let items = match pair.into_inner().next() {
                Some(list) => list
                    .into_inner()
                    .map(build_expr)
                    .collect::<Result<Vec<_>, _>>()?,
                None => Vec::new(),
            };
            Ok(Expr::List(items))
        }
        Rule::literal => build_expr(pair.into_inner().next().expect("literal alternative")),
        Rule::null_lit => Ok(Expr::LitNull),
        Rule::bool_lit => Ok(Expr::LitBool(pair.as_str() == "true")),
        Rule::number => {
            let n: f64 = pair
                .as_str()
                .parse()
                .map_err(|_| FragmentError::parse(format!("bad number: {}", pair.as_str())))?;
            Ok(Expr::LitNum(n))
        }
        Rule::string => Ok(Expr::LitStr(unescape(pair.as_str()))),
        Rule::ident => Ok(Expr::Ident(pair.as_str().to_string())),
        other => unreachable!("unexpected expression rule: {:?}", other),
    }
}

/// Strip surrounding quotes and process backslash escapes
fn unescape(raw: &str) -> String {
    let body = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}
