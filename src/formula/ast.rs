use std::fmt;

use super::builtins::Builtin;

// ---------------------------------------------------------------------------
// Expr – numeric expressions
// ---------------------------------------------------------------------------

/// A compiled formula. Closed set of node kinds; the evaluator and the shape
/// check both match on it exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// Reference to a raw channel, constant or another step.
    Var(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Builtin, Vec<Expr>),
    If {
        cond: Box<Cond>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Pow => "^",
        }
    }
}

// ---------------------------------------------------------------------------
// Cond – boolean conditions, only legal inside `if`
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Cond {
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    And(Box<Cond>, Box<Cond>),
    Or(Box<Cond>, Box<Cond>),
    Not(Box<Cond>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
        }
    }

    pub fn holds(self, a: f64, b: f64) -> bool {
        match self {
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
        }
    }
}

// ---------------------------------------------------------------------------
// Name extraction
// ---------------------------------------------------------------------------

impl Expr {
    /// Free identifiers in order of first appearance, without duplicates.
    pub fn references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Number(_) => {}
            Expr::Var(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            Expr::Neg(inner) => inner.collect_refs(out),
            Expr::Binary(_, l, r) => {
                l.collect_refs(out);
                r.collect_refs(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.collect_refs(out)),
            Expr::If {
                cond,
                then,
                otherwise,
            } => {
                cond.collect_refs(out);
                then.collect_refs(out);
                otherwise.collect_refs(out);
            }
        }
    }
}

impl Cond {
    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Cond::Compare(_, l, r) => {
                l.collect_refs(out);
                r.collect_refs(out);
            }
            Cond::And(l, r) | Cond::Or(l, r) => {
                l.collect_refs(out);
                r.collect_refs(out);
            }
            Cond::Not(inner) => inner.collect_refs(out),
        }
    }
}

// ---------------------------------------------------------------------------
// Display – fully parenthesised infix, re-parses to the same tree
// ---------------------------------------------------------------------------

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(v) => write!(f, "{v}"),
            Expr::Var(name) => f.write_str(name),
            Expr::Neg(inner) => write!(f, "(-{inner})"),
            Expr::Binary(op, l, r) => write!(f, "({l} {} {r})", op.symbol()),
            Expr::Call(func, args) => {
                write!(f, "{func}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{a}")?;
                }
                f.write_str(")")
            }
            Expr::If {
                cond,
                then,
                otherwise,
            } => write!(f, "(if {cond} then {then} else {otherwise})"),
        }
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cond::Compare(op, l, r) => write!(f, "{l} {} {r}", op.symbol()),
            Cond::And(l, r) => write!(f, "({l} and {r})"),
            Cond::Or(l, r) => write!(f, "({l} or {r})"),
            Cond::Not(inner) => write!(f, "(not {inner})"),
        }
    }
}
