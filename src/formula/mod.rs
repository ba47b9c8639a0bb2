//! Formula language: tokenizer, recursive-descent parser and the expression
//! tree shared by the shape check and the evaluator.

pub mod ast;
pub mod builtins;
pub mod lexer;
pub mod parser;

pub use ast::{BinOp, CmpOp, Cond, Expr};
pub use builtins::{Builtin, BuiltinKind};
pub use lexer::RESERVED_WORDS;
pub use parser::parse;
