use crate::error::SyntaxError;

use super::ast::{BinOp, CmpOp, Cond, Expr};
use super::builtins::{Builtin, BuiltinKind};
use super::lexer::{tokenize, Token, TokenKind};

type PResult<T> = Result<T, SyntaxError>;

/// Deepest nesting accepted, both for the parser's own recursion and for
/// the height of the tree it returns. Evaluation and printing walk the tree
/// recursively.
const MAX_DEPTH: usize = 256;

/// A subtree together with its height (a leaf is 0).
type Sub<T> = (T, usize);

/// Parse formula text into a single expression tree.
///
/// Either the whole input is consumed and one tree is returned, or the first
/// offending token is reported; no partial trees are produced.
pub fn parse(input: &str) -> PResult<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        nesting: 0,
    };
    let (expr, _) = parser.parse_expr()?;
    let tok = parser.peek();
    match &tok.kind {
        TokenKind::Eof => Ok(expr),
        kind if kind.is_comparison() => Err(SyntaxError::new(
            tok.pos,
            "comparisons are only allowed in an 'if' condition",
        )),
        kind => Err(SyntaxError::new(
            tok.pos,
            format!("unexpected {} after complete expression", kind.describe()),
        )),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Open recursive productions.
    nesting: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize() always ends with Eof, so the last token is a safe fallback.
        self.tokens
            .get(self.pos)
            .unwrap_or_else(|| &self.tokens[self.tokens.len() - 1])
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: TokenKind, what: &str) -> PResult<Token> {
        if *self.peek_kind() == expected {
            Ok(self.advance())
        } else {
            let tok = self.peek();
            Err(SyntaxError::new(
                tok.pos,
                format!("expected {what}, found {}", tok.kind.describe()),
            ))
        }
    }

    fn too_deep(&self) -> SyntaxError {
        SyntaxError::new(
            self.peek().pos,
            format!("formula nests more than {MAX_DEPTH} levels deep"),
        )
    }

    /// Run a recursive production with the nesting budget charged for its
    /// duration.
    fn nested<T>(&mut self, production: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        if self.nesting >= MAX_DEPTH {
            return Err(self.too_deep());
        }
        self.nesting += 1;
        let out = production(self);
        self.nesting -= 1;
        out
    }

    /// Height of a node whose tallest child has height `child`.
    fn above(&self, child: usize) -> PResult<usize> {
        if child >= MAX_DEPTH {
            return Err(self.too_deep());
        }
        Ok(child + 1)
    }

    // -- Numeric grammar --

    fn parse_expr(&mut self) -> PResult<Sub<Expr>> {
        self.nested(|p| {
            if *p.peek_kind() == TokenKind::If {
                p.advance();
                let (cond, hc) = p.parse_or()?;
                p.expect(TokenKind::Then, "'then'")?;
                let (then, ht) = p.parse_expr()?;
                p.expect(TokenKind::Else, "'else'")?;
                let (otherwise, ho) = p.parse_expr()?;
                let height = p.above(hc.max(ht).max(ho))?;
                return Ok((
                    Expr::If {
                        cond: Box::new(cond),
                        then: Box::new(then),
                        otherwise: Box::new(otherwise),
                    },
                    height,
                ));
            }
            p.parse_additive()
        })
    }

    fn parse_additive(&mut self) -> PResult<Sub<Expr>> {
        let (mut lhs, mut height) = self.parse_term()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Ok((lhs, height)),
            };
            self.advance();
            let (rhs, hr) = self.parse_term()?;
            height = self.above(height.max(hr))?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_term(&mut self) -> PResult<Sub<Expr>> {
        let (mut lhs, mut height) = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                _ => return Ok((lhs, height)),
            };
            self.advance();
            let (rhs, hr) = self.parse_unary()?;
            height = self.above(height.max(hr))?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> PResult<Sub<Expr>> {
        self.nested(|p| {
            if *p.peek_kind() == TokenKind::Minus {
                p.advance();
                let (inner, h) = p.parse_unary()?;
                return Ok((Expr::Neg(Box::new(inner)), p.above(h)?));
            }
            p.parse_power()
        })
    }

    /// `primary ^ unary`: right-associative, binds tighter than a leading minus.
    fn parse_power(&mut self) -> PResult<Sub<Expr>> {
        let (base, hb) = self.parse_primary()?;
        if *self.peek_kind() == TokenKind::Caret {
            self.advance();
            let (exponent, he) = self.parse_unary()?;
            let height = self.above(hb.max(he))?;
            return Ok((
                Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)),
                height,
            ));
        }
        Ok((base, hb))
    }

    fn parse_primary(&mut self) -> PResult<Sub<Expr>> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::Number(v) => Ok((Expr::Number(v), 0)),
            TokenKind::Ident(name) => {
                if *self.peek_kind() == TokenKind::LParen {
                    self.parse_call(name, tok.pos)
                } else {
                    Ok((Expr::Var(name), 0))
                }
            }
            TokenKind::LParen => {
                let inner = self.parse_expr()?;
                if self.peek_kind().is_comparison() {
                    return Err(SyntaxError::new(
                        self.peek().pos,
                        "comparisons are only allowed in an 'if' condition",
                    ));
                }
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::If => Err(SyntaxError::new(
                tok.pos,
                "a conditional used as an operand must be parenthesised",
            )),
            other => Err(SyntaxError::new(
                tok.pos,
                format!("expected a number, name or '(', found {}", other.describe()),
            )),
        }
    }

    fn parse_call(&mut self, name: String, name_pos: usize) -> PResult<Sub<Expr>> {
        let func = Builtin::from_name(&name)
            .ok_or_else(|| SyntaxError::new(name_pos, format!("unknown function '{name}'")))?;
        self.expect(TokenKind::LParen, "'('")?;

        let mut args = Vec::new();
        let mut arg_positions = Vec::new();
        let mut tallest = 0;
        if *self.peek_kind() != TokenKind::RParen {
            loop {
                arg_positions.push(self.peek().pos);
                let (arg, h) = self.parse_expr()?;
                tallest = tallest.max(h);
                args.push(arg);
                if *self.peek_kind() == TokenKind::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "',' or ')'")?;

        if args.len() != func.arity() {
            return Err(SyntaxError::new(
                name_pos,
                format!(
                    "{func}() takes {} argument{}, got {}",
                    func.arity(),
                    if func.arity() == 1 { "" } else { "s" },
                    args.len()
                ),
            ));
        }
        if func.kind() == BuiltinKind::Time && !matches!(args[0], Expr::Var(_)) {
            return Err(SyntaxError::new(
                arg_positions[0],
                "time() takes a channel name, not an expression",
            ));
        }
        let height = self.above(tallest)?;
        Ok((Expr::Call(func, args), height))
    }

    // -- Condition grammar --

    fn parse_or(&mut self) -> PResult<Sub<Cond>> {
        let (mut lhs, mut height) = self.parse_and()?;
        while *self.peek_kind() == TokenKind::Or {
            self.advance();
            let (rhs, hr) = self.parse_and()?;
            height = self.above(height.max(hr))?;
            lhs = Cond::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok((lhs, height))
    }

    fn parse_and(&mut self) -> PResult<Sub<Cond>> {
        let (mut lhs, mut height) = self.parse_not()?;
        while *self.peek_kind() == TokenKind::And {
            self.advance();
            let (rhs, hr) = self.parse_not()?;
            height = self.above(height.max(hr))?;
            lhs = Cond::And(Box::new(lhs), Box::new(rhs));
        }
        Ok((lhs, height))
    }

    fn parse_not(&mut self) -> PResult<Sub<Cond>> {
        self.nested(|p| {
            if *p.peek_kind() == TokenKind::Not {
                p.advance();
                let (inner, h) = p.parse_not()?;
                return Ok((Cond::Not(Box::new(inner)), p.above(h)?));
            }
            if *p.peek_kind() == TokenKind::LParen {
                // "(" may open a grouped condition or an arithmetic operand of a
                // comparison; try the condition first and rewind if it does not fit.
                let save = p.pos;
                p.advance();
                if let Ok(cond) = p.parse_or() {
                    if *p.peek_kind() == TokenKind::RParen {
                        p.advance();
                        if !p.continues_operand() {
                            return Ok(cond);
                        }
                    }
                }
                p.pos = save;
            }
            p.parse_comparison()
        })
    }

    /// True when the next token would extend an arithmetic operand.
    fn continues_operand(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Plus
                | TokenKind::Minus
                | TokenKind::Star
                | TokenKind::Slash
                | TokenKind::Caret
        ) || self.peek_kind().is_comparison()
    }

    fn parse_comparison(&mut self) -> PResult<Sub<Cond>> {
        let (lhs, hl) = self.parse_additive()?;
        let op = match self.peek_kind() {
            TokenKind::Lt => CmpOp::Lt,
            TokenKind::Le => CmpOp::Le,
            TokenKind::Gt => CmpOp::Gt,
            TokenKind::Ge => CmpOp::Ge,
            TokenKind::EqEq => CmpOp::Eq,
            TokenKind::Ne => CmpOp::Ne,
            other => {
                return Err(SyntaxError::new(
                    self.peek().pos,
                    format!("expected a comparison operator, found {}", other.describe()),
                ))
            }
        };
        self.advance();
        let (rhs, hr) = self.parse_additive()?;
        let height = self.above(hl.max(hr))?;
        Ok((Cond::Compare(op, Box::new(lhs), Box::new(rhs)), height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(v: f64) -> Box<Expr> {
        Box::new(Expr::Number(v))
    }

    fn var(name: &str) -> Box<Expr> {
        Box::new(Expr::Var(name.into()))
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(
            parse("a + b * c").unwrap(),
            Expr::Binary(
                BinOp::Add,
                var("a"),
                Box::new(Expr::Binary(BinOp::Mul, var("b"), var("c")))
            )
        );
        assert_eq!(
            parse("a - b - c").unwrap(),
            Expr::Binary(
                BinOp::Sub,
                Box::new(Expr::Binary(BinOp::Sub, var("a"), var("b"))),
                var("c")
            )
        );
        assert_eq!(
            parse("2 ^ 3 ^ 2").unwrap(),
            Expr::Binary(
                BinOp::Pow,
                num(2.0),
                Box::new(Expr::Binary(BinOp::Pow, num(3.0), num(2.0)))
            )
        );
    }

    #[test]
    fn unary_minus_binds_looser_than_power() {
        assert_eq!(
            parse("-2^2").unwrap(),
            Expr::Neg(Box::new(Expr::Binary(BinOp::Pow, num(2.0), num(2.0))))
        );
        assert_eq!(
            parse("2^-1").unwrap(),
            Expr::Binary(BinOp::Pow, num(2.0), Box::new(Expr::Neg(num(1.0))))
        );
    }

    #[test]
    fn calls_check_arity_at_parse_time() {
        assert!(matches!(
            parse("slope(y, x)").unwrap(),
            Expr::Call(Builtin::Slope, ref args) if args.len() == 2
        ));
        let err = parse("x + sqrt(a, b)").unwrap_err();
        assert_eq!(err.position, 4);
        assert!(err.message.contains("takes 1 argument"));
        let err = parse("predict(y, x)").unwrap_err();
        assert_eq!(err.position, 0);
    }

    #[test]
    fn unknown_function_fails_at_parse_time() {
        let err = parse("1 + median(x)").unwrap_err();
        assert_eq!(err.position, 4);
        assert!(err.message.contains("median"));
    }

    #[test]
    fn time_requires_a_name() {
        assert!(parse("time(Pb206)").is_ok());
        let err = parse("time(Pb206 + 1)").unwrap_err();
        assert_eq!(err.position, 5);
    }

    #[test]
    fn conditionals() {
        let e = parse("if x > 0 and not (y == 1) then x else -x").unwrap();
        match e {
            Expr::If { cond, .. } => match *cond {
                Cond::And(l, r) => {
                    assert!(matches!(*l, Cond::Compare(CmpOp::Gt, _, _)));
                    assert!(matches!(*r, Cond::Not(_)));
                }
                other => panic!("unexpected condition {other:?}"),
            },
            other => panic!("unexpected tree {other:?}"),
        }
    }

    #[test]
    fn parenthesised_operand_in_condition() {
        let e = parse("if (a + b) * 2 > c then 1 else 0").unwrap();
        assert!(matches!(e, Expr::If { .. }));
        let e = parse("if (a > b or c < d) and e != f then 1 else 0").unwrap();
        assert!(matches!(e, Expr::If { .. }));
    }

    #[test]
    fn comparisons_outside_if_are_rejected() {
        let err = parse("a > b").unwrap_err();
        assert_eq!(err.position, 2);
        let err = parse("(a > b) + 1").unwrap_err();
        assert_eq!(err.position, 3);
    }

    #[test]
    fn totality_reports_first_bad_token() {
        assert_eq!(parse("").unwrap_err().position, 0);
        assert_eq!(parse("a +").unwrap_err().position, 3);
        assert_eq!(parse("(a + b").unwrap_err().position, 6);
        assert_eq!(parse("a b").unwrap_err().position, 2);
        assert_eq!(parse("if a > 1 then 2").unwrap_err().position, 15);
    }

    #[test]
    fn deep_nesting_is_a_syntax_error() {
        let parens = format!("{}1{}", "(".repeat(20_000), ")".repeat(20_000));
        let err = parse(&parens).unwrap_err();
        assert!(err.message.contains("levels deep"), "{}", err.message);

        let minus = format!("{}x", "-".repeat(20_000));
        assert!(parse(&minus).is_err());

        // a flat chain builds a tall tree without deep recursion
        let chain = vec!["x"; 20_000].join(" + ");
        assert!(parse(&chain).is_err());

        let cond = format!("if {}a > 1{} then 1 else 2", "(".repeat(20_000), ")".repeat(20_000));
        assert!(parse(&cond).is_err());

        let shallow = vec!["x"; 100].join(" + ");
        assert!(parse(&shallow).is_ok());
    }

    #[test]
    fn display_reparses_to_same_tree() {
        for text in [
            "x + y^2",
            "-a / (b - 3.5e-2)",
            "wpredict(r, time(Pb206), 12.5)",
            "if a <= 1 or not (b > 2 and c == 3) then ln(a) else exp(-b)",
        ] {
            let tree = parse(text).unwrap();
            assert_eq!(parse(&tree.to_string()).unwrap(), tree, "{text}");
        }
    }
}
