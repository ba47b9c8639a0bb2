use crate::error::SyntaxError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    If,
    Then,
    Else,
    And,
    Or,
    Not,
    Eof,
}

impl TokenKind {
    /// Human-readable form used in error messages.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Number(v) => format!("number {v}"),
            TokenKind::Ident(name) => format!("'{name}'"),
            TokenKind::Plus => "'+'".into(),
            TokenKind::Minus => "'-'".into(),
            TokenKind::Star => "'*'".into(),
            TokenKind::Slash => "'/'".into(),
            TokenKind::Caret => "'^'".into(),
            TokenKind::LParen => "'('".into(),
            TokenKind::RParen => "')'".into(),
            TokenKind::Comma => "','".into(),
            TokenKind::Lt => "'<'".into(),
            TokenKind::Le => "'<='".into(),
            TokenKind::Gt => "'>'".into(),
            TokenKind::Ge => "'>='".into(),
            TokenKind::EqEq => "'=='".into(),
            TokenKind::Ne => "'!='".into(),
            TokenKind::If => "'if'".into(),
            TokenKind::Then => "'then'".into(),
            TokenKind::Else => "'else'".into(),
            TokenKind::And => "'and'".into(),
            TokenKind::Or => "'or'".into(),
            TokenKind::Not => "'not'".into(),
            TokenKind::Eof => "end of formula".into(),
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            TokenKind::Lt
                | TokenKind::Le
                | TokenKind::Gt
                | TokenKind::Ge
                | TokenKind::EqEq
                | TokenKind::Ne
        )
    }
}

/// A token and the byte offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: usize,
}

pub const RESERVED_WORDS: &[&str] = &["if", "then", "else", "and", "or", "not"];

/// Split formula text into tokens. The last token is always `Eof`.
pub fn tokenize(input: &str) -> Result<Vec<Token>, SyntaxError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;

        // Two-character operators first.
        if i + 1 < bytes.len() {
            let two = match (c, bytes[i + 1]) {
                (b'<', b'=') => Some(TokenKind::Le),
                (b'>', b'=') => Some(TokenKind::Ge),
                (b'=', b'=') => Some(TokenKind::EqEq),
                (b'!', b'=') => Some(TokenKind::Ne),
                _ => None,
            };
            if let Some(kind) = two {
                tokens.push(Token { kind, pos: start });
                i += 2;
                continue;
            }
        }

        let single = match c {
            b'+' => Some(TokenKind::Plus),
            b'-' => Some(TokenKind::Minus),
            b'*' => Some(TokenKind::Star),
            b'/' => Some(TokenKind::Slash),
            b'^' => Some(TokenKind::Caret),
            b'(' => Some(TokenKind::LParen),
            b')' => Some(TokenKind::RParen),
            b',' => Some(TokenKind::Comma),
            b'<' => Some(TokenKind::Lt),
            b'>' => Some(TokenKind::Gt),
            _ => None,
        };
        if let Some(kind) = single {
            tokens.push(Token { kind, pos: start });
            i += 1;
            continue;
        }

        let starts_number =
            c.is_ascii_digit() || (c == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit));
        if starts_number {
            i = scan_number(bytes, i);
            let text = &input[start..i];
            let value: f64 = text
                .parse()
                .map_err(|_| SyntaxError::new(start, format!("malformed number '{text}'")))?;
            if !value.is_finite() {
                return Err(SyntaxError::new(start, format!("number '{text}' is out of range")));
            }
            tokens.push(Token {
                kind: TokenKind::Number(value),
                pos: start,
            });
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let word = &input[start..i];
            let kind = match word {
                "if" => TokenKind::If,
                "then" => TokenKind::Then,
                "else" => TokenKind::Else,
                "and" => TokenKind::And,
                "or" => TokenKind::Or,
                "not" => TokenKind::Not,
                _ => TokenKind::Ident(word.to_string()),
            };
            tokens.push(Token { kind, pos: start });
            continue;
        }

        let message = match c {
            b'=' => "single '=' is not an operator; use '==' to compare".to_string(),
            b'!' => "'!' must be followed by '='; use 'not' to negate".to_string(),
            _ => {
                let ch = input[start..].chars().next().unwrap_or('?');
                format!("unexpected character '{ch}'")
            }
        };
        return Err(SyntaxError::new(start, message));
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        pos: input.len(),
    });
    Ok(tokens)
}

/// Advance past `digits [. digits] [(e|E) [+|-] digits]`.
fn scan_number(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    i
}
