//! Tokenizer for the Ghostlang surface syntax
//!
//! A manual character walk that tracks line and column on every token, so
//! parse errors and the per-instruction line table point at real source
//! positions. Comments are `-- ...` or `// ...` to end of line. The lexer
//! peeks one character ahead for the two-character operators (`==`, `!=`,
//! `~=`, `<=`, `>=`, `..`, `&&`, `||`).

use ghostlang_core::ParseError;

/// Token payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),

    // Keywords
    KwVar,
    KwLocal,
    KwIf,
    KwElseif,
    KwElse,
    KwWhile,
    KwFor,
    KwIn,
    KwDo,
    KwEnd,
    KwFunction,
    KwReturn,
    KwRequire,
    KwTrue,
    KwFalse,
    KwNil,

    // Operators and punctuation
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Concat,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    Assign,
    Not,
    AndAnd,
    OrOr,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Semicolon,

    Eof,
}

impl TokenKind {
    /// Short rendering for "unexpected token" messages.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Number(n) => format!("number {n}"),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Ident(name) => format!("'{name}'"),
            TokenKind::KwVar => "'var'".to_string(),
            TokenKind::KwLocal => "'local'".to_string(),
            TokenKind::KwIf => "'if'".to_string(),
            TokenKind::KwElseif => "'elseif'".to_string(),
            TokenKind::KwElse => "'else'".to_string(),
            TokenKind::KwWhile => "'while'".to_string(),
            TokenKind::KwFor => "'for'".to_string(),
            TokenKind::KwIn => "'in'".to_string(),
            TokenKind::KwDo => "'do'".to_string(),
            TokenKind::KwEnd => "'end'".to_string(),
            TokenKind::KwFunction => "'function'".to_string(),
            TokenKind::KwReturn => "'return'".to_string(),
            TokenKind::KwRequire => "'require'".to_string(),
            TokenKind::KwTrue => "'true'".to_string(),
            TokenKind::KwFalse => "'false'".to_string(),
            TokenKind::KwNil => "'nil'".to_string(),
            TokenKind::Plus => "'+'".to_string(),
            TokenKind::Minus => "'-'".to_string(),
            TokenKind::Star => "'*'".to_string(),
            TokenKind::Slash => "'/'".to_string(),
            TokenKind::Percent => "'%'".to_string(),
            TokenKind::Concat => "'..'".to_string(),
            TokenKind::Lt => "'<'".to_string(),
            TokenKind::Le => "'<='".to_string(),
            TokenKind::Gt => "'>'".to_string(),
            TokenKind::Ge => "'>='".to_string(),
            TokenKind::EqEq => "'=='".to_string(),
            TokenKind::Ne => "'!='".to_string(),
            TokenKind::Assign => "'='".to_string(),
            TokenKind::Not => "'!'".to_string(),
            TokenKind::AndAnd => "'&&'".to_string(),
            TokenKind::OrOr => "'||'".to_string(),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::LBrace => "'{'".to_string(),
            TokenKind::RBrace => "'}'".to_string(),
            TokenKind::LBracket => "'['".to_string(),
            TokenKind::RBracket => "']'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::Dot => "'.'".to_string(),
            TokenKind::Semicolon => "';'".to_string(),
            TokenKind::Eof => "end of input".to_string(),
        }
    }
}

/// A token with its 1-indexed source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
}

fn keyword(ident: &str) -> Option<TokenKind> {
    match ident {
        "var" => Some(TokenKind::KwVar),
        "local" => Some(TokenKind::KwLocal),
        "if" => Some(TokenKind::KwIf),
        "elseif" => Some(TokenKind::KwElseif),
        "else" => Some(TokenKind::KwElse),
        "while" => Some(TokenKind::KwWhile),
        "for" => Some(TokenKind::KwFor),
        "in" => Some(TokenKind::KwIn),
        "do" => Some(TokenKind::KwDo),
        "end" => Some(TokenKind::KwEnd),
        "function" => Some(TokenKind::KwFunction),
        "return" => Some(TokenKind::KwReturn),
        "require" => Some(TokenKind::KwRequire),
        "true" => Some(TokenKind::KwTrue),
        "false" => Some(TokenKind::KwFalse),
        "nil" => Some(TokenKind::KwNil),
        _ => None,
    }
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
}

/// Tokenize `source`, appending a final `Eof` token.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        column: 1,
    };
    lexer.run()
}

impl Lexer {
    fn run(&mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let (line, column) = (self.line, self.column);
            let Some(ch) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    line,
                    column,
                });
                return Ok(tokens);
            };

            let kind = if ch.is_ascii_digit() {
                self.number(line, column)?
            } else if ch == '"' {
                self.string(line, column)?
            } else if ch.is_alphabetic() || ch == '_' {
                self.ident()
            } else {
                self.operator(line, column)?
            };
            tokens.push(Token { kind, line, column });
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(ch) if ch.is_whitespace() => {
                    self.bump();
                }
                Some('-') if self.peek_next() == Some('-') => self.skip_line(),
                Some('/') if self.peek_next() == Some('/') => self.skip_line(),
                _ => return,
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == '\n' {
                return;
            }
            self.bump();
        }
    }

    fn number(&mut self, line: u32, column: u32) -> Result<TokenKind, ParseError> {
        let mut text = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                text.push(ch);
                self.bump();
            } else {
                break;
            }
        }
        // A fraction only when a digit follows the dot; `1..2` stays a
        // number followed by the concat operator.
        if self.peek() == Some('.') && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            text.push('.');
            self.bump();
            while let Some(ch) = self.peek() {
                if ch.is_ascii_digit() {
                    text.push(ch);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        let value: f64 = text
            .parse()
            .map_err(|_| ParseError::new(line, column, format!("malformed number '{text}'")))?;
        Ok(TokenKind::Number(value))
    }

    fn string(&mut self, line: u32, column: u32) -> Result<TokenKind, ParseError> {
        self.bump(); // opening quote
        let mut text = String::new();
        loop {
            match self.bump() {
                None => {
                    return Err(ParseError::new(line, column, "unterminated string literal"));
                }
                Some('"') => return Ok(TokenKind::Str(text)),
                Some('\\') => match self.bump() {
                    Some('"') => text.push('"'),
                    Some('\\') => text.push('\\'),
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some(other) => {
                        return Err(ParseError::new(
                            self.line,
                            self.column,
                            format!("invalid escape sequence '\\{other}'"),
                        ));
                    }
                    None => {
                        return Err(ParseError::new(line, column, "unterminated string literal"));
                    }
                },
                Some(other) => text.push(other),
            }
        }
    }

    fn ident(&mut self) -> TokenKind {
        let mut text = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_alphanumeric() || ch == '_' {
                text.push(ch);
                self.bump();
            } else {
                break;
            }
        }
        keyword(&text).unwrap_or(TokenKind::Ident(text))
    }

    fn operator(&mut self, line: u32, column: u32) -> Result<TokenKind, ParseError> {
        let ch = self.bump().unwrap_or_default();
        let kind = match ch {
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '.' => {
                if self.peek() == Some('.') {
                    self.bump();
                    TokenKind::Concat
                } else {
                    TokenKind::Dot
                }
            }
            '=' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::EqEq
                } else {
                    TokenKind::Assign
                }
            }
            '!' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Ne
                } else {
                    TokenKind::Not
                }
            }
            '~' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Ne
                } else {
                    return Err(ParseError::new(line, column, "unexpected character '~'"));
                }
            }
            '<' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '&' => {
                if self.peek() == Some('&') {
                    self.bump();
                    TokenKind::AndAnd
                } else {
                    return Err(ParseError::new(line, column, "unexpected character '&'"));
                }
            }
            '|' => {
                if self.peek() == Some('|') {
                    self.bump();
                    TokenKind::OrOr
                } else {
                    return Err(ParseError::new(line, column, "unexpected character '|'"));
                }
            }
            other => {
                return Err(ParseError::new(
                    line,
                    column,
                    format!("unexpected character '{}'", other.escape_default()),
                ));
            }
        };
        Ok(kind)
    }
}
