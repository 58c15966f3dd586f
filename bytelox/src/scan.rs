use std::{fmt, str::Chars};

use itertools::{self, MultiPeek};

use crate::{
    token::{Kind, Token},
    Position,
};

/// Error while scanning Lox source code.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScanError {
    /// A string literal ran into the end of the source buffer.
    #[error("{0} Error: Unterminated string.")]
    UnterminatedString(Position),
    /// A character that cannot start any token.
    #[error("{0} Error: Unexpected character '{1}'.")]
    UnexpectedCharacter(Position, char),
}

/// Scanner reads characters from the source buffer and groups them into a
/// sequence of tokens, produced on demand.
#[derive(Debug)]
pub struct Scanner<'a> {
    src: MultiPeek<Chars<'a>>,
    lexeme: String,
    pos: Position,
}

impl<'a> IntoIterator for Scanner<'a> {
    type Item = Result<Token, ScanError>;
    type IntoIter = Iter<'a>;
    fn into_iter(self) -> Self::IntoIter {
        Iter { scanner: self }
    }
}

impl<'a> Scanner<'a> {
    /// Create a scanner over the given source buffer.
    pub fn new(src: &'a str) -> Self {
        Self {
            src: itertools::multipeek(src.chars()),
            lexeme: String::new(),
            pos: Position::default(),
        }
    }

    /// Consume and return the next token, or `None` at end of input.
    pub fn scan(&mut self) -> Result<Option<Token>, ScanError> {
        self.skip_whitespace();
        self.lexeme.clear();
        let start = self.pos;
        let c = match self.advance() {
            None => return Ok(None),
            Some(c) => c,
        };

        Ok(Some(match c {
            '(' => self.make_token(Kind::LParen, start),
            ')' => self.make_token(Kind::RParen, start),
            '{' => self.make_token(Kind::LBrace, start),
            '}' => self.make_token(Kind::RBrace, start),
            ';' => self.make_token(Kind::Semicolon, start),
            ',' => self.make_token(Kind::Comma, start),
            '.' => self.make_token(Kind::Dot, start),
            '-' => self.make_token(Kind::Minus, start),
            '+' => self.make_token(Kind::Plus, start),
            '/' => self.make_token(Kind::Slash, start),
            '*' => self.make_token(Kind::Star, start),
            '!' => {
                let kind = if self.consume('=') { Kind::BangEqual } else { Kind::Bang };
                self.make_token(kind, start)
            }
            '=' => {
                let kind = if self.consume('=') { Kind::EqualEqual } else { Kind::Equal };
                self.make_token(kind, start)
            }
            '<' => {
                let kind = if self.consume('=') { Kind::LessEqual } else { Kind::Less };
                self.make_token(kind, start)
            }
            '>' => {
                let kind = if self.consume('=') { Kind::GreaterEqual } else { Kind::Greater };
                self.make_token(kind, start)
            }
            '"' => self.string(start)?,
            c if is_digit(c) => self.number(start),
            c if is_alpha(c) => self.identifier(start),
            c => return Err(ScanError::UnexpectedCharacter(start, c)),
        }))
    }

    fn identifier(&mut self, start: Position) -> Token {
        while self.peek_check(|c| is_alpha(c) || is_digit(c)) {
            self.advance();
        }
        let kind = match self.lexeme.as_str() {
            "and" => Kind::And,
            "class" => Kind::Class,
            "else" => Kind::Else,
            "false" => Kind::False,
            "for" => Kind::For,
            "fun" => Kind::Fun,
            "if" => Kind::If,
            "nil" => Kind::Nil,
            "or" => Kind::Or,
            "print" => Kind::Print,
            "return" => Kind::Return,
            "super" => Kind::Super,
            "this" => Kind::This,
            "true" => Kind::True,
            "var" => Kind::Var,
            "while" => Kind::While,
            _ => Kind::Ident,
        };
        self.make_token(kind, start)
    }

    fn number(&mut self, start: Position) -> Token {
        while self.peek_check(is_digit) {
            self.advance();
        }
        // A trailing '.' belongs to a property access, not the number.
        if self.peek_check(|c| c == '.') && self.peek_next_check(is_digit) {
            self.advance();
            while self.peek_check(is_digit) {
                self.advance();
            }
        }
        self.make_token(Kind::Number, start)
    }

    fn string(&mut self, start: Position) -> Result<Token, ScanError> {
        while self.peek_check(|c| c != '"') {
            self.advance();
        }
        if self.peek().is_none() {
            return Err(ScanError::UnterminatedString(start));
        }
        self.advance();
        Ok(self.make_token(Kind::Str, start))
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\r' | '\t' | '\n' => {
                    self.advance();
                }
                '/' => {
                    if !self.peek_next_check(|c| c == '/') {
                        return;
                    }
                    while self.peek_check(|c| c != '\n') {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn peek_check<F: Fn(char) -> bool>(&mut self, check: F) -> bool {
        self.peek().map(check).unwrap_or(false)
    }

    fn peek_next_check<F: Fn(char) -> bool>(&mut self, check: F) -> bool {
        self.peek_next().map(check).unwrap_or(false)
    }

    fn peek(&mut self) -> Option<char> {
        self.src.reset_peek();
        self.src.peek().copied()
    }

    fn peek_next(&mut self) -> Option<char> {
        self.src.reset_peek();
        match self.src.peek() {
            None => None,
            Some(_) => self.src.peek().copied(),
        }
    }

    fn advance(&mut self) -> Option<char> {
        self.src.next().map(|c| {
            self.lexeme.push(c);
            if c == '\n' {
                self.pos.next_line();
            } else {
                self.pos.next_column();
            }
            c
        })
    }

    fn consume(&mut self, expected: char) -> bool {
        match self.peek() {
            Some(c) if c == expected => {
                self.advance();
                true
            }
            _ => false,
        }
    }

    fn make_token(&mut self, kind: Kind, pos: Position) -> Token {
        Token {
            kind,
            lexeme: self.lexeme.drain(..).collect(),
            pos,
        }
    }
}

/// An iterator over the scanner's tokens.
pub struct Iter<'a> {
    scanner: Scanner<'a>,
}

impl fmt::Debug for Iter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").finish_non_exhaustive()
    }
}

impl Iterator for Iter<'_> {
    type Item = Result<Token, ScanError>;
    fn next(&mut self) -> Option<Self::Item> {
        self.scanner.scan().transpose()
    }
}

fn is_digit(c: char) -> bool {
    c.is_ascii_digit()
}

fn is_alpha(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}
