//! Hand-written JKSPEC lexer.
//!
//! ASCII-whitespace skipping, `//` and `#` line comments, `/* */` block
//! comments (unterminated is an error at EOF), double-quoted strings with
//! `\n \t \r \\ \"` escapes (any other `\x` passes through literally),
//! single-char symbols `{ } [ ] : ,`, and identifiers for everything else.
//! One token of lookahead.

use crate::error::{DslError, DslResult, Location};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Identifier,
    Str,
    Symbol,
    End,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub location: Location,
}

impl Token {
    fn end(location: Location) -> Self {
        Token { kind: TokenKind::End, text: String::new(), location }
    }
}

pub struct Lexer {
    src: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    peeked: Option<Token>,
}

fn is_symbol_char(c: char) -> bool {
    matches!(c, '{' | '}' | '[' | ']' | ':' | ',')
}

impl Lexer {
    pub fn new(src: &str) -> Self {
        Lexer { src: src.chars().collect(), pos: 0, line: 1, col: 1, peeked: None }
    }

    pub fn peek(&mut self) -> DslResult<Token> {
        if self.peeked.is_none() {
            self.peeked = Some(self.next_impl()?);
        }
        Ok(self.peeked.clone().expect("just filled"))
    }

    pub fn next(&mut self) -> DslResult<Token> {
        if let Some(tok) = self.peeked.take() {
            return Ok(tok);
        }
        self.next_impl()
    }

    fn eof(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn curr(&self) -> char {
        if self.eof() {
            '\0'
        } else {
            self.src[self.pos]
        }
    }

    fn next_char(&self) -> char {
        if self.pos + 1 < self.src.len() {
            self.src[self.pos + 1]
        } else {
            '\0'
        }
    }

    fn advance(&mut self) {
        if self.eof() {
            return;
        }
        if self.src[self.pos] == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
    }

    fn here(&self) -> Location {
        Location::new(self.line, self.col)
    }

    fn skip_line_comment(&mut self) {
        while !self.eof() && self.curr() != '\n' {
            self.advance();
        }
    }

    fn skip_block_comment(&mut self) -> DslResult<()> {
        let start = self.here();
        self.advance();
        self.advance();
        while !self.eof() {
            if self.curr() == '*' && self.next_char() == '/' {
                self.advance();
                self.advance();
                return Ok(());
            }
            self.advance();
        }
        Err(DslError::parse(start, "unterminated block comment"))
    }

    fn skip_ignorable(&mut self) -> DslResult<()> {
        loop {
            if self.eof() {
                return Ok(());
            }
            let c = self.curr();
            if c.is_ascii_whitespace() {
                self.advance();
                continue;
            }
            if c == '/' && self.next_char() == '*' {
                self.skip_block_comment()?;
                continue;
            }
            if (c == '/' && self.next_char() == '/') || c == '#' {
                self.skip_line_comment();
                continue;
            }
            return Ok(());
        }
    }

    fn lex_string(&mut self) -> DslResult<Token> {
        let location = self.here();
        let mut out = String::new();
        self.advance(); // opening quote
        while !self.eof() {
            let c = self.curr();
            if c == '"' {
                self.advance();
                return Ok(Token { kind: TokenKind::Str, text: out, location });
            }
            if c == '\\' {
                self.advance();
                if self.eof() {
                    break;
                }
                match self.curr() {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '\\' => out.push('\\'),
                    '"' => out.push('"'),
                    other => out.push(other),
                }
                self.advance();
                continue;
            }
            out.push(c);
            self.advance();
        }
        Err(DslError::parse(location, "unterminated string literal"))
    }

    fn lex_identifier(&mut self) -> Token {
        let location = self.here();
        let mut out = String::new();
        while !self.eof() {
            let c = self.curr();
            if c.is_ascii_whitespace() || is_symbol_char(c) || c == '"' {
                break;
            }
            if c == '/' && (self.next_char() == '*' || self.next_char() == '/') {
                break;
            }
            if c == '#' {
                break;
            }
            out.push(c);
            self.advance();
        }
        Token { kind: TokenKind::Identifier, text: out, location }
    }

    fn next_impl(&mut self) -> DslResult<Token> {
        self.skip_ignorable()?;
        if self.eof() {
            return Ok(Token::end(self.here()));
        }
        let c = self.curr();
        if is_symbol_char(c) {
            let location = self.here();
            self.advance();
            return Ok(Token { kind: TokenKind::Symbol, text: c.to_string(), location });
        }
        if c == '"' {
            return self.lex_string();
        }
        Ok(self.lex_identifier())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_tokens(src: &str) -> Vec<Token> {
        let mut lex = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let tok = lex.next().unwrap();
            let end = tok.kind == TokenKind::End;
            out.push(tok);
            if end {
                break;
            }
        }
        out
    }

    #[test]
    fn skips_all_three_comment_styles() {
        let toks = all_tokens("// line\n# hash\n/* block\nstill */ name");
        assert_eq!(toks[0].text, "name");
        assert_eq!(toks[0].location.line, 4);
    }

    #[test]
    fn unterminated_block_comment_errors() {
        let mut lex = Lexer::new("/* never closed");
        assert!(lex.next().is_err());
    }

    #[test]
    fn string_escapes() {
        let toks = all_tokens(r#""a\tb\"c\qd""#);
        assert_eq!(toks[0].kind, TokenKind::Str);
        assert_eq!(toks[0].text, "a\tb\"cqd");
    }

    #[test]
    fn unterminated_string_errors() {
        let mut lex = Lexer::new("\"open");
        assert!(lex.next().is_err());
    }

    #[test]
    fn symbols_and_lookahead() {
        let mut lex = Lexer::new("{ key : [1, 2] }");
        assert_eq!(lex.peek().unwrap().text, "{");
        assert_eq!(lex.next().unwrap().text, "{");
        assert_eq!(lex.next().unwrap().text, "key");
        assert_eq!(lex.next().unwrap().text, ":");
        assert_eq!(lex.next().unwrap().text, "[");
        assert_eq!(lex.next().unwrap().text, "1");
    }
}
