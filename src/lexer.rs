//! Character-level scanner.
//!
//! Produces one raw token at a time with its source position and a
//! `line_break_before` bit used for automatic semicolon insertion. The
//! lexer itself decides whether a `/` starts a regular expression by
//! tracking the class of the previous token.

use std::rc::Rc;

use crate::error::{ScriptError, ScriptResult};
use crate::token::{Token, TokenKind};

/// Saved scanner state for speculative lookahead.
#[derive(Clone)]
pub struct LexState {
    pos: usize,
    line: u32,
    column: u32,
    tok: Token,
    line_break_before: bool,
    regex_allowed: bool,
}

/// The scanner.
pub struct Lexer<'a> {
    /// Source code.
    source: &'a str,
    /// Source bytes.
    bytes: &'a [u8],
    /// Source file name for diagnostics.
    file: String,
    /// Current position.
    pos: usize,
    /// Current line (1-based).
    line: u32,
    /// Current column (1-based).
    column: u32,
    /// Start line of the current token.
    token_line: u32,
    /// Start column of the current token.
    token_column: u32,
    /// The current token.
    pub tok: Token,
    /// True iff a newline was skipped before the current token.
    pub line_break_before: bool,
    /// Whether a `/` would start a regex here.
    regex_allowed: bool,
}

impl<'a> Lexer<'a> {
    /// Create a lexer and prime the first token.
    pub fn new(source: &'a str, file: &str, line: u32) -> ScriptResult<Self> {
        let mut lexer = Lexer {
            source,
            bytes: source.as_bytes(),
            file: file.into(),
            pos: 0,
            line: line.max(1),
            column: 1,
            token_line: line.max(1),
            token_column: 1,
            tok: Token::new(TokenKind::Eof, line.max(1), 1),
            line_break_before: false,
            regex_allowed: true,
        };
        lexer.advance()?;
        Ok(lexer)
    }

    /// Source file name.
    pub fn file(&self) -> &str {
        &self.file
    }

    /// Line of the current token.
    pub fn token_line(&self) -> u32 {
        self.tok.line as u32
    }

    /// Column of the current token.
    pub fn token_column(&self) -> u32 {
        self.tok.column as u32
    }

    /// Save the scanner state.
    pub fn save(&self) -> LexState {
        LexState {
            pos: self.pos,
            line: self.line,
            column: self.column,
            tok: self.tok.clone(),
            line_break_before: self.line_break_before,
            regex_allowed: self.regex_allowed,
        }
    }

    /// Restore a saved state.
    pub fn reset(&mut self, state: LexState) {
        self.pos = state.pos;
        self.line = state.line;
        self.column = state.column;
        self.tok = state.tok;
        self.line_break_before = state.line_break_before;
        self.regex_allowed = state.regex_allowed;
    }

    /// Fail with a syntax error at the current token.
    pub fn syntax_error<M: Into<String>>(&self, msg: M) -> ScriptError {
        ScriptError::at(
            crate::error::ErrorKind::SyntaxError,
            msg,
            self.file.clone(),
            self.token_line(),
            self.token_column(),
        )
    }

    /// Fail unless the current token has the expected kind (payloads
    /// ignored) or the alternate one.
    pub fn check(&self, expected: &TokenKind, alternate: Option<&TokenKind>) -> ScriptResult<()> {
        if self.tok.kind.same_kind(expected)
            || alternate.map_or(false, |alt| self.tok.kind.same_kind(alt))
        {
            Ok(())
        } else {
            Err(self.syntax_error(format!("got '{}' expected '{}'", self.tok.kind, expected)))
        }
    }

    /// `check` then advance.
    pub fn match_tok(&mut self, expected: &TokenKind, alternate: Option<&TokenKind>) -> ScriptResult<()> {
        self.check(expected, alternate)?;
        self.advance()
    }

    /// Scan the next token into `self.tok`.
    pub fn advance(&mut self) -> ScriptResult<()> {
        self.line_break_before = false;
        self.skip_whitespace_and_comments();

        self.token_line = self.line;
        self.token_column = self.column;

        if self.is_eof() {
            self.tok = self.make_token(TokenKind::Eof);
            return Ok(());
        }

        let ch = self.current();

        let kind = if ch.is_ascii_digit() || (ch == '.' && self.peek().is_ascii_digit()) {
            self.scan_number()?
        } else if ch == '"' || ch == '\'' {
            self.scan_string(ch)?
        } else if is_id_start(ch) {
            self.scan_identifier()
        } else if ch == '/' && self.regex_allowed && self.peek() != '/' && self.peek() != '*' {
            self.scan_regexp()?
        } else {
            self.scan_punctuator()?
        };

        self.regex_allowed = regex_can_follow(&kind);
        self.tok = self.make_token(kind);
        Ok(())
    }

    /// Skip whitespace and comments, tracking line breaks.
    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while !self.is_eof() && is_whitespace(self.current()) {
                if self.current() == '\n' {
                    self.line_break_before = true;
                    self.line += 1;
                    self.column = 1;
                    self.pos += 1;
                } else {
                    self.bump();
                }
            }

            if self.current() == '/' && self.peek() == '/' {
                while !self.is_eof() && self.current() != '\n' {
                    self.bump();
                }
                continue;
            }

            if self.current() == '/' && self.peek() == '*' {
                self.bump();
                self.bump();
                while !self.is_eof() {
                    if self.current() == '*' && self.peek() == '/' {
                        self.bump();
                        self.bump();
                        break;
                    }
                    if self.current() == '\n' {
                        self.line_break_before = true;
                        self.line += 1;
                        self.column = 1;
                        self.pos += 1;
                    } else {
                        self.bump();
                    }
                }
                continue;
            }

            break;
        }
    }

    /// Scan a numeric literal: decimal, hex `0x`, octal `0nnn`, or a
    /// double with fraction/exponent.
    fn scan_number(&mut self) -> ScriptResult<TokenKind> {
        let start = self.pos;

        if self.current() == '0' && matches!(self.peek(), 'x' | 'X') {
            self.bump();
            self.bump();
            let digits = self.pos;
            while !self.is_eof() && self.current().is_ascii_hexdigit() {
                self.bump();
            }
            if self.pos == digits {
                return Err(self.pos_error("invalid hex literal"));
            }
            let value = i64::from_str_radix(&self.source[digits..self.pos], 16)
                .map_err(|_| self.pos_error("hex literal out of range"))?;
            return Ok(int_or_float(value));
        }

        let mut is_float = self.current() == '.';
        while !self.is_eof() && self.current().is_ascii_digit() {
            self.bump();
        }
        if self.current() == '.' && self.peek().is_ascii_digit() {
            is_float = true;
            self.bump();
            while !self.is_eof() && self.current().is_ascii_digit() {
                self.bump();
            }
        }
        if matches!(self.current(), 'e' | 'E') {
            is_float = true;
            self.bump();
            if matches!(self.current(), '+' | '-') {
                self.bump();
            }
            while !self.is_eof() && self.current().is_ascii_digit() {
                self.bump();
            }
        }

        let text = &self.source[start..self.pos];
        if is_float {
            let value: f64 = text.parse().map_err(|_| self.pos_error("invalid number"))?;
            return Ok(TokenKind::Float(value));
        }

        // Octal when it looks like 0nnn and stays in [0-7].
        if text.len() > 1
            && text.starts_with('0')
            && text[1..].bytes().all(|b| (b'0'..=b'7').contains(&b))
        {
            let value = i64::from_str_radix(&text[1..], 8)
                .map_err(|_| self.pos_error("octal literal out of range"))?;
            return Ok(int_or_float(value));
        }

        match text.parse::<i64>() {
            Ok(value) => Ok(int_or_float(value)),
            Err(_) => {
                let value: f64 = text.parse().map_err(|_| self.pos_error("invalid number"))?;
                Ok(TokenKind::Float(value))
            }
        }
    }

    /// Scan a string literal.
    fn scan_string(&mut self, quote: char) -> ScriptResult<TokenKind> {
        self.bump(); // opening quote
        let mut value = String::new();

        while !self.is_eof() && self.current() != quote {
            if self.current() == '\\' {
                self.bump();
                match self.current() {
                    'n' => {
                        value.push('\n');
                        self.bump();
                    }
                    'r' => {
                        value.push('\r');
                        self.bump();
                    }
                    't' => {
                        value.push('\t');
                        self.bump();
                    }
                    '\\' => {
                        value.push('\\');
                        self.bump();
                    }
                    '\'' => {
                        value.push('\'');
                        self.bump();
                    }
                    '"' => {
                        value.push('"');
                        self.bump();
                    }
                    'x' => {
                        self.bump();
                        let code = self.scan_hex_digits(2)?;
                        if let Some(ch) = char::from_u32(code) {
                            value.push(ch);
                        }
                    }
                    'u' => {
                        self.bump();
                        let code = self.scan_hex_digits(4)?;
                        if let Some(ch) = char::from_u32(code) {
                            value.push(ch);
                        }
                    }
                    c if ('0'..='7').contains(&c) => {
                        // octal escape, up to three digits; covers \0
                        let mut code: u32 = 0;
                        let mut count = 0;
                        while count < 3 && ('0'..='7').contains(&self.current()) {
                            code = code * 8 + self.current().to_digit(8).unwrap();
                            self.bump();
                            count += 1;
                        }
                        if let Some(ch) = char::from_u32(code) {
                            value.push(ch);
                        }
                    }
                    '\n' => {
                        // line continuation
                        self.line += 1;
                        self.column = 1;
                        self.pos += 1;
                    }
                    ch => {
                        value.push(ch);
                        self.bump();
                    }
                }
            } else if self.current() == '\n' {
                return Err(self.pos_error("unterminated string literal"));
            } else {
                value.push(self.current());
                self.bump();
            }
        }

        if self.is_eof() {
            return Err(self.pos_error("unterminated string literal"));
        }

        self.bump(); // closing quote
        Ok(TokenKind::Str(Rc::new(value)))
    }

    /// Scan an identifier or keyword.
    fn scan_identifier(&mut self) -> TokenKind {
        let start = self.pos;
        while !self.is_eof() && is_id_continue(self.current()) {
            self.bump();
        }
        let text = &self.source[start..self.pos];
        TokenKind::keyword_from_str(text).unwrap_or_else(|| TokenKind::Ident(Rc::new(text.into())))
    }

    /// Scan a regex literal; the leading `/` is still current.
    fn scan_regexp(&mut self) -> ScriptResult<TokenKind> {
        self.bump(); // /
        let start = self.pos;
        let mut in_class = false;
        loop {
            if self.is_eof() || self.current() == '\n' {
                return Err(self.pos_error("unterminated regular expression"));
            }
            match self.current() {
                '\\' => {
                    self.bump();
                    if !self.is_eof() {
                        self.bump();
                    }
                }
                '[' => {
                    in_class = true;
                    self.bump();
                }
                ']' => {
                    in_class = false;
                    self.bump();
                }
                '/' if !in_class => break,
                _ => self.bump(),
            }
        }
        let pattern = String::from(&self.source[start..self.pos]);
        self.bump(); // closing /
        let flags_start = self.pos;
        while !self.is_eof() && matches!(self.current(), 'g' | 'i' | 'm' | 'y') {
            self.bump();
        }
        let flags = String::from(&self.source[flags_start..self.pos]);
        Ok(TokenKind::RegExp { pattern: Rc::new(pattern), flags: Rc::new(flags) })
    }

    /// Scan a punctuator.
    fn scan_punctuator(&mut self) -> ScriptResult<TokenKind> {
        let ch = self.current();
        self.bump();

        let kind = match ch {
            '{' => TokenKind::LeftBrace,
            '}' => TokenKind::RightBrace,
            '(' => TokenKind::LeftParen,
            ')' => TokenKind::RightParen,
            '[' => TokenKind::LeftBracket,
            ']' => TokenKind::RightBracket,
            ';' => TokenKind::Semicolon,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '?' => TokenKind::Question,
            '~' => TokenKind::Tilde,
            '.' => TokenKind::Dot,

            '<' => {
                if self.current() == '=' {
                    self.bump();
                    TokenKind::LessEqual
                } else if self.current() == '<' {
                    self.bump();
                    if self.current() == '=' {
                        self.bump();
                        TokenKind::LeftShiftAssign
                    } else {
                        TokenKind::LeftShift
                    }
                } else {
                    TokenKind::LessThan
                }
            }

            '>' => {
                if self.current() == '=' {
                    self.bump();
                    TokenKind::GreaterEqual
                } else if self.current() == '>' {
                    self.bump();
                    if self.current() == '>' {
                        self.bump();
                        if self.current() == '=' {
                            self.bump();
                            TokenKind::UnsignedRightShiftAssign
                        } else {
                            TokenKind::UnsignedRightShift
                        }
                    } else if self.current() == '=' {
                        self.bump();
                        TokenKind::RightShiftAssign
                    } else {
                        TokenKind::RightShift
                    }
                } else {
                    TokenKind::GreaterThan
                }
            }

            '=' => {
                if self.current() == '=' {
                    self.bump();
                    if self.current() == '=' {
                        self.bump();
                        TokenKind::StrictEqual
                    } else {
                        TokenKind::Equal
                    }
                } else if self.current() == '>' {
                    self.bump();
                    TokenKind::Arrow
                } else {
                    TokenKind::Assign
                }
            }

            '!' => {
                if self.current() == '=' {
                    self.bump();
                    if self.current() == '=' {
                        self.bump();
                        TokenKind::StrictNotEqual
                    } else {
                        TokenKind::NotEqual
                    }
                } else {
                    TokenKind::Bang
                }
            }

            '+' => {
                if self.current() == '+' {
                    self.bump();
                    TokenKind::PlusPlus
                } else if self.current() == '=' {
                    self.bump();
                    TokenKind::PlusAssign
                } else {
                    TokenKind::Plus
                }
            }

            '-' => {
                if self.current() == '-' {
                    self.bump();
                    TokenKind::MinusMinus
                } else if self.current() == '=' {
                    self.bump();
                    TokenKind::MinusAssign
                } else {
                    TokenKind::Minus
                }
            }

            '*' => {
                if self.current() == '=' {
                    self.bump();
                    TokenKind::StarAssign
                } else {
                    TokenKind::Star
                }
            }

            '/' => {
                if self.current() == '=' {
                    self.bump();
                    TokenKind::SlashAssign
                } else {
                    TokenKind::Slash
                }
            }

            '%' => {
                if self.current() == '=' {
                    self.bump();
                    TokenKind::PercentAssign
                } else {
                    TokenKind::Percent
                }
            }

            '&' => {
                if self.current() == '&' {
                    self.bump();
                    TokenKind::AndAnd
                } else if self.current() == '=' {
                    self.bump();
                    TokenKind::AmpersandAssign
                } else {
                    TokenKind::Ampersand
                }
            }

            '|' => {
                if self.current() == '|' {
                    self.bump();
                    TokenKind::OrOr
                } else if self.current() == '=' {
                    self.bump();
                    TokenKind::PipeAssign
                } else {
                    TokenKind::Pipe
                }
            }

            '^' => {
                if self.current() == '=' {
                    self.bump();
                    TokenKind::CaretAssign
                } else {
                    TokenKind::Caret
                }
            }

            other => return Err(self.pos_error(format!("unexpected character '{}'", other))),
        };

        Ok(kind)
    }

    /// Scan exactly `count` hex digits.
    fn scan_hex_digits(&mut self, count: usize) -> ScriptResult<u32> {
        let mut value: u32 = 0;
        for _ in 0..count {
            if !self.current().is_ascii_hexdigit() {
                return Err(self.pos_error("invalid hex escape"));
            }
            value = value * 16 + self.current().to_digit(16).unwrap();
            self.bump();
        }
        Ok(value)
    }

    // Helper methods

    fn is_eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn current(&self) -> char {
        if self.is_eof() {
            '\0'
        } else {
            self.bytes[self.pos] as char
        }
    }

    fn peek(&self) -> char {
        if self.pos + 1 >= self.bytes.len() {
            '\0'
        } else {
            self.bytes[self.pos + 1] as char
        }
    }

    fn bump(&mut self) {
        if !self.is_eof() {
            self.pos += 1;
            self.column += 1;
        }
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.token_line, self.token_column)
    }

    fn pos_error<M: Into<String>>(&self, msg: M) -> ScriptError {
        ScriptError::at(
            crate::error::ErrorKind::SyntaxError,
            msg,
            self.file.clone(),
            self.token_line,
            self.token_column,
        )
    }
}

/// Fit an i64 literal into the Int kind, spilling to Float.
fn int_or_float(value: i64) -> TokenKind {
    if let Ok(v) = i32::try_from(value) {
        TokenKind::Int(v)
    } else {
        TokenKind::Float(value as f64)
    }
}

/// Whether a `/` after a token of this kind starts a regex.
fn regex_can_follow(kind: &TokenKind) -> bool {
    !matches!(
        kind,
        TokenKind::Ident(_)
            | TokenKind::Int(_)
            | TokenKind::Float(_)
            | TokenKind::Str(_)
            | TokenKind::RegExp { .. }
            | TokenKind::RightParen
            | TokenKind::RightBracket
            | TokenKind::RightBrace
            | TokenKind::PlusPlus
            | TokenKind::MinusMinus
            | TokenKind::True
            | TokenKind::False
            | TokenKind::Null
    )
}

/// Check if character is whitespace.
fn is_whitespace(ch: char) -> bool {
    matches!(ch, ' ' | '\t' | '\n' | '\r' | '\x0B' | '\x0C')
}

/// Check if character can start an identifier.
fn is_id_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_' || ch == '$'
}

/// Check if character can continue an identifier.
fn is_id_continue(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '$'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source, "test", 1).unwrap();
        let mut kinds = Vec::new();
        while !lexer.tok.is_eof() {
            kinds.push(lexer.tok.kind.clone());
            lexer.advance().unwrap();
        }
        kinds
    }

    #[test]
    fn test_basic_tokens() {
        let kinds = all_kinds("var x = 42;");
        assert!(matches!(kinds[0], TokenKind::Var));
        assert!(matches!(kinds[1], TokenKind::Ident(_)));
        assert!(matches!(kinds[2], TokenKind::Assign));
        assert!(matches!(kinds[3], TokenKind::Int(42)));
        assert!(matches!(kinds[4], TokenKind::Semicolon));
    }

    #[test]
    fn test_number_kinds() {
        assert!(matches!(all_kinds("0xFF")[0], TokenKind::Int(255)));
        assert!(matches!(all_kinds("017")[0], TokenKind::Int(15)));
        assert!(matches!(all_kinds("1.5")[0], TokenKind::Float(f) if f == 1.5));
        assert!(matches!(all_kinds("1e3")[0], TokenKind::Float(f) if f == 1000.0));
        assert!(matches!(all_kinds("3000000000")[0], TokenKind::Float(_)));
    }

    #[test]
    fn test_string_escapes() {
        let kinds = all_kinds(r#"'a\n\t\x41B\0'"#);
        match &kinds[0] {
            TokenKind::Str(s) => assert_eq!(s.as_str(), "a\n\tAB\0"),
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_string() {
        assert!(Lexer::new("'abc", "test", 1).is_err());
    }

    #[test]
    fn test_regex_context() {
        // After `=` a slash starts a regex ...
        let kinds = all_kinds("x = /ab+c/i");
        assert!(matches!(
            &kinds[2],
            TokenKind::RegExp { pattern, flags }
                if pattern.as_str() == "ab+c" && flags.as_str() == "i"
        ));
        // ... after an operand it divides.
        let kinds = all_kinds("a / b / c");
        assert!(matches!(kinds[1], TokenKind::Slash));
        assert!(matches!(kinds[3], TokenKind::Slash));
    }

    #[test]
    fn test_line_break_before() {
        let mut lexer = Lexer::new("a\nb c", "test", 1).unwrap();
        assert!(!lexer.line_break_before);
        lexer.advance().unwrap(); // b
        assert!(lexer.line_break_before);
        lexer.advance().unwrap(); // c
        assert!(!lexer.line_break_before);
    }

    #[test]
    fn test_comments_count_as_line_breaks() {
        let mut lexer = Lexer::new("a /* x\ny */ b", "test", 1).unwrap();
        lexer.advance().unwrap(); // b
        assert!(lexer.line_break_before);
        assert_eq!(lexer.token_line(), 2);
    }

    #[test]
    fn test_save_reset() {
        let mut lexer = Lexer::new("a b c", "test", 1).unwrap();
        let saved = lexer.save();
        lexer.advance().unwrap();
        lexer.advance().unwrap();
        assert!(matches!(&lexer.tok.kind, TokenKind::Ident(n) if n.as_str() == "c"));
        lexer.reset(saved);
        assert!(matches!(&lexer.tok.kind, TokenKind::Ident(n) if n.as_str() == "a"));
    }

    #[test]
    fn test_positions() {
        let mut lexer = Lexer::new("ab\n  cd", "test", 1).unwrap();
        assert_eq!((lexer.token_line(), lexer.token_column()), (1, 1));
        lexer.advance().unwrap();
        assert_eq!((lexer.token_line(), lexer.token_column()), (2, 3));
    }

    #[test]
    fn test_check_and_match() {
        let mut lexer = Lexer::new("var x", "test", 1).unwrap();
        assert!(lexer.check(&TokenKind::Var, None).is_ok());
        assert!(lexer.check(&TokenKind::Let, Some(&TokenKind::Var)).is_ok());
        lexer.match_tok(&TokenKind::Var, None).unwrap();
        assert!(lexer.check(&TokenKind::Let, None).is_err());
    }
}
