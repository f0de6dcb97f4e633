//! Pre-parser.
//!
//! Drives the lexer over one program and produces the flat preprocessed
//! token vector the evaluator walks. Structural work happens here, once:
//! function bodies are folded into payload tokens, `var`/`let`/function
//! declarations are hoisted into forwarder payloads, destructuring
//! patterns are flattened to key paths, object/array literals become
//! element tables, and loop labels and `break`/`continue` targets are
//! validated. The evaluator can then assume a well-formed stream.

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use tracing::trace;

use crate::error::ScriptResult;
use crate::lexer::Lexer;
use crate::token::{
    DestructuringData, DestructuringTarget, FncData, ForwardData, LiteralMode,
    ObjectLiteralData, ObjectLiteralElement, Token, TokenKind,
};

/// A pending hoisting scope: where its forwarder token sits in the
/// destination vector and whether it is a function-level scope (the
/// target of `var` hoisting) or a block-level let scope.
struct ForwardFrame {
    pos: usize,
    data: Rc<RefCell<ForwardData>>,
    fnc_scope: bool,
}

/// The tokenizer.
pub struct Tokenizer<'a> {
    lexer: Lexer<'a>,
    forwarders: Vec<ForwardFrame>,
    /// Every label currently in scope (break targets).
    labels: Vec<String>,
    /// Labels attached to loops (continue targets).
    loop_labels: Vec<String>,
    loop_depth: usize,
    switch_depth: usize,
}

/// Tokenize one program into a preprocessed token vector.
pub fn tokenize(code: &str, file: &str, line: u32) -> ScriptResult<Vec<Token>> {
    let mut t = Tokenizer {
        lexer: Lexer::new(code, file, line)?,
        forwarders: Vec::new(),
        labels: Vec::new(),
        loop_labels: Vec::new(),
        loop_depth: 0,
        switch_depth: 0,
    };
    let mut tokens = Vec::new();
    t.push_forwarder(&mut tokens, true);
    while !t.lexer.tok.is_eof() {
        t.tokenize_statement(&mut tokens)?;
    }
    t.pop_forwarder(&mut tokens);
    trace!(tokens = tokens.len(), file, "tokenized program");
    Ok(tokens)
}

impl<'a> Tokenizer<'a> {
    // ---- token plumbing ----

    fn kind(&self) -> &TokenKind {
        &self.lexer.tok.kind
    }

    fn is(&self, kind: &TokenKind) -> bool {
        self.kind().same_kind(kind)
    }

    fn is_ident(&self) -> bool {
        matches!(self.kind(), TokenKind::Ident(_))
    }

    /// Current identifier text, if the current token is one.
    fn ident_text(&self) -> Option<String> {
        match self.kind() {
            TokenKind::Ident(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Push the current token and advance.
    fn push_tok(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        out.push(self.lexer.tok.clone());
        self.lexer.advance()
    }

    /// Check the current token kind, push it, advance.
    fn push_match(&mut self, out: &mut Vec<Token>, expected: &TokenKind) -> ScriptResult<()> {
        self.lexer.check(expected, None)?;
        self.push_tok(out)
    }

    /// Check the current token kind and advance without pushing.
    fn skip_match(&mut self, expected: &TokenKind) -> ScriptResult<()> {
        self.lexer.match_tok(expected, None)
    }

    /// Synthesize a token at the current source position.
    fn make(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.lexer.token_line(), self.lexer.token_column())
    }

    /// Accept `;`, or insert one where automatic semicolon insertion
    /// applies (before `}`, at EOF, or after a line break).
    fn expect_semicolon(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        if self.is(&TokenKind::Semicolon) {
            return self.push_tok(out);
        }
        if self.is(&TokenKind::RightBrace) || self.lexer.tok.is_eof() || self.lexer.line_break_before
        {
            out.push(self.make(TokenKind::Semicolon));
            return Ok(());
        }
        Err(self.lexer.syntax_error(format!("got '{}' expected ';'", self.kind())))
    }

    // ---- forwarder bookkeeping ----

    fn push_forwarder(&mut self, out: &mut Vec<Token>, fnc_scope: bool) {
        let data = Rc::new(RefCell::new(ForwardData::default()));
        out.push(self.make(TokenKind::Forward(data.clone())));
        self.forwarders.push(ForwardFrame { pos: out.len() - 1, data, fnc_scope });
    }

    fn pop_forwarder(&mut self, out: &mut Vec<Token>) {
        let frame = self.forwarders.pop().expect("forwarder underflow");
        if frame.data.borrow().is_empty() {
            out.remove(frame.pos);
        }
    }

    /// Register a `var` name: it lands in the nearest function scope,
    /// and every let scope on the way records it for redefinition
    /// checks.
    fn declare_var(&mut self, name: &str) -> ScriptResult<()> {
        let mut failed: Option<String> = None;
        for frame in self.forwarders.iter().rev() {
            if frame.fnc_scope {
                if let Err(msg) = frame.data.borrow_mut().add_var(name) {
                    failed = Some(msg);
                }
                break;
            }
            if let Err(msg) = frame.data.borrow_mut().add_var_in_letscope(name) {
                failed = Some(msg);
                break;
            }
        }
        match failed {
            Some(msg) => Err(self.lexer.syntax_error(msg)),
            None => Ok(()),
        }
    }

    /// Register a `let` name in the innermost scope.
    fn declare_let(&mut self, name: &str) -> ScriptResult<()> {
        let result = {
            let frame = self.forwarders.last().expect("forwarder underflow");
            frame.data.borrow_mut().add_let(name)
        };
        result.map_err(|msg| self.lexer.syntax_error(msg))
    }

    /// Register the names a declarator binds.
    fn declare(&mut self, name: &str, is_let: bool) -> ScriptResult<()> {
        if is_let {
            self.declare_let(name)
        } else {
            self.declare_var(name)
        }
    }

    /// Hoist a function declaration into the nearest function scope.
    fn declare_function(&mut self, data: Rc<FncData>) {
        for frame in self.forwarders.iter().rev() {
            if frame.fnc_scope {
                frame.data.borrow_mut().add_function(data);
                return;
            }
        }
    }

    // ---- statements ----

    fn tokenize_statement(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        // Leading labels: `name: statement`.
        let mut labels: Vec<String> = Vec::new();
        while self.is_ident() {
            let name = self.ident_text().unwrap();
            let saved = self.lexer.save();
            self.lexer.advance()?;
            if self.is(&TokenKind::Colon) {
                if name.starts_with("__") {
                    return Err(self
                        .lexer
                        .syntax_error(format!("label '{}' uses a reserved prefix", name)));
                }
                if self.labels.iter().any(|l| l.as_str() == name) {
                    return Err(self.lexer.syntax_error(format!("label '{}' already used", name)));
                }
                self.lexer.advance()?;
                labels.push(name);
            } else {
                self.lexer.reset(saved);
                break;
            }
        }

        if !labels.is_empty() {
            let is_loop =
                matches!(self.kind(), TokenKind::For | TokenKind::While | TokenKind::Do);
            for label in &labels {
                self.labels.push(label.clone());
                if is_loop {
                    self.loop_labels.push(label.clone());
                    out.push(self.make(TokenKind::LoopLabel(Rc::new(label.clone()))));
                } else {
                    out.push(self.make(TokenKind::Label(Rc::new(label.clone()))));
                }
            }
            let result = self.tokenize_statement(out);
            for label in &labels {
                self.labels.retain(|l| l != label);
                self.loop_labels.retain(|l| l != label);
            }
            return result;
        }

        match self.kind().clone() {
            TokenKind::Semicolon => self.push_tok(out),
            TokenKind::LeftBrace => self.tokenize_block(out),
            TokenKind::Var => self.tokenize_var(out, false),
            TokenKind::Let => self.tokenize_var(out, true),
            TokenKind::If => self.tokenize_if(out),
            TokenKind::While => self.tokenize_while(out),
            TokenKind::Do => self.tokenize_do(out),
            TokenKind::For => self.tokenize_for(out),
            TokenKind::Function => {
                let token = self.tokenize_function(true)?;
                out.push(token);
                Ok(())
            }
            TokenKind::Return => {
                self.push_tok(out)?;
                if !self.is(&TokenKind::Semicolon)
                    && !self.is(&TokenKind::RightBrace)
                    && !self.lexer.tok.is_eof()
                    && !self.lexer.line_break_before
                {
                    self.tokenize_expression(out)?;
                }
                self.expect_semicolon(out)
            }
            TokenKind::Break => self.tokenize_break_continue(out, true),
            TokenKind::Continue => self.tokenize_break_continue(out, false),
            TokenKind::Throw => {
                self.push_tok(out)?;
                if self.lexer.line_break_before {
                    return Err(self.lexer.syntax_error("newline not allowed after 'throw'"));
                }
                self.tokenize_expression(out)?;
                self.expect_semicolon(out)
            }
            TokenKind::Try => self.tokenize_try(out),
            TokenKind::Switch => self.tokenize_switch(out),
            TokenKind::With => self.tokenize_with(out),
            _ => {
                self.tokenize_expression(out)?;
                self.expect_semicolon(out)
            }
        }
    }

    fn tokenize_block(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        self.push_match(out, &TokenKind::LeftBrace)?;
        self.push_forwarder(out, false);
        while !self.is(&TokenKind::RightBrace) && !self.lexer.tok.is_eof() {
            self.tokenize_statement(out)?;
        }
        self.pop_forwarder(out);
        self.push_match(out, &TokenKind::RightBrace)
    }

    fn tokenize_var(&mut self, out: &mut Vec<Token>, is_let: bool) -> ScriptResult<()> {
        self.push_tok(out)?; // var / let
        loop {
            if self.is_ident() {
                let name = self.ident_text().unwrap();
                self.declare(&name, is_let)?;
                self.push_tok(out)?;
            } else if self.is(&TokenKind::LeftBrace) || self.is(&TokenKind::LeftBracket) {
                let token = self.tokenize_destructuring()?;
                if let TokenKind::DestructuringVar(data) = &token.kind {
                    let names: Vec<String> = data.var_names().map(|n| n.to_string()).collect();
                    for name in names {
                        self.declare(&name, is_let)?;
                    }
                }
                out.push(token);
                // A pattern declarator requires an initializer.
                self.lexer.check(&TokenKind::Assign, None)?;
            } else {
                return Err(self
                    .lexer
                    .syntax_error(format!("got '{}' expected a variable name", self.kind())));
            }
            if self.is(&TokenKind::Assign) {
                self.push_tok(out)?;
                self.tokenize_assignment(out)?;
            }
            if self.is(&TokenKind::Comma) {
                self.push_tok(out)?;
                continue;
            }
            break;
        }
        self.expect_semicolon(out)
    }

    fn tokenize_if(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        self.push_tok(out)?; // if
        self.push_match(out, &TokenKind::LeftParen)?;
        self.tokenize_expression(out)?;
        self.push_match(out, &TokenKind::RightParen)?;
        self.tokenize_statement(out)?;
        if self.is(&TokenKind::Else) {
            self.push_tok(out)?;
            self.tokenize_statement(out)?;
        }
        Ok(())
    }

    fn tokenize_while(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        self.push_tok(out)?; // while
        self.push_match(out, &TokenKind::LeftParen)?;
        self.tokenize_expression(out)?;
        self.push_match(out, &TokenKind::RightParen)?;
        self.loop_depth += 1;
        let result = self.tokenize_statement(out);
        self.loop_depth -= 1;
        result
    }

    fn tokenize_do(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        self.push_tok(out)?; // do
        self.loop_depth += 1;
        let result = self.tokenize_statement(out);
        self.loop_depth -= 1;
        result?;
        self.push_match(out, &TokenKind::While)?;
        self.push_match(out, &TokenKind::LeftParen)?;
        self.tokenize_expression(out)?;
        self.push_match(out, &TokenKind::RightParen)?;
        self.expect_semicolon(out)
    }

    fn tokenize_for(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        let for_line = self.lexer.token_line();
        let for_column = self.lexer.token_column();
        self.skip_match(&TokenKind::For)?; // re-emitted as For / ForIn / ForEachIn

        let each = matches!(self.kind(), TokenKind::Ident(n) if n.as_str() == "each");
        if each {
            self.lexer.advance()?;
        }

        self.lexer.check(&TokenKind::LeftParen, None)?;

        // Speculative for-in parse: ( [var|let] (ident | pattern) in ...
        let saved = self.lexer.save();
        let head = match self.try_for_in_head() {
            Ok(Some(head)) => Some(head),
            Ok(None) | Err(_) => {
                self.lexer.reset(saved);
                None
            }
        };

        if let Some(ForInHead { decl, lhs }) = head {
            let kind = if each { TokenKind::ForEachIn } else { TokenKind::ForIn };
            out.push(Token::new(kind, for_line, for_column));
            out.push(self.make(TokenKind::LeftParen));
            if let Some(decl_tok) = decl {
                let is_let = matches!(decl_tok.kind, TokenKind::Let);
                match &lhs.kind {
                    TokenKind::Ident(name) => {
                        let name = name.to_string();
                        self.declare(&name, is_let)?;
                    }
                    TokenKind::DestructuringVar(data) => {
                        let names: Vec<String> =
                            data.var_names().map(|n| n.to_string()).collect();
                        for name in names {
                            self.declare(&name, is_let)?;
                        }
                    }
                    _ => {}
                }
                out.push(decl_tok);
            }
            out.push(lhs);
            out.push(self.make(TokenKind::In));
            self.skip_match(&TokenKind::In)?;
            self.tokenize_expression(out)?;
            self.push_match(out, &TokenKind::RightParen)?;
            self.loop_depth += 1;
            let result = self.tokenize_statement(out);
            self.loop_depth -= 1;
            return result;
        }

        if each {
            return Err(self.lexer.syntax_error("'for each' requires an in-loop"));
        }

        // Plain for(init; cond; update).
        out.push(Token::new(TokenKind::For, for_line, for_column));
        self.push_match(out, &TokenKind::LeftParen)?;
        if self.is(&TokenKind::Var) {
            self.tokenize_var(out, false)?; // consumes the ';'
        } else if self.is(&TokenKind::Let) {
            self.tokenize_var(out, true)?;
        } else {
            if !self.is(&TokenKind::Semicolon) {
                self.tokenize_expression(out)?;
            }
            self.push_match(out, &TokenKind::Semicolon)?;
        }
        if !self.is(&TokenKind::Semicolon) {
            self.tokenize_expression(out)?;
        }
        self.push_match(out, &TokenKind::Semicolon)?;
        if !self.is(&TokenKind::RightParen) {
            self.tokenize_expression(out)?;
        }
        self.push_match(out, &TokenKind::RightParen)?;
        self.loop_depth += 1;
        let result = self.tokenize_statement(out);
        self.loop_depth -= 1;
        result
    }

    /// Attempt to read `( [var|let] lhs` followed by `in`. Returns None
    /// (caller resets) when this is a plain `for`.
    fn try_for_in_head(&mut self) -> ScriptResult<Option<ForInHead>> {
        self.skip_match(&TokenKind::LeftParen)?;
        let decl = if matches!(self.kind(), TokenKind::Var | TokenKind::Let) {
            let tok = self.lexer.tok.clone();
            self.lexer.advance()?;
            Some(tok)
        } else {
            None
        };
        let lhs = if self.is_ident() {
            let tok = self.lexer.tok.clone();
            self.lexer.advance()?;
            tok
        } else if self.is(&TokenKind::LeftBrace) || self.is(&TokenKind::LeftBracket) {
            self.tokenize_destructuring()?
        } else {
            return Ok(None);
        };
        if self.is(&TokenKind::In) {
            Ok(Some(ForInHead { decl, lhs }))
        } else {
            Ok(None)
        }
    }

    fn tokenize_break_continue(&mut self, out: &mut Vec<Token>, is_break: bool) -> ScriptResult<()> {
        self.push_tok(out)?; // break / continue
        let mut label: Option<String> = None;
        if !self.lexer.line_break_before && self.is_ident() {
            label = self.ident_text();
            self.push_tok(out)?;
        }
        match &label {
            Some(name) => {
                let known = if is_break {
                    self.labels.iter().any(|l| l == name)
                } else {
                    self.loop_labels.iter().any(|l| l == name)
                };
                if !known {
                    return Err(self.lexer.syntax_error(format!("label '{}' not found", name)));
                }
            }
            None => {
                let ok = if is_break {
                    self.loop_depth > 0 || self.switch_depth > 0
                } else {
                    self.loop_depth > 0
                };
                if !ok {
                    let what = if is_break { "break" } else { "continue" };
                    return Err(self.lexer.syntax_error(format!("'{}' outside of a loop", what)));
                }
            }
        }
        self.expect_semicolon(out)
    }

    fn tokenize_try(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        self.push_tok(out)?; // try
        self.lexer.check(&TokenKind::LeftBrace, None)?;
        self.tokenize_block(out)?;
        let mut handled = false;
        if self.is(&TokenKind::Catch) {
            handled = true;
            self.push_tok(out)?;
            self.push_match(out, &TokenKind::LeftParen)?;
            if self.is_ident() {
                self.push_tok(out)?;
            } else {
                return Err(self
                    .lexer
                    .syntax_error(format!("got '{}' expected a catch variable", self.kind())));
            }
            self.push_match(out, &TokenKind::RightParen)?;
            self.lexer.check(&TokenKind::LeftBrace, None)?;
            self.tokenize_block(out)?;
        }
        if self.is(&TokenKind::Finally) {
            handled = true;
            self.push_tok(out)?;
            self.lexer.check(&TokenKind::LeftBrace, None)?;
            self.tokenize_block(out)?;
        }
        if !handled {
            return Err(self.lexer.syntax_error("try without catch or finally"));
        }
        Ok(())
    }

    fn tokenize_switch(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        self.push_tok(out)?; // switch
        self.push_match(out, &TokenKind::LeftParen)?;
        self.tokenize_expression(out)?;
        self.push_match(out, &TokenKind::RightParen)?;
        self.push_match(out, &TokenKind::LeftBrace)?;
        self.switch_depth += 1;
        let result = self.tokenize_switch_body(out);
        self.switch_depth -= 1;
        result?;
        self.push_match(out, &TokenKind::RightBrace)
    }

    fn tokenize_switch_body(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        let mut seen_default = false;
        while !self.is(&TokenKind::RightBrace) && !self.lexer.tok.is_eof() {
            if self.is(&TokenKind::Case) {
                self.push_tok(out)?;
                self.tokenize_expression(out)?;
                self.push_match(out, &TokenKind::Colon)?;
            } else if self.is(&TokenKind::Default) {
                if seen_default {
                    return Err(self.lexer.syntax_error("more than one switch default"));
                }
                seen_default = true;
                self.push_tok(out)?;
                self.push_match(out, &TokenKind::Colon)?;
            } else {
                return Err(self
                    .lexer
                    .syntax_error(format!("got '{}' expected 'case' or 'default'", self.kind())));
            }
            while !self.is(&TokenKind::Case)
                && !self.is(&TokenKind::Default)
                && !self.is(&TokenKind::RightBrace)
                && !self.lexer.tok.is_eof()
            {
                self.tokenize_statement(out)?;
            }
        }
        Ok(())
    }

    fn tokenize_with(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        self.push_tok(out)?; // with
        self.push_match(out, &TokenKind::LeftParen)?;
        self.tokenize_expression(out)?;
        self.push_match(out, &TokenKind::RightParen)?;
        self.tokenize_statement(out)
    }

    // ---- functions ----

    /// Tokenize a function at the `function` keyword. Statement-position
    /// declarations are hoisted into the enclosing forwarder and also
    /// left inline (the evaluator skips the inline copy).
    fn tokenize_function(&mut self, statement: bool) -> ScriptResult<Token> {
        let line = self.lexer.token_line();
        let column = self.lexer.token_column();
        self.skip_match(&TokenKind::Function)?;

        let name = match self.ident_text() {
            Some(n) => {
                self.lexer.advance()?;
                n
            }
            None if statement => {
                return Err(self.lexer.syntax_error("function declarations need a name"))
            }
            None => String::new(),
        };

        let args = self.tokenize_parameters()?;
        let body = self.tokenize_function_body()?;

        let data = Rc::new(FncData {
            file: self.lexer.file().to_string(),
            line,
            name,
            args,
            body: Rc::new(body),
        });
        if statement {
            self.declare_function(data.clone());
            Ok(Token::new(TokenKind::FunctionDecl(data), line, column))
        } else {
            Ok(Token::new(TokenKind::FunctionOperator(data), line, column))
        }
    }

    /// Parameter list: identifiers or destructuring patterns.
    fn tokenize_parameters(&mut self) -> ScriptResult<Vec<Token>> {
        self.skip_match(&TokenKind::LeftParen)?;
        let mut args = Vec::new();
        while !self.is(&TokenKind::RightParen) {
            if self.is_ident() {
                args.push(self.lexer.tok.clone());
                self.lexer.advance()?;
            } else if self.is(&TokenKind::LeftBrace) || self.is(&TokenKind::LeftBracket) {
                args.push(self.tokenize_destructuring()?);
            } else {
                return Err(self
                    .lexer
                    .syntax_error(format!("got '{}' expected a parameter", self.kind())));
            }
            if self.is(&TokenKind::Comma) {
                self.lexer.advance()?;
            } else {
                break;
            }
        }
        self.skip_match(&TokenKind::RightParen)?;
        Ok(args)
    }

    /// Function body: a block, or the short single-expression form which
    /// is rewritten into `return expr;`.
    fn tokenize_function_body(&mut self) -> ScriptResult<Vec<Token>> {
        // Fresh label/loop context: a body never sees enclosing labels.
        let labels = mem::take(&mut self.labels);
        let loop_labels = mem::take(&mut self.loop_labels);
        let loop_depth = mem::replace(&mut self.loop_depth, 0);
        let switch_depth = mem::replace(&mut self.switch_depth, 0);

        let mut body = Vec::new();
        let result = self.tokenize_function_body_inner(&mut body);

        self.labels = labels;
        self.loop_labels = loop_labels;
        self.loop_depth = loop_depth;
        self.switch_depth = switch_depth;
        result?;
        Ok(body)
    }

    fn tokenize_function_body_inner(&mut self, body: &mut Vec<Token>) -> ScriptResult<()> {
        if self.is(&TokenKind::LeftBrace) {
            self.skip_match(&TokenKind::LeftBrace)?;
            self.push_forwarder(body, true);
            while !self.is(&TokenKind::RightBrace) && !self.lexer.tok.is_eof() {
                self.tokenize_statement(body)?;
            }
            self.pop_forwarder(body);
            self.skip_match(&TokenKind::RightBrace)
        } else {
            body.push(self.make(TokenKind::Return));
            self.tokenize_assignment(body)?;
            body.push(self.make(TokenKind::Semicolon));
            Ok(())
        }
    }

    /// Build an arrow function from already-parsed parameters; the
    /// cursor sits after `=>`.
    fn finish_arrow(&mut self, args: Vec<Token>, line: u32, column: u32) -> ScriptResult<Token> {
        let body = self.tokenize_function_body()?;
        let data = Rc::new(FncData {
            file: self.lexer.file().to_string(),
            line,
            name: String::new(),
            args,
            body: Rc::new(body),
        });
        Ok(Token::new(TokenKind::FunctionOperator(data), line, column))
    }

    // ---- destructuring ----

    /// Flatten a destructuring pattern into (path, name) pairs.
    fn tokenize_destructuring(&mut self) -> ScriptResult<Token> {
        let line = self.lexer.token_line();
        let column = self.lexer.token_column();
        let array = self.is(&TokenKind::LeftBracket);
        let mut data = DestructuringData { targets: Vec::new(), array };
        self.destructure_pattern(&mut data, &mut Vec::new())?;
        Ok(Token::new(TokenKind::DestructuringVar(Rc::new(data)), line, column))
    }

    fn destructure_pattern(
        &mut self,
        data: &mut DestructuringData,
        path: &mut Vec<String>,
    ) -> ScriptResult<()> {
        if self.is(&TokenKind::LeftBrace) {
            self.destructure_object(data, path)
        } else {
            self.destructure_array(data, path)
        }
    }

    fn destructure_object(
        &mut self,
        data: &mut DestructuringData,
        path: &mut Vec<String>,
    ) -> ScriptResult<()> {
        self.skip_match(&TokenKind::LeftBrace)?;
        while !self.is(&TokenKind::RightBrace) {
            let key = match self.kind() {
                TokenKind::Ident(n) => n.to_string(),
                TokenKind::Str(s) => s.to_string(),
                other => {
                    return Err(self
                        .lexer
                        .syntax_error(format!("got '{}' expected a property name", other)))
                }
            };
            self.lexer.advance()?;
            path.push(key.clone());
            if self.is(&TokenKind::Colon) {
                self.lexer.advance()?;
                if self.is_ident() {
                    let name = self.ident_text().unwrap();
                    data.targets.push(DestructuringTarget { path: path.clone(), name });
                    self.lexer.advance()?;
                } else if self.is(&TokenKind::LeftBrace) || self.is(&TokenKind::LeftBracket) {
                    self.destructure_pattern(data, path)?;
                } else {
                    return Err(self
                        .lexer
                        .syntax_error("expected a binding name or nested pattern"));
                }
            } else {
                // shorthand { x }
                data.targets.push(DestructuringTarget { path: path.clone(), name: key });
            }
            path.pop();
            if self.is(&TokenKind::Comma) {
                self.lexer.advance()?;
            } else {
                break;
            }
        }
        self.skip_match(&TokenKind::RightBrace)
    }

    fn destructure_array(
        &mut self,
        data: &mut DestructuringData,
        path: &mut Vec<String>,
    ) -> ScriptResult<()> {
        self.skip_match(&TokenKind::LeftBracket)?;
        let mut index = 0u32;
        loop {
            if self.is(&TokenKind::RightBracket) {
                break;
            }
            if self.is(&TokenKind::Comma) {
                // hole: an unused slot
                let mut p = path.clone();
                p.push(index.to_string());
                data.targets.push(DestructuringTarget { path: p, name: String::new() });
                self.lexer.advance()?;
                index += 1;
                continue;
            }
            if self.is_ident() {
                let name = self.ident_text().unwrap();
                let mut p = path.clone();
                p.push(index.to_string());
                data.targets.push(DestructuringTarget { path: p, name });
                self.lexer.advance()?;
            } else if self.is(&TokenKind::LeftBrace) || self.is(&TokenKind::LeftBracket) {
                path.push(index.to_string());
                self.destructure_pattern(data, path)?;
                path.pop();
            } else {
                return Err(self.lexer.syntax_error("expected a binding name or nested pattern"));
            }
            index += 1;
            if self.is(&TokenKind::Comma) {
                self.lexer.advance()?;
            } else {
                break;
            }
        }
        self.skip_match(&TokenKind::RightBracket)
    }

    // ---- expressions ----

    /// Comma expression.
    fn tokenize_expression(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        self.tokenize_assignment(out)?;
        while self.is(&TokenKind::Comma) {
            self.push_tok(out)?;
            self.tokenize_assignment(out)?;
        }
        Ok(())
    }

    /// Assignment expression (right-associative).
    fn tokenize_assignment(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        self.tokenize_condition(out)?;
        if self.kind().is_assignment() {
            self.push_tok(out)?;
            self.tokenize_assignment(out)?;
        }
        Ok(())
    }

    /// Binary operator run plus `?:`. The tokenizer only validates the
    /// shape; precedence is the evaluator's business.
    fn tokenize_condition(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        self.tokenize_operand(out)?;
        while is_binary_op(self.kind()) {
            self.push_tok(out)?;
            self.tokenize_operand(out)?;
        }
        if self.is(&TokenKind::Question) {
            self.push_tok(out)?;
            self.tokenize_assignment(out)?;
            self.push_match(out, &TokenKind::Colon)?;
            self.tokenize_assignment(out)?;
        }
        Ok(())
    }

    /// Unary prefixes, a primary, then member/call/postfix suffixes.
    fn tokenize_operand(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        while matches!(
            self.kind(),
            TokenKind::Bang
                | TokenKind::Tilde
                | TokenKind::Plus
                | TokenKind::Minus
                | TokenKind::PlusPlus
                | TokenKind::MinusMinus
                | TokenKind::Typeof
                | TokenKind::Void
                | TokenKind::Delete
                | TokenKind::New
        ) {
            self.push_tok(out)?;
        }

        self.tokenize_primary(out)?;

        loop {
            if self.is(&TokenKind::Dot) {
                self.push_tok(out)?;
                // reserved words are acceptable member names
                let keyword_name = match self.kind() {
                    TokenKind::Ident(_) => None,
                    k => k
                        .simple_text()
                        .filter(|t| t.chars().all(|c| c.is_ascii_alphabetic()))
                        .map(str::to_string),
                };
                if let Some(name) = keyword_name {
                    out.push(self.make(TokenKind::Ident(Rc::new(name))));
                    self.lexer.advance()?;
                } else if self.is_ident() {
                    self.push_tok(out)?;
                } else {
                    return Err(self
                        .lexer
                        .syntax_error(format!("got '{}' expected a member name", self.kind())));
                }
            } else if self.is(&TokenKind::LeftBracket) {
                self.push_tok(out)?;
                self.tokenize_expression(out)?;
                self.push_match(out, &TokenKind::RightBracket)?;
            } else if self.is(&TokenKind::LeftParen) {
                self.push_tok(out)?;
                while !self.is(&TokenKind::RightParen) {
                    self.tokenize_assignment(out)?;
                    if self.is(&TokenKind::Comma) {
                        self.push_tok(out)?;
                    } else {
                        break;
                    }
                }
                self.push_match(out, &TokenKind::RightParen)?;
            } else if matches!(self.kind(), TokenKind::PlusPlus | TokenKind::MinusMinus)
                && !self.lexer.line_break_before
            {
                self.push_tok(out)?;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn tokenize_primary(&mut self, out: &mut Vec<Token>) -> ScriptResult<()> {
        match self.kind().clone() {
            TokenKind::Int(_)
            | TokenKind::Float(_)
            | TokenKind::Str(_)
            | TokenKind::RegExp { .. }
            | TokenKind::True
            | TokenKind::False
            | TokenKind::Null => self.push_tok(out),
            TokenKind::Ident(_) => {
                // `x => expr` arrow shorthand
                let saved = self.lexer.save();
                let line = self.lexer.token_line();
                let column = self.lexer.token_column();
                let ident = self.lexer.tok.clone();
                self.lexer.advance()?;
                if self.is(&TokenKind::Arrow) {
                    self.lexer.advance()?;
                    let token = self.finish_arrow(vec![ident], line, column)?;
                    out.push(token);
                    Ok(())
                } else {
                    self.lexer.reset(saved);
                    self.push_tok(out)
                }
            }
            TokenKind::Function => {
                let token = self.tokenize_function(false)?;
                out.push(token);
                Ok(())
            }
            TokenKind::LeftParen => {
                // `( params ) => ...` or a parenthesized expression.
                let saved = self.lexer.save();
                let line = self.lexer.token_line();
                let column = self.lexer.token_column();
                let arrow = match self.try_arrow_parameters() {
                    Ok(args) => args,
                    Err(_) => None,
                };
                match arrow {
                    Some(args) => {
                        let token = self.finish_arrow(args, line, column)?;
                        out.push(token);
                        Ok(())
                    }
                    None => {
                        self.lexer.reset(saved);
                        self.push_tok(out)?; // (
                        self.tokenize_expression(out)?;
                        self.push_match(out, &TokenKind::RightParen)
                    }
                }
            }
            TokenKind::LeftBrace => self.tokenize_object_literal(out, LiteralMode::Object),
            TokenKind::LeftBracket => self.tokenize_object_literal(out, LiteralMode::Array),
            other => {
                Err(self.lexer.syntax_error(format!("got '{}' expected an expression", other)))
            }
        }
    }

    /// Try to read `( params ) =>`; None (caller resets) otherwise.
    fn try_arrow_parameters(&mut self) -> ScriptResult<Option<Vec<Token>>> {
        let args = self.tokenize_parameters()?;
        if self.is(&TokenKind::Arrow) {
            self.lexer.advance()?;
            Ok(Some(args))
        } else {
            Ok(None)
        }
    }

    /// Object or array literal folded into a payload token.
    fn tokenize_object_literal(
        &mut self,
        out: &mut Vec<Token>,
        mode: LiteralMode,
    ) -> ScriptResult<()> {
        let line = self.lexer.token_line();
        let column = self.lexer.token_column();
        let mut elements: Vec<ObjectLiteralElement> = Vec::new();

        match mode {
            LiteralMode::Object => {
                self.skip_match(&TokenKind::LeftBrace)?;
                while !self.is(&TokenKind::RightBrace) {
                    let element = self.tokenize_object_member()?;
                    elements.push(element);
                    if self.is(&TokenKind::Comma) {
                        self.lexer.advance()?;
                    } else {
                        break;
                    }
                }
                self.skip_match(&TokenKind::RightBrace)?;
            }
            LiteralMode::Array => {
                self.skip_match(&TokenKind::LeftBracket)?;
                let mut index = 0u32;
                loop {
                    if self.is(&TokenKind::RightBracket) {
                        break;
                    }
                    if self.is(&TokenKind::Comma) {
                        // hole
                        elements
                            .push(ObjectLiteralElement { id: index.to_string(), value: Vec::new() });
                        self.lexer.advance()?;
                        index += 1;
                        continue;
                    }
                    let mut value = Vec::new();
                    self.tokenize_assignment(&mut value)?;
                    elements.push(ObjectLiteralElement { id: index.to_string(), value });
                    index += 1;
                    if self.is(&TokenKind::Comma) {
                        self.lexer.advance()?;
                    } else {
                        break;
                    }
                }
                self.skip_match(&TokenKind::RightBracket)?;
            }
        }

        let data = ObjectLiteralData { mode, elements };
        out.push(Token::new(TokenKind::ObjectLiteral(Rc::new(data)), line, column));
        Ok(())
    }

    /// One `key: value` member, accessor shorthand, method shorthand, or
    /// `{ x }` shorthand.
    fn tokenize_object_member(&mut self) -> ScriptResult<ObjectLiteralElement> {
        // get name() {...} / set name(v) {...}
        if let Some(word) = self.ident_text() {
            if word == "get" || word == "set" {
                let saved = self.lexer.save();
                let line = self.lexer.token_line();
                let column = self.lexer.token_column();
                self.lexer.advance()?;
                if let Some(name) = self.property_name() {
                    self.lexer.advance()?;
                    if self.is(&TokenKind::LeftParen) {
                        let args = self.tokenize_parameters()?;
                        if word == "set" && args.len() != 1 {
                            return Err(self.lexer.syntax_error("setters take one parameter"));
                        }
                        if word == "get" && !args.is_empty() {
                            return Err(self.lexer.syntax_error("getters take no parameters"));
                        }
                        self.lexer.check(&TokenKind::LeftBrace, None)?;
                        let body = self.tokenize_function_body()?;
                        let data = Rc::new(FncData {
                            file: self.lexer.file().to_string(),
                            line,
                            name: name.clone(),
                            args,
                            body: Rc::new(body),
                        });
                        let kind = if word == "get" {
                            TokenKind::Getter(data)
                        } else {
                            TokenKind::Setter(data)
                        };
                        return Ok(ObjectLiteralElement {
                            id: name,
                            value: vec![Token::new(kind, line, column)],
                        });
                    }
                }
                self.lexer.reset(saved);
            }
        }

        let name = self.property_name().ok_or_else(|| {
            self.lexer
                .syntax_error(format!("got '{}' expected a property name", self.kind()))
        })?;
        let line = self.lexer.token_line();
        let column = self.lexer.token_column();
        let name_tok = self.lexer.tok.clone();
        self.lexer.advance()?;

        if self.is(&TokenKind::Colon) {
            self.lexer.advance()?;
            let mut value = Vec::new();
            self.tokenize_assignment(&mut value)?;
            return Ok(ObjectLiteralElement { id: name, value });
        }

        if self.is(&TokenKind::LeftParen) {
            // method shorthand
            let args = self.tokenize_parameters()?;
            self.lexer.check(&TokenKind::LeftBrace, None)?;
            let body = self.tokenize_function_body()?;
            let data = Rc::new(FncData {
                file: self.lexer.file().to_string(),
                line,
                name: name.clone(),
                args,
                body: Rc::new(body),
            });
            return Ok(ObjectLiteralElement {
                id: name,
                value: vec![Token::new(TokenKind::FunctionOperator(data), line, column)],
            });
        }

        // `{ x }` shorthand: value is the identifier itself.
        if matches!(name_tok.kind, TokenKind::Ident(_)) {
            return Ok(ObjectLiteralElement { id: name, value: vec![name_tok] });
        }
        Err(self.lexer.syntax_error("got a literal key without a value"))
    }

    /// Current token as a property name, if it can be one.
    fn property_name(&self) -> Option<String> {
        match self.kind() {
            TokenKind::Ident(n) => Some(n.to_string()),
            TokenKind::Str(s) => Some(s.to_string()),
            TokenKind::Int(n) => Some(n.to_string()),
            TokenKind::Float(n) => Some(n.to_string()),
            k => k.simple_text().and_then(|t| {
                if t.chars().all(|c| c.is_ascii_alphabetic()) {
                    Some(t.to_string())
                } else {
                    None
                }
            }),
        }
    }
}

struct ForInHead {
    decl: Option<Token>,
    lhs: Token,
}

/// Operators the flat-copy expression walk passes through.
fn is_binary_op(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::Percent
            | TokenKind::LeftShift
            | TokenKind::RightShift
            | TokenKind::UnsignedRightShift
            | TokenKind::LessThan
            | TokenKind::LessEqual
            | TokenKind::GreaterThan
            | TokenKind::GreaterEqual
            | TokenKind::Equal
            | TokenKind::NotEqual
            | TokenKind::StrictEqual
            | TokenKind::StrictNotEqual
            | TokenKind::Ampersand
            | TokenKind::Pipe
            | TokenKind::Caret
            | TokenKind::AndAnd
            | TokenKind::OrOr
            | TokenKind::In
            | TokenKind::Instanceof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::parsable_string;

    fn kinds(code: &str) -> Vec<Token> {
        tokenize(code, "test", 1).unwrap()
    }

    #[test]
    fn test_program_forwarder_collects_vars() {
        let tokens = kinds("var a = 1; var b;");
        match &tokens[0].kind {
            TokenKind::Forward(f) => {
                assert_eq!(f.borrow().vars, ["a", "b"]);
            }
            other => panic!("expected forwarder, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_forwarder_elided() {
        let tokens = kinds("1 + 2;");
        assert!(!matches!(tokens[0].kind, TokenKind::Forward(_)));
    }

    #[test]
    fn test_function_declaration_hoisted() {
        let tokens = kinds("function f(a, b) { return a; }");
        match &tokens[0].kind {
            TokenKind::Forward(fwd) => {
                let fwd = fwd.borrow();
                assert_eq!(fwd.functions.len(), 1);
                assert_eq!(fwd.functions[0].name, "f");
                assert_eq!(fwd.functions[0].args.len(), 2);
            }
            other => panic!("expected forwarder, got {:?}", other),
        }
        assert!(matches!(tokens[1].kind, TokenKind::FunctionDecl(_)));
    }

    #[test]
    fn test_let_redefinition_rejected() {
        assert!(tokenize("let a; let a;", "test", 1).is_err());
        assert!(tokenize("let a; var a;", "test", 1).is_err());
        assert!(tokenize("{ let a; var a = 1; }", "test", 1).is_err());
        assert!(tokenize("var a; var a;", "test", 1).is_ok());
    }

    #[test]
    fn test_block_forwarder_holds_lets() {
        let tokens = kinds("{ let x = 1; }");
        assert!(matches!(tokens[0].kind, TokenKind::LeftBrace));
        match &tokens[1].kind {
            TokenKind::Forward(f) => assert_eq!(f.borrow().lets, ["x"]),
            other => panic!("expected forwarder, got {:?}", other),
        }
    }

    #[test]
    fn test_for_in_rewritten() {
        let tokens = kinds("for (var k in o) ;");
        assert!(tokens.iter().any(|t| matches!(t.kind, TokenKind::ForIn)));
        let tokens = kinds("for (var i = 0; i < 3; i++) ;");
        assert!(tokens.iter().any(|t| matches!(t.kind, TokenKind::For)));
        assert!(!tokens.iter().any(|t| matches!(t.kind, TokenKind::ForIn)));
    }

    #[test]
    fn test_for_each_in() {
        let tokens = kinds("for each (v in o) ;");
        assert!(tokens.iter().any(|t| matches!(t.kind, TokenKind::ForEachIn)));
    }

    #[test]
    fn test_destructuring_flattened() {
        let tokens = kinds("var {x, y: b, pos: {left}} = o;");
        let data = tokens
            .iter()
            .find_map(|t| match &t.kind {
                TokenKind::DestructuringVar(d) => Some(d.clone()),
                _ => None,
            })
            .expect("destructuring token");
        let pairs: Vec<(String, String)> =
            data.targets.iter().map(|t| (t.path.join("."), t.name.clone())).collect();
        assert_eq!(
            pairs,
            [
                ("x".to_string(), "x".to_string()),
                ("y".to_string(), "b".to_string()),
                ("pos.left".to_string(), "left".to_string()),
            ]
        );
        match &tokens[0].kind {
            TokenKind::Forward(f) => assert_eq!(f.borrow().vars, ["x", "b", "left"]),
            other => panic!("expected forwarder, got {:?}", other),
        }
    }

    #[test]
    fn test_array_destructuring_holes() {
        let tokens = kinds("var [a, , c] = xs;");
        let data = tokens
            .iter()
            .find_map(|t| match &t.kind {
                TokenKind::DestructuringVar(d) => Some(d.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(data.targets.len(), 3);
        assert_eq!(data.targets[1].name, "");
        assert_eq!(data.targets[2].path, ["2"]);
    }

    #[test]
    fn test_object_literal_payload() {
        let tokens = kinds("x = { a: 1, b: 2 };");
        let data = tokens
            .iter()
            .find_map(|t| match &t.kind {
                TokenKind::ObjectLiteral(d) => Some(d.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(data.mode, LiteralMode::Object);
        assert_eq!(data.elements.len(), 2);
        assert_eq!(data.elements[0].id, "a");
    }

    #[test]
    fn test_accessor_shorthand() {
        let tokens = kinds("x = { get a() { return 1; }, set a(v) { } };");
        let data = tokens
            .iter()
            .find_map(|t| match &t.kind {
                TokenKind::ObjectLiteral(d) => Some(d.clone()),
                _ => None,
            })
            .unwrap();
        assert!(matches!(data.elements[0].value[0].kind, TokenKind::Getter(_)));
        assert!(matches!(data.elements[1].value[0].kind, TokenKind::Setter(_)));
    }

    #[test]
    fn test_labels_checked() {
        assert!(tokenize("out: for (;;) { break out; }", "test", 1).is_ok());
        assert!(tokenize("for (;;) { break nowhere; }", "test", 1).is_err());
        assert!(tokenize("break;", "test", 1).is_err());
        assert!(tokenize("continue;", "test", 1).is_err());
        assert!(tokenize("x: { continue x; }", "test", 1).is_err());
        assert!(tokenize("__x: ;", "test", 1).is_err());
    }

    #[test]
    fn test_switch_shape() {
        assert!(tokenize("switch (x) { case 1: break; default: ; }", "test", 1).is_ok());
        assert!(tokenize("switch (x) { default: ; default: ; }", "test", 1).is_err());
    }

    #[test]
    fn test_try_requires_handler() {
        assert!(tokenize("try { }", "test", 1).is_err());
        assert!(tokenize("try { } finally { }", "test", 1).is_ok());
    }

    #[test]
    fn test_arrow_functions() {
        let tokens = kinds("f = (a, b) => a + b;");
        assert!(tokens.iter().any(|t| matches!(t.kind, TokenKind::FunctionOperator(_))));
        let tokens = kinds("g = x => x * 2;");
        let data = tokens
            .iter()
            .find_map(|t| match &t.kind {
                TokenKind::FunctionOperator(d) => Some(d.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(data.args.len(), 1);
        assert!(matches!(data.body[0].kind, TokenKind::Return));
    }

    #[test]
    fn test_short_function_form() {
        let tokens = kinds("f = function (x) x + 1;");
        let data = tokens
            .iter()
            .find_map(|t| match &t.kind {
                TokenKind::FunctionOperator(d) => Some(d.clone()),
                _ => None,
            })
            .unwrap();
        assert!(matches!(data.body[0].kind, TokenKind::Return));
    }

    #[test]
    fn test_parenthesized_expression_not_arrow() {
        let tokens = kinds("y = (a);");
        assert!(!tokens.iter().any(|t| matches!(t.kind, TokenKind::FunctionOperator(_))));
    }

    #[test]
    fn test_member_keyword_names() {
        assert!(tokenize("a.delete();", "test", 1).is_ok());
        assert!(tokenize("a.in = 1;", "test", 1).is_ok());
    }

    #[test]
    fn test_parsable_string_round_trip_stable() {
        let sources = [
            "var a = 1; a += 2;",
            "function f(x) { return x + 1; } f(2);",
            "o = { a: 1, b: [1, 2, , 4] };",
            "for (var i = 0; i < 3; i++) { s += i; }",
            "L: while (true) { break L; }",
            "try { f(); } catch (e) { g(e); } finally { h(); }",
            "var {x, y: b} = p;",
            "r = /ab+c/i;",
            "s = { get a() { return 1; } };",
        ];
        for src in sources {
            let once = parsable_string(&tokenize(src, "t", 1).unwrap());
            let twice = parsable_string(&tokenize(&once, "t", 1).unwrap());
            assert_eq!(once, twice, "round-trip unstable for {:?}", src);
        }
    }

    #[test]
    fn test_asi_inserts_semicolons() {
        assert!(tokenize("var a = 1\nvar b = 2", "test", 1).is_ok());
        assert!(tokenize("a = 1 b = 2", "test", 1).is_err());
    }
}
