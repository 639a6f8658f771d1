//! Parser for the Python subset understood by the host front end
//!
//! This module implements a recursive-descent parser with precedence climbing for binary
//! operators. It converts the token stream produced by [`Lexer`] into a [`Module`].
//! Comments are not part of the AST, but the comment lines that surround a `def` are
//! attached to the resulting [`FunctionDef`] so directives written there survive parsing.
//!
//! # Example
//!
//! ```
//! use adrenaline_core::parser::Parser;
//!
//! let module = Parser::parse_module("def square(x):\n    return x * x\n").unwrap();
//! assert_eq!(module.functions().count(), 1);
//! ```

mod error;

pub use error::{ParseError, ParseErrorKind};

use crate::ast::{
    BinOp, BoolOp, CmpOp, ExceptHandler, Expr, ExprKind, FunctionDef, Ident, ImportName, Module,
    Param, Stmt, StmtKind, UnaryOp,
};
use crate::lexer::{Lexer, LineIndex, Span, SpannedError, Token, TokenKind};

/// Result type for parsing operations
pub type ParseResult<T> = Result<T, ParseError>;

/// A `#` comment with the line it sits on
#[derive(Debug, Clone)]
struct CommentLine {
    line: u32,
    /// Comment text without the leading `#`
    text: String,
    /// True when nothing but whitespace precedes the comment on its line
    standalone: bool,
}

/// The Python-subset parser
pub struct Parser<'source> {
    source: &'source str,
    /// Significant tokens (comments removed)
    tokens: Vec<Token>,
    /// Comments collected from the token stream
    comments: Vec<CommentLine>,
    lines: LineIndex,
    /// Current position in the token stream
    position: usize,
    /// End offset of the last consumed significant token
    last_end: u32,
    /// Collected parse errors
    errors: Vec<ParseError>,
    /// Lexer errors (passed through)
    lex_errors: Vec<SpannedError>,
    /// Nesting depth for loops (for break/continue validation)
    loop_depth: u32,
    /// Nesting depth for functions (for return validation)
    function_depth: u32,
}

impl<'source> Parser<'source> {
    /// Create a new parser from source code
    #[must_use]
    pub fn new(source: &'source str) -> Self {
        let (raw_tokens, lex_errors) = Lexer::tokenize(source);
        let lines = LineIndex::new(source);
        let mut tokens = Vec::with_capacity(raw_tokens.len());
        let mut comments = Vec::new();
        for token in raw_tokens {
            if token.kind == TokenKind::Comment {
                let line = lines.line(token.span.start);
                let line_start = lines.line_start(line).unwrap_or(0) as usize;
                let standalone = source[line_start..token.span.start as usize]
                    .chars()
                    .all(char::is_whitespace);
                comments.push(CommentLine {
                    line,
                    text: token.lexeme.trim_start_matches('#').to_string(),
                    standalone,
                });
            } else {
                tokens.push(token);
            }
        }
        Self {
            source,
            tokens,
            comments,
            lines,
            position: 0,
            last_end: 0,
            errors: Vec::new(),
            lex_errors,
            loop_depth: 0,
            function_depth: 0,
        }
    }

    /// Parse an entire module (source file)
    pub fn parse_module(source: &str) -> Result<Module, Vec<ParseError>> {
        let mut parser = Parser::new(source);
        let module = parser.module();
        let errors = parser.all_errors();
        if errors.is_empty() {
            Ok(module)
        } else {
            Err(errors)
        }
    }

    /// Parse a single expression
    pub fn parse_expression(source: &str) -> Result<Expr, Vec<ParseError>> {
        let mut parser = Parser::new(source);
        let result = parser.testlist();
        while parser.check(TokenKind::Newline) {
            parser.advance();
        }
        match result {
            Ok(expr) if parser.is_eof() => {
                let errors = parser.all_errors();
                if errors.is_empty() {
                    Ok(expr)
                } else {
                    Err(errors)
                }
            }
            Ok(_) => {
                let err = parser.unexpected("end of expression");
                parser.errors.push(err);
                Err(parser.all_errors())
            }
            Err(e) => {
                parser.errors.push(e);
                Err(parser.all_errors())
            }
        }
    }

    /// Get all errors (both lex and parse errors)
    #[must_use]
    pub fn all_errors(&self) -> Vec<ParseError> {
        let mut errors: Vec<ParseError> = self
            .lex_errors
            .iter()
            .map(|lex_err| {
                ParseError::new(ParseErrorKind::Lex(lex_err.error.to_string()), lex_err.span)
            })
            .collect();
        errors.extend(self.errors.iter().cloned());
        errors
    }

    // ==================== Token Management ====================

    /// Get the current token
    fn current(&self) -> &Token {
        let index = self.position.min(self.tokens.len().saturating_sub(1));
        &self.tokens[index]
    }

    fn current_kind(&self) -> TokenKind {
        self.current().kind
    }

    /// Kind of the token `offset` positions ahead of the current one
    fn peek_kind(&self, offset: usize) -> TokenKind {
        self.tokens
            .get(self.position + offset)
            .map_or(TokenKind::Eof, |t| t.kind)
    }

    fn is_eof(&self) -> bool {
        self.current_kind() == TokenKind::Eof
    }

    /// Advance to the next token
    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if !matches!(
            token.kind,
            TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent | TokenKind::Eof
        ) {
            self.last_end = token.span.end;
        }
        if self.position < self.tokens.len() {
            self.position += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current_kind() == kind
    }

    /// Consume a token if it matches, returning it
    fn eat(&mut self, kind: TokenKind) -> Option<Token> {
        if self.check(kind) {
            Some(self.advance())
        } else {
            None
        }
    }

    /// Expect and consume a specific token, or error
    fn expect(&mut self, kind: TokenKind) -> ParseResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&format!("'{kind}'")))
        }
    }

    fn expect_ident(&mut self) -> ParseResult<Ident> {
        let token = self.current().clone();
        if token.kind == TokenKind::Ident {
            self.advance();
            Ok(Ident::new(token.lexeme, token.span))
        } else {
            Err(ParseError::new(
                ParseErrorKind::ExpectedIdentifier(token.kind),
                token.span,
            ))
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        ParseError::new(
            ParseErrorKind::UnexpectedToken {
                found: self.current_kind(),
                expected: expected.to_string(),
            },
            self.current().span,
        )
    }

    fn unsupported(&self, what: &'static str) -> ParseError {
        ParseError::new(ParseErrorKind::UnsupportedSyntax(what), self.current().span)
    }

    fn span_from(&self, start: u32) -> Span {
        Span::new(start, self.last_end.max(start))
    }

    /// Skip to the start of the next logical line after an error
    fn synchronize(&mut self) {
        while !self.is_eof() {
            if self.advance().kind == TokenKind::Newline {
                break;
            }
        }
        if self.check(TokenKind::Indent) {
            let mut depth = 0u32;
            while !self.is_eof() {
                match self.advance().kind {
                    TokenKind::Indent => depth += 1,
                    TokenKind::Dedent => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    // ==================== Statements ====================

    /// Parse a complete module
    fn module(&mut self) -> Module {
        let mut body = Vec::new();
        while !self.is_eof() {
            if self.eat(TokenKind::Newline).is_some() {
                continue;
            }
            if self.check(TokenKind::Indent) || self.check(TokenKind::Dedent) {
                let err = self.unsupported("unexpected indentation");
                self.errors.push(err);
                self.synchronize();
                continue;
            }
            match self.statement() {
                Ok(stmts) => body.extend(stmts),
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize();
                }
            }
        }
        Module { body }
    }

    /// Parse one statement; a line of `;`-separated simple statements yields several
    fn statement(&mut self) -> ParseResult<Vec<Stmt>> {
        match self.current_kind() {
            TokenKind::Def => Ok(vec![self.function_def()?]),
            TokenKind::If => Ok(vec![self.if_stmt()?]),
            TokenKind::While => Ok(vec![self.while_stmt()?]),
            TokenKind::For => Ok(vec![self.for_stmt()?]),
            TokenKind::Try => Ok(vec![self.try_stmt()?]),
            TokenKind::Class => Err(self.unsupported("class definitions")),
            TokenKind::With => Err(self.unsupported("with statements")),
            TokenKind::At => Err(self.unsupported("decorators")),
            _ => self.simple_statements(),
        }
    }

    /// Parse `simple (';' simple)* NEWLINE`
    fn simple_statements(&mut self) -> ParseResult<Vec<Stmt>> {
        let mut stmts = vec![self.simple_statement()?];
        while self.eat(TokenKind::Semicolon).is_some() {
            if self.check(TokenKind::Newline) || self.is_eof() {
                break;
            }
            stmts.push(self.simple_statement()?);
        }
        if !self.is_eof() {
            self.expect(TokenKind::Newline)?;
        }
        Ok(stmts)
    }

    fn simple_statement(&mut self) -> ParseResult<Stmt> {
        let start = self.current().span.start;
        let kind = match self.current_kind() {
            TokenKind::Pass => {
                self.advance();
                StmtKind::Pass
            }
            TokenKind::Break => {
                let token = self.advance();
                if self.loop_depth == 0 {
                    return Err(ParseError::new(ParseErrorKind::BreakOutsideLoop, token.span));
                }
                StmtKind::Break
            }
            TokenKind::Continue => {
                let token = self.advance();
                if self.loop_depth == 0 {
                    return Err(ParseError::new(
                        ParseErrorKind::ContinueOutsideLoop,
                        token.span,
                    ));
                }
                StmtKind::Continue
            }
            TokenKind::Return => {
                let token = self.advance();
                if self.function_depth == 0 {
                    return Err(ParseError::new(
                        ParseErrorKind::ReturnOutsideFunction,
                        token.span,
                    ));
                }
                if self.at_statement_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.testlist()?))
                }
            }
            TokenKind::Raise => {
                self.advance();
                if self.at_statement_end() {
                    StmtKind::Raise(None)
                } else {
                    StmtKind::Raise(Some(self.test()?))
                }
            }
            TokenKind::Global => {
                self.advance();
                StmtKind::Global(self.name_list()?)
            }
            TokenKind::Nonlocal => {
                self.advance();
                StmtKind::Nonlocal(self.name_list()?)
            }
            TokenKind::Import => {
                self.advance();
                let mut names = vec![self.import_name()?];
                while self.eat(TokenKind::Comma).is_some() {
                    names.push(self.import_name()?);
                }
                StmtKind::Import(names)
            }
            TokenKind::From => {
                self.advance();
                let module = self.dotted_name()?;
                self.expect(TokenKind::Import)?;
                let parenthesized = self.eat(TokenKind::LParen).is_some();
                let mut names = vec![self.import_name()?];
                while self.eat(TokenKind::Comma).is_some() {
                    if parenthesized && self.check(TokenKind::RParen) {
                        break;
                    }
                    names.push(self.import_name()?);
                }
                if parenthesized {
                    self.expect(TokenKind::RParen)?;
                }
                StmtKind::FromImport { module, names }
            }
            TokenKind::Yield => return Err(self.unsupported("generators")),
            _ => return self.expression_statement(),
        };
        Ok(Stmt::new(kind, self.span_from(start)))
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.current_kind(),
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::Eof
        )
    }

    fn name_list(&mut self) -> ParseResult<Vec<Ident>> {
        let mut names = vec![self.expect_ident()?];
        while self.eat(TokenKind::Comma).is_some() {
            names.push(self.expect_ident()?);
        }
        Ok(names)
    }

    fn dotted_name(&mut self) -> ParseResult<String> {
        let mut path = self.expect_ident()?.name;
        while self.eat(TokenKind::Dot).is_some() {
            path.push('.');
            path.push_str(&self.expect_ident()?.name);
        }
        Ok(path)
    }

    fn import_name(&mut self) -> ParseResult<ImportName> {
        let start = self.current().span.start;
        let path = self.dotted_name()?;
        let alias = if self.eat(TokenKind::As).is_some() {
            Some(self.expect_ident()?)
        } else {
            None
        };
        Ok(ImportName {
            path,
            alias,
            span: self.span_from(start),
        })
    }

    /// Expression statement, assignment, or augmented assignment
    fn expression_statement(&mut self) -> ParseResult<Stmt> {
        let start = self.current().span.start;
        let first = self.testlist()?;

        if let Some(op) = self.augmented_op() {
            self.advance();
            Self::check_target(&first, false)?;
            let value = self.testlist()?;
            return Ok(Stmt::new(
                StmtKind::AugAssign {
                    target: first,
                    op,
                    value,
                },
                self.span_from(start),
            ));
        }

        if !self.check(TokenKind::Eq) {
            return Ok(Stmt::new(StmtKind::Expr(first), self.span_from(start)));
        }

        let mut targets = Vec::new();
        let mut value = first;
        while self.eat(TokenKind::Eq).is_some() {
            Self::check_target(&value, true)?;
            targets.push(value);
            value = self.testlist()?;
        }
        Ok(Stmt::new(
            StmtKind::Assign { targets, value },
            self.span_from(start),
        ))
    }

    fn augmented_op(&self) -> Option<BinOp> {
        let op = match self.current_kind() {
            TokenKind::PlusEq => BinOp::Add,
            TokenKind::MinusEq => BinOp::Sub,
            TokenKind::StarEq => BinOp::Mul,
            TokenKind::SlashEq => BinOp::Div,
            TokenKind::SlashSlashEq => BinOp::FloorDiv,
            TokenKind::PercentEq => BinOp::Mod,
            TokenKind::StarStarEq => BinOp::Pow,
            TokenKind::AmpEq => BinOp::BitAnd,
            TokenKind::PipeEq => BinOp::BitOr,
            TokenKind::CaretEq => BinOp::BitXor,
            TokenKind::ShlEq => BinOp::Shl,
            TokenKind::ShrEq => BinOp::Shr,
            _ => return None,
        };
        Some(op)
    }

    /// Validate an assignment target; tuples and lists are only allowed for plain assignment
    fn check_target(expr: &Expr, allow_unpack: bool) -> ParseResult<()> {
        match &expr.kind {
            ExprKind::Name(_) | ExprKind::Subscript { .. } | ExprKind::Attribute { .. } => Ok(()),
            ExprKind::Tuple(items) | ExprKind::List(items) if allow_unpack => items
                .iter()
                .try_for_each(|item| Self::check_target(item, true)),
            _ => Err(ParseError::new(
                ParseErrorKind::InvalidAssignmentTarget,
                expr.span,
            )),
        }
    }

    /// Parse `':' NEWLINE INDENT stmt+ DEDENT` or `':' simple_statements`
    fn block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect(TokenKind::Colon)?;
        if self.eat(TokenKind::Newline).is_none() {
            return self.simple_statements();
        }
        self.expect(TokenKind::Indent)?;
        let mut body = Vec::new();
        while !self.check(TokenKind::Dedent) && !self.is_eof() {
            if self.eat(TokenKind::Newline).is_some() {
                continue;
            }
            body.extend(self.statement()?);
        }
        self.eat(TokenKind::Dedent);
        Ok(body)
    }

    fn function_def(&mut self) -> ParseResult<Stmt> {
        let def_token = self.expect(TokenKind::Def)?;
        let start = def_token.span.start;
        let def_line = self.lines.line(start);
        let name = self.expect_ident()?;

        self.expect(TokenKind::LParen)?;
        let mut params: Vec<Param> = Vec::new();
        while !self.check(TokenKind::RParen) {
            if self.check(TokenKind::Star) || self.check(TokenKind::StarStar) {
                return Err(self.unsupported("variadic parameters"));
            }
            let param_name = self.expect_ident()?;
            if params.iter().any(|p| p.name.name == param_name.name) {
                return Err(ParseError::new(
                    ParseErrorKind::DuplicateParameter(param_name.name),
                    param_name.span,
                ));
            }
            let annotation = if self.eat(TokenKind::Colon).is_some() {
                Some(self.test()?)
            } else {
                None
            };
            let default = if self.eat(TokenKind::Eq).is_some() {
                Some(self.test()?)
            } else {
                None
            };
            params.push(Param {
                name: param_name,
                annotation,
                default,
            });
            if self.eat(TokenKind::Comma).is_none() {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        let returns = if self.eat(TokenKind::Arrow).is_some() {
            Some(self.test()?)
        } else {
            None
        };

        let outer_loop_depth = std::mem::replace(&mut self.loop_depth, 0);
        self.function_depth += 1;
        let body = self.block();
        self.function_depth -= 1;
        self.loop_depth = outer_loop_depth;
        let mut body = body?;

        let docstring = match body.first().map(|s| &s.kind) {
            Some(StmtKind::Expr(Expr {
                kind: ExprKind::Str(text),
                ..
            })) => Some(text.clone()),
            _ => None,
        };
        if docstring.is_some() {
            body.remove(0);
        }

        let span = self.span_from(start);
        let body_start_line = body
            .first()
            .map_or(u32::MAX, |stmt| self.lines.line(stmt.span.start));
        let leading_comments = self.leading_comments(def_line, body_start_line);

        let def = FunctionDef {
            name,
            params,
            returns,
            body,
            docstring,
            leading_comments,
            source: self.source[span.as_range()].to_string(),
            span,
        };
        Ok(Stmt::new(StmtKind::FunctionDef(Box::new(def)), span))
    }

    /// Standalone comments directly above line `def_line`, followed by those between the
    /// header and the first body statement
    fn leading_comments(&self, def_line: u32, body_start_line: u32) -> Vec<String> {
        let mut above = Vec::new();
        let mut line = def_line;
        while line > 1 {
            line -= 1;
            match self
                .comments
                .iter()
                .find(|c| c.line == line && c.standalone)
            {
                Some(comment) => above.push(comment.text.clone()),
                None => break,
            }
        }
        above.reverse();
        above.extend(
            self.comments
                .iter()
                .filter(|c| c.standalone && c.line > def_line && c.line < body_start_line)
                .map(|c| c.text.clone()),
        );
        above
    }

    fn if_stmt(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().span.start;
        let cond = self.test()?;
        let body = self.block()?;
        let orelse = if self.check(TokenKind::Elif) {
            vec![self.if_stmt()?]
        } else if self.eat(TokenKind::Else).is_some() {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(Stmt::new(
            StmtKind::If { cond, body, orelse },
            self.span_from(start),
        ))
    }

    fn loop_body(&mut self) -> ParseResult<Vec<Stmt>> {
        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        let body = body?;
        if self.check(TokenKind::Else) {
            return Err(self.unsupported("loop else clauses"));
        }
        Ok(body)
    }

    fn while_stmt(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().span.start;
        let cond = self.test()?;
        let body = self.loop_body()?;
        Ok(Stmt::new(
            StmtKind::While { cond, body },
            self.span_from(start),
        ))
    }

    fn for_stmt(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().span.start;
        let target = self.target_list()?;
        Self::check_target(&target, true)?;
        self.expect(TokenKind::In)?;
        let iter = self.testlist()?;
        let body = self.loop_body()?;
        Ok(Stmt::new(
            StmtKind::For { target, iter, body },
            self.span_from(start),
        ))
    }

    /// Loop target: expressions below comparison level so `in` is not consumed
    fn target_list(&mut self) -> ParseResult<Expr> {
        let start = self.current().span.start;
        let first = self.binary(1)?;
        if !self.check(TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(TokenKind::Comma).is_some() {
            if self.check(TokenKind::In) {
                break;
            }
            items.push(self.binary(1)?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), self.span_from(start)))
    }

    fn try_stmt(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().span.start;
        let body = self.block()?;
        let mut handlers = Vec::new();
        while self.check(TokenKind::Except) {
            let handler_start = self.advance().span.start;
            let kind = if self.check(TokenKind::Colon) {
                None
            } else {
                Some(self.test()?)
            };
            let name = if self.eat(TokenKind::As).is_some() {
                Some(self.expect_ident()?)
            } else {
                None
            };
            let handler_body = self.block()?;
            handlers.push(ExceptHandler {
                kind,
                name,
                body: handler_body,
                span: self.span_from(handler_start),
            });
        }
        if self.check(TokenKind::Else) {
            return Err(self.unsupported("try/else"));
        }
        let finally = if self.eat(TokenKind::Finally).is_some() {
            self.block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finally.is_empty() {
            return Err(self.unexpected("'except' or 'finally'"));
        }
        Ok(Stmt::new(
            StmtKind::Try {
                body,
                handlers,
                finally,
            },
            self.span_from(start),
        ))
    }

    // ==================== Expressions ====================

    /// `test (',' test)* [',']`, producing a tuple when a comma is present
    pub fn testlist(&mut self) -> ParseResult<Expr> {
        let start = self.current().span.start;
        let first = self.test()?;
        if !self.check(TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(TokenKind::Comma).is_some() {
            if !self.starts_expression() {
                break;
            }
            items.push(self.test()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), self.span_from(start)))
    }

    fn starts_expression(&self) -> bool {
        matches!(
            self.current_kind(),
            TokenKind::Ident
                | TokenKind::Int
                | TokenKind::HexInt
                | TokenKind::OctInt
                | TokenKind::BinInt
                | TokenKind::Float
                | TokenKind::Str
                | TokenKind::True
                | TokenKind::False
                | TokenKind::None
                | TokenKind::LParen
                | TokenKind::LBracket
                | TokenKind::LBrace
                | TokenKind::Minus
                | TokenKind::Plus
                | TokenKind::Tilde
                | TokenKind::Not
                | TokenKind::Lambda
        )
    }

    /// Conditional expression or lambda
    pub fn test(&mut self) -> ParseResult<Expr> {
        if self.check(TokenKind::Lambda) {
            return self.lambda();
        }
        let start = self.current().span.start;
        let then = self.or_test()?;
        if self.eat(TokenKind::If).is_none() {
            return Ok(then);
        }
        let cond = self.or_test()?;
        self.expect(TokenKind::Else)?;
        let otherwise = self.test()?;
        Ok(Expr::new(
            ExprKind::IfExp {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
            self.span_from(start),
        ))
    }

    fn lambda(&mut self) -> ParseResult<Expr> {
        let start = self.advance().span.start;
        let mut params = Vec::new();
        while !self.check(TokenKind::Colon) {
            params.push(self.expect_ident()?);
            if self.eat(TokenKind::Comma).is_none() {
                break;
            }
        }
        self.expect(TokenKind::Colon)?;
        let body = self.test()?;
        Ok(Expr::new(
            ExprKind::Lambda {
                params,
                body: Box::new(body),
            },
            self.span_from(start),
        ))
    }

    fn or_test(&mut self) -> ParseResult<Expr> {
        let start = self.current().span.start;
        let mut left = self.and_test()?;
        while self.eat(TokenKind::Or).is_some() {
            let right = self.and_test()?;
            left = Expr::new(
                ExprKind::BoolOp {
                    op: BoolOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                self.span_from(start),
            );
        }
        Ok(left)
    }

    fn and_test(&mut self) -> ParseResult<Expr> {
        let start = self.current().span.start;
        let mut left = self.not_test()?;
        while self.eat(TokenKind::And).is_some() {
            let right = self.not_test()?;
            left = Expr::new(
                ExprKind::BoolOp {
                    op: BoolOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                self.span_from(start),
            );
        }
        Ok(left)
    }

    fn not_test(&mut self) -> ParseResult<Expr> {
        if let Some(token) = self.eat(TokenKind::Not) {
            let operand = self.not_test()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                self.span_from(token.span.start),
            ));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        let start = self.current().span.start;
        let left = self.binary(1)?;
        let mut rest = Vec::new();
        while let Some(op) = self.comparison_op() {
            rest.push((op, self.binary(1)?));
        }
        if rest.is_empty() {
            return Ok(left);
        }
        Ok(Expr::new(
            ExprKind::Compare {
                left: Box::new(left),
                rest,
            },
            self.span_from(start),
        ))
    }

    /// Consume a comparison operator, including `not in` and `is not`
    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match self.current_kind() {
            TokenKind::EqEq => CmpOp::Eq,
            TokenKind::NotEq => CmpOp::NotEq,
            TokenKind::Lt => CmpOp::Lt,
            TokenKind::LtEq => CmpOp::LtEq,
            TokenKind::Gt => CmpOp::Gt,
            TokenKind::GtEq => CmpOp::GtEq,
            TokenKind::In => CmpOp::In,
            TokenKind::Is if self.peek_kind(1) == TokenKind::Not => {
                self.advance();
                CmpOp::IsNot
            }
            TokenKind::Is => CmpOp::Is,
            TokenKind::Not if self.peek_kind(1) == TokenKind::In => {
                self.advance();
                CmpOp::NotIn
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    /// Precedence climbing over the left-associative binary operators
    fn binary(&mut self, min_prec: u8) -> ParseResult<Expr> {
        let start = self.current().span.start;
        let mut left = self.unary()?;
        while let Some(op) = self.infix_op() {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.advance();
            let right = self.binary(prec + 1)?;
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                self.span_from(start),
            );
        }
        Ok(left)
    }

    fn infix_op(&self) -> Option<BinOp> {
        let op = match self.current_kind() {
            TokenKind::Plus => BinOp::Add,
            TokenKind::Minus => BinOp::Sub,
            TokenKind::Star => BinOp::Mul,
            TokenKind::Slash => BinOp::Div,
            TokenKind::SlashSlash => BinOp::FloorDiv,
            TokenKind::Percent => BinOp::Mod,
            TokenKind::At => BinOp::MatMul,
            TokenKind::Amp => BinOp::BitAnd,
            TokenKind::Pipe => BinOp::BitOr,
            TokenKind::Caret => BinOp::BitXor,
            TokenKind::Shl => BinOp::Shl,
            TokenKind::Shr => BinOp::Shr,
            _ => return None,
        };
        Some(op)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        let op = match self.current_kind() {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Pos,
            TokenKind::Tilde => UnaryOp::Invert,
            _ => return self.power(),
        };
        let start = self.advance().span.start;
        let operand = self.unary()?;
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            self.span_from(start),
        ))
    }

    /// `postfix ['**' unary]`; binds tighter than a unary minus on its left
    fn power(&mut self) -> ParseResult<Expr> {
        let start = self.current().span.start;
        let base = self.postfix()?;
        if self.eat(TokenKind::StarStar).is_none() {
            return Ok(base);
        }
        let exponent = self.unary()?;
        Ok(Expr::new(
            ExprKind::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            },
            self.span_from(start),
        ))
    }

    /// Calls, subscripts and attribute access
    fn postfix(&mut self) -> ParseResult<Expr> {
        let start = self.current().span.start;
        let mut expr = self.atom()?;
        loop {
            match self.current_kind() {
                TokenKind::LParen => {
                    self.advance();
                    let (args, keywords) = self.call_args()?;
                    self.expect(TokenKind::RParen)?;
                    expr = Expr::new(
                        ExprKind::Call {
                            func: Box::new(expr),
                            args,
                            keywords,
                        },
                        self.span_from(start),
                    );
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.testlist()?;
                    if self.check(TokenKind::Colon) {
                        return Err(self.unsupported("slices"));
                    }
                    self.expect(TokenKind::RBracket)?;
                    expr = Expr::new(
                        ExprKind::Subscript {
                            value: Box::new(expr),
                            index: Box::new(index),
                        },
                        self.span_from(start),
                    );
                }
                TokenKind::Dot => {
                    self.advance();
                    let attr = self.expect_ident()?;
                    expr = Expr::new(
                        ExprKind::Attribute {
                            value: Box::new(expr),
                            attr,
                        },
                        self.span_from(start),
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn call_args(&mut self) -> ParseResult<(Vec<Expr>, Vec<(Ident, Expr)>)> {
        let mut args = Vec::new();
        let mut keywords = Vec::new();
        while !self.check(TokenKind::RParen) {
            if self.check(TokenKind::Star) || self.check(TokenKind::StarStar) {
                return Err(self.unsupported("argument unpacking"));
            }
            if self.check(TokenKind::Ident) && self.peek_kind(1) == TokenKind::Eq {
                let name = self.expect_ident()?;
                self.advance();
                keywords.push((name, self.test()?));
            } else {
                if !keywords.is_empty() {
                    return Err(self
                        .unexpected("keyword argument")
                        .with_hint("positional arguments must come before keyword arguments"));
                }
                args.push(self.test()?);
            }
            if self.check(TokenKind::For) {
                return Err(self.unsupported("generator expressions"));
            }
            if self.eat(TokenKind::Comma).is_none() {
                break;
            }
        }
        Ok((args, keywords))
    }

    fn atom(&mut self) -> ParseResult<Expr> {
        let token = self.current().clone();
        let kind = match token.kind {
            TokenKind::Int | TokenKind::HexInt | TokenKind::OctInt | TokenKind::BinInt => {
                self.advance();
                ExprKind::Int(Self::integer_value(&token)?)
            }
            TokenKind::Float => {
                self.advance();
                let text = token.lexeme.replace('_', "");
                let value = text.parse::<f64>().map_err(|_| {
                    ParseError::new(ParseErrorKind::InvalidNumber(token.lexeme.clone()), token.span)
                })?;
                ExprKind::Float(value)
            }
            TokenKind::Str => {
                let mut text = String::new();
                while let Some(part) = self.eat(TokenKind::Str) {
                    text.push_str(&part.lexeme);
                }
                ExprKind::Str(text)
            }
            TokenKind::True => {
                self.advance();
                ExprKind::Bool(true)
            }
            TokenKind::False => {
                self.advance();
                ExprKind::Bool(false)
            }
            TokenKind::None => {
                self.advance();
                ExprKind::None
            }
            TokenKind::Ident => {
                self.advance();
                ExprKind::Name(token.lexeme)
            }
            TokenKind::LParen => return self.paren(),
            TokenKind::LBracket => {
                self.advance();
                let items = self.display_items(TokenKind::RBracket)?;
                ExprKind::List(items)
            }
            TokenKind::LBrace => return self.dict(),
            other => {
                return Err(ParseError::new(
                    ParseErrorKind::ExpectedExpression(other),
                    token.span,
                ))
            }
        };
        Ok(Expr::new(kind, self.span_from(token.span.start)))
    }

    fn integer_value(token: &Token) -> ParseResult<i64> {
        let text = token.lexeme.replace('_', "");
        let parsed = match token.kind {
            TokenKind::HexInt => i64::from_str_radix(&text[2..], 16),
            TokenKind::OctInt => i64::from_str_radix(&text[2..], 8),
            TokenKind::BinInt => i64::from_str_radix(&text[2..], 2),
            _ => text.parse::<i64>(),
        };
        parsed.map_err(|_| {
            ParseError::new(
                ParseErrorKind::InvalidNumber(token.lexeme.clone()),
                token.span,
            )
            .with_hint("integer literals must fit in 64 bits")
        })
    }

    /// Items of a list display up to the closing token (consumed)
    fn display_items(&mut self, close: TokenKind) -> ParseResult<Vec<Expr>> {
        let mut items = Vec::new();
        while !self.check(close) {
            items.push(self.test()?);
            if self.check(TokenKind::For) {
                return Err(self.unsupported("comprehensions"));
            }
            if self.eat(TokenKind::Comma).is_none() {
                break;
            }
        }
        self.expect(close)?;
        Ok(items)
    }

    /// Parenthesized expression or tuple
    fn paren(&mut self) -> ParseResult<Expr> {
        let start = self.advance().span.start;
        if self.eat(TokenKind::RParen).is_some() {
            return Ok(Expr::new(ExprKind::Tuple(Vec::new()), self.span_from(start)));
        }
        let first = self.test()?;
        if self.check(TokenKind::For) {
            return Err(self.unsupported("generator expressions"));
        }
        if self.eat(TokenKind::RParen).is_some() {
            return Ok(first);
        }
        self.expect(TokenKind::Comma)?;
        let mut items = vec![first];
        items.extend(self.display_items(TokenKind::RParen)?);
        Ok(Expr::new(ExprKind::Tuple(items), self.span_from(start)))
    }

    fn dict(&mut self) -> ParseResult<Expr> {
        let start = self.advance().span.start;
        let mut entries = Vec::new();
        while !self.check(TokenKind::RBrace) {
            let key = self.test()?;
            if !self.check(TokenKind::Colon) {
                return Err(self.unsupported("set displays"));
            }
            self.advance();
            let value = self.test()?;
            entries.push((key, value));
            if self.check(TokenKind::For) {
                return Err(self.unsupported("comprehensions"));
            }
            if self.eat(TokenKind::Comma).is_none() {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::new(ExprKind::Dict(entries), self.span_from(start)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Module {
        match Parser::parse_module(source) {
            Ok(module) => module,
            Err(errors) => panic!("parse failed: {errors:?}"),
        }
    }

    fn expr(source: &str) -> Expr {
        match Parser::parse_expression(source) {
            Ok(expr) => expr,
            Err(errors) => panic!("parse failed: {errors:?}"),
        }
    }

    #[test]
    fn parses_function_with_docstring() {
        let module = parse("def f(n):\n    \"\"\"Doc\"\"\"\n    return n + 1\n");
        let f = module.function("f").unwrap();
        assert_eq!(f.docstring.as_deref(), Some("Doc"));
        assert_eq!(f.body.len(), 1);
        assert!(matches!(f.body[0].kind, StmtKind::Return(Some(_))));
        assert!(f.source.starts_with("def f(n):"));
        assert!(f.source.ends_with("return n + 1"));
    }

    #[test]
    fn collects_leading_comments() {
        let source = "x = 1\n# above\ndef f():\n    \"\"\"Doc\"\"\"\n    # #adrenaline:hot\n    y = 2  # trailing\n    return y\n";
        let module = parse(source);
        let f = module.function("f").unwrap();
        assert_eq!(f.leading_comments, vec![" above", " #adrenaline:hot"]);
        assert!(f.documentation().contains("#adrenaline:hot"));
    }

    #[test]
    fn power_binds_tighter_than_unary_minus() {
        let e = expr("-2 ** 2");
        match e.kind {
            ExprKind::Unary {
                op: UnaryOp::Neg,
                operand,
            } => assert!(matches!(operand.kind, ExprKind::Binary { op: BinOp::Pow, .. })),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn multiplicative_binds_tighter_than_additive() {
        let e = expr("1 + 2 * 3");
        match e.kind {
            ExprKind::Binary {
                op: BinOp::Add,
                right,
                ..
            } => assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Mul, .. })),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn chained_comparison() {
        let e = expr("a < b <= c");
        match e.kind {
            ExprKind::Compare { rest, .. } => {
                assert_eq!(rest.len(), 2);
                assert_eq!(rest[0].0, CmpOp::Lt);
                assert_eq!(rest[1].0, CmpOp::LtEq);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            expr("a not in b").kind,
            ExprKind::Compare { ref rest, .. } if rest[0].0 == CmpOp::NotIn
        ));
    }

    #[test]
    fn tuple_assignment_and_augmented_assignment() {
        let module = parse("a, b = b, a + b\nx += 1\n");
        assert!(matches!(
            &module.body[0].kind,
            StmtKind::Assign { targets, value: Expr { kind: ExprKind::Tuple(items), .. } }
                if targets.len() == 1 && items.len() == 2
        ));
        assert!(matches!(
            module.body[1].kind,
            StmtKind::AugAssign { op: BinOp::Add, .. }
        ));
    }

    #[test]
    fn elif_desugars_to_nested_if() {
        let module = parse("if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n");
        match &module.body[0].kind {
            StmtKind::If { orelse, .. } => {
                assert_eq!(orelse.len(), 1);
                assert!(matches!(
                    &orelse[0].kind,
                    StmtKind::If { orelse, .. } if orelse.len() == 1
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn method_call_with_dict_literal() {
        let module = parse("data = {\"count\": 42}\nv = data.get(\"count\", 0)\n");
        match &module.body[1].kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::Call { func, args, .. } => {
                    assert!(matches!(func.kind, ExprKind::Attribute { .. }));
                    assert_eq!(args.len(), 2);
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn for_loop_over_range() {
        let module = parse("for i in range(10):\n    pass\n");
        assert!(matches!(
            &module.body[0].kind,
            StmtKind::For { target, .. } if target.as_name() == Some("i")
        ));
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        assert!(Parser::parse_module("break\n").is_err());
        assert!(Parser::parse_module("def f():\n    while True:\n        break\n").is_ok());
    }

    #[test]
    fn return_outside_function_is_an_error() {
        let errors = Parser::parse_module("return 1\n").unwrap_err();
        assert_eq!(errors[0].kind, ParseErrorKind::ReturnOutsideFunction);
    }

    #[test]
    fn integer_literal_overflow_is_reported() {
        let errors = Parser::parse_expression("99999999999999999999").unwrap_err();
        assert!(matches!(errors[0].kind, ParseErrorKind::InvalidNumber(_)));
    }

    #[test]
    fn try_except_and_imports() {
        let module = parse(
            "import math\nfrom os import path as p\ntry:\n    x = 1\nexcept ValueError as e:\n    x = 2\nfinally:\n    pass\n",
        );
        assert!(matches!(&module.body[0].kind, StmtKind::Import(names) if names[0].bound_name() == "math"));
        assert!(matches!(&module.body[1].kind, StmtKind::FromImport { names, .. } if names[0].bound_name() == "p"));
        assert!(matches!(&module.body[2].kind, StmtKind::Try { handlers, finally, .. } if handlers.len() == 1 && finally.len() == 1));
    }

    #[test]
    fn annotated_parameters() {
        let module = parse("def f(n: int, xs: list[float] = None) -> float:\n    return 0.0\n");
        let f = module.function("f").unwrap();
        assert!(f.params[0].annotation.is_some());
        assert!(f.params[1].default.is_some());
        assert!(f.returns.is_some());
    }

    #[test]
    fn single_line_blocks() {
        let module = parse("def f(x): return x\nif x: y = 1\n");
        assert_eq!(module.functions().count(), 1);
        assert_eq!(module.body.len(), 2);
    }
}
