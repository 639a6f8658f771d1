//! Lexer for the Python subset accepted by the host front end
//!
//! The lexer converts source code into a stream of tokens, handling:
//! - Keywords, identifiers, and operators
//! - Numeric literals (decimal, hex, octal, binary, float)
//! - Single, double and triple quoted string literals
//! - `#` comments, kept in the stream so directives can be recovered
//! - Significant indentation (`Indent`/`Dedent`) and implicit line joining inside brackets

mod span;
mod token;

pub use span::{LineIndex, Span};
pub use token::TokenKind;

use logos::Logos;
use std::collections::VecDeque;
use thiserror::Error;

/// A token with its kind, span, and source text
///
/// For string literals the lexeme holds the decoded value rather than the raw source.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// The kind of token
    pub kind: TokenKind,
    /// The span in the source code
    pub span: Span,
    /// The source text of the token
    pub lexeme: String,
}

impl Token {
    /// Create a new token
    #[must_use]
    pub fn new(kind: TokenKind, span: Span, lexeme: impl Into<String>) -> Self {
        Self {
            kind,
            span,
            lexeme: lexeme.into(),
        }
    }
}

/// Lexer error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexError {
    #[error("unexpected character")]
    UnexpectedChar,
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unindent does not match any outer indentation level")]
    InconsistentDedent,
}

/// A lexer error with location information
#[derive(Debug, Clone)]
pub struct SpannedError {
    pub error: LexError,
    pub span: Span,
}

impl SpannedError {
    #[must_use]
    pub fn new(error: LexError, span: Span) -> Self {
        Self { error, span }
    }
}

impl std::fmt::Display for SpannedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.error, self.span)
    }
}

impl std::error::Error for SpannedError {}

/// Width a tab advances the indentation column to
const TAB_WIDTH: u32 = 8;

/// The Python-subset lexer
pub struct Lexer<'source> {
    source: &'source str,
    /// Current position in the source (byte offset)
    position: usize,
    /// Indentation columns of the enclosing blocks; always starts with 0
    indent_stack: Vec<u32>,
    /// Nesting depth of open brackets
    bracket_depth: u32,
    /// True until the first significant token of a logical line
    at_line_start: bool,
    /// Tokens queued by indentation processing
    pending: VecDeque<Token>,
    /// Set once `Eof` has been produced
    finished: bool,
    /// Collected errors during lexing
    errors: Vec<SpannedError>,
}

impl<'source> Lexer<'source> {
    /// Create a new lexer for the given source code
    #[must_use]
    pub fn new(source: &'source str) -> Self {
        Self {
            source,
            position: 0,
            indent_stack: vec![0],
            bracket_depth: 0,
            at_line_start: true,
            pending: VecDeque::new(),
            finished: false,
            errors: Vec::new(),
        }
    }

    /// Tokenize the entire source, returning all tokens and any errors
    #[must_use]
    pub fn tokenize(source: &str) -> (Vec<Token>, Vec<SpannedError>) {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        while let Some(token) = lexer.next_token() {
            tokens.push(token);
        }
        (tokens, lexer.errors)
    }

    /// Get the next token, or `None` after `Eof` has been returned
    pub fn next_token(&mut self) -> Option<Token> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Some(token);
            }
            if self.finished {
                return None;
            }
            if let Some(token) = self.lex_one() {
                return Some(token);
            }
        }
    }

    /// Lex a single raw token. Returns `None` when the token was absorbed (blank lines,
    /// joined newlines) or when its output was queued in `pending`.
    fn lex_one(&mut self) -> Option<Token> {
        let remaining = &self.source[self.position..];
        let mut logos_lexer = TokenKind::lexer(remaining);
        let Some(result) = logos_lexer.next() else {
            self.finish();
            return None;
        };

        let range = logos_lexer.span();
        let start = self.position + range.start;
        let end = self.position + range.end;
        let span = Span::new(start as u32, end as u32);
        self.position = end;

        let kind = match result {
            Ok(kind) => kind,
            Err(()) => {
                self.errors
                    .push(SpannedError::new(LexError::UnexpectedChar, span));
                self.at_line_start = false;
                return Some(Token::new(TokenKind::Error, span, &self.source[start..end]));
            }
        };

        match kind {
            TokenKind::Newline => {
                if self.bracket_depth > 0 || self.at_line_start {
                    return None;
                }
                self.at_line_start = true;
                Some(Token::new(TokenKind::Newline, span, "\n"))
            }
            TokenKind::Comment => Some(Token::new(kind, span, &self.source[start..end])),
            _ => {
                if self.at_line_start && self.bracket_depth == 0 {
                    self.at_line_start = false;
                    self.process_indentation(start);
                }
                if kind.is_open_bracket() {
                    self.bracket_depth += 1;
                } else if kind.is_close_bracket() {
                    self.bracket_depth = self.bracket_depth.saturating_sub(1);
                }
                let token = if kind == TokenKind::StringStart {
                    self.lex_string(start)
                } else {
                    Token::new(kind, span, &self.source[start..end])
                };
                if self.pending.is_empty() {
                    Some(token)
                } else {
                    self.pending.push_back(token);
                    None
                }
            }
        }
    }

    /// Compare the indentation of the line containing `token_start` with the block stack
    /// and queue the matching `Indent`/`Dedent` tokens.
    fn process_indentation(&mut self, token_start: usize) {
        let line_start = self.source[..token_start]
            .rfind('\n')
            .map_or(0, |offset| offset + 1);
        let column = self.source[line_start..token_start]
            .chars()
            .fold(0u32, |column, c| match c {
                '\t' => (column / TAB_WIDTH + 1) * TAB_WIDTH,
                _ => column + 1,
            });
        let span = Span::new(line_start as u32, token_start as u32);
        let current = self.indent_stack.last().copied().unwrap_or(0);

        if column > current {
            self.indent_stack.push(column);
            self.pending.push_back(Token::new(TokenKind::Indent, span, ""));
            return;
        }
        while column < self.indent_stack.last().copied().unwrap_or(0) {
            self.indent_stack.pop();
            self.pending.push_back(Token::new(TokenKind::Dedent, span, ""));
        }
        if column != self.indent_stack.last().copied().unwrap_or(0) {
            self.errors
                .push(SpannedError::new(LexError::InconsistentDedent, span));
            self.indent_stack.push(column);
        }
    }

    /// Scan the body of a string literal whose opening quote (and prefix) was just lexed
    fn lex_string(&mut self, start: usize) -> Token {
        let opening = &self.source[start..self.position];
        let raw = opening.contains(['r', 'R']);
        let quote = opening.chars().last().unwrap_or('"');
        let triple: String = std::iter::repeat(quote).take(3).collect();
        let is_triple = self.source[start..]
            .trim_start_matches(|c: char| c.is_ascii_alphabetic())
            .starts_with(&triple);
        if is_triple {
            self.position += 2;
        }

        let mut content = String::new();
        let mut chars = self.source[self.position..].char_indices();
        while let Some((offset, c)) = chars.next() {
            let at = self.position + offset;
            if c == quote {
                if !is_triple {
                    self.position = at + 1;
                    return self.string_token(start, content);
                }
                if self.source[at..].starts_with(&triple) {
                    self.position = at + 3;
                    return self.string_token(start, content);
                }
                content.push(c);
            } else if c == '\\' {
                let Some((_, escaped)) = chars.next() else {
                    break;
                };
                if raw {
                    content.push('\\');
                    content.push(escaped);
                    continue;
                }
                match escaped {
                    'n' => content.push('\n'),
                    't' => content.push('\t'),
                    'r' => content.push('\r'),
                    '0' => content.push('\0'),
                    '\\' | '\'' | '"' => content.push(escaped),
                    '\n' => {}
                    other => {
                        content.push('\\');
                        content.push(other);
                    }
                }
            } else if c == '\n' && !is_triple {
                self.position = at;
                self.errors.push(SpannedError::new(
                    LexError::UnterminatedString,
                    Span::new(start as u32, at as u32),
                ));
                return self.string_token(start, content);
            } else {
                content.push(c);
            }
        }

        self.position = self.source.len();
        self.errors.push(SpannedError::new(
            LexError::UnterminatedString,
            Span::new(start as u32, self.position as u32),
        ));
        self.string_token(start, content)
    }

    fn string_token(&self, start: usize, content: String) -> Token {
        Token::new(
            TokenKind::Str,
            Span::new(start as u32, self.position as u32),
            content,
        )
    }

    /// Close the logical line and all open blocks, then emit `Eof`
    fn finish(&mut self) {
        let end = Span::new(self.source.len() as u32, self.source.len() as u32);
        if !self.at_line_start {
            self.pending.push_back(Token::new(TokenKind::Newline, end, "\n"));
            self.at_line_start = true;
        }
        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            self.pending.push_back(Token::new(TokenKind::Dedent, end, ""));
        }
        self.pending.push_back(Token::new(TokenKind::Eof, end, ""));
        self.finished = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let (tokens, errors) = Lexer::tokenize(source);
        assert!(errors.is_empty(), "unexpected lex errors: {errors:?}");
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn simple_function_layout() {
        use TokenKind::*;
        assert_eq!(
            kinds("def f(n):\n    return n\n"),
            vec![
                Def, Ident, LParen, Ident, RParen, Colon, Newline, Indent, Return, Ident, Newline,
                Dedent, Eof
            ]
        );
    }

    #[test]
    fn blank_lines_and_comments_do_not_change_indentation() {
        use TokenKind::*;
        let source = "def f():\n\n    # hi\n    x = 1\n\n    return x\n";
        assert_eq!(
            kinds(source),
            vec![
                Def, Ident, LParen, RParen, Colon, Newline, Comment, Indent, Ident, Eq, Int,
                Newline, Return, Ident, Newline, Dedent, Eof
            ]
        );
    }

    #[test]
    fn brackets_join_lines() {
        use TokenKind::*;
        assert_eq!(
            kinds("x = (1 +\n     2)\n"),
            vec![Ident, Eq, LParen, Int, Plus, Int, RParen, Newline, Eof]
        );
    }

    #[test]
    fn nested_dedent_to_top_level() {
        use TokenKind::*;
        let source = "if a:\n    if b:\n        pass\nx\n";
        assert_eq!(
            kinds(source),
            vec![
                If, Ident, Colon, Newline, Indent, If, Ident, Colon, Newline, Indent, Pass,
                Newline, Dedent, Dedent, Ident, Newline, Eof
            ]
        );
    }

    #[test]
    fn numeric_literals() {
        use TokenKind::*;
        assert_eq!(
            kinds("1 1.5 2. .5 1e3 0xff 0o17 0b101 1_000"),
            vec![Int, Float, Float, Float, Float, HexInt, OctInt, BinInt, Int, Newline, Eof]
        );
    }

    #[test]
    fn string_literals_are_decoded() {
        let (tokens, errors) = Lexer::tokenize(r#"'a\tb' "c" r"\d""#);
        assert!(errors.is_empty());
        let strings: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Str)
            .map(|t| t.lexeme.as_str())
            .collect();
        assert_eq!(strings, vec!["a\tb", "c", "\\d"]);
    }

    #[test]
    fn triple_quoted_docstring_spans_lines() {
        let source = "def f():\n    \"\"\"Doc\n    #adrenaline:hot\n    \"\"\"\n    pass\n";
        let (tokens, errors) = Lexer::tokenize(source);
        assert!(errors.is_empty());
        let doc = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Str)
            .map(|t| t.lexeme.clone());
        assert_eq!(doc.as_deref(), Some("Doc\n    #adrenaline:hot\n    "));
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Pass));
    }

    #[test]
    fn unterminated_string_is_reported() {
        let (_, errors) = Lexer::tokenize("x = 'abc\n");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error, LexError::UnterminatedString);
    }

    #[test]
    fn inconsistent_dedent_is_reported() {
        let (_, errors) = Lexer::tokenize("if a:\n        x\n    y\n");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error, LexError::InconsistentDedent);
    }
}
