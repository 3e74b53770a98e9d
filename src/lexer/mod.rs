//! The Parsley lexer.
//!
//! Produces tokens on demand from a shared byte buffer. The lexer is modal:
//! markup (`<div …>`) switches it into header/content sub-modes, `<style>`
//! and `<script>` bodies into a raw-text sub-mode, and `{…}` interpolation
//! islands back into normal expression lexing. The entire mutable state can
//! be snapshotted and restored in O(1), which is what the parser's bounded
//! backtracking leans on.

mod literal;
mod scan;
pub mod token;

use std::sync::Arc;

use crate::error::Diagnostic;
pub use token::{keyword_kind, Payload, TemplatePart, Token, TokenKind};

/// Lexer modes beyond plain expression scanning. The stack nests: a tag
/// body may contain an interpolation which may contain another tag.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Mode {
    /// Between `<name` and the closing `>`/`/>` of the opening tag.
    TagHeader { name: String },
    /// Between the opening tag and `</name>`. `raw` bodies (`style`,
    /// `script`) treat braces as literal text.
    TagContent { name: String, raw: bool },
    /// Inside a `{…}` (or `@{…}`) island; pops when the braces balance.
    Interp { depth: u32 },
}

/// The complete mutable state of the lexer. Cloned for [`Lexer::save`];
/// restoring is a plain assignment.
#[derive(Debug, Clone)]
pub(crate) struct LexState {
    pub(crate) pos: usize,
    pub(crate) line: u32,
    pub(crate) col: u32,
    pub(crate) prev_kind: Option<TokenKind>,
    pub(crate) prev_end_line: u32,
    pub(crate) modes: Vec<Mode>,
}

/// Opaque snapshot of the lexer state.
#[derive(Debug, Clone)]
pub struct Snapshot(LexState);

pub struct Lexer {
    pub(crate) src: Arc<[u8]>,
    pub(crate) state: LexState,
}

impl Lexer {
    pub fn new(source: &str) -> Lexer {
        Lexer {
            src: Arc::from(source.as_bytes()),
            state: LexState {
                pos: 0,
                line: 1,
                col: 1,
                prev_kind: None,
                prev_end_line: 0,
                modes: Vec::new(),
            },
        }
    }

    pub fn save(&self) -> Snapshot {
        Snapshot(self.state.clone())
    }

    pub fn restore(&mut self, snapshot: Snapshot) {
        self.state = snapshot.0;
    }

    // Byte-level helpers. Multi-byte sequences are decoded as runes on
    // demand; the ASCII path never materialises a char.

    pub(crate) fn byte(&self, offset: usize) -> Option<u8> {
        self.src.get(self.state.pos + offset).copied()
    }

    pub(crate) fn at_end(&self) -> bool {
        self.state.pos >= self.src.len()
    }

    pub(crate) fn starts_with(&self, s: &str) -> bool {
        self.src[self.state.pos..].starts_with(s.as_bytes())
    }

    /// Decode the rune at the cursor without advancing.
    pub(crate) fn rune(&self) -> Option<(char, usize)> {
        let rest = &self.src[self.state.pos.min(self.src.len())..];
        if rest.is_empty() {
            return None;
        }
        let b = rest[0];
        if b < 0x80 {
            return Some((b as char, 1));
        }
        let width = match b {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        }
        .min(rest.len());
        match std::str::from_utf8(&rest[..width]) {
            Ok(s) => s.chars().next().map(|c| (c, c.len_utf8())),
            Err(_) => Some((char::REPLACEMENT_CHARACTER, 1)),
        }
    }

    /// Advance one rune, maintaining line/column counters.
    pub(crate) fn bump(&mut self) {
        if let Some((c, width)) = self.rune() {
            self.state.pos += width;
            if c == '\n' {
                self.state.line += 1;
                self.state.col = 1;
            } else {
                self.state.col += 1;
            }
        }
    }

    pub(crate) fn bump_n(&mut self, runes: usize) {
        for _ in 0..runes {
            self.bump();
        }
    }

    /// Consume `s` if the input starts with it. `s` must be ASCII.
    pub(crate) fn eat(&mut self, s: &str) -> bool {
        if self.starts_with(s) {
            self.state.pos += s.len();
            self.state.col += s.len() as u32;
            true
        } else {
            false
        }
    }

    pub(crate) fn slice(&self, from: usize) -> String {
        String::from_utf8_lossy(&self.src[from..self.state.pos]).into_owned()
    }

    /// Produce the next token. Returns a diagnostic only for genuinely
    /// un-lexable input (unterminated string, bad money, malformed regex).
    pub fn next_token(&mut self) -> Result<Token, Diagnostic> {
        let in_content = matches!(self.state.modes.last(), Some(Mode::TagContent { .. }));
        let token = if in_content {
            self.content_token()?
        } else {
            self.normal_token()?
        };
        self.state.prev_kind = Some(token.kind);
        self.state.prev_end_line = token.line + token.literal.matches('\n').count() as u32;
        Ok(token)
    }

    /// Collect whitespace and `//` comments preceding a token.
    fn trivia(&mut self) -> (u32, Vec<String>, Option<String>) {
        let mut blank_lines = 0u32;
        let mut leading: Vec<String> = Vec::new();
        let mut trailing: Option<String> = None;
        let mut newlines_seen = 0u32;
        let mut line_had_content = false;

        loop {
            match self.byte(0) {
                Some(b' ') | Some(b'\t') | Some(b'\r') => self.bump(),
                Some(b'\n') => {
                    if newlines_seen > 0 && !line_had_content {
                        blank_lines += 1;
                    }
                    newlines_seen += 1;
                    line_had_content = false;
                    self.bump();
                }
                Some(b'/') if self.byte(1) == Some(b'/') => {
                    let comment_line = self.state.line;
                    let start = self.state.pos;
                    while let Some(b) = self.byte(0) {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                    let text = self.slice(start);
                    if comment_line == self.state.prev_end_line && trailing.is_none() {
                        trailing = Some(text);
                    } else {
                        leading.push(text);
                    }
                    line_had_content = true;
                }
                _ => break,
            }
        }
        (blank_lines, leading, trailing)
    }

    /// Lex one token in normal (expression) mode.
    fn normal_token(&mut self) -> Result<Token, Diagnostic> {
        let (blank_lines, leading, trailing) = self.trivia();
        let start = self.state.pos;
        let line = self.state.line;
        let col = self.state.col;

        let Some((c, _)) = self.rune() else {
            let mut eof = Token::eof(line, col, start);
            eof.blank_lines_before = blank_lines;
            eof.leading_comments = leading;
            eof.trailing_comment = trailing;
            return Ok(eof);
        };

        let expr_context = self.expression_context();

        let (kind, payload) = match c {
            '"' => self.scan_string()?,
            '\'' => self.scan_raw_string()?,
            '`' => self.scan_template()?,
            '@' => self.scan_at_literal()?,
            '0'..='9' => self.scan_number()?,
            '/' if expr_context => self.scan_regex()?,
            '<' if expr_context && self.tag_follows() => self.scan_tag_open()?,
            _ => {
                if let Some(kp) = self.scan_money_start()? {
                    kp
                } else if c == '_' || c.is_alphabetic() {
                    self.scan_word()
                } else {
                    self.scan_operator()?
                }
            }
        };

        // Interpolation islands track their own brace balance.
        if let Some(Mode::Interp { depth }) = self.state.modes.last_mut() {
            match kind {
                TokenKind::LBrace => *depth += 1,
                TokenKind::RBrace => {
                    *depth -= 1;
                    if *depth == 0 {
                        self.state.modes.pop();
                    }
                }
                _ => {}
            }
        }

        Ok(Token {
            kind,
            literal: self.slice(start),
            line,
            column: col,
            offset: start,
            blank_lines_before: blank_lines,
            leading_comments: leading,
            trailing_comment: trailing,
            payload,
        })
    }

    /// Can a `/` or `<` at the cursor open a regex or tag? True when the
    /// previous token cannot end an expression.
    fn expression_context(&self) -> bool {
        match self.state.prev_kind {
            None => true,
            Some(k) => matches!(
                k,
                TokenKind::Assign
                    | TokenKind::Eq
                    | TokenKind::NotEq
                    | TokenKind::Lt
                    | TokenKind::Gt
                    | TokenKind::Le
                    | TokenKind::Ge
                    | TokenKind::And
                    | TokenKind::Or
                    | TokenKind::Not
                    | TokenKind::Comma
                    | TokenKind::Semicolon
                    | TokenKind::Colon
                    | TokenKind::LParen
                    | TokenKind::LBracket
                    | TokenKind::LBrace
                    | TokenKind::Concat
                    | TokenKind::Match
                    | TokenKind::NotMatch
                    | TokenKind::Question
                    | TokenKind::Nullish
                    | TokenKind::Return
                    | TokenKind::Check
                    | TokenKind::If
                    | TokenKind::Else
                    | TokenKind::For
                    | TokenKind::In
                    | TokenKind::Let
                    | TokenKind::Export
                    | TokenKind::Try
                    | TokenKind::Skip
                    | TokenKind::Stop
                    | TokenKind::Pipe
                    | TokenKind::TagHeaderEnd
                    | TokenKind::TagText
                    | TokenKind::ReadFrom
                    | TokenKind::FetchFrom
                    | TokenKind::WriteTo
                    | TokenKind::WriteAppend
                    | TokenKind::QueryOne
                    | TokenKind::QueryMany
                    | TokenKind::ExecSql
                    | TokenKind::ShellPipe
                    | TokenKind::PipeRead
            ),
        }
    }

    fn scan_word(&mut self) -> (TokenKind, Payload) {
        let start = self.state.pos;
        while let Some((c, _)) = self.rune() {
            // ASCII fast path first; multi-byte identifiers decode runes.
            let continues = if c.is_ascii() {
                c.is_ascii_alphanumeric() || c == '_'
            } else {
                c.is_alphanumeric()
            };
            if continues {
                self.bump();
            } else {
                break;
            }
        }
        let word = self.slice(start);
        match keyword_kind(&word) {
            Some(kind) => (kind, Payload::None),
            None => (TokenKind::Ident, Payload::Str(word)),
        }
    }

    fn scan_operator(&mut self) -> Result<(TokenKind, Payload), Diagnostic> {
        // Longest match first within each leading byte.
        const TABLE: &[(&str, TokenKind)] = &[
            ("<=??=>", TokenKind::QueryMany),
            ("<=?=>", TokenKind::QueryOne),
            ("<=!=>", TokenKind::ExecSql),
            ("<=#=>", TokenKind::ShellPipe),
            ("<=/=", TokenKind::FetchFrom),
            ("<==", TokenKind::ReadFrom),
            ("<=", TokenKind::Le),
            ("<-", TokenKind::SubqueryArrow),
            ("<", TokenKind::Lt),
            ("=/=>>", TokenKind::RemoteWriteAppend),
            ("=/=>", TokenKind::RemoteWrite),
            ("==>>", TokenKind::WriteAppend),
            ("==>", TokenKind::WriteTo),
            ("==", TokenKind::Eq),
            ("=", TokenKind::Assign),
            ("??!->", TokenKind::TermManyStrict),
            ("??->", TokenKind::TermMany),
            ("?!->", TokenKind::TermOneStrict),
            ("?->", TokenKind::TermOne),
            ("??", TokenKind::Nullish),
            ("?", TokenKind::Question),
            (".->", TokenKind::TermCount),
            ("...", TokenKind::Ellipsis),
            ("..", TokenKind::DotDot),
            (".", TokenKind::Dot),
            ("|<", TokenKind::PipeRead),
            ("|", TokenKind::Pipe),
            ("!~", TokenKind::NotMatch),
            ("!=", TokenKind::NotEq),
            ("!", TokenKind::Bang),
            ("++", TokenKind::Concat),
            ("+", TokenKind::Plus),
            ("-", TokenKind::Minus),
            ("~", TokenKind::Match),
            ("*", TokenKind::Star),
            ("%", TokenKind::Percent),
            (",", TokenKind::Comma),
            (":", TokenKind::Colon),
            (";", TokenKind::Semicolon),
            ("(", TokenKind::LParen),
            (")", TokenKind::RParen),
            ("[", TokenKind::LBracket),
            ("]", TokenKind::RBracket),
            ("{", TokenKind::LBrace),
            ("}", TokenKind::RBrace),
            (">=", TokenKind::Ge),
            ("/", TokenKind::Slash),
        ];

        if let Some(Mode::TagHeader { name }) = self.state.modes.last().cloned() {
            if self.starts_with("/>") {
                self.eat("/>");
                self.state.modes.pop();
                return Ok((TokenKind::TagSelfCloseEnd, Payload::None));
            }
            if self.starts_with(">") {
                self.eat(">");
                self.state.modes.pop();
                let raw = name == "style" || name == "script";
                self.state.modes.push(Mode::TagContent { name, raw });
                return Ok((TokenKind::TagHeaderEnd, Payload::None));
            }
        }

        if self.starts_with(">=") {
            self.eat(">=");
            return Ok((TokenKind::Ge, Payload::None));
        }
        if self.starts_with(">") {
            self.eat(">");
            return Ok((TokenKind::Gt, Payload::None));
        }

        for (lit, kind) in TABLE {
            if self.starts_with(lit) {
                self.eat(lit);
                return Ok((*kind, Payload::None));
            }
        }

        let (c, _) = self.rune().unwrap_or((char::REPLACEMENT_CHARACTER, 1));
        let line = self.state.line;
        let col = self.state.col;
        self.bump();
        Err(Diagnostic::parse(
            "L-ILLEGAL",
            format!("illegal character '{c}'"),
        )
        .at(line, col))
    }
}

#[cfg(test)]
mod tests;
