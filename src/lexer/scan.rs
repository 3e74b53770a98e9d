//! Markup-mode scanning. `<name …>` switches the lexer into a header mode
//! (attributes lex as ordinary tokens), then into a content mode where text
//! runs are preserved verbatim and `{…}` opens an expression island.
//! `<style>` and `<script>` bodies lex as raw text where braces are literal
//! and `@{` is the only interpolation trigger.

use crate::error::Diagnostic;

use super::{Lexer, Mode, Payload, Token, TokenKind};

impl Lexer {
    /// Does a `<` at the cursor begin a tag rather than a comparison?
    /// Requires an expression context (checked by the caller) and an
    /// identifier or `>` after the angle.
    pub(crate) fn tag_follows(&self) -> bool {
        match self.byte(1) {
            Some(b'>') => true,
            Some(b) if b.is_ascii_alphabetic() || b == b'_' => true,
            Some(_) if self.byte(1).map(|b| b >= 0x80).unwrap_or(false) => {
                // Multi-byte identifier start.
                let mut probe = Lexer {
                    src: self.src.clone(),
                    state: self.state.clone(),
                };
                probe.bump();
                probe.rune().map(|(c, _)| c.is_alphabetic()).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Consume `<name` (entering header mode) or `<>` (a self-closing empty
    /// tag).
    pub(crate) fn scan_tag_open(&mut self) -> Result<(TokenKind, Payload), Diagnostic> {
        self.bump(); // '<'
        if self.byte(0) == Some(b'>') {
            self.bump();
            return Ok((TokenKind::Tag, Payload::Str(String::new())));
        }
        let name = self.scan_tag_name();
        self.state.modes.push(Mode::TagHeader { name: name.clone() });
        Ok((TokenKind::TagStart, Payload::Str(name)))
    }

    fn scan_tag_name(&mut self) -> String {
        let start = self.state.pos;
        while let Some((c, _)) = self.rune() {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                self.bump();
            } else {
                break;
            }
        }
        self.slice(start)
    }

    /// Lex one token inside tag content.
    pub(crate) fn content_token(&mut self) -> Result<Token, Diagnostic> {
        let (name, raw) = match self.state.modes.last() {
            Some(Mode::TagContent { name, raw }) => (name.clone(), *raw),
            _ => unreachable!("content_token outside content mode"),
        };
        let start = self.state.pos;
        let line = self.state.line;
        let col = self.state.col;

        let make = |lexer: &Lexer, kind: TokenKind, payload: Payload| Token {
            kind,
            literal: lexer.slice(start),
            line,
            column: col,
            offset: start,
            blank_lines_before: 0,
            leading_comments: Vec::new(),
            trailing_comment: None,
            payload,
        };

        if self.at_end() {
            return Ok(Token::eof(line, col, start));
        }

        if raw {
            // Raw text: only `</name>` and `@{` are special.
            let close = format!("</{name}>");
            if self.starts_with(&close) {
                self.eat(&close);
                self.state.modes.pop();
                return Ok(make(self, TokenKind::TagEnd, Payload::Str(name)));
            }
            if self.starts_with("@{") {
                self.eat("@{");
                self.state.modes.push(Mode::Interp { depth: 1 });
                return Ok(make(self, TokenKind::RawInterpStart, Payload::None));
            }
            while !self.at_end() && !self.starts_with(&close) && !self.starts_with("@{") {
                self.bump();
            }
            let text = self.slice(start);
            return Ok(make(self, TokenKind::TagText, Payload::Str(text)));
        }

        // Structured content: nested tags, close tags, `{…}` islands, text.
        if self.starts_with("</") {
            self.bump_n(2);
            let end_name = self.scan_tag_name();
            if self.byte(0) == Some(b'>') {
                self.bump();
            } else {
                return Err(Diagnostic::parse(
                    "L-TAG-CLOSE",
                    format!("malformed closing tag '</{end_name}'"),
                )
                .at(line, col));
            }
            self.state.modes.pop();
            return Ok(make(self, TokenKind::TagEnd, Payload::Str(end_name)));
        }
        if self.byte(0) == Some(b'<') && self.tag_follows() {
            let (kind, payload) = self.scan_tag_open()?;
            return Ok(make(self, kind, payload));
        }
        if self.byte(0) == Some(b'{') {
            self.bump();
            self.state.modes.push(Mode::Interp { depth: 1 });
            return Ok(make(self, TokenKind::LBrace, Payload::None));
        }

        while !self.at_end() {
            match self.byte(0) {
                Some(b'<') if self.starts_with("</") || self.tag_follows() => break,
                Some(b'{') => break,
                _ => self.bump(),
            }
        }
        let text = self.slice(start);
        Ok(make(self, TokenKind::TagText, Payload::Str(text)))
    }
}
