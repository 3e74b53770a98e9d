//! Tag expression parsing.
//!
//! `<Name attr={expr}>…</Name>` produces a [`TagPair`]; `<Name …/>` and
//! `<>` produce a [`TagLiteral`]. Contents are statements and expressions,
//! not raw text, except inside `<style>`/`<script>` where the lexer hands
//! us verbatim text plus `@{…}` islands.

use crate::error::Diagnostic;
use crate::lexer::TokenKind;

use super::ast::{Block, Expr, TagAttr, TagChild};
use super::{Parser, Prec};

/// HTML elements that never carry content and must be written
/// self-closing.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

pub(crate) fn is_void_element(name: &str) -> bool {
    VOID_ELEMENTS.contains(&name)
}

impl Parser {
    pub(crate) fn parse_tag(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.cur.clone();
        if token.kind == TokenKind::Tag {
            // `<>` is an empty self-closing tag.
            self.advance()?;
            return Ok(Expr::TagLiteral {
                token,
                name: String::new(),
                attrs: Vec::new(),
            });
        }
        let name = token.text().to_string();
        self.advance()?;

        let mut attrs = Vec::new();
        loop {
            match self.cur.kind {
                TokenKind::TagSelfCloseEnd => {
                    self.advance()?;
                    return Ok(Expr::TagLiteral { token, name, attrs });
                }
                TokenKind::TagHeaderEnd => {
                    if is_void_element(&name) {
                        return Err(Diagnostic::parse(
                            "P-VOID-TAG",
                            format!("<{name}> is a void element and must be self-closing"),
                        )
                        .at(self.cur.line, self.cur.column)
                        .with_hint(format!("write <{name} …/>")));
                    }
                    self.advance()?;
                    break;
                }
                TokenKind::Ident => attrs.push(self.parse_tag_attr()?),
                _ => return Err(self.unexpected("an attribute, '>', or '/>'")),
            }
        }

        let mut children = Vec::new();
        loop {
            match self.cur.kind {
                TokenKind::TagEnd => {
                    let end_name = self.cur.text().to_string();
                    if end_name != name {
                        return Err(Diagnostic::parse(
                            "P-TAG-MISMATCH",
                            format!("mismatched closing tag </{end_name}>, expected </{name}>"),
                        )
                        .at(self.cur.line, self.cur.column));
                    }
                    self.advance()?;
                    break;
                }
                TokenKind::TagText => {
                    children.push(TagChild::Text(self.cur.text().to_string()));
                    self.advance()?;
                }
                TokenKind::TagStart | TokenKind::Tag => {
                    children.push(TagChild::Tag(self.parse_tag()?));
                }
                TokenKind::LBrace => {
                    self.advance()?;
                    let mut statements = Vec::new();
                    while self.cur.kind != TokenKind::RBrace
                        && self.cur.kind != TokenKind::Eof
                    {
                        statements.push(self.parse_statement()?);
                        while self.cur.kind == TokenKind::Semicolon {
                            self.advance()?;
                        }
                    }
                    self.expect(TokenKind::RBrace, "'}'")?;
                    children.push(TagChild::Interp(Block { statements }));
                }
                TokenKind::RawInterpStart => {
                    self.advance()?;
                    let expr = self.parse_expr(Prec::Lowest)?;
                    self.expect(TokenKind::RBrace, "'}'")?;
                    children.push(TagChild::RawInterp(Box::new(expr)));
                }
                TokenKind::Eof => {
                    return Err(Diagnostic::parse(
                        "P-TAG-UNTERMINATED",
                        format!("<{name}> is never closed"),
                    )
                    .at(token.line, token.column));
                }
                _ => return Err(self.unexpected(&format!("content or </{name}>"))),
            }
        }

        Ok(Expr::TagPair {
            token,
            name,
            attrs,
            children,
        })
    }

    fn parse_tag_attr(&mut self) -> Result<TagAttr, Diagnostic> {
        let name_token = self.expect(TokenKind::Ident, "an attribute name")?;
        let name = name_token.text().to_string();
        if self.cur.kind != TokenKind::Assign {
            // Bare attribute (`<input disabled/>`).
            return Ok(TagAttr { name, value: None });
        }
        self.advance()?;
        let value = match self.cur.kind {
            TokenKind::LBrace => {
                self.advance()?;
                let expr = self.parse_expr(Prec::Lowest)?;
                self.expect(TokenKind::RBrace, "'}'")?;
                expr
            }
            _ => self.parse_expr(Prec::Prefix)?,
        };
        Ok(TagAttr {
            name,
            value: Some(value),
        })
    }
}
