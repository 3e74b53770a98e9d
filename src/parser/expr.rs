//! Pratt expression parsing.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Diagnostic;
use crate::lexer::{Payload, TemplatePart, TokenKind};

use super::ast::{
    DictKey, Expr, ImportPath, InfixOp, NowKind, PrefixOp, TemplateKind, TemplateSeg,
};
use super::{Parser, Prec};

fn infix_prec(kind: TokenKind) -> Option<(Prec, InfixOp)> {
    Some(match kind {
        TokenKind::Or => (Prec::OrNullish, InfixOp::Or),
        TokenKind::Nullish => (Prec::OrNullish, InfixOp::Nullish),
        TokenKind::And => (Prec::And, InfixOp::And),
        TokenKind::Eq => (Prec::Equality, InfixOp::Eq),
        TokenKind::NotEq => (Prec::Equality, InfixOp::NotEq),
        TokenKind::In => (Prec::Equality, InfixOp::In),
        TokenKind::Match => (Prec::Equality, InfixOp::Match),
        TokenKind::NotMatch => (Prec::Equality, InfixOp::NotMatch),
        TokenKind::QueryOne => (Prec::Equality, InfixOp::QueryOne),
        TokenKind::QueryMany => (Prec::Equality, InfixOp::QueryMany),
        TokenKind::ExecSql => (Prec::Equality, InfixOp::ExecSql),
        TokenKind::ShellPipe => (Prec::Equality, InfixOp::ShellPipe),
        TokenKind::Lt => (Prec::Comparison, InfixOp::Lt),
        TokenKind::Gt => (Prec::Comparison, InfixOp::Gt),
        TokenKind::Le => (Prec::Comparison, InfixOp::Le),
        TokenKind::Ge => (Prec::Comparison, InfixOp::Ge),
        TokenKind::Plus => (Prec::Additive, InfixOp::Add),
        TokenKind::Minus => (Prec::Additive, InfixOp::Sub),
        TokenKind::DotDot => (Prec::Additive, InfixOp::Range),
        TokenKind::Concat => (Prec::Concat, InfixOp::Concat),
        TokenKind::Star => (Prec::Multiplicative, InfixOp::Mul),
        TokenKind::Slash => (Prec::Multiplicative, InfixOp::Div),
        TokenKind::Percent => (Prec::Multiplicative, InfixOp::Rem),
        _ => return None,
    })
}

impl Parser {
    pub(crate) fn parse_expr(&mut self, prec: Prec) -> Result<Expr, Diagnostic> {
        let mut left = self.parse_prefix()?;
        loop {
            // Postfix forms first: `.field`, adjacent `(` and `[`.
            match self.cur.kind {
                TokenKind::Dot if prec < Prec::Call => {
                    let token = self.cur.clone();
                    self.advance()?;
                    let field = self.expect(TokenKind::Ident, "a member name")?;
                    left = Expr::Dot {
                        token,
                        target: Box::new(left),
                        field: field.text().to_string(),
                    };
                    continue;
                }
                TokenKind::LParen
                    if prec < Prec::Call && self.cur.offset == self.last_end =>
                {
                    left = self.parse_call(left)?;
                    continue;
                }
                TokenKind::LBracket
                    if prec < Prec::Index && self.cur.offset == self.last_end =>
                {
                    left = self.parse_index(left)?;
                    continue;
                }
                _ => {}
            }

            // `not in` is a two-token infix operator.
            if self.cur.kind == TokenKind::Not
                && self.peek.kind == TokenKind::In
                && prec < Prec::Equality
            {
                let token = self.cur.clone();
                self.advance()?;
                self.advance()?;
                let right = self.parse_expr(Prec::Equality)?;
                left = Expr::Infix {
                    token,
                    op: InfixOp::NotIn,
                    left: Box::new(left),
                    right: Box::new(right),
                };
                continue;
            }

            let Some((op_prec, op)) = infix_prec(self.cur.kind) else {
                break;
            };
            if prec >= op_prec {
                break;
            }
            let token = self.cur.clone();
            self.advance()?;
            let right = self.parse_expr(op_prec)?;
            left = Expr::Infix {
                token,
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_call(&mut self, callee: Expr) -> Result<Expr, Diagnostic> {
        let token = self.expect(TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        while self.cur.kind != TokenKind::RParen {
            args.push(self.parse_expr(Prec::Lowest)?);
            if self.cur.kind == TokenKind::Comma {
                self.advance()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        Ok(Expr::Call {
            token,
            callee: Box::new(callee),
            args,
        })
    }

    fn parse_index(&mut self, target: Expr) -> Result<Expr, Diagnostic> {
        let token = self.expect(TokenKind::LBracket, "'['")?;
        // Slice forms: `[..b]`, `[a..]`, `[a..b]`.
        if self.cur.kind == TokenKind::DotDot {
            self.advance()?;
            let to = if self.cur.kind == TokenKind::RBracket {
                None
            } else {
                Some(Box::new(self.parse_expr(Prec::Lowest)?))
            };
            self.expect(TokenKind::RBracket, "']'")?;
            return Ok(Expr::Slice {
                token,
                target: Box::new(target),
                from: None,
                to,
            });
        }
        let first = self.parse_expr(Prec::Lowest)?;
        if self.cur.kind == TokenKind::DotDot {
            self.advance()?;
            let to = if self.cur.kind == TokenKind::RBracket {
                None
            } else {
                Some(Box::new(self.parse_expr(Prec::Lowest)?))
            };
            self.expect(TokenKind::RBracket, "']'")?;
            return Ok(Expr::Slice {
                token,
                target: Box::new(target),
                from: Some(Box::new(first)),
                to,
            });
        }
        self.expect(TokenKind::RBracket, "']'")?;
        Ok(Expr::Index {
            token,
            target: Box::new(target),
            index: Box::new(first),
        })
    }

    fn parse_prefix(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.cur.clone();
        match token.kind {
            TokenKind::Null => {
                self.advance()?;
                Ok(Expr::Null(token))
            }
            TokenKind::True | TokenKind::False => {
                let value = token.kind == TokenKind::True;
                self.advance()?;
                Ok(Expr::Bool { token, value })
            }
            TokenKind::Int => {
                let value = match &token.payload {
                    Payload::Int(v) => *v,
                    _ => 0,
                };
                self.advance()?;
                Ok(Expr::Int { token, value })
            }
            TokenKind::Float => {
                let value = match &token.payload {
                    Payload::Float(v) => *v,
                    _ => f64::NAN,
                };
                self.advance()?;
                Ok(Expr::Float { token, value })
            }
            TokenKind::Str => {
                let value = token.text().to_string();
                self.advance()?;
                Ok(Expr::Str { token, value })
            }
            TokenKind::Template | TokenKind::RawTemplate => {
                let parts = self.compile_template_payload(&token)?;
                self.advance()?;
                Ok(Expr::Template {
                    token,
                    kind: TemplateKind::String,
                    parts,
                })
            }
            TokenKind::PathTemplate | TokenKind::UrlTemplate | TokenKind::DatetimeTemplate => {
                let kind = match token.kind {
                    TokenKind::PathTemplate => TemplateKind::Path,
                    TokenKind::UrlTemplate => TemplateKind::Url,
                    _ => TemplateKind::Datetime,
                };
                let parts = self.compile_template_payload(&token)?;
                self.advance()?;
                Ok(Expr::Template { token, kind, parts })
            }
            TokenKind::Regex => {
                let (pattern, flags) = match &token.payload {
                    Payload::Regex { pattern, flags } => (pattern.clone(), flags.clone()),
                    _ => (String::new(), String::new()),
                };
                self.advance()?;
                Ok(Expr::Regex {
                    token,
                    pattern,
                    flags,
                })
            }
            TokenKind::Money => {
                let (currency, minor, scale) = match &token.payload {
                    Payload::Money {
                        currency,
                        minor,
                        scale,
                    } => (*currency, *minor, *scale),
                    _ => ("USD", 0, 2),
                };
                self.advance()?;
                Ok(Expr::Money {
                    token,
                    currency,
                    minor,
                    scale,
                })
            }
            TokenKind::Datetime => {
                let value = match &token.payload {
                    Payload::Datetime(dt) => *dt,
                    _ => chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
                };
                self.advance()?;
                Ok(Expr::Datetime { token, value })
            }
            TokenKind::Date => {
                let value = match &token.payload {
                    Payload::Date(d) => *d,
                    _ => chrono::NaiveDate::default(),
                };
                self.advance()?;
                Ok(Expr::Date { token, value })
            }
            TokenKind::Time => {
                let value = match &token.payload {
                    Payload::Time(t) => *t,
                    _ => chrono::NaiveTime::default(),
                };
                self.advance()?;
                Ok(Expr::Time { token, value })
            }
            TokenKind::Duration => {
                let (months, secs) = match &token.payload {
                    Payload::Duration { months, secs } => (*months, *secs),
                    _ => (0, 0),
                };
                self.advance()?;
                Ok(Expr::Duration {
                    token,
                    months,
                    secs,
                })
            }
            TokenKind::Now => {
                let kind = match token.text() {
                    "timeNow" => NowKind::TimeNow,
                    "dateNow" => NowKind::DateNow,
                    "today" => NowKind::Today,
                    _ => NowKind::Now,
                };
                self.advance()?;
                Ok(Expr::Now { token, kind })
            }
            TokenKind::PathLit => {
                let text = token.text().to_string();
                self.advance()?;
                Ok(Expr::PathLit { token, text })
            }
            TokenKind::UrlLit => {
                let text = token.text().to_string();
                self.advance()?;
                Ok(Expr::UrlLit { token, text })
            }
            TokenKind::StdlibPath => {
                let text = token.text().to_string();
                self.advance()?;
                Ok(Expr::StdlibPath { token, text })
            }
            TokenKind::Connection => {
                let kind = token.text().to_string();
                self.advance()?;
                let mut args = Vec::new();
                if self.cur.kind == TokenKind::LParen && self.cur.offset == self.last_end {
                    self.advance()?;
                    while self.cur.kind != TokenKind::RParen {
                        args.push(self.parse_expr(Prec::Lowest)?);
                        if self.cur.kind == TokenKind::Comma {
                            self.advance()?;
                        } else {
                            break;
                        }
                    }
                    self.expect(TokenKind::RParen, "')'")?;
                }
                Ok(Expr::Connection { token, kind, args })
            }
            TokenKind::EnvRoot => {
                let which = token.text().to_string();
                self.advance()?;
                Ok(Expr::EnvRoot { token, which })
            }
            TokenKind::Ident => {
                let name = token.text().to_string();
                self.advance()?;
                Ok(Expr::Ident { token, name })
            }
            TokenKind::Minus => {
                self.advance()?;
                let operand = self.parse_expr(Prec::Prefix)?;
                Ok(Expr::Prefix {
                    token,
                    op: PrefixOp::Neg,
                    operand: Box::new(operand),
                })
            }
            TokenKind::Not | TokenKind::Bang => {
                self.advance()?;
                let operand = self.parse_expr(Prec::Prefix)?;
                Ok(Expr::Prefix {
                    token,
                    op: PrefixOp::Not,
                    operand: Box::new(operand),
                })
            }
            TokenKind::LParen => {
                self.advance()?;
                let inner = self.parse_expr(Prec::Lowest)?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(Expr::Grouped {
                    token,
                    inner: Box::new(inner),
                })
            }
            TokenKind::LBracket => {
                self.advance()?;
                let mut items = Vec::new();
                while self.cur.kind != TokenKind::RBracket {
                    items.push(self.parse_expr(Prec::Lowest)?);
                    if self.cur.kind == TokenKind::Comma {
                        self.advance()?;
                    } else {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket, "']'")?;
                Ok(Expr::Array { token, items })
            }
            TokenKind::LBrace => self.parse_dict(),
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::Try => self.parse_try(),
            TokenKind::Import => self.parse_import(),
            TokenKind::Fn => self.parse_function(),
            TokenKind::TagStart | TokenKind::Tag => self.parse_tag(),
            TokenKind::QueryKw => self.parse_query_expr(),
            TokenKind::InsertKw => self.parse_insert_expr(),
            TokenKind::UpdateKw => self.parse_update_expr(),
            TokenKind::DeleteKw => self.parse_delete_expr(),
            TokenKind::TransactionKw => self.parse_transaction_expr(),
            TokenKind::SchemaKw => self.parse_schema_expr(),
            TokenKind::TableKw => self.parse_table_ref(),
            _ => Err(self.unexpected("an expression")),
        }
    }

    fn parse_dict(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.expect(TokenKind::LBrace, "'{'")?;
        let mut entries = Vec::new();
        while self.cur.kind != TokenKind::RBrace {
            let key = match self.cur.kind {
                TokenKind::Ident => DictKey::Ident(self.cur.text().to_string()),
                TokenKind::Str => DictKey::Str(self.cur.text().to_string()),
                _ => return Err(self.unexpected("a dictionary key")),
            };
            let key_token = self.cur.clone();
            self.advance()?;
            let value = if self.cur.kind == TokenKind::Colon {
                self.advance()?;
                self.parse_expr(Prec::Lowest)?
            } else {
                // Shorthand `{name}` binds the identifier's value.
                match &key {
                    DictKey::Ident(name) => Expr::Ident {
                        token: key_token,
                        name: name.clone(),
                    },
                    DictKey::Str(_) => return Err(self.unexpected("':'")),
                }
            };
            entries.push((key, value));
            if self.cur.kind == TokenKind::Comma {
                self.advance()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(Expr::Dict { token, entries })
    }

    fn parse_if(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.expect(TokenKind::If, "'if'")?;
        let cond = self.parse_expr(Prec::Lowest)?;
        let then = self.parse_block()?;
        let mut elifs = Vec::new();
        let mut alternative = None;
        while self.cur.kind == TokenKind::Else {
            self.advance()?;
            if self.cur.kind == TokenKind::If {
                self.advance()?;
                let elif_cond = self.parse_expr(Prec::Lowest)?;
                let elif_block = self.parse_block()?;
                elifs.push((elif_cond, elif_block));
            } else {
                alternative = Some(self.parse_block()?);
                break;
            }
        }
        Ok(Expr::If {
            token,
            cond: Box::new(cond),
            then,
            elifs,
            alternative,
        })
    }

    fn parse_for(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.expect(TokenKind::For, "'for'")?;
        let mut bindings = Vec::new();
        let first = self.expect(TokenKind::Ident, "a loop binding")?;
        bindings.push(first.text().to_string());
        if self.cur.kind == TokenKind::Comma {
            self.advance()?;
            let second = self.expect(TokenKind::Ident, "a loop binding")?;
            bindings.push(second.text().to_string());
        }
        self.expect(TokenKind::In, "'in'")?;
        let iterable = self.parse_expr(Prec::Lowest)?;
        let body = self.parse_block()?;
        Ok(Expr::For {
            token,
            bindings,
            iterable: Box::new(iterable),
            body,
        })
    }

    fn parse_try(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.expect(TokenKind::Try, "'try'")?;
        let call = self.parse_expr(Prec::OrNullish)?;
        if !call.is_call() {
            return Err(Diagnostic::parse(
                "P-TRY-NOT-CALL",
                "`try` wraps only function or method calls",
            )
            .at(token.line, token.column)
            .with_hint("write `try f(…)` or `try value.method(…)`"));
        }
        Ok(Expr::Try {
            token,
            call: Box::new(call),
        })
    }

    fn parse_import(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.expect(TokenKind::Import, "'import'")?;
        let path = match self.cur.kind {
            TokenKind::PathLit | TokenKind::StdlibPath => {
                let text = self.cur.text().to_string();
                self.advance()?;
                ImportPath::Static(text)
            }
            TokenKind::PathTemplate => {
                let template_token = self.cur.clone();
                let parts = self.compile_template_payload(&template_token)?;
                self.advance()?;
                ImportPath::Dynamic(parts)
            }
            TokenKind::Str => {
                let text = self.cur.text().to_string();
                self.advance()?;
                ImportPath::Static(text)
            }
            _ => return Err(self.unexpected("a module path")),
        };
        let alias = if self.cur.kind == TokenKind::As {
            self.advance()?;
            let ident = self.expect(TokenKind::Ident, "an alias name")?;
            Some(ident.text().to_string())
        } else {
            None
        };
        Ok(Expr::Import { token, path, alias })
    }

    fn parse_function(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.expect(TokenKind::Fn, "'fn'")?;
        let name = if self.cur.kind == TokenKind::Ident {
            let n = self.cur.text().to_string();
            self.advance()?;
            Some(n)
        } else {
            None
        };
        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        let mut rest = None;
        while self.cur.kind != TokenKind::RParen {
            if self.cur.kind == TokenKind::Ellipsis {
                self.advance()?;
                let ident = self.expect(TokenKind::Ident, "a rest parameter name")?;
                rest = Some(ident.text().to_string());
                break;
            }
            let ident = self.expect(TokenKind::Ident, "a parameter name")?;
            params.push(ident.text().to_string());
            if self.cur.kind == TokenKind::Comma {
                self.advance()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        let body = self.parse_block()?;
        Ok(Expr::Function {
            token,
            name,
            params,
            rest,
            body: Arc::new(body),
        })
    }

    /// Compile a lexer template payload into AST segments, parsing each
    /// interpolation in place.
    pub(crate) fn compile_template_payload(
        &self,
        token: &crate::lexer::Token,
    ) -> Result<Vec<TemplateSeg>, Diagnostic> {
        let parts = match &token.payload {
            Payload::Template(parts) => parts.clone(),
            Payload::Str(s) => vec![TemplatePart::Text(s.clone())],
            _ => Vec::new(),
        };
        parts
            .into_iter()
            .map(|part| match part {
                TemplatePart::Text(t) => Ok(TemplateSeg::Text(t)),
                TemplatePart::Expr { src, line, column } => {
                    let expr = parse_embedded_expr(&src, line, column)?;
                    Ok(TemplateSeg::Expr(Box::new(expr)))
                }
            })
            .collect()
    }
}

/// Parse an expression embedded in a literal (template interpolation). The
/// diagnostic location is shifted so errors point into the enclosing file.
pub(crate) fn parse_embedded_expr(
    src: &str,
    line: u32,
    column: u32,
) -> Result<Expr, Diagnostic> {
    let shift = |mut d: Diagnostic| {
        if d.line <= 1 {
            d.column += column.saturating_sub(1);
        }
        d.line += line.saturating_sub(1);
        d
    };
    let mut parser = Parser::new(src, PathBuf::from(crate::source::SYNTHETIC_INPUT))
        .map_err(|d| shift(d))?;
    let expr = parser.parse_expr(Prec::Lowest).map_err(|d| shift(d))?;
    if parser.cur.kind != TokenKind::Eof {
        return Err(shift(parser.unexpected("end of interpolation")));
    }
    Ok(expr)
}
