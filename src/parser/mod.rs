//! The Parsley parser.
//!
//! A Pratt parser over the modal lexer. Statement-vs-expression decisions
//! are made from the leading token; the one genuinely ambiguous prefix (an
//! identifier or brace that may begin either an assignment or an
//! expression) is resolved by saving the complete lexer+parser state,
//! attempting the assignment path, and restoring on failure.
//!
//! Only the first parse error is reported; everything after it is usually
//! cascade noise.

pub mod ast;
mod expr;
#[cfg(test)]
pub(crate) mod print;
mod query;
mod tags;

use std::path::PathBuf;

use crate::error::Diagnostic;
use crate::lexer::{Lexer, Snapshot, Token, TokenKind};

use ast::{Block, Pattern, Program, ReadOp, ReadStmt, Stmt, WriteOp, WriteStmt};

/// Precedence levels, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Prec {
    Lowest,
    OrNullish,
    And,
    Equality,
    Comparison,
    Additive,
    Concat,
    Multiplicative,
    Prefix,
    Index,
    Call,
}

/// Known keyword typos, converted into hint-bearing errors when an
/// identifier shows up where a keyword or statement was expected.
const TYPO_HINTS: &[(&str, &str)] = &[
    ("expoert", "export"),
    ("exprot", "export"),
    ("lte", "let"),
    ("elt", "let"),
    ("func", "fn"),
    ("function", "fn"),
    ("nil", "null"),
    ("none", "null"),
    ("retrun", "return"),
    ("improt", "import"),
    ("elseif", "else if"),
    ("elif", "else if"),
    ("ture", "true"),
    ("flase", "false"),
];

pub(crate) struct ParserSnapshot {
    lexer: Snapshot,
    cur: Token,
    peek: Token,
    last_end: usize,
}

pub struct Parser {
    lexer: Lexer,
    source: PathBuf,
    pub(crate) cur: Token,
    pub(crate) peek: Token,
    /// Byte offset just past the previously consumed token; postfix `(` and
    /// `[` bind only when adjacent to it.
    pub(crate) last_end: usize,
}

impl Parser {
    pub fn new(source_text: &str, source: PathBuf) -> Result<Parser, Diagnostic> {
        let mut lexer = Lexer::new(source_text);
        let cur = lexer.next_token()?;
        let peek = lexer.next_token()?;
        Ok(Parser {
            lexer,
            source,
            cur,
            peek,
            last_end: 0,
        })
    }

    /// Parse a complete program.
    pub fn parse_program(source_text: &str, source: PathBuf) -> Result<Program, Diagnostic> {
        let mut parser = Parser::new(source_text, source.clone())?;
        let mut statements = Vec::new();
        while parser.cur.kind != TokenKind::Eof {
            statements.push(parser.parse_statement()?);
            parser.eat_semicolons()?;
        }
        Ok(Program { source, statements })
    }

    // -- token plumbing -----------------------------------------------------

    pub(crate) fn advance(&mut self) -> Result<(), Diagnostic> {
        self.last_end = self.cur.offset + self.cur.literal.len();
        self.cur = std::mem::replace(&mut self.peek, self.lexer.next_token()?);
        Ok(())
    }

    pub(crate) fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, Diagnostic> {
        if self.cur.kind == kind {
            let token = self.cur.clone();
            self.advance()?;
            Ok(token)
        } else {
            Err(self.unexpected(what))
        }
    }

    pub(crate) fn unexpected(&self, what: &str) -> Diagnostic {
        let found = if self.cur.kind == TokenKind::Eof {
            "end of file".to_string()
        } else {
            format!("'{}'", self.cur.literal)
        };
        let mut diag = Diagnostic::parse(
            "P-UNEXPECTED",
            format!("expected {what}, found {found}"),
        )
        .at(self.cur.line, self.cur.column);
        if self.cur.kind == TokenKind::Ident {
            let text = self.cur.text();
            if let Some((_, fix)) = TYPO_HINTS.iter().find(|(typo, _)| *typo == text) {
                diag = diag.with_hint(format!("did you mean '{fix}'?"));
            }
        }
        diag
    }

    pub(crate) fn save(&self) -> ParserSnapshot {
        ParserSnapshot {
            lexer: self.lexer.save(),
            cur: self.cur.clone(),
            peek: self.peek.clone(),
            last_end: self.last_end,
        }
    }

    pub(crate) fn restore(&mut self, snapshot: ParserSnapshot) {
        self.lexer.restore(snapshot.lexer);
        self.cur = snapshot.cur;
        self.peek = snapshot.peek;
        self.last_end = snapshot.last_end;
    }

    fn eat_semicolons(&mut self) -> Result<(), Diagnostic> {
        while self.cur.kind == TokenKind::Semicolon {
            self.advance()?;
        }
        Ok(())
    }

    /// True when the cursor cannot start an expression (used by bare
    /// `return`).
    fn at_statement_end(&self) -> bool {
        matches!(
            self.cur.kind,
            TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof
        )
    }

    // -- statements ---------------------------------------------------------

    pub(crate) fn parse_statement(&mut self) -> Result<Stmt, Diagnostic> {
        match self.cur.kind {
            TokenKind::Let => self.parse_let(),
            TokenKind::Export => self.parse_export(),
            TokenKind::Return => {
                let token = self.cur.clone();
                self.advance()?;
                let value = if self.at_statement_end() {
                    None
                } else {
                    Some(self.parse_expr(Prec::Lowest)?)
                };
                Ok(Stmt::Return { token, value })
            }
            TokenKind::Check => {
                let token = self.cur.clone();
                self.advance()?;
                let cond = self.parse_expr(Prec::Lowest)?;
                Ok(Stmt::Check { token, cond })
            }
            TokenKind::Stop => {
                let token = self.cur.clone();
                self.advance()?;
                let cond = self.parse_guard()?;
                Ok(Stmt::Stop { token, cond })
            }
            TokenKind::Skip => {
                let token = self.cur.clone();
                self.advance()?;
                let cond = self.parse_guard()?;
                Ok(Stmt::Skip { token, cond })
            }
            TokenKind::Ident | TokenKind::LBracket => {
                // Could be `x = …`, `x, y = …`, `[a] = …`, a reader
                // statement, or a plain expression.
                let snapshot = self.save();
                match self.try_parse_binding_statement() {
                    Ok(Some(stmt)) => Ok(stmt),
                    Ok(None) | Err(_) => {
                        self.restore(snapshot);
                        self.parse_expression_statement()
                    }
                }
            }
            TokenKind::LBrace => {
                // `{a, b} = …` destructuring, a dictionary literal, or a
                // bare block.
                let snapshot = self.save();
                match self.try_parse_binding_statement() {
                    Ok(Some(stmt)) => return Ok(stmt),
                    Ok(None) | Err(_) => self.restore(snapshot),
                }
                let snapshot = self.save();
                match self.parse_expression_statement() {
                    Ok(stmt) => Ok(stmt),
                    Err(_) => {
                        self.restore(snapshot);
                        let token = self.cur.clone();
                        let block = self.parse_block()?;
                        Ok(Stmt::Block { token, block })
                    }
                }
            }
            _ => self.parse_expression_statement(),
        }
    }

    /// `stop if cond` / `skip if cond` guards.
    fn parse_guard(&mut self) -> Result<Option<ast::Expr>, Diagnostic> {
        if self.cur.kind == TokenKind::If {
            self.advance()?;
            Ok(Some(self.parse_expr(Prec::Lowest)?))
        } else {
            Ok(None)
        }
    }

    fn parse_let(&mut self) -> Result<Stmt, Diagnostic> {
        let token = self.expect(TokenKind::Let, "'let'")?;
        let pattern = self.parse_pattern()?;
        if self.cur.kind == TokenKind::Eq {
            return Err(Diagnostic::parse(
                "P-DOUBLE-EQ",
                "expected '=', found '=='",
            )
            .at(self.cur.line, self.cur.column)
            .with_hint("did you mean '='?"));
        }
        self.expect(TokenKind::Assign, "'='")?;
        let value = self.parse_expr(Prec::Lowest)?;
        Ok(Stmt::Let {
            token,
            pattern,
            value,
        })
    }

    fn parse_export(&mut self) -> Result<Stmt, Diagnostic> {
        let token = self.expect(TokenKind::Export, "'export'")?;
        if self.cur.kind == TokenKind::Let {
            let decl = self.parse_let()?;
            let names = match &decl {
                Stmt::Let { pattern, .. } => pattern_names(pattern),
                _ => Vec::new(),
            };
            return Ok(Stmt::Export {
                token,
                names,
                decl: Some(Box::new(decl)),
            });
        }
        if self.cur.kind == TokenKind::Fn {
            // `export fn name(…) { … }` declares and exports a function.
            let expr = self.parse_expr(Prec::Lowest)?;
            let name = match &expr {
                ast::Expr::Function { name: Some(n), .. } => n.clone(),
                _ => {
                    return Err(Diagnostic::parse(
                        "P-EXPORT-ANON",
                        "exported functions require a name",
                    )
                    .at(token.line, token.column));
                }
            };
            let let_stmt = Stmt::Let {
                token: token.clone(),
                pattern: Pattern::Name(name.clone()),
                value: expr,
            };
            return Ok(Stmt::Export {
                token,
                names: vec![name],
                decl: Some(Box::new(let_stmt)),
            });
        }
        let mut names = Vec::new();
        loop {
            let ident = self.expect(TokenKind::Ident, "an exported name")?;
            names.push(ident.text().to_string());
            if self.cur.kind == TokenKind::Comma {
                self.advance()?;
            } else {
                break;
            }
        }
        Ok(Stmt::Export {
            token,
            names,
            decl: None,
        })
    }

    /// Attempt the binding-statement path: one or more patterns followed by
    /// `=` or a reader operator. Returns `Ok(None)` if the lookahead does
    /// not commit to a binding.
    fn try_parse_binding_statement(&mut self) -> Result<Option<Stmt>, Diagnostic> {
        let token = self.cur.clone();
        let mut targets = vec![self.parse_pattern()?];
        while self.cur.kind == TokenKind::Comma {
            self.advance()?;
            targets.push(self.parse_pattern()?);
        }
        let op = self.cur.kind;
        match op {
            TokenKind::Assign => {
                self.advance()?;
                let value = self.parse_expr(Prec::Lowest)?;
                Ok(Some(Stmt::Assign {
                    token,
                    targets,
                    value,
                }))
            }
            TokenKind::ReadFrom
            | TokenKind::FetchFrom
            | TokenKind::PipeRead
            | TokenKind::QueryOne
            | TokenKind::QueryMany
            | TokenKind::ExecSql => {
                if targets.len() != 1 {
                    return Err(Diagnostic::parse(
                        "P-READ-TARGETS",
                        "reader operators take a single binding target",
                    )
                    .at(self.cur.line, self.cur.column));
                }
                self.advance()?;
                let source = self.parse_expr(Prec::Comparison)?;
                let read_op = match op {
                    TokenKind::ReadFrom => ReadOp::Read,
                    TokenKind::FetchFrom => ReadOp::Fetch,
                    TokenKind::PipeRead => ReadOp::PipeRead,
                    TokenKind::QueryOne => ReadOp::QueryOne,
                    TokenKind::QueryMany => ReadOp::QueryMany,
                    _ => ReadOp::Exec,
                };
                // Database forms accept a detached `[…]` parameter array.
                let params = if matches!(
                    read_op,
                    ReadOp::QueryOne | ReadOp::QueryMany | ReadOp::Exec
                ) && self.cur.kind == TokenKind::LBracket
                {
                    Some(self.parse_expr(Prec::Prefix)?)
                } else {
                    None
                };
                Ok(Some(Stmt::Read(ReadStmt {
                    token,
                    op: read_op,
                    target: targets.into_iter().next().expect("one target"),
                    source,
                    params,
                })))
            }
            _ => Ok(None),
        }
    }

    fn parse_expression_statement(&mut self) -> Result<Stmt, Diagnostic> {
        let token = self.cur.clone();
        let expr = self.parse_expr(Prec::Lowest)?;

        // Writer statements: `value ==> target` and friends.
        let write_op = match self.cur.kind {
            TokenKind::WriteTo => Some(WriteOp::Write),
            TokenKind::WriteAppend => Some(WriteOp::Append),
            TokenKind::RemoteWrite => Some(WriteOp::RemoteWrite),
            TokenKind::RemoteWriteAppend => Some(WriteOp::RemoteAppend),
            _ => None,
        };
        if let Some(op) = write_op {
            self.advance()?;
            let target = self.parse_expr(Prec::Lowest)?;
            return Ok(Stmt::Write(WriteStmt {
                token,
                op,
                value: expr,
                target,
            }));
        }

        // Index / member assignment: `xs[0] = v`, `obj.field = v`.
        if self.cur.kind == TokenKind::Assign {
            match expr {
                ast::Expr::Index {
                    token: ix_token,
                    target,
                    index,
                } => {
                    self.advance()?;
                    let value = self.parse_expr(Prec::Lowest)?;
                    return Ok(Stmt::IndexAssign {
                        token: ix_token,
                        target: *target,
                        index: *index,
                        value,
                    });
                }
                ast::Expr::Dot {
                    token: dot_token,
                    target,
                    field,
                } => {
                    self.advance()?;
                    let value = self.parse_expr(Prec::Lowest)?;
                    let index = ast::Expr::Str {
                        token: dot_token.clone(),
                        value: field,
                    };
                    return Ok(Stmt::IndexAssign {
                        token: dot_token,
                        target: *target,
                        index,
                        value,
                    });
                }
                _ => {
                    return Err(Diagnostic::parse(
                        "P-BAD-ASSIGN-TARGET",
                        "this expression cannot be assigned to",
                    )
                    .at(self.cur.line, self.cur.column));
                }
            }
        }

        Ok(Stmt::Expr { token, expr })
    }

    // -- patterns -----------------------------------------------------------

    pub(crate) fn parse_pattern(&mut self) -> Result<Pattern, Diagnostic> {
        match self.cur.kind {
            TokenKind::Ident => {
                let name = self.cur.text().to_string();
                self.advance()?;
                Ok(Pattern::Name(name))
            }
            TokenKind::LBrace => self.parse_dict_pattern(),
            TokenKind::LBracket => self.parse_array_pattern(),
            _ => Err(self.unexpected("a binding pattern")),
        }
    }

    fn parse_dict_pattern(&mut self) -> Result<Pattern, Diagnostic> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut entries = Vec::new();
        let mut rest = None;
        while self.cur.kind != TokenKind::RBrace {
            if self.cur.kind == TokenKind::Ellipsis {
                self.advance()?;
                let ident = self.expect(TokenKind::Ident, "a rest binding name")?;
                rest = Some(ident.text().to_string());
                break;
            }
            let key_token = self.expect(TokenKind::Ident, "a dictionary key")?;
            let key = key_token.text().to_string();
            let mut alias = None;
            let mut nested = None;
            if self.cur.kind == TokenKind::As {
                self.advance()?;
                let ident = self.expect(TokenKind::Ident, "an alias name")?;
                alias = Some(ident.text().to_string());
            } else if self.cur.kind == TokenKind::Colon {
                self.advance()?;
                match self.cur.kind {
                    TokenKind::LBrace => nested = Some(self.parse_dict_pattern()?),
                    TokenKind::LBracket => {
                        return Err(Diagnostic::parse(
                            "P-ARRAY-IN-DICT-PATTERN",
                            "array patterns cannot nest inside dictionary patterns",
                        )
                        .at(self.cur.line, self.cur.column));
                    }
                    TokenKind::Ident => {
                        let ident = self.expect(TokenKind::Ident, "a binding name")?;
                        alias = Some(ident.text().to_string());
                    }
                    _ => return Err(self.unexpected("a nested pattern")),
                }
            }
            entries.push(ast::DictPatternEntry { key, alias, nested });
            if self.cur.kind == TokenKind::Comma {
                self.advance()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(Pattern::Dict { entries, rest })
    }

    fn parse_array_pattern(&mut self) -> Result<Pattern, Diagnostic> {
        self.expect(TokenKind::LBracket, "'['")?;
        let mut items = Vec::new();
        let mut rest = None;
        while self.cur.kind != TokenKind::RBracket {
            if self.cur.kind == TokenKind::Ellipsis {
                self.advance()?;
                let ident = self.expect(TokenKind::Ident, "a rest binding name")?;
                rest = Some(ident.text().to_string());
                break;
            }
            items.push(self.parse_pattern()?);
            if self.cur.kind == TokenKind::Comma {
                self.advance()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBracket, "']'")?;
        Ok(Pattern::Array { items, rest })
    }

    pub(crate) fn parse_block(&mut self) -> Result<Block, Diagnostic> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut statements = Vec::new();
        while self.cur.kind != TokenKind::RBrace && self.cur.kind != TokenKind::Eof {
            statements.push(self.parse_statement()?);
            self.eat_semicolons()?;
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(Block { statements })
    }
}

/// The names a pattern binds, in declaration order.
pub fn pattern_names(pattern: &Pattern) -> Vec<String> {
    let mut names = Vec::new();
    collect_pattern_names(pattern, &mut names);
    names
}

fn collect_pattern_names(pattern: &Pattern, out: &mut Vec<String>) {
    match pattern {
        Pattern::Name(n) => out.push(n.clone()),
        Pattern::Dict { entries, rest } => {
            for e in entries {
                if let Some(nested) = &e.nested {
                    collect_pattern_names(nested, out);
                } else {
                    out.push(e.alias.clone().unwrap_or_else(|| e.key.clone()));
                }
            }
            if let Some(r) = rest {
                out.push(r.clone());
            }
        }
        Pattern::Array { items, rest } => {
            for item in items {
                collect_pattern_names(item, out);
            }
            if let Some(r) = rest {
                out.push(r.clone());
            }
        }
    }
}
