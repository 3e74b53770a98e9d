//! Query DSL parsing.
//!
//! `@query(Source [as alias] (| condition | modifier | computed)*
//! (+ by fields)? terminal)`. CTEs are written as multiple source blocks
//! separated by `;`, the last block being the main query. Subqueries inside
//! conditions are introduced by `<-Source(…)`.

use crate::error::Diagnostic;
use crate::lexer::TokenKind;

use super::ast::{
    Block, CmpOp, Cond, CondValue, DeleteExpr, Expr, InsertExpr, QueryBlock, QueryExpr,
    QueryPipe, QueryTerminal, SchemaExpr, SubqueryExpr, TransactionExpr, UpdateExpr,
};
use super::{Parser, Prec};

impl Parser {
    pub(crate) fn parse_query_expr(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.expect(TokenKind::QueryKw, "'@query'")?;
        self.expect(TokenKind::LParen, "'('")?;
        let mut blocks = vec![self.parse_query_block()?];
        while self.cur.kind == TokenKind::Semicolon {
            self.advance()?;
            blocks.push(self.parse_query_block()?);
        }
        let terminal = self.parse_terminal()?;
        self.expect(TokenKind::RParen, "')'")?;
        Ok(Expr::Query(QueryExpr {
            token,
            blocks,
            terminal,
        }))
    }

    fn parse_query_block(&mut self) -> Result<QueryBlock, Diagnostic> {
        let source_token = self.expect(TokenKind::Ident, "a query source")?;
        let source = source_token.text().to_string();
        let alias = if self.cur.kind == TokenKind::As {
            self.advance()?;
            let ident = self.expect(TokenKind::Ident, "an alias")?;
            Some(ident.text().to_string())
        } else {
            None
        };
        let mut pipes = Vec::new();
        while self.cur.kind == TokenKind::Pipe {
            self.advance()?;
            pipes.push(self.parse_pipe_body()?);
        }
        // `+ by field, field` group clause.
        let mut group_by = Vec::new();
        if self.cur.kind == TokenKind::Plus && self.peek.kind == TokenKind::By {
            self.advance()?;
            self.advance()?;
            loop {
                let field = self.expect(TokenKind::Ident, "a grouping field")?;
                group_by.push(field.text().to_string());
                if self.cur.kind == TokenKind::Comma {
                    self.advance()?;
                } else {
                    break;
                }
            }
        }
        Ok(QueryBlock {
            source,
            alias,
            pipes,
            group_by,
        })
    }

    fn parse_pipe_body(&mut self) -> Result<QueryPipe, Diagnostic> {
        // Modifiers and computed columns are identifier-led; disambiguate
        // by the identifier text and the following token.
        if self.cur.kind == TokenKind::Ident {
            let word = self.cur.text().to_string();
            match word.as_str() {
                "sort" => {
                    self.advance()?;
                    let mut fields = Vec::new();
                    loop {
                        let field = self.expect(TokenKind::Ident, "a sort field")?;
                        let mut desc = false;
                        if self.cur.kind == TokenKind::Ident
                            && matches!(self.cur.text(), "asc" | "desc")
                        {
                            desc = self.cur.text() == "desc";
                            self.advance()?;
                        }
                        fields.push((field.text().to_string(), desc));
                        if self.cur.kind == TokenKind::Comma {
                            self.advance()?;
                        } else {
                            break;
                        }
                    }
                    return Ok(QueryPipe::Sort { fields });
                }
                "limit" => {
                    self.advance()?;
                    return Ok(QueryPipe::Limit(self.parse_pipe_value()?));
                }
                "offset" => {
                    self.advance()?;
                    return Ok(QueryPipe::Offset(self.parse_pipe_value()?));
                }
                "select" => {
                    self.advance()?;
                    let mut fields = Vec::new();
                    loop {
                        let field = self.expect(TokenKind::Ident, "a selected column")?;
                        fields.push(field.text().to_string());
                        if self.cur.kind == TokenKind::Comma {
                            self.advance()?;
                        } else {
                            break;
                        }
                    }
                    return Ok(QueryPipe::Select(fields));
                }
                _ => {}
            }
            // Computed column: `name = expr`.
            if self.peek.kind == TokenKind::Assign {
                let name = word;
                self.advance()?;
                self.advance()?;
                let expr = self.parse_pipe_value()?;
                return Ok(QueryPipe::Computed { name, expr });
            }
        }
        Ok(QueryPipe::Where(self.parse_cond_or()?))
    }

    /// A host-side value inside a pipe: `{expr}` or a literal.
    fn parse_pipe_value(&mut self) -> Result<Expr, Diagnostic> {
        if self.cur.kind == TokenKind::LBrace {
            self.advance()?;
            let expr = self.parse_expr(Prec::Lowest)?;
            self.expect(TokenKind::RBrace, "'}'")?;
            Ok(expr)
        } else {
            self.parse_expr(Prec::Prefix)
        }
    }

    fn parse_terminal(&mut self) -> Result<QueryTerminal, Diagnostic> {
        let terminal = match self.cur.kind {
            TokenKind::TermOne => QueryTerminal::One,
            TokenKind::TermMany => QueryTerminal::Many,
            TokenKind::TermOneStrict => QueryTerminal::OneStrict,
            TokenKind::TermManyStrict => QueryTerminal::ManyStrict,
            TokenKind::TermCount => QueryTerminal::Count,
            TokenKind::Dot => QueryTerminal::Execute,
            _ => return Err(self.unexpected("a query terminal (?->, ??->, .->, .)")),
        };
        self.advance()?;
        Ok(terminal)
    }

    // -- conditions ---------------------------------------------------------

    pub(crate) fn parse_cond_or(&mut self) -> Result<Cond, Diagnostic> {
        let mut left = self.parse_cond_and()?;
        while self.cur.kind == TokenKind::Or {
            self.advance()?;
            let right = self.parse_cond_and()?;
            left = Cond::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cond_and(&mut self) -> Result<Cond, Diagnostic> {
        let mut left = self.parse_cond_unary()?;
        while self.cur.kind == TokenKind::And {
            self.advance()?;
            let right = self.parse_cond_unary()?;
            left = Cond::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cond_unary(&mut self) -> Result<Cond, Diagnostic> {
        if self.cur.kind == TokenKind::Not {
            self.advance()?;
            let inner = self.parse_cond_unary()?;
            return Ok(Cond::Not(Box::new(inner)));
        }
        if self.cur.kind == TokenKind::LParen {
            self.advance()?;
            let inner = self.parse_cond_or()?;
            self.expect(TokenKind::RParen, "')'")?;
            return Ok(inner);
        }
        self.parse_cond_primary()
    }

    fn parse_cond_primary(&mut self) -> Result<Cond, Diagnostic> {
        let column_token = self.expect(TokenKind::Ident, "a column reference")?;
        let column = column_token.text().to_string();

        // `is null` / `is not null`.
        if self.cur.kind == TokenKind::Is {
            self.advance()?;
            let negated = if self.cur.kind == TokenKind::Not {
                self.advance()?;
                true
            } else {
                false
            };
            self.expect(TokenKind::Null, "'null'")?;
            return Ok(Cond::IsNull { column, negated });
        }

        // `not like` / `not in`.
        if self.cur.kind == TokenKind::Not {
            self.advance()?;
            match self.cur.kind {
                TokenKind::Like => {
                    self.advance()?;
                    let value = self.parse_cond_value()?;
                    return Ok(Cond::Like {
                        column,
                        value,
                        negated: true,
                    });
                }
                TokenKind::In => {
                    self.advance()?;
                    return self.parse_in_tail(column, true);
                }
                _ => return Err(self.unexpected("'like' or 'in'")),
            }
        }

        if self.cur.kind == TokenKind::Like {
            self.advance()?;
            let value = self.parse_cond_value()?;
            return Ok(Cond::Like {
                column,
                value,
                negated: false,
            });
        }

        if self.cur.kind == TokenKind::Between {
            self.advance()?;
            let low = self.parse_cond_value()?;
            self.expect(TokenKind::And, "'and'")?;
            let high = self.parse_cond_value()?;
            return Ok(Cond::Between { column, low, high });
        }

        if self.cur.kind == TokenKind::In {
            self.advance()?;
            return self.parse_in_tail(column, false);
        }

        let op = match self.cur.kind {
            TokenKind::Eq => CmpOp::Eq,
            TokenKind::NotEq => CmpOp::NotEq,
            TokenKind::Lt => CmpOp::Lt,
            TokenKind::Gt => CmpOp::Gt,
            TokenKind::Le => CmpOp::Le,
            TokenKind::Ge => CmpOp::Ge,
            _ => return Err(self.unexpected("a comparison operator")),
        };
        self.advance()?;

        if self.cur.kind == TokenKind::SubqueryArrow {
            let query = self.parse_subquery()?;
            return Ok(Cond::Subquery {
                column,
                op,
                query: Box::new(query),
            });
        }

        let value = self.parse_cond_value()?;
        Ok(Cond::Cmp { column, op, value })
    }

    fn parse_in_tail(&mut self, column: String, negated: bool) -> Result<Cond, Diagnostic> {
        if self.cur.kind == TokenKind::SubqueryArrow {
            let query = self.parse_subquery()?;
            return Ok(Cond::Subquery {
                column,
                op: if negated { CmpOp::NotIn } else { CmpOp::In },
                query: Box::new(query),
            });
        }
        self.expect(TokenKind::LBracket, "'['")?;
        let mut values = Vec::new();
        while self.cur.kind != TokenKind::RBracket {
            values.push(self.parse_cond_value()?);
            if self.cur.kind == TokenKind::Comma {
                self.advance()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBracket, "']'")?;
        Ok(Cond::In {
            column,
            values,
            negated,
        })
    }

    /// `<-Source(pipes terminal)` inside a condition.
    fn parse_subquery(&mut self) -> Result<SubqueryExpr, Diagnostic> {
        self.expect(TokenKind::SubqueryArrow, "'<-'")?;
        let source = self.expect(TokenKind::Ident, "a subquery source")?;
        self.expect(TokenKind::LParen, "'('")?;
        let mut pipes = Vec::new();
        while self.cur.kind == TokenKind::Pipe {
            self.advance()?;
            pipes.push(self.parse_pipe_body()?);
        }
        let terminal = self.parse_terminal()?;
        self.expect(TokenKind::RParen, "')'")?;
        Ok(SubqueryExpr {
            block: QueryBlock {
                source: source.text().to_string(),
                alias: None,
                pipes,
                group_by: Vec::new(),
            },
            terminal,
        })
    }

    /// Column references are bare identifiers; `{…}` values are host
    /// expressions; literals are host values too.
    fn parse_cond_value(&mut self) -> Result<CondValue, Diagnostic> {
        match self.cur.kind {
            TokenKind::Ident => {
                let name = self.cur.text().to_string();
                self.advance()?;
                Ok(CondValue::Column(name))
            }
            TokenKind::LBrace => {
                self.advance()?;
                let expr = self.parse_expr(Prec::Lowest)?;
                self.expect(TokenKind::RBrace, "'}'")?;
                Ok(CondValue::Host(Box::new(expr)))
            }
            _ => Ok(CondValue::Host(Box::new(self.parse_expr(Prec::Prefix)?))),
        }
    }

    // -- other DSL expressions ---------------------------------------------

    pub(crate) fn parse_insert_expr(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.expect(TokenKind::InsertKw, "'@insert'")?;
        self.expect(TokenKind::LParen, "'('")?;
        let table = self.expect(TokenKind::Ident, "a table name")?;
        let assignments = self.parse_assignments()?;
        let terminal = self.parse_optional_terminal()?;
        self.expect(TokenKind::RParen, "')'")?;
        Ok(Expr::Insert(InsertExpr {
            token,
            table: table.text().to_string(),
            assignments,
            terminal,
        }))
    }

    pub(crate) fn parse_update_expr(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.expect(TokenKind::UpdateKw, "'@update'")?;
        self.expect(TokenKind::LParen, "'('")?;
        let table = self.expect(TokenKind::Ident, "a table name")?;
        let mut condition = None;
        while self.cur.kind == TokenKind::Pipe {
            self.advance()?;
            let cond = self.parse_cond_or()?;
            condition = Some(match condition {
                None => cond,
                Some(existing) => Cond::And(Box::new(existing), Box::new(cond)),
            });
        }
        let assignments = self.parse_assignments()?;
        let terminal = self.parse_optional_terminal()?;
        self.expect(TokenKind::RParen, "')'")?;
        Ok(Expr::Update(UpdateExpr {
            token,
            table: table.text().to_string(),
            condition,
            assignments,
            terminal,
        }))
    }

    pub(crate) fn parse_delete_expr(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.expect(TokenKind::DeleteKw, "'@delete'")?;
        self.expect(TokenKind::LParen, "'('")?;
        let table = self.expect(TokenKind::Ident, "a table name")?;
        let mut condition = None;
        while self.cur.kind == TokenKind::Pipe {
            self.advance()?;
            let cond = self.parse_cond_or()?;
            condition = Some(match condition {
                None => cond,
                Some(existing) => Cond::And(Box::new(existing), Box::new(cond)),
            });
        }
        let terminal = self.parse_optional_terminal()?;
        self.expect(TokenKind::RParen, "')'")?;
        Ok(Expr::Delete(DeleteExpr {
            token,
            table: table.text().to_string(),
            condition,
            terminal,
        }))
    }

    pub(crate) fn parse_transaction_expr(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.expect(TokenKind::TransactionKw, "'@transaction'")?;
        self.expect(TokenKind::LParen, "'('")?;
        let mut statements = Vec::new();
        while self.cur.kind != TokenKind::RParen && self.cur.kind != TokenKind::Eof {
            statements.push(self.parse_statement()?);
            while self.cur.kind == TokenKind::Semicolon {
                self.advance()?;
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        Ok(Expr::Transaction(TransactionExpr {
            token,
            body: Block { statements },
        }))
    }

    pub(crate) fn parse_schema_expr(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.expect(TokenKind::SchemaKw, "'@schema'")?;
        self.expect(TokenKind::LParen, "'('")?;
        let name = self.expect(TokenKind::Ident, "a schema name")?;
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut fields = Vec::new();
        while self.cur.kind != TokenKind::RBrace {
            let field = self.expect(TokenKind::Ident, "a field name")?;
            self.expect(TokenKind::Colon, "':'")?;
            let ty = self.expect(TokenKind::Ident, "a field type")?;
            fields.push((field.text().to_string(), ty.text().to_string()));
            if self.cur.kind == TokenKind::Comma {
                self.advance()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        self.expect(TokenKind::RParen, "')'")?;
        Ok(Expr::Schema(SchemaExpr {
            token,
            name: name.text().to_string(),
            fields,
        }))
    }

    pub(crate) fn parse_table_ref(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.expect(TokenKind::TableKw, "'@table'")?;
        self.expect(TokenKind::LParen, "'('")?;
        let name = self.expect(TokenKind::Ident, "a table name")?;
        self.expect(TokenKind::RParen, "')'")?;
        Ok(Expr::TableRef {
            token,
            name: name.text().to_string(),
        })
    }

    /// `{ field: expr, … }` assignment blocks for insert/update.
    fn parse_assignments(&mut self) -> Result<Vec<(String, Expr)>, Diagnostic> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut assignments = Vec::new();
        while self.cur.kind != TokenKind::RBrace {
            let field = self.expect(TokenKind::Ident, "a column name")?;
            self.expect(TokenKind::Colon, "':'")?;
            let value = if self.cur.kind == TokenKind::LBrace {
                self.advance()?;
                let expr = self.parse_expr(Prec::Lowest)?;
                self.expect(TokenKind::RBrace, "'}'")?;
                expr
            } else {
                self.parse_expr(Prec::Lowest)?
            };
            assignments.push((field.text().to_string(), value));
            if self.cur.kind == TokenKind::Comma {
                self.advance()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(assignments)
    }

    fn parse_optional_terminal(&mut self) -> Result<QueryTerminal, Diagnostic> {
        match self.cur.kind {
            TokenKind::TermOne
            | TokenKind::TermMany
            | TokenKind::TermOneStrict
            | TokenKind::TermManyStrict
            | TokenKind::TermCount
            | TokenKind::Dot => self.parse_terminal(),
            _ => Ok(QueryTerminal::Execute),
        }
    }
}

