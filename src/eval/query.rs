//! Query DSL execution.
//!
//! `@query(…)` is lowered to a statement IR, not SQL: host values reached
//! through `{…}` interpolation are evaluated once and carried as bound
//! parameters; the database capability renders the IR to its dialect.
//! CTE blocks become WITH-clauses; `+ by` grouping applies to the main
//! block only.

use crate::capability::{CondIr, OperandIr, QueryBlockIr, StatementIr};
use crate::env::EnvRef;
use crate::error::Diagnostic;
use crate::lexer::Token;
use crate::parser::ast::{
    CmpOp, Cond, CondValue, DeleteExpr, Expr, InsertExpr, QueryBlock, QueryExpr, QueryPipe,
    QueryTerminal, Stmt, TransactionExpr, UpdateExpr,
};
use crate::value::Value;

use super::{EvalResult, Evaluator};

fn cmp_sql(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "=",
        CmpOp::NotEq => "<>",
        CmpOp::Lt => "<",
        CmpOp::Gt => ">",
        CmpOp::Le => "<=",
        CmpOp::Ge => ">=",
        CmpOp::In => "IN",
        CmpOp::NotIn => "NOT IN",
    }
}

impl Evaluator {
    pub(crate) async fn eval_query(&self, q: &QueryExpr, env: &EnvRef) -> EvalResult<Value> {
        let token = &q.token;
        let mut blocks = Vec::with_capacity(q.blocks.len());
        for (i, block) in q.blocks.iter().enumerate() {
            let is_main = i + 1 == q.blocks.len();
            blocks.push(self.lower_block(block, env, !is_main).await?);
        }
        let main = blocks.pop().expect("at least one query block");
        let ir = StatementIr::Select {
            ctes: blocks,
            main,
            count: q.terminal == QueryTerminal::Count,
        };
        self.execute_ir(&ir, q.terminal, token).await
    }

    pub(crate) async fn eval_insert(&self, i: &InsertExpr, env: &EnvRef) -> EvalResult<Value> {
        let mut columns = Vec::with_capacity(i.assignments.len());
        let mut values = Vec::with_capacity(i.assignments.len());
        for (column, expr) in &i.assignments {
            columns.push(column.clone());
            values.push(self.eval_expr(expr, env).await?);
        }
        let ir = StatementIr::Insert {
            table: i.table.clone(),
            columns,
            values,
        };
        self.execute_ir(&ir, i.terminal, &i.token).await
    }

    pub(crate) async fn eval_update(&self, u: &UpdateExpr, env: &EnvRef) -> EvalResult<Value> {
        let mut assignments = Vec::with_capacity(u.assignments.len());
        for (column, expr) in &u.assignments {
            assignments.push((column.clone(), self.eval_expr(expr, env).await?));
        }
        let condition = match &u.condition {
            Some(c) => Some(self.lower_cond(c, env).await?),
            None => None,
        };
        let ir = StatementIr::Update {
            table: u.table.clone(),
            assignments,
            condition,
        };
        self.execute_ir(&ir, u.terminal, &u.token).await
    }

    pub(crate) async fn eval_delete(&self, d: &DeleteExpr, env: &EnvRef) -> EvalResult<Value> {
        let condition = match &d.condition {
            Some(c) => Some(self.lower_cond(c, env).await?),
            None => None,
        };
        let ir = StatementIr::Delete {
            table: d.table.clone(),
            condition,
        };
        self.execute_ir(&ir, d.terminal, &d.token).await
    }

    /// `@transaction(…)` lowers every DML statement in its body and hands
    /// the batch to the executor to run atomically.
    pub(crate) async fn eval_transaction(
        &self,
        t: &TransactionExpr,
        env: &EnvRef,
    ) -> EvalResult<Value> {
        let mut batch = Vec::new();
        for stmt in &t.body.statements {
            let ir = match stmt {
                Stmt::Expr { expr: Expr::Insert(i), .. } => {
                    let mut columns = Vec::new();
                    let mut values = Vec::new();
                    for (column, expr) in &i.assignments {
                        columns.push(column.clone());
                        values.push(self.eval_expr(expr, env).await?);
                    }
                    StatementIr::Insert {
                        table: i.table.clone(),
                        columns,
                        values,
                    }
                }
                Stmt::Expr { expr: Expr::Update(u), .. } => {
                    let mut assignments = Vec::new();
                    for (column, expr) in &u.assignments {
                        assignments.push((column.clone(), self.eval_expr(expr, env).await?));
                    }
                    let condition = match &u.condition {
                        Some(c) => Some(self.lower_cond(c, env).await?),
                        None => None,
                    };
                    StatementIr::Update {
                        table: u.table.clone(),
                        assignments,
                        condition,
                    }
                }
                Stmt::Expr { expr: Expr::Delete(d), .. } => {
                    let condition = match &d.condition {
                        Some(c) => Some(self.lower_cond(c, env).await?),
                        None => None,
                    };
                    StatementIr::Delete {
                        table: d.table.clone(),
                        condition,
                    }
                }
                other => {
                    return Err(Diagnostic::runtime(
                        "R-TX-STATEMENT",
                        "@transaction bodies contain only @insert, @update, and @delete operations",
                    )
                    .at(other.token().line, other.token().column)
                    .into());
                }
            };
            let (sql, params) = self
                .caps
                .db
                .render(&ir)
                .map_err(|d| d.or_at(t.token.line, t.token.column))?;
            batch.push((sql, params));
        }
        self.check_cancel()?;
        let affected = self
            .caps
            .db
            .exec_transaction(&batch)
            .await
            .map_err(|d| d.or_at(t.token.line, t.token.column))?;
        self.check_cancel()?;
        Ok(Value::Int(affected))
    }

    async fn execute_ir(
        &self,
        ir: &StatementIr,
        terminal: QueryTerminal,
        token: &Token,
    ) -> EvalResult<Value> {
        let (sql, params) = self
            .caps
            .db
            .render(ir)
            .map_err(|d| d.or_at(token.line, token.column))?;
        self.check_cancel()?;
        let result = match (ir, terminal) {
            (StatementIr::Select { .. }, QueryTerminal::One) => self
                .caps
                .db
                .query_one(&sql, &params)
                .await
                .map(|row| row.unwrap_or(Value::Null)),
            (StatementIr::Select { .. }, QueryTerminal::OneStrict) => {
                match self.caps.db.query_one(&sql, &params).await {
                    Ok(Some(row)) => Ok(row),
                    Ok(None) => Err(Diagnostic::runtime(
                        "R-QUERY-EMPTY",
                        "?!-> expected exactly one row, found none",
                    )),
                    Err(d) => Err(d),
                }
            }
            (StatementIr::Select { .. }, QueryTerminal::Many) => {
                self.caps.db.query_many(&sql, &params).await.map(Value::array)
            }
            (StatementIr::Select { .. }, QueryTerminal::ManyStrict) => {
                match self.caps.db.query_many(&sql, &params).await {
                    Ok(rows) if rows.is_empty() => Err(Diagnostic::runtime(
                        "R-QUERY-EMPTY",
                        "??!-> expected at least one row, found none",
                    )),
                    Ok(rows) => Ok(Value::array(rows)),
                    Err(d) => Err(d),
                }
            }
            (StatementIr::Select { .. }, QueryTerminal::Count) => {
                match self.caps.db.query_one(&sql, &params).await {
                    Ok(Some(row)) => {
                        let count = match &row {
                            Value::Dict(map) => {
                                map.read().get("count").cloned().unwrap_or(Value::Int(0))
                            }
                            other => other.clone(),
                        };
                        Ok(count)
                    }
                    Ok(None) => Ok(Value::Int(0)),
                    Err(d) => Err(d),
                }
            }
            (StatementIr::Select { .. }, QueryTerminal::Execute) => self
                .caps
                .db
                .exec(&sql, &params)
                .await
                .map(|_| Value::Null),
            // DML: count terminals bind the affected row count.
            (_, QueryTerminal::Count) => {
                self.caps.db.exec(&sql, &params).await.map(Value::Int)
            }
            (_, QueryTerminal::Execute) => {
                self.caps.db.exec(&sql, &params).await.map(|_| Value::Null)
            }
            (_, _) => self.caps.db.exec(&sql, &params).await.map(Value::Int),
        };
        self.check_cancel()?;
        result.map_err(|d| d.or_at(token.line, token.column).into())
    }

    async fn lower_block(
        &self,
        block: &QueryBlock,
        env: &EnvRef,
        is_cte: bool,
    ) -> EvalResult<QueryBlockIr> {
        let mut ir = QueryBlockIr {
            name: if is_cte {
                Some(block.alias.clone().unwrap_or_else(|| block.source.clone()))
            } else {
                None
            },
            table: block.source.clone(),
            alias: if is_cte { None } else { block.alias.clone() },
            ..Default::default()
        };
        for pipe in &block.pipes {
            match pipe {
                QueryPipe::Where(cond) => {
                    let lowered = self.lower_cond(cond, env).await?;
                    ir.condition = Some(match ir.condition.take() {
                        None => lowered,
                        Some(existing) => {
                            CondIr::And(Box::new(existing), Box::new(lowered))
                        }
                    });
                }
                QueryPipe::Sort { fields } => {
                    ir.sort.extend(fields.iter().cloned());
                }
                QueryPipe::Limit(expr) => {
                    ir.limit = Some(self.eval_expr(expr, env).await?);
                }
                QueryPipe::Offset(expr) => {
                    ir.offset = Some(self.eval_expr(expr, env).await?);
                }
                QueryPipe::Select(fields) => {
                    ir.select.extend(fields.iter().cloned());
                }
                QueryPipe::Computed { name, expr } => {
                    let value = self.eval_expr(expr, env).await?;
                    ir.computed.push((name.clone(), OperandIr::Param(value)));
                }
            }
        }
        // Grouping applies to the main query only.
        if !is_cte {
            ir.group_by = block.group_by.clone();
        }
        Ok(ir)
    }

    fn lower_cond<'a>(
        &'a self,
        cond: &'a Cond,
        env: &'a EnvRef,
    ) -> futures::future::BoxFuture<'a, EvalResult<CondIr>> {
        use futures::FutureExt;
        async move {
            Ok(match cond {
                Cond::Cmp { column, op, value } => CondIr::Cmp {
                    column: column.clone(),
                    op: cmp_sql(*op),
                    value: self.lower_operand(value, env).await?,
                },
                Cond::IsNull { column, negated } => CondIr::IsNull {
                    column: column.clone(),
                    negated: *negated,
                },
                Cond::Like {
                    column,
                    value,
                    negated,
                } => CondIr::Like {
                    column: column.clone(),
                    value: self.lower_operand(value, env).await?,
                    negated: *negated,
                },
                Cond::Between { column, low, high } => CondIr::Between {
                    column: column.clone(),
                    low: self.lower_operand(low, env).await?,
                    high: self.lower_operand(high, env).await?,
                },
                Cond::In {
                    column,
                    values,
                    negated,
                } => {
                    let mut lowered = Vec::with_capacity(values.len());
                    for v in values {
                        lowered.push(self.lower_operand(v, env).await?);
                    }
                    CondIr::InList {
                        column: column.clone(),
                        values: lowered,
                        negated: *negated,
                    }
                }
                Cond::Subquery { column, op, query } => {
                    let sub = self.lower_block(&query.block, env, false).await?;
                    CondIr::InSubquery {
                        column: column.clone(),
                        op: cmp_sql(*op),
                        sub: Box::new(sub),
                    }
                }
                Cond::Not(inner) => CondIr::Not(Box::new(self.lower_cond(inner, env).await?)),
                Cond::And(a, b) => CondIr::And(
                    Box::new(self.lower_cond(a, env).await?),
                    Box::new(self.lower_cond(b, env).await?),
                ),
                Cond::Or(a, b) => CondIr::Or(
                    Box::new(self.lower_cond(a, env).await?),
                    Box::new(self.lower_cond(b, env).await?),
                ),
            })
        }
        .boxed()
    }

    async fn lower_operand(
        &self,
        value: &CondValue,
        env: &EnvRef,
    ) -> EvalResult<OperandIr> {
        Ok(match value {
            CondValue::Column(c) => OperandIr::Column(c.clone()),
            CondValue::Host(expr) => {
                OperandIr::Param(self.eval_expr(expr, env).await?)
            }
        })
    }
}
