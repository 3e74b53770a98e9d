//! Database capability: the executor interface, the statement IR the
//! evaluator lowers `@query`/`@insert`/`@update`/`@delete` into, and the
//! SQLite implementation.
//!
//! The IR is rendered to a dialect-specific statement by the executor;
//! host values always travel as bound parameters, never as spliced text.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Pool, Row, Sqlite, TypeInfo};
use std::str::FromStr;

use crate::error::Diagnostic;
use crate::value::{OrderedMap, Value};

/// Either a column reference or a host value bound as a parameter.
#[derive(Debug, Clone)]
pub enum OperandIr {
    Column(String),
    Param(Value),
}

#[derive(Debug, Clone)]
pub enum CondIr {
    Cmp {
        column: String,
        op: &'static str,
        value: OperandIr,
    },
    IsNull {
        column: String,
        negated: bool,
    },
    Like {
        column: String,
        value: OperandIr,
        negated: bool,
    },
    Between {
        column: String,
        low: OperandIr,
        high: OperandIr,
    },
    InList {
        column: String,
        values: Vec<OperandIr>,
        negated: bool,
    },
    InSubquery {
        column: String,
        op: &'static str,
        sub: Box<QueryBlockIr>,
    },
    Not(Box<CondIr>),
    And(Box<CondIr>, Box<CondIr>),
    Or(Box<CondIr>, Box<CondIr>),
}

/// One SELECT block. CTE blocks carry a `name`; the main block does not.
#[derive(Debug, Clone, Default)]
pub struct QueryBlockIr {
    pub name: Option<String>,
    pub table: String,
    pub alias: Option<String>,
    pub select: Vec<String>,
    pub computed: Vec<(String, OperandIr)>,
    pub condition: Option<CondIr>,
    pub group_by: Vec<String>,
    pub sort: Vec<(String, bool)>,
    pub limit: Option<Value>,
    pub offset: Option<Value>,
}

/// A complete renderable statement.
#[derive(Debug, Clone)]
pub enum StatementIr {
    Select {
        ctes: Vec<QueryBlockIr>,
        main: QueryBlockIr,
        /// Wrap the query in `SELECT COUNT(*)` (the `.->` terminal).
        count: bool,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Value)>,
        condition: Option<CondIr>,
    },
    Delete {
        table: String,
        condition: Option<CondIr>,
    },
}

/// The executor interface the evaluator calls. Errors map to the `runtime`
/// class.
#[async_trait]
pub trait DbExecutor: Send + Sync {
    async fn exec(&self, stmt: &str, params: &[Value]) -> Result<i64, Diagnostic>;
    async fn query_one(&self, stmt: &str, params: &[Value])
        -> Result<Option<Value>, Diagnostic>;
    async fn query_many(&self, stmt: &str, params: &[Value]) -> Result<Vec<Value>, Diagnostic>;
    /// Execute a batch of statements atomically, returning the total
    /// affected row count. Backs `@transaction(…)`.
    async fn exec_transaction(
        &self,
        batch: &[(String, Vec<Value>)],
    ) -> Result<i64, Diagnostic>;
    /// Render the IR to a dialect statement plus its bound parameters.
    fn render(&self, ir: &StatementIr) -> Result<(String, Vec<Value>), Diagnostic>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

pub struct SqliteDb {
    pool: Pool<Sqlite>,
}

impl SqliteDb {
    /// Open (creating if missing) a database file, or `:memory:`.
    pub async fn connect(location: &str) -> Result<SqliteDb, crate::error::BasilError> {
        // Every pooled connection to `:memory:` would otherwise get its
        // own private database.
        let (options, max_connections) = if location == ":memory:" {
            (SqliteConnectOptions::from_str("sqlite::memory:")?, 1)
        } else {
            (
                SqliteConnectOptions::new()
                    .filename(location)
                    .create_if_missing(true),
                8,
            )
        };
        let options = options.busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(SqliteDb { pool })
    }

    pub fn from_pool(pool: Pool<Sqlite>) -> SqliteDb {
        SqliteDb { pool }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    fn bind<'q>(
        mut query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        params: &'q [Value],
    ) -> Result<sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>, Diagnostic>
    {
        for p in params {
            query = match p {
                Value::Null => query.bind(Option::<i64>::None),
                Value::Bool(b) => query.bind(*b),
                Value::Int(n) => query.bind(*n),
                Value::Float(f) => query.bind(*f),
                Value::Str(s) => query.bind(s.to_string()),
                Value::Datetime(dt) => query.bind(dt.to_rfc3339()),
                Value::Date(d) => query.bind(d.to_string()),
                Value::Time(t) => query.bind(t.to_string()),
                Value::Money(m) => query.bind(m.minor),
                Value::Path(p) => query.bind(p.to_string()),
                Value::Url(u) => query.bind(u.to_string()),
                other => {
                    return Err(Diagnostic::runtime(
                        "R-DB-PARAM",
                        format!("{} values cannot be bound as SQL parameters", other.type_name()),
                    ));
                }
            };
        }
        Ok(query)
    }

    fn row_to_value(row: &SqliteRow) -> Result<Value, Diagnostic> {
        let mut dict = OrderedMap::new();
        for (i, column) in row.columns().iter().enumerate() {
            let type_name = column.type_info().name().to_uppercase();
            let value = match type_name.as_str() {
                "INTEGER" | "INT" | "BIGINT" | "INT4" | "INT8" => row
                    .try_get::<Option<i64>, usize>(i)
                    .map(|v| v.map(Value::Int).unwrap_or(Value::Null)),
                "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => row
                    .try_get::<Option<f64>, usize>(i)
                    .map(|v| v.map(Value::Float).unwrap_or(Value::Null)),
                "BOOLEAN" | "BOOL" => row
                    .try_get::<Option<bool>, usize>(i)
                    .map(|v| v.map(Value::Bool).unwrap_or(Value::Null)),
                "NULL" => Ok(Value::Null),
                _ => row
                    .try_get::<Option<String>, usize>(i)
                    .map(|v| v.map(Value::str).unwrap_or(Value::Null)),
            }
            .map_err(|e| {
                Diagnostic::runtime(
                    "R-DB-DECODE",
                    format!("decoding column '{}': {e}", column.name()),
                )
            })?;
            dict.insert(column.name().to_string(), value);
        }
        Ok(Value::dict(dict))
    }
}

#[async_trait]
impl DbExecutor for SqliteDb {
    async fn exec(&self, stmt: &str, params: &[Value]) -> Result<i64, Diagnostic> {
        let query = Self::bind(sqlx::query(stmt), params)?;
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| Diagnostic::runtime("R-DB-EXEC", format!("{e}")))?;
        Ok(result.rows_affected() as i64)
    }

    async fn query_one(
        &self,
        stmt: &str,
        params: &[Value],
    ) -> Result<Option<Value>, Diagnostic> {
        let query = Self::bind(sqlx::query(stmt), params)?;
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Diagnostic::runtime("R-DB-QUERY", format!("{e}")))?;
        row.as_ref().map(Self::row_to_value).transpose()
    }

    async fn query_many(&self, stmt: &str, params: &[Value]) -> Result<Vec<Value>, Diagnostic> {
        let query = Self::bind(sqlx::query(stmt), params)?;
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Diagnostic::runtime("R-DB-QUERY", format!("{e}")))?;
        rows.iter().map(Self::row_to_value).collect()
    }

    async fn exec_transaction(
        &self,
        batch: &[(String, Vec<Value>)],
    ) -> Result<i64, Diagnostic> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Diagnostic::runtime("R-DB-TX", format!("begin: {e}")))?;
        let mut affected = 0_i64;
        for (stmt, params) in batch {
            let query = Self::bind(sqlx::query(stmt), params)?;
            let result = query
                .execute(&mut *tx)
                .await
                .map_err(|e| Diagnostic::runtime("R-DB-TX", format!("{e}")))?;
            affected += result.rows_affected() as i64;
        }
        tx.commit()
            .await
            .map_err(|e| Diagnostic::runtime("R-DB-TX", format!("commit: {e}")))?;
        Ok(affected)
    }

    fn render(&self, ir: &StatementIr) -> Result<(String, Vec<Value>), Diagnostic> {
        render_sqlite(ir)
    }
}

// ---------------------------------------------------------------------------
// SQLite rendering
// ---------------------------------------------------------------------------

fn quote_ident(name: &str) -> Result<String, Diagnostic> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(Diagnostic::runtime(
            "R-DB-IDENT",
            format!("'{name}' is not a valid column or table reference"),
        ));
    }
    Ok(format!("\"{}\"", name.replace('.', "\".\"")))
}

struct SqlBuilder {
    sql: String,
    params: Vec<Value>,
}

impl SqlBuilder {
    fn push(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    fn push_operand(&mut self, operand: &OperandIr) -> Result<(), Diagnostic> {
        match operand {
            OperandIr::Column(c) => self.push(&quote_ident(c)?),
            OperandIr::Param(v) => {
                self.push("?");
                self.params.push(v.clone());
            }
        }
        Ok(())
    }

    fn push_cond(&mut self, cond: &CondIr) -> Result<(), Diagnostic> {
        match cond {
            CondIr::Cmp { column, op, value } => {
                self.push(&quote_ident(column)?);
                self.push(" ");
                self.push(op);
                self.push(" ");
                self.push_operand(value)?;
            }
            CondIr::IsNull { column, negated } => {
                self.push(&quote_ident(column)?);
                self.push(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            CondIr::Like {
                column,
                value,
                negated,
            } => {
                self.push(&quote_ident(column)?);
                self.push(if *negated { " NOT LIKE " } else { " LIKE " });
                self.push_operand(value)?;
            }
            CondIr::Between { column, low, high } => {
                self.push(&quote_ident(column)?);
                self.push(" BETWEEN ");
                self.push_operand(low)?;
                self.push(" AND ");
                self.push_operand(high)?;
            }
            CondIr::InList {
                column,
                values,
                negated,
            } => {
                self.push(&quote_ident(column)?);
                self.push(if *negated { " NOT IN (" } else { " IN (" });
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        self.push(", ");
                    }
                    self.push_operand(v)?;
                }
                self.push(")");
            }
            CondIr::InSubquery { column, op, sub } => {
                self.push(&quote_ident(column)?);
                self.push(" ");
                self.push(op);
                self.push(" (");
                self.push_select(sub)?;
                self.push(")");
            }
            CondIr::Not(inner) => {
                self.push("NOT (");
                self.push_cond(inner)?;
                self.push(")");
            }
            CondIr::And(a, b) => {
                self.push("(");
                self.push_cond(a)?;
                self.push(" AND ");
                self.push_cond(b)?;
                self.push(")");
            }
            CondIr::Or(a, b) => {
                self.push("(");
                self.push_cond(a)?;
                self.push(" OR ");
                self.push_cond(b)?;
                self.push(")");
            }
        }
        Ok(())
    }

    fn push_select(&mut self, block: &QueryBlockIr) -> Result<(), Diagnostic> {
        self.push("SELECT ");
        if block.select.is_empty() && block.computed.is_empty() {
            self.push("*");
        } else {
            let mut first = true;
            for column in &block.select {
                if !first {
                    self.push(", ");
                }
                first = false;
                self.push(&quote_ident(column)?);
            }
            for (name, operand) in &block.computed {
                if !first {
                    self.push(", ");
                }
                first = false;
                self.push_operand(operand)?;
                self.push(" AS ");
                self.push(&quote_ident(name)?);
            }
        }
        self.push(" FROM ");
        self.push(&quote_ident(&block.table)?);
        if let Some(alias) = &block.alias {
            self.push(" AS ");
            self.push(&quote_ident(alias)?);
        }
        if let Some(cond) = &block.condition {
            self.push(" WHERE ");
            self.push_cond(cond)?;
        }
        if !block.group_by.is_empty() {
            self.push(" GROUP BY ");
            for (i, column) in block.group_by.iter().enumerate() {
                if i > 0 {
                    self.push(", ");
                }
                self.push(&quote_ident(column)?);
            }
        }
        if !block.sort.is_empty() {
            self.push(" ORDER BY ");
            for (i, (column, desc)) in block.sort.iter().enumerate() {
                if i > 0 {
                    self.push(", ");
                }
                self.push(&quote_ident(column)?);
                if *desc {
                    self.push(" DESC");
                }
            }
        }
        if let Some(limit) = &block.limit {
            self.push(" LIMIT ?");
            self.params.push(limit.clone());
        }
        if let Some(offset) = &block.offset {
            self.push(" OFFSET ?");
            self.params.push(offset.clone());
        }
        Ok(())
    }
}

pub fn render_sqlite(ir: &StatementIr) -> Result<(String, Vec<Value>), Diagnostic> {
    let mut b = SqlBuilder {
        sql: String::new(),
        params: Vec::new(),
    };
    match ir {
        StatementIr::Select { ctes, main, count } => {
            if !ctes.is_empty() {
                b.push("WITH ");
                for (i, cte) in ctes.iter().enumerate() {
                    if i > 0 {
                        b.push(", ");
                    }
                    let name = cte.name.clone().unwrap_or_else(|| cte.table.clone());
                    b.push(&quote_ident(&name)?);
                    b.push(" AS (");
                    b.push_select(cte)?;
                    b.push(")");
                }
                b.push(" ");
            }
            if *count {
                b.push("SELECT COUNT(*) AS count FROM (");
                b.push_select(main)?;
                b.push(")");
            } else {
                b.push_select(main)?;
            }
        }
        StatementIr::Insert {
            table,
            columns,
            values,
        } => {
            b.push("INSERT INTO ");
            b.push(&quote_ident(table)?);
            b.push(" (");
            for (i, column) in columns.iter().enumerate() {
                if i > 0 {
                    b.push(", ");
                }
                b.push(&quote_ident(column)?);
            }
            b.push(") VALUES (");
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    b.push(", ");
                }
                b.push("?");
                b.params.push(value.clone());
            }
            b.push(")");
        }
        StatementIr::Update {
            table,
            assignments,
            condition,
        } => {
            b.push("UPDATE ");
            b.push(&quote_ident(table)?);
            b.push(" SET ");
            for (i, (column, value)) in assignments.iter().enumerate() {
                if i > 0 {
                    b.push(", ");
                }
                b.push(&quote_ident(column)?);
                b.push(" = ?");
                b.params.push(value.clone());
            }
            if let Some(cond) = condition {
                b.push(" WHERE ");
                b.push_cond(cond)?;
            }
        }
        StatementIr::Delete { table, condition } => {
            b.push("DELETE FROM ");
            b.push(&quote_ident(table)?);
            if let Some(cond) = condition {
                b.push(" WHERE ");
                b.push_cond(cond)?;
            }
        }
    }
    Ok((b.sql, b.params))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(c: &str) -> OperandIr {
        OperandIr::Column(c.to_string())
    }

    fn param(v: Value) -> OperandIr {
        OperandIr::Param(v)
    }

    #[test]
    fn renders_select_with_where_and_order() {
        let ir = StatementIr::Select {
            ctes: vec![],
            main: QueryBlockIr {
                table: "users".into(),
                condition: Some(CondIr::Cmp {
                    column: "active".into(),
                    op: "=",
                    value: param(Value::Bool(true)),
                }),
                sort: vec![("name".into(), true)],
                limit: Some(Value::Int(10)),
                ..Default::default()
            },
            count: false,
        };
        let (sql, params) = render_sqlite(&ir).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM \"users\" WHERE \"active\" = ? ORDER BY \"name\" DESC LIMIT ?"
        );
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn renders_ctes_as_with_clauses() {
        let ir = StatementIr::Select {
            ctes: vec![QueryBlockIr {
                name: Some("recent".into()),
                table: "orders".into(),
                ..Default::default()
            }],
            main: QueryBlockIr {
                table: "recent".into(),
                ..Default::default()
            },
            count: false,
        };
        let (sql, _) = render_sqlite(&ir).unwrap();
        assert!(sql.starts_with("WITH \"recent\" AS (SELECT * FROM \"orders\")"));
    }

    #[test]
    fn renders_subqueries_in_conditions() {
        let ir = StatementIr::Select {
            ctes: vec![],
            main: QueryBlockIr {
                table: "orders".into(),
                condition: Some(CondIr::InSubquery {
                    column: "user_id".into(),
                    op: "IN",
                    sub: Box::new(QueryBlockIr {
                        table: "users".into(),
                        select: vec!["id".into()],
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
            count: false,
        };
        let (sql, _) = render_sqlite(&ir).unwrap();
        assert!(sql.contains("\"user_id\" IN (SELECT \"id\" FROM \"users\")"));
    }

    #[test]
    fn invalid_identifiers_are_rejected() {
        let err = quote_ident("users; DROP TABLE x").unwrap_err();
        assert_eq!(err.code, "R-DB-IDENT");
    }

    #[test]
    fn cond_values_are_always_parameters() {
        let ir = StatementIr::Update {
            table: "users".into(),
            assignments: vec![("name".into(), Value::str("x'); --"))],
            condition: Some(CondIr::Cmp {
                column: "id".into(),
                op: "=",
                value: param(Value::Int(1)),
            }),
        };
        let (sql, params) = render_sqlite(&ir).unwrap();
        assert!(!sql.contains("--"), "host values must never be spliced");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn column_operands_render_as_identifiers() {
        let ir = StatementIr::Select {
            ctes: vec![],
            main: QueryBlockIr {
                table: "t".into(),
                condition: Some(CondIr::Cmp {
                    column: "a".into(),
                    op: "=",
                    value: col("b"),
                }),
                ..Default::default()
            },
            count: false,
        };
        let (sql, params) = render_sqlite(&ir).unwrap();
        assert!(sql.contains("\"a\" = \"b\""));
        assert!(params.is_empty());
    }

    #[tokio::test]
    async fn sqlite_exec_and_query_round_trip() {
        let db = SqliteDb::connect(":memory:").await.unwrap();
        db.exec(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, active BOOLEAN)",
            &[],
        )
        .await
        .unwrap();
        db.exec(
            "INSERT INTO users (id, name, active) VALUES (?, ?, ?)",
            &[Value::Int(1), Value::str("A"), Value::Bool(true)],
        )
        .await
        .unwrap();

        let rows = db
            .query_many(
                "SELECT id, name FROM users WHERE active = ?",
                &[Value::Bool(true)],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let json = rows[0].to_json_value().unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["name"], "A");

        let one = db
            .query_one("SELECT name FROM users WHERE id = ?", &[Value::Int(1)])
            .await
            .unwrap();
        assert!(one.is_some());

        let none = db
            .query_one("SELECT name FROM users WHERE id = ?", &[Value::Int(99)])
            .await
            .unwrap();
        assert!(none.is_none());
    }
}
