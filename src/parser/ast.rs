//! The Parsley AST.
//!
//! Every node retains its source token so diagnostics can point back into
//! the file. A [`Program`] is the unit the AST cache stores; function
//! bodies are `Arc`-shared so closures can outlive the tree walk that
//! created them.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

use crate::lexer::token::Token;

/// An ordered sequence of top-level statements with a canonical source
/// identity (absolute path, or `<input>` for synthetic sources).
#[derive(Debug, Clone)]
pub struct Program {
    pub source: PathBuf,
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Let {
        token: Token,
        pattern: Pattern,
        value: Expr,
    },
    Assign {
        token: Token,
        targets: Vec<Pattern>,
        value: Expr,
    },
    IndexAssign {
        token: Token,
        target: Expr,
        index: Expr,
        value: Expr,
    },
    Return {
        token: Token,
        value: Option<Expr>,
    },
    Check {
        token: Token,
        cond: Expr,
    },
    Export {
        token: Token,
        names: Vec<String>,
        /// `export let x = …` declares and exports in one statement.
        decl: Option<Box<Stmt>>,
    },
    Stop {
        token: Token,
        cond: Option<Expr>,
    },
    Skip {
        token: Token,
        cond: Option<Expr>,
    },
    Read(ReadStmt),
    Write(WriteStmt),
    Expr {
        token: Token,
        expr: Expr,
    },
    Block {
        token: Token,
        block: Block,
    },
}

impl Stmt {
    pub fn token(&self) -> &Token {
        match self {
            Stmt::Let { token, .. }
            | Stmt::Assign { token, .. }
            | Stmt::IndexAssign { token, .. }
            | Stmt::Return { token, .. }
            | Stmt::Check { token, .. }
            | Stmt::Export { token, .. }
            | Stmt::Stop { token, .. }
            | Stmt::Skip { token, .. }
            | Stmt::Expr { token, .. }
            | Stmt::Block { token, .. } => token,
            Stmt::Read(r) => &r.token,
            Stmt::Write(w) => &w.token,
        }
    }
}

/// Reader-operator statements keep their binding target on the AST.
#[derive(Debug, Clone)]
pub struct ReadStmt {
    pub token: Token,
    pub op: ReadOp,
    pub target: Pattern,
    pub source: Expr,
    /// Optional parameter array for the database forms.
    pub params: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOp {
    /// `<==` read the entire contents of a path, URL, or stream.
    Read,
    /// `<=/=` HTTP GET, decoded by content type.
    Fetch,
    /// `|<` read the next line from an open cursor.
    PipeRead,
    /// `<=?=>` execute SQL, bind one row.
    QueryOne,
    /// `<=??=>` execute SQL, bind all rows.
    QueryMany,
    /// `<=!=>` execute mutating SQL, bind the affected count.
    Exec,
}

#[derive(Debug, Clone)]
pub struct WriteStmt {
    pub token: Token,
    pub op: WriteOp,
    pub value: Expr,
    pub target: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    /// `==>` truncate-and-write.
    Write,
    /// `==>>` append.
    Append,
    /// `=/=>` remote write.
    RemoteWrite,
    /// `=/=>>` remote append.
    RemoteAppend,
}

/// Destructuring patterns. Nested array patterns inside dictionary
/// patterns are rejected by the parser with a dedicated error.
#[derive(Debug, Clone)]
pub enum Pattern {
    Name(String),
    Dict {
        entries: Vec<DictPatternEntry>,
        rest: Option<String>,
    },
    Array {
        items: Vec<Pattern>,
        rest: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct DictPatternEntry {
    pub key: String,
    pub alias: Option<String>,
    pub nested: Option<Pattern>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfixOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Concat,
    Range,
    Eq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    Nullish,
    In,
    NotIn,
    Match,
    NotMatch,
    /// `<=?=>` as an expression.
    QueryOne,
    /// `<=??=>` as an expression.
    QueryMany,
    /// `<=!=>` as an expression.
    ExecSql,
    /// `cmd <=#=> input` spawns a subprocess.
    ShellPipe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NowKind {
    Now,
    TimeNow,
    DateNow,
    Today,
}

/// A compiled interpolated-literal segment.
#[derive(Debug, Clone)]
pub enum TemplateSeg {
    Text(String),
    Expr(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    String,
    Path,
    Url,
    Datetime,
}

#[derive(Debug, Clone)]
pub enum ImportPath {
    /// Statically known path text; tracked in the cache dependency set.
    Static(String),
    /// `import @(…)` computed at runtime; the importer's dependency set is
    /// treated as incomplete.
    Dynamic(Vec<TemplateSeg>),
}

#[derive(Debug, Clone)]
pub enum DictKey {
    Ident(String),
    Str(String),
}

#[derive(Debug, Clone)]
pub struct TagAttr {
    pub name: String,
    /// Missing value means boolean presence (`<input disabled/>`).
    pub value: Option<Expr>,
}

#[derive(Debug, Clone)]
pub enum TagChild {
    /// Verbatim text node.
    Text(String),
    Tag(Expr),
    /// `{…}` island: statements whose produced values are rendered.
    Interp(Block),
    /// `@{…}` island inside raw (`style`/`script`) content.
    RawInterp(Box<Expr>),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Null(Token),
    Bool {
        token: Token,
        value: bool,
    },
    Int {
        token: Token,
        value: i64,
    },
    Float {
        token: Token,
        value: f64,
    },
    Str {
        token: Token,
        value: String,
    },
    Template {
        token: Token,
        kind: TemplateKind,
        parts: Vec<TemplateSeg>,
    },
    Regex {
        token: Token,
        pattern: String,
        flags: String,
    },
    Money {
        token: Token,
        currency: &'static str,
        minor: i64,
        scale: u8,
    },
    Datetime {
        token: Token,
        value: DateTime<Utc>,
    },
    Date {
        token: Token,
        value: NaiveDate,
    },
    Time {
        token: Token,
        value: NaiveTime,
    },
    Duration {
        token: Token,
        months: i32,
        secs: i64,
    },
    Now {
        token: Token,
        kind: NowKind,
    },
    PathLit {
        token: Token,
        text: String,
    },
    UrlLit {
        token: Token,
        text: String,
    },
    StdlibPath {
        token: Token,
        text: String,
    },
    Connection {
        token: Token,
        kind: String,
        args: Vec<Expr>,
    },
    EnvRoot {
        token: Token,
        which: String,
    },
    Ident {
        token: Token,
        name: String,
    },
    Prefix {
        token: Token,
        op: PrefixOp,
        operand: Box<Expr>,
    },
    Infix {
        token: Token,
        op: InfixOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        token: Token,
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Index {
        token: Token,
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        token: Token,
        target: Box<Expr>,
        from: Option<Box<Expr>>,
        to: Option<Box<Expr>>,
    },
    Dot {
        token: Token,
        target: Box<Expr>,
        field: String,
    },
    Grouped {
        token: Token,
        inner: Box<Expr>,
    },
    If {
        token: Token,
        cond: Box<Expr>,
        then: Block,
        elifs: Vec<(Expr, Block)>,
        alternative: Option<Block>,
    },
    For {
        token: Token,
        bindings: Vec<String>,
        iterable: Box<Expr>,
        body: Block,
    },
    Try {
        token: Token,
        call: Box<Expr>,
    },
    Import {
        token: Token,
        path: ImportPath,
        alias: Option<String>,
    },
    Function {
        token: Token,
        name: Option<String>,
        params: Vec<String>,
        rest: Option<String>,
        body: Arc<Block>,
    },
    Dict {
        token: Token,
        entries: Vec<(DictKey, Expr)>,
    },
    Array {
        token: Token,
        items: Vec<Expr>,
    },
    TagPair {
        token: Token,
        name: String,
        attrs: Vec<TagAttr>,
        children: Vec<TagChild>,
    },
    TagLiteral {
        token: Token,
        name: String,
        attrs: Vec<TagAttr>,
    },
    Query(QueryExpr),
    Insert(InsertExpr),
    Update(UpdateExpr),
    Delete(DeleteExpr),
    Transaction(TransactionExpr),
    Schema(SchemaExpr),
    TableRef {
        token: Token,
        name: String,
    },
}

impl Expr {
    pub fn token(&self) -> &Token {
        match self {
            Expr::Null(token) => token,
            Expr::Bool { token, .. }
            | Expr::Int { token, .. }
            | Expr::Float { token, .. }
            | Expr::Str { token, .. }
            | Expr::Template { token, .. }
            | Expr::Regex { token, .. }
            | Expr::Money { token, .. }
            | Expr::Datetime { token, .. }
            | Expr::Date { token, .. }
            | Expr::Time { token, .. }
            | Expr::Duration { token, .. }
            | Expr::Now { token, .. }
            | Expr::PathLit { token, .. }
            | Expr::UrlLit { token, .. }
            | Expr::StdlibPath { token, .. }
            | Expr::Connection { token, .. }
            | Expr::EnvRoot { token, .. }
            | Expr::Ident { token, .. }
            | Expr::Prefix { token, .. }
            | Expr::Infix { token, .. }
            | Expr::Call { token, .. }
            | Expr::Index { token, .. }
            | Expr::Slice { token, .. }
            | Expr::Dot { token, .. }
            | Expr::Grouped { token, .. }
            | Expr::If { token, .. }
            | Expr::For { token, .. }
            | Expr::Try { token, .. }
            | Expr::Import { token, .. }
            | Expr::Function { token, .. }
            | Expr::Dict { token, .. }
            | Expr::Array { token, .. }
            | Expr::TagPair { token, .. }
            | Expr::TagLiteral { token, .. }
            | Expr::TableRef { token, .. } => token,
            Expr::Query(q) => &q.token,
            Expr::Insert(i) => &i.token,
            Expr::Update(u) => &u.token,
            Expr::Delete(d) => &d.token,
            Expr::Transaction(t) => &t.token,
            Expr::Schema(s) => &s.token,
        }
    }

    /// Is this a call (or method call) expression? `try` may only wrap
    /// these.
    pub fn is_call(&self) -> bool {
        matches!(self, Expr::Call { .. })
    }
}

// ---------------------------------------------------------------------------
// Query DSL
// ---------------------------------------------------------------------------

/// `@query(Source [as alias] (| condition | modifier | computed)*
/// (+ by fields)? terminal)`. Multiple source blocks express CTEs, the last
/// block being the main query.
#[derive(Debug, Clone)]
pub struct QueryExpr {
    pub token: Token,
    pub blocks: Vec<QueryBlock>,
    pub terminal: QueryTerminal,
}

#[derive(Debug, Clone)]
pub struct QueryBlock {
    pub source: String,
    pub alias: Option<String>,
    pub pipes: Vec<QueryPipe>,
    /// `+ by` fields; only honoured on the main block.
    pub group_by: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum QueryPipe {
    Where(Cond),
    Sort {
        fields: Vec<(String, bool)>,
    },
    Limit(Expr),
    Offset(Expr),
    Select(Vec<String>),
    Computed {
        name: String,
        expr: Expr,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTerminal {
    /// `?->` one row or null.
    One,
    /// `??->` many rows.
    Many,
    /// `?!->` exactly one row, error otherwise.
    OneStrict,
    /// `??!->` at least one row, error otherwise.
    ManyStrict,
    /// `.->` execute and bind the affected/derived count.
    Count,
    /// `.` execute for effect.
    Execute,
}

#[derive(Debug, Clone)]
pub enum Cond {
    Cmp {
        column: String,
        op: CmpOp,
        value: CondValue,
    },
    IsNull {
        column: String,
        negated: bool,
    },
    Like {
        column: String,
        value: CondValue,
        negated: bool,
    },
    Between {
        column: String,
        low: CondValue,
        high: CondValue,
    },
    In {
        column: String,
        values: Vec<CondValue>,
        negated: bool,
    },
    /// `column in <-Source(…)`; also used for scalar comparisons against a
    /// correlated subquery.
    Subquery {
        column: String,
        op: CmpOp,
        query: Box<SubqueryExpr>,
    },
    Not(Box<Cond>),
    And(Box<Cond>, Box<Cond>),
    Or(Box<Cond>, Box<Cond>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    In,
    NotIn,
}

/// Column references are bare identifiers; `{…}` values are host
/// expressions evaluated once and bound as parameters, never spliced.
#[derive(Debug, Clone)]
pub enum CondValue {
    Column(String),
    Host(Box<Expr>),
}

/// `<-Source (| cond)* terminal` inside a condition.
#[derive(Debug, Clone)]
pub struct SubqueryExpr {
    pub block: QueryBlock,
    pub terminal: QueryTerminal,
}

#[derive(Debug, Clone)]
pub struct InsertExpr {
    pub token: Token,
    pub table: String,
    pub assignments: Vec<(String, Expr)>,
    pub terminal: QueryTerminal,
}

#[derive(Debug, Clone)]
pub struct UpdateExpr {
    pub token: Token,
    pub table: String,
    pub condition: Option<Cond>,
    pub assignments: Vec<(String, Expr)>,
    pub terminal: QueryTerminal,
}

#[derive(Debug, Clone)]
pub struct DeleteExpr {
    pub token: Token,
    pub table: String,
    pub condition: Option<Cond>,
    pub terminal: QueryTerminal,
}

/// `@transaction(stmt; stmt; …)` executes the inner operations atomically.
#[derive(Debug, Clone)]
pub struct TransactionExpr {
    pub token: Token,
    pub body: Block,
}

/// `@schema(Name { field: type, … })` compiled once per module scope.
#[derive(Debug, Clone)]
pub struct SchemaExpr {
    pub token: Token,
    pub name: String,
    pub fields: Vec<(String, String)>,
}
