//! Token definitions for the Parsley lexer.
//!
//! A token is immutable once emitted. `literal` is always the exact source
//! slice, so that the token stream interleaved with the skipped whitespace
//! and comments reproduces the input byte for byte.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

/// Closed set of token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Keywords
    Let,
    Fn,
    Return,
    Check,
    Export,
    Stop,
    Skip,
    If,
    Else,
    For,
    In,
    Try,
    Import,
    As,
    Not,
    And,
    Or,
    Is,
    Like,
    Between,
    By,
    Null,
    True,
    False,

    // Identifiers and literals
    Ident,
    Int,
    Float,
    Str,
    Template,
    RawTemplate,
    Regex,
    Money,
    Datetime,
    Date,
    Time,
    Duration,
    Now,
    PathLit,
    UrlLit,
    StdlibPath,
    PathTemplate,
    UrlTemplate,
    DatetimeTemplate,
    Connection,
    EnvRoot,

    // DSL keywords (`@schema`, `@table`, ...)
    SchemaKw,
    TableKw,
    QueryKw,
    InsertKw,
    UpdateKw,
    DeleteKw,
    TransactionKw,

    // Markup
    TagStart,
    TagEnd,
    Tag,
    TagText,
    TagHeaderEnd,
    TagSelfCloseEnd,
    RawInterpStart,

    // Operators
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Concat,
    Eq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    Match,
    NotMatch,
    Question,
    Nullish,
    ReadFrom,
    WriteTo,
    WriteAppend,
    FetchFrom,
    RemoteWrite,
    RemoteWriteAppend,
    QueryOne,
    QueryMany,
    ExecSql,
    ShellPipe,
    PipeRead,
    TermOne,
    TermMany,
    TermOneStrict,
    TermManyStrict,
    TermCount,
    SubqueryArrow,
    Pipe,
    Bang,
    Dot,
    DotDot,
    Ellipsis,
    Comma,
    Colon,
    Semicolon,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,

    Eof,
}

impl TokenKind {
    pub fn is_keyword(&self) -> bool {
        matches!(
            self,
            TokenKind::Let
                | TokenKind::Fn
                | TokenKind::Return
                | TokenKind::Check
                | TokenKind::Export
                | TokenKind::Stop
                | TokenKind::Skip
                | TokenKind::If
                | TokenKind::Else
                | TokenKind::For
                | TokenKind::In
                | TokenKind::Try
                | TokenKind::Import
                | TokenKind::As
                | TokenKind::Not
                | TokenKind::And
                | TokenKind::Or
                | TokenKind::Is
                | TokenKind::Like
                | TokenKind::Between
                | TokenKind::By
                | TokenKind::Null
                | TokenKind::True
                | TokenKind::False
        )
    }
}

pub fn keyword_kind(word: &str) -> Option<TokenKind> {
    Some(match word {
        "let" => TokenKind::Let,
        "fn" => TokenKind::Fn,
        "return" => TokenKind::Return,
        "check" => TokenKind::Check,
        "export" => TokenKind::Export,
        "stop" => TokenKind::Stop,
        "skip" => TokenKind::Skip,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "for" => TokenKind::For,
        "in" => TokenKind::In,
        "try" => TokenKind::Try,
        "import" => TokenKind::Import,
        "as" => TokenKind::As,
        "not" => TokenKind::Not,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "is" => TokenKind::Is,
        "like" => TokenKind::Like,
        "between" => TokenKind::Between,
        "by" => TokenKind::By,
        "null" => TokenKind::Null,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        _ => return None,
    })
}

/// One segment of an interpolated literal. Expression segments carry their
/// raw source text plus the location where it begins, so the parser can
/// compile them in place with correct error positions.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Expr { src: String, line: u32, column: u32 },
}

/// Structured data some token kinds carry beyond their source slice.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    None,
    Int(i64),
    Float(f64),
    /// Unescaped string content, tag names, `@`-literal bodies, connection
    /// kinds.
    Str(String),
    Template(Vec<TemplatePart>),
    Money {
        currency: &'static str,
        minor: i64,
        scale: u8,
    },
    Regex {
        pattern: String,
        flags: String,
    },
    Duration {
        months: i32,
        secs: i64,
    },
    Datetime(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Exact source slice.
    pub literal: String,
    pub line: u32,
    pub column: u32,
    /// Byte offset of the slice within the source.
    pub offset: usize,
    pub blank_lines_before: u32,
    pub leading_comments: Vec<String>,
    /// A comment that began on the same line as the preceding token.
    pub trailing_comment: Option<String>,
    pub payload: Payload,
}

impl Token {
    pub fn eof(line: u32, column: u32, offset: usize) -> Token {
        Token {
            kind: TokenKind::Eof,
            literal: String::new(),
            line,
            column,
            offset,
            blank_lines_before: 0,
            leading_comments: Vec::new(),
            trailing_comment: None,
            payload: Payload::None,
        }
    }

    pub fn text(&self) -> &str {
        match &self.payload {
            Payload::Str(s) => s,
            _ => &self.literal,
        }
    }
}
