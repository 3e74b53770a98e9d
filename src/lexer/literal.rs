//! Literal scanning: strings, templates, numbers, money, regexes, and the
//! `@`-literal family. The `@` prefix covers twenty-odd forms; they are
//! discriminated by an explicit prefix classifier, never by guessing.

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};

use crate::error::Diagnostic;
use crate::money::{currency_by_code, currency_by_symbol, currency_symbols};

use super::{Lexer, Mode, Payload, TemplatePart, TokenKind};

impl Lexer {
    /// Double-quoted string. Honours `\n`, `\t`, `\"`, `\\`; any other
    /// backslash sequence is preserved literally. Line-bounded.
    pub(crate) fn scan_string(&mut self) -> Result<(TokenKind, Payload), Diagnostic> {
        let (line, col) = (self.state.line, self.state.col);
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            match self.rune() {
                None | Some(('\n', _)) => {
                    return Err(Diagnostic::parse("L-STR-UNTERMINATED", "unterminated string")
                        .at(line, col));
                }
                Some(('"', _)) => {
                    self.bump();
                    return Ok((TokenKind::Str, Payload::Str(out)));
                }
                Some(('\\', _)) => {
                    self.bump();
                    match self.rune() {
                        Some(('n', _)) => out.push('\n'),
                        Some(('t', _)) => out.push('\t'),
                        Some(('"', _)) => out.push('"'),
                        Some(('\\', _)) => out.push('\\'),
                        Some((other, _)) => {
                            out.push('\\');
                            out.push(other);
                        }
                        None => continue,
                    }
                    self.bump();
                }
                Some((c, _)) => {
                    out.push(c);
                    self.bump();
                }
            }
        }
    }

    /// Single-quoted raw string with `@{…}` interpolation. Honours only
    /// `\'`, `\\`, `\@`. Line-bounded.
    pub(crate) fn scan_raw_string(&mut self) -> Result<(TokenKind, Payload), Diagnostic> {
        let (line, col) = (self.state.line, self.state.col);
        self.bump(); // opening quote
        let mut parts: Vec<TemplatePart> = Vec::new();
        let mut text = String::new();
        loop {
            match self.rune() {
                None | Some(('\n', _)) => {
                    return Err(Diagnostic::parse(
                        "L-STR-UNTERMINATED",
                        "unterminated raw string",
                    )
                    .at(line, col));
                }
                Some(('\'', _)) => {
                    self.bump();
                    if !text.is_empty() || parts.is_empty() {
                        parts.push(TemplatePart::Text(text));
                    }
                    return Ok((TokenKind::RawTemplate, Payload::Template(parts)));
                }
                Some(('\\', _)) => {
                    self.bump();
                    match self.rune() {
                        Some(('\'', _)) => text.push('\''),
                        Some(('\\', _)) => text.push('\\'),
                        Some(('@', _)) => text.push('@'),
                        Some((other, _)) => {
                            text.push('\\');
                            text.push(other);
                        }
                        None => continue,
                    }
                    self.bump();
                }
                Some(('@', _)) if self.byte(1) == Some(b'{') => {
                    if !text.is_empty() {
                        parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                    }
                    self.eat("@{");
                    parts.push(self.scan_interp_expr(line, col)?);
                }
                Some((c, _)) => {
                    text.push(c);
                    self.bump();
                }
            }
        }
    }

    /// Backtick template. Honours only `` \` ``; may span lines; `@{…}`
    /// interpolates.
    pub(crate) fn scan_template(&mut self) -> Result<(TokenKind, Payload), Diagnostic> {
        let (line, col) = (self.state.line, self.state.col);
        self.bump(); // opening backtick
        let mut parts: Vec<TemplatePart> = Vec::new();
        let mut text = String::new();
        loop {
            match self.rune() {
                None => {
                    return Err(Diagnostic::parse(
                        "L-STR-UNTERMINATED",
                        "unterminated template",
                    )
                    .at(line, col));
                }
                Some(('`', _)) => {
                    self.bump();
                    if !text.is_empty() || parts.is_empty() {
                        parts.push(TemplatePart::Text(text));
                    }
                    return Ok((TokenKind::Template, Payload::Template(parts)));
                }
                Some(('\\', _)) if self.byte(1) == Some(b'`') => {
                    self.eat("\\`");
                    text.push('`');
                }
                Some(('@', _)) if self.byte(1) == Some(b'{') => {
                    if !text.is_empty() {
                        parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                    }
                    self.eat("@{");
                    parts.push(self.scan_interp_expr(line, col)?);
                }
                Some((c, _)) => {
                    text.push(c);
                    self.bump();
                }
            }
        }
    }

    /// The expression inside an `@{…}` or `{…}` island of a literal,
    /// captured as raw source for the parser to compile in place.
    fn scan_interp_expr(
        &mut self,
        open_line: u32,
        open_col: u32,
    ) -> Result<TemplatePart, Diagnostic> {
        let line = self.state.line;
        let column = self.state.col;
        let start = self.state.pos;
        let mut depth = 1u32;
        loop {
            match self.rune() {
                None => {
                    return Err(Diagnostic::parse(
                        "L-INTERP-UNTERMINATED",
                        "unterminated interpolation",
                    )
                    .at(open_line, open_col));
                }
                Some(('{', _)) => {
                    depth += 1;
                    self.bump();
                }
                Some(('}', _)) => {
                    depth -= 1;
                    if depth == 0 {
                        let src = self.slice(start);
                        self.bump();
                        return Ok(TemplatePart::Expr { src, line, column });
                    }
                    self.bump();
                }
                Some(_) => self.bump(),
            }
        }
    }

    /// Numeric literal. `_` separators are allowed; a `.` begins a float
    /// only when followed by a digit (so `0..n` ranges stay intact).
    pub(crate) fn scan_number(&mut self) -> Result<(TokenKind, Payload), Diagnostic> {
        let start = self.state.pos;
        let mut is_float = false;
        while let Some(b) = self.byte(0) {
            match b {
                b'0'..=b'9' | b'_' => self.bump(),
                b'.' if !is_float
                    && self.byte(1).map(|b| b.is_ascii_digit()).unwrap_or(false) =>
                {
                    is_float = true;
                    self.bump();
                }
                _ => break,
            }
        }
        let digits: String = self.slice(start).chars().filter(|c| *c != '_').collect();
        if is_float {
            let v: f64 = digits.parse().unwrap_or(f64::NAN);
            Ok((TokenKind::Float, Payload::Float(v)))
        } else {
            match digits.parse::<i64>() {
                Ok(v) => Ok((TokenKind::Int, Payload::Int(v))),
                // Too large for i64: fall back to float semantics.
                Err(_) => Ok((
                    TokenKind::Float,
                    Payload::Float(digits.parse().unwrap_or(f64::NAN)),
                )),
            }
        }
    }

    /// Regex literal `/pattern/flags`. Only called when the previous token
    /// admits a regex (see `expression_context`).
    pub(crate) fn scan_regex(&mut self) -> Result<(TokenKind, Payload), Diagnostic> {
        let (line, col) = (self.state.line, self.state.col);
        self.bump(); // opening slash
        let mut pattern = String::new();
        loop {
            match self.rune() {
                None | Some(('\n', _)) => {
                    return Err(Diagnostic::parse(
                        "L-REGEX-UNTERMINATED",
                        "unterminated regular expression",
                    )
                    .at(line, col));
                }
                Some(('\\', _)) => {
                    self.bump();
                    if let Some((c, _)) = self.rune() {
                        if c != '/' {
                            pattern.push('\\');
                        }
                        pattern.push(c);
                        self.bump();
                    }
                }
                Some(('/', _)) => {
                    self.bump();
                    break;
                }
                Some((c, _)) => {
                    pattern.push(c);
                    self.bump();
                }
            }
        }
        // Flags are collected verbatim; the evaluator validates them
        // against the supported PCRE subset when the value is built.
        let mut flags = String::new();
        while let Some(b) = self.byte(0) {
            if b.is_ascii_lowercase() {
                flags.push(b as char);
                self.bump();
            } else {
                break;
            }
        }
        Ok((TokenKind::Regex, Payload::Regex { pattern, flags }))
    }

    /// A money literal begins with a currency symbol (`$`, `£`, `CA$`, …)
    /// or a `CODE#` prefix. Returns `None` without consuming anything when
    /// the cursor is not at a money literal.
    pub(crate) fn scan_money_start(
        &mut self,
    ) -> Result<Option<(TokenKind, Payload)>, Diagnostic> {
        // CODE#AMOUNT: an uppercase run directly followed by '#'.
        let rest = &self.src[self.state.pos..];
        let upper_len = rest
            .iter()
            .take_while(|b| b.is_ascii_uppercase())
            .count();
        if (2..=4).contains(&upper_len) && rest.get(upper_len) == Some(&b'#') {
            let code = std::str::from_utf8(&rest[..upper_len]).unwrap_or("");
            if let Some(currency) = currency_by_code(code) {
                self.bump_n(upper_len + 1);
                return self.scan_money_amount(currency).map(Some);
            }
        }
        // Symbol-prefixed, longest symbol first (CA$ before $).
        for symbol in currency_symbols() {
            let digit_follows = self
                .src
                .get(self.state.pos + symbol.len())
                .map(|b| b.is_ascii_digit())
                .unwrap_or(false);
            if self.starts_with(symbol) && digit_follows {
                if let Some(currency) = currency_by_symbol(symbol) {
                    self.bump_n(symbol.chars().count());
                    return self.scan_money_amount(currency).map(Some);
                }
            }
        }
        Ok(None)
    }

    fn scan_money_amount(
        &mut self,
        currency: &'static crate::money::Currency,
    ) -> Result<(TokenKind, Payload), Diagnostic> {
        let (line, col) = (self.state.line, self.state.col);
        let start = self.state.pos;
        while let Some(b) = self.byte(0) {
            if b.is_ascii_digit() || b == b'_' {
                self.bump();
            } else {
                break;
            }
        }
        let whole: String = self.slice(start).chars().filter(|c| *c != '_').collect();
        if whole.is_empty() {
            return Err(
                Diagnostic::value_error("L-MONEY-AMOUNT", "money literal requires an amount")
                    .at(line, col),
            );
        }
        let mut frac = String::new();
        if self.byte(0) == Some(b'.')
            && self.byte(1).map(|b| b.is_ascii_digit()).unwrap_or(false)
        {
            self.bump();
            let fstart = self.state.pos;
            while let Some(b) = self.byte(0) {
                if b.is_ascii_digit() {
                    self.bump();
                } else {
                    break;
                }
            }
            frac = self.slice(fstart);
        }
        if frac.len() > currency.scale as usize {
            return Err(Diagnostic::value_error(
                "L-MONEY-SCALE",
                format!(
                    "{} carries at most {} decimal place(s), found {}",
                    currency.code,
                    currency.scale,
                    frac.len()
                ),
            )
            .at(line, col));
        }
        let scale = currency.scale as u32;
        let whole: i64 = whole.parse().map_err(|_| {
            Diagnostic::value_error("L-MONEY-AMOUNT", "money amount out of range").at(line, col)
        })?;
        let mut minor = whole
            .checked_mul(10_i64.pow(scale))
            .ok_or_else(|| {
                Diagnostic::value_error("L-MONEY-AMOUNT", "money amount out of range")
                    .at(line, col)
            })?;
        if !frac.is_empty() {
            let frac_val: i64 = frac.parse().unwrap_or(0);
            minor += frac_val * 10_i64.pow(scale - frac.len() as u32);
        }
        Ok((
            TokenKind::Money,
            Payload::Money {
                currency: currency.code,
                minor,
                scale: currency.scale,
            },
        ))
    }

    /// Everything after `@`. The literal type is decided by peeking:
    /// keywords, ISO datetimes, durations, paths, URLs, stdlib paths,
    /// parenthesised templates, connections, DSL keywords, and env roots.
    pub(crate) fn scan_at_literal(&mut self) -> Result<(TokenKind, Payload), Diagnostic> {
        let (line, col) = (self.state.line, self.state.col);
        self.bump(); // '@'
        match self.rune() {
            Some(('{', _)) => {
                // `@{` in normal mode only appears inside raw-text islands,
                // which scan.rs handles; elsewhere it is the interpolation
                // opener of a raw literal that was already consumed.
                self.bump();
                self.state.modes.push(Mode::Interp { depth: 1 });
                Ok((TokenKind::RawInterpStart, Payload::None))
            }
            Some(('(', _)) => self.scan_paren_template(line, col),
            Some(('/', _)) | Some(('~', _)) | Some(('.', _)) => self.scan_path_literal(),
            Some(('-', _)) => {
                if self.byte(1).map(|b| b.is_ascii_digit()).unwrap_or(false) {
                    self.scan_duration(line, col)
                } else {
                    self.bump();
                    Ok((TokenKind::PathLit, Payload::Str("-".to_string())))
                }
            }
            Some((c, _)) if c.is_ascii_digit() => self.scan_temporal(line, col),
            Some((c, _)) if c.is_alphabetic() || c == '_' => self.scan_at_word(line, col),
            _ => Err(Diagnostic::parse("L-AT-UNKNOWN", "dangling '@'").at(line, col)),
        }
    }

    fn scan_path_literal(&mut self) -> Result<(TokenKind, Payload), Diagnostic> {
        let start = self.state.pos;
        while let Some((c, _)) = self.rune() {
            if c.is_whitespace() || matches!(c, '(' | ')' | ',' | ';' | '}' | ']' | '"' | '<') {
                break;
            }
            self.bump();
        }
        Ok((TokenKind::PathLit, Payload::Str(self.slice(start))))
    }

    /// `@2025-01-15`, `@2025-01-15T14:30:00Z`, `@14:30:00`, or a duration.
    fn scan_temporal(&mut self, line: u32, col: u32) -> Result<(TokenKind, Payload), Diagnostic> {
        let rest = &self.src[self.state.pos..];
        let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
        match rest.get(digits) {
            Some(b'-') if digits == 4 => self.scan_datetime(line, col),
            Some(b':') => self.scan_time(line, col),
            _ => self.scan_duration(line, col),
        }
    }

    fn scan_datetime(&mut self, line: u32, col: u32) -> Result<(TokenKind, Payload), Diagnostic> {
        let start = self.state.pos;
        while let Some((c, _)) = self.rune() {
            if c.is_ascii_digit() || matches!(c, '-' | ':' | 'T' | 'Z' | '+' | '.') {
                self.bump();
            } else {
                break;
            }
        }
        let text = self.slice(start);
        if text.contains('T') {
            let parsed = chrono::DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.with_timezone(&Utc))
                .or_else(|_| {
                    chrono::NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S")
                        .map(|naive| Utc.from_utc_datetime(&naive))
                })
                .or_else(|_| {
                    chrono::NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M")
                        .map(|naive| Utc.from_utc_datetime(&naive))
                });
            match parsed {
                Ok(dt) => Ok((TokenKind::Datetime, Payload::Datetime(dt))),
                Err(e) => Err(Diagnostic::parse(
                    "L-DATETIME",
                    format!("malformed datetime literal '@{text}': {e}"),
                )
                .at(line, col)),
            }
        } else {
            match NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
                Ok(d) => Ok((TokenKind::Date, Payload::Date(d))),
                Err(e) => Err(Diagnostic::parse(
                    "L-DATE",
                    format!("malformed date literal '@{text}': {e}"),
                )
                .at(line, col)),
            }
        }
    }

    fn scan_time(&mut self, line: u32, col: u32) -> Result<(TokenKind, Payload), Diagnostic> {
        let start = self.state.pos;
        while let Some((c, _)) = self.rune() {
            if c.is_ascii_digit() || c == ':' {
                self.bump();
            } else {
                break;
            }
        }
        let text = self.slice(start);
        let parsed = NaiveTime::parse_from_str(&text, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(&text, "%H:%M"));
        match parsed {
            Ok(t) => Ok((TokenKind::Time, Payload::Time(t))),
            Err(e) => Err(Diagnostic::parse(
                "L-TIME",
                format!("malformed time literal '@{text}': {e}"),
            )
            .at(line, col)),
        }
    }

    /// `@2h30m`, `@-1d`, `@1y6mo`. Calendar units (y, mo) are kept apart
    /// from fixed units so date arithmetic stays calendar-aware.
    fn scan_duration(&mut self, line: u32, col: u32) -> Result<(TokenKind, Payload), Diagnostic> {
        let negative = self.byte(0) == Some(b'-');
        if negative {
            self.bump();
        }
        let mut months: i32 = 0;
        let mut secs: i64 = 0;
        let mut any = false;
        loop {
            let start = self.state.pos;
            while self.byte(0).map(|b| b.is_ascii_digit()).unwrap_or(false) {
                self.bump();
            }
            let digits = self.slice(start);
            if digits.is_empty() {
                break;
            }
            let n: i64 = digits.parse().map_err(|_| {
                Diagnostic::parse("L-DURATION", "duration component out of range").at(line, col)
            })?;
            if self.eat("mo") {
                months += n as i32;
            } else if self.eat("y") {
                months += (n * 12) as i32;
            } else if self.eat("w") {
                secs += n * 604_800;
            } else if self.eat("d") {
                secs += n * 86_400;
            } else if self.eat("h") {
                secs += n * 3_600;
            } else if self.eat("m") {
                secs += n * 60;
            } else if self.eat("s") {
                secs += n;
            } else {
                return Err(Diagnostic::parse(
                    "L-DURATION",
                    "duration component requires a unit (y, mo, w, d, h, m, s)",
                )
                .at(line, col));
            }
            any = true;
        }
        if !any {
            return Err(
                Diagnostic::parse("L-DURATION", "empty duration literal").at(line, col)
            );
        }
        if negative {
            months = -months;
            secs = -secs;
        }
        Ok((TokenKind::Duration, Payload::Duration { months, secs }))
    }

    fn scan_at_word(&mut self, line: u32, col: u32) -> Result<(TokenKind, Payload), Diagnostic> {
        let start = self.state.pos;
        while let Some((c, _)) = self.rune() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        let word = self.slice(start);
        // URL literal: scheme followed by '://'.
        if self.starts_with("://") {
            self.eat("://");
            while let Some((c, _)) = self.rune() {
                if c.is_whitespace() || matches!(c, '(' | ')' | ',' | ';' | '}' | ']' | '"' | '<')
                {
                    break;
                }
                self.bump();
            }
            return Ok((TokenKind::UrlLit, Payload::Str(self.slice(start))));
        }
        // Stdlib path: `@std/...`, `@basil/...`.
        if (word == "std" || word == "basil") && self.byte(0) == Some(b'/') {
            while let Some((c, _)) = self.rune() {
                if c.is_whitespace() || matches!(c, '(' | ')' | ',' | ';' | '}' | ']' | '"' | '<')
                {
                    break;
                }
                self.bump();
            }
            return Ok((TokenKind::StdlibPath, Payload::Str(self.slice(start))));
        }
        let kind = match word.as_str() {
            "now" | "timeNow" | "dateNow" | "today" => TokenKind::Now,
            "env" | "args" | "params" => TokenKind::EnvRoot,
            "sqlite" | "postgres" | "mysql" | "sftp" | "shell" | "DB" | "SEARCH" => {
                TokenKind::Connection
            }
            "schema" => TokenKind::SchemaKw,
            "table" => TokenKind::TableKw,
            "query" => TokenKind::QueryKw,
            "insert" => TokenKind::InsertKw,
            "update" => TokenKind::UpdateKw,
            "delete" => TokenKind::DeleteKw,
            "transaction" => TokenKind::TransactionKw,
            "stdin" | "stdout" | "stderr" => TokenKind::PathLit,
            _ => {
                return Err(Diagnostic::parse(
                    "L-AT-UNKNOWN",
                    format!("unknown @-literal '@{word}'"),
                )
                .at(line, col));
            }
        };
        Ok((kind, Payload::Str(word)))
    }

    /// `@(…)` template, classified as path, URL, or datetime template by
    /// scanning its raw content.
    fn scan_paren_template(
        &mut self,
        line: u32,
        col: u32,
    ) -> Result<(TokenKind, Payload), Diagnostic> {
        self.bump(); // '('
        let mut parts: Vec<TemplatePart> = Vec::new();
        let mut text = String::new();
        let mut shape = String::new();
        let mut depth = 1u32;
        loop {
            match self.rune() {
                None => {
                    return Err(Diagnostic::parse(
                        "L-TEMPLATE-UNTERMINATED",
                        "unterminated @(…) template",
                    )
                    .at(line, col));
                }
                Some(('(', _)) => {
                    depth += 1;
                    text.push('(');
                    shape.push('(');
                    self.bump();
                }
                Some((')', _)) => {
                    depth -= 1;
                    self.bump();
                    if depth == 0 {
                        break;
                    }
                    text.push(')');
                    shape.push(')');
                }
                Some(('{', _)) => {
                    if !text.is_empty() {
                        parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                    }
                    self.bump();
                    parts.push(self.scan_interp_expr(line, col)?);
                }
                Some((c, _)) => {
                    text.push(c);
                    shape.push(c);
                    self.bump();
                }
            }
        }
        if !text.is_empty() || parts.is_empty() {
            parts.push(TemplatePart::Text(text));
        }
        let kind = if shape.contains("://") {
            TokenKind::UrlTemplate
        } else if !shape.is_empty()
            && shape
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '-' | ':' | 'T' | 'Z' | '.' | ' '))
            && shape.chars().any(|c| matches!(c, '-' | ':'))
        {
            TokenKind::DatetimeTemplate
        } else {
            TokenKind::PathTemplate
        };
        Ok((kind, Payload::Template(parts)))
    }
}
