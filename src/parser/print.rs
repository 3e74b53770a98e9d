//! Canonical AST printing, compiled for tests only.
//!
//! Printing is lossy for whitespace and comments but lossless for AST
//! shape: reparsing the printed source yields an identical tree, which is
//! what the parser's round-trip suite checks.

use super::ast::*;

pub(crate) fn print_program(program: &Program) -> String {
    let mut out = String::new();
    for stmt in &program.statements {
        print_stmt(stmt, &mut out, 0);
        out.push('\n');
    }
    out
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("    ");
    }
}

fn print_stmt(stmt: &Stmt, out: &mut String, depth: usize) {
    match stmt {
        Stmt::Let { pattern, value, .. } => {
            out.push_str("let ");
            print_pattern(pattern, out);
            out.push_str(" = ");
            print_expr(value, out, depth);
        }
        Stmt::Assign { targets, value, .. } => {
            for (i, t) in targets.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                print_pattern(t, out);
            }
            out.push_str(" = ");
            print_expr(value, out, depth);
        }
        Stmt::IndexAssign {
            target,
            index,
            value,
            ..
        } => {
            print_expr(target, out, depth);
            out.push('[');
            print_expr(index, out, depth);
            out.push_str("] = ");
            print_expr(value, out, depth);
        }
        Stmt::Return { value, .. } => {
            out.push_str("return");
            if let Some(v) = value {
                out.push(' ');
                print_expr(v, out, depth);
            }
        }
        Stmt::Check { cond, .. } => {
            out.push_str("check ");
            print_expr(cond, out, depth);
        }
        Stmt::Export { names, decl, .. } => match decl {
            Some(inner) => {
                out.push_str("export ");
                print_stmt(inner, out, depth);
            }
            None => {
                out.push_str("export ");
                out.push_str(&names.join(", "));
            }
        },
        Stmt::Stop { cond, .. } => {
            out.push_str("stop");
            if let Some(c) = cond {
                out.push_str(" if ");
                print_expr(c, out, depth);
            }
        }
        Stmt::Skip { cond, .. } => {
            out.push_str("skip");
            if let Some(c) = cond {
                out.push_str(" if ");
                print_expr(c, out, depth);
            }
        }
        Stmt::Read(r) => {
            print_pattern(&r.target, out);
            out.push_str(match r.op {
                ReadOp::Read => " <== ",
                ReadOp::Fetch => " <=/= ",
                ReadOp::PipeRead => " |< ",
                ReadOp::QueryOne => " <=?=> ",
                ReadOp::QueryMany => " <=??=> ",
                ReadOp::Exec => " <=!=> ",
            });
            print_expr(&r.source, out, depth);
            if let Some(params) = &r.params {
                out.push(' ');
                print_expr(params, out, depth);
            }
        }
        Stmt::Write(w) => {
            print_expr(&w.value, out, depth);
            out.push_str(match w.op {
                WriteOp::Write => " ==> ",
                WriteOp::Append => " ==>> ",
                WriteOp::RemoteWrite => " =/=> ",
                WriteOp::RemoteAppend => " =/=>> ",
            });
            print_expr(&w.target, out, depth);
        }
        Stmt::Expr { expr, .. } => print_expr(expr, out, depth),
        Stmt::Block { block, .. } => print_block(block, out, depth),
    }
}

fn print_block(block: &Block, out: &mut String, depth: usize) {
    out.push_str("{\n");
    for stmt in &block.statements {
        indent(out, depth + 1);
        print_stmt(stmt, out, depth + 1);
        out.push('\n');
    }
    indent(out, depth);
    out.push('}');
}

fn print_pattern(pattern: &Pattern, out: &mut String) {
    match pattern {
        Pattern::Name(n) => out.push_str(n),
        Pattern::Dict { entries, rest } => {
            out.push('{');
            let mut first = true;
            for e in entries {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                out.push_str(&e.key);
                if let Some(alias) = &e.alias {
                    out.push_str(" as ");
                    out.push_str(alias);
                }
                if let Some(nested) = &e.nested {
                    out.push_str(": ");
                    print_pattern(nested, out);
                }
            }
            if let Some(r) = rest {
                if !first {
                    out.push_str(", ");
                }
                out.push_str("...");
                out.push_str(r);
            }
            out.push('}');
        }
        Pattern::Array { items, rest } => {
            out.push('[');
            let mut first = true;
            for item in items {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                print_pattern(item, out);
            }
            if let Some(r) = rest {
                if !first {
                    out.push_str(", ");
                }
                out.push_str("...");
                out.push_str(r);
            }
            out.push(']');
        }
    }
}

fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

fn print_expr(expr: &Expr, out: &mut String, depth: usize) {
    match expr {
        Expr::Null(_) => out.push_str("null"),
        Expr::Bool { value, .. } => out.push_str(if *value { "true" } else { "false" }),
        Expr::Int { value, .. } => out.push_str(&value.to_string()),
        Expr::Float { value, .. } => out.push_str(&value.to_string()),
        Expr::Str { value, .. } => {
            out.push('"');
            out.push_str(&escape_string(value));
            out.push('"');
        }
        Expr::Template { kind, parts, .. } => match kind {
            TemplateKind::String => {
                out.push('`');
                print_template_parts(parts, out, depth, "@{", "}");
                out.push('`');
            }
            _ => {
                out.push_str("@(");
                print_template_parts(parts, out, depth, "{", "}");
                out.push(')');
            }
        },
        Expr::Regex { pattern, flags, .. } => {
            out.push('/');
            out.push_str(pattern);
            out.push('/');
            out.push_str(flags);
        }
        Expr::Money {
            currency,
            minor,
            scale,
            ..
        } => {
            let m = crate::money::Money {
                currency: *currency,
                minor: *minor,
                scale: *scale,
            };
            out.push_str(&m.to_string());
        }
        Expr::Datetime { value, .. } => {
            out.push('@');
            out.push_str(&value.format("%Y-%m-%dT%H:%M:%SZ").to_string());
        }
        Expr::Date { value, .. } => {
            out.push('@');
            out.push_str(&value.to_string());
        }
        Expr::Time { value, .. } => {
            out.push('@');
            out.push_str(&value.to_string());
        }
        Expr::Duration { months, secs, .. } => {
            out.push('@');
            let rendered = crate::value::Value::Duration {
                months: *months,
                secs: *secs,
            }
            .to_display_string();
            out.push_str(&rendered);
        }
        Expr::Now { kind, .. } => out.push_str(match kind {
            NowKind::Now => "@now",
            NowKind::TimeNow => "@timeNow",
            NowKind::DateNow => "@dateNow",
            NowKind::Today => "@today",
        }),
        Expr::PathLit { text, .. } => {
            out.push('@');
            out.push_str(text);
        }
        Expr::UrlLit { text, .. } => {
            out.push('@');
            out.push_str(text);
        }
        Expr::StdlibPath { text, .. } => {
            out.push('@');
            out.push_str(text);
        }
        Expr::Connection { kind, args, .. } => {
            out.push('@');
            out.push_str(kind);
            if !args.is_empty() {
                out.push('(');
                print_comma_exprs(args, out, depth);
                out.push(')');
            }
        }
        Expr::EnvRoot { which, .. } => {
            out.push('@');
            out.push_str(which);
        }
        Expr::Ident { name, .. } => out.push_str(name),
        Expr::Prefix { op, operand, .. } => {
            out.push_str(match op {
                PrefixOp::Neg => "-",
                PrefixOp::Not => "not ",
            });
            print_expr(operand, out, depth);
        }
        Expr::Infix {
            op, left, right, ..
        } => {
            // Parenthesise to keep shape stable regardless of precedence.
            out.push('(');
            print_expr(left, out, depth);
            out.push_str(match op {
                InfixOp::Add => " + ",
                InfixOp::Sub => " - ",
                InfixOp::Mul => " * ",
                InfixOp::Div => " / ",
                InfixOp::Rem => " % ",
                InfixOp::Concat => " ++ ",
                InfixOp::Range => " .. ",
                InfixOp::Eq => " == ",
                InfixOp::NotEq => " != ",
                InfixOp::Lt => " < ",
                InfixOp::Gt => " > ",
                InfixOp::Le => " <= ",
                InfixOp::Ge => " >= ",
                InfixOp::And => " and ",
                InfixOp::Or => " or ",
                InfixOp::Nullish => " ?? ",
                InfixOp::In => " in ",
                InfixOp::NotIn => " not in ",
                InfixOp::Match => " ~ ",
                InfixOp::NotMatch => " !~ ",
                InfixOp::QueryOne => " <=?=> ",
                InfixOp::QueryMany => " <=??=> ",
                InfixOp::ExecSql => " <=!=> ",
                InfixOp::ShellPipe => " <=#=> ",
            });
            print_expr(right, out, depth);
            out.push(')');
        }
        Expr::Call { callee, args, .. } => {
            print_expr(callee, out, depth);
            out.push('(');
            print_comma_exprs(args, out, depth);
            out.push(')');
        }
        Expr::Index { target, index, .. } => {
            print_expr(target, out, depth);
            out.push('[');
            print_expr(index, out, depth);
            out.push(']');
        }
        Expr::Slice {
            target, from, to, ..
        } => {
            print_expr(target, out, depth);
            out.push('[');
            if let Some(f) = from {
                print_expr(f, out, depth);
            }
            out.push_str("..");
            if let Some(t) = to {
                print_expr(t, out, depth);
            }
            out.push(']');
        }
        Expr::Dot { target, field, .. } => {
            print_expr(target, out, depth);
            out.push('.');
            out.push_str(field);
        }
        // Grouping parens are re-synthesised around infix forms, so the
        // node itself prints transparently; this keeps printing idempotent.
        Expr::Grouped { inner, .. } => print_expr(inner, out, depth),
        Expr::If {
            cond,
            then,
            elifs,
            alternative,
            ..
        } => {
            out.push_str("if ");
            print_expr(cond, out, depth);
            out.push(' ');
            print_block(then, out, depth);
            for (c, b) in elifs {
                out.push_str(" else if ");
                print_expr(c, out, depth);
                out.push(' ');
                print_block(b, out, depth);
            }
            if let Some(alt) = alternative {
                out.push_str(" else ");
                print_block(alt, out, depth);
            }
        }
        Expr::For {
            bindings,
            iterable,
            body,
            ..
        } => {
            out.push_str("for ");
            out.push_str(&bindings.join(", "));
            out.push_str(" in ");
            print_expr(iterable, out, depth);
            out.push(' ');
            print_block(body, out, depth);
        }
        Expr::Try { call, .. } => {
            out.push_str("try ");
            print_expr(call, out, depth);
        }
        Expr::Import { path, alias, .. } => {
            out.push_str("import ");
            match path {
                ImportPath::Static(p) => {
                    out.push('@');
                    out.push_str(p);
                }
                ImportPath::Dynamic(parts) => {
                    out.push_str("@(");
                    print_template_parts(parts, out, depth, "{", "}");
                    out.push(')');
                }
            }
            if let Some(a) = alias {
                out.push_str(" as ");
                out.push_str(a);
            }
        }
        Expr::Function {
            name,
            params,
            rest,
            body,
            ..
        } => {
            out.push_str("fn");
            if let Some(n) = name {
                out.push(' ');
                out.push_str(n);
            }
            out.push('(');
            out.push_str(&params.join(", "));
            if let Some(r) = rest {
                if !params.is_empty() {
                    out.push_str(", ");
                }
                out.push_str("...");
                out.push_str(r);
            }
            out.push_str(") ");
            print_block(body, out, depth);
        }
        Expr::Dict { entries, .. } => {
            out.push('{');
            let mut first = true;
            for (key, value) in entries {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                match key {
                    DictKey::Ident(k) => out.push_str(k),
                    DictKey::Str(k) => {
                        out.push('"');
                        out.push_str(&escape_string(k));
                        out.push('"');
                    }
                }
                out.push_str(": ");
                print_expr(value, out, depth);
            }
            out.push('}');
        }
        Expr::Array { items, .. } => {
            out.push('[');
            print_comma_exprs(items, out, depth);
            out.push(']');
        }
        Expr::TagPair {
            name,
            attrs,
            children,
            ..
        } => {
            out.push('<');
            out.push_str(name);
            print_attrs(attrs, out, depth);
            out.push('>');
            for child in children {
                match child {
                    TagChild::Text(t) => out.push_str(t),
                    TagChild::Tag(t) => print_expr(t, out, depth),
                    TagChild::Interp(block) => {
                        out.push('{');
                        for (i, stmt) in block.statements.iter().enumerate() {
                            if i > 0 {
                                out.push_str("; ");
                            }
                            print_stmt(stmt, out, depth);
                        }
                        out.push('}');
                    }
                    TagChild::RawInterp(e) => {
                        out.push_str("@{");
                        print_expr(e, out, depth);
                        out.push('}');
                    }
                }
            }
            out.push_str("</");
            out.push_str(name);
            out.push('>');
        }
        Expr::TagLiteral { name, attrs, .. } => {
            out.push('<');
            out.push_str(name);
            print_attrs(attrs, out, depth);
            out.push_str("/>");
        }
        Expr::Query(q) => print_query(q, out, depth),
        Expr::Insert(i) => {
            out.push_str("@insert(");
            out.push_str(&i.table);
            out.push(' ');
            print_assignments(&i.assignments, out, depth);
            out.push(' ');
            out.push_str(terminal_str(i.terminal));
            out.push(')');
        }
        Expr::Update(u) => {
            out.push_str("@update(");
            out.push_str(&u.table);
            if let Some(c) = &u.condition {
                out.push_str(" | ");
                print_cond(c, out, depth);
            }
            out.push(' ');
            print_assignments(&u.assignments, out, depth);
            out.push(' ');
            out.push_str(terminal_str(u.terminal));
            out.push(')');
        }
        Expr::Delete(d) => {
            out.push_str("@delete(");
            out.push_str(&d.table);
            if let Some(c) = &d.condition {
                out.push_str(" | ");
                print_cond(c, out, depth);
            }
            out.push(' ');
            out.push_str(terminal_str(d.terminal));
            out.push(')');
        }
        Expr::Transaction(t) => {
            out.push_str("@transaction(");
            for (i, stmt) in t.body.statements.iter().enumerate() {
                if i > 0 {
                    out.push_str("; ");
                }
                print_stmt(stmt, out, depth);
            }
            out.push(')');
        }
        Expr::Schema(s) => {
            out.push_str("@schema(");
            out.push_str(&s.name);
            out.push_str(" {");
            for (i, (field, ty)) in s.fields.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push(' ');
                out.push_str(field);
                out.push_str(": ");
                out.push_str(ty);
            }
            out.push_str(" })");
        }
        Expr::TableRef { name, .. } => {
            out.push_str("@table(");
            out.push_str(name);
            out.push(')');
        }
    }
}

fn print_attrs(attrs: &[TagAttr], out: &mut String, depth: usize) {
    for attr in attrs {
        out.push(' ');
        out.push_str(&attr.name);
        if let Some(v) = &attr.value {
            out.push('=');
            match v {
                Expr::Str { value, .. } => {
                    out.push('"');
                    out.push_str(&escape_string(value));
                    out.push('"');
                }
                other => {
                    out.push('{');
                    print_expr(other, out, depth);
                    out.push('}');
                }
            }
        }
    }
}

fn print_comma_exprs(items: &[Expr], out: &mut String, depth: usize) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        print_expr(item, out, depth);
    }
}

fn print_template_parts(
    parts: &[TemplateSeg],
    out: &mut String,
    depth: usize,
    open: &str,
    close: &str,
) {
    for part in parts {
        match part {
            TemplateSeg::Text(t) => out.push_str(t),
            TemplateSeg::Expr(e) => {
                out.push_str(open);
                print_expr(e, out, depth);
                out.push_str(close);
            }
        }
    }
}

fn terminal_str(terminal: QueryTerminal) -> &'static str {
    match terminal {
        QueryTerminal::One => "?->",
        QueryTerminal::Many => "??->",
        QueryTerminal::OneStrict => "?!->",
        QueryTerminal::ManyStrict => "??!->",
        QueryTerminal::Count => ".->",
        QueryTerminal::Execute => ".",
    }
}

fn print_query(q: &QueryExpr, out: &mut String, depth: usize) {
    out.push_str("@query(");
    for (i, block) in q.blocks.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        out.push_str(&block.source);
        if let Some(a) = &block.alias {
            out.push_str(" as ");
            out.push_str(a);
        }
        for pipe in &block.pipes {
            out.push_str(" | ");
            match pipe {
                QueryPipe::Where(c) => print_cond(c, out, depth),
                QueryPipe::Sort { fields } => {
                    out.push_str("sort ");
                    for (i, (f, desc)) in fields.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(f);
                        if *desc {
                            out.push_str(" desc");
                        }
                    }
                }
                QueryPipe::Limit(e) => {
                    out.push_str("limit ");
                    print_pipe_value(e, out, depth);
                }
                QueryPipe::Offset(e) => {
                    out.push_str("offset ");
                    print_pipe_value(e, out, depth);
                }
                QueryPipe::Select(fields) => {
                    out.push_str("select ");
                    out.push_str(&fields.join(", "));
                }
                QueryPipe::Computed { name, expr } => {
                    out.push_str(name);
                    out.push_str(" = ");
                    print_pipe_value(expr, out, depth);
                }
            }
        }
        if !block.group_by.is_empty() {
            out.push_str(" + by ");
            out.push_str(&block.group_by.join(", "));
        }
    }
    out.push(' ');
    out.push_str(terminal_str(q.terminal));
    out.push(')');
}

/// Pipe values print braced unless they are simple literals, mirroring how
/// the grammar reads them back.
fn print_pipe_value(e: &Expr, out: &mut String, depth: usize) {
    match e {
        Expr::Int { .. } | Expr::Float { .. } | Expr::Str { .. } | Expr::Bool { .. } => {
            print_expr(e, out, depth)
        }
        other => {
            out.push('{');
            print_expr(other, out, depth);
            out.push('}');
        }
    }
}

fn print_cond(cond: &Cond, out: &mut String, depth: usize) {
    match cond {
        Cond::Cmp { column, op, value } => {
            out.push_str(column);
            out.push_str(match op {
                CmpOp::Eq => " == ",
                CmpOp::NotEq => " != ",
                CmpOp::Lt => " < ",
                CmpOp::Gt => " > ",
                CmpOp::Le => " <= ",
                CmpOp::Ge => " >= ",
                CmpOp::In => " in ",
                CmpOp::NotIn => " not in ",
            });
            print_cond_value(value, out, depth);
        }
        Cond::IsNull { column, negated } => {
            out.push_str(column);
            out.push_str(if *negated { " is not null" } else { " is null" });
        }
        Cond::Like {
            column,
            value,
            negated,
        } => {
            out.push_str(column);
            out.push_str(if *negated { " not like " } else { " like " });
            print_cond_value(value, out, depth);
        }
        Cond::Between { column, low, high } => {
            out.push_str(column);
            out.push_str(" between ");
            print_cond_value(low, out, depth);
            out.push_str(" and ");
            print_cond_value(high, out, depth);
        }
        Cond::In {
            column,
            values,
            negated,
        } => {
            out.push_str(column);
            out.push_str(if *negated { " not in [" } else { " in [" });
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                print_cond_value(v, out, depth);
            }
            out.push(']');
        }
        Cond::Subquery { column, op, query } => {
            out.push_str(column);
            out.push_str(match op {
                CmpOp::In => " in ",
                CmpOp::NotIn => " not in ",
                CmpOp::Eq => " == ",
                CmpOp::NotEq => " != ",
                CmpOp::Lt => " < ",
                CmpOp::Gt => " > ",
                CmpOp::Le => " <= ",
                CmpOp::Ge => " >= ",
            });
            out.push_str("<-");
            out.push_str(&query.block.source);
            out.push('(');
            for pipe in &query.block.pipes {
                out.push_str("| ");
                match pipe {
                    QueryPipe::Where(c) => print_cond(c, out, depth),
                    QueryPipe::Select(fields) => {
                        out.push_str("select ");
                        out.push_str(&fields.join(", "));
                    }
                    _ => {}
                }
                out.push(' ');
            }
            out.push_str(terminal_str(query.terminal));
            out.push(')');
        }
        Cond::Not(inner) => {
            out.push_str("not ");
            out.push('(');
            print_cond(inner, out, depth);
            out.push(')');
        }
        Cond::And(a, b) => {
            out.push('(');
            print_cond(a, out, depth);
            out.push_str(" and ");
            print_cond(b, out, depth);
            out.push(')');
        }
        Cond::Or(a, b) => {
            out.push('(');
            print_cond(a, out, depth);
            out.push_str(" or ");
            print_cond(b, out, depth);
            out.push(')');
        }
    }
}

fn print_cond_value(value: &CondValue, out: &mut String, depth: usize) {
    match value {
        CondValue::Column(c) => out.push_str(c),
        CondValue::Host(e) => {
            out.push('{');
            print_expr(e, out, depth);
            out.push('}');
        }
    }
}
