//! The in-browser error diagnostic.
//!
//! Development mode renders a styled HTML page with the error class, the
//! path relative to the base directory, a hint block, and a highlighted
//! source excerpt. Production renders a minimal 500. A failure while
//! rendering the page itself falls back to plain text with both failures
//! reported.

use std::path::Path;

use crate::error::{BasilError, Diagnostic};

/// Lines of context either side of the error line in the excerpt.
const EXCERPT_CONTEXT: usize = 4;

const PAGE_STYLE: &str = r#"
body { font-family: ui-monospace, 'SF Mono', Menlo, Consolas, monospace;
       background: #1c1b22; color: #e6e4ef; margin: 0; padding: 2rem; }
.wrap { max-width: 60rem; margin: 0 auto; }
.badge { display: inline-block; padding: 0.2rem 0.7rem; border-radius: 0.3rem;
         font-weight: bold; text-transform: uppercase; font-size: 0.8rem; }
.badge.parse { background: #7c3aed; } .badge.type { background: #b45309; }
.badge.value { background: #0e7490; } .badge.runtime { background: #be123c; }
.badge.io { background: #4d7c0f; }
h1 { font-size: 1.1rem; margin: 1rem 0 0.2rem; }
.loc { color: #a8a4bd; margin-bottom: 1rem; }
.hints { background: #2a2835; border-left: 3px solid #7c3aed; padding: 0.6rem 1rem;
         margin: 1rem 0; border-radius: 0 0.3rem 0.3rem 0; }
.hints div::before { content: "hint: "; color: #a78bfa; }
pre.excerpt { background: #141319; padding: 1rem; border-radius: 0.4rem;
              overflow-x: auto; line-height: 1.5; }
.line { display: block; white-space: pre; }
.line .no { display: inline-block; width: 3.5rem; color: #5d5a70; user-select: none; }
.line.error { background: #3b1d2a; }
.line.error .no { color: #f472b6; }
.kw { color: #c4b5fd; } .str { color: #86efac; } .num { color: #fca5a5; }
.tag { color: #7dd3fc; } .cmt { color: #6b6880; font-style: italic; }
.fnc { color: #fcd34d; }
.cause { margin-top: 1.5rem; color: #a8a4bd; }
.candidates { color: #a8a4bd; } .candidates li { margin: 0.2rem 0; }
"#;

/// Render a structured error as the development error page.
///
/// Rendering itself can fault (formatter failures while assembling the
/// page); the pipeline falls back to [`render_double_fault`] in that case.
pub fn render_error_page(
    diagnostic: &Diagnostic,
    source_path: &Path,
    base_dir: &Path,
    source_text: Option<&str>,
) -> Result<String, BasilError> {
    use std::fmt::Write;

    let relative = display_path(source_path, base_dir);
    let class = diagnostic.class.as_str();
    let mut body = String::new();

    write!(
        body,
        "<span class=\"badge {class}\">{class} error</span>\n<h1>{}</h1>\n",
        escape_html(diagnostic.first_line())
    )?;
    write!(
        body,
        "<div class=\"loc\">{}:{}:{} &middot; {}</div>\n",
        escape_html(&relative),
        diagnostic.line,
        diagnostic.column,
        escape_html(&diagnostic.code)
    )?;

    if !diagnostic.hints.is_empty() {
        body.push_str("<div class=\"hints\">");
        for hint in &diagnostic.hints {
            write!(body, "<div>{}</div>", escape_html(hint))?;
        }
        body.push_str("</div>\n");
    }

    if let Some(text) = source_text {
        body.push_str(&render_excerpt(text, diagnostic.line as usize));
    }

    let mut cause = diagnostic.cause.as_deref();
    while let Some(c) = cause {
        write!(
            body,
            "<div class=\"cause\">caused by: {} [{}] at {}:{}</div>\n",
            escape_html(c.first_line()),
            escape_html(&c.code),
            c.line,
            c.column
        )?;
        cause = c.cause.as_deref();
    }

    Ok(page("Script error", &body))
}

/// The development 404 page: the request path, the filesystem candidates
/// that were checked, and a hint.
pub fn render_404_page(request_path: &str, candidates: &[std::path::PathBuf], base_dir: &Path) -> String {
    let mut body = String::new();
    body.push_str("<span class=\"badge runtime\">not found</span>\n");
    body.push_str(&format!(
        "<h1>No handler for {}</h1>\n",
        escape_html(request_path)
    ));
    if candidates.is_empty() {
        body.push_str("<div class=\"loc\">No route table entry matched.</div>\n");
    } else {
        body.push_str("<div class=\"candidates\">Checked, in order:<ul>");
        for candidate in candidates {
            body.push_str(&format!(
                "<li>{}</li>",
                escape_html(&display_path(candidate, base_dir))
            ));
        }
        body.push_str("</ul></div>\n");
    }
    body.push_str(
        "<div class=\"hints\"><div>create an index.pars in the nearest directory, \
         or add a route for this path</div></div>\n",
    );
    page("Not found", &body)
}

/// Production error page: deliberately minimal.
pub fn render_minimal_500() -> String {
    "<!doctype html><html><head><title>500</title></head>\
     <body><h1>500 — internal server error</h1></body></html>"
        .to_string()
}

/// Second-order fallback: the error page itself faulted. Development mode
/// reports both failures side by side as plain text; production callers
/// use [`render_minimal_500`] instead.
pub fn render_double_fault(original: &Diagnostic, render_failure: &str) -> String {
    format!(
        "basil: handler failed AND the error page failed to render.\n\n\
         original error: {original}\n\nerror page failure: {render_failure}\n"
    )
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{}</title>\n<style>{}</style>\n</head>\n\
         <body><div class=\"wrap\">\n{}\n</div></body>\n</html>\n",
        escape_html(title),
        PAGE_STYLE,
        body
    )
}

fn display_path(path: &Path, base_dir: &Path) -> String {
    path.strip_prefix(base_dir)
        .unwrap_or(path)
        .display()
        .to_string()
}

fn render_excerpt(source: &str, error_line: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    if lines.is_empty() || error_line == 0 {
        return String::new();
    }
    let error_idx = (error_line - 1).min(lines.len().saturating_sub(1));
    let start = error_idx.saturating_sub(EXCERPT_CONTEXT);
    let end = (error_idx + EXCERPT_CONTEXT + 1).min(lines.len());

    let mut out = String::from("<pre class=\"excerpt\">");
    for (idx, line) in lines[start..end].iter().enumerate() {
        let lineno = start + idx + 1;
        let class = if lineno == error_line { "line error" } else { "line" };
        out.push_str(&format!(
            "<span class=\"{class}\"><span class=\"no\">{lineno}</span>{}</span>",
            highlight_line(line)
        ));
    }
    out.push_str("</pre>\n");
    out
}

const KEYWORDS: &[&str] = &[
    "let", "fn", "return", "check", "export", "stop", "skip", "if", "else", "for", "in",
    "try", "import", "as", "not", "and", "or", "is", "like", "between", "by", "null",
    "true", "false",
];

/// Lightweight per-line highlighter for the excerpt: keywords, strings,
/// numbers, tags, comments, and function calls.
fn highlight_line(line: &str) -> String {
    let chars: Vec<char> = line.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        // Comment: the rest of the line.
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            let rest: String = chars[i..].iter().collect();
            out.push_str(&format!("<span class=\"cmt\">{}</span>", escape_html(&rest)));
            break;
        }
        // String literal.
        if c == '"' || c == '\'' || c == '`' {
            let quote = c;
            let mut j = i + 1;
            while j < chars.len() {
                if chars[j] == '\\' {
                    j += 2;
                    continue;
                }
                if chars[j] == quote {
                    j += 1;
                    break;
                }
                j += 1;
            }
            let lit: String = chars[i..j.min(chars.len())].iter().collect();
            out.push_str(&format!("<span class=\"str\">{}</span>", escape_html(&lit)));
            i = j;
            continue;
        }
        // Tag.
        if c == '<'
            && chars
                .get(i + 1)
                .map(|n| n.is_alphabetic() || *n == '/')
                .unwrap_or(false)
        {
            let mut j = i + 1;
            while j < chars.len() && chars[j] != '>' && chars[j] != ' ' {
                j += 1;
            }
            let tag: String = chars[i..j].iter().collect();
            out.push_str(&format!("<span class=\"tag\">{}</span>", escape_html(&tag)));
            i = j;
            continue;
        }
        // Number.
        if c.is_ascii_digit() {
            let mut j = i;
            while j < chars.len()
                && (chars[j].is_ascii_digit() || chars[j] == '_' || chars[j] == '.')
            {
                j += 1;
            }
            let num: String = chars[i..j].iter().collect();
            out.push_str(&format!("<span class=\"num\">{}</span>", escape_html(&num)));
            i = j;
            continue;
        }
        // Word: keyword or function call.
        if c.is_alphabetic() || c == '_' {
            let mut j = i;
            while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            let word: String = chars[i..j].iter().collect();
            if KEYWORDS.contains(&word.as_str()) {
                out.push_str(&format!("<span class=\"kw\">{}</span>", escape_html(&word)));
            } else if chars.get(j) == Some(&'(') {
                out.push_str(&format!("<span class=\"fnc\">{}</span>", escape_html(&word)));
            } else {
                out.push_str(&escape_html(&word));
            }
            i = j;
            continue;
        }
        out.push_str(&escape_html(&c.to_string()));
        i += 1;
    }
    out
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiagnosticClass;
    use std::path::PathBuf;

    #[test]
    fn error_page_shows_relative_path_line_and_excerpt() {
        let base = PathBuf::from("/srv/app");
        let source = PathBuf::from("/srv/app/site/index.pars");
        let diag = Diagnostic::parse("P-DOUBLE-EQ", "expected '=', found '=='")
            .at(1, 7)
            .with_hint("did you mean '='?");
        let html = render_error_page(&diag, &source, &base, Some("let x == 5")).unwrap();
        assert!(html.contains("site/index.pars"));
        assert!(html.contains(":1:7"));
        assert!(html.contains("line error"));
        assert!(html.contains("did you mean"));
        assert!(html.contains("badge parse"));
        // The base directory never leaks into the page.
        assert!(!html.contains("/srv/app"));
    }

    #[test]
    fn excerpt_highlights_the_error_line_with_context() {
        let source = (1..=20)
            .map(|i| format!("let line{i} = {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let excerpt = render_excerpt(&source, 10);
        assert!(excerpt.contains("line error"));
        // Four lines either side.
        assert!(excerpt.contains(">6</span>"));
        assert!(excerpt.contains(">14</span>"));
        assert!(!excerpt.contains(">5</span>"));
    }

    #[test]
    fn messages_are_trimmed_to_the_first_line() {
        let diag = Diagnostic::new(
            DiagnosticClass::Runtime,
            "R-X",
            "first line\ncascade noise\nmore noise",
        );
        let html =
            render_error_page(&diag, Path::new("x.pars"), Path::new("/"), None).unwrap();
        assert!(html.contains("first line"));
        assert!(!html.contains("cascade noise"));
    }

    #[test]
    fn not_found_page_lists_candidates() {
        let base = PathBuf::from("/srv/app");
        let candidates = vec![
            PathBuf::from("/srv/app/site/reports/index.pars"),
            PathBuf::from("/srv/app/site/index.pars"),
        ];
        let html = render_404_page("/reports/2025", &candidates, &base);
        assert!(html.contains("/reports/2025"));
        assert!(html.contains("site/reports/index.pars"));
        assert!(html.contains("hint"));
    }

    #[test]
    fn highlighting_marks_keywords_strings_and_calls() {
        let html = highlight_line(r#"let x = render("title") // note"#);
        assert!(html.contains("<span class=\"kw\">let</span>"));
        assert!(html.contains("<span class=\"fnc\">render</span>"));
        assert!(html.contains("<span class=\"str\">&quot;title&quot;</span>"));
        assert!(html.contains("<span class=\"cmt\">// note</span>"));
    }

    #[test]
    fn double_fault_reports_both_failures() {
        let diag = Diagnostic::runtime("R-X", "original");
        let text = render_double_fault(&diag, "renderer exploded");
        assert!(text.contains("original"));
        assert!(text.contains("renderer exploded"));
    }
}
