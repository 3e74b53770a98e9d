use super::*;

fn lex_all(src: &str) -> Vec<Token> {
    let mut lexer = Lexer::new(src);
    let mut tokens = Vec::new();
    loop {
        let t = lexer.next_token().expect("lex failure");
        let done = t.kind == TokenKind::Eof;
        tokens.push(t);
        if done {
            break;
        }
    }
    tokens
}

fn kinds(src: &str) -> Vec<TokenKind> {
    lex_all(src).into_iter().map(|t| t.kind).collect()
}

#[test]
fn keywords_and_identifiers() {
    let tokens = lex_all("let visitas = 42");
    assert_eq!(tokens[0].kind, TokenKind::Let);
    assert_eq!(tokens[1].kind, TokenKind::Ident);
    assert_eq!(tokens[1].text(), "visitas");
    assert_eq!(tokens[3].payload, Payload::Int(42));
}

#[test]
fn unicode_identifiers_lex_as_single_tokens() {
    let tokens = lex_all("let café = 1\nlet über_1 = 2");
    assert_eq!(tokens[1].text(), "café");
    assert_eq!(tokens[5].text(), "über_1");
}

#[test]
fn numbers_allow_underscores_and_ranges_survive() {
    let tokens = lex_all("0..1_000_000");
    assert_eq!(tokens[0].payload, Payload::Int(0));
    assert_eq!(tokens[1].kind, TokenKind::DotDot);
    assert_eq!(tokens[2].payload, Payload::Int(1_000_000));
}

#[test]
fn reader_and_query_operators_lex_longest_first() {
    assert_eq!(
        kinds("a <== b")[1],
        TokenKind::ReadFrom,
    );
    assert_eq!(kinds("a <=??=> b")[1], TokenKind::QueryMany);
    assert_eq!(kinds("a <=?=> b")[1], TokenKind::QueryOne);
    assert_eq!(kinds("a <=!=> b")[1], TokenKind::ExecSql);
    assert_eq!(kinds("a <=#=> b")[1], TokenKind::ShellPipe);
    assert_eq!(kinds("a <=/= b")[1], TokenKind::FetchFrom);
    assert_eq!(kinds("a =/=>> b")[1], TokenKind::RemoteWriteAppend);
    assert_eq!(kinds("a ==>> b")[1], TokenKind::WriteAppend);
    assert_eq!(kinds("a ==> b")[1], TokenKind::WriteTo);
    assert_eq!(kinds("a |< b")[1], TokenKind::PipeRead);
    assert_eq!(kinds("a <= b")[1], TokenKind::Le);
}

#[test]
fn query_terminals() {
    assert_eq!(kinds("x ?-> y")[1], TokenKind::TermOne);
    assert_eq!(kinds("x ??-> y")[1], TokenKind::TermMany);
    assert_eq!(kinds("x ?!-> y")[1], TokenKind::TermOneStrict);
    assert_eq!(kinds("x ??!-> y")[1], TokenKind::TermManyStrict);
    assert_eq!(kinds("x .-> y")[1], TokenKind::TermCount);
}

#[test]
fn string_escapes_follow_the_closed_set() {
    let tokens = lex_all(r#""a\nb\t\"c\\d\qe""#);
    assert_eq!(tokens[0].text(), "a\nb\t\"c\\d\\qe");
}

#[test]
fn raw_strings_interpolate_on_at_brace() {
    let tokens = lex_all(r"'hello @{name}!'");
    match &tokens[0].payload {
        Payload::Template(parts) => {
            assert_eq!(parts.len(), 3);
            assert_eq!(parts[0], TemplatePart::Text("hello ".into()));
            assert!(matches!(&parts[1], TemplatePart::Expr { src, .. } if src == "name"));
            assert_eq!(parts[2], TemplatePart::Text("!".into()));
        }
        other => panic!("expected template payload, got {other:?}"),
    }
}

#[test]
fn templates_span_lines() {
    let tokens = lex_all("`line one\nline two`");
    assert_eq!(tokens[0].kind, TokenKind::Template);
    assert!(tokens[0].literal.contains('\n'));
}

#[test]
fn money_symbol_and_code_forms() {
    let tokens = lex_all("$12.34 CA$5 JPY#100");
    assert_eq!(
        tokens[0].payload,
        Payload::Money { currency: "USD", minor: 1234, scale: 2 }
    );
    assert_eq!(
        tokens[1].payload,
        Payload::Money { currency: "CAD", minor: 500, scale: 2 }
    );
    assert_eq!(
        tokens[2].payload,
        Payload::Money { currency: "JPY", minor: 100, scale: 0 }
    );
}

#[test]
fn money_scale_violation_is_rejected() {
    let mut lexer = Lexer::new("JPY#100.50");
    let err = lexer.next_token().unwrap_err();
    assert_eq!(err.class, crate::error::DiagnosticClass::Value);
    assert_eq!(err.code, "L-MONEY-SCALE");
}

#[test]
fn at_literal_classification() {
    assert_eq!(kinds("@now")[0], TokenKind::Now);
    assert_eq!(kinds("@today")[0], TokenKind::Now);
    assert_eq!(kinds("@env")[0], TokenKind::EnvRoot);
    assert_eq!(kinds("@params")[0], TokenKind::EnvRoot);
    assert_eq!(kinds("@sqlite")[0], TokenKind::Connection);
    assert_eq!(kinds("@DB")[0], TokenKind::Connection);
    assert_eq!(kinds("@query")[0], TokenKind::QueryKw);
    assert_eq!(kinds("@/var/log/app.log")[0], TokenKind::PathLit);
    assert_eq!(kinds("@./relative.txt")[0], TokenKind::PathLit);
    assert_eq!(kinds("@stdin")[0], TokenKind::PathLit);
    assert_eq!(kinds("@https://example.com/x")[0], TokenKind::UrlLit);
    assert_eq!(kinds("@std/math")[0], TokenKind::StdlibPath);
    assert_eq!(kinds("@2h30m")[0], TokenKind::Duration);
    assert_eq!(kinds("@-1d")[0], TokenKind::Duration);
    assert_eq!(kinds("@1y6mo")[0], TokenKind::Duration);
    assert_eq!(kinds("@2025-01-15")[0], TokenKind::Date);
    assert_eq!(kinds("@2025-01-15T10:00:00Z")[0], TokenKind::Datetime);
    assert_eq!(kinds("@14:30:00")[0], TokenKind::Time);
}

#[test]
fn duration_components_accumulate() {
    let tokens = lex_all("@1y6mo");
    assert_eq!(tokens[0].payload, Payload::Duration { months: 18, secs: 0 });
    let tokens = lex_all("@2h30m");
    assert_eq!(
        tokens[0].payload,
        Payload::Duration { months: 0, secs: 2 * 3600 + 30 * 60 }
    );
    let tokens = lex_all("@-1d");
    assert_eq!(tokens[0].payload, Payload::Duration { months: 0, secs: -86_400 });
}

#[test]
fn paren_templates_classify_by_content() {
    assert_eq!(kinds("@(/users/{id}/edit)")[0], TokenKind::PathTemplate);
    assert_eq!(
        kinds("@(https://api.example.com/{v}/items)")[0],
        TokenKind::UrlTemplate
    );
    assert_eq!(kinds("@({y}-{m}-{d})")[0], TokenKind::DatetimeTemplate);
}

#[test]
fn regex_context_rule() {
    // After '=' a slash opens a regex: /a/b lexes as one regex with flag b.
    let tokens = lex_all("x = /a/b");
    assert_eq!(tokens[2].kind, TokenKind::Regex);
    assert_eq!(
        tokens[2].payload,
        Payload::Regex { pattern: "a".into(), flags: "b".into() }
    );
    // After an identifier it is division.
    let tokens = lex_all("x / a / b");
    assert_eq!(tokens[1].kind, TokenKind::Slash);
    assert_eq!(tokens[3].kind, TokenKind::Slash);
}

#[test]
fn regex_flags_are_collected_verbatim() {
    let mut lexer = Lexer::new("x = /a/imsx");
    lexer.next_token().unwrap();
    lexer.next_token().unwrap();
    let t = lexer.next_token().unwrap();
    assert_eq!(
        t.payload,
        Payload::Regex { pattern: "a".into(), flags: "imsx".into() }
    );
}

#[test]
fn trivia_blank_lines_and_comments() {
    let src = "let a = 1 // trailing note\n\n\n// leading note\nlet b = 2";
    let tokens = lex_all(src);
    let b_let = tokens.iter().filter(|t| t.kind == TokenKind::Let).nth(1).unwrap();
    assert_eq!(b_let.blank_lines_before, 2);
    assert_eq!(b_let.leading_comments, vec!["// leading note".to_string()]);
    // The comment that shared a line with `1` trails the previous token.
    assert_eq!(b_let.trailing_comment.as_deref(), Some("// trailing note"));
}

#[test]
fn tags_enter_and_exit_markup_mode() {
    let tokens = lex_all("<div class=\"box\">hello</div>");
    let expected = [
        TokenKind::TagStart,
        TokenKind::Ident,
        TokenKind::Assign,
        TokenKind::Str,
        TokenKind::TagHeaderEnd,
        TokenKind::TagText,
        TokenKind::TagEnd,
        TokenKind::Eof,
    ];
    assert_eq!(
        tokens.iter().map(|t| t.kind).collect::<Vec<_>>(),
        expected
    );
    assert_eq!(tokens[0].text(), "div");
    assert_eq!(tokens[5].text(), "hello");
    assert_eq!(tokens[6].text(), "div");
}

#[test]
fn self_closing_tags_do_not_enter_content_mode() {
    let tokens = lex_all("<br/> + 1");
    assert_eq!(tokens[0].kind, TokenKind::TagStart);
    assert_eq!(tokens[1].kind, TokenKind::TagSelfCloseEnd);
    assert_eq!(tokens[2].kind, TokenKind::Plus);
}

#[test]
fn tag_content_braces_open_interpolation_islands() {
    let tokens = lex_all("<p>count: {n + 1}</p>");
    let ks: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
    assert_eq!(
        ks,
        vec![
            TokenKind::TagStart,
            TokenKind::TagHeaderEnd,
            TokenKind::TagText,
            TokenKind::LBrace,
            TokenKind::Ident,
            TokenKind::Plus,
            TokenKind::Int,
            TokenKind::RBrace,
            TokenKind::TagEnd,
            TokenKind::Eof,
        ]
    );
}

#[test]
fn style_bodies_lex_as_raw_text_with_at_islands() {
    let tokens = lex_all("<style>.a { color: red } @{theme}</style>");
    let ks: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
    assert_eq!(
        ks,
        vec![
            TokenKind::TagStart,
            TokenKind::TagHeaderEnd,
            TokenKind::TagText,
            TokenKind::RawInterpStart,
            TokenKind::Ident,
            TokenKind::RBrace,
            TokenKind::TagText,
            TokenKind::TagEnd,
            TokenKind::Eof,
        ]
    );
    // Braces inside the raw body stayed literal.
    assert!(tokens[2].text().contains("{ color: red }"));
}

#[test]
fn nested_tags_track_depth() {
    let tokens = lex_all("<ul><li>one</li></ul>");
    let ends: Vec<&str> = tokens
        .iter()
        .filter(|t| t.kind == TokenKind::TagEnd)
        .map(|t| t.text())
        .collect();
    assert_eq!(ends, vec!["li", "ul"]);
}

#[test]
fn save_restore_is_byte_identical() {
    let src = r#"let x = <div a={1+2}>text @now</div>
let y = $1.50 ++ `tpl @{x}` // note
for i in 0..10 { skip if i ~ /odd/i; i }"#;
    let mut reference = Lexer::new(src);
    // Advance a few tokens, snapshot, drain, restore, drain again.
    for _ in 0..5 {
        reference.next_token().unwrap();
    }
    let snapshot = reference.save();
    let mut first: Vec<Token> = Vec::new();
    loop {
        match reference.next_token() {
            Ok(t) => {
                let done = t.kind == TokenKind::Eof;
                first.push(t);
                if done || first.len() >= 1000 {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    reference.restore(snapshot);
    let mut second: Vec<Token> = Vec::new();
    loop {
        match reference.next_token() {
            Ok(t) => {
                let done = t.kind == TokenKind::Eof;
                second.push(t);
                if done || second.len() >= 1000 {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    assert_eq!(first, second);
}

#[test]
fn token_literals_reproduce_the_source() {
    // Round-trip: every token's literal is the exact source slice, and the
    // slices are non-overlapping and in order; the gaps are whitespace and
    // comment trivia.
    let src = "let a = 1 // note\n\nlet b = \"two\" ++ `t@{a}`\n<p>hi {a}</p>\n";
    let tokens = lex_all(src);
    let mut cursor = 0usize;
    for t in &tokens {
        if t.kind == TokenKind::Eof {
            break;
        }
        assert!(t.offset >= cursor, "token slices must not overlap");
        let slice = &src[t.offset..t.offset + t.literal.len()];
        assert_eq!(slice, t.literal, "literal must be the exact source slice");
        for gap_ch in src[cursor..t.offset].chars() {
            assert!(
                gap_ch.is_whitespace() || gap_ch == '/' || !t.leading_comments.is_empty()
                    || t.trailing_comment.is_some()
                    || src[cursor..t.offset].contains("//"),
                "gaps contain only trivia"
            );
        }
        cursor = t.offset + t.literal.len();
    }
}

#[test]
fn unterminated_string_is_illegal() {
    let mut lexer = Lexer::new("\"oops\nnext");
    let err = lexer.next_token().unwrap_err();
    assert_eq!(err.code, "L-STR-UNTERMINATED");
}

#[test]
fn empty_tag_is_self_closing() {
    let tokens = lex_all("<>");
    assert_eq!(tokens[0].kind, TokenKind::Tag);
    assert_eq!(tokens[0].text(), "");
}
