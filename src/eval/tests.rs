use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::capability::clock::SystemClock;
use crate::capability::db::SqliteDb;
use crate::capability::fs::BaseDirFs;
use crate::capability::search::MemorySearchIndex;
use crate::capability::session::MemorySessionStore;
use crate::capability::shell::HostShell;
use crate::capability::{Capabilities, FetchResponse, HttpFetcher};
use crate::cache::{ScriptCache, TtlCache};
use crate::env::{EnvRef, Frame};
use crate::error::{Diagnostic, DiagnosticClass};
use crate::parser::Parser;
use crate::source::SourceReader;
use crate::value::Value;

use super::{CancelToken, Evaluator, Interrupt, ModuleRegistry};

/// Canned HTTP fetcher for tests: serves a JSON document for one known
/// URL and 404s everything else.
struct StubHttp;

#[async_trait]
impl HttpFetcher for StubHttp {
    async fn get(
        &self,
        url: &url::Url,
        _headers: &[(String, String)],
    ) -> Result<FetchResponse, Diagnostic> {
        if url.path() == "/feed.json" {
            Ok(FetchResponse {
                status: 200,
                headers: vec![],
                body: br#"{"items": [1, 2, 3]}"#.to_vec(),
                content_type: Some("application/json".to_string()),
            })
        } else {
            Ok(FetchResponse {
                status: 404,
                headers: vec![],
                body: b"not found".to_vec(),
                content_type: Some("text/plain".to_string()),
            })
        }
    }
}

struct Harness {
    evaluator: Evaluator,
    #[allow(dead_code)]
    dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().canonicalize().unwrap();
    let db = Arc::new(SqliteDb::connect(":memory:").await.unwrap());
    let caps = Capabilities {
        fs: Arc::new(BaseDirFs::new(base.clone())),
        http: Arc::new(StubHttp),
        db,
        search: Arc::new(MemorySearchIndex::new()),
        sessions: Arc::new(MemorySessionStore::new()),
        shell: Arc::new(HostShell),
        clock: Arc::new(SystemClock),
    };
    let cache = Arc::new(ScriptCache::new(SourceReader::new(base), false));
    let evaluator = Evaluator::new(
        caps,
        cache,
        Arc::new(ModuleRegistry::new()),
        Arc::new(TtlCache::new(128)),
        CancelToken::new(),
    );
    Harness { evaluator, dir }
}

impl Harness {
    fn env(&self) -> EnvRef {
        Frame::module()
    }

    async fn eval(&self, src: &str) -> Result<Value, Interrupt> {
        let program = Parser::parse_program(src, PathBuf::from("<input>")).unwrap();
        self.evaluator.eval_program(&program, &self.env()).await
    }

    async fn value(&self, src: &str) -> Value {
        self.eval(src).await.unwrap_or_else(|e| panic!("eval failed: {e:?}"))
    }

    async fn diag(&self, src: &str) -> Diagnostic {
        match self.eval(src).await {
            Err(Interrupt::Diag(d)) => d,
            other => panic!("expected a diagnostic, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn for_over_empty_array_is_empty() {
    let h = harness().await;
    let v = h.value("for x in [] { x }").await;
    assert!(v.eq_value(&Value::array(vec![])));
}

#[tokio::test]
async fn for_maps_body_values() {
    let h = harness().await;
    let v = h.value("for x in [1, 2, 3] { x * 10 }").await;
    let expected = Value::array(vec![Value::Int(10), Value::Int(20), Value::Int(30)]);
    assert!(v.eq_value(&expected));
}

#[tokio::test]
async fn skip_filters_like_a_predicate() {
    let h = harness().await;
    // `for x in arr { skip if cond; x }` equals arr filtered by not cond.
    let v = h
        .value("for x in [1, 2, 3, 4, 5, 6] { skip if x % 2 == 0; x }")
        .await;
    let expected = Value::array(vec![Value::Int(1), Value::Int(3), Value::Int(5)]);
    assert!(v.eq_value(&expected));
}

#[tokio::test]
async fn stop_terminates_early() {
    let h = harness().await;
    let v = h.value("for x in [1, 2, 3, 4] { stop if x > 2; x }").await;
    let expected = Value::array(vec![Value::Int(1), Value::Int(2)]);
    assert!(v.eq_value(&expected));
}

#[tokio::test]
async fn for_over_range_does_not_materialise() {
    let h = harness().await;
    let v = h.value("for i in 0..4 { i }").await;
    let expected = Value::array((0..4).map(Value::Int).collect());
    assert!(v.eq_value(&expected));
}

#[tokio::test]
async fn for_over_dict_iterates_insertion_order() {
    let h = harness().await;
    let v = h.value("for k, v in {b: 1, a: 2} { k }").await;
    let expected = Value::array(vec![Value::str("b"), Value::str("a")]);
    assert!(v.eq_value(&expected));
}

#[tokio::test]
async fn if_is_an_expression() {
    let h = harness().await;
    let v = h.value("let x = 7\nif x > 5 { \"big\" } else { \"small\" }").await;
    assert!(v.eq_value(&Value::str("big")));
}

#[tokio::test]
async fn money_addition_and_scaling() {
    let h = harness().await;
    // $12.34 + $0.01 == $12.35
    let v = h.value("$12.34 + $0.01 == $12.35").await;
    assert!(v.eq_value(&Value::Bool(true)));
    // ¥100 * 2 == ¥200
    let v = h.value("¥100 * 2 == ¥200").await;
    assert!(v.eq_value(&Value::Bool(true)));
}

#[tokio::test]
async fn mixing_currencies_fails_with_type_mismatch() {
    let h = harness().await;
    let d = h.diag("$1.00 + ¥100").await;
    assert_eq!(d.class, DiagnosticClass::Type);
}

#[tokio::test]
async fn integer_overflow_is_checked() {
    let h = harness().await;
    let d = h.diag("9_223_372_036_854_775_807 + 1").await;
    assert_eq!(d.code, "V-ARITH-OVERFLOW");
    assert_eq!(d.class, DiagnosticClass::Value);
}

#[tokio::test]
async fn nan_equality_is_false() {
    let h = harness().await;
    let v = h.value("let nan = 0.0 / 0.0\nnan == nan").await;
    assert!(v.eq_value(&Value::Bool(false)));
}

#[tokio::test]
async fn plus_on_strings_is_a_type_error_concat_works() {
    let h = harness().await;
    let d = h.diag(r#""a" + "b""#).await;
    assert_eq!(d.code, "T-STR-PLUS");
    let v = h.value(r#""a" ++ "b""#).await;
    assert!(v.eq_value(&Value::str("ab")));
}

#[tokio::test]
async fn membership_operators() {
    let h = harness().await;
    assert!(h.value("2 in [1, 2, 3]").await.eq_value(&Value::Bool(true)));
    assert!(h.value("5 not in [1, 2, 3]").await.eq_value(&Value::Bool(true)));
    assert!(h
        .value(r#""a" in {a: 1, b: 2}"#)
        .await
        .eq_value(&Value::Bool(true)));
}

#[tokio::test]
async fn regex_matching_with_flags() {
    let h = harness().await;
    assert!(h
        .value(r#"let pat = /hello/i
"HELLO world" ~ pat"#)
        .await
        .eq_value(&Value::Bool(true)));
    assert!(h
        .value(r#"let pat = /^x/
"yx" !~ pat"#)
        .await
        .eq_value(&Value::Bool(true)));
}

#[tokio::test]
async fn nullish_takes_right_only_on_null() {
    let h = harness().await;
    assert!(h.value("null ?? 5").await.eq_value(&Value::Int(5)));
    assert!(h.value("0 ?? 5").await.eq_value(&Value::Int(0)));
}

#[tokio::test]
async fn destructuring_let_with_alias_and_rest() {
    let h = harness().await;
    let v = h
        .value("let {a, b as c, ...rest} = {a: 1, b: 2, z: 3}\n[a, c, rest.z]")
        .await;
    let expected = Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert!(v.eq_value(&expected));
}

#[tokio::test]
async fn functions_close_over_their_environment() {
    let h = harness().await;
    let v = h
        .value("let base = 10\nlet add = fn(x) { base + x }\nadd(5)")
        .await;
    assert!(v.eq_value(&Value::Int(15)));
}

#[tokio::test]
async fn try_yields_error_dictionary_for_io_failures() {
    let h = harness().await;
    let v = h
        .value("let f = fn() { \"exit 2\" <=#=> \"\" }\ntry f()")
        .await;
    match &v {
        Value::Dict(map) => {
            let map = map.read();
            assert!(map.get("error").unwrap().eq_value(&Value::Bool(true)));
            assert!(map.get("class").unwrap().eq_value(&Value::str("io")));
        }
        other => panic!("expected an error dictionary, got {other:?}"),
    }
}

#[tokio::test]
async fn uncaught_io_failures_propagate() {
    let h = harness().await;
    let d = h
        .diag("let f = fn() { \"exit 2\" <=#=> \"\" }\nf()")
        .await;
    assert_eq!(d.class, DiagnosticClass::Io);
}

#[tokio::test]
async fn shell_pipe_returns_stdout() {
    let h = harness().await;
    let v = h.value(r#""cat" <=#=> "piped""#).await;
    assert!(v.eq_value(&Value::str("piped")));
}

#[tokio::test]
async fn file_read_write_round_trip() {
    let h = harness().await;
    let v = h
        .value("\"hello file\" ==> @/out.txt\ncontent <== @/out.txt\ncontent")
        .await;
    assert!(v.eq_value(&Value::str("hello file")));
}

#[tokio::test]
async fn pipe_read_advances_line_by_line() {
    let h = harness().await;
    let v = h
        .value(
            "\"one\ntwo\" ==> @/lines.txt\nfirst |< @/lines.txt\nsecond |< @/lines.txt\nthird |< @/lines.txt\n[first, second, third]",
        )
        .await;
    let expected = Value::array(vec![Value::str("one"), Value::str("two"), Value::Null]);
    assert!(v.eq_value(&expected));
}

#[tokio::test]
async fn fetch_decodes_json_by_content_type() {
    let h = harness().await;
    let v = h
        .value("data <=/= @https://example.com/feed.json\ndata.items")
        .await;
    let expected = Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert!(v.eq_value(&expected));
}

#[tokio::test]
async fn fetch_failures_preserve_status() {
    let h = harness().await;
    let d = h.diag("data <=/= @https://example.com/missing").await;
    assert_eq!(d.class, DiagnosticClass::Io);
    assert!(d.message.contains("404"));
}

#[tokio::test]
async fn sql_statement_operators_round_trip() {
    let h = harness().await;
    let v = h
        .value(
            r#"n <=!=> "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, active BOOLEAN)"
a <=!=> "INSERT INTO users (id, name, active) VALUES (1, 'A', 1)"
b <=!=> "INSERT INTO users (id, name, active) VALUES (2, 'B', 0)"
rows <=??=> "SELECT id, name FROM users WHERE active = ?" [true]
rows"#,
        )
        .await;
    let json = v.to_json_value().unwrap();
    assert_eq!(json, serde_json::json!([{"id": 1, "name": "A"}]));
}

#[tokio::test]
async fn query_dsl_executes_through_the_ir() {
    let h = harness().await;
    let v = h
        .value(
            r#"n <=!=> "CREATE TABLE items (id INTEGER PRIMARY KEY, kind TEXT, price INTEGER)"
a <=!=> "INSERT INTO items (id, kind, price) VALUES (1, 'book', 10), (2, 'book', 20), (3, 'pen', 1)"
let want = "book"
let rows = @query(items | kind == {want} | sort price desc ??->)
for r in rows { r.price }"#,
        )
        .await;
    let expected = Value::array(vec![Value::Int(20), Value::Int(10)]);
    assert!(v.eq_value(&expected));
}

#[tokio::test]
async fn query_terminal_one_strict_errors_on_empty() {
    let h = harness().await;
    let d = h
        .diag(
            r#"n <=!=> "CREATE TABLE empty_t (id INTEGER)"
let row = @query(empty_t ?!->)"#,
        )
        .await;
    assert_eq!(d.code, "R-QUERY-EMPTY");
}

#[tokio::test]
async fn insert_and_count_through_dsl() {
    let h = harness().await;
    let v = h
        .value(
            r#"n <=!=> "CREATE TABLE logs (msg TEXT)"
let added = @insert(logs { msg: "hi" } .->)
added"#,
        )
        .await;
    assert!(v.eq_value(&Value::Int(1)));
}

#[tokio::test]
async fn transactions_apply_atomically() {
    let h = harness().await;
    let v = h
        .value(
            r#"n <=!=> "CREATE TABLE pairs (x INTEGER)"
let total = @transaction(@insert(pairs { x: 1 } .); @insert(pairs { x: 2 } .))
let count = @query(pairs .->)
[total, count]"#,
        )
        .await;
    let expected = Value::array(vec![Value::Int(2), Value::Int(2)]);
    assert!(v.eq_value(&expected));
}

#[tokio::test]
async fn imports_evaluate_once_and_expose_exports() {
    let h = harness().await;
    std::fs::write(
        h.dir.path().join("math.pars"),
        "export let double = fn(x) { x * 2 }\nexport let version = 3",
    )
    .unwrap();
    let v = h
        .value("let m = import @./math\n[m.double(21), m.version]")
        .await;
    let expected = Value::array(vec![Value::Int(42), Value::Int(3)]);
    assert!(v.eq_value(&expected));
    assert_eq!(h.evaluator.modules.len(), 1);

    // A second import reuses the module instance.
    let v = h.value("let m = import @./math\nm.version").await;
    assert!(v.eq_value(&Value::Int(3)));
    assert_eq!(h.evaluator.cache.stats().total_parses, 1);

    // `as Alias` rebinds the module dictionary in scope.
    let v = h.value("import @./math as M\nM.double(4)").await;
    assert!(v.eq_value(&Value::Int(8)));
}

#[tokio::test]
async fn cyclic_imports_are_runtime_errors() {
    let h = harness().await;
    std::fs::write(h.dir.path().join("a.pars"), "let b = import @./b").unwrap();
    std::fs::write(h.dir.path().join("b.pars"), "let a = import @./a").unwrap();
    let d = h.diag("let a = import @./a").await;
    assert_eq!(d.code, "R-IMPORT-CYCLE");
}

#[tokio::test]
async fn tags_render_html_fragments() {
    let h = harness().await;
    let v = h
        .value(r#"let name = "world"
<div class="greeting">hello {name}</div>"#)
        .await;
    assert!(v.eq_value(&Value::str(
        r#"<div class="greeting">hello world</div>"#
    )));
}

#[tokio::test]
async fn uppercase_tags_call_components() {
    let h = harness().await;
    let v = h
        .value(
            r#"let Card = fn(props) {
    <div class="card">{props.title}</div>
}
<Card title="Basil"/>"#,
        )
        .await;
    assert!(v.eq_value(&Value::str(r#"<div class="card">Basil</div>"#)));
}

#[tokio::test]
async fn component_arrays_join_without_separator() {
    let h = harness().await;
    let v = h
        .value(
            r#"let List = fn(props) {
    for item in props.items { <li>{item}</li> }
}
<List items={[1, 2]}/>"#,
        )
        .await;
    assert!(v.eq_value(&Value::str("<li>1</li><li>2</li>")));
}

#[tokio::test]
async fn check_raises_a_value_error() {
    let h = harness().await;
    let d = h.diag("check 1 > 2").await;
    assert_eq!(d.code, "V-CHECK");
    assert_eq!(d.class, DiagnosticClass::Value);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_interrupts_loops_and_cannot_be_caught() {
    let h = Arc::new(harness().await);
    let token = h.evaluator.cancel.clone();
    let runner = h.clone();
    // A long loop wrapped in try: cancellation must not be converted into
    // an error dictionary by the catch.
    let join = tokio::spawn(async move {
        runner
            .eval("let spin = fn() { for i in 0..1_000_000_000 { i } }\ntry spin()")
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), join)
        .await
        .expect("cancellation tears the evaluation down promptly")
        .unwrap();
    match result {
        Err(Interrupt::Cancelled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[tokio::test]
async fn template_interpolation() {
    let h = harness().await;
    let v = h.value("let n = 5\n`value: @{n + 1}`").await;
    assert!(v.eq_value(&Value::str("value: 6")));
}

#[tokio::test]
async fn builtins_cover_json_and_collections() {
    let h = harness().await;
    let v = h.value(r#"parseJson("[1, 2]")"#).await;
    assert!(v.eq_value(&Value::array(vec![Value::Int(1), Value::Int(2)])));
    let v = h.value("len([1, 2, 3])").await;
    assert!(v.eq_value(&Value::Int(3)));
    let v = h.value("type($1.00)").await;
    assert!(v.eq_value(&Value::str("money")));
}

#[tokio::test]
async fn string_methods() {
    let h = harness().await;
    let v = h.value(r#""  Basil  ".trim().upper()"#).await;
    assert!(v.eq_value(&Value::str("BASIL")));
    let v = h.value(r#""a,b,c".split(",")"#).await;
    assert!(v.eq_value(&Value::array(vec![
        Value::str("a"),
        Value::str("b"),
        Value::str("c")
    ])));
}

#[tokio::test]
async fn index_assignment_mutates_shared_arrays() {
    let h = harness().await;
    let v = h
        .value("let xs = [1, 2, 3]\nlet ys = xs\nxs[0] = 9\nys[0]")
        .await;
    assert!(v.eq_value(&Value::Int(9)));
}

#[tokio::test]
async fn slices_and_negative_indices() {
    let h = harness().await;
    let v = h.value("[1, 2, 3, 4][1..3]").await;
    assert!(v.eq_value(&Value::array(vec![Value::Int(2), Value::Int(3)])));
    let v = h.value("[1, 2, 3][-1]").await;
    assert!(v.eq_value(&Value::Int(3)));
}
