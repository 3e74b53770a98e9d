//! The AST cache.
//!
//! Maps canonical source paths to parsed programs with dependency
//! tracking. Misses are single-flight: concurrent callers for the same key
//! block on the one in-flight parse and observe the same program pointer.
//! In development mode the source mtime is compared on every lookup and a
//! newer file forces a reparse before returning. Failed parses never
//! install an entry.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::error::BasilError;
use crate::parser::ast::{
    Block, Expr, ImportPath, Program, ReadStmt, Stmt, TagChild, TemplateSeg, WriteStmt,
};
use crate::parser::Parser;
use crate::source::{file_mtime_ns, SourceReader};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub program: Arc<Program>,
    pub mtime_ns: u128,
    pub parsed_at: SystemTime,
    /// Canonical paths of statically imported sources.
    pub deps: Vec<PathBuf>,
    /// Set when the program contains `import @(…)`; such an importer's
    /// dependency set is incomplete and it is invalidated on every watcher
    /// event.
    pub dynamic_imports: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub entries: usize,
    pub total_parses: u64,
    pub hits: u64,
}

pub struct ScriptCache {
    reader: SourceReader,
    dev_mode: RwLock<bool>,
    entries: RwLock<HashMap<PathBuf, Arc<CacheEntry>>>,
    inflight: Mutex<HashMap<PathBuf, watch::Receiver<bool>>>,
    parse_count: AtomicU64,
    hit_count: AtomicU64,
}

impl ScriptCache {
    pub fn new(reader: SourceReader, dev_mode: bool) -> ScriptCache {
        ScriptCache {
            reader,
            dev_mode: RwLock::new(dev_mode),
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            parse_count: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
        }
    }

    pub fn reader(&self) -> &SourceReader {
        &self.reader
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().len(),
            total_parses: self.parse_count.load(Ordering::Relaxed),
            hits: self.hit_count.load(Ordering::Relaxed),
        }
    }

    /// Switch between development and production behaviour. The cache is
    /// cleared because entries parsed under one mode carry different
    /// staleness assumptions.
    pub fn set_dev_mode(&self, dev: bool) {
        *self.dev_mode.write() = dev;
        self.clear();
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Fetch the program for `key`, parsing at most once per key across
    /// concurrent callers.
    pub async fn get_or_parse(&self, key: &Path) -> Result<Arc<CacheEntry>, BasilError> {
        enum Role {
            Owner(watch::Sender<bool>),
            Waiter(watch::Receiver<bool>),
        }

        loop {
            if let Some(entry) = self.fresh_entry(key)? {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                return Ok(entry);
            }

            // Miss or stale. Either join the in-flight parse or claim it.
            let role = {
                let mut inflight = self.inflight.lock();
                match inflight.get(key) {
                    Some(rx) => Role::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        inflight.insert(key.to_path_buf(), rx);
                        Role::Owner(tx)
                    }
                }
            };

            match role {
                Role::Owner(tx) => {
                    // A peer may have finished between our miss and the
                    // claim; re-check before doing the work. The in-flight
                    // entry is removed on every exit path so waiters never
                    // block on a dead owner.
                    let result = match self.fresh_entry(key) {
                        Ok(Some(entry)) => Ok(entry),
                        Ok(None) => self.parse_now(key),
                        Err(e) => Err(e),
                    };
                    self.inflight.lock().remove(key);
                    let _ = tx.send(true);
                    return result;
                }
                Role::Waiter(mut rx) => {
                    // When the sender drops or signals, re-check the cache.
                    // A failed parse leaves no entry and the next loop
                    // iteration claims ownership. A closed channel means
                    // the owner died without cleaning up; drop the stale
                    // claim rather than spinning on it.
                    if rx.changed().await.is_err() {
                        self.inflight.lock().remove(key);
                    }
                }
            }
        }
    }

    /// The cached entry, if present and (in dev mode) still matching the
    /// file's mtime.
    fn fresh_entry(&self, key: &Path) -> Result<Option<Arc<CacheEntry>>, BasilError> {
        let entry = match self.entries.read().get(key) {
            Some(entry) => entry.clone(),
            None => return Ok(None),
        };
        if *self.dev_mode.read() {
            let current = file_mtime_ns(key)?;
            if current > entry.mtime_ns {
                return Ok(None);
            }
        }
        Ok(Some(entry))
    }

    fn parse_now(&self, key: &Path) -> Result<Arc<CacheEntry>, BasilError> {
        let unit = self.reader.load_canonical(key)?;
        let text = unit.text().into_owned();
        self.parse_count.fetch_add(1, Ordering::Relaxed);
        let program = Parser::parse_program(&text, key.to_path_buf())
            .map_err(|d| BasilError::Script(d))?;

        let (import_refs, dynamic_imports) = collect_imports(&program);
        let loading_dir = key.parent().unwrap_or(Path::new("/")).to_path_buf();
        let deps: Vec<PathBuf> = import_refs
            .iter()
            .filter_map(|reference| self.reader.resolve(reference, &loading_dir).ok())
            .collect();

        let entry = Arc::new(CacheEntry {
            program: Arc::new(program),
            mtime_ns: unit.mtime_ns,
            parsed_at: SystemTime::now(),
            deps,
            dynamic_imports,
        });
        self.entries
            .write()
            .insert(key.to_path_buf(), entry.clone());
        Ok(entry)
    }

    /// Remove `key` and every entry whose dependency set transitively
    /// contains it. Cycles among deps simply widen the invalidation set.
    /// Returns the paths actually purged so callers can cascade (module
    /// registry, live-reload).
    pub fn invalidate(&self, key: &Path) -> Vec<PathBuf> {
        let mut entries = self.entries.write();
        let mut doomed: HashSet<PathBuf> = HashSet::new();
        doomed.insert(key.to_path_buf());

        loop {
            let mut grew = false;
            for (path, entry) in entries.iter() {
                if doomed.contains(path) {
                    continue;
                }
                if entry.dynamic_imports
                    || entry.deps.iter().any(|dep| doomed.contains(dep))
                {
                    doomed.insert(path.clone());
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        let mut removed = Vec::new();
        for path in doomed {
            if entries.remove(&path).is_some() {
                removed.push(path);
            } else if path == key {
                // The named key may not be cached yet; report it anyway so
                // downstream registries still drop their state.
                removed.push(path);
            }
        }
        removed
    }
}

/// Collect static import references and detect dynamic imports by walking
/// the tree.
pub fn collect_imports(program: &Program) -> (Vec<String>, bool) {
    let mut refs = Vec::new();
    let mut dynamic = false;
    for stmt in &program.statements {
        walk_stmt(stmt, &mut refs, &mut dynamic);
    }
    (refs, dynamic)
}

fn walk_block(block: &Block, refs: &mut Vec<String>, dynamic: &mut bool) {
    for stmt in &block.statements {
        walk_stmt(stmt, refs, dynamic);
    }
}

fn walk_stmt(stmt: &Stmt, refs: &mut Vec<String>, dynamic: &mut bool) {
    match stmt {
        Stmt::Let { value, .. } => walk_expr(value, refs, dynamic),
        Stmt::Assign { value, .. } => walk_expr(value, refs, dynamic),
        Stmt::IndexAssign {
            target,
            index,
            value,
            ..
        } => {
            walk_expr(target, refs, dynamic);
            walk_expr(index, refs, dynamic);
            walk_expr(value, refs, dynamic);
        }
        Stmt::Return { value, .. } => {
            if let Some(v) = value {
                walk_expr(v, refs, dynamic);
            }
        }
        Stmt::Check { cond, .. } => walk_expr(cond, refs, dynamic),
        Stmt::Export { decl, .. } => {
            if let Some(d) = decl {
                walk_stmt(d, refs, dynamic);
            }
        }
        Stmt::Stop { cond, .. } | Stmt::Skip { cond, .. } => {
            if let Some(c) = cond {
                walk_expr(c, refs, dynamic);
            }
        }
        Stmt::Read(ReadStmt { source, params, .. }) => {
            walk_expr(source, refs, dynamic);
            if let Some(p) = params {
                walk_expr(p, refs, dynamic);
            }
        }
        Stmt::Write(WriteStmt { value, target, .. }) => {
            walk_expr(value, refs, dynamic);
            walk_expr(target, refs, dynamic);
        }
        Stmt::Expr { expr, .. } => walk_expr(expr, refs, dynamic),
        Stmt::Block { block, .. } => walk_block(block, refs, dynamic),
    }
}

fn walk_segs(parts: &[TemplateSeg], refs: &mut Vec<String>, dynamic: &mut bool) {
    for part in parts {
        if let TemplateSeg::Expr(e) = part {
            walk_expr(e, refs, dynamic);
        }
    }
}

fn walk_expr(expr: &Expr, refs: &mut Vec<String>, dynamic: &mut bool) {
    match expr {
        Expr::Import { path, .. } => match path {
            ImportPath::Static(p) => refs.push(p.clone()),
            ImportPath::Dynamic(parts) => {
                *dynamic = true;
                walk_segs(parts, refs, dynamic);
            }
        },
        Expr::Template { parts, .. } => walk_segs(parts, refs, dynamic),
        Expr::Prefix { operand, .. } => walk_expr(operand, refs, dynamic),
        Expr::Infix { left, right, .. } => {
            walk_expr(left, refs, dynamic);
            walk_expr(right, refs, dynamic);
        }
        Expr::Call { callee, args, .. } => {
            walk_expr(callee, refs, dynamic);
            for a in args {
                walk_expr(a, refs, dynamic);
            }
        }
        Expr::Index { target, index, .. } => {
            walk_expr(target, refs, dynamic);
            walk_expr(index, refs, dynamic);
        }
        Expr::Slice {
            target, from, to, ..
        } => {
            walk_expr(target, refs, dynamic);
            if let Some(f) = from {
                walk_expr(f, refs, dynamic);
            }
            if let Some(t) = to {
                walk_expr(t, refs, dynamic);
            }
        }
        Expr::Dot { target, .. } => walk_expr(target, refs, dynamic),
        Expr::Grouped { inner, .. } => walk_expr(inner, refs, dynamic),
        Expr::If {
            cond,
            then,
            elifs,
            alternative,
            ..
        } => {
            walk_expr(cond, refs, dynamic);
            walk_block(then, refs, dynamic);
            for (c, b) in elifs {
                walk_expr(c, refs, dynamic);
                walk_block(b, refs, dynamic);
            }
            if let Some(alt) = alternative {
                walk_block(alt, refs, dynamic);
            }
        }
        Expr::For {
            iterable, body, ..
        } => {
            walk_expr(iterable, refs, dynamic);
            walk_block(body, refs, dynamic);
        }
        Expr::Try { call, .. } => walk_expr(call, refs, dynamic),
        Expr::Function { body, .. } => walk_block(body, refs, dynamic),
        Expr::Dict { entries, .. } => {
            for (_, v) in entries {
                walk_expr(v, refs, dynamic);
            }
        }
        Expr::Array { items, .. } => {
            for item in items {
                walk_expr(item, refs, dynamic);
            }
        }
        Expr::TagPair {
            attrs, children, ..
        } => {
            for attr in attrs {
                if let Some(v) = &attr.value {
                    walk_expr(v, refs, dynamic);
                }
            }
            for child in children {
                match child {
                    TagChild::Text(_) => {}
                    TagChild::Tag(t) => walk_expr(t, refs, dynamic),
                    TagChild::Interp(block) => walk_block(block, refs, dynamic),
                    TagChild::RawInterp(e) => walk_expr(e, refs, dynamic),
                }
            }
        }
        Expr::TagLiteral { attrs, .. } => {
            for attr in attrs {
                if let Some(v) = &attr.value {
                    walk_expr(v, refs, dynamic);
                }
            }
        }
        Expr::Transaction(t) => walk_block(&t.body, refs, dynamic),
        // Remaining variants carry no nested script expressions that can
        // import.
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// TTL cache (response + fragment caches)
// ---------------------------------------------------------------------------

/// A many-reader/one-writer cache with time-based eviction and an
/// insertion-order trim when capacity is reached.
pub struct TtlCache<V: Clone> {
    entries: RwLock<HashMap<String, (V, std::time::Instant)>>,
    order: Mutex<Vec<String>>,
    capacity: usize,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize) -> TtlCache<V> {
        TtlCache {
            entries: RwLock::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let expired = {
            let entries = self.entries.read();
            match entries.get(key) {
                Some((value, expires)) if *expires > std::time::Instant::now() => {
                    return Some(value.clone());
                }
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.entries.write().remove(key);
        }
        None
    }

    pub fn put(&self, key: &str, value: V, ttl: std::time::Duration) {
        let expires = std::time::Instant::now() + ttl;
        let mut entries = self.entries.write();
        let mut order = self.order.lock();
        if !entries.contains_key(key) {
            order.push(key.to_string());
        }
        entries.insert(key.to_string(), (value, expires));
        while entries.len() > self.capacity {
            if let Some(oldest) = order.first().cloned() {
                order.remove(0);
                entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
        self.order.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn site(files: &[(&str, &str)]) -> (tempfile::TempDir, SourceReader) {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            let mut f = std::fs::File::create(path).unwrap();
            f.write_all(content.as_bytes()).unwrap();
        }
        let base = dir.path().canonicalize().unwrap();
        (dir, SourceReader::new(base))
    }

    #[tokio::test]
    async fn caches_programs_by_canonical_path() {
        let (dir, reader) = site(&[("index.pars", "let x = 1")]);
        let cache = ScriptCache::new(reader, false);
        let key = dir.path().canonicalize().unwrap().join("index.pars");

        let first = cache.get_or_parse(&key).await.unwrap();
        let second = cache.get_or_parse(&key).await.unwrap();
        assert!(Arc::ptr_eq(&first.program, &second.program));
        assert_eq!(cache.stats().total_parses, 1);
    }

    #[tokio::test]
    async fn failed_parses_leave_no_entry() {
        let (dir, reader) = site(&[("bad.pars", "let x == 5")]);
        let cache = ScriptCache::new(reader, false);
        let key = dir.path().canonicalize().unwrap().join("bad.pars");

        assert!(cache.get_or_parse(&key).await.is_err());
        assert_eq!(cache.stats().entries, 0);
        // A retry parses again rather than serving a poisoned entry.
        assert!(cache.get_or_parse(&key).await.is_err());
        assert_eq!(cache.stats().total_parses, 2);
    }

    #[tokio::test]
    async fn single_flight_under_concurrency() {
        let (dir, reader) = site(&[("h.pars", "let body = \"expected\"")]);
        let cache = Arc::new(ScriptCache::new(reader, false));
        let key = dir.path().canonicalize().unwrap().join("h.pars");

        let mut joins = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let key = key.clone();
            joins.push(tokio::spawn(
                async move { cache.get_or_parse(&key).await },
            ));
        }
        let mut programs = Vec::new();
        for join in joins {
            programs.push(join.await.unwrap().unwrap());
        }
        assert_eq!(cache.stats().total_parses, 1, "parser entered exactly once");
        for entry in &programs[1..] {
            assert!(Arc::ptr_eq(&programs[0].program, &entry.program));
        }
    }

    #[tokio::test]
    async fn dev_mode_reparses_on_newer_mtime() {
        let (dir, reader) = site(&[("page.pars", "let v = \"v1\"")]);
        let cache = ScriptCache::new(reader, true);
        let key = dir.path().canonicalize().unwrap().join("page.pars");

        cache.get_or_parse(&key).await.unwrap();
        std::fs::write(&key, "let v = \"v2\"").unwrap();
        // Force an unmistakably newer mtime.
        let later = filetime::FileTime::from_unix_time(
            filetime::FileTime::now().unix_seconds() + 5,
            0,
        );
        filetime::set_file_mtime(&key, later).unwrap();

        cache.get_or_parse(&key).await.unwrap();
        assert_eq!(cache.stats().total_parses, 2);
    }

    #[tokio::test]
    async fn invalidation_is_transitive_over_deps() {
        let (dir, reader) = site(&[
            ("shared.pars", "export let version = 1"),
            ("mid.pars", "let s = import @./shared"),
            ("top.pars", "let m = import @./mid"),
            ("other.pars", "let unrelated = true"),
        ]);
        let cache = ScriptCache::new(reader, false);
        let base = dir.path().canonicalize().unwrap();
        for name in ["shared.pars", "mid.pars", "top.pars", "other.pars"] {
            cache.get_or_parse(&base.join(name)).await.unwrap();
        }
        assert_eq!(cache.stats().entries, 4);

        let removed = cache.invalidate(&base.join("shared.pars"));
        assert_eq!(removed.len(), 3, "shared, mid, and top are all purged");
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test]
    async fn dynamic_importers_are_always_invalidated() {
        let (dir, reader) = site(&[
            ("dyn.pars", "let m = import @(./pages/{slug})"),
            ("plain.pars", "let x = 1"),
        ]);
        let cache = ScriptCache::new(reader, false);
        let base = dir.path().canonicalize().unwrap();
        cache.get_or_parse(&base.join("dyn.pars")).await.unwrap();
        cache.get_or_parse(&base.join("plain.pars")).await.unwrap();

        // An event for an unrelated path still purges the dynamic importer.
        cache.invalidate(&base.join("whatever.pars"));
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn ttl_cache_expires_and_trims() {
        let cache: TtlCache<String> = TtlCache::new(2);
        cache.put("a", "1".into(), std::time::Duration::from_secs(60));
        assert_eq!(cache.get("a"), Some("1".to_string()));

        // Expired entries vanish on read.
        cache.put("b", "2".into(), std::time::Duration::from_millis(0));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(cache.get("b"), None);

        // Over capacity, the oldest insertion is trimmed.
        cache.put("c", "3".into(), std::time::Duration::from_secs(60));
        cache.put("d", "4".into(), std::time::Duration::from_secs(60));
        cache.put("e", "5".into(), std::time::Duration::from_secs(60));
        assert!(cache.len() <= 2);
        assert_eq!(cache.get("e"), Some("5".to_string()));
    }

    #[tokio::test]
    async fn dependency_cycles_widen_but_terminate() {
        let (dir, reader) = site(&[
            ("a.pars", "let b = import @./b"),
            ("b.pars", "let a = import @./a"),
        ]);
        let cache = ScriptCache::new(reader, false);
        let base = dir.path().canonicalize().unwrap();
        cache.get_or_parse(&base.join("a.pars")).await.unwrap();
        cache.get_or_parse(&base.join("b.pars")).await.unwrap();

        let removed = cache.invalidate(&base.join("a.pars"));
        assert_eq!(removed.len(), 2);
    }
}
