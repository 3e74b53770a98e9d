//! Source unit loading and canonical identity.
//!
//! Every script the server compiles enters through here. A [`SourceUnit`]
//! pairs the bytes of a script with the canonical absolute path the AST
//! cache keys on, plus the mtime the cache compares for staleness.

use std::{
    fs,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use crate::error::BasilError;

/// Synthetic identity used for in-memory sources (tests, the CLI `--eval`
/// path). Never collides with a real file because it is not absolute.
pub const SYNTHETIC_INPUT: &str = "<input>";

/// A loaded unit of Parsley source.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    /// Canonical absolute path, or [`SYNTHETIC_INPUT`].
    pub canonical_path: PathBuf,
    pub bytes: Vec<u8>,
    /// Modification time in nanoseconds since the epoch. Zero for synthetic
    /// sources.
    pub mtime_ns: u128,
}

impl SourceUnit {
    pub fn synthetic(bytes: impl Into<Vec<u8>>) -> SourceUnit {
        SourceUnit {
            canonical_path: PathBuf::from(SYNTHETIC_INPUT),
            bytes: bytes.into(),
            mtime_ns: 0,
        }
    }

    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// Resolves logical source references to loaded units.
///
/// References come in three shapes: absolute paths, `./…` paths relative to
/// the *loading source's* directory (never the process working directory),
/// and stdlib paths (`std/math`, `basil/html`) that resolve into the
/// configured library root.
#[derive(Debug, Clone)]
pub struct SourceReader {
    /// Directory all scripts live under; escapes are rejected.
    base_dir: PathBuf,
    /// Root for `std/…` and `basil/…` references.
    stdlib_dir: PathBuf,
}

impl SourceReader {
    pub fn new(base_dir: PathBuf) -> SourceReader {
        let stdlib_dir = base_dir.join("lib");
        SourceReader {
            base_dir,
            stdlib_dir,
        }
    }

    pub fn with_stdlib(base_dir: PathBuf, stdlib_dir: PathBuf) -> SourceReader {
        SourceReader {
            base_dir,
            stdlib_dir,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve `reference` to a canonical absolute path without reading it.
    ///
    /// `loading_dir` is the directory of the source performing the load; it
    /// anchors `./…` and bare relative references.
    pub fn resolve(&self, reference: &str, loading_dir: &Path) -> Result<PathBuf, BasilError> {
        let raw = if let Some(stdlib) = reference
            .strip_prefix("std/")
            .or_else(|| reference.strip_prefix("basil/"))
        {
            self.stdlib_dir.join(stdlib)
        } else {
            let p = Path::new(reference);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                loading_dir.join(p)
            }
        };
        let with_ext = if raw.extension().is_none() {
            raw.with_extension("pars")
        } else {
            raw
        };
        let canonical = with_ext.canonicalize().map_err(|e| {
            BasilError::NotFound(format!("source '{reference}' not found: {e}"))
        })?;
        if !canonical.starts_with(&self.base_dir) {
            return Err(BasilError::PermissionDenied);
        }
        Ok(canonical)
    }

    /// Resolve and load in one step.
    pub fn load(&self, reference: &str, loading_dir: &Path) -> Result<SourceUnit, BasilError> {
        let canonical_path = self.resolve(reference, loading_dir)?;
        self.load_canonical(&canonical_path)
    }

    /// Load a path that is already canonical (the cache re-reads through
    /// this on staleness).
    pub fn load_canonical(&self, canonical_path: &Path) -> Result<SourceUnit, BasilError> {
        let bytes = fs::read(canonical_path)
            .map_err(|e| BasilError::Io(format!("read {canonical_path:?}: {e}")))?;
        let mtime_ns = file_mtime_ns(canonical_path)?;
        Ok(SourceUnit {
            canonical_path: canonical_path.to_path_buf(),
            bytes,
            mtime_ns,
        })
    }
}

/// The file's mtime as nanoseconds since the epoch.
pub fn file_mtime_ns(path: &Path) -> Result<u128, BasilError> {
    let metadata = fs::metadata(path)?;
    let modified = metadata
        .modified()
        .map_err(|e| BasilError::Io(format!("mtime unavailable for {path:?}: {e}")))?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(dir: &tempfile::TempDir) -> SourceReader {
        SourceReader::new(dir.path().canonicalize().unwrap())
    }

    #[test]
    fn resolves_relative_to_loading_source() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("pages");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(nested.join("helper.pars"), "1").unwrap();

        let r = reader(&dir);
        let nested = nested.canonicalize().unwrap();
        let resolved = r.resolve("./helper", &nested).unwrap();
        assert!(resolved.ends_with("pages/helper.pars"));
    }

    #[test]
    fn stdlib_references_resolve_into_lib_root() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib");
        std::fs::create_dir(&lib).unwrap();
        std::fs::write(lib.join("math.pars"), "1").unwrap();

        let r = reader(&dir);
        let resolved = r
            .resolve("std/math", &dir.path().canonicalize().unwrap())
            .unwrap();
        assert!(resolved.ends_with("lib/math.pars"));
    }

    #[test]
    fn escapes_outside_base_dir_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let r = reader(&dir);
        let err = r
            .resolve("../../etc/passwd", &dir.path().canonicalize().unwrap())
            .unwrap_err();
        assert!(matches!(
            err,
            BasilError::PermissionDenied | BasilError::NotFound(_)
        ));
    }

    #[test]
    fn missing_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let r = reader(&dir);
        let err = r
            .resolve("./absent", &dir.path().canonicalize().unwrap())
            .unwrap_err();
        assert!(matches!(err, BasilError::NotFound(_)));
    }
}
