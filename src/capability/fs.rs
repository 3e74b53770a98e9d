//! File capability confined to the configured base directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Diagnostic;

use super::{ReadableSource, WritableSink};

/// Reads and writes paths relative to (and never escaping) a base
/// directory. Script paths beginning with `/` are treated as rooted at the
/// base directory, not the host filesystem.
#[derive(Debug, Clone)]
pub struct BaseDirFs {
    base: PathBuf,
}

impl BaseDirFs {
    pub fn new(base: PathBuf) -> BaseDirFs {
        BaseDirFs { base }
    }

    /// Map a script-visible path into the base directory, rejecting `..`
    /// escapes without requiring the target to exist yet.
    pub fn confine(&self, raw: &str) -> Result<PathBuf, Diagnostic> {
        let trimmed = raw.trim_start_matches('/');
        let joined = self.base.join(trimmed);
        let mut normalised = PathBuf::new();
        for component in joined.components() {
            match component {
                std::path::Component::ParentDir => {
                    if !normalised.pop() {
                        return Err(escape_error(raw));
                    }
                }
                std::path::Component::CurDir => {}
                other => normalised.push(other),
            }
        }
        if !normalised.starts_with(&self.base) {
            return Err(escape_error(raw));
        }
        Ok(normalised)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}

fn escape_error(raw: &str) -> Diagnostic {
    Diagnostic::io(
        "IO-PATH-ESCAPE",
        format!("path '{raw}' escapes the application directory"),
    )
}

#[async_trait]
impl ReadableSource for BaseDirFs {
    async fn read_all(&self, path: &str) -> Result<Vec<u8>, Diagnostic> {
        let target = self.confine(path)?;
        tokio::fs::read(&target)
            .await
            .map_err(|e| Diagnostic::io("IO-READ", format!("read {path}: {e}")))
    }
}

#[async_trait]
impl WritableSink for BaseDirFs {
    async fn write(&self, path: &str, bytes: &[u8], append: bool) -> Result<(), Diagnostic> {
        let target = self.confine(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Diagnostic::io("IO-WRITE", format!("mkdir for {path}: {e}")))?;
        }
        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)
                .await
                .map_err(|e| Diagnostic::io("IO-WRITE", format!("open {path}: {e}")))?;
            file.write_all(bytes)
                .await
                .map_err(|e| Diagnostic::io("IO-WRITE", format!("append {path}: {e}")))?;
        } else {
            tokio::fs::write(&target, bytes)
                .await
                .map_err(|e| Diagnostic::io("IO-WRITE", format!("write {path}: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ReadableSource, WritableSink};

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = BaseDirFs::new(dir.path().to_path_buf());
        fs.write("/notes/today.txt", b"hello", false).await.unwrap();
        let bytes = fs.read_all("/notes/today.txt").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn append_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let fs = BaseDirFs::new(dir.path().to_path_buf());
        fs.write("log.txt", b"a", false).await.unwrap();
        fs.write("log.txt", b"b", true).await.unwrap();
        assert_eq!(fs.read_all("log.txt").await.unwrap(), b"ab");
    }

    #[tokio::test]
    async fn parent_escapes_are_io_errors() {
        let dir = tempfile::tempdir().unwrap();
        let fs = BaseDirFs::new(dir.path().to_path_buf());
        let err = fs.read_all("../../etc/passwd").await.unwrap_err();
        assert_eq!(err.code, "IO-PATH-ESCAPE");
    }

    #[tokio::test]
    async fn missing_files_map_to_io() {
        let dir = tempfile::tempdir().unwrap();
        let fs = BaseDirFs::new(dir.path().to_path_buf());
        let err = fs.read_all("absent.txt").await.unwrap_err();
        assert_eq!(err.class, crate::error::DiagnosticClass::Io);
    }
}
