//! Subprocess capability backing the `<=#=>` operator.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

use crate::error::Diagnostic;

use super::{ShellExec, ShellOutput};

/// Runs commands through `sh -c`, feeding the operator's right-hand value
/// on stdin.
#[derive(Debug, Default)]
pub struct HostShell;

#[async_trait]
impl ShellExec for HostShell {
    async fn run(&self, cmd: &str, stdin: &[u8]) -> Result<ShellOutput, Diagnostic> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Diagnostic::io("IO-SHELL-SPAWN", format!("spawn '{cmd}': {e}")))?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin)
                .await
                .map_err(|e| Diagnostic::io("IO-SHELL-STDIN", format!("write stdin: {e}")))?;
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Diagnostic::io("IO-SHELL-WAIT", format!("wait for '{cmd}': {e}")))?;

        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_stdin_through_cat() {
        let shell = HostShell;
        let out = shell.run("cat", b"hello").await.unwrap();
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.code, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_codes_are_reported() {
        let shell = HostShell;
        let out = shell.run("exit 3", b"").await.unwrap();
        assert_eq!(out.code, 3);
    }
}
