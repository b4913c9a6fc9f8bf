// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Command Runner
//!
//! Runs the command of one `exec-request` in its own process group and
//! streams its output line by line. Cancelling kills the whole group, so
//! `make` and everything it spawned go down together.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use morph_core::domain::worker::ExecCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One line of command output, newline included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

#[derive(Debug)]
pub enum CommandOutcome {
    Exited(ExitStatus),
    Cancelled,
}

pub async fn run_command(
    exec: &ExecCommand,
    cwd: &Path,
    env: &[(String, String)],
    cancel: &CancellationToken,
    output: &mpsc::Sender<OutputLine>,
) -> std::io::Result<CommandOutcome> {
    let (program, args) = exec
        .argv
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .envs(env.iter().map(|(k, v)| (k, v)))
        .stdin(if exec.stdin_contents.is_empty() {
            Stdio::null()
        } else {
            Stdio::piped()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id();
    debug!(command = %exec.display(), pid = ?pid, "Spawned build command");

    if let Some(mut stdin) = child.stdin.take() {
        let contents = exec.stdin_contents.clone();
        tokio::spawn(async move {
            let _ = stdin.write_all(contents.as_bytes()).await;
        });
    }

    let stdout = forward(child.stdout.take(), Stream::Stdout, output.clone());
    let stderr = forward(child.stderr.take(), Stream::Stderr, output.clone());

    let outcome = tokio::select! {
        status = child.wait() => CommandOutcome::Exited(status?),
        _ = cancel.cancelled() => {
            kill_group(pid);
            let _ = child.start_kill();
            let _ = child.wait().await;
            CommandOutcome::Cancelled
        }
    };

    // Readers end once every process holding the pipes is gone
    let _ = stdout.await;
    let _ = stderr.await;
    Ok(outcome)
}

fn forward<R>(pipe: Option<R>, stream: Stream, output: mpsc::Sender<OutputLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(pipe) = pipe else {
            return;
        };
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let text = format!("{}\n", line);
            if output.send(OutputLine { stream, text }).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // The child leads its own group, so -pid addresses all of it
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn run(command: &str, cancel: &CancellationToken) -> (CommandOutcome, Vec<OutputLine>) {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let env = vec![("GREETING".to_string(), "hello".to_string())];
        let exec = ExecCommand {
            argv: vec!["sh".into(), "-c".into(), command.into()],
            stdin_contents: String::new(),
        };
        let outcome = run_command(&exec, dir.path(), &env, cancel, &tx).await.unwrap();
        drop(tx);
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        (outcome, lines)
    }

    #[tokio::test]
    async fn test_streams_both_outputs() {
        let (outcome, lines) = run("echo \"$GREETING\"; echo oops >&2; exit 3", &CancellationToken::new()).await;

        assert!(matches!(outcome, CommandOutcome::Exited(s) if s.code() == Some(3)));
        assert!(lines.contains(&OutputLine { stream: Stream::Stdout, text: "hello\n".into() }));
        assert!(lines.contains(&OutputLine { stream: Stream::Stderr, text: "oops\n".into() }));
    }

    #[tokio::test]
    async fn test_cancel_kills_process_group() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        // The backgrounded sleep would keep the pipes open if it survived
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            run("sleep 30 & sleep 30; echo unreachable", &cancel),
        )
        .await
        .unwrap();
        assert!(matches!(result.0, CommandOutcome::Cancelled));
        assert!(result.1.is_empty());
    }

    #[tokio::test]
    async fn test_stdin_contents_reach_command() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let exec = ExecCommand {
            argv: vec!["cat".into()],
            stdin_contents: "from stdin\n".into(),
        };
        let outcome = run_command(&exec, dir.path(), &[], &CancellationToken::new(), &tx)
            .await
            .unwrap();
        drop(tx);

        assert!(matches!(outcome, CommandOutcome::Exited(s) if s.success()));
        assert_eq!(rx.recv().await.unwrap().text, "from stdin\n");
    }
}
