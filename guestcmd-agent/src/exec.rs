//! Runs one command line under the guest shell and captures its result.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use guestcmd_proto::CmdResult;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Exit code reported when a command outlives its time limit.
pub const TIMEOUT_EXIT: i32 = 124;

/// Exit code reported when the shell itself cannot be started.
pub const SPAWN_FAILED_EXIT: i32 = 127;

/// How long output is still collected after the shell has exited.
pub const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// The shell program commands are fed to on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shell {
    /// Program to spawn.
    program: String,
    /// Arguments passed before the script is read from stdin.
    args: Vec<String>,
}

impl Shell {
    /// Parses a shell command line such as `/bin/sh` or `/bin/busybox`.
    ///
    /// Multi-call binaries whose name does not end in `sh` get an `sh`
    /// applet argument prepended. Returns `None` for empty or unbalanced
    /// quoting.
    pub fn parse(spec: &str) -> Option<Self> {
        let mut words = shlex::split(spec)?.into_iter();
        let program = words.next()?;
        let mut args: Vec<String> = words.collect();
        if !program.ends_with("sh") {
            args.insert(0, "sh".to_owned());
        }
        Some(Self { program, args })
    }
}

/// Runs `command` and collects its full output.
///
/// The command line is written to the shell's stdin followed by
/// `exit $?`, so the reported status is the command's own. The time limit
/// applies to the shell alone: an overrunning shell is killed and
/// [`TIMEOUT_EXIT`] is reported. Once the shell is gone, background jobs
/// still holding the pipes get [`OUTPUT_GRACE`] before collection stops.
/// Output read so far is kept in every case.
pub async fn run(shell: &Shell, command: &str, timeout: Option<Duration>) -> CmdResult {
    let spawned = Command::new(&shell.program)
        .args(&shell.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            warn!(program = %shell.program, error = %e, "failed to spawn shell");
            return failure(format!("{}: {e}\n", shell.program), SPAWN_FAILED_EXIT);
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let script = format!("{command}\nexit $?\n");
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(script.as_bytes()).await {
                debug!(error = %e, "shell closed stdin early");
            }
        });
    }

    let (stdout, mut stdout_task) = capture(child.stdout.take());
    let (stderr, mut stderr_task) = capture(child.stderr.take());

    let status = match timeout {
        Some(limit) => {
            let waited = tokio::time::timeout(limit, child.wait()).await;
            match waited {
                Ok(status) => Some(status),
                Err(_) => {
                    warn!(?limit, "command timed out, killing shell");
                    if let Err(e) = child.kill().await {
                        debug!(error = %e, "shell already gone");
                    }
                    None
                }
            }
        }
        None => Some(child.wait().await),
    };

    let drained = tokio::time::timeout(OUTPUT_GRACE, async {
        let _ = (&mut stdout_task).await;
        let _ = (&mut stderr_task).await;
    })
    .await;
    if drained.is_err() {
        debug!("output pipes still open after shell exit, keeping partial output");
        stdout_task.abort();
        stderr_task.abort();
    }

    let mut result = CmdResult {
        stdout: take_lossy(&stdout),
        stderr: take_lossy(&stderr),
        exit_code: -1,
    };
    match status {
        Some(Ok(status)) => result.exit_code = status.code().unwrap_or(-1),
        Some(Err(e)) => result
            .stderr
            .push_str(&format!("failed to wait for shell: {e}\n")),
        None => {
            result.stderr.push_str(&format!(
                "command timed out after {}s\n",
                timeout.unwrap_or_default().as_secs_f64()
            ));
            result.exit_code = TIMEOUT_EXIT;
        }
    }
    result
}

/// Bytes read from a child pipe so far.
type Captured = Arc<Mutex<Vec<u8>>>;

/// Spawns a task copying `pipe` into a shared buffer until EOF.
///
/// The buffer stays readable if the task is aborted midway.
fn capture<R>(pipe: Option<R>) -> (Captured, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf = Captured::default();
    let sink = Arc::clone(&buf);
    let task = tokio::spawn(async move {
        let Some(mut pipe) = pipe else { return };
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut out) = sink.lock() {
                        out.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    });
    (buf, task)
}

/// Takes the captured bytes as (lossy) UTF-8.
fn take_lossy(buf: &Captured) -> String {
    buf.lock()
        .map(|mut out| String::from_utf8_lossy(&std::mem::take(&mut *out)).into_owned())
        .unwrap_or_default()
}

/// A result carrying only an error message.
fn failure(stderr: String, exit_code: i32) -> CmdResult {
    CmdResult {
        stdout: String::new(),
        stderr,
        exit_code,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sh() -> Shell {
        Shell::parse("/bin/sh").unwrap()
    }

    #[test]
    fn parse_plain_shell() {
        let s = sh();
        assert_eq!(s.program, "/bin/sh");
        assert!(s.args.is_empty());
    }

    #[test]
    fn parse_multicall_binary() {
        let s = Shell::parse("/bin/busybox").unwrap();
        assert_eq!(s.program, "/bin/busybox");
        assert_eq!(s.args, vec!["sh"]);
    }

    #[test]
    fn parse_shell_with_args() {
        let s = Shell::parse("/bin/bash --noprofile").unwrap();
        assert_eq!(s.args, vec!["--noprofile"]);
    }

    #[test]
    fn parse_rejects_empty_and_unbalanced() {
        assert!(Shell::parse("").is_none());
        assert!(Shell::parse("'/bin/sh").is_none());
    }

    #[tokio::test]
    async fn echo_captures_stdout() {
        let r = run(&sh(), "echo hi", None).await;
        assert_eq!(
            r,
            CmdResult {
                stdout: "hi\n".into(),
                stderr: String::new(),
                exit_code: 0,
            }
        );
    }

    #[tokio::test]
    async fn false_reports_failure() {
        let r = run(&sh(), "false", None).await;
        assert_eq!(r.exit_code, 1);
        assert!(r.stdout.is_empty());
    }

    #[tokio::test]
    async fn stderr_and_exit_code() {
        let r = run(&sh(), "echo oops >&2; exit 3", None).await;
        assert_eq!(r.stderr, "oops\n");
        assert_eq!(r.exit_code, 3);
    }

    #[tokio::test]
    async fn pipelines_run_in_the_shell() {
        let r = run(&sh(), "printf 'b\\na\\n' | sort", None).await;
        assert_eq!(r.stdout, "a\nb\n");
    }

    #[tokio::test]
    async fn overrunning_command_is_killed() {
        let r = run(&sh(), "sleep 5", Some(Duration::from_millis(200))).await;
        assert_eq!(r.exit_code, TIMEOUT_EXIT);
        assert!(r.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn overrun_keeps_partial_output() {
        let r = run(&sh(), "echo partial; sleep 5", Some(Duration::from_millis(300))).await;
        assert_eq!(r.exit_code, TIMEOUT_EXIT);
        assert_eq!(r.stdout, "partial\n");
        assert!(r.stderr.ends_with("timed out after 0.3s\n"));
    }

    #[tokio::test]
    async fn background_job_does_not_count_as_overrun() {
        let start = std::time::Instant::now();
        let r = run(&sh(), "sleep 3 & echo started", Some(Duration::from_secs(1))).await;
        assert_eq!(r.exit_code, 0);
        assert!(r.stdout.contains("started"));
        assert!(r.stderr.is_empty());
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn background_job_without_limit_returns_after_grace() {
        let r = run(&sh(), "sleep 3 & echo started; exit 4", None).await;
        assert_eq!(r.exit_code, 4);
        assert_eq!(r.stdout, "started\n");
    }

    #[tokio::test]
    async fn missing_shell_reports_spawn_failure() {
        let shell = Shell::parse("/nonexistent/sh").unwrap();
        let r = run(&shell, "true", None).await;
        assert_eq!(r.exit_code, SPAWN_FAILED_EXIT);
        assert!(r.stderr.starts_with("/nonexistent/sh"));
    }
}
