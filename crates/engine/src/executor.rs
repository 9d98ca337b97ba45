//! Runs one check command under a hard wall-clock deadline.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use checkmill_core::job::OUTPUT_TIMED_OUT;

// Metacharacters that force execution through the shell, same set the
// monitoring cores use when deciding how to launch a plugin.
const SHELL_CHARS: &str = "!$^&*()~[]\\|{};<>?`\"'";

/// How long a timed-out child gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// What happened to one check command.
///
/// Execution is infallible from the caller's point of view: spawn
/// failures and timeouts are encoded as results, since every dispatched
/// check must produce one.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// 0–3 for plugin states, `128 + signal` when the child was killed.
    pub return_code: i32,
    /// Merged stdout/stderr with trailing whitespace stripped.
    pub output: String,
    /// True when the wall-clock deadline expired first.
    pub early_timeout: bool,
    /// True when the child terminated through a normal exit.
    pub exited_ok: bool,
    /// Execution start, epoch seconds.
    pub start: f64,
    /// Execution end, epoch seconds.
    pub finish: f64,
}

/// Current wall clock as fractional epoch seconds.
pub(crate) fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

pub(crate) fn needs_shell(command_line: &str) -> bool {
    command_line.chars().any(|c| SHELL_CHARS.contains(c))
}

/// Map a wait status onto a plugin return code.
///
/// Normal exit keeps the exit status, death by signal `s` becomes
/// `128 + s`, anything else is UNKNOWN (3).
pub(crate) fn classify(status: std::process::ExitStatus) -> (i32, bool) {
    use std::os::unix::process::ExitStatusExt;
    if let Some(code) = status.code() {
        (code, true)
    } else if let Some(signal) = status.signal() {
        (128 + signal, false)
    } else {
        (3, false)
    }
}

fn spawn_failure(start: f64, reason: &str) -> ExecOutcome {
    ExecOutcome {
        return_code: 3,
        output: format!("(Failed To Execute Check: {reason})"),
        early_timeout: false,
        exited_ok: false,
        start,
        finish: now_epoch(),
    }
}

fn build_command(command_line: &str) -> Option<Command> {
    if needs_shell(command_line) {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command_line);
        return Some(cmd);
    }
    let mut parts = command_line.split_whitespace();
    let program = parts.next()?;
    let mut cmd = Command::new(program);
    cmd.args(parts);
    Some(cmd)
}

fn signal_group(child: &Child, signal: i32) {
    // The child is its own process-group leader, so the negative pid
    // reaches the whole tree.
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

/// Execute a command line and wait for it, enforcing `timeout`.
pub async fn run(command_line: &str, timeout: Duration) -> ExecOutcome {
    let start = now_epoch();

    let Some(mut cmd) = build_command(command_line) else {
        return spawn_failure(start, "empty command line");
    };
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => return spawn_failure(start, &err.to_string()),
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(read_to_end(stdout));
    let stderr_task = tokio::spawn(read_to_end(stderr));

    let (status, early_timeout) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (Some(status), false),
        Ok(Err(err)) => {
            signal_group(&child, libc::SIGKILL);
            let _ = child.wait().await;
            return spawn_failure(start, &err.to_string());
        }
        Err(_) => {
            signal_group(&child, libc::SIGTERM);
            let status = match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(status) => status.ok(),
                Err(_) => {
                    signal_group(&child, libc::SIGKILL);
                    child.wait().await.ok()
                }
            };
            (status, true)
        }
    };

    let mut merged = stdout_task.await.unwrap_or_default();
    let stderr_bytes = stderr_task.await.unwrap_or_default();
    if !merged.is_empty() && !stderr_bytes.is_empty() && !merged.ends_with(b"\n") {
        merged.push(b'\n');
    }
    merged.extend_from_slice(&stderr_bytes);

    let finish = now_epoch();

    if early_timeout {
        return ExecOutcome {
            return_code: 2,
            output: OUTPUT_TIMED_OUT.to_string(),
            early_timeout: true,
            exited_ok: false,
            start,
            finish,
        };
    }

    let (return_code, exited_ok) = match status {
        Some(status) => classify(status),
        None => (3, false),
    };

    ExecOutcome {
        return_code,
        output: String::from_utf8_lossy(&merged).trim_end().to_string(),
        early_timeout: false,
        exited_ok,
        start,
        finish,
    }
}

async fn read_to_end(reader: Option<impl AsyncReadExt + Unpin>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::time::Instant;

    #[test]
    fn shell_dispatch_only_on_metacharacters() {
        assert!(!needs_shell("/bin/echo OK"));
        assert!(!needs_shell("/usr/lib/nagios/plugins/check_ping -H 10.0.0.1 -w 100,20%"));
        assert!(needs_shell("/bin/echo OK && /bin/echo FAIL"));
        assert!(needs_shell("echo $HOSTNAME"));
        assert!(needs_shell("check_foo | grep bar"));
    }

    #[test]
    fn classification_covers_all_wait_statuses() {
        for code in 0..=255 {
            let status = ExitStatus::from_raw(code << 8);
            let (rc, exited_ok) = classify(status);
            assert_eq!(rc, code);
            assert!(exited_ok);
        }
        for signal in 1..=31 {
            let status = ExitStatus::from_raw(signal);
            let (rc, exited_ok) = classify(status);
            assert_eq!(rc, 128 + signal);
            assert!(!exited_ok);
        }
    }

    #[tokio::test]
    async fn captures_stdout_of_a_plain_command() {
        let outcome = run("/bin/echo OK", Duration::from_secs(10)).await;
        assert_eq!(outcome.return_code, 0);
        assert_eq!(outcome.output, "OK");
        assert!(!outcome.early_timeout);
        assert!(outcome.exited_ok);
        assert!(outcome.finish >= outcome.start);
    }

    #[tokio::test]
    async fn reports_the_exit_status() {
        let outcome = run("/bin/sh -c 'exit 2'", Duration::from_secs(10)).await;
        assert_eq!(outcome.return_code, 2);
        assert!(outcome.exited_ok);
    }

    #[tokio::test]
    async fn merges_stdout_and_stderr() {
        let outcome = run("/bin/sh -c 'echo out; echo err 1>&2'", Duration::from_secs(10)).await;
        assert!(outcome.output.contains("out"));
        assert!(outcome.output.contains("err"));
    }

    #[tokio::test]
    async fn strips_trailing_whitespace() {
        let outcome = run("/bin/sh -c 'printf \"OK  \\n\\n\"'", Duration::from_secs(10)).await;
        assert_eq!(outcome.output, "OK");
    }

    #[tokio::test]
    async fn kills_a_check_that_overstays_its_deadline() {
        let started = Instant::now();
        let outcome = run("/bin/sleep 30", Duration::from_millis(300)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.return_code, 2);
        assert!(outcome.early_timeout);
        assert!(!outcome.exited_ok);
        assert_eq!(outcome.output, OUTPUT_TIMED_OUT);
    }

    #[tokio::test]
    async fn spawn_failure_is_unknown() {
        let outcome = run("/nonexistent/plugin -w 1", Duration::from_secs(10)).await;
        assert_eq!(outcome.return_code, 3);
        assert!(!outcome.exited_ok);
        assert!(outcome.output.contains("Failed To Execute Check"));
    }

    #[tokio::test]
    async fn empty_command_line_is_a_spawn_failure() {
        let outcome = run("   ", Duration::from_secs(1)).await;
        assert_eq!(outcome.return_code, 3);
    }

    #[tokio::test]
    async fn death_by_signal_maps_to_128_plus_signal() {
        // The dollar sign routes this through the shell; the builtin kill
        // then takes the shell itself down with SIGTERM.
        let outcome = run("kill -TERM $$", Duration::from_secs(10)).await;
        assert_eq!(outcome.return_code, 128 + libc::SIGTERM);
        assert!(!outcome.exited_ok);
    }
}
