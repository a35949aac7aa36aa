//! Process monitoring shared by every backend.

use anyhow::Result;
use std::io::Read;
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

/// Interval between exit checks while waiting on a worker
pub const POLL_INTERVAL_MS: u64 = 50;

/// Lines of worker stderr kept in error summaries
pub const STDERR_TAIL_LINES: usize = 20;

/// Outcome of [`wait_with_timeout`].
#[derive(Debug)]
pub struct WaitOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Wait for `child`, killing its whole process group once `timeout` elapses.
///
/// stdout/stderr are drained on background threads while the process runs;
/// a worker writing more than a pipe buffer would otherwise block forever.
/// With `stream_stderr`, worker stderr is forwarded live to our stderr.
pub fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    stream_stderr: bool,
) -> Result<WaitOutcome> {
    let start = Instant::now();
    let check_interval = Duration::from_millis(POLL_INTERVAL_MS);

    let stdout_handle = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut s = String::new();
            let _ = out.read_to_string(&mut s);
            s
        })
    });
    let stderr_handle = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            use std::io::Write;
            let mut s = String::new();
            let mut buf = [0u8; 4096];
            loop {
                match err.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        s.push_str(&String::from_utf8_lossy(&buf[..n]));
                        if stream_stderr {
                            let _ = std::io::stderr().write_all(&buf[..n]);
                            let _ = std::io::stderr().flush();
                        }
                    }
                    Err(_) => break,
                }
            }
            s
        })
    });

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = stdout_handle
                    .map(|h| h.join().unwrap_or_default())
                    .unwrap_or_default();
                let stderr = stderr_handle
                    .map(|h| h.join().unwrap_or_default())
                    .unwrap_or_default();
                return Ok(WaitOutcome {
                    stdout,
                    stderr,
                    exit_code: status.code().unwrap_or(-1),
                    timed_out: false,
                });
            }
            Ok(None) => {}
            Err(e) => {
                kill_process_group(child);
                let _ = stdout_handle.map(|h| h.join());
                let _ = stderr_handle.map(|h| h.join());
                return Err(anyhow::anyhow!("Failed to wait for worker: {}", e));
            }
        }

        if start.elapsed() > timeout {
            kill_process_group(child);
            let _ = child.wait();
            let _ = stdout_handle.map(|h| h.join());
            let stderr = stderr_handle
                .map(|h| h.join().unwrap_or_default())
                .unwrap_or_default();
            return Ok(WaitOutcome {
                stdout: String::new(),
                stderr,
                exit_code: -1,
                timed_out: true,
            });
        }

        thread::sleep(check_interval);
    }
}

/// Kill the child and everything in its process group. Workers are spawned
/// as group leaders, so the group id equals the child pid.
#[cfg(unix)]
pub fn kill_process_group(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    if let Err(e) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        tracing::debug!("killpg({}) failed: {}", child.id(), e);
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
pub fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}

/// Last `STDERR_TAIL_LINES` non-empty lines of `stderr`.
pub fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let input: String = (0..50).map(|i| format!("line {}\n\n", i)).collect();
        let tail = stderr_tail(&input);
        assert_eq!(tail.lines().count(), STDERR_TAIL_LINES);
        assert!(tail.starts_with("line 30"));
        assert!(tail.ends_with("line 49"));
    }

    #[cfg(unix)]
    #[test]
    fn test_wait_collects_output() {
        use std::process::{Command, Stdio};
        let mut child = Command::new("sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let outcome = wait_with_timeout(&mut child, Duration::from_secs(10), false).unwrap();
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn test_wait_kills_on_timeout() {
        use std::os::unix::process::CommandExt;
        use std::process::{Command, Stdio};
        let mut child = Command::new("sh")
            .args(["-c", "sleep 30"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .unwrap();
        let start = Instant::now();
        let outcome = wait_with_timeout(&mut child, Duration::from_millis(300), false).unwrap();
        assert!(outcome.timed_out);
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
