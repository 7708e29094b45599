//! Script checks: run a local command and map its exit code.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::warn;

use vigil_core::HealthStatus;
use vigil_core::duration::format_duration;

use crate::output::OutputBuffer;
use crate::runner::CheckProbe;
use crate::{DEFAULT_BUF_SIZE, DEFAULT_SCRIPT_TIMEOUT};

/// Runs `args` directly, or `script` through `sh -c` when `args` is empty.
///
/// Exit 0 is passing, 1 is warning, anything else is critical.
#[derive(Debug, Clone)]
pub struct ScriptProbe {
    command: Vec<String>,
    timeout: Duration,
    output_max_size: usize,
}

impl ScriptProbe {
    pub fn new(script: &str, args: &[String]) -> Self {
        let command = if args.is_empty() {
            vec!["sh".to_string(), "-c".to_string(), script.to_string()]
        } else {
            args.to_vec()
        };
        Self {
            command,
            timeout: DEFAULT_SCRIPT_TIMEOUT,
            output_max_size: DEFAULT_BUF_SIZE,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        if let Some(t) = timeout.filter(|t| !t.is_zero()) {
            self.timeout = t;
        }
        self
    }

    pub fn with_output_max_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.output_max_size = size;
        }
        self
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }
}

#[async_trait]
impl CheckProbe for ScriptProbe {
    async fn evaluate(&self) -> (HealthStatus, String) {
        let Some((program, rest)) = self.command.split_first() else {
            return (HealthStatus::Critical, "no command to run".to_string());
        };

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command = ?self.command, error = %e, "failed to start check script");
                return (HealthStatus::Critical, format!("Failed to run check: {e}"));
            }
        };
        let mut group = GroupKill::new(child.id());
        let mut output = OutputBuffer::new(self.output_max_size);
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let run = async {
            drain(&mut stdout, &mut stderr, &mut output).await;
            child.wait().await
        };
        let waited = tokio::time::timeout(self.timeout, run).await;

        match waited {
            Ok(Ok(exit)) => {
                group.disarm();
                let status = match exit.code() {
                    Some(0) => HealthStatus::Passing,
                    Some(1) => HealthStatus::Warning,
                    _ => HealthStatus::Critical,
                };
                (status, output.render())
            }
            Ok(Err(e)) => (HealthStatus::Critical, format!("Failed to wait for check: {e}")),
            Err(_) => {
                group.kill();
                let _ = child.kill().await;
                let mut msg = format!("Timed out ({}) running check", format_duration(self.timeout));
                warn!(command = ?self.command, timeout = ?self.timeout, "check timed out");
                let captured = output.render();
                if !captured.is_empty() {
                    msg.push_str("\n\n");
                    msg.push_str(&captured);
                }
                (HealthStatus::Critical, msg)
            }
        }
    }
}

/// Read stdout and stderr concurrently into one buffer until both close.
async fn drain<O, E>(stdout: &mut Option<O>, stderr: &mut Option<E>, output: &mut OutputBuffer)
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_buf = [0u8; 1024];
    let mut err_buf = [0u8; 1024];
    loop {
        match (stdout.as_mut(), stderr.as_mut()) {
            (None, None) => return,
            (Some(out), None) => match out.read(&mut out_buf).await {
                Ok(n) if n > 0 => output.write(&out_buf[..n]),
                _ => *stdout = None,
            },
            (None, Some(err)) => match err.read(&mut err_buf).await {
                Ok(n) if n > 0 => output.write(&err_buf[..n]),
                _ => *stderr = None,
            },
            (Some(out), Some(err)) => {
                tokio::select! {
                    r = out.read(&mut out_buf) => match r {
                        Ok(n) if n > 0 => output.write(&out_buf[..n]),
                        _ => *stdout = None,
                    },
                    r = err.read(&mut err_buf) => match r {
                        Ok(n) if n > 0 => output.write(&err_buf[..n]),
                        _ => *stderr = None,
                    },
                }
            }
        }
    }
}

/// Kills the whole process group of a check script unless disarmed.
/// Dropping an armed guard (cancelled probe) kills as well.
struct GroupKill {
    pgid: Option<i32>,
}

impl GroupKill {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| i32::try_from(p).ok()),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            // SAFETY: plain syscall; a stale group id only yields ESRCH.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exit_codes_map_to_status() {
        let ok = ScriptProbe::new("echo hello", &[]);
        assert_eq!(ok.evaluate().await, (HealthStatus::Passing, "hello\n".to_string()));

        let warn = ScriptProbe::new("echo degraded >&2; exit 1", &[]);
        assert_eq!(warn.evaluate().await, (HealthStatus::Warning, "degraded\n".to_string()));

        let crit = ScriptProbe::new("exit 2", &[]);
        assert_eq!(crit.evaluate().await.0, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn args_run_without_shell() {
        let probe = ScriptProbe::new("", &["echo".to_string(), "a b".to_string()]);
        assert_eq!(probe.command(), ["echo", "a b"]);
        assert_eq!(probe.evaluate().await, (HealthStatus::Passing, "a b\n".to_string()));
    }

    #[tokio::test]
    async fn missing_binary_is_critical() {
        let probe = ScriptProbe::new("", &["/nonexistent/vigil-check".to_string()]);
        let (status, output) = probe.evaluate().await;
        assert_eq!(status, HealthStatus::Critical);
        assert!(output.starts_with("Failed to run check"));
    }

    #[tokio::test]
    async fn timeout_kills_and_reports() {
        let probe = ScriptProbe::new("echo started; sleep 30", &[])
            .with_timeout(Some(Duration::from_millis(300)));
        let started = std::time::Instant::now();
        let (status, output) = probe.evaluate().await;

        assert_eq!(status, HealthStatus::Critical);
        assert!(output.starts_with("Timed out (300ms) running check"), "{output}");
        assert!(output.ends_with("started\n"), "{output}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn large_output_is_capped() {
        let probe = ScriptProbe::new("head -c 100 /dev/zero | tr '\\0' x", &[])
            .with_output_max_size(10);
        let (status, output) = probe.evaluate().await;
        assert_eq!(status, HealthStatus::Passing);
        assert_eq!(output, "Captured 10 of 100 bytes\n...\nxxxxxxxxxx");
    }
}
