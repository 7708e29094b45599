//! Container exec checks.
//!
//! The container runtime is reached through an injected [`ExecClient`];
//! this crate never speaks a runtime wire protocol itself.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use vigil_core::HealthStatus;

use crate::DEFAULT_BUF_SIZE;
use crate::output::OutputBuffer;
use crate::runner::CheckProbe;

/// Failure reported by a container runtime call.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ExecError(pub String);

/// Minimal exec surface of a container runtime.
#[async_trait]
pub trait ExecClient: Send + Sync {
    /// Prepare `cmd` inside `container_id`; returns the exec ID.
    async fn create_exec(&self, container_id: &str, cmd: &[String]) -> Result<String, ExecError>;

    /// Run the exec to completion, streaming its output into `output`.
    async fn start_exec(
        &self,
        container_id: &str,
        exec_id: &str,
        output: &mut OutputBuffer,
    ) -> Result<(), ExecError>;

    /// Exit code of a finished exec.
    async fn inspect_exec(&self, container_id: &str, exec_id: &str) -> Result<i64, ExecError>;
}

/// Shell for script-style container checks: the configured one, then
/// `$SHELL`, then `/bin/sh`.
pub fn default_shell(configured: &str) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

pub struct DockerProbe {
    container_id: String,
    command: Vec<String>,
    output_max_size: usize,
    client: Arc<dyn ExecClient>,
}

impl DockerProbe {
    pub fn new(
        container_id: impl Into<String>,
        shell: &str,
        script: &str,
        args: &[String],
        client: Arc<dyn ExecClient>,
    ) -> Self {
        let command = if args.is_empty() {
            vec![default_shell(shell), "-c".to_string(), script.to_string()]
        } else {
            args.to_vec()
        };
        Self {
            container_id: container_id.into(),
            command,
            output_max_size: DEFAULT_BUF_SIZE,
            client,
        }
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
impl CheckProbe for DockerProbe {
    async fn evaluate(&self) -> (HealthStatus, String) {
        let container = &self.container_id;

        let exec_id = match self.client.create_exec(container, &self.command).await {
            Ok(id) => id,
            Err(e) => {
                warn!(%container, error = %e, "container exec create failed");
                return (
                    HealthStatus::Critical,
                    format!("Unable to create Exec, error: {e}"),
                );
            }
        };

        let mut output = OutputBuffer::new(self.output_max_size);
        if let Err(e) = self.client.start_exec(container, &exec_id, &mut output).await {
            warn!(%container, %exec_id, error = %e, "container exec start failed");
            return (HealthStatus::Critical, format!("Unable to start Exec: {e}"));
        }

        let exit_code = match self.client.inspect_exec(container, &exec_id).await {
            Ok(code) => code,
            Err(e) => {
                warn!(%container, %exec_id, error = %e, "container exec inspect failed");
                return (HealthStatus::Critical, format!("Unable to inspect Exec: {e}"));
            }
        };

        debug!(%container, %exec_id, exit_code, "container exec finished");
        let status = match exit_code {
            0 => HealthStatus::Passing,
            1 => HealthStatus::Warning,
            _ => HealthStatus::Critical,
        };
        (status, output.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted exec client: fixed output and exit code, optional failing step.
    struct FakeExec {
        output: &'static str,
        exit_code: i64,
        fail_at: Option<&'static str>,
    }

    #[async_trait]
    impl ExecClient for FakeExec {
        async fn create_exec(&self, _container: &str, _cmd: &[String]) -> Result<String, ExecError> {
            match self.fail_at {
                Some("create") => Err(ExecError("no such container".to_string())),
                _ => Ok("exec-1".to_string()),
            }
        }

        async fn start_exec(
            &self,
            _container: &str,
            _exec_id: &str,
            output: &mut OutputBuffer,
        ) -> Result<(), ExecError> {
            if self.fail_at == Some("start") {
                return Err(ExecError("socket closed".to_string()));
            }
            output.write(self.output.as_bytes());
            Ok(())
        }

        async fn inspect_exec(&self, _container: &str, _exec_id: &str) -> Result<i64, ExecError> {
            match self.fail_at {
                Some("inspect") => Err(ExecError("gone".to_string())),
                _ => Ok(self.exit_code),
            }
        }
    }

    fn probe(exit_code: i64, fail_at: Option<&'static str>) -> DockerProbe {
        let client = Arc::new(FakeExec {
            output: "pong",
            exit_code,
            fail_at,
        });
        DockerProbe::new("db", "/bin/bash", "redis-cli ping", &[], client)
    }

    #[tokio::test]
    async fn exit_codes_map_to_status() {
        assert_eq!(probe(0, None).evaluate().await, (HealthStatus::Passing, "pong".to_string()));
        assert_eq!(probe(1, None).evaluate().await.0, HealthStatus::Warning);
        assert_eq!(probe(137, None).evaluate().await.0, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn step_failures_are_critical() {
        assert_eq!(
            probe(0, Some("create")).evaluate().await,
            (
                HealthStatus::Critical,
                "Unable to create Exec, error: no such container".to_string()
            )
        );
        assert_eq!(
            probe(0, Some("start")).evaluate().await.1,
            "Unable to start Exec: socket closed"
        );
        assert_eq!(
            probe(0, Some("inspect")).evaluate().await.1,
            "Unable to inspect Exec: gone"
        );
    }

    #[test]
    fn command_uses_shell_for_scripts() {
        let p = probe(0, None);
        assert_eq!(p.command(), ["/bin/bash", "-c", "redis-cli ping"]);

        let client = Arc::new(FakeExec {
            output: "",
            exit_code: 0,
            fail_at: None,
        });
        let direct = DockerProbe::new("db", "", "", &["/check".to_string()], client);
        assert_eq!(direct.command(), ["/check"]);
    }

    #[test]
    fn configured_shell_wins() {
        assert_eq!(default_shell("/bin/zsh"), "/bin/zsh");
        assert!(!default_shell("").is_empty());
    }
}
