//! TCP checks: a successful connect is passing.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use vigil_core::HealthStatus;
use vigil_core::duration::format_duration;

use crate::DEFAULT_PROBE_TIMEOUT;
use crate::runner::CheckProbe;

#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        if let Some(t) = timeout.filter(|t| !t.is_zero()) {
            self.timeout = t;
        }
        self
    }
}

#[async_trait]
impl CheckProbe for TcpProbe {
    async fn evaluate(&self) -> (HealthStatus, String) {
        let addr = &self.address;
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => (HealthStatus::Passing, format!("TCP connect {addr}: Success")),
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "tcp check failed");
                (HealthStatus::Critical, format!("TCP connect {addr}: {e}"))
            }
            Err(_) => (
                HealthStatus::Critical,
                format!(
                    "TCP connect {addr}: timed out after {}",
                    format_duration(self.timeout)
                ),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn open_port_is_passing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (status, output) = TcpProbe::new(&addr).evaluate().await;
        assert_eq!(status, HealthStatus::Passing);
        assert_eq!(output, format!("TCP connect {addr}: Success"));
    }

    #[tokio::test]
    async fn closed_port_is_critical() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (status, output) = TcpProbe::new(&addr).evaluate().await;
        assert_eq!(status, HealthStatus::Critical);
        assert!(output.starts_with(&format!("TCP connect {addr}: ")));
        assert!(!output.ends_with("Success"));
    }
}
