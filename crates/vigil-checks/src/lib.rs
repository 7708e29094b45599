//! Vigil check engines.
//!
//! Each engine owns one driver task that evaluates its probe, reports the
//! result through a [`vigil_core::CheckNotifier`], and sleeps until the
//! next run. TTL checks invert this: the application pushes status and the
//! engine only reports when the deadline passes.

use std::time::Duration;

pub mod docker;
pub mod error;
pub mod http;
pub mod output;
pub mod runner;
pub mod script;
pub mod status_handler;
pub mod tcp;
pub mod ttl;

pub use docker::{DockerProbe, ExecClient, ExecError};
pub use error::{CheckError, CheckResult};
pub use http::{HttpProbe, status_for_code};
pub use output::OutputBuffer;
pub use runner::{Check, CheckProbe, IntervalCheck};
pub use script::ScriptProbe;
pub use status_handler::StatusHandler;
pub use tcp::TcpProbe;
pub use ttl::TtlCheck;

/// Shortest interval a check may run at.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Default output capture size in bytes.
pub const DEFAULT_BUF_SIZE: usize = 4 * 1024;

pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for HTTP and TCP probes.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub const USER_AGENT: &str = "Vigil Health Check";
