//! Builds the running engine for a check definition.

use std::sync::Arc;

use vigil_checks::{
    Check, CheckProbe, DockerProbe, ExecClient, HttpProbe, IntervalCheck, MIN_INTERVAL, ScriptProbe,
    StatusHandler, TcpProbe, TtlCheck,
};
use vigil_core::{CheckNotifier, CheckType, Probe};

use crate::error::{AgentError, AgentResult};

pub(crate) enum Engine {
    Interval(Arc<dyn Check>),
    /// Kept typed so status updates can reach it.
    Ttl(Arc<TtlCheck>),
}

impl Engine {
    pub(crate) fn check(&self) -> Arc<dyn Check> {
        match self {
            Engine::Interval(check) => Arc::clone(check),
            Engine::Ttl(ttl) => Arc::clone(ttl) as Arc<dyn Check>,
        }
    }
}

/// Construct, but do not start, the engine for `check_type`.
pub(crate) fn build_engine(
    check_id: &str,
    check_type: &CheckType,
    notifier: Arc<dyn CheckNotifier>,
    exec_client: Option<&Arc<dyn ExecClient>>,
) -> AgentResult<Engine> {
    let engine = match &check_type.probe {
        Probe::Ttl { ttl } => Engine::Ttl(Arc::new(TtlCheck::new(
            check_id,
            *ttl,
            check_type.output_max_size,
            notifier,
        ))),
        Probe::Script { script, args } => {
            let probe = ScriptProbe::new(script, args)
                .with_timeout(check_type.timeout)
                .with_output_max_size(check_type.output_max_size);
            interval_engine(check_id, check_type, probe, notifier)
        }
        Probe::Http {
            url,
            method,
            headers,
            body,
            tls_skip_verify,
        } => {
            let probe = HttpProbe::new(url, method, headers.clone(), body, *tls_skip_verify)?
                .with_timeout(check_type.timeout)
                .with_output_max_size(check_type.output_max_size);
            interval_engine(check_id, check_type, probe, notifier)
        }
        Probe::Tcp { address } => {
            let probe = TcpProbe::new(address.clone()).with_timeout(check_type.timeout);
            interval_engine(check_id, check_type, probe, notifier)
        }
        Probe::Docker {
            container_id,
            shell,
            script,
            args,
        } => {
            let client = exec_client
                .cloned()
                .ok_or_else(|| AgentError::ExecClientUnavailable(check_id.to_string()))?;
            let probe = DockerProbe::new(container_id.clone(), shell, script, args, client)
                .with_output_max_size(check_type.output_max_size);
            interval_engine(check_id, check_type, probe, notifier)
        }
    };
    Ok(engine)
}

/// Interval engines report through a [`StatusHandler`] when either
/// threshold is set. Intervals below [`MIN_INTERVAL`] are raised to it.
fn interval_engine<P: CheckProbe>(
    check_id: &str,
    check_type: &CheckType,
    probe: P,
    notifier: Arc<dyn CheckNotifier>,
) -> Engine {
    let notifier: Arc<dyn CheckNotifier> =
        if check_type.success_before_passing > 0 || check_type.failures_before_critical > 0 {
            Arc::new(StatusHandler::new(
                notifier,
                check_type.success_before_passing,
                check_type.failures_before_critical,
            ))
        } else {
            notifier
        };
    let interval = check_type.interval.unwrap_or(MIN_INTERVAL).max(MIN_INTERVAL);
    Engine::Interval(Arc::new(IntervalCheck::new(check_id, interval, probe, notifier)))
}
