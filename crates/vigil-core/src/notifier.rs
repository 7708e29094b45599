use crate::types::HealthStatus;

/// Sink for check results.
///
/// Engines call this after every evaluation, also when nothing changed.
/// Implementations must be cheap and must not block on the caller's engine.
pub trait CheckNotifier: Send + Sync {
    fn update_check(&self, check_id: &str, status: HealthStatus, output: &str);
}
