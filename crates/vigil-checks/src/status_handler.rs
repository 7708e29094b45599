//! Consecutive-result thresholds in front of a notifier.

use std::sync::{Arc, Mutex};

use tracing::debug;

use vigil_core::{CheckNotifier, HealthStatus};

#[derive(Debug, Default)]
struct Counters {
    successes: u32,
    failures: u32,
}

/// Holds back a status change until it has been seen enough times in a
/// row. Passing and warning count as successes, critical as a failure.
/// With both thresholds at 0 every result is forwarded.
pub struct StatusHandler {
    inner: Arc<dyn CheckNotifier>,
    success_before_passing: u32,
    failures_before_critical: u32,
    counters: Mutex<Counters>,
}

impl StatusHandler {
    pub fn new(
        inner: Arc<dyn CheckNotifier>,
        success_before_passing: u32,
        failures_before_critical: u32,
    ) -> Self {
        Self {
            inner,
            success_before_passing,
            failures_before_critical,
            counters: Mutex::new(Counters::default()),
        }
    }
}

impl CheckNotifier for StatusHandler {
    fn update_check(&self, check_id: &str, status: HealthStatus, output: &str) {
        let forward = {
            let mut c = match self.counters.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if status == HealthStatus::Critical {
                c.successes = 0;
                c.failures = c.failures.saturating_add(1);
                c.failures >= self.failures_before_critical
            } else {
                c.failures = 0;
                c.successes = c.successes.saturating_add(1);
                c.successes >= self.success_before_passing
            }
        };

        if forward {
            self.inner.update_check(check_id, status, output);
        } else {
            debug!(%check_id, %status, "check result below threshold, holding status");
        }
    }
}
