//! TTL checks: status is pushed by the application and goes critical when
//! it stops pushing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vigil_core::{CheckNotifier, HealthStatus};

use crate::DEFAULT_BUF_SIZE;
use crate::output::truncate_output;
use crate::runner::{Check, DriverSlot};

pub struct TtlCheck {
    check_id: String,
    ttl: Duration,
    output_max_size: usize,
    notifier: Arc<dyn CheckNotifier>,
    shared: Arc<TtlShared>,
    driver: DriverSlot,
}

#[derive(Default)]
struct TtlShared {
    last_output: Mutex<String>,
    reset: Notify,
}

impl TtlShared {
    fn last_output(&self) -> String {
        match self.last_output.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_last_output(&self, output: &str) {
        let mut guard = match self.last_output.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = output.to_string();
    }
}

impl TtlCheck {
    pub fn new(
        check_id: impl Into<String>,
        ttl: Duration,
        output_max_size: usize,
        notifier: Arc<dyn CheckNotifier>,
    ) -> Self {
        Self {
            check_id: check_id.into(),
            ttl,
            output_max_size: if output_max_size == 0 {
                DEFAULT_BUF_SIZE
            } else {
                output_max_size
            },
            notifier,
            shared: Arc::new(TtlShared::default()),
            driver: DriverSlot::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Report a status now and push the deadline out by one TTL.
    ///
    /// Returns the output as stored, after truncation.
    pub fn set_status(&self, status: HealthStatus, output: &str) -> String {
        let output = truncate_output(output, self.output_max_size);
        debug!(check_id = %self.check_id, %status, "check status updated");
        self.notifier.update_check(&self.check_id, status, &output);
        self.shared.set_last_output(&output);
        self.shared.reset.notify_one();
        output
    }
}

#[async_trait]
impl Check for TtlCheck {
    fn check_id(&self) -> &str {
        &self.check_id
    }

    fn start(&self) {
        let check_id = self.check_id.clone();
        let ttl = self.ttl;
        let notifier = Arc::clone(&self.notifier);
        let shared = Arc::clone(&self.shared);
        self.driver
            .spawn(move |cancel| run_ttl(check_id, ttl, notifier, shared, cancel));
    }

    async fn stop(&self) {
        self.driver.stop().await;
    }
}

async fn run_ttl(
    check_id: String,
    ttl: Duration,
    notifier: Arc<dyn CheckNotifier>,
    shared: Arc<TtlShared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = shared.reset.notified() => continue,
            _ = tokio::time::sleep(ttl) => {}
        }

        warn!(%check_id, "check missed TTL, is now critical");
        notifier.update_check(&check_id, HealthStatus::Critical, &shared.last_output());

        // One critical per missed deadline; wait for the next update.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = shared.reset.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::tests::RecordingNotifier;

    fn ttl_check(notifier: &Arc<RecordingNotifier>) -> TtlCheck {
        TtlCheck::new("app", Duration::from_secs(10), 0, notifier.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_reports_critical_once_with_prior_output() {
        let notifier = Arc::new(RecordingNotifier::default());
        let check = ttl_check(&notifier);
        check.start();
        check.set_status(HealthStatus::Passing, "all good");

        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        let calls = notifier.calls();
        assert_eq!(
            calls,
            vec![
                ("app".to_string(), HealthStatus::Passing, "all good".to_string()),
                ("app".to_string(), HealthStatus::Critical, "all good".to_string()),
            ]
        );
        check.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn updates_push_deadline_out() {
        let notifier = Arc::new(RecordingNotifier::default());
        let check = ttl_check(&notifier);
        check.start();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(6)).await;
            check.set_status(HealthStatus::Passing, "ok");
        }
        check.stop().await;

        let calls = notifier.calls();
        assert_eq!(calls.len(), 5);
        assert!(calls.iter().all(|(_, s, _)| *s == HealthStatus::Passing));
    }

    #[tokio::test(start_paused = true)]
    async fn update_after_expiry_rearms() {
        let notifier = Arc::new(RecordingNotifier::default());
        let check = ttl_check(&notifier);
        check.start();

        tokio::time::sleep(Duration::from_secs(11)).await;
        check.set_status(HealthStatus::Warning, "slow");
        tokio::time::sleep(Duration::from_secs(11)).await;
        check.stop().await;

        let statuses: Vec<_> = notifier.calls().into_iter().map(|(_, s, o)| (s, o)).collect();
        assert_eq!(
            statuses,
            vec![
                (HealthStatus::Critical, String::new()),
                (HealthStatus::Warning, "slow".to_string()),
                (HealthStatus::Critical, "slow".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_expiry_after_stop() {
        let notifier = Arc::new(RecordingNotifier::default());
        let check = ttl_check(&notifier);
        check.start();
        check.stop().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(notifier.calls().is_empty());
    }

    #[test]
    fn set_status_truncates_long_output() {
        let notifier = Arc::new(RecordingNotifier::default());
        let check = TtlCheck::new("app", Duration::from_secs(10), 4, notifier.clone());
        let stored = check.set_status(HealthStatus::Passing, "abcdefgh");
        assert_eq!(stored, "abcd ... (captured 4 of 8 bytes)");
        assert_eq!(notifier.calls()[0].2, stored);
    }
}
