//! Engine lifecycle shared by every check type.
//!
//! # Architecture
//!
//! ```text
//!   start() ──► spawn driver ──► stagger ──► probe ──► notify ──► sleep(interval) ─┐
//!                    ▲                         ▲                                   │
//!                    │                         └───────────────────────────────────┘
//!   stop() ── cancel token ──► await driver exit
//! ```
//!
//! One driver task per engine. Evaluations never overlap. Cancelling drops
//! the in-flight probe future, which kills child processes and closes
//! sockets owned by it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use vigil_core::{CheckNotifier, HealthStatus};

/// A running health check.
#[async_trait]
pub trait Check: Send + Sync {
    fn check_id(&self) -> &str;

    /// Spawn the driver task. A second call while running is a no-op.
    fn start(&self);

    /// Cancel the driver and wait for it to exit. Idempotent. No notifier
    /// call happens after this returns.
    async fn stop(&self);
}

/// One evaluation of an interval-driven check.
#[async_trait]
pub trait CheckProbe: Send + Sync + 'static {
    async fn evaluate(&self) -> (HealthStatus, String);
}

/// Handle on a spawned driver task.
#[derive(Default)]
pub(crate) struct DriverSlot {
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl DriverSlot {
    /// Spawn `driver` unless one is already running.
    pub(crate) fn spawn<F, Fut>(&self, driver: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut running = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(driver(cancel.clone()));
        *running = Some((cancel, handle));
    }

    pub(crate) async fn stop(&self) {
        let taken = match self.running.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some((cancel, handle)) = taken {
            cancel.cancel();
            let _ = handle.await;
        }
    }
}

/// Random delay in `[0, interval)` so checks registered together spread out.
pub(crate) fn stagger(interval: Duration) -> Duration {
    if interval.is_zero() {
        return Duration::ZERO;
    }
    rand::thread_rng().gen_range(Duration::ZERO..interval)
}

/// Runs a [`CheckProbe`] every `interval` and reports each result.
pub struct IntervalCheck<P: CheckProbe> {
    check_id: String,
    interval: Duration,
    probe: Arc<P>,
    notifier: Arc<dyn CheckNotifier>,
    driver: DriverSlot,
}

impl<P: CheckProbe> IntervalCheck<P> {
    pub fn new(
        check_id: impl Into<String>,
        interval: Duration,
        probe: P,
        notifier: Arc<dyn CheckNotifier>,
    ) -> Self {
        Self {
            check_id: check_id.into(),
            interval,
            probe: Arc::new(probe),
            notifier,
            driver: DriverSlot::default(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }
}

#[async_trait]
impl<P: CheckProbe> Check for IntervalCheck<P> {
    fn check_id(&self) -> &str {
        &self.check_id
    }

    fn start(&self) {
        let check_id = self.check_id.clone();
        let interval = self.interval;
        let probe = Arc::clone(&self.probe);
        let notifier = Arc::clone(&self.notifier);
        self.driver.spawn(move |cancel| {
            run_interval(check_id, interval, probe, notifier, cancel)
        });
    }

    async fn stop(&self) {
        self.driver.stop().await;
        debug!(check_id = %self.check_id, "check stopped");
    }
}

async fn run_interval<P: CheckProbe>(
    check_id: String,
    interval: Duration,
    probe: Arc<P>,
    notifier: Arc<dyn CheckNotifier>,
    cancel: CancellationToken,
) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(stagger(interval)) => {}
    }

    loop {
        let (status, output) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = probe.evaluate() => result,
        };
        trace!(%check_id, %status, %output, "check evaluated");
        notifier.update_check(&check_id, status, &output);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
