//! Central config cache: fetches and watches resolved service defaults.
//!
//! # Architecture
//!
//! ```text
//!   ServiceManager ──get()────► ResolvedConfigCache ──rpc(min_index=0)──► Rpc backend
//!                  ──notify()─► fetch loop ──rpc(min_index=last)──┐        (blocking query)
//!                                  ▲                              │
//!                                  └── UpdateEvent ◄── index moved┘
//! ```
//!
//! A watch delivers one event per observed index change, and every error
//! as an error event, backing off between failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vigil_core::{ServiceConfigRequest, ServiceConfigResponse};

use crate::error::CacheError;

/// RPC method resolving central service defaults.
pub const RESOLVE_SERVICE_CONFIG: &str = "ConfigEntry.ResolveServiceConfig";

/// A result delivered by a cache watch.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub correlation_id: String,
    pub result: Result<ServiceConfigResponse, CacheError>,
}

/// Source of resolved central service configuration.
#[async_trait]
pub trait ConfigCache: Send + Sync {
    /// Fetch the current value.
    async fn get(&self, req: &ServiceConfigRequest) -> Result<ServiceConfigResponse, CacheError>;

    /// Deliver an [`UpdateEvent`] tagged `correlation_id` on `tx` every time
    /// the value changes, until `cancel` fires or the receiver is dropped.
    async fn notify(
        &self,
        cancel: CancellationToken,
        req: ServiceConfigRequest,
        correlation_id: String,
        tx: mpsc::Sender<UpdateEvent>,
    ) -> Result<(), CacheError>;
}

/// Request/response transport to whatever serves central config.
#[async_trait]
pub trait Rpc: Send + Sync + 'static {
    async fn rpc(&self, method: &str, args: Value) -> Result<Value, CacheError>;
}

/// Arguments of [`RESOLVE_SERVICE_CONFIG`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolveArgs {
    #[serde(flatten)]
    pub request: ServiceConfigRequest,
    /// Block until the store index passes this value (0 = no blocking).
    #[serde(default)]
    pub min_index: u64,
}

/// Exponential retry delay for a failing watch.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            current: base,
            max,
        }
    }

    /// Delay to wait now; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// [`ConfigCache`] backed by blocking queries against an [`Rpc`] backend.
pub struct ResolvedConfigCache<R: Rpc> {
    rpc: Arc<R>,
}

impl<R: Rpc> ResolvedConfigCache<R> {
    pub fn new(rpc: Arc<R>) -> Self {
        Self { rpc }
    }
}

async fn resolve<R: Rpc>(
    rpc: &R,
    req: &ServiceConfigRequest,
    min_index: u64,
) -> Result<ServiceConfigResponse, CacheError> {
    let args = ResolveArgs {
        request: req.clone(),
        min_index,
    };
    let args = serde_json::to_value(&args).map_err(|e| CacheError::Decode(e.to_string()))?;
    let reply = rpc.rpc(RESOLVE_SERVICE_CONFIG, args).await?;
    serde_json::from_value(reply).map_err(|e| CacheError::Decode(e.to_string()))
}

#[async_trait]
impl<R: Rpc> ConfigCache for ResolvedConfigCache<R> {
    async fn get(&self, req: &ServiceConfigRequest) -> Result<ServiceConfigResponse, CacheError> {
        resolve(self.rpc.as_ref(), req, 0).await
    }

    async fn notify(
        &self,
        cancel: CancellationToken,
        req: ServiceConfigRequest,
        correlation_id: String,
        tx: mpsc::Sender<UpdateEvent>,
    ) -> Result<(), CacheError> {
        let rpc = Arc::clone(&self.rpc);
        tokio::spawn(async move {
            let mut index = 0u64;
            let mut delivered = false;
            let mut backoff = Backoff::default();

            loop {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    r = resolve(rpc.as_ref(), &req, index) => r,
                };

                match result {
                    Ok(resp) => {
                        backoff.reset();
                        if delivered && resp.index <= index {
                            continue;
                        }
                        index = resp.index;
                        delivered = true;
                        debug!(service = %req.name, index, "central config changed");
                        let event = UpdateEvent {
                            correlation_id: correlation_id.clone(),
                            result: Ok(resp),
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(service = %req.name, error = %e, "central config fetch failed");
                        let event = UpdateEvent {
                            correlation_id: correlation_id.clone(),
                            result: Err(e),
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(backoff.next_delay()) => {}
                        }
                    }
                }
            }
        });
        Ok(())
    }
}
