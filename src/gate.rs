//! Concurrency gate
//!
//! Bounds the number of sandboxed jobs running at once across every process
//! sharing the counter store. This is admission control, not a queue: a
//! denied caller gets a reason and decides what to do.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::{keys, CounterStore, ACTIVE_JOBS_TTL};

/// Result of an admission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Admission {
    Granted,
    Denied { reason: String },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Admission::Granted => None,
            Admission::Denied { reason } => Some(reason),
        }
    }
}

#[derive(Clone)]
pub struct ConcurrencyGate {
    store: Arc<dyn CounterStore>,
    max_concurrent_jobs: u64,
}

impl ConcurrencyGate {
    pub fn new(store: Arc<dyn CounterStore>, max_concurrent_jobs: u64) -> Self {
        Self {
            store,
            max_concurrent_jobs,
        }
    }

    pub fn max_concurrent_jobs(&self) -> u64 {
        self.max_concurrent_jobs
    }

    fn denial(&self) -> Admission {
        Admission::Denied {
            reason: format!(
                "Maximum concurrent jobs reached ({})",
                self.max_concurrent_jobs
            ),
        }
    }

    /// Current number of running jobs
    pub async fn active_jobs(&self) -> Result<u64> {
        self.store.get(keys::ACTIVE_JOBS).await
    }

    /// Check capacity without taking a slot
    pub async fn admit(&self) -> Result<Admission> {
        let active = self.active_jobs().await?;
        if active >= self.max_concurrent_jobs {
            Ok(self.denial())
        } else {
            Ok(Admission::Granted)
        }
    }

    pub async fn increment(&self) -> Result<u64> {
        self.store.increment(keys::ACTIVE_JOBS, ACTIVE_JOBS_TTL).await
    }

    /// Decrement, never below zero
    pub async fn decrement(&self) -> Result<u64> {
        self.store.decrement(keys::ACTIVE_JOBS, ACTIVE_JOBS_TTL).await
    }

    /// Atomically check capacity and take a slot
    pub async fn try_acquire(&self) -> Result<Result<JobSlot, Admission>> {
        let acquired = self
            .store
            .increment_below(keys::ACTIVE_JOBS, self.max_concurrent_jobs, ACTIVE_JOBS_TTL)
            .await?;

        match acquired {
            Some(active) => {
                debug!(
                    "Acquired job slot ({}/{})",
                    active, self.max_concurrent_jobs
                );
                Ok(Ok(JobSlot {
                    gate: Some(self.clone()),
                }))
            }
            None => Ok(Err(self.denial())),
        }
    }
}

/// A held concurrency slot.
///
/// `release` gives it back. A slot dropped without `release` (panic,
/// cancelled future) is given back from a spawned task.
#[must_use = "a slot that is not released is only returned on drop"]
pub struct JobSlot {
    gate: Option<ConcurrencyGate>,
}

impl JobSlot {
    pub async fn release(mut self) {
        if let Some(gate) = self.gate.take() {
            if let Err(e) = gate.decrement().await {
                warn!("Failed to release job slot: {:#}", e);
            }
        }
    }
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        let Some(gate) = self.gate.take() else {
            return;
        };
        warn!("Job slot dropped without release, releasing in background");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = gate.decrement().await {
                        warn!("Failed to release job slot: {:#}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime to release job slot; counter TTL will reclaim it"),
        }
    }
}
