//! Admission control
//!
//! Bounds the number of concurrently executing tasks with a worker-pool
//! semaphore and keeps an advisory ledger of cpu/memory/gpu claims. The
//! ledger never blocks execution; it only logs when a claim exceeds the
//! configured budget. Admission is local to the worker process.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ExecutorSettings;

/// Resources a task may declare it needs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu: u32,
    pub memory_gb: f64,
    pub gpu: u32,
}

/// Outstanding advisory claims
#[derive(Debug, Default)]
struct ResourceLedger {
    cpu: u32,
    memory_gb: f64,
    gpu: u32,
}

/// Worker-pool admission controller
pub struct ResourceGovernor {
    workers: Arc<Semaphore>,
    budget: ExecutorSettings,
    ledger: Mutex<ResourceLedger>,
}

impl ResourceGovernor {
    pub fn new(settings: ExecutorSettings) -> Self {
        let max_workers = settings.effective_max_workers();
        Self {
            workers: Arc::new(Semaphore::new(max_workers)),
            budget: settings,
            ledger: Mutex::new(ResourceLedger::default()),
        }
    }

    /// Wait for a worker slot
    pub async fn acquire_worker(&self) -> OwnedSemaphorePermit {
        // The semaphore is never closed, so acquisition only fails on close
        self.workers
            .clone()
            .acquire_owned()
            .await
            .expect("worker semaphore closed")
    }

    /// Number of currently free worker slots
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Record an advisory resource claim. Returns a guard that releases the
    /// claim on drop.
    pub fn claim(&self, request: &ResourceRequest) -> ResourceClaim<'_> {
        let mut ledger = self.ledger.lock();
        ledger.cpu += request.cpu;
        ledger.memory_gb += request.memory_gb;
        ledger.gpu += request.gpu;

        if ledger.cpu > self.budget.available_cpu
            || ledger.memory_gb > self.budget.available_memory
            || ledger.gpu > self.budget.available_gpu
        {
            tracing::warn!(
                claimed_cpu = ledger.cpu,
                claimed_memory_gb = ledger.memory_gb,
                claimed_gpu = ledger.gpu,
                "advisory resource budget exceeded"
            );
        }

        ResourceClaim {
            governor: self,
            request: request.clone(),
        }
    }

    fn release(&self, request: &ResourceRequest) {
        let mut ledger = self.ledger.lock();
        ledger.cpu = ledger.cpu.saturating_sub(request.cpu);
        ledger.memory_gb = (ledger.memory_gb - request.memory_gb).max(0.0);
        ledger.gpu = ledger.gpu.saturating_sub(request.gpu);
    }
}

/// Guard for an advisory resource claim
pub struct ResourceClaim<'a> {
    governor: &'a ResourceGovernor,
    request: ResourceRequest,
}

impl Drop for ResourceClaim<'_> {
    fn drop(&mut self) {
        self.governor.release(&self.request);
    }
}
