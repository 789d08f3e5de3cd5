//! Admission control: at most one pipeline run per input identifier.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Concurrency-safe set of identifiers whose run is in progress.
///
/// Cloning shares the same set.
#[derive(Debug, Clone, Default)]
pub struct AdmissionGuard {
    active: Arc<Mutex<HashSet<String>>>,
}

impl AdmissionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `id` if absent. Returns whether admission succeeded.
    pub fn try_admit(&self, id: &str) -> bool {
        let admitted = self.lock().insert(id.to_string());
        debug!(id, admitted, "Admission check");
        admitted
    }

    /// Remove `id` unconditionally.
    pub fn release(&self, id: &str) {
        self.lock().remove(id);
        debug!(id, "Released admission");
    }

    /// Admit `id` and return a ticket that releases it when dropped, so the
    /// slot is freed on every exit path including a panicking task.
    pub fn admit(&self, id: &str) -> Option<AdmissionTicket> {
        self.try_admit(id).then(|| AdmissionTicket {
            guard: self.clone(),
            id: id.to_string(),
        })
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}

/// Proof of admission for one identifier; releases it on drop.
#[derive(Debug)]
pub struct AdmissionTicket {
    guard: AdmissionGuard,
    id: String,
}

impl AdmissionTicket {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.guard.release(&self.id);
    }
}
