use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::GustError;

/// The request currently holding the gate.
#[derive(Debug, Clone)]
pub struct ActiveRequest {
    pub id: u64,
    pub started: Instant,
    cancel: CancellationToken,
}

/// Single-flight guard: at most one orchestrated request at a time.
///
/// The slot is the only in-flight state; `busy` is simply "slot occupied".
/// A second submission is rejected with `Busy` instead of waiting.
#[derive(Debug, Default)]
pub struct RequestGate {
    slot: Mutex<Option<ActiveRequest>>,
    next_id: AtomicU64,
}

impl RequestGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.lock().is_some()
    }

    pub fn active_request_id(&self) -> Option<u64> {
        self.lock().as_ref().map(|a| a.id)
    }

    /// How long the current request has been running, if any.
    pub fn active_for(&self) -> Option<Duration> {
        self.lock().as_ref().map(|a| a.started.elapsed())
    }

    /// Claim the gate. The returned ticket frees it on drop.
    /// `parent`, when given, cancels the admitted request along with itself.
    pub fn try_acquire(&self, parent: Option<&CancellationToken>) -> Result<GateTicket<'_>, GustError> {
        let mut slot = self.lock();
        if let Some(active) = slot.as_ref() {
            tracing::debug!(active_id = active.id, "gate busy, rejecting request");
            return Err(GustError::Busy);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = parent.map_or_else(CancellationToken::new, |p| p.child_token());
        *slot = Some(ActiveRequest {
            id,
            started: Instant::now(),
            cancel: cancel.clone(),
        });
        Ok(GateTicket {
            gate: self,
            id,
            cancel,
        })
    }

    /// Run `f` under the gate. The gate is released only after `f` (and
    /// every cleanup it performs) has completed, on every path.
    pub async fn submit<F, Fut, T>(
        &self,
        parent: Option<&CancellationToken>,
        f: F,
    ) -> Result<T, GustError>
    where
        F: FnOnce(u64, CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let ticket = self.try_acquire(parent)?;
        let output = f(ticket.id(), ticket.cancel_token()).await;
        drop(ticket);
        Ok(output)
    }

    /// Cancel the in-flight request, if any. The gate stays held until that
    /// request has finished its own cleanup.
    pub fn cancel_active(&self) -> bool {
        match self.lock().as_ref() {
            Some(active) => {
                tracing::info!(request_id = active.id, "cancelling active request");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ActiveRequest>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof of admission. Dropping it empties the gate.
pub struct GateTicket<'a> {
    gate: &'a RequestGate,
    id: u64,
    cancel: CancellationToken,
}

impl GateTicket<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for GateTicket<'_> {
    fn drop(&mut self) {
        let mut slot = self.gate.lock();
        if slot.as_ref().is_some_and(|a| a.id == self.id) {
            *slot = None;
        }
    }
}
