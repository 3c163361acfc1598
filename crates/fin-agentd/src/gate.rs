//! The conscious pause: every gated action passes through here between
//! proposal and resolution. The request table is the only state touched by
//! two triggers (operator decision and expiry timer); a single mutex plus
//! the pending-table membership check makes the first terminal writer win.

use fin_core::approval::{ApprovalRequest, ApprovalStatus, RiskLevel};
use fin_core::envelope::Envelope;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(60);

const HISTORY_CAP: usize = 50;

/// Outcome of a resolution attempt. Duplicate operator clicks and replayed
/// frames after a reconnect land in `NoOp`; they are absorbed, never
/// surfaced as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Applied(ApprovalStatus),
    NoOp,
}

struct Entry {
    record: ApprovalRequest,
    waiter: Option<oneshot::Sender<ApprovalStatus>>,
    expiry_timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Table {
    pending: HashMap<String, Entry>,
    history: VecDeque<ApprovalRequest>,
}

struct GateInner {
    timeout: Duration,
    counter: AtomicU64,
    outbound: mpsc::UnboundedSender<Envelope>,
    requests: Mutex<Table>,
}

#[derive(Clone)]
pub struct ApprovalGate {
    inner: Arc<GateInner>,
}

impl ApprovalGate {
    pub fn new(timeout: Duration, outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                timeout,
                counter: AtomicU64::new(0),
                outbound,
                requests: Mutex::new(Table::default()),
            }),
        }
    }

    /// Create a pending request, emit its `approval_request` envelope, and
    /// start the expiry timer. The returned ticket is the only way the
    /// proposing caller learns the outcome.
    pub fn propose(
        &self,
        action: impl Into<String>,
        risk_level: RiskLevel,
        reason: impl Into<String>,
        parameters: Value,
    ) -> ApprovalTicket {
        self.propose_with_timeout(action, risk_level, reason, parameters, self.inner.timeout)
    }

    pub fn propose_with_timeout(
        &self,
        action: impl Into<String>,
        risk_level: RiskLevel,
        reason: impl Into<String>,
        parameters: Value,
        timeout: Duration,
    ) -> ApprovalTicket {
        let serial = self.inner.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("APR-{serial:04}");
        let record = ApprovalRequest::new(
            id.clone(),
            action,
            risk_level,
            reason,
            parameters,
            timeout,
        );
        let (waiter_tx, waiter_rx) = oneshot::channel();

        let envelope = Envelope::approval_request(&record);
        {
            let mut table = self.inner.table();
            table.pending.insert(
                id.clone(),
                Entry {
                    record,
                    waiter: Some(waiter_tx),
                    expiry_timer: None,
                },
            );
            let _ = self.inner.outbound.send(envelope);
        }

        let expiry_inner = self.inner.clone();
        let expiry_id = id.clone();
        let expiry_timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expiry_inner.resolve(&expiry_id, ApprovalStatus::Expired, "expiry_timer");
        });
        {
            let mut table = self.inner.table();
            match table.pending.get_mut(&id) {
                Some(entry) => entry.expiry_timer = Some(expiry_timer),
                // Resolved between insert and spawn; the timer is moot.
                None => expiry_timer.abort(),
            }
        }

        info!(event = "approval_proposed", id = %id, risk = %risk_level);
        ApprovalTicket {
            id,
            waiter: Some(waiter_rx),
            inner: self.inner.clone(),
        }
    }

    /// Apply an operator decision. Unknown or already-terminal ids are
    /// accepted as no-ops.
    pub fn resolve(&self, id: &str, approved: bool) -> Resolution {
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        self.inner.resolve(id, status, "operator")
    }

    pub fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let table = self.inner.table();
        let mut pending: Vec<_> = table
            .pending
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    pub fn pending_count(&self) -> usize {
        self.inner.table().pending.len()
    }

    pub fn history(&self) -> Vec<ApprovalRequest> {
        self.inner.table().history.iter().cloned().collect()
    }
}

impl GateInner {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The single terminal transition point. Removal from the pending table
    /// under the lock is the compare-and-set: whoever removes the entry
    /// wins, every later caller observes a no-op.
    fn resolve(&self, id: &str, status: ApprovalStatus, source: &str) -> Resolution {
        if !status.is_terminal() {
            return Resolution::NoOp;
        }
        let mut table = self.table();
        let Some(mut entry) = table.pending.remove(id) else {
            drop(table);
            warn!(event = "duplicate_resolution", id = id, source = source);
            return Resolution::NoOp;
        };

        if let Some(timer) = entry.expiry_timer.take() {
            timer.abort();
        }
        entry.record.status = status;
        if let Some(waiter) = entry.waiter.take() {
            // Receiver may be gone if the caller was cancelled first.
            let _ = waiter.send(status);
        }

        let message = match status {
            ApprovalStatus::Approved => format!("{} approved by operator", id),
            ApprovalStatus::Denied => format!("{} denied by operator", id),
            ApprovalStatus::Expired | ApprovalStatus::Pending => {
                format!("{} expired without a decision - cancelled for safety", id)
            }
        };
        let _ = self
            .outbound
            .send(Envelope::approval_resolution(id, status, &message));

        table.history.push_back(entry.record);
        if table.history.len() > HISTORY_CAP {
            table.history.pop_front();
        }
        drop(table);

        info!(event = "approval_resolved", id = id, status = %status, source = source);
        Resolution::Applied(status)
    }
}

/// Handle the proposing caller suspends on. Dropping a ticket that is
/// still pending resolves the request to Denied so an out-of-context
/// approval can never release the action later.
pub struct ApprovalTicket {
    id: String,
    waiter: Option<oneshot::Receiver<ApprovalStatus>>,
    inner: Arc<GateInner>,
}

impl ApprovalTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Suspend until the request reaches a terminal state. Never hangs:
    /// the expiry timer guarantees a resolution arrives.
    pub async fn wait(mut self) -> ApprovalStatus {
        let Some(waiter) = self.waiter.take() else {
            return ApprovalStatus::Denied;
        };
        match waiter.await {
            Ok(status) => status,
            // Gate dropped mid-wait: fail closed.
            Err(_) => ApprovalStatus::Denied,
        }
    }
}

impl Drop for ApprovalTicket {
    fn drop(&mut self) {
        if self.waiter.is_some() {
            self.inner
                .resolve(&self.id, ApprovalStatus::Denied, "caller_cancelled");
        }
    }
}
