//! Client-side view of the daemon's state, rebuilt purely from the frames
//! that arrive over the channel. Redelivered frames must converge to the
//! same view, so every mutation here is keyed and idempotent.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use fin_core::approval::ApprovalStatus;
use fin_core::envelope::{ApprovalRequestData, Envelope, Frame};
use fin_core::task::TaskEvent;
use tracing::debug;

pub const ACTIVITY_CAP: usize = 50;
pub const LOG_CAP: usize = 200;

/// What a frame did to the projection. The operator loop uses this to know
/// when to prompt for a decision.
#[derive(Debug)]
pub enum Applied {
    NewApproval(ApprovalRequestData),
    ApprovalResolved { id: String, status: ApprovalStatus },
    Progress,
    Dropped,
}

#[derive(Debug, Clone)]
pub struct ApprovalView {
    pub request: ApprovalRequestData,
    pub status: ApprovalStatus,
    first_seen: Instant,
}

#[derive(Debug, Default)]
struct TaskView {
    last_step: u32,
    closed: bool,
}

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub frames: u64,
    pub screenshots: u64,
    pub vision_calls: u64,
    pub stale_updates: u64,
    pub unknown_dropped: u64,
}

pub struct Projection {
    activity: VecDeque<String>,
    log: VecDeque<String>,
    approvals: HashMap<String, ApprovalView>,
    tasks: HashMap<String, TaskView>,
    stats: Stats,
}

impl Projection {
    pub fn new() -> Self {
        Self {
            activity: VecDeque::new(),
            log: VecDeque::new(),
            approvals: HashMap::new(),
            tasks: HashMap::new(),
            stats: Stats::default(),
        }
    }

    pub fn apply(&mut self, envelope: &Envelope) -> Applied {
        self.stats.frames += 1;
        let frame = match envelope.classify() {
            Ok(frame) => frame,
            Err(err) => {
                self.push_log(format!("rejected frame: {err}"));
                return Applied::Dropped;
            }
        };

        match frame {
            Frame::ApprovalRequest(data) => self.apply_request(data),
            Frame::Status { message, decision } | Frame::Success { message, decision } => {
                if let Some(decision) = decision {
                    return self.resolve(decision.id, decision.status);
                }
                if !message.is_empty() {
                    self.push_activity(message);
                }
                Applied::Progress
            }
            Frame::TaskUpdate(event) => self.apply_task(event),
            Frame::Error { message } => {
                self.push_activity(format!("Error: {message}"));
                self.push_log(format!("agent error: {message}"));
                Applied::Progress
            }
            Frame::Screenshot { .. } => {
                self.stats.screenshots += 1;
                Applied::Progress
            }
            Frame::VisionCall(call) => {
                self.stats.vision_calls += 1;
                self.push_log(format!("vision call: {} ({})", call.provider, call.purpose));
                Applied::Progress
            }
            Frame::Command(_) | Frame::Approve(_) => {
                // Client-to-server kinds echoed back; nothing to project.
                debug!(event = "frame_ignored", kind = %envelope.kind);
                Applied::Dropped
            }
            Frame::Unknown(kind) => {
                self.stats.unknown_dropped += 1;
                self.push_log(format!("unknown frame kind: {kind}"));
                Applied::Dropped
            }
        }
    }

    fn apply_request(&mut self, data: ApprovalRequestData) -> Applied {
        let id = data.id.clone();
        match self.approvals.get_mut(&id) {
            None => {
                let status = data.status.unwrap_or(ApprovalStatus::Pending);
                self.push_activity(format!(
                    "Approval required [{id}]: {} ({} risk)",
                    data.reason, data.risk_level
                ));
                let view = ApprovalView {
                    request: data.clone(),
                    status,
                    first_seen: Instant::now(),
                };
                self.approvals.insert(id, view);
                if status == ApprovalStatus::Pending {
                    Applied::NewApproval(data)
                } else {
                    Applied::Progress
                }
            }
            Some(view) => {
                // Redelivery. Refresh the record but never resurrect a
                // request the operator already saw resolved.
                view.request = data;
                if view.status.is_terminal() {
                    if let Some(incoming) = view.request.status {
                        if !incoming.is_terminal() {
                            view.request.status = Some(view.status);
                        }
                    }
                }
                Applied::Progress
            }
        }
    }

    fn resolve(&mut self, id: String, status: ApprovalStatus) -> Applied {
        match self.approvals.get_mut(&id) {
            Some(view) if !view.status.is_terminal() => {
                view.status = status;
                view.request.status = Some(status);
                self.push_activity(format!("Approval [{id}] {}", status.as_str()));
                Applied::ApprovalResolved { id, status }
            }
            Some(_) => Applied::Dropped,
            None => {
                // Resolution for a request this client never saw. Keep a
                // trace so the operator can correlate with the daemon log.
                self.push_log(format!("resolution for unknown request {id}"));
                Applied::Dropped
            }
        }
    }

    fn apply_task(&mut self, event: TaskEvent) -> Applied {
        let view = self.tasks.entry(event.task_id.clone()).or_default();
        if view.closed || event.step < view.last_step {
            self.stats.stale_updates += 1;
            self.push_log(format!(
                "stale update for {} (step {})",
                event.task_id, event.step
            ));
            return Applied::Dropped;
        }
        view.last_step = event.step;
        if event.status.is_terminal() {
            view.closed = true;
        }
        self.push_activity(format!(
            "[{}] step {}/{} {}: {}",
            event.task_id,
            event.step,
            event.total_steps,
            event.status.as_str(),
            if event.message.is_empty() {
                event.name.as_str()
            } else {
                event.message.as_str()
            }
        ));
        Applied::Progress
    }

    /// Folds a `/status` snapshot of server-side pending requests into the
    /// view. `issued_at` is the instant the poll was sent; a request first
    /// seen after that is newer than the snapshot and must not be judged by
    /// it. Returns requests the channel never delivered, so the caller can
    /// prompt for them.
    pub fn reconcile(
        &mut self,
        server_pending: &[ApprovalRequestData],
        issued_at: Instant,
    ) -> Vec<ApprovalRequestData> {
        let mut missed = Vec::new();
        for data in server_pending {
            if !self.approvals.contains_key(&data.id) {
                self.push_activity(format!(
                    "Approval required [{}]: {} (recovered via poll)",
                    data.id, data.reason
                ));
                self.approvals.insert(
                    data.id.clone(),
                    ApprovalView {
                        request: data.clone(),
                        status: ApprovalStatus::Pending,
                        first_seen: Instant::now(),
                    },
                );
                missed.push(data.clone());
            }
        }
        // Anything locally pending that the server no longer lists was
        // resolved while we were away. The outcome is unknown here, so it
        // is retired as expired rather than left hanging in the prompt.
        // Entries that arrived after the poll went out are left alone; the
        // snapshot predates them and the real resolution is still coming.
        let server_ids: Vec<&str> = server_pending.iter().map(|d| d.id.as_str()).collect();
        for (id, view) in self.approvals.iter_mut() {
            if view.status == ApprovalStatus::Pending
                && view.first_seen <= issued_at
                && !server_ids.contains(&id.as_str())
            {
                view.status = ApprovalStatus::Expired;
                view.request.status = Some(ApprovalStatus::Expired);
                self.log
                    .push_back(format!("request {id} resolved while disconnected"));
            }
        }
        while self.log.len() > LOG_CAP {
            self.log.pop_front();
        }
        missed
    }

    pub fn pending_count(&self) -> usize {
        self.approvals
            .values()
            .filter(|view| view.status == ApprovalStatus::Pending)
            .count()
    }

    pub fn pending(&self) -> Vec<&ApprovalView> {
        self.approvals
            .values()
            .filter(|view| view.status == ApprovalStatus::Pending)
            .collect()
    }

    pub fn approval(&self, id: &str) -> Option<&ApprovalView> {
        self.approvals.get(id)
    }

    pub fn activity(&self) -> impl Iterator<Item = &str> {
        self.activity.iter().map(String::as_str)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn push_activity(&mut self, line: String) {
        self.activity.push_back(line);
        while self.activity.len() > ACTIVITY_CAP {
            self.activity.pop_front();
        }
    }

    fn push_log(&mut self, line: String) {
        self.log.push_back(line);
        while self.log.len() > LOG_CAP {
            self.log.pop_front();
        }
    }
}

impl Default for Projection {
    fn default() -> Self {
        Self::new()
    }
}
