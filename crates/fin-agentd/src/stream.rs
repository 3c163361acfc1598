//! Sequencing authority for task progress. Each task owns a monotonically
//! increasing step counter here; anything out of order or after a terminal
//! event is an anomaly and never reaches the wire.

use fin_core::envelope::Envelope;
use fin_core::task::TaskEvent;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamAnomaly {
    #[error("task {task_id}: step {step} is behind last emitted step {last}")]
    StaleStep { task_id: String, step: u32, last: u32 },
    #[error("task {task_id} already closed")]
    TaskClosed { task_id: String },
}

struct TaskProgress {
    last_step: u32,
    closed: bool,
}

pub struct TaskStreamCoordinator {
    outbound: mpsc::UnboundedSender<Envelope>,
    tasks: Mutex<HashMap<String, TaskProgress>>,
}

impl TaskStreamCoordinator {
    pub fn new(outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            outbound,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, TaskProgress>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish one progress event. Equal steps are allowed (a step emits an
    /// in-progress and then its outcome); a lower step or any event after
    /// completed/failed is rejected and logged.
    pub fn emit(&self, event: &TaskEvent) -> Result<(), StreamAnomaly> {
        {
            let mut tasks = self.tasks();
            let progress = tasks.entry(event.task_id.clone()).or_insert(TaskProgress {
                last_step: 0,
                closed: false,
            });
            if progress.closed {
                let anomaly = StreamAnomaly::TaskClosed {
                    task_id: event.task_id.clone(),
                };
                warn!(event = "task_stream_anomaly", error = %anomaly);
                return Err(anomaly);
            }
            if event.step < progress.last_step {
                let anomaly = StreamAnomaly::StaleStep {
                    task_id: event.task_id.clone(),
                    step: event.step,
                    last: progress.last_step,
                };
                warn!(event = "task_stream_anomaly", error = %anomaly);
                return Err(anomaly);
            }
            progress.last_step = event.step;
            if event.status.is_terminal() {
                progress.closed = true;
            }
        }
        let _ = self.outbound.send(Envelope::task_update(event));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fin_core::task::TaskState;

    fn coordinator() -> (TaskStreamCoordinator, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TaskStreamCoordinator::new(tx), rx)
    }

    fn event(task_id: &str, status: TaskState, step: u32) -> TaskEvent {
        TaskEvent::new(task_id, "fund_transfer", status, step, 4, "")
    }

    #[test]
    fn steps_must_not_decrease() {
        let (coordinator, mut rx) = coordinator();
        coordinator
            .emit(&event("TASK-0001", TaskState::InProgress, 1))
            .unwrap();
        coordinator
            .emit(&event("TASK-0001", TaskState::InProgress, 2))
            .unwrap();

        let stale = coordinator.emit(&event("TASK-0001", TaskState::InProgress, 1));
        assert_eq!(
            stale,
            Err(StreamAnomaly::StaleStep {
                task_id: "TASK-0001".to_string(),
                step: 1,
                last: 2,
            })
        );

        coordinator
            .emit(&event("TASK-0001", TaskState::InProgress, 3))
            .unwrap();
        let mut forwarded = 0;
        while rx.try_recv().is_ok() {
            forwarded += 1;
        }
        assert_eq!(forwarded, 3);
    }

    #[test]
    fn equal_step_is_allowed_for_step_outcome() {
        let (coordinator, _rx) = coordinator();
        coordinator
            .emit(&event("TASK-0001", TaskState::InProgress, 2))
            .unwrap();
        assert!(coordinator
            .emit(&event("TASK-0001", TaskState::InProgress, 2))
            .is_ok());
    }

    #[test]
    fn terminal_event_closes_the_task() {
        let (coordinator, _rx) = coordinator();
        coordinator
            .emit(&event("TASK-0001", TaskState::InProgress, 1))
            .unwrap();
        coordinator
            .emit(&event("TASK-0001", TaskState::Failed, 1))
            .unwrap();
        assert_eq!(
            coordinator.emit(&event("TASK-0001", TaskState::InProgress, 2)),
            Err(StreamAnomaly::TaskClosed {
                task_id: "TASK-0001".to_string()
            })
        );
    }

    #[test]
    fn tasks_sequence_independently() {
        let (coordinator, _rx) = coordinator();
        coordinator
            .emit(&event("TASK-0001", TaskState::InProgress, 3))
            .unwrap();
        assert!(coordinator
            .emit(&event("TASK-0002", TaskState::InProgress, 1))
            .is_ok());
    }
}
