use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    InProgress,
    Completed,
    Failed,
}

impl TaskState {
    /// A terminal event is always the last event for its task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::InProgress => "in_progress",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress notification for a multi-step task. For a given `task_id`
/// the dashboard observes `step` in non-decreasing order; the envelope
/// carrying the event supplies the display timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub name: String,
    pub status: TaskState,
    pub step: u32,
    #[serde(rename = "steps")]
    pub total_steps: u32,
    #[serde(default)]
    pub message: String,
}

impl TaskEvent {
    pub fn new(
        task_id: impl Into<String>,
        name: impl Into<String>,
        status: TaskState,
        step: u32,
        total_steps: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            name: name.into(),
            status,
            step,
            total_steps,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_steps_serializes_as_steps() {
        let event = TaskEvent::new("TASK-0001", "fund_transfer", TaskState::InProgress, 2, 4, "");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["steps"], 4);
        assert_eq!(value["status"], "in_progress");
    }
}
