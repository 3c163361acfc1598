//! Shared contracts for the approval channel: the wire envelope, the
//! approval and task data model, and the error taxonomy. This crate does
//! no I/O; both the agent daemon and the operator console build on it.

pub mod approval;
pub mod envelope;
pub mod error;
pub mod task;

pub use approval::{ApprovalRequest, ApprovalStatus, RiskLevel};
pub use envelope::{Envelope, Frame};
pub use error::{AutomationError, ChannelError, EnvelopeError};
pub use task::{TaskEvent, TaskState};
