//! Multi-step command execution. The runner owns the step plan, streams
//! progress through the coordinator, and routes every gated confirm
//! through the approval gate. Any uncertain outcome aborts the action.

use fin_core::approval::ApprovalStatus;
use fin_core::envelope::Envelope;
use fin_core::error::AutomationError;
use fin_core::task::{TaskEvent, TaskState};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::driver::PageDriver;
use crate::gate::ApprovalGate;
use crate::intent::{describe, ActionKind, Intent, IntentParser};
use crate::limits::TransactionLimits;
use crate::stream::TaskStreamCoordinator;

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_id: String,
    pub status: TaskState,
    pub message: String,
}

enum PlannedStep {
    Login,
    Navigate(&'static str),
    Act(ActionKind),
    ConfirmGated(ActionKind),
}

fn amount_of(parameters: &Value) -> f64 {
    parameters
        .get("amount")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

impl PlannedStep {
    fn name(&self) -> String {
        match self {
            PlannedStep::Login => "login".to_string(),
            PlannedStep::Navigate(screen) => format!("navigate_to_{}", screen.replace('-', "_")),
            PlannedStep::Act(action) => action.as_str().to_string(),
            PlannedStep::ConfirmGated(_) => "confirm_with_approval".to_string(),
        }
    }
}

pub struct CommandRunner<P, D> {
    parser: P,
    driver: D,
    gate: ApprovalGate,
    stream: Arc<TaskStreamCoordinator>,
    limits: TransactionLimits,
    outbound: mpsc::UnboundedSender<Envelope>,
    task_counter: AtomicU64,
}

impl<P, D> CommandRunner<P, D>
where
    P: IntentParser,
    D: PageDriver,
{
    pub fn new(
        parser: P,
        driver: D,
        gate: ApprovalGate,
        stream: Arc<TaskStreamCoordinator>,
        limits: TransactionLimits,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            parser,
            driver,
            gate,
            stream,
            limits,
            outbound,
            task_counter: AtomicU64::new(0),
        }
    }

    fn next_task_id(&self) -> String {
        let serial = self.task_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("TASK-{serial:04}")
    }

    fn emit(&self, envelope: Envelope) {
        let _ = self.outbound.send(envelope);
    }

    fn task_event(&self, task_id: &str, name: &str, status: TaskState, step: u32, total: u32, message: &str) {
        let event = TaskEvent::new(task_id, name, status, step, total, message);
        let _ = self.stream.emit(&event);
    }

    pub async fn run_command(&self, command: &str) -> TaskReport {
        let task_id = self.next_task_id();
        info!(event = "command_received", task_id = %task_id, command = command);
        self.emit(Envelope::status(format!("Working on: {command}")));

        let intent = match self.parser.parse(command) {
            Ok(intent) => intent,
            Err(err) => {
                self.emit(Envelope::error(err.to_string()));
                self.task_event(&task_id, "parse_command", TaskState::Failed, 1, 1, &err.to_string());
                return TaskReport {
                    task_id,
                    status: TaskState::Failed,
                    message: err.to_string(),
                };
            }
        };

        // Caps are enforced before any page work or approval prompt: an
        // over-limit amount is refused outright, not escalated.
        if intent.action.requires_approval() {
            let amount = amount_of(&intent.parameters);
            if let Err(violation) = self.limits.check(intent.action, amount) {
                warn!(
                    event = "limit_refused",
                    task_id = %task_id,
                    action = intent.action.as_str(),
                    error = %violation
                );
                let shown = violation.to_string();
                self.emit(Envelope::error(shown.clone()));
                self.task_event(&task_id, "limit_check", TaskState::Failed, 1, 1, &shown);
                return TaskReport {
                    task_id,
                    status: TaskState::Failed,
                    message: shown,
                };
            }
        }

        let plan = self.build_plan(&intent).await;
        let total = plan.len() as u32;
        for (index, step) in plan.iter().enumerate() {
            let step_no = index as u32 + 1;
            let name = step.name();
            self.task_event(
                &task_id,
                &name,
                TaskState::InProgress,
                step_no,
                total,
                &format!("Step {step_no}/{total}: {name}"),
            );

            let outcome = match step {
                PlannedStep::Login => self.driver.login("demo_user", "demo123").await,
                PlannedStep::Navigate(screen) => self.driver.navigate(screen).await,
                PlannedStep::Act(action) => self.driver.perform(*action, &intent.parameters).await,
                PlannedStep::ConfirmGated(action) => {
                    match self.confirm_gated(*action, &intent.parameters).await {
                        Ok(message) => Ok(message),
                        Err(denial) => {
                            self.task_event(&task_id, &name, TaskState::Failed, step_no, total, &denial);
                            return TaskReport {
                                task_id,
                                status: TaskState::Failed,
                                message: denial,
                            };
                        }
                    }
                }
            };

            match outcome {
                Ok(message) => {
                    self.emit(Envelope::status(message));
                    if let Ok(capture) = self.driver.screenshot().await {
                        self.emit(Envelope::screenshot(capture));
                    }
                }
                Err(err) => {
                    warn!(event = "automation_error", task_id = %task_id, step = %name, error = %err);
                    let shown = format!("{} {}", err.user_message(), err.suggestion());
                    self.emit(Envelope::error(shown.clone()));
                    self.task_event(&task_id, &name, TaskState::Failed, step_no, total, &shown);
                    return TaskReport {
                        task_id,
                        status: TaskState::Failed,
                        message: shown,
                    };
                }
            }
        }

        let done = "Task completed".to_string();
        self.task_event(&task_id, intent.action.as_str(), TaskState::Completed, total, total, &done);
        self.emit(Envelope::success(format!("Completed: {command}")));
        TaskReport {
            task_id,
            status: TaskState::Completed,
            message: done,
        }
    }

    /// Resolve the gated confirm. Only an explicit approval executes the
    /// staged action; denial, expiry, and anything uncertain cancel it.
    async fn confirm_gated(
        &self,
        action: ActionKind,
        parameters: &Value,
    ) -> Result<String, String> {
        let description = describe(action, parameters);
        let amount = amount_of(parameters);
        let reason = format!("{} is a gated action and requires operator approval", action.as_str());
        let mut parameters = parameters.clone();
        if let Ok(capture) = self.driver.screenshot().await {
            if let Some(map) = parameters.as_object_mut() {
                map.insert("screenshot".to_string(), json!(capture));
            }
        }

        let ticket = self
            .gate
            .propose(description.clone(), action.risk_level(), reason, parameters);
        self.emit(Envelope::status(format!(
            "Approval required: {description} ({})",
            ticket.id()
        )));

        let status = ticket.wait().await;
        if status.allows_execution() {
            return match self.driver.confirm_action().await {
                Ok(message) => {
                    self.limits.record(action, amount);
                    Ok(message)
                }
                Err(err) => {
                    warn!(event = "automation_error", step = "confirm_action", error = %err);
                    Err(format!("{} {}", err.user_message(), err.suggestion()))
                }
            };
        }

        if self.driver.cancel_action().await.is_err() {
            warn!(event = "cancel_failed", action = action.as_str());
        }
        let denial = match status {
            ApprovalStatus::Expired => {
                "Approval timed out - action cancelled for safety".to_string()
            }
            _ => "Action denied by operator".to_string(),
        };
        self.emit(Envelope::status(denial.clone()));
        Err(denial)
    }

    async fn build_plan(&self, intent: &Intent) -> Vec<PlannedStep> {
        let mut plan = Vec::new();
        if !self.driver.is_logged_in().await {
            plan.push(PlannedStep::Login);
        }
        match intent.action {
            ActionKind::Login => {
                // Login-only command; the implicit login above covers it.
                if plan.is_empty() {
                    plan.push(PlannedStep::Login);
                }
            }
            action => {
                if let Some(screen) = action.nav_screen() {
                    plan.push(PlannedStep::Navigate(screen));
                }
                plan.push(PlannedStep::Act(action));
                if action.requires_approval() {
                    plan.push(PlannedStep::ConfirmGated(action));
                }
            }
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ScriptedDriver;
    use crate::intent::KeywordIntentParser;
    use fin_core::envelope::Frame;
    use std::time::Duration;

    struct Fixture {
        runner: CommandRunner<KeywordIntentParser, ScriptedDriver>,
        gate: ApprovalGate,
        rx: mpsc::UnboundedReceiver<Envelope>,
    }

    fn fixture(approval_timeout: Duration) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = ApprovalGate::new(approval_timeout, tx.clone());
        let stream = Arc::new(TaskStreamCoordinator::new(tx.clone()));
        let driver = ScriptedDriver::new(tx.clone(), Duration::from_millis(1));
        let runner = CommandRunner::new(
            KeywordIntentParser::new(),
            driver,
            gate.clone(),
            stream,
            TransactionLimits::new(),
            tx,
        );
        Fixture { runner, gate, rx }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn approved_transfer_runs_to_completion() {
        let fixture = fixture(Duration::from_secs(60));
        let gate = fixture.gate.clone();
        let approver = tokio::spawn(async move {
            // Wait for the request to appear, then approve it.
            loop {
                if let Some(request) = gate.pending_requests().first() {
                    gate.resolve(&request.id, true);
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let report = fixture.runner.run_command("transfer 5000 to Mom").await;
        approver.await.unwrap();
        assert_eq!(report.status, TaskState::Completed);

        let mut rx = fixture.rx;
        let envelopes = drain(&mut rx);
        let kinds: Vec<_> = envelopes.iter().map(|e| e.kind.as_str()).collect();
        assert!(kinds.contains(&"approval_request"));
        assert!(kinds.contains(&"success"));
        assert!(kinds.contains(&"task_update"));

        // The final task_update is terminal and carries the last step.
        let last_update = envelopes
            .iter()
            .rev()
            .find(|e| e.kind == "task_update")
            .unwrap();
        match last_update.classify().unwrap() {
            Frame::TaskUpdate(update) => {
                assert_eq!(update.status, TaskState::Completed);
                assert_eq!(update.step, update.total_steps);
            }
            other => panic!("expected task update, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unapproved_transfer_never_executes() {
        // One-second gate timeout, no resolution sent: the runner must
        // observe a denial-equivalent outcome, never a hang.
        let fixture = fixture(Duration::from_secs(1));
        let report = fixture.runner.run_command("transfer 9000 to Dad").await;
        assert_eq!(report.status, TaskState::Failed);
        assert!(report.message.contains("timed out"));

        let mut rx = fixture.rx;
        let envelopes = drain(&mut rx);
        assert!(!envelopes
            .iter()
            .any(|e| e.message.as_deref().is_some_and(|m| m.contains("executed"))));
        assert_eq!(fixture.gate.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_transfer_fails_closed() {
        let fixture = fixture(Duration::from_secs(60));
        let gate = fixture.gate.clone();
        tokio::spawn(async move {
            loop {
                if let Some(request) = gate.pending_requests().first() {
                    gate.resolve(&request.id, false);
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let report = fixture.runner.run_command("pay electricity bill of 1500").await;
        assert_eq!(report.status, TaskState::Failed);
        assert!(report.message.contains("denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn ungated_command_needs_no_approval() {
        let fixture = fixture(Duration::from_secs(60));
        let report = fixture.runner.run_command("check my balance").await;
        assert_eq!(report.status, TaskState::Completed);
        assert_eq!(fixture.gate.pending_count(), 0);
        assert_eq!(fixture.gate.history().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn over_limit_transfer_is_refused_without_approval() {
        let fixture = fixture(Duration::from_secs(60));
        // The fund_transfer single cap is 100,000.
        let report = fixture.runner.run_command("transfer 150000 to Mom").await;
        assert_eq!(report.status, TaskState::Failed);
        assert!(report.message.contains("single transaction limit"));

        // Refused before the gate: no request was ever raised.
        assert_eq!(fixture.gate.pending_count(), 0);
        assert!(fixture.gate.history().is_empty());
        let mut rx = fixture.rx;
        let envelopes = drain(&mut rx);
        assert!(!envelopes.iter().any(|e| e.kind == "approval_request"));
        assert!(envelopes.iter().any(|e| e.kind == "error"));
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_transfer_counts_against_the_daily_cap() {
        let fixture = fixture(Duration::from_secs(60));
        let gate = fixture.gate.clone();
        let approver = tokio::spawn(async move {
            loop {
                if let Some(request) = gate.pending_requests().first() {
                    gate.resolve(&request.id, true);
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let report = fixture.runner.run_command("transfer 5000 to Mom").await;
        approver.await.unwrap();
        assert_eq!(report.status, TaskState::Completed);
        assert_eq!(
            fixture.runner.limits.usage_today(ActionKind::FundTransfer),
            5000.0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn denied_transfer_spends_nothing() {
        let fixture = fixture(Duration::from_secs(1));
        let report = fixture.runner.run_command("transfer 5000 to Mom").await;
        assert_eq!(report.status, TaskState::Failed);
        assert_eq!(
            fixture.runner.limits.usage_today(ActionKind::FundTransfer),
            0.0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_command_reports_failure() {
        let fixture = fixture(Duration::from_secs(60));
        let report = fixture.runner.run_command("order a pizza").await;
        assert_eq!(report.status, TaskState::Failed);

        let mut rx = fixture.rx;
        assert!(drain(&mut rx).iter().any(|e| e.kind == "error"));
    }
}
