//! Page-automation collaborator, modeled at its interface boundary. The
//! scripted driver stands in for a real browser: it keeps just enough page
//! state to make confirm/cancel meaningful and fails with the same
//! `AutomationError` taxonomy a real driver would.

use async_trait::async_trait;
use fin_core::envelope::Envelope;
use fin_core::error::AutomationError;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::intent::{describe, ActionKind};

// 1x1 transparent PNG, stands in for a page capture.
const PLACEHOLDER_SCREENSHOT: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn is_logged_in(&self) -> bool;
    async fn login(&self, username: &str, password: &str) -> Result<String, AutomationError>;
    async fn navigate(&self, screen: &str) -> Result<String, AutomationError>;
    async fn perform(&self, action: ActionKind, parameters: &Value)
        -> Result<String, AutomationError>;
    /// Execute the action staged by the last `perform`. Only ever called
    /// after the approval gate has recorded an approval.
    async fn confirm_action(&self) -> Result<String, AutomationError>;
    async fn cancel_action(&self) -> Result<(), AutomationError>;
    async fn screenshot(&self) -> Result<String, AutomationError>;
}

struct PageState {
    logged_in: bool,
    screen: String,
    staged_action: Option<String>,
}

pub struct ScriptedDriver {
    outbound: mpsc::UnboundedSender<Envelope>,
    state: Mutex<PageState>,
    step_delay: Duration,
}

impl ScriptedDriver {
    pub fn new(outbound: mpsc::UnboundedSender<Envelope>, step_delay: Duration) -> Self {
        Self {
            outbound,
            state: Mutex::new(PageState {
                logged_in: false,
                screen: "login".to_string(),
                staged_action: None,
            }),
            step_delay,
        }
    }

    async fn locate(&self, element: &str) -> Result<(), AutomationError> {
        let started = tokio::time::Instant::now();
        tokio::time::sleep(self.step_delay).await;
        let _ = self.outbound.send(Envelope::vision_call(
            "scripted-vision",
            element,
            Some(started.elapsed().as_millis() as u64),
        ));
        Ok(())
    }
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    async fn is_logged_in(&self) -> bool {
        self.state.lock().await.logged_in
    }

    async fn login(&self, username: &str, _password: &str) -> Result<String, AutomationError> {
        self.locate("login form").await?;
        let mut state = self.state.lock().await;
        state.logged_in = true;
        state.screen = "dashboard".to_string();
        Ok(format!("Logged in as {username}"))
    }

    async fn navigate(&self, screen: &str) -> Result<String, AutomationError> {
        self.locate(&format!("{screen} menu entry")).await?;
        let mut state = self.state.lock().await;
        if !state.logged_in {
            return Err(AutomationError::Navigation(format!(
                "not logged in, cannot open {screen}"
            )));
        }
        state.screen = screen.to_string();
        Ok(format!("Opened {screen}"))
    }

    async fn perform(
        &self,
        action: ActionKind,
        parameters: &Value,
    ) -> Result<String, AutomationError> {
        self.locate(&format!("{} form", action.as_str())).await?;
        let mut state = self.state.lock().await;
        match action {
            ActionKind::CheckBalance => Ok("Savings balance: ₹1,24,567.00".to_string()),
            ActionKind::ViewTransactions => Ok("Showing the 10 most recent transactions".to_string()),
            ActionKind::Login => Ok("Already on the login screen".to_string()),
            ActionKind::PayBill | ActionKind::FundTransfer | ActionKind::BuyGold => {
                let staged = describe(action, parameters);
                state.staged_action = Some(staged.clone());
                Ok(format!("{staged} - filled, awaiting confirmation"))
            }
        }
    }

    async fn confirm_action(&self) -> Result<String, AutomationError> {
        self.locate("confirm dialog").await?;
        let mut state = self.state.lock().await;
        match state.staged_action.take() {
            Some(staged) => {
                state.screen = "dashboard".to_string();
                Ok(format!("{staged} - executed"))
            }
            None => Err(AutomationError::ElementNotFound(
                "confirm dialog".to_string(),
            )),
        }
    }

    async fn cancel_action(&self) -> Result<(), AutomationError> {
        let mut state = self.state.lock().await;
        state.staged_action = None;
        state.screen = "dashboard".to_string();
        Ok(())
    }

    async fn screenshot(&self) -> Result<String, AutomationError> {
        tokio::time::sleep(self.step_delay).await;
        Ok(PLACEHOLDER_SCREENSHOT.to_string())
    }
}
