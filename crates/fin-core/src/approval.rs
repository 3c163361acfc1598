use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// UI emphasis only. Every gated action requires explicit approval no
/// matter the level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one gated action. Transitions only move forward: a request
/// leaves `Pending` exactly once and never re-enters it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    /// Fail-closed: only an explicit approval releases the gated action.
    /// Denied and Expired are equivalent from the caller's perspective.
    pub fn allows_execution(&self) -> bool {
        matches!(self, ApprovalStatus::Approved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One gated action, identified by its `id` for the whole lifetime of the
/// request. The action parameters ride on the record itself so there is no
/// separate "current action" hand-off state to race on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub action: String,
    pub reason: String,
    pub risk_level: RiskLevel,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(
        id: impl Into<String>,
        action: impl Into<String>,
        risk_level: RiskLevel,
        reason: impl Into<String>,
        parameters: Value,
        timeout: Duration,
    ) -> Self {
        let created_at = Utc::now();
        let ttl = ChronoDuration::milliseconds(timeout.as_millis() as i64);
        Self {
            id: id.into(),
            action: action.into(),
            reason: reason.into(),
            risk_level,
            status: ApprovalStatus::Pending,
            parameters,
            screenshot: None,
            created_at,
            expires_at: created_at + ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expires_at_is_created_at_plus_timeout() {
        let req = ApprovalRequest::new(
            "APR-0001",
            "Fund Transfer",
            RiskLevel::High,
            "operator requested transfer",
            json!({"amount": 5000}),
            Duration::from_secs(60),
        );
        assert_eq!(req.expires_at - req.created_at, ChronoDuration::seconds(60));
        assert_eq!(req.status, ApprovalStatus::Pending);
    }

    #[test]
    fn only_approved_allows_execution() {
        assert!(ApprovalStatus::Approved.allows_execution());
        assert!(!ApprovalStatus::Denied.allows_execution());
        assert!(!ApprovalStatus::Expired.allows_execution());
        assert!(!ApprovalStatus::Pending.allows_execution());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ApprovalStatus::Pending.is_terminal());
        assert!(ApprovalStatus::Approved.is_terminal());
        assert!(ApprovalStatus::Denied.is_terminal());
        assert!(ApprovalStatus::Expired.is_terminal());
    }

    #[test]
    fn serializes_lowercase_on_the_wire() {
        let value = serde_json::to_value(ApprovalStatus::Expired).unwrap();
        assert_eq!(value, json!("expired"));
        let value = serde_json::to_value(RiskLevel::High).unwrap();
        assert_eq!(value, json!("high"));
    }
}
