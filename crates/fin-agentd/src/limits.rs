//! Hard caps on financial actions, checked before an approval request is
//! ever raised. The operator decides judgment calls; amounts past these
//! limits are refused outright and never reach the approval modal.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::intent::{format_inr, ActionKind};

const LEDGER_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitPeriod {
    Single,
    Daily,
    Weekly,
    Monthly,
}

impl LimitPeriod {
    fn as_str(&self) -> &'static str {
        match self {
            LimitPeriod::Single => "Single",
            LimitPeriod::Daily => "Daily",
            LimitPeriod::Weekly => "Weekly",
            LimitPeriod::Monthly => "Monthly",
        }
    }
}

/// Caps for one action, in INR. A cumulative cap counts successful
/// transactions of the same action within the current UTC day, ISO week,
/// or calendar month.
#[derive(Debug, Clone, Copy)]
pub struct LimitConfig {
    pub single: f64,
    pub daily: f64,
    pub weekly: f64,
    pub monthly: f64,
}

impl LimitConfig {
    fn for_action(action: ActionKind) -> Option<Self> {
        match action {
            ActionKind::PayBill => Some(Self {
                single: 50_000.0,
                daily: 200_000.0,
                weekly: 500_000.0,
                monthly: 1_000_000.0,
            }),
            ActionKind::FundTransfer => Some(Self {
                single: 100_000.0,
                daily: 500_000.0,
                weekly: 1_000_000.0,
                monthly: 2_000_000.0,
            }),
            ActionKind::BuyGold => Some(Self {
                single: 100_000.0,
                daily: 200_000.0,
                weekly: 500_000.0,
                monthly: 1_000_000.0,
            }),
            ActionKind::Login | ActionKind::CheckBalance | ActionKind::ViewTransactions => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimitViolation {
    pub period: LimitPeriod,
    pub limit: f64,
    pub used: f64,
    pub amount: f64,
}

impl fmt::Display for LimitViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.period {
            LimitPeriod::Single => write!(
                f,
                "Amount ₹{} exceeds the single transaction limit of ₹{}",
                format_inr(self.amount),
                format_inr(self.limit)
            ),
            period => write!(
                f,
                "{} limit would be exceeded. Used: ₹{}, Limit: ₹{}",
                period.as_str(),
                format_inr(self.used),
                format_inr(self.limit)
            ),
        }
    }
}

impl std::error::Error for LimitViolation {}

#[derive(Debug, Clone)]
struct Spend {
    action: ActionKind,
    amount: f64,
    at: DateTime<Utc>,
}

/// Per-action spend ledger with limit enforcement. Only successful,
/// confirmed transactions are recorded; refused and denied ones never
/// count against a cap.
pub struct TransactionLimits {
    ledger: Mutex<Vec<Spend>>,
}

impl TransactionLimits {
    pub fn new() -> Self {
        Self {
            ledger: Mutex::new(Vec::new()),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Vec<Spend>> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check whether `amount` fits every cap for the action. Actions with
    /// no configured limits always pass.
    pub fn check(&self, action: ActionKind, amount: f64) -> Result<(), LimitViolation> {
        let Some(config) = LimitConfig::for_action(action) else {
            return Ok(());
        };
        if amount > config.single {
            return Err(LimitViolation {
                period: LimitPeriod::Single,
                limit: config.single,
                used: 0.0,
                amount,
            });
        }
        let now = Utc::now();
        for (period, limit) in [
            (LimitPeriod::Daily, config.daily),
            (LimitPeriod::Weekly, config.weekly),
            (LimitPeriod::Monthly, config.monthly),
        ] {
            let used = self.usage(action, period, now);
            if used + amount > limit {
                return Err(LimitViolation {
                    period,
                    limit,
                    used,
                    amount,
                });
            }
        }
        Ok(())
    }

    pub fn record(&self, action: ActionKind, amount: f64) {
        self.record_at(action, amount, Utc::now());
    }

    fn record_at(&self, action: ActionKind, amount: f64, at: DateTime<Utc>) {
        let mut ledger = self.ledger();
        ledger.push(Spend { action, amount, at });
        if ledger.len() > LEDGER_CAP {
            let excess = ledger.len() - LEDGER_CAP;
            ledger.drain(..excess);
        }
    }

    pub fn usage_today(&self, action: ActionKind) -> f64 {
        self.usage(action, LimitPeriod::Daily, Utc::now())
    }

    fn usage(&self, action: ActionKind, period: LimitPeriod, now: DateTime<Utc>) -> f64 {
        let today = now.date_naive();
        let week_start = today - ChronoDuration::days(today.weekday().num_days_from_monday() as i64);
        self.ledger()
            .iter()
            .filter(|spend| spend.action == action)
            .filter(|spend| {
                let day = spend.at.date_naive();
                match period {
                    LimitPeriod::Single => false,
                    LimitPeriod::Daily => day == today,
                    LimitPeriod::Weekly => day >= week_start && day <= today,
                    LimitPeriod::Monthly => day.year() == today.year() && day.month() == today.month(),
                }
            })
            .map(|spend| spend.amount)
            .sum()
    }
}

impl Default for TransactionLimits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_limit_is_inclusive() {
        let limits = TransactionLimits::new();
        assert!(limits.check(ActionKind::PayBill, 50_000.0).is_ok());

        let violation = limits.check(ActionKind::PayBill, 50_001.0).unwrap_err();
        assert_eq!(violation.period, LimitPeriod::Single);
        assert!(violation.to_string().contains("single transaction limit"));
        assert!(violation.to_string().contains("₹50,000.00"));
    }

    #[test]
    fn daily_spend_accumulates_per_action() {
        let limits = TransactionLimits::new();
        for _ in 0..4 {
            limits.record(ActionKind::PayBill, 50_000.0);
        }
        // 200,000 of the 200,000 daily cap is used.
        let violation = limits.check(ActionKind::PayBill, 10_000.0).unwrap_err();
        assert_eq!(violation.period, LimitPeriod::Daily);
        assert_eq!(violation.used, 200_000.0);

        // A different action keeps its own ledger.
        assert!(limits.check(ActionKind::FundTransfer, 10_000.0).is_ok());
    }

    #[test]
    fn old_spend_falls_out_of_every_window() {
        let limits = TransactionLimits::new();
        limits.record_at(
            ActionKind::FundTransfer,
            500_000.0,
            Utc::now() - ChronoDuration::days(40),
        );
        assert!(limits.check(ActionKind::FundTransfer, 100_000.0).is_ok());
        assert_eq!(limits.usage_today(ActionKind::FundTransfer), 0.0);
    }

    #[test]
    fn unlimited_actions_always_pass() {
        let limits = TransactionLimits::new();
        assert!(limits.check(ActionKind::CheckBalance, 1_000_000_000.0).is_ok());
    }
}
