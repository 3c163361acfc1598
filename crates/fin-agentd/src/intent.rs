//! Natural-language intent extraction, modeled only at its interface
//! boundary. The shipped parser is the rule-based fallback; an AI-backed
//! parser would implement the same trait.

use fin_core::approval::RiskLevel;
use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Login,
    CheckBalance,
    PayBill,
    FundTransfer,
    BuyGold,
    ViewTransactions,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Login => "login",
            ActionKind::CheckBalance => "check_balance",
            ActionKind::PayBill => "pay_bill",
            ActionKind::FundTransfer => "fund_transfer",
            ActionKind::BuyGold => "buy_gold",
            ActionKind::ViewTransactions => "view_transactions",
        }
    }

    /// Drives UI emphasis only; gating is decided by
    /// [`requires_approval`](Self::requires_approval).
    pub fn risk_level(&self) -> RiskLevel {
        match self {
            ActionKind::PayBill | ActionKind::FundTransfer | ActionKind::BuyGold => RiskLevel::High,
            ActionKind::Login | ActionKind::CheckBalance | ActionKind::ViewTransactions => {
                RiskLevel::Low
            }
        }
    }

    pub fn requires_approval(&self) -> bool {
        matches!(
            self,
            ActionKind::PayBill | ActionKind::FundTransfer | ActionKind::BuyGold
        )
    }

    /// Screen the driver must reach before the action runs.
    pub fn nav_screen(&self) -> Option<&'static str> {
        match self {
            ActionKind::PayBill => Some("pay-bills"),
            ActionKind::FundTransfer => Some("fund-transfer"),
            ActionKind::BuyGold => Some("buy-gold"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Intent {
    pub action: ActionKind,
    pub parameters: Value,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntentError {
    #[error("could not understand the command; please try rephrasing")]
    Unrecognized,
}

pub trait IntentParser: Send + Sync {
    fn parse(&self, command: &str) -> Result<Intent, IntentError>;
}

/// Keyword matcher with regex extraction for amounts, grams, and
/// recipients. Bill keywords are checked before transfer keywords because
/// "pay" alone reads as a transfer.
pub struct KeywordIntentParser {
    amount_re: Regex,
    grams_re: Regex,
    recipient_re: Regex,
}

const BILL_KEYWORDS: &[&str] = &[
    "bill",
    "electricity",
    "gas",
    "water",
    "mobile",
    "broadband",
    "utility",
];
const TRANSFER_KEYWORDS: &[&str] = &["transfer", "send money", "send", "remit", "wire", "pay"];
const BALANCE_KEYWORDS: &[&str] = &["balance", "how much", "funds"];
const TRANSACTION_KEYWORDS: &[&str] = &["transactions", "history", "statement", "recent"];
const LOGIN_KEYWORDS: &[&str] = &["login", "log in", "sign in", "authenticate"];

impl KeywordIntentParser {
    pub fn new() -> Self {
        // The patterns are fixed literals; construction cannot fail at
        // runtime, so the expects fire only on a typo caught by tests.
        Self {
            amount_re: Regex::new(r"(?i)(?:₹|rs\.?\s*)?(\d+(?:,\d{3})*(?:\.\d+)?)\s*(?:rupees|rs)?")
                .expect("amount pattern"),
            grams_re: Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*grams?").expect("grams pattern"),
            recipient_re: Regex::new(r"(?i)\bto\s+([A-Za-z]+)").expect("recipient pattern"),
        }
    }

    fn amount(&self, command: &str) -> Option<f64> {
        self.amount_re
            .captures(command)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().replace(',', "").parse::<f64>().ok())
    }

    fn grams(&self, command: &str) -> Option<f64> {
        self.grams_re
            .captures(command)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
    }

    fn recipient(&self, command: &str) -> Option<String> {
        self.recipient_re
            .captures(command)
            .and_then(|caps| caps.get(1))
            .map(|m| {
                let name = m.as_str();
                let mut chars = name.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => name.to_string(),
                }
            })
    }
}

impl Default for KeywordIntentParser {
    fn default() -> Self {
        Self::new()
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

impl IntentParser for KeywordIntentParser {
    fn parse(&self, command: &str) -> Result<Intent, IntentError> {
        let lowered = command.to_lowercase();

        if contains_any(&lowered, BILL_KEYWORDS) {
            let biller = self
                .recipient(command)
                .unwrap_or_else(|| "Adani Power".to_string());
            return Ok(Intent {
                action: ActionKind::PayBill,
                parameters: json!({
                    "biller": biller,
                    "amount": self.amount(&lowered).unwrap_or(1000.0),
                }),
            });
        }
        if lowered.contains("gold") {
            let mut parameters = json!({});
            if let Some(grams) = self.grams(&lowered) {
                parameters = json!({ "grams": grams });
            } else if let Some(amount) = self.amount(&lowered) {
                parameters = json!({ "amount": amount });
            }
            return Ok(Intent {
                action: ActionKind::BuyGold,
                parameters,
            });
        }
        if contains_any(&lowered, TRANSFER_KEYWORDS) {
            return Ok(Intent {
                action: ActionKind::FundTransfer,
                parameters: json!({
                    "recipient": self.recipient(command).unwrap_or_else(|| "Unknown".to_string()),
                    "amount": self.amount(&lowered).unwrap_or(0.0),
                }),
            });
        }
        if contains_any(&lowered, BALANCE_KEYWORDS) {
            return Ok(Intent {
                action: ActionKind::CheckBalance,
                parameters: json!({}),
            });
        }
        if contains_any(&lowered, TRANSACTION_KEYWORDS) {
            return Ok(Intent {
                action: ActionKind::ViewTransactions,
                parameters: json!({}),
            });
        }
        if contains_any(&lowered, LOGIN_KEYWORDS) {
            return Ok(Intent {
                action: ActionKind::Login,
                parameters: json!({}),
            });
        }

        Err(IntentError::Unrecognized)
    }
}

/// Western-grouped amount with two decimals, matching the original
/// dashboard's display format.
pub fn format_inr(amount: f64) -> String {
    let negative = amount < 0.0;
    let cents = (amount.abs() * 100.0).round() as u64;
    let whole = cents / 100;
    let frac = cents % 100;
    let digits = whole.to_string();
    let mut grouped = String::new();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if negative { "-" } else { "" };
    format!("{sign}{grouped}.{frac:02}")
}

/// Human-readable action line shown in the approval modal.
pub fn describe(action: ActionKind, parameters: &Value) -> String {
    let amount = parameters.get("amount").and_then(Value::as_f64);
    match action {
        ActionKind::PayBill => {
            let biller = parameters
                .get("biller")
                .and_then(Value::as_str)
                .unwrap_or("Unknown Biller");
            format!("Pay ₹{} to {}", format_inr(amount.unwrap_or(0.0)), biller)
        }
        ActionKind::FundTransfer => {
            let recipient = parameters
                .get("recipient")
                .and_then(Value::as_str)
                .unwrap_or("Unknown");
            format!(
                "Transfer ₹{} to {}",
                format_inr(amount.unwrap_or(0.0)),
                recipient
            )
        }
        ActionKind::BuyGold => match parameters.get("grams").and_then(Value::as_f64) {
            Some(grams) => format!("Purchase {grams:.3} grams of Digital Gold"),
            None => format!(
                "Purchase ₹{} worth of Digital Gold",
                format_inr(amount.unwrap_or(0.0))
            ),
        },
        other => format!("Execute {} action", other.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fund_transfer_with_amount_and_recipient() {
        let parser = KeywordIntentParser::new();
        let intent = parser.parse("transfer 5000 to Mom").unwrap();
        assert_eq!(intent.action, ActionKind::FundTransfer);
        assert_eq!(intent.parameters["recipient"], "Mom");
        assert_eq!(intent.parameters["amount"], 5000.0);
    }

    #[test]
    fn bill_keywords_win_over_pay() {
        let parser = KeywordIntentParser::new();
        let intent = parser
            .parse("pay electricity bill of 1500 rupees to Adani")
            .unwrap();
        assert_eq!(intent.action, ActionKind::PayBill);
        assert_eq!(intent.parameters["amount"], 1500.0);
    }

    #[test]
    fn parses_gold_by_grams() {
        let parser = KeywordIntentParser::new();
        let intent = parser.parse("buy 2.5 grams of gold").unwrap();
        assert_eq!(intent.action, ActionKind::BuyGold);
        assert_eq!(intent.parameters["grams"], 2.5);
    }

    #[test]
    fn unrecognized_command_is_an_error() {
        let parser = KeywordIntentParser::new();
        assert_eq!(
            parser.parse("order a pizza").unwrap_err(),
            IntentError::Unrecognized
        );
    }

    #[test]
    fn describe_formats_the_modal_line() {
        let params = serde_json::json!({"recipient": "Mom", "amount": 5000.0});
        assert_eq!(
            describe(ActionKind::FundTransfer, &params),
            "Transfer ₹5,000.00 to Mom"
        );
    }

    #[test]
    fn inr_grouping() {
        assert_eq!(format_inr(0.0), "0.00");
        assert_eq!(format_inr(1234567.5), "1,234,567.50");
    }
}
