use thiserror::Error;

/// Failures while decoding a wire frame. Always recoverable: the consumer
/// logs the frame and keeps reading.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("frame exceeds {max} bytes")]
    Oversized { max: usize },
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid `{kind}` payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

/// Transport-level failures. Reconnect handles everything up to the retry
/// cap; past the cap the channel is terminally lost and needs a restart.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },
}

/// Failures raised by the page-automation collaborator. The operator sees
/// the translated message; the technical detail goes to the log only.
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("element `{0}` not found")]
    ElementNotFound(String),
    #[error("timed out waiting for `{0}`")]
    Timeout(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
}

impl AutomationError {
    /// Non-technical message shown to the operator.
    pub fn user_message(&self) -> &'static str {
        match self {
            AutomationError::ElementNotFound(_) => {
                "Could not find the expected control on the page."
            }
            AutomationError::Timeout(_) => "The page took too long to respond.",
            AutomationError::Navigation(_) => "Unable to reach the banking page.",
        }
    }

    /// Follow-up guidance paired with [`user_message`](Self::user_message).
    pub fn suggestion(&self) -> &'static str {
        match self {
            AutomationError::ElementNotFound(_) => {
                "The page layout may have changed; try the command again."
            }
            AutomationError::Timeout(_) => "Please wait a moment and retry.",
            AutomationError::Navigation(_) => {
                "Check that the banking server is running and retry."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_hides_technical_detail() {
        let err = AutomationError::ElementNotFound("button#confirm-transfer".to_string());
        assert!(!err.user_message().contains("confirm-transfer"));
        assert!(err.to_string().contains("confirm-transfer"));
    }
}
