/// Provider error with retry classification.
///
/// The runtime uses `is_retryable()` to decide whether to retry the storage
/// operation with backoff or fail fast.
///
/// Retryable: database busy/locked, connection timeouts, transient resource
/// exhaustion. Permanent: missing instances, sequence regressions, malformed
/// payloads, invalid or expired lock tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed, e.g. "ack_orchestration_item".
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Surface this error in a history event or client status.
    pub fn to_failure_details(&self) -> crate::FailureDetails {
        crate::FailureDetails {
            kind: crate::ErrorKind::Infrastructure {
                retryable: self.retryable,
            },
            message: format!("{}: {}", self.operation, self.message),
            detail: None,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}
