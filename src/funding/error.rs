use thiserror::Error;

/// Outcome of a failed call to the funds transfer service.
///
/// None of these mean "maybe moved": a timeout is reported as a failure and the
/// caller must not treat it as success.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Transfer service unreachable: {0}")]
    Network(String),

    #[error("Transfer service timed out after {0} ms")]
    Timeout(u64),

    #[error("Transfer rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Failed to read transaction data from the transfer service (status {status})")]
    Unreadable { status: u16 },
}

impl GatewayError {
    /// Short machine-readable reason, used in logs and reconcile records
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Network(_) => "NETWORK",
            GatewayError::Timeout(_) => "TIMEOUT",
            GatewayError::Rejected { .. } => "REJECTED",
            GatewayError::Unreadable { .. } => "UNREADABLE",
        }
    }
}
