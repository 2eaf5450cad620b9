use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::GatewayError;
use super::types::{TransferReceipt, WalletTransfer};
use crate::config::EscrowConfig;

/// Client for the external funds transfer service.
///
/// The service is the only source of truth for whether value moved. Implementations
/// make exactly one attempt per call; retrying is the caller's decision.
#[async_trait]
pub trait TransferGateway: Send + Sync {
    /// Adapter name for logging
    fn name(&self) -> &'static str;

    async fn transfer(&self, transfer: &WalletTransfer) -> Result<TransferReceipt, GatewayError>;
}

/// HTTP implementation: `POST <endpoint>` with a JSON [`super::TransferPayload`].
pub struct HttpTransferGateway {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpTransferGateway {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub fn from_config(config: &EscrowConfig) -> Result<Self, GatewayError> {
        Self::new(config.transfer_endpoint(), config.transfer_timeout())
    }
}

#[async_trait]
impl TransferGateway for HttpTransferGateway {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn transfer(&self, transfer: &WalletTransfer) -> Result<TransferReceipt, GatewayError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&transfer.to_payload())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    GatewayError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) if status < 300 => {
                // Accepted is accepted; the body is only kept for the log
                warn!(status, error = %e, "Transfer accepted but body unreadable");
                String::new()
            }
            Err(_) => return Err(GatewayError::Unreadable { status }),
        };

        if status < 300 {
            debug!(
                status,
                from = %transfer.from_wallet,
                to = %transfer.to_wallet,
                amount = %transfer.amount,
                "Transfer posted"
            );
            return Ok(TransferReceipt { status, body });
        }

        let err = rejection_from_body(status, &body);
        warn!(status, error = %err, "Transfer service returned failure");
        Err(err)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<serde_json::Value>,
}

/// Map a non-success body to the service's own reason when it has one
fn rejection_from_body(status: u16, body: &str) -> GatewayError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error: Some(serde_json::Value::String(message)),
        }) => GatewayError::Rejected { status, message },
        Ok(ErrorBody { error: Some(other) }) => GatewayError::Rejected {
            status,
            message: other.to_string(),
        },
        _ => GatewayError::Unreadable { status },
    }
}
