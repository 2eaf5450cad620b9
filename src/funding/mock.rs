//! Scripted gateway for tests

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::gateway::TransferGateway;
use super::error::GatewayError;
use super::types::{TransferReceipt, WalletTransfer};

pub struct MockGateway {
    /// Every accepted transfer, in call order
    accepted: Mutex<Vec<WalletTransfer>>,
    call_count: AtomicUsize,
    /// Configured behavior
    failure: Mutex<Option<GatewayError>>,
    fail_to_wallet: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            accepted: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            failure: Mutex::new(None),
            fail_to_wallet: Mutex::new(None),
            delay: Mutex::new(None),
        }
    }

    /// Fail every call with `err` until cleared with `None`
    pub fn set_failure(&self, err: Option<GatewayError>) {
        *self.failure.lock().unwrap() = err;
    }

    /// Fail only transfers whose destination is `wallet`
    pub fn fail_transfers_to(&self, wallet: Option<&str>) {
        *self.fail_to_wallet.lock().unwrap() = wallet.map(str::to_string);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> Vec<WalletTransfer> {
        self.accepted.lock().unwrap().clone()
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferGateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn transfer(&self, transfer: &WalletTransfer) -> Result<TransferReceipt, GatewayError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        if self.fail_to_wallet.lock().unwrap().as_deref() == Some(transfer.to_wallet.as_str()) {
            return Err(GatewayError::Rejected {
                status: 400,
                message: format!("wallet {} rejected", transfer.to_wallet),
            });
        }

        self.accepted.lock().unwrap().push(transfer.clone());
        Ok(TransferReceipt {
            status: 200,
            body: "{}".to_string(),
        })
    }
}
