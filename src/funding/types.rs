use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One value movement between two wallets.
#[derive(Clone, PartialEq, Eq)]
pub struct WalletTransfer {
    pub from_wallet: String,
    pub to_wallet: String,
    pub amount: Decimal,
    /// Signing secret of `from_wallet`
    pub secret: String,
}

impl WalletTransfer {
    pub fn new(
        from_wallet: impl Into<String>,
        to_wallet: impl Into<String>,
        amount: Decimal,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            from_wallet: from_wallet.into(),
            to_wallet: to_wallet.into(),
            amount,
            secret: secret.into(),
        }
    }

    /// Wire payload understood by the transfer service
    pub fn to_payload(&self) -> TransferPayload {
        TransferPayload {
            sender_address: self.from_wallet.clone(),
            receiver_address: self.to_wallet.clone(),
            amount: format_amount(self.amount),
            sender_private_key: self.secret.clone(),
        }
    }
}

impl fmt::Debug for WalletTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletTransfer")
            .field("from_wallet", &self.from_wallet)
            .field("to_wallet", &self.to_wallet)
            .field("amount", &self.amount)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// JSON body of `POST /api/v1/wallet/transfer`.
///
/// `reciever_address` is the service's spelling and must be kept on the wire.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TransferPayload {
    pub sender_address: String,
    #[serde(rename = "reciever_address")]
    pub receiver_address: String,
    pub amount: String,
    pub sender_private_key: String,
}

/// Accepted transfer, as reported by the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub status: u16,
    pub body: String,
}

/// Shortest decimal string for an amount ("40" rather than "40.00")
pub fn format_amount(amount: Decimal) -> String {
    amount.normalize().to_string()
}
