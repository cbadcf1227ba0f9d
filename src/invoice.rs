//! Invoice records and their status lifecycle.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coin::CoinType;

/// Lifecycle status of an [`Invoice`]. Transitions are monotone:
/// `Pending → PendingMempool → Confirmed`, with `Expired` reachable from any
/// non-terminal status by wall clock. An expired invoice may still be
/// upgraded to `Confirmed` if a qualifying transaction lands within the
/// grace window.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvoiceStatus {
    /// No qualifying transaction observed yet.
    Pending,
    /// A transaction crediting the invoice address has been observed but
    /// the invoice is not yet paid and confirmed in full.
    PendingMempool,
    /// Paid in full with the required confirmation depth.
    Confirmed,
    /// The invoice timed out before being paid and confirmed.
    Expired,
}

impl InvoiceStatus {
    /// Returns `true` for statuses with no further transitions (grace-window
    /// confirmation of an expired invoice notwithstanding).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, InvoiceStatus::Confirmed | InvoiceStatus::Expired)
    }

    /// Stable numeric code used on the wire and in storage.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            InvoiceStatus::Pending => 0,
            InvoiceStatus::PendingMempool => 1,
            InvoiceStatus::Expired => 2,
            InvoiceStatus::Confirmed => 3,
        }
    }

    /// Inverse of [`code`](Self::code).
    #[must_use]
    pub fn from_code(code: u32) -> Option<InvoiceStatus> {
        match code {
            0 => Some(InvoiceStatus::Pending),
            1 => Some(InvoiceStatus::PendingMempool),
            2 => Some(InvoiceStatus::Expired),
            3 => Some(InvoiceStatus::Confirmed),
            _ => None,
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InvoiceStatus::Pending => "PENDING",
            InvoiceStatus::PendingMempool => "PENDING_MEMPOOL",
            InvoiceStatus::Confirmed => "CONFIRMED",
            InvoiceStatus::Expired => "EXPIRED",
        };
        f.write_str(name)
    }
}

/// A tracked payment request. Created by the gateway with a freshly derived
/// receiving address; updated by the owning chain processor as payments are
/// observed; delivered to subscribers on every status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    /// Unique invoice id.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Coin the invoice is denominated in.
    pub coin: CoinType,
    /// Receiving address derived for this invoice.
    pub crypto_address: String,
    /// Amount due, in the coin's native unit.
    pub required_amount: f64,
    /// Amount of the most recently observed qualifying credit.
    pub actual_amount: Option<f64>,
    /// Block depth required before the invoice confirms.
    pub confirmations_required: u32,
    /// Current lifecycle status.
    pub status: InvoiceStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Confirmation time, set when the status reaches `Confirmed`.
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Expiry deadline; always later than `created_at`.
    pub expires_at: DateTime<Utc>,
    /// Id of the most recently observed crediting transaction.
    pub tx_id: Option<String>,
}

impl Invoice {
    /// Returns `true` once the invoice reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns `true` if the expiry deadline has passed at `now` and the
    /// invoice has not confirmed.
    #[must_use]
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now && self.status != InvoiceStatus::Confirmed
    }
}

impl fmt::Display for Invoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {} for {}/{} to {}",
            self.coin,
            self.id,
            self.status,
            self.actual_amount.unwrap_or(0.0),
            self.required_amount,
            self.crypto_address,
        )
    }
}

/// A request to open a new invoice, as handed over by the RPC layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInvoiceRequest {
    /// User the invoice belongs to.
    pub user_id: Uuid,
    /// Coin to accept.
    pub coin: CoinType,
    /// Amount due, in the coin's native unit.
    pub amount: f64,
    /// Time until the invoice expires.
    pub timeout: Duration,
    /// Required confirmation depth.
    pub confirmations: u32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use uuid::Uuid;

    use super::{Invoice, InvoiceStatus};
    use crate::coin::CoinType;

    fn dummy_invoice(status: InvoiceStatus) -> Invoice {
        let now = Utc::now();
        Invoice {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            coin: CoinType::Btc,
            crypto_address: "bc1qtest".to_string(),
            required_amount: 0.01,
            actual_amount: None,
            confirmations_required: 2,
            status,
            created_at: now,
            confirmed_at: None,
            expires_at: now + Duration::from_secs(3600),
            tx_id: None,
        }
    }

    #[test]
    fn status_codes_round_trip() {
        for status in [
            InvoiceStatus::Pending,
            InvoiceStatus::PendingMempool,
            InvoiceStatus::Expired,
            InvoiceStatus::Confirmed,
        ] {
            assert_eq!(InvoiceStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(InvoiceStatus::from_code(4), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!InvoiceStatus::Pending.is_terminal());
        assert!(!InvoiceStatus::PendingMempool.is_terminal());
        assert!(InvoiceStatus::Confirmed.is_terminal());
        assert!(InvoiceStatus::Expired.is_terminal());
    }

    #[test]
    fn expiry_check() {
        let mut invoice = dummy_invoice(InvoiceStatus::Pending);
        let now = Utc::now();
        assert!(!invoice.is_past_expiry(now));
        assert!(invoice.is_past_expiry(now + chrono::Duration::seconds(3601)));

        // A confirmed invoice never reads as expired.
        invoice.status = InvoiceStatus::Confirmed;
        assert!(!invoice.is_past_expiry(now + chrono::Duration::seconds(3601)));
    }
}
