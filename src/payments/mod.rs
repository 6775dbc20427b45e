//! Payment orchestration.
//!
//! Bridges an external payment gateway to deal confirmation: the confirmation
//! fee is charged through the gateway, the payment is tracked in a local
//! record, and a background poll confirms the deal once the gateway reports
//! success.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::Amount;
use crate::deals::DealError;
use crate::error::{Classify, ErrorClass, RETRY_PROMPT};
use crate::model::{Deal, DealId, UserId};
use crate::store::StoreError;

mod gateway;
mod orchestrator;

pub use gateway::{
    GatewayError, GatewayPayment, HttpGateway, PaymentGateway, PaymentRequest, ScriptedGateway,
};
pub use orchestrator::{ConfirmationRequest, PaymentOrchestrator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Captured,
    Paid,
    Canceled,
    Failed,
}

impl PaymentStatus {
    /// Map a gateway status string. Anything not yet final reads as pending.
    pub fn from_gateway(status: &str) -> Self {
        match status {
            "succeeded" => PaymentStatus::Succeeded,
            "captured" => PaymentStatus::Captured,
            "paid" => PaymentStatus::Paid,
            "canceled" | "cancelled" => PaymentStatus::Canceled,
            "failed" => PaymentStatus::Failed,
            _ => PaymentStatus::Pending,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(
            self,
            PaymentStatus::Succeeded | PaymentStatus::Captured | PaymentStatus::Paid
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(self, PaymentStatus::Canceled | PaymentStatus::Failed)
    }

    pub fn is_terminal(self) -> bool {
        self.is_success() || self.is_failure()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Confirmation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: PaymentStatus,
    pub at: DateTime<Utc>,
}

/// Local view of an external payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub deal_id: DealId,
    pub user_id: UserId,
    pub kind: PaymentKind,
    pub amount: Amount,
    pub status: PaymentStatus,
    pub external_id: String,
    pub confirmation_url: String,
    /// Status polls made so far.
    #[serde(default)]
    pub polls: u32,
    #[serde(default)]
    pub history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How a confirmation payment ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Paid; the deal is confirmed and the payer's contacts are unlocked.
    Confirmed { status: PaymentStatus, deal: Deal },
    /// The gateway refused or the payer cancelled. The deal is untouched.
    Failed { status: PaymentStatus },
    /// No final status within the poll budget. Safe to retry.
    TimedOut { attempts: u32 },
}

impl Settlement {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Settlement::Confirmed { .. })
    }
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Deal(#[from] DealError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("payment {payment} is still being created")]
    InProgress { payment: String },

    #[error("payment polling stopped: {0}")]
    Aborted(String),
}

impl Classify for PaymentError {
    fn class(&self) -> ErrorClass {
        match self {
            PaymentError::Deal(err) => err.class(),
            PaymentError::Store(err) => err.class(),
            PaymentError::InProgress { .. } => ErrorClass::Business,
            PaymentError::Gateway(_) | PaymentError::Aborted(_) => ErrorClass::Infrastructure,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            PaymentError::Gateway(_) => "payment_gateway_failed",
            PaymentError::Deal(err) => err.code(),
            PaymentError::Store(err) => err.code(),
            PaymentError::InProgress { .. } => "payment_in_progress",
            PaymentError::Aborted(_) => "payment_polling_aborted",
        }
    }

    fn user_message(&self) -> &'static str {
        match self {
            PaymentError::Deal(err) => err.user_message(),
            PaymentError::Store(err) => err.user_message(),
            PaymentError::InProgress { .. } => "Your payment is being processed.",
            PaymentError::Gateway(_) | PaymentError::Aborted(_) => RETRY_PROMPT,
        }
    }
}

/// Returned as soon as the payment exists, so the payer can be sent to
/// `confirmation_url` while settlement is still pending.
pub struct PaymentHandle {
    pub payment_id: String,
    pub external_id: String,
    pub confirmation_url: String,
    settlement: JoinHandle<Result<Settlement, PaymentError>>,
}

impl PaymentHandle {
    pub(crate) fn new(
        record: PaymentRecord,
        settlement: JoinHandle<Result<Settlement, PaymentError>>,
    ) -> Self {
        Self {
            payment_id: record.id,
            external_id: record.external_id,
            confirmation_url: record.confirmation_url,
            settlement,
        }
    }

    /// Wait for polling to finish.
    pub async fn wait(self) -> Result<Settlement, PaymentError> {
        self.settlement
            .await
            .map_err(|e| PaymentError::Aborted(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_vocabulary() {
        assert!(PaymentStatus::from_gateway("succeeded").is_success());
        assert!(PaymentStatus::from_gateway("captured").is_success());
        assert!(PaymentStatus::from_gateway("paid").is_success());
        assert!(PaymentStatus::from_gateway("cancelled").is_failure());
        assert!(PaymentStatus::from_gateway("failed").is_failure());
        assert_eq!(
            PaymentStatus::from_gateway("waiting_for_capture"),
            PaymentStatus::Pending
        );
        assert!(!PaymentStatus::Pending.is_terminal());
    }
}
