//! Core domain types shared by the wallet, offer and deal services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Amount;

/// User identifier (clients and contractors share one id space).
pub type UserId = String;

/// Ledger transaction identifier.
pub type TxId = String;

pub type DealId = String;
pub type OfferId = String;
pub type OrderId = String;

/// Fresh random document id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// An immutable money movement recorded in the transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub user_id: UserId,
    pub amount: Amount,
    #[serde(flatten)]
    pub kind: TransactionKind,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(user_id: &str, amount: Amount, kind: TransactionKind, now: DateTime<Utc>) -> Self {
        let description = kind.describe(amount);
        Self {
            id: new_id(),
            user_id: user_id.to_owned(),
            amount,
            kind,
            description,
            created_at: now,
        }
    }
}

/// Which point of the deal lifecycle a commission was charged at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStage {
    /// Flat fee charged to the client when funds are frozen for a deal.
    Selection,
    /// Tiered commission withheld from the contractor payout.
    Payout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    EarlyCancellation,
    CompletionAdjustment,
}

/// Type-specific payload of a [`Transaction`], tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionKind {
    Commission {
        deal_id: DealId,
        stage: CommissionStage,
    },
    Refund {
        deal_id: DealId,
        reason: RefundReason,
    },
    /// Charged to the client on a late cancellation.
    Penalty {
        deal_id: DealId,
        contractor_id: UserId,
    },
    /// Paid to the contractor out of a client's late-cancellation penalty.
    PenaltyCompensation {
        deal_id: DealId,
        client_id: UserId,
    },
    Payment {
        deal_id: DealId,
        commission: Amount,
    },
    Deposit,
    Withdrawal,
}

impl TransactionKind {
    pub fn label(&self) -> &'static str {
        match self {
            TransactionKind::Commission { .. } => "commission",
            TransactionKind::Refund { .. } => "refund",
            TransactionKind::Penalty { .. } => "penalty",
            TransactionKind::PenaltyCompensation { .. } => "penalty_compensation",
            TransactionKind::Payment { .. } => "payment",
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
        }
    }

    pub fn deal_id(&self) -> Option<&str> {
        match self {
            TransactionKind::Commission { deal_id, .. }
            | TransactionKind::Refund { deal_id, .. }
            | TransactionKind::Penalty { deal_id, .. }
            | TransactionKind::PenaltyCompensation { deal_id, .. }
            | TransactionKind::Payment { deal_id, .. } => Some(deal_id),
            TransactionKind::Deposit | TransactionKind::Withdrawal => None,
        }
    }

    fn describe(&self, amount: Amount) -> String {
        match self {
            TransactionKind::Commission {
                stage: CommissionStage::Selection,
                ..
            } => "Commission for deal selection".to_string(),
            TransactionKind::Commission {
                stage: CommissionStage::Payout,
                ..
            } => "Platform commission".to_string(),
            TransactionKind::Refund {
                reason: RefundReason::EarlyCancellation,
                ..
            } => "Refund for early cancellation".to_string(),
            TransactionKind::Refund {
                reason: RefundReason::CompletionAdjustment,
                ..
            } => "Refund withheld from completed deal payout".to_string(),
            TransactionKind::Penalty { .. } => {
                format!("Late cancellation penalty, {amount} to contractor")
            }
            TransactionKind::PenaltyCompensation { .. } => {
                "Compensation for client late cancellation".to_string()
            }
            TransactionKind::Payment { commission, .. } => {
                format!("Payment for completed deal (commission {commission})")
            }
            TransactionKind::Deposit => "Balance top-up".to_string(),
            TransactionKind::Withdrawal => "Withdrawal to card".to_string(),
        }
    }
}

/// Offer states. `Expired` is also derived lazily from `expires_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Declined,
    Chosen,
    Expired,
}

/// Order fields copied onto an offer so it can be shown without a second fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OrderSnapshot {
    pub address: Option<String>,
    pub short_desc: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchMeta {
    pub matched_by: String,
    pub matched_at: DateTime<Utc>,
    pub algorithm_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub order_id: OrderId,
    pub contractor_id: UserId,
    pub status: OfferStatus,
    pub proposed_price: Option<Amount>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub declined_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub chosen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deal_id: Option<DealId>,
    pub order_snapshot: OrderSnapshot,
    #[serde(default)]
    pub contractor_push_token: Option<String>,
    pub meta: MatchMeta,
}

impl Offer {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Pending or accepted, and not past its TTL.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, OfferStatus::Pending | OfferStatus::Accepted) && !self.is_expired(now)
    }

    /// Status as seen at `now`: open offers past their TTL read as expired.
    pub fn effective_status(&self, now: DateTime<Utc>) -> OfferStatus {
        match self.status {
            OfferStatus::Pending | OfferStatus::Accepted if self.is_expired(now) => {
                OfferStatus::Expired
            }
            status => status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    Pending,
    ExecutorSelected,
    WaitingClientConfirmation,
    Confirmed,
    InProgress,
    Completed,
    Canceled,
    Expired,
}

impl DealStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DealStatus::Completed | DealStatus::Canceled | DealStatus::Expired
        )
    }

    fn rank(self) -> u8 {
        match self {
            DealStatus::Pending => 0,
            DealStatus::ExecutorSelected => 1,
            DealStatus::WaitingClientConfirmation => 2,
            DealStatus::Confirmed => 3,
            DealStatus::InProgress => 4,
            DealStatus::Completed => 5,
            DealStatus::Canceled | DealStatus::Expired => 6,
        }
    }

    /// Forward-only transitions; `Canceled` is reachable from every
    /// non-terminal state.
    pub fn can_transition_to(self, next: DealStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            DealStatus::Canceled | DealStatus::Expired => true,
            DealStatus::Pending => false,
            next => next.rank() > self.rank(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DealStatus::Pending => "pending",
            DealStatus::ExecutorSelected => "executor_selected",
            DealStatus::WaitingClientConfirmation => "waiting_client_confirmation",
            DealStatus::Confirmed => "confirmed",
            DealStatus::InProgress => "in_progress",
            DealStatus::Completed => "completed",
            DealStatus::Canceled => "canceled",
            DealStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for DealStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Participant role in a deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Client,
    Contractor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PenaltyInfo {
    pub applied: bool,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    pub reason: Option<String>,
    pub cancelled_by: Party,
    pub penalty: PenaltyInfo,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutSummary {
    pub contractor_received: Amount,
    pub commission: Amount,
    pub client_refund: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: DealId,
    pub order_id: OrderId,
    pub offer_id: OfferId,
    pub client_id: UserId,
    pub contractor_id: UserId,
    pub price: Amount,
    pub status: DealStatus,
    /// Selection commission entry written when the price was frozen. None
    /// when the fee was waived.
    #[serde(default)]
    pub frozen_transaction_id: Option<TxId>,
    pub client_contacts_unlocked: bool,
    pub contractor_contacts_unlocked: bool,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancellation: Option<Cancellation>,
    #[serde(default)]
    pub payout: Option<PayoutSummary>,
    #[serde(default)]
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    pub fn party_of(&self, user_id: &str) -> Option<Party> {
        if self.client_id == user_id {
            Some(Party::Client)
        } else if self.contractor_id == user_id {
            Some(Party::Contractor)
        } else {
            None
        }
    }

    pub fn contacts_unlocked(&self, party: Party) -> bool {
        match party {
            Party::Client => self.client_contacts_unlocked,
            Party::Contractor => self.contractor_contacts_unlocked,
        }
    }

    pub fn unlock_contacts(&mut self, party: Party) {
        match party {
            Party::Client => self.client_contacts_unlocked = true,
            Party::Contractor => self.contractor_contacts_unlocked = true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Open,
    ExecutorSelected,
    Completed,
    Canceled,
}

/// The slice of an order this crate reads and mutates. Everything else about
/// orders belongs to the order-management side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub client_id: UserId,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub selected_offer_id: Option<OfferId>,
    #[serde(default)]
    pub selected_deal_id: Option<DealId>,
    #[serde(default)]
    pub top_contractors: Vec<UserId>,
    #[serde(default)]
    pub responses_count: u32,
}

impl Order {
    pub fn new(id: &str, client_id: &str) -> Self {
        Self {
            id: id.to_owned(),
            client_id: client_id.to_owned(),
            status: OrderStatus::Open,
            description: String::new(),
            address: None,
            latitude: None,
            longitude: None,
            category_id: None,
            scheduled_at: None,
            selected_offer_id: None,
            selected_deal_id: None,
            top_contractors: Vec::new(),
            responses_count: 0,
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }
}
