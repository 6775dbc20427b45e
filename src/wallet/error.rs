//! Error types for wallet operations.

use thiserror::Error;

use crate::Amount;
use crate::error::{Classify, ErrorClass, RETRY_PROMPT};
use crate::model::{DealId, UserId};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("insufficient balance for user {user}: available {available}, needed {needed}")]
    InsufficientBalance {
        user: UserId,
        available: Amount,
        needed: Amount,
    },

    #[error("amount must be positive, got {0}")]
    InvalidAmount(Amount),

    #[error("wallet for user {0} not found")]
    WalletNotFound(UserId),

    #[error("deal {deal} already has frozen funds in wallet of {user}")]
    DealAlreadyFrozen { user: UserId, deal: DealId },

    #[error("deal {deal} has no frozen funds in wallet of {user}")]
    DealNotFrozen { user: UserId, deal: DealId },

    #[error("deal {deal} froze {frozen}, but {requested} was requested")]
    FrozenAmountMismatch {
        deal: DealId,
        frozen: Amount,
        requested: Amount,
    },

    #[error("deal {deal} price {price} is below the cancellation penalty {penalty}")]
    PenaltyExceedsPrice {
        deal: DealId,
        price: Amount,
        penalty: Amount,
    },

    #[error("deal {deal}: deductions {deductions} exceed the price {price}")]
    DeductionsExceedPrice {
        deal: DealId,
        price: Amount,
        deductions: Amount,
    },

    #[error("amount overflow")]
    Overflow,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for WalletError {
    fn class(&self) -> ErrorClass {
        match self {
            WalletError::Store(err) => err.class(),
            _ => ErrorClass::Business,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            WalletError::InsufficientBalance { .. } => "insufficient_balance",
            WalletError::InvalidAmount(_) => "invalid_amount",
            WalletError::WalletNotFound(_) => "wallet_not_found",
            WalletError::DealAlreadyFrozen { .. } => "deal_already_frozen",
            WalletError::DealNotFrozen { .. } => "deal_not_frozen",
            WalletError::FrozenAmountMismatch { .. } => "frozen_amount_mismatch",
            WalletError::PenaltyExceedsPrice { .. } => "penalty_exceeds_price",
            WalletError::DeductionsExceedPrice { .. } => "deductions_exceed_price",
            WalletError::Overflow => "amount_overflow",
            WalletError::Store(err) => err.code(),
        }
    }

    fn user_message(&self) -> &'static str {
        match self {
            WalletError::InsufficientBalance { .. } => {
                "Not enough funds on your balance. Top up and try again."
            }
            WalletError::InvalidAmount(_) => "Enter an amount greater than zero.",
            WalletError::WalletNotFound(_) => "Your wallet has not been set up yet.",
            WalletError::DealAlreadyFrozen { .. } => "Funds for this deal are already reserved.",
            WalletError::DealNotFrozen { .. } => "There are no reserved funds for this deal.",
            WalletError::FrozenAmountMismatch { .. } => {
                "The deal amount does not match the reserved funds."
            }
            WalletError::PenaltyExceedsPrice { .. } => {
                "This deal is priced below the cancellation penalty and cannot be cancelled late."
            }
            WalletError::DeductionsExceedPrice { .. } => {
                "Deductions cannot exceed the deal price."
            }
            WalletError::Overflow => "The amount is too large.",
            WalletError::Store(err) if err.class() == ErrorClass::Conflict => err.user_message(),
            WalletError::Store(_) => RETRY_PROMPT,
        }
    }
}
