use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::WalletError;
use crate::Amount;
use crate::model::{DealId, UserId};

/// Funds reserved for deals that have not settled yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenFunds {
    pub total: Amount,
    pub by_deal: BTreeMap<DealId, Amount>,
}

/// A user's wallet: spendable balance plus funds frozen per deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: UserId,
    pub balance: Amount,
    #[serde(default)]
    pub frozen: FrozenFunds,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_owned(),
            balance: Amount::ZERO,
            frozen: FrozenFunds::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total(&self) -> Amount {
        self.balance + self.frozen.total
    }

    pub fn frozen_for(&self, deal_id: &str) -> Option<Amount> {
        self.frozen.by_deal.get(deal_id).copied()
    }

    /// `frozen.total` equals the sum of the per-deal entries and nothing is negative.
    pub fn is_consistent(&self) -> bool {
        let sum: Amount = self.frozen.by_deal.values().copied().sum();
        !self.balance.is_negative() && sum == self.frozen.total
    }

    pub fn credit(&mut self, amount: Amount) -> Result<(), WalletError> {
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or(WalletError::Overflow)?;
        Ok(())
    }

    pub fn debit(&mut self, amount: Amount) -> Result<(), WalletError> {
        if self.balance < amount {
            return Err(WalletError::InsufficientBalance {
                user: self.user_id.clone(),
                available: self.balance,
                needed: amount,
            });
        }
        self.balance -= amount;
        Ok(())
    }

    /// Take `amount + fee` out of the balance and reserve `amount` for the deal.
    pub fn freeze(&mut self, deal_id: &str, amount: Amount, fee: Amount) -> Result<(), WalletError> {
        if self.frozen.by_deal.contains_key(deal_id) {
            return Err(WalletError::DealAlreadyFrozen {
                user: self.user_id.clone(),
                deal: deal_id.to_owned(),
            });
        }
        let needed = amount.checked_add(fee).ok_or(WalletError::Overflow)?;
        self.debit(needed)?;
        self.frozen.total += amount;
        self.frozen.by_deal.insert(deal_id.to_owned(), amount);
        Ok(())
    }

    /// Drop the deal's reservation and return its amount. The caller decides
    /// where the money goes.
    pub fn release(&mut self, deal_id: &str, expected: Amount) -> Result<Amount, WalletError> {
        let frozen = self
            .frozen_for(deal_id)
            .ok_or_else(|| WalletError::DealNotFrozen {
                user: self.user_id.clone(),
                deal: deal_id.to_owned(),
            })?;
        if frozen != expected {
            return Err(WalletError::FrozenAmountMismatch {
                deal: deal_id.to_owned(),
                frozen,
                requested: expected,
            });
        }
        self.frozen.by_deal.remove(deal_id);
        self.frozen.total -= frozen;
        Ok(frozen)
    }
}
