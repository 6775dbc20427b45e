//! Wallet engine.
//!
//! Every balance mutation goes through here: freezing a deal's price,
//! refunding it on cancellation, splitting it on a late cancellation, paying
//! it out on completion, plus plain top-ups and withdrawals. Each operation
//! reads the wallets it touches, mutates them in memory and stages the new
//! wallets together with the matching audit entries in one [`Txn`]. The
//! commit is conditional on the versions read, so two operations racing on
//! the same wallet never interleave: the loser re-reads and re-validates.
//!
//! The `stage_*` variants only stage into a caller-provided [`Txn`], which
//! lets the deal lifecycle commit a status change and its money movement as
//! one unit.

use std::sync::Arc;

use tracing::info;

use crate::Amount;
use crate::clock::Clock;
use crate::config::Policy;
use crate::journal;
use crate::model::{CommissionStage, RefundReason, Transaction, TransactionKind, TxId};
use crate::store::{Collection, DEFAULT_ATTEMPTS, DocumentStore, Txn, fetch, fetch_all, run_txn};

mod command;
mod error;
mod state;

pub use command::WalletCommand;
pub use error::WalletError;
pub use state::{FrozenFunds, Wallet};

/// Outcome of freezing funds for a deal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezeReceipt {
    pub new_balance: Amount,
    pub frozen_total: Amount,
    pub fee: Amount,
    /// Id of the selection commission entry, if a fee was charged.
    pub commission_tx: Option<TxId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    pub refunded: Amount,
    pub new_balance: Amount,
    pub refund_tx: TxId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PenaltyReceipt {
    pub client_refund: Amount,
    pub contractor_compensation: Amount,
    pub penalty_tx: TxId,
    pub compensation_tx: TxId,
}

/// Inputs for paying out a completed deal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payout {
    pub deal_id: String,
    pub client_id: String,
    pub contractor_id: String,
    pub price: Amount,
    /// Deals the contractor completed before this one; picks the commission tier.
    pub completed_before: u32,
    /// Withheld from the contractor and refunded to the client.
    pub adjustment: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutReceipt {
    pub contractor_received: Amount,
    pub commission: Amount,
    pub client_refund: Amount,
    pub payment_tx: TxId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceInfo {
    pub balance: Amount,
    pub frozen: FrozenFunds,
    /// `balance + frozen.total`.
    pub total: Amount,
}

/// The wallet engine. Stateless apart from its handles; safe to share.
pub struct WalletEngine {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    policy: Policy,
    attempts: u32,
}

/// Public API
impl WalletEngine {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, policy: Policy) -> Self {
        Self {
            store,
            clock,
            policy,
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    /// Optimistic retry budget per operation.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub async fn wallet(&self, user_id: &str) -> Result<Option<Wallet>, WalletError> {
        Ok(fetch(self.store.as_ref(), Collection::Wallets, user_id).await?)
    }

    /// All wallets, ordered by user id.
    pub async fn wallets(&self) -> Result<Vec<Wallet>, WalletError> {
        let mut wallets: Vec<Wallet> = fetch_all(self.store.as_ref(), Collection::Wallets).await?;
        wallets.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(wallets)
    }

    /// Deals paid out to this contractor so far, counted from their log.
    pub async fn completed_payouts(&self, contractor_id: &str) -> Result<u32, WalletError> {
        let history = self.history(contractor_id).await?;
        Ok(history
            .iter()
            .filter(|t| matches!(t.kind, TransactionKind::Payment { .. }))
            .count() as u32)
    }

    /// Balance, frozen funds and total; a missing wallet reads as empty.
    pub async fn balance_info(&self, user_id: &str) -> Result<BalanceInfo, WalletError> {
        let wallet = self.wallet(user_id).await?;
        Ok(match wallet {
            Some(w) => BalanceInfo {
                balance: w.balance,
                total: w.total(),
                frozen: w.frozen,
            },
            None => BalanceInfo {
                balance: Amount::ZERO,
                frozen: FrozenFunds::default(),
                total: Amount::ZERO,
            },
        })
    }

    /// Transaction log for a user, newest first.
    pub async fn history(&self, user_id: &str) -> Result<Vec<Transaction>, WalletError> {
        Ok(journal::for_user(self.store.as_ref(), user_id).await?)
    }

    /// Create an empty wallet if the user has none yet.
    pub async fn ensure_wallet(&self, user_id: &str) -> Result<Wallet, WalletError> {
        run_txn(&self.store, self.attempts, |mut txn| async move {
            let now = self.clock.now();
            let wallet: Option<Wallet> = txn.get(Collection::Wallets, user_id).await?;
            let wallet = match wallet {
                Some(w) => w,
                None => {
                    let w = Wallet::new(user_id, now);
                    txn.create(Collection::Wallets, user_id, &w)?;
                    w
                }
            };
            Ok((wallet, txn))
        })
        .await
    }

    /// Credit external funds; creates the wallet on first top-up.
    pub async fn add_balance(&self, user_id: &str, amount: Amount) -> Result<Amount, WalletError> {
        let result = run_txn(&self.store, self.attempts, |mut txn| async move {
            require_positive(amount)?;
            let now = self.clock.now();
            let mut wallet = load_or_new(&mut txn, user_id, now).await?;
            wallet.credit(amount)?;
            save(&mut txn, &mut wallet, now)?;
            journal::record(
                &mut txn,
                &Transaction::new(user_id, amount, TransactionKind::Deposit, now),
            )?;
            Ok((wallet.balance, txn))
        })
        .await;
        log_result("deposit", user_id, None, amount, &result);
        result
    }

    pub async fn withdraw(&self, user_id: &str, amount: Amount) -> Result<Amount, WalletError> {
        let result = run_txn(&self.store, self.attempts, |mut txn| async move {
            require_positive(amount)?;
            let now = self.clock.now();
            let mut wallet = load(&mut txn, user_id).await?;
            wallet.debit(amount)?;
            save(&mut txn, &mut wallet, now)?;
            journal::record(
                &mut txn,
                &Transaction::new(user_id, amount, TransactionKind::Withdrawal, now),
            )?;
            Ok((wallet.balance, txn))
        })
        .await;
        log_result("withdrawal", user_id, None, amount, &result);
        result
    }

    pub async fn freeze_for_deal(
        &self,
        user_id: &str,
        deal_id: &str,
        price: Amount,
    ) -> Result<FreezeReceipt, WalletError> {
        let result = run_txn(&self.store, self.attempts, |mut txn| async move {
            let receipt = self.stage_freeze(&mut txn, user_id, deal_id, price).await?;
            Ok((receipt, txn))
        })
        .await;
        log_result("freeze", user_id, Some(deal_id), price, &result);
        result
    }

    pub async fn cancel_early(
        &self,
        user_id: &str,
        deal_id: &str,
        price: Amount,
    ) -> Result<RefundReceipt, WalletError> {
        let result = run_txn(&self.store, self.attempts, |mut txn| async move {
            let receipt = self
                .stage_cancel_early(&mut txn, user_id, deal_id, price)
                .await?;
            Ok((receipt, txn))
        })
        .await;
        log_result("cancel_early", user_id, Some(deal_id), price, &result);
        result
    }

    pub async fn cancel_with_penalty(
        &self,
        client_id: &str,
        contractor_id: &str,
        deal_id: &str,
        price: Amount,
    ) -> Result<PenaltyReceipt, WalletError> {
        let result = run_txn(&self.store, self.attempts, |mut txn| async move {
            let receipt = self
                .stage_cancel_with_penalty(&mut txn, client_id, contractor_id, deal_id, price)
                .await?;
            Ok((receipt, txn))
        })
        .await;
        log_result("cancel_with_penalty", client_id, Some(deal_id), price, &result);
        result
    }

    pub async fn complete_and_pay(&self, payout: &Payout) -> Result<PayoutReceipt, WalletError> {
        let result = run_txn(&self.store, self.attempts, |mut txn| async move {
            let receipt = self.stage_complete(&mut txn, payout).await?;
            Ok((receipt, txn))
        })
        .await;
        log_result(
            "complete",
            &payout.contractor_id,
            Some(&payout.deal_id),
            payout.price,
            &result,
        );
        result
    }
}

/// Staged operations, composed into larger units of work by the deal lifecycle.
impl WalletEngine {
    /// - Ensure the price is positive and not already frozen for this deal
    /// - Ensure `balance >= price + platform fee`
    /// - Charge the fee, move the price into `frozen.by_deal`
    /// - Record the selection commission
    pub async fn stage_freeze(
        &self,
        txn: &mut Txn,
        user_id: &str,
        deal_id: &str,
        price: Amount,
    ) -> Result<FreezeReceipt, WalletError> {
        require_positive(price)?;
        let now = self.clock.now();
        let fee = self.policy.platform_fee;

        let mut wallet = load(txn, user_id).await?;
        wallet.freeze(deal_id, price, fee)?;
        save(txn, &mut wallet, now)?;

        let mut commission_tx = None;
        if fee.is_positive() {
            let commission = Transaction::new(
                user_id,
                fee,
                TransactionKind::Commission {
                    deal_id: deal_id.to_owned(),
                    stage: CommissionStage::Selection,
                },
                now,
            );
            journal::record(txn, &commission)?;
            commission_tx = Some(commission.id);
        }

        Ok(FreezeReceipt {
            new_balance: wallet.balance,
            frozen_total: wallet.frozen.total,
            fee,
            commission_tx,
        })
    }

    /// Return the frozen price to the balance. The selection fee stays charged.
    pub async fn stage_cancel_early(
        &self,
        txn: &mut Txn,
        user_id: &str,
        deal_id: &str,
        price: Amount,
    ) -> Result<RefundReceipt, WalletError> {
        require_positive(price)?;
        let now = self.clock.now();

        let mut wallet = load(txn, user_id).await?;
        let released = wallet.release(deal_id, price)?;
        wallet.credit(released)?;
        save(txn, &mut wallet, now)?;

        let refund = Transaction::new(
            user_id,
            released,
            TransactionKind::Refund {
                deal_id: deal_id.to_owned(),
                reason: RefundReason::EarlyCancellation,
            },
            now,
        );
        journal::record(txn, &refund)?;

        Ok(RefundReceipt {
            refunded: released,
            new_balance: wallet.balance,
            refund_tx: refund.id,
        })
    }

    /// Split the frozen price: the penalty goes to the contractor, the rest
    /// back to the client. Prices below the penalty are rejected outright.
    pub async fn stage_cancel_with_penalty(
        &self,
        txn: &mut Txn,
        client_id: &str,
        contractor_id: &str,
        deal_id: &str,
        price: Amount,
    ) -> Result<PenaltyReceipt, WalletError> {
        require_positive(price)?;
        let penalty = self.policy.penalty;
        if price < penalty {
            return Err(WalletError::PenaltyExceedsPrice {
                deal: deal_id.to_owned(),
                price,
                penalty,
            });
        }
        let now = self.clock.now();
        let refund = price - penalty;

        let mut client = load(txn, client_id).await?;
        client.release(deal_id, price)?;
        client.credit(refund)?;
        save(txn, &mut client, now)?;

        let mut contractor = load_or_new(txn, contractor_id, now).await?;
        contractor.credit(penalty)?;
        save(txn, &mut contractor, now)?;

        let penalty_entry = Transaction::new(
            client_id,
            penalty,
            TransactionKind::Penalty {
                deal_id: deal_id.to_owned(),
                contractor_id: contractor_id.to_owned(),
            },
            now,
        );
        let compensation_entry = Transaction::new(
            contractor_id,
            penalty,
            TransactionKind::PenaltyCompensation {
                deal_id: deal_id.to_owned(),
                client_id: client_id.to_owned(),
            },
            now,
        );
        journal::record(txn, &penalty_entry)?;
        journal::record(txn, &compensation_entry)?;

        Ok(PenaltyReceipt {
            client_refund: refund,
            contractor_compensation: penalty,
            penalty_tx: penalty_entry.id,
            compensation_tx: compensation_entry.id,
        })
    }

    /// - Clear the client's frozen entry for the deal (the funds are spent)
    /// - Pay the contractor the price minus the tiered commission and any adjustment
    /// - Refund the adjustment to the client
    pub async fn stage_complete(
        &self,
        txn: &mut Txn,
        payout: &Payout,
    ) -> Result<PayoutReceipt, WalletError> {
        require_positive(payout.price)?;
        if payout.adjustment.is_negative() {
            return Err(WalletError::InvalidAmount(payout.adjustment));
        }
        let now = self.clock.now();
        let commission = self.policy.payout_commission_for(payout.completed_before);
        let deductions = commission
            .checked_add(payout.adjustment)
            .ok_or(WalletError::Overflow)?;
        if deductions > payout.price {
            return Err(WalletError::DeductionsExceedPrice {
                deal: payout.deal_id.clone(),
                price: payout.price,
                deductions,
            });
        }
        let to_contractor = payout.price - deductions;

        let mut client = load(txn, &payout.client_id).await?;
        client.release(&payout.deal_id, payout.price)?;
        if payout.adjustment.is_positive() {
            client.credit(payout.adjustment)?;
        }
        save(txn, &mut client, now)?;

        let mut contractor = load_or_new(txn, &payout.contractor_id, now).await?;
        contractor.credit(to_contractor)?;
        save(txn, &mut contractor, now)?;

        let payment = Transaction::new(
            &payout.contractor_id,
            to_contractor,
            TransactionKind::Payment {
                deal_id: payout.deal_id.clone(),
                commission,
            },
            now,
        );
        journal::record(txn, &payment)?;

        if commission.is_positive() {
            journal::record(
                txn,
                &Transaction::new(
                    &payout.contractor_id,
                    commission,
                    TransactionKind::Commission {
                        deal_id: payout.deal_id.clone(),
                        stage: CommissionStage::Payout,
                    },
                    now,
                ),
            )?;
        }

        if payout.adjustment.is_positive() {
            journal::record(
                txn,
                &Transaction::new(
                    &payout.client_id,
                    payout.adjustment,
                    TransactionKind::Refund {
                        deal_id: payout.deal_id.clone(),
                        reason: RefundReason::CompletionAdjustment,
                    },
                    now,
                ),
            )?;
        }

        Ok(PayoutReceipt {
            contractor_received: to_contractor,
            commission,
            client_refund: payout.adjustment,
            payment_tx: payment.id,
        })
    }
}

fn require_positive(amount: Amount) -> Result<(), WalletError> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(WalletError::InvalidAmount(amount))
    }
}

async fn load(txn: &mut Txn, user_id: &str) -> Result<Wallet, WalletError> {
    txn.get(Collection::Wallets, user_id)
        .await?
        .ok_or_else(|| WalletError::WalletNotFound(user_id.to_owned()))
}

async fn load_or_new(
    txn: &mut Txn,
    user_id: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Wallet, WalletError> {
    Ok(txn
        .get(Collection::Wallets, user_id)
        .await?
        .unwrap_or_else(|| Wallet::new(user_id, now)))
}

fn save(
    txn: &mut Txn,
    wallet: &mut Wallet,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(), WalletError> {
    debug_assert!(wallet.is_consistent(), "inconsistent wallet {wallet:?}");
    wallet.updated_at = now;
    txn.put(Collection::Wallets, &wallet.user_id, wallet)?;
    Ok(())
}

/// Small helper to log operation results
fn log_result<T, E: std::fmt::Display>(
    op: &str,
    user: &str,
    deal: Option<&str>,
    amount: Amount,
    result: &Result<T, E>,
) {
    match (result, deal) {
        (Ok(_), Some(deal)) => info!(user, deal, amount = %amount, "{op} applied"),
        (Ok(_), None) => info!(user, amount = %amount, "{op} applied"),
        (Err(e), Some(deal)) => {
            info!(user, deal, amount = %amount, reason = %e, "{op} skipped")
        }
        (Err(e), None) => info!(user, amount = %amount, reason = %e, "{op} skipped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::{Classify, ErrorClass};
    use crate::store::MemoryStore;

    // test utils

    fn units(n: i64) -> Amount {
        Amount::from_units(n)
    }

    fn engine() -> (WalletEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = WalletEngine::new(store.clone(), Arc::new(SystemClock), Policy::default());
        (engine, store)
    }

    async fn funded(balance: i64) -> (WalletEngine, Arc<MemoryStore>) {
        let (engine, store) = engine();
        engine.add_balance("client", units(balance)).await.unwrap();
        (engine, store)
    }

    async fn wallet(engine: &WalletEngine, user: &str) -> Wallet {
        engine.wallet(user).await.unwrap().unwrap()
    }

    // Deposit / withdrawal

    #[tokio::test]
    async fn add_balance_creates_wallet() {
        let (engine, _) = engine();
        let balance = engine.add_balance("u1", units(100)).await.unwrap();
        assert_eq!(balance, units(100));

        let history = engine.history("u1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, TransactionKind::Deposit);
    }

    #[tokio::test]
    async fn ensure_wallet_is_idempotent() {
        let (engine, store) = funded(250).await;
        let existing = engine.ensure_wallet("client").await.unwrap();
        assert_eq!(existing.balance, units(250));

        let fresh = engine.ensure_wallet("newcomer").await.unwrap();
        assert_eq!(fresh.balance, Amount::ZERO);
        engine.ensure_wallet("newcomer").await.unwrap();
        assert_eq!(store.count(Collection::Wallets), 2);
        assert!(engine.history("newcomer").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_balance_rejects_non_positive() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.add_balance("u1", units(0)).await,
            Err(WalletError::InvalidAmount(_))
        ));
        assert!(engine.wallet("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn withdraw_insufficient_balance_fails() {
        let (engine, _) = funded(100).await;
        let err = engine.withdraw("client", units(101)).await.unwrap_err();
        assert!(matches!(err, WalletError::InsufficientBalance { .. }));
        assert_eq!(err.class(), ErrorClass::Business);
        assert_eq!(wallet(&engine, "client").await.balance, units(100));

        assert_eq!(engine.withdraw("client", units(100)).await.unwrap(), units(0));
    }

    #[tokio::test]
    async fn withdraw_without_wallet_fails() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.withdraw("ghost", units(1)).await,
            Err(WalletError::WalletNotFound(_))
        ));
    }

    // Freeze

    #[tokio::test]
    async fn freeze_charges_fee_and_reserves_price() {
        let (engine, _) = funded(1000).await;
        let receipt = engine.freeze_for_deal("client", "d1", units(500)).await.unwrap();

        assert_eq!(receipt.new_balance, units(485));
        assert_eq!(receipt.frozen_total, units(500));
        assert_eq!(receipt.fee, units(15));

        let w = wallet(&engine, "client").await;
        assert_eq!(w.balance, units(485));
        assert_eq!(w.frozen_for("d1"), Some(units(500)));

        let entries = journal::for_deal(engine.store.as_ref(), "d1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(receipt.commission_tx.as_deref(), Some(entries[0].id.as_str()));
        assert_eq!(entries[0].amount, units(15));
    }

    #[tokio::test]
    async fn waived_fee_records_no_commission() {
        let store = Arc::new(MemoryStore::new());
        let policy = Policy {
            platform_fee: Amount::ZERO,
            ..Policy::default()
        };
        let engine = WalletEngine::new(store, Arc::new(SystemClock), policy);
        engine.add_balance("client", units(500)).await.unwrap();

        let receipt = engine.freeze_for_deal("client", "d1", units(500)).await.unwrap();
        assert_eq!(receipt.new_balance, Amount::ZERO);
        assert_eq!(receipt.commission_tx, None);
        assert!(journal::for_deal(engine.store.as_ref(), "d1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn freeze_reports_available_and_needed() {
        let (engine, _) = funded(500).await;
        let err = engine
            .freeze_for_deal("client", "d1", units(500))
            .await
            .unwrap_err();
        match err {
            WalletError::InsufficientBalance {
                available, needed, ..
            } => {
                assert_eq!(available, units(500));
                assert_eq!(needed, units(515));
            }
            other => panic!("unexpected error {other}"),
        }
        let w = wallet(&engine, "client").await;
        assert_eq!(w.balance, units(500));
        assert!(w.frozen.by_deal.is_empty());
        assert!(journal::for_deal(engine.store.as_ref(), "d1").await.unwrap().is_empty());
    }

    // Cancel early

    #[tokio::test]
    async fn cancel_early_refunds_price_but_keeps_fee() {
        let (engine, _) = funded(1000).await;
        engine.freeze_for_deal("client", "d1", units(500)).await.unwrap();
        let receipt = engine.cancel_early("client", "d1", units(500)).await.unwrap();

        assert_eq!(receipt.refunded, units(500));
        assert_eq!(receipt.new_balance, units(985));
        let w = wallet(&engine, "client").await;
        assert_eq!(w.frozen.total, units(0));
        assert!(w.frozen.by_deal.is_empty());
    }

    #[tokio::test]
    async fn cancel_early_twice_does_not_double_refund() {
        let (engine, _) = funded(1000).await;
        engine.freeze_for_deal("client", "d1", units(500)).await.unwrap();
        engine.cancel_early("client", "d1", units(500)).await.unwrap();
        assert!(matches!(
            engine.cancel_early("client", "d1", units(500)).await,
            Err(WalletError::DealNotFrozen { .. })
        ));
        assert_eq!(wallet(&engine, "client").await.balance, units(985));
    }

    // Cancel with penalty

    #[tokio::test]
    async fn cancel_with_penalty_splits_frozen_price() {
        let (engine, _) = funded(1000).await;
        engine.freeze_for_deal("client", "d1", units(500)).await.unwrap();
        let receipt = engine
            .cancel_with_penalty("client", "contractor", "d1", units(500))
            .await
            .unwrap();

        assert_eq!(receipt.client_refund, units(310));
        assert_eq!(receipt.contractor_compensation, units(190));
        assert_eq!(wallet(&engine, "client").await.balance, units(485 + 310));
        // contractor wallet is created on first payout
        assert_eq!(wallet(&engine, "contractor").await.balance, units(190));

        let kinds: Vec<_> = journal::for_deal(engine.store.as_ref(), "d1")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.kind.label())
            .collect();
        assert!(kinds.contains(&"penalty"));
        assert!(kinds.contains(&"penalty_compensation"));
    }

    #[tokio::test]
    async fn cancel_with_penalty_rejects_price_below_penalty() {
        let (engine, _) = funded(1000).await;
        engine.freeze_for_deal("client", "d1", units(100)).await.unwrap();
        let err = engine
            .cancel_with_penalty("client", "contractor", "d1", units(100))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::PenaltyExceedsPrice { .. }));
        assert_eq!(wallet(&engine, "client").await.frozen_for("d1"), Some(units(100)));
        assert!(engine.wallet("contractor").await.unwrap().is_none());
    }

    // Complete

    #[tokio::test]
    async fn first_three_deals_pay_no_commission() {
        let (engine, _) = funded(1000).await;
        engine.freeze_for_deal("client", "d1", units(500)).await.unwrap();
        let receipt = engine
            .complete_and_pay(&Payout {
                deal_id: "d1".into(),
                client_id: "client".into(),
                contractor_id: "contractor".into(),
                price: units(500),
                completed_before: 2,
                adjustment: Amount::ZERO,
            })
            .await
            .unwrap();
        assert_eq!(receipt.contractor_received, units(500));
        assert_eq!(receipt.commission, units(0));
        assert_eq!(wallet(&engine, "contractor").await.balance, units(500));
        let client = wallet(&engine, "client").await;
        assert_eq!(client.frozen.total, units(0));
        assert_eq!(client.balance, units(485));
    }

    #[tokio::test]
    async fn fourth_deal_pays_commission() {
        let (engine, _) = funded(1000).await;
        engine.freeze_for_deal("client", "d4", units(500)).await.unwrap();
        let receipt = engine
            .complete_and_pay(&Payout {
                deal_id: "d4".into(),
                client_id: "client".into(),
                contractor_id: "contractor".into(),
                price: units(500),
                completed_before: 3,
                adjustment: Amount::ZERO,
            })
            .await
            .unwrap();
        assert_eq!(receipt.contractor_received, units(485));
        assert_eq!(receipt.commission, units(15));

        let history = engine.history("contractor").await.unwrap();
        let commission = history
            .iter()
            .find(|t| t.kind.label() == "commission")
            .unwrap();
        assert_eq!(commission.amount, units(15));
    }

    #[tokio::test]
    async fn completion_adjustment_returns_to_client() {
        let (engine, _) = funded(1000).await;
        engine.freeze_for_deal("client", "d1", units(500)).await.unwrap();
        let receipt = engine
            .complete_and_pay(&Payout {
                deal_id: "d1".into(),
                client_id: "client".into(),
                contractor_id: "contractor".into(),
                price: units(500),
                completed_before: 0,
                adjustment: units(100),
            })
            .await
            .unwrap();
        assert_eq!(receipt.contractor_received, units(400));
        assert_eq!(wallet(&engine, "client").await.balance, units(585));
    }

    #[tokio::test]
    async fn complete_without_frozen_funds_pays_nothing() {
        let (engine, _) = funded(1000).await;
        let err = engine
            .complete_and_pay(&Payout {
                deal_id: "d1".into(),
                client_id: "client".into(),
                contractor_id: "contractor".into(),
                price: units(500),
                completed_before: 0,
                adjustment: Amount::ZERO,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::DealNotFrozen { .. }));
        assert!(engine.wallet("contractor").await.unwrap().is_none());
    }

    // Infrastructure

    #[tokio::test]
    async fn store_failure_leaves_wallet_untouched() {
        let (engine, store) = funded(1000).await;
        store.fail_next_commits(1);
        let err = engine
            .freeze_for_deal("client", "d1", units(500))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Infrastructure);
        let w = wallet(&engine, "client").await;
        assert_eq!(w.balance, units(1000));
        assert!(w.frozen.by_deal.is_empty());
    }

    #[tokio::test]
    async fn balance_info_for_unknown_user_is_zero() {
        let (engine, _) = engine();
        let info = engine.balance_info("nobody").await.unwrap();
        assert_eq!(info.total, Amount::ZERO);
    }

    // Concurrency

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_freezes_never_overdraw() {
        let (engine, _) = funded(1000).await;
        let engine = Arc::new(engine.with_attempts(64));

        // each freeze needs 315; only three fit into 1000
        let mut handles = Vec::new();
        for i in 0..6 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .freeze_for_deal("client", &format!("d{i}"), units(300))
                    .await
            }));
        }
        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 3);

        let w = wallet(&engine, "client").await;
        assert_eq!(w.balance, units(1000 - 3 * 315));
        assert_eq!(w.frozen.total, units(900));
        assert!(w.is_consistent());
    }
}
