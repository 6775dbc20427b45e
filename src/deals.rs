//! Deal lifecycle.
//!
//! A deal is born in `executor_selected` when the client chooses an offer
//! (see [`crate::offers::OfferService::choose`]) and only moves forward from
//! there, except that it may be cancelled from any non-terminal state.
//! Transitions that move money stage the wallet change in the same [`Txn`]
//! as the deal update, so a failed wallet operation leaves the status where
//! it was.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use crate::Amount;
use crate::clock::Clock;
use crate::error::{Classify, ErrorClass};
use crate::model::{
    Cancellation, Deal, DealId, DealStatus, Offer, Order, OrderStatus, Party, PayoutSummary,
    PenaltyInfo, TxId, UserId,
};
use crate::store::{
    Collection, DEFAULT_ATTEMPTS, DocumentStore, StoreError, Txn, fetch, fetch_where, run_txn,
};
use crate::wallet::{Payout, WalletEngine, WalletError};

#[derive(Debug, Error)]
pub enum DealError {
    #[error("deal {0} not found")]
    DealNotFound(DealId),

    #[error("user {user} is not a participant of deal {deal}")]
    NotParticipant { deal: DealId, user: UserId },

    #[error("only the {expected:?} may do this on deal {deal}")]
    WrongParty { deal: DealId, expected: Party },

    #[error("deal {deal} cannot move from {from} to {to}")]
    InvalidTransition {
        deal: DealId,
        from: DealStatus,
        to: DealStatus,
    },

    #[error("the {party:?} already confirmed deal {deal}")]
    AlreadyConfirmed { deal: DealId, party: Party },

    #[error("invalid completion adjustment {0}")]
    InvalidAdjustment(Amount),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for DealError {
    fn class(&self) -> ErrorClass {
        match self {
            DealError::Wallet(err) => err.class(),
            DealError::Store(err) => err.class(),
            _ => ErrorClass::Business,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            DealError::DealNotFound(_) => "deal_not_found",
            DealError::NotParticipant { .. } => "not_a_participant",
            DealError::WrongParty { .. } => "wrong_party",
            DealError::InvalidTransition { .. } => "invalid_transition",
            DealError::AlreadyConfirmed { .. } => "already_confirmed",
            DealError::InvalidAdjustment(_) => "invalid_adjustment",
            DealError::Wallet(err) => err.code(),
            DealError::Store(err) => err.code(),
        }
    }

    fn user_message(&self) -> &'static str {
        match self {
            DealError::DealNotFound(_) => "This deal no longer exists.",
            DealError::NotParticipant { .. } => "You are not a participant of this deal.",
            DealError::WrongParty { .. } => "The other participant has to do this.",
            DealError::InvalidTransition { .. } => "This action is not available at this stage.",
            DealError::AlreadyConfirmed { .. } => "You have already paid for this deal.",
            DealError::InvalidAdjustment(_) => {
                "The adjustment must be positive and not exceed the price."
            }
            DealError::Wallet(err) => err.user_message(),
            DealError::Store(err) => err.user_message(),
        }
    }
}

/// Deal for a freshly chosen offer, backed by funds frozen under `frozen_tx`.
pub(crate) fn new_deal(
    id: DealId,
    offer: &Offer,
    order: &Order,
    price: Amount,
    frozen_tx: Option<TxId>,
    now: DateTime<Utc>,
) -> Deal {
    Deal {
        id,
        order_id: order.id.clone(),
        offer_id: offer.id.clone(),
        client_id: order.client_id.clone(),
        contractor_id: offer.contractor_id.clone(),
        price,
        status: DealStatus::ExecutorSelected,
        frozen_transaction_id: frozen_tx,
        client_contacts_unlocked: false,
        contractor_contacts_unlocked: false,
        scheduled_at: order.scheduled_at,
        cancellation: None,
        payout: None,
        confirmed_at: None,
        started_at: None,
        completed_at: None,
        created_at: now,
        updated_at: now,
    }
}

pub struct DealService {
    store: Arc<dyn DocumentStore>,
    wallet: Arc<WalletEngine>,
    clock: Arc<dyn Clock>,
    attempts: u32,
}

impl DealService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        wallet: Arc<WalletEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            wallet,
            clock,
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub async fn get(&self, deal_id: &str) -> Result<Deal, DealError> {
        fetch(self.store.as_ref(), Collection::Deals, deal_id)
            .await?
            .ok_or_else(|| DealError::DealNotFound(deal_id.to_owned()))
    }

    /// Deals where the user takes part in `role`, newest first.
    pub async fn for_user(&self, user_id: &str, role: Party) -> Result<Vec<Deal>, DealError> {
        let field = match role {
            Party::Client => "client_id",
            Party::Contractor => "contractor_id",
        };
        let mut deals: Vec<Deal> =
            fetch_where(self.store.as_ref(), Collection::Deals, field, user_id).await?;
        deals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deals)
    }

    /// A confirmation payment has been requested. Already waiting is fine.
    pub async fn begin_confirmation(&self, deal_id: &str, user_id: &str) -> Result<Deal, DealError> {
        run_txn(&self.store, self.attempts, |mut txn| async move {
            let (deal, _) = self.stage_confirmation(&mut txn, deal_id, user_id).await?;
            Ok((deal, txn))
        })
        .await
    }

    /// Stage the start of a confirmation payment by `user_id`.
    ///
    /// The deal document is rewritten even when its status stays, so
    /// concurrent confirmations of one deal serialize on it.
    pub(crate) async fn stage_confirmation(
        &self,
        txn: &mut Txn,
        deal_id: &str,
        user_id: &str,
    ) -> Result<(Deal, Party), DealError> {
        let mut deal = load(txn, deal_id).await?;
        let party = participant(&deal, user_id)?;
        match deal.status {
            DealStatus::Pending | DealStatus::ExecutorSelected => {
                self.advance(&mut deal, DealStatus::WaitingClientConfirmation)?;
            }
            DealStatus::WaitingClientConfirmation
            | DealStatus::Confirmed
            | DealStatus::InProgress => {
                if deal.contacts_unlocked(party) {
                    return Err(DealError::AlreadyConfirmed {
                        deal: deal.id,
                        party,
                    });
                }
                deal.updated_at = self.clock.now();
            }
            from => {
                return Err(DealError::InvalidTransition {
                    deal: deal.id,
                    from,
                    to: DealStatus::WaitingClientConfirmation,
                });
            }
        }
        txn.put(Collection::Deals, &deal.id, &deal)?;
        Ok((deal, party))
    }

    /// The confirmation fee was paid by `party`: the deal is confirmed and
    /// that party's contacts are unlocked. A second payer on an already
    /// confirmed deal only gets their contacts unlocked.
    pub async fn confirm(&self, deal_id: &str, party: Party) -> Result<Deal, DealError> {
        let deal = run_txn(&self.store, self.attempts, |mut txn| async move {
            let mut deal = load(&mut txn, deal_id).await?;
            match deal.status {
                DealStatus::Pending
                | DealStatus::ExecutorSelected
                | DealStatus::WaitingClientConfirmation => {
                    self.advance(&mut deal, DealStatus::Confirmed)?;
                    deal.confirmed_at = Some(deal.updated_at);
                }
                DealStatus::Confirmed | DealStatus::InProgress => {
                    deal.updated_at = self.clock.now();
                }
                from => {
                    return Err(DealError::InvalidTransition {
                        deal: deal.id,
                        from,
                        to: DealStatus::Confirmed,
                    });
                }
            }
            deal.unlock_contacts(party);
            txn.put(Collection::Deals, &deal.id, &deal)?;
            Ok((deal, txn))
        })
        .await?;

        info!(deal = %deal.id, party = ?party, "deal confirmed");
        Ok(deal)
    }

    /// The client confirms that work has started.
    pub async fn client_confirm_start(
        &self,
        deal_id: &str,
        client_id: &str,
    ) -> Result<Deal, DealError> {
        let deal = run_txn(&self.store, self.attempts, |mut txn| async move {
            let mut deal = load(&mut txn, deal_id).await?;
            if participant(&deal, client_id)? != Party::Client {
                return Err(DealError::WrongParty {
                    deal: deal.id,
                    expected: Party::Client,
                });
            }
            if deal.status != DealStatus::Confirmed {
                return Err(DealError::InvalidTransition {
                    deal: deal.id,
                    from: deal.status,
                    to: DealStatus::InProgress,
                });
            }
            self.advance(&mut deal, DealStatus::InProgress)?;
            deal.started_at = Some(deal.updated_at);
            txn.put(Collection::Deals, &deal.id, &deal)?;
            Ok((deal, txn))
        })
        .await?;

        info!(deal = %deal.id, "work started");
        Ok(deal)
    }

    /// Pay the contractor out of the frozen price.
    ///
    /// The commission tier depends on how many deals the contractor has
    /// already completed. `adjustment`, when given, is withheld from the
    /// contractor and returned to the client.
    pub async fn complete(
        &self,
        deal_id: &str,
        adjustment: Option<Amount>,
    ) -> Result<Deal, DealError> {
        let adjustment = adjustment.unwrap_or(Amount::ZERO);
        if adjustment.is_negative() {
            return Err(DealError::InvalidAdjustment(adjustment));
        }

        let deal = run_txn(&self.store, self.attempts, |mut txn| async move {
            let mut deal = load(&mut txn, deal_id).await?;
            if deal.status != DealStatus::InProgress {
                return Err(DealError::InvalidTransition {
                    deal: deal.id,
                    from: deal.status,
                    to: DealStatus::Completed,
                });
            }
            if adjustment > deal.price {
                return Err(DealError::InvalidAdjustment(adjustment));
            }

            let history: Vec<Deal> = txn
                .query(Collection::Deals, "contractor_id", deal.contractor_id.as_str())
                .await?;
            let completed_before = history
                .iter()
                .filter(|d| d.status == DealStatus::Completed)
                .count() as u32;

            let receipt = self
                .wallet
                .stage_complete(
                    &mut txn,
                    &Payout {
                        deal_id: deal.id.clone(),
                        client_id: deal.client_id.clone(),
                        contractor_id: deal.contractor_id.clone(),
                        price: deal.price,
                        completed_before,
                        adjustment,
                    },
                )
                .await?;

            self.advance(&mut deal, DealStatus::Completed)?;
            deal.completed_at = Some(deal.updated_at);
            deal.unlock_contacts(Party::Contractor);
            deal.payout = Some(PayoutSummary {
                contractor_received: receipt.contractor_received,
                commission: receipt.commission,
                client_refund: receipt.client_refund,
            });
            txn.put(Collection::Deals, &deal.id, &deal)?;
            set_order_status(&mut txn, &deal.order_id, OrderStatus::Completed).await?;
            Ok((deal, txn))
        })
        .await?;

        info!(deal = %deal.id, contractor = %deal.contractor_id, "deal completed");
        Ok(deal)
    }

    /// Cancel the deal on behalf of `initiator`.
    ///
    /// With `with_penalty` unset, a client cancelling after the lead-time
    /// boundary before `scheduled_at` pays the penalty. A contractor never
    /// does. Frozen funds go back to the client in every case except the
    /// penalty share.
    pub async fn cancel(
        &self,
        deal_id: &str,
        initiator: &str,
        reason: Option<&str>,
        with_penalty: Option<bool>,
    ) -> Result<Deal, DealError> {
        let deal = run_txn(&self.store, self.attempts, |mut txn| async move {
            let now = self.clock.now();
            let mut deal = load(&mut txn, deal_id).await?;
            let party = participant(&deal, initiator)?;
            if !deal.status.can_transition_to(DealStatus::Canceled) {
                return Err(DealError::InvalidTransition {
                    deal: deal.id,
                    from: deal.status,
                    to: DealStatus::Canceled,
                });
            }

            let late = party == Party::Client
                && with_penalty.unwrap_or_else(|| self.within_lead_time(&deal, now));

            let mut penalty = PenaltyInfo::default();
            if deal.status != DealStatus::Pending {
                if late {
                    let receipt = self
                        .wallet
                        .stage_cancel_with_penalty(
                            &mut txn,
                            &deal.client_id,
                            &deal.contractor_id,
                            &deal.id,
                            deal.price,
                        )
                        .await?;
                    penalty = PenaltyInfo {
                        applied: true,
                        amount: receipt.contractor_compensation,
                    };
                } else {
                    self.wallet
                        .stage_cancel_early(&mut txn, &deal.client_id, &deal.id, deal.price)
                        .await?;
                }
            }

            self.advance(&mut deal, DealStatus::Canceled)?;
            deal.cancellation = Some(Cancellation {
                reason: reason.map(str::to_owned),
                cancelled_by: party,
                penalty,
                cancelled_at: now,
            });
            txn.put(Collection::Deals, &deal.id, &deal)?;
            set_order_status(&mut txn, &deal.order_id, OrderStatus::Canceled).await?;
            Ok((deal, txn))
        })
        .await?;

        info!(
            deal = %deal.id,
            initiator,
            penalty = deal.cancellation.as_ref().is_some_and(|c| c.penalty.applied),
            "deal cancelled"
        );
        Ok(deal)
    }

    fn within_lead_time(&self, deal: &Deal, now: DateTime<Utc>) -> bool {
        let lead_time = self.wallet.policy().lead_time();
        deal.scheduled_at.is_some_and(|at| now > at - lead_time)
    }

    fn advance(&self, deal: &mut Deal, to: DealStatus) -> Result<(), DealError> {
        if !deal.status.can_transition_to(to) {
            return Err(DealError::InvalidTransition {
                deal: deal.id.clone(),
                from: deal.status,
                to,
            });
        }
        deal.status = to;
        deal.updated_at = self.clock.now();
        Ok(())
    }
}

async fn load(txn: &mut Txn, deal_id: &str) -> Result<Deal, DealError> {
    txn.get(Collection::Deals, deal_id)
        .await?
        .ok_or_else(|| DealError::DealNotFound(deal_id.to_owned()))
}

fn participant(deal: &Deal, user_id: &str) -> Result<Party, DealError> {
    deal.party_of(user_id).ok_or_else(|| DealError::NotParticipant {
        deal: deal.id.clone(),
        user: user_id.to_owned(),
    })
}

/// Orders are owned elsewhere; a missing one is left alone.
async fn set_order_status(
    txn: &mut Txn,
    order_id: &str,
    status: OrderStatus,
) -> Result<(), StoreError> {
    let order: Option<Order> = txn.get(Collection::Orders, order_id).await?;
    if let Some(mut order) = order {
        order.status = status;
        txn.put(Collection::Orders, order_id, &order)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Policy;
    use crate::journal;
    use crate::model::new_id;
    use crate::store::MemoryStore;
    use chrono::TimeDelta;

    fn units(n: i64) -> Amount {
        Amount::from_units(n)
    }

    struct Fixture {
        deals: DealService,
        wallet: Arc<WalletEngine>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let wallet = Arc::new(WalletEngine::new(
            store.clone(),
            clock.clone(),
            Policy::default(),
        ));
        let deals = DealService::new(store.clone(), wallet.clone(), clock.clone());
        Fixture {
            deals,
            wallet,
            store,
            clock,
        }
    }

    /// A deal in `status` with 500 frozen out of a 1000 top-up.
    async fn seed_deal(
        f: &Fixture,
        status: DealStatus,
        scheduled_in: Option<TimeDelta>,
    ) -> Deal {
        let now = f.clock.now();
        f.wallet.add_balance("client", units(1000)).await.unwrap();

        let mut order = Order::new(&new_id(), "client");
        order.scheduled_at = scheduled_in.map(|d| now + d);
        let offer_id = new_id();
        let deal_id = new_id();
        let receipt = f
            .wallet
            .freeze_for_deal("client", &deal_id, units(500))
            .await
            .unwrap();

        let offer = Offer {
            id: offer_id,
            order_id: order.id.clone(),
            contractor_id: "contractor".into(),
            status: crate::model::OfferStatus::Chosen,
            proposed_price: Some(units(500)),
            created_at: now,
            expires_at: now,
            accepted_at: None,
            declined_at: None,
            chosen_at: None,
            deal_id: None,
            order_snapshot: Default::default(),
            contractor_push_token: None,
            meta: crate::model::MatchMeta {
                matched_by: "top_n".into(),
                matched_at: now,
                algorithm_version: 1,
            },
        };
        let mut deal = new_deal(deal_id, &offer, &order, units(500), receipt.commission_tx, now);
        deal.status = status;

        let mut txn = Txn::new(f.store.clone());
        txn.create(Collection::Orders, &order.id, &order).unwrap();
        txn.create(Collection::Deals, &deal.id, &deal).unwrap();
        txn.commit().await.unwrap();
        deal
    }

    async fn balance(f: &Fixture, user: &str) -> Amount {
        f.wallet.balance_info(user).await.unwrap().balance
    }

    #[tokio::test]
    async fn happy_path_to_completion() {
        let f = fixture();
        let deal = seed_deal(&f, DealStatus::ExecutorSelected, None).await;

        let d = f.deals.begin_confirmation(&deal.id, "client").await.unwrap();
        assert_eq!(d.status, DealStatus::WaitingClientConfirmation);

        let d = f.deals.confirm(&deal.id, Party::Client).await.unwrap();
        assert_eq!(d.status, DealStatus::Confirmed);
        assert!(d.client_contacts_unlocked);
        assert!(!d.contractor_contacts_unlocked);

        let d = f.deals.client_confirm_start(&deal.id, "client").await.unwrap();
        assert_eq!(d.status, DealStatus::InProgress);
        assert!(d.started_at.is_some());

        let d = f.deals.complete(&deal.id, None).await.unwrap();
        assert_eq!(d.status, DealStatus::Completed);
        assert!(d.contractor_contacts_unlocked);
        assert_eq!(
            d.payout,
            Some(PayoutSummary {
                contractor_received: units(500),
                commission: units(0),
                client_refund: units(0),
            })
        );
        assert_eq!(balance(&f, "contractor").await, units(500));

        let order: Order = fetch(f.store.as_ref(), Collection::Orders, &d.order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn fourth_completed_deal_pays_commission() {
        let f = fixture();
        for _ in 0..3 {
            let mut done = seed_deal(&f, DealStatus::InProgress, None).await;
            done = f.deals.complete(&done.id, None).await.unwrap();
            assert_eq!(done.payout.unwrap().commission, units(0));
        }
        let fourth = seed_deal(&f, DealStatus::InProgress, None).await;
        let done = f.deals.complete(&fourth.id, None).await.unwrap();
        let payout = done.payout.unwrap();
        assert_eq!(payout.contractor_received, units(485));
        assert_eq!(payout.commission, units(15));
        assert_eq!(balance(&f, "contractor").await, units(3 * 500 + 485));
    }

    #[tokio::test]
    async fn complete_requires_work_in_progress() {
        let f = fixture();
        let deal = seed_deal(&f, DealStatus::Confirmed, None).await;
        let err = f.deals.complete(&deal.id, None).await.unwrap_err();
        assert!(matches!(err, DealError::InvalidTransition { .. }));
        assert!(err.is_business());
        assert!(f.wallet.wallet("contractor").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_payout_leaves_status_unchanged() {
        let f = fixture();
        let deal = seed_deal(&f, DealStatus::InProgress, None).await;
        // funds already released elsewhere
        f.wallet
            .cancel_early("client", &deal.id, units(500))
            .await
            .unwrap();

        let err = f.deals.complete(&deal.id, None).await.unwrap_err();
        assert!(matches!(
            err,
            DealError::Wallet(WalletError::DealNotFrozen { .. })
        ));
        assert_eq!(f.deals.get(&deal.id).await.unwrap().status, DealStatus::InProgress);
    }

    #[tokio::test]
    async fn store_failure_during_complete_keeps_everything() {
        let f = fixture();
        let deal = seed_deal(&f, DealStatus::InProgress, None).await;
        f.store.fail_next_commits(1);

        let err = f.deals.complete(&deal.id, None).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Infrastructure);
        assert_eq!(f.deals.get(&deal.id).await.unwrap().status, DealStatus::InProgress);
        let client = f.wallet.balance_info("client").await.unwrap();
        assert_eq!(client.frozen.total, units(500));
    }

    #[tokio::test]
    async fn completion_adjustment_is_refunded() {
        let f = fixture();
        let deal = seed_deal(&f, DealStatus::InProgress, None).await;
        let done = f.deals.complete(&deal.id, Some(units(50))).await.unwrap();
        assert_eq!(done.payout.unwrap().contractor_received, units(450));
        assert_eq!(balance(&f, "client").await, units(485 + 50));

        let other = seed_deal(&f, DealStatus::InProgress, None).await;
        assert!(matches!(
            f.deals.complete(&other.id, Some(units(501))).await,
            Err(DealError::InvalidAdjustment(_))
        ));
    }

    #[tokio::test]
    async fn early_cancel_refunds_price() {
        let f = fixture();
        let deal = seed_deal(&f, DealStatus::ExecutorSelected, Some(TimeDelta::hours(5))).await;

        let d = f
            .deals
            .cancel(&deal.id, "client", Some("changed plans"), None)
            .await
            .unwrap();
        assert_eq!(d.status, DealStatus::Canceled);
        let cancellation = d.cancellation.unwrap();
        assert_eq!(cancellation.cancelled_by, Party::Client);
        assert!(!cancellation.penalty.applied);
        assert_eq!(cancellation.reason.as_deref(), Some("changed plans"));
        assert_eq!(balance(&f, "client").await, units(985));
    }

    #[tokio::test]
    async fn late_client_cancel_pays_penalty() {
        let f = fixture();
        let deal = seed_deal(&f, DealStatus::Confirmed, Some(TimeDelta::minutes(30))).await;

        let d = f.deals.cancel(&deal.id, "client", None, None).await.unwrap();
        let cancellation = d.cancellation.unwrap();
        assert!(cancellation.penalty.applied);
        assert_eq!(cancellation.penalty.amount, units(190));
        assert_eq!(balance(&f, "client").await, units(485 + 310));
        assert_eq!(balance(&f, "contractor").await, units(190));

        let labels: Vec<_> = journal::for_deal(f.store.as_ref(), &deal.id)
            .await
            .unwrap()
            .iter()
            .map(|t| t.kind.label())
            .collect();
        assert!(labels.contains(&"penalty"));
        assert!(labels.contains(&"penalty_compensation"));
    }

    #[tokio::test]
    async fn lead_time_boundary_is_exclusive() {
        let f = fixture();
        let deal = seed_deal(&f, DealStatus::Confirmed, Some(TimeDelta::minutes(45))).await;
        let d = f.deals.cancel(&deal.id, "client", None, None).await.unwrap();
        assert!(!d.cancellation.unwrap().penalty.applied);
    }

    #[tokio::test]
    async fn contractor_cancel_never_pays_penalty() {
        let f = fixture();
        let deal = seed_deal(&f, DealStatus::Confirmed, Some(TimeDelta::minutes(5))).await;
        let d = f
            .deals
            .cancel(&deal.id, "contractor", None, Some(true))
            .await
            .unwrap();
        let cancellation = d.cancellation.unwrap();
        assert_eq!(cancellation.cancelled_by, Party::Contractor);
        assert!(!cancellation.penalty.applied);
        assert_eq!(balance(&f, "client").await, units(985));
    }

    #[tokio::test]
    async fn explicit_penalty_overrides_lead_time() {
        let f = fixture();
        let deal = seed_deal(&f, DealStatus::ExecutorSelected, None).await;
        let d = f
            .deals
            .cancel(&deal.id, "client", None, Some(true))
            .await
            .unwrap();
        assert!(d.cancellation.unwrap().penalty.applied);
    }

    #[tokio::test]
    async fn confirmation_is_once_per_party() {
        let f = fixture();
        let deal = seed_deal(&f, DealStatus::ExecutorSelected, None).await;
        f.deals.begin_confirmation(&deal.id, "client").await.unwrap();
        // still waiting: the payer may come back
        f.deals.begin_confirmation(&deal.id, "client").await.unwrap();
        f.deals.confirm(&deal.id, Party::Client).await.unwrap();

        assert!(matches!(
            f.deals.begin_confirmation(&deal.id, "client").await,
            Err(DealError::AlreadyConfirmed {
                party: Party::Client,
                ..
            })
        ));
        let d = f.deals.begin_confirmation(&deal.id, "contractor").await.unwrap();
        assert_eq!(d.status, DealStatus::Confirmed);
    }

    #[tokio::test]
    async fn terminal_deals_stay_terminal() {
        let f = fixture();
        let deal = seed_deal(&f, DealStatus::ExecutorSelected, None).await;
        f.deals.cancel(&deal.id, "client", None, None).await.unwrap();

        for result in [
            f.deals.cancel(&deal.id, "client", None, None).await,
            f.deals.confirm(&deal.id, Party::Client).await,
            f.deals.begin_confirmation(&deal.id, "client").await,
        ] {
            assert!(matches!(result, Err(DealError::InvalidTransition { .. })));
        }
        // refunded once
        assert_eq!(balance(&f, "client").await, units(985));
    }

    #[tokio::test]
    async fn outsiders_are_rejected() {
        let f = fixture();
        let deal = seed_deal(&f, DealStatus::Confirmed, None).await;
        assert!(matches!(
            f.deals.cancel(&deal.id, "stranger", None, None).await,
            Err(DealError::NotParticipant { .. })
        ));
        assert!(matches!(
            f.deals.client_confirm_start(&deal.id, "contractor").await,
            Err(DealError::WrongParty { .. })
        ));
    }

    #[tokio::test]
    async fn second_payer_only_unlocks_contacts() {
        let f = fixture();
        let deal = seed_deal(&f, DealStatus::WaitingClientConfirmation, None).await;
        f.deals.confirm(&deal.id, Party::Client).await.unwrap();
        let d = f.deals.confirm(&deal.id, Party::Contractor).await.unwrap();
        assert_eq!(d.status, DealStatus::Confirmed);
        assert!(d.client_contacts_unlocked && d.contractor_contacts_unlocked);
    }

    #[tokio::test]
    async fn for_user_lists_by_role() {
        let f = fixture();
        let first = seed_deal(&f, DealStatus::ExecutorSelected, None).await;
        f.clock.advance(TimeDelta::seconds(1));
        let second = seed_deal(&f, DealStatus::ExecutorSelected, None).await;

        let ids: Vec<_> = f
            .deals
            .for_user("client", Party::Client)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, [second.id.clone(), first.id.clone()]);
        assert_eq!(f.deals.for_user("contractor", Party::Contractor).await.unwrap().len(), 2);
        assert!(f.deals.for_user("client", Party::Contractor).await.unwrap().is_empty());
    }
}
