//! Offer lifecycle: contractors accept or decline, the client chooses one.
//!
//! Expiry is never written back. An open offer past `expires_at` simply reads
//! as expired and every transition out of it is refused.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::Amount;
use crate::clock::Clock;
use crate::deals::new_deal;
use crate::error::{Classify, ErrorClass};
use crate::model::{Deal, Offer, OfferId, OfferStatus, Order, OrderId, OrderStatus, UserId, new_id};
use crate::notify::{self, PushMessage, PushNotifier};
use crate::store::{
    Collection, DEFAULT_ATTEMPTS, DocumentStore, StoreError, Txn, fetch, fetch_where, run_txn,
};
use crate::wallet::{WalletEngine, WalletError};

#[derive(Debug, Error)]
pub enum OfferError {
    #[error("offer {0} not found")]
    OfferNotFound(OfferId),

    #[error("offer {offer} belongs to another contractor, not {user}")]
    NotYourOffer { offer: OfferId, user: UserId },

    #[error("offer {offer} is {status:?}, expected pending")]
    OfferNotPending { offer: OfferId, status: OfferStatus },

    #[error("offer {offer} is {status:?}, expected accepted")]
    OfferNotAccepted { offer: OfferId, status: OfferStatus },

    #[error("offer {0} has expired")]
    OfferExpired(OfferId),

    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    #[error("order {order} belongs to another client, not {user}")]
    NotYourOrder { order: OrderId, user: UserId },

    #[error("order {0} already has a selected offer")]
    OrderAlreadyMatched(OrderId),

    #[error("invalid price {0}")]
    InvalidPrice(Amount),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for OfferError {
    fn class(&self) -> ErrorClass {
        match self {
            OfferError::OrderAlreadyMatched(_) => ErrorClass::Conflict,
            OfferError::Wallet(err) => err.class(),
            OfferError::Store(err) => err.class(),
            _ => ErrorClass::Business,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            OfferError::OfferNotFound(_) => "offer_not_found",
            OfferError::NotYourOffer { .. } => "not_your_offer",
            OfferError::OfferNotPending { .. } => "offer_not_pending",
            OfferError::OfferNotAccepted { .. } => "offer_not_accepted",
            OfferError::OfferExpired(_) => "offer_expired",
            OfferError::OrderNotFound(_) => "order_not_found",
            OfferError::NotYourOrder { .. } => "not_your_order",
            OfferError::OrderAlreadyMatched(_) => "order_already_matched",
            OfferError::InvalidPrice(_) => "invalid_price",
            OfferError::Wallet(err) => err.code(),
            OfferError::Store(err) => err.code(),
        }
    }

    fn user_message(&self) -> &'static str {
        match self {
            OfferError::OfferNotFound(_) => "This offer no longer exists.",
            OfferError::NotYourOffer { .. } => "This offer was sent to another contractor.",
            OfferError::OfferNotPending { .. } => "This offer has already been answered.",
            OfferError::OfferNotAccepted { .. } => {
                "The contractor has not accepted this offer yet."
            }
            OfferError::OfferExpired(_) => "This offer has expired.",
            OfferError::OrderNotFound(_) => "This order no longer exists.",
            OfferError::NotYourOrder { .. } => "Only the order's author can choose a contractor.",
            OfferError::OrderAlreadyMatched(_) => {
                "A contractor has already been chosen for this order."
            }
            OfferError::InvalidPrice(_) => "Enter a price greater than zero.",
            OfferError::Wallet(err) => err.user_message(),
            OfferError::Store(err) => err.user_message(),
        }
    }
}

pub struct OfferService {
    store: Arc<dyn DocumentStore>,
    wallet: Arc<WalletEngine>,
    notifier: Arc<dyn PushNotifier>,
    clock: Arc<dyn Clock>,
    attempts: u32,
}

impl OfferService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        wallet: Arc<WalletEngine>,
        notifier: Arc<dyn PushNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            wallet,
            notifier,
            clock,
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// The offer with its expiry applied to `status`.
    pub async fn get(&self, offer_id: &str) -> Result<Offer, OfferError> {
        let offer: Offer = fetch(self.store.as_ref(), Collection::Offers, offer_id)
            .await?
            .ok_or_else(|| OfferError::OfferNotFound(offer_id.to_owned()))?;
        Ok(self.with_effective_status(offer))
    }

    /// Offers sent for an order, newest first.
    pub async fn for_order(&self, order_id: &str) -> Result<Vec<Offer>, OfferError> {
        self.list("order_id", order_id).await
    }

    /// Offers received by a contractor, newest first.
    pub async fn for_contractor(&self, contractor_id: &str) -> Result<Vec<Offer>, OfferError> {
        self.list("contractor_id", contractor_id).await
    }

    /// The contractor answers with a price. Counts as a response on the order.
    pub async fn accept(
        &self,
        offer_id: &str,
        contractor_id: &str,
        price: Amount,
    ) -> Result<Offer, OfferError> {
        let offer = run_txn(&self.store, self.attempts, |mut txn| async move {
            let now = self.clock.now();
            let mut offer = load_offer(&mut txn, offer_id).await?;
            if offer.contractor_id != contractor_id {
                return Err(OfferError::NotYourOffer {
                    offer: offer.id,
                    user: contractor_id.to_owned(),
                });
            }
            if offer.status != OfferStatus::Pending {
                return Err(OfferError::OfferNotPending {
                    offer: offer.id,
                    status: offer.status,
                });
            }
            if offer.is_expired(now) {
                return Err(OfferError::OfferExpired(offer.id));
            }
            if !price.is_positive() {
                return Err(OfferError::InvalidPrice(price));
            }

            let mut order = load_order(&mut txn, &offer.order_id).await?;
            order.responses_count += 1;

            offer.status = OfferStatus::Accepted;
            offer.proposed_price = Some(price);
            offer.accepted_at = Some(now);

            txn.put(Collection::Offers, &offer.id, &offer)?;
            txn.put(Collection::Orders, &order.id, &order)?;
            Ok((offer, txn))
        })
        .await?;

        info!(offer = %offer.id, contractor = contractor_id, price = %price, "offer accepted");
        Ok(offer)
    }

    pub async fn decline(&self, offer_id: &str, contractor_id: &str) -> Result<Offer, OfferError> {
        let offer = run_txn(&self.store, self.attempts, |mut txn| async move {
            let now = self.clock.now();
            let mut offer = load_offer(&mut txn, offer_id).await?;
            if offer.contractor_id != contractor_id {
                return Err(OfferError::NotYourOffer {
                    offer: offer.id,
                    user: contractor_id.to_owned(),
                });
            }
            match offer.effective_status(now) {
                OfferStatus::Pending => {}
                OfferStatus::Expired => return Err(OfferError::OfferExpired(offer.id)),
                status => {
                    return Err(OfferError::OfferNotPending {
                        offer: offer.id,
                        status,
                    });
                }
            }

            offer.status = OfferStatus::Declined;
            offer.declined_at = Some(now);
            txn.put(Collection::Offers, &offer.id, &offer)?;
            Ok((offer, txn))
        })
        .await?;

        info!(offer = %offer.id, contractor = contractor_id, "offer declined");
        Ok(offer)
    }

    /// The client picks an accepted offer.
    ///
    /// One unit of work: the client's funds are frozen, the deal is created,
    /// the offer is marked chosen and the order records the selection. The
    /// order's `selected_offer_id` is the exclusivity guard, so of two
    /// concurrent calls for one order exactly one wins and the other fails
    /// with [`OfferError::OrderAlreadyMatched`].
    pub async fn choose(&self, offer_id: &str, client_id: &str) -> Result<Deal, OfferError> {
        let (deal, push_token) = run_txn(&self.store, self.attempts, |mut txn| async move {
            let now = self.clock.now();
            let mut offer = load_offer(&mut txn, offer_id).await?;
            match offer.effective_status(now) {
                OfferStatus::Accepted => {}
                OfferStatus::Expired => return Err(OfferError::OfferExpired(offer.id)),
                status => {
                    return Err(OfferError::OfferNotAccepted {
                        offer: offer.id,
                        status,
                    });
                }
            }

            let mut order = load_order(&mut txn, &offer.order_id).await?;
            if order.client_id != client_id {
                return Err(OfferError::NotYourOrder {
                    order: order.id,
                    user: client_id.to_owned(),
                });
            }
            if order.selected_offer_id.is_some() {
                return Err(OfferError::OrderAlreadyMatched(order.id));
            }
            let price = offer
                .proposed_price
                .filter(|p| p.is_positive())
                .ok_or(OfferError::InvalidPrice(offer.proposed_price.unwrap_or_default()))?;

            let deal_id = new_id();
            let receipt = self
                .wallet
                .stage_freeze(&mut txn, client_id, &deal_id, price)
                .await?;
            let deal = new_deal(deal_id, &offer, &order, price, receipt.commission_tx, now);
            txn.create(Collection::Deals, &deal.id, &deal)?;

            offer.status = OfferStatus::Chosen;
            offer.chosen_at = Some(now);
            offer.deal_id = Some(deal.id.clone());
            txn.put(Collection::Offers, &offer.id, &offer)?;

            order.selected_offer_id = Some(offer.id.clone());
            order.selected_deal_id = Some(deal.id.clone());
            order.status = OrderStatus::ExecutorSelected;
            txn.put(Collection::Orders, &order.id, &order)?;

            Ok(((deal, offer.contractor_push_token), txn))
        })
        .await?;

        info!(
            deal = %deal.id,
            offer = offer_id,
            order = %deal.order_id,
            client = client_id,
            price = %deal.price,
            "offer chosen"
        );

        let message = PushMessage::new(
            "You have been chosen",
            format!("The client chose your offer. Amount {}.", deal.price),
        )
        .with("deal_id", deal.id.as_str())
        .with("order_id", deal.order_id.as_str());
        notify::best_effort(self.notifier.as_ref(), push_token.as_deref(), &message).await;

        Ok(deal)
    }

    async fn list(&self, field: &str, value: &str) -> Result<Vec<Offer>, OfferError> {
        let mut offers: Vec<Offer> = fetch_where(self.store.as_ref(), Collection::Offers, field, value)
            .await?
            .into_iter()
            .map(|o| self.with_effective_status(o))
            .collect();
        offers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(offers)
    }

    fn with_effective_status(&self, mut offer: Offer) -> Offer {
        offer.status = offer.effective_status(self.clock.now());
        offer
    }
}

async fn load_offer(txn: &mut Txn, offer_id: &str) -> Result<Offer, OfferError> {
    txn.get(Collection::Offers, offer_id)
        .await?
        .ok_or_else(|| OfferError::OfferNotFound(offer_id.to_owned()))
}

async fn load_order(txn: &mut Txn, order_id: &str) -> Result<Order, OfferError> {
    txn.get(Collection::Orders, order_id)
        .await?
        .ok_or_else(|| OfferError::OrderNotFound(order_id.to_owned()))
}
