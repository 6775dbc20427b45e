//! Offer matching.
//!
//! Picks the closest, best-rated contractors for an order and sends each of
//! them a time-limited offer. The number of simultaneously active offers per
//! order is capped; hitting the cap is a normal outcome, reported through
//! [`MatchSignal`] rather than an error.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

use crate::clock::Clock;
use crate::config::MatchingConfig;
use crate::error::{Classify, ErrorClass, RETRY_PROMPT};
use crate::model::{
    MatchMeta, Offer, OfferStatus, Order, OrderId, OrderSnapshot, UserId, new_id,
};
use crate::notify::{self, PushMessage, PushNotifier};
use crate::store::{Collection, DEFAULT_ATTEMPTS, DocumentStore, StoreError, fetch, run_txn};

/// Sort key for candidates with no known distance.
const FAR_AWAY_KM: f64 = 999.0;
const MATCHED_BY: &str = "top_n";
const ALGORITHM_VERSION: u32 = 1;
const PUSH_PREVIEW_LEN: usize = 50;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Candidate {
    pub id: UserId,
    pub distance_km: Option<f64>,
    pub rating: Option<f64>,
    pub category_id: Option<String>,
    pub push_token: Option<String>,
}

impl Candidate {
    fn distance_key(&self) -> f64 {
        self.distance_km.unwrap_or(FAR_AWAY_KM)
    }

    fn rating_key(&self) -> f64 {
        self.rating.unwrap_or(0.0)
    }
}

#[derive(Debug, Error)]
#[error("candidate lookup failed: {0}")]
pub struct ProviderError(pub String);

/// Source of contractors that could take an order.
#[async_trait]
pub trait CandidateProvider: Send + Sync {
    async fn get_nearby(
        &self,
        latitude: f64,
        longitude: f64,
        radius_km: f64,
        category_id: Option<&str>,
    ) -> Result<Vec<Candidate>, ProviderError>;

    async fn get_all(&self) -> Result<Vec<Candidate>, ProviderError>;
}

/// Fixed candidate list. Distances are taken as given.
#[derive(Default)]
pub struct StaticCandidates {
    candidates: Mutex<Vec<Candidate>>,
}

impl StaticCandidates {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates: Mutex::new(candidates),
        }
    }
}

#[async_trait]
impl CandidateProvider for StaticCandidates {
    async fn get_nearby(
        &self,
        _latitude: f64,
        _longitude: f64,
        radius_km: f64,
        _category_id: Option<&str>,
    ) -> Result<Vec<Candidate>, ProviderError> {
        Ok(self
            .candidates
            .lock()
            .iter()
            .filter(|c| c.distance_km.is_none_or(|d| d <= radius_km))
            .cloned()
            .collect())
    }

    async fn get_all(&self) -> Result<Vec<Candidate>, ProviderError> {
        Ok(self.candidates.lock().clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOptions {
    pub top_n: usize,
    pub max_active_offers_per_order: usize,
}

impl From<&MatchingConfig> for MatchOptions {
    fn from(config: &MatchingConfig) -> Self {
        Self {
            top_n: config.top_n,
            max_active_offers_per_order: config.max_active_offers_per_order,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSignal {
    OrderActiveOffersLimitReached,
    NoCandidatesOrNoSlots,
}

impl MatchSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchSignal::OrderActiveOffersLimitReached => "order_active_offers_limit_reached",
            MatchSignal::NoCandidatesOrNoSlots => "no_candidates_or_no_slots",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OrderLimitReached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub contractor_id: UserId,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatchOutcome {
    pub created: Vec<Offer>,
    pub skipped: Vec<Skipped>,
    pub signal: Option<MatchSignal>,
}

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for MatchError {
    fn class(&self) -> ErrorClass {
        match self {
            MatchError::OrderNotFound(_) => ErrorClass::Business,
            MatchError::Provider(_) => ErrorClass::Infrastructure,
            MatchError::Store(err) => err.class(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            MatchError::OrderNotFound(_) => "order_not_found",
            MatchError::Provider(_) => "candidate_lookup_failed",
            MatchError::Store(err) => err.code(),
        }
    }

    fn user_message(&self) -> &'static str {
        match self {
            MatchError::OrderNotFound(_) => "This order no longer exists.",
            MatchError::Provider(_) => RETRY_PROMPT,
            MatchError::Store(err) => err.user_message(),
        }
    }
}

pub struct OfferMatcher {
    store: Arc<dyn DocumentStore>,
    candidates: Arc<dyn CandidateProvider>,
    notifier: Arc<dyn PushNotifier>,
    clock: Arc<dyn Clock>,
    config: MatchingConfig,
    attempts: u32,
}

impl OfferMatcher {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        candidates: Arc<dyn CandidateProvider>,
        notifier: Arc<dyn PushNotifier>,
        clock: Arc<dyn Clock>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            store,
            candidates,
            notifier,
            clock,
            config,
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    pub async fn start_matching_by_order_id(
        &self,
        order_id: &str,
    ) -> Result<MatchOutcome, MatchError> {
        let order: Order = fetch(self.store.as_ref(), Collection::Orders, order_id)
            .await?
            .ok_or_else(|| MatchError::OrderNotFound(order_id.to_owned()))?;
        self.start_matching(&order, MatchOptions::from(&self.config))
            .await
    }

    /// Create offers for `order`.
    ///
    /// Offers and the order's `top_contractors` are written in one batch that
    /// is conditional on the order not having changed since it was read, so
    /// concurrent rounds for one order cannot overshoot the cap together.
    pub async fn start_matching(
        &self,
        order: &Order,
        opts: MatchOptions,
    ) -> Result<MatchOutcome, MatchError> {
        let ranked = self.ranked_candidates(order).await?;
        let ranked = &ranked;

        let outcome = run_txn::<_, MatchError, _, _>(&self.store, self.attempts, |mut txn| async move {
            let now = self.clock.now();
            let mut stored: Order = txn
                .get(Collection::Orders, &order.id)
                .await?
                .ok_or_else(|| MatchError::OrderNotFound(order.id.clone()))?;
            let existing: Vec<Offer> = txn
                .query(Collection::Offers, "order_id", order.id.as_str())
                .await?;
            let active: Vec<&Offer> = existing.iter().filter(|o| o.is_active(now)).collect();

            if active.len() >= opts.max_active_offers_per_order {
                let skipped = ranked
                    .iter()
                    .take(opts.top_n)
                    .map(|c| Skipped {
                        contractor_id: c.id.clone(),
                        reason: SkipReason::OrderLimitReached,
                    })
                    .collect();
                let outcome = MatchOutcome {
                    created: Vec::new(),
                    skipped,
                    signal: Some(MatchSignal::OrderActiveOffersLimitReached),
                };
                return Ok((outcome, txn));
            }

            let holders: HashSet<&str> = active.iter().map(|o| o.contractor_id.as_str()).collect();
            let slots = opts.max_active_offers_per_order - active.len();
            let picked: Vec<&Candidate> = ranked
                .iter()
                .filter(|c| !holders.contains(c.id.as_str()))
                .take(opts.top_n.min(slots))
                .collect();

            if picked.is_empty() {
                let outcome = MatchOutcome {
                    signal: Some(MatchSignal::NoCandidatesOrNoSlots),
                    ..MatchOutcome::default()
                };
                return Ok((outcome, txn));
            }

            let created: Vec<Offer> = picked
                .iter()
                .map(|c| self.new_offer(&stored, c, now))
                .collect();
            for offer in &created {
                txn.create(Collection::Offers, &offer.id, offer)?;
            }
            stored.top_contractors = picked.iter().map(|c| c.id.clone()).collect();
            txn.put(Collection::Orders, &stored.id, &stored)?;

            Ok((
                MatchOutcome {
                    created,
                    ..MatchOutcome::default()
                },
                txn,
            ))
        })
        .await?;

        info!(
            order = %order.id,
            created = outcome.created.len(),
            signal = outcome.signal.map(MatchSignal::as_str).unwrap_or("none"),
            "matching finished"
        );

        let preview: String = order.description.chars().take(PUSH_PREVIEW_LEN).collect();
        for offer in &outcome.created {
            let message = PushMessage::new("New offer!", format!("New order nearby: {preview}"))
                .with("offer_id", offer.id.as_str())
                .with("order_id", order.id.as_str())
                .with("type", "new-offer");
            notify::best_effort(
                self.notifier.as_ref(),
                offer.contractor_push_token.as_deref(),
                &message,
            )
            .await;
        }

        Ok(outcome)
    }

    /// Candidates for the order, closest first, better rated first on ties.
    async fn ranked_candidates(&self, order: &Order) -> Result<Vec<Candidate>, MatchError> {
        let category = order.category_id.as_deref();
        let mut found = match order.coordinates() {
            Some((lat, lon)) => {
                self.candidates
                    .get_nearby(lat, lon, self.config.radius_km, category)
                    .await?
            }
            None => self.candidates.get_all().await?,
        };
        if let Some(category) = category {
            found.retain(|c| c.category_id.as_deref() == Some(category));
        }
        found.sort_by(|a, b| {
            a.distance_key()
                .total_cmp(&b.distance_key())
                .then_with(|| b.rating_key().total_cmp(&a.rating_key()))
        });
        Ok(found)
    }

    fn new_offer(&self, order: &Order, candidate: &Candidate, now: DateTime<Utc>) -> Offer {
        Offer {
            id: new_id(),
            order_id: order.id.clone(),
            contractor_id: candidate.id.clone(),
            status: OfferStatus::Pending,
            proposed_price: None,
            created_at: now,
            expires_at: now + self.config.offer_ttl(),
            accepted_at: None,
            declined_at: None,
            chosen_at: None,
            deal_id: None,
            order_snapshot: OrderSnapshot {
                address: order.address.clone(),
                short_desc: order
                    .description
                    .chars()
                    .take(self.config.snapshot_description_len)
                    .collect(),
            },
            contractor_push_token: candidate.push_token.clone(),
            meta: MatchMeta {
                matched_by: MATCHED_BY.to_string(),
                matched_at: now,
                algorithm_version: ALGORITHM_VERSION,
            },
        }
    }
}
