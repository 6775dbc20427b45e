use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::{
    PaymentError, PaymentGateway, PaymentHandle, PaymentKind, PaymentRecord, PaymentRequest,
    PaymentStatus, Settlement, StatusChange,
};
use crate::Amount;
use crate::clock::Clock;
use crate::config::{PaymentConfig, Policy};
use crate::deals::DealService;
use crate::model::{Deal, DealId, Party, UserId, new_id};
use crate::store::{Collection, DEFAULT_ATTEMPTS, DocumentStore, fetch, fetch_where, run_txn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationRequest {
    pub deal_id: DealId,
    /// The paying participant, client or contractor.
    pub user_id: UserId,
    pub customer_email: Option<String>,
}

#[derive(Clone)]
pub struct PaymentOrchestrator {
    store: Arc<dyn DocumentStore>,
    gateway: Arc<dyn PaymentGateway>,
    deals: Arc<DealService>,
    clock: Arc<dyn Clock>,
    fee: Amount,
    config: PaymentConfig,
    attempts: u32,
}

impl PaymentOrchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        gateway: Arc<dyn PaymentGateway>,
        deals: Arc<DealService>,
        clock: Arc<dyn Clock>,
        policy: &Policy,
        config: PaymentConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            deals,
            clock,
            fee: policy.confirmation_fee,
            config,
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    pub async fn payment(&self, payment_id: &str) -> Result<Option<PaymentRecord>, PaymentError> {
        Ok(fetch(self.store.as_ref(), Collection::Payments, payment_id).await?)
    }

    pub async fn payments_for_deal(&self, deal_id: &str) -> Result<Vec<PaymentRecord>, PaymentError> {
        let mut records: Vec<PaymentRecord> =
            fetch_where(self.store.as_ref(), Collection::Payments, "deal_id", deal_id).await?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Charge the confirmation fee for a deal.
    ///
    /// - Move the deal to `waiting_client_confirmation`
    /// - Create the gateway payment and a pending local record
    /// - Start polling in the background
    ///
    /// Returns once the payment exists; the handle resolves when polling ends.
    /// Calling again for the same payer never charges twice: a payment that is
    /// still pending is polled again, a settled one confirms the deal, and a
    /// payer whose contacts are already unlocked gets
    /// [`DealError::AlreadyConfirmed`](crate::deals::DealError::AlreadyConfirmed).
    pub async fn confirm_selection(
        &self,
        request: ConfirmationRequest,
    ) -> Result<PaymentHandle, PaymentError> {
        let (claim, deal, party) = self.claim(&request).await?;

        let record = match claim {
            Claim::Open(record) if record.status.is_success() => {
                info!(deal = %deal.id, payment = %record.id, "payment already settled");
                let deals = self.deals.clone();
                let status = record.status;
                let settlement = tokio::spawn(async move {
                    let deal = deals.confirm(&deal.id, party).await?;
                    Ok::<_, PaymentError>(Settlement::Confirmed { status, deal })
                });
                return Ok(PaymentHandle::new(record, settlement));
            }
            Claim::Open(record) if record.external_id.is_empty() => {
                return Err(PaymentError::InProgress { payment: record.id });
            }
            Claim::Open(record) => {
                info!(deal = %deal.id, payment = %record.id, "resuming pending payment");
                record
            }
            Claim::Fresh(record) => self.create_at_gateway(record, &request).await?,
        };

        info!(
            deal = %deal.id,
            payment = %record.id,
            external = %record.external_id,
            party = ?party,
            "polling confirmation payment"
        );

        let poller = self.clone();
        let (payment_id, external_id) = (record.id.clone(), record.external_id.clone());
        let settlement =
            tokio::spawn(async move { poller.poll(payment_id, external_id, deal.id, party).await });
        Ok(PaymentHandle::new(record, settlement))
    }

    /// Reserve the payer's payment slot on the deal, or find the payment
    /// that already holds it. Failed payments free the slot.
    async fn claim(
        &self,
        request: &ConfirmationRequest,
    ) -> Result<(Claim, Deal, Party), PaymentError> {
        run_txn(&self.store, self.attempts, |mut txn| async move {
            let (deal, party) = self
                .deals
                .stage_confirmation(&mut txn, &request.deal_id, &request.user_id)
                .await?;

            let records: Vec<PaymentRecord> = txn
                .query(Collection::Payments, "deal_id", deal.id.as_str())
                .await?;
            let open = records
                .into_iter()
                .filter(|r| r.user_id == request.user_id && !r.status.is_failure())
                .max_by_key(|r| r.created_at);
            if let Some(record) = open {
                return Ok(((Claim::Open(record), deal, party), txn));
            }

            let now = self.clock.now();
            let record = PaymentRecord {
                id: new_id(),
                deal_id: deal.id.clone(),
                user_id: request.user_id.clone(),
                kind: PaymentKind::Confirmation,
                amount: self.fee,
                status: PaymentStatus::Pending,
                external_id: String::new(),
                confirmation_url: String::new(),
                polls: 0,
                history: vec![StatusChange {
                    status: PaymentStatus::Pending,
                    at: now,
                }],
                created_at: now,
                updated_at: now,
            };
            txn.create(Collection::Payments, &record.id, &record)?;
            Ok(((Claim::Fresh(record), deal, party), txn))
        })
        .await
    }

    async fn create_at_gateway(
        &self,
        mut record: PaymentRecord,
        request: &ConfirmationRequest,
    ) -> Result<PaymentRecord, PaymentError> {
        let mut metadata = BTreeMap::from([
            ("deal_id".to_string(), record.deal_id.clone()),
            ("user_id".to_string(), record.user_id.clone()),
            ("type".to_string(), "confirmation".to_string()),
        ]);
        if let Some(email) = &request.customer_email {
            metadata.insert("customer_email".to_string(), email.clone());
        }
        let created = self
            .gateway
            .create_payment(&PaymentRequest {
                amount: record.amount,
                description: format!("Confirmation fee for deal #{}", record.deal_id),
                metadata,
                idempotence_key: record.id.clone(),
            })
            .await;

        let payment = match created {
            Ok(payment) => payment,
            Err(e) => {
                // release the slot so the payer can try again
                self.update(&record.id, |record, now| {
                    record.status = PaymentStatus::Failed;
                    record.history.push(StatusChange {
                        status: PaymentStatus::Failed,
                        at: now,
                    });
                })
                .await?;
                return Err(e.into());
            }
        };

        record = self
            .update(&record.id, |record, _| {
                record.external_id = payment.id.clone();
                record.confirmation_url = payment.confirmation_url.clone();
            })
            .await?;
        Ok(record)
    }

    async fn poll(
        self,
        payment_id: String,
        external_id: String,
        deal_id: DealId,
        party: Party,
    ) -> Result<Settlement, PaymentError> {
        let max = self.config.max_poll_attempts;
        for attempt in 1..=max {
            if attempt > 1 {
                tokio::time::sleep(self.config.poll_interval()).await;
            }
            let status = match self.gateway.payment_status(&external_id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(payment = %payment_id, attempt, reason = %e, "payment status poll failed");
                    continue;
                }
            };
            self.record_poll(&payment_id, status).await?;

            if status.is_success() {
                let deal = self.deals.confirm(&deal_id, party).await?;
                info!(payment = %payment_id, deal = %deal_id, ?status, "payment settled");
                return Ok(Settlement::Confirmed { status, deal });
            }
            if status.is_failure() {
                warn!(payment = %payment_id, deal = %deal_id, ?status, "payment failed");
                return Ok(Settlement::Failed { status });
            }
        }
        warn!(payment = %payment_id, deal = %deal_id, attempts = max, "payment not settled in time");
        Ok(Settlement::TimedOut { attempts: max })
    }

    async fn record_poll(&self, payment_id: &str, status: PaymentStatus) -> Result<(), PaymentError> {
        self.update(payment_id, |record, now| {
            record.polls += 1;
            if record.status != status {
                record.status = status;
                record.history.push(StatusChange { status, at: now });
            }
        })
        .await
        .map(|_| ())
    }

    async fn update(
        &self,
        payment_id: &str,
        change: impl Fn(&mut PaymentRecord, DateTime<Utc>),
    ) -> Result<PaymentRecord, PaymentError> {
        let change = &change;
        run_txn(&self.store, self.attempts, |mut txn| async move {
            let now = self.clock.now();
            let record: Option<PaymentRecord> = txn.get(Collection::Payments, payment_id).await?;
            let Some(mut record) = record else {
                return Err(PaymentError::Aborted(format!(
                    "payment record {payment_id} disappeared"
                )));
            };
            change(&mut record, now);
            record.updated_at = now;
            txn.put(Collection::Payments, payment_id, &record)?;
            Ok((record, txn))
        })
        .await
    }
}

enum Claim {
    /// A slot was reserved for a new gateway payment.
    Fresh(PaymentRecord),
    /// The payer already has a payment that has not failed.
    Open(PaymentRecord),
}
