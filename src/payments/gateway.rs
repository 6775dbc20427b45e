use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::PaymentStatus;
use crate::Amount;
use crate::config::PaymentConfig;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway rejected the request ({status}): {description}")]
    Rejected { status: u16, description: String },

    #[error("gateway returned no confirmation url for payment {0}")]
    MissingConfirmation(String),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub amount: Amount,
    pub description: String,
    pub metadata: BTreeMap<String, String>,
    /// Sent as `Idempotence-Key`; retries with the same key create one payment.
    pub idempotence_key: String,
}

/// A payment as the gateway created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayPayment {
    pub id: String,
    pub confirmation_url: String,
    pub status: PaymentStatus,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment(&self, request: &PaymentRequest) -> Result<GatewayPayment, GatewayError>;

    async fn payment_status(&self, payment_id: &str) -> Result<PaymentStatus, GatewayError>;
}

/// YooKassa-style REST client: basic auth with shop id and secret key,
/// redirect confirmation.
pub struct HttpGateway {
    client: reqwest::Client,
    api_url: String,
    currency: String,
    return_url: String,
    shop_id: String,
    secret_key: String,
}

#[derive(Serialize)]
struct Money {
    value: String,
    currency: String,
}

#[derive(Serialize)]
struct Confirmation<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    return_url: &'a str,
}

#[derive(Serialize)]
struct CreateBody<'a> {
    amount: Money,
    capture: bool,
    confirmation: Confirmation<'a>,
    description: &'a str,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct PaymentBody {
    id: String,
    status: String,
    #[serde(default)]
    confirmation: Option<ConfirmationBody>,
}

#[derive(Deserialize)]
struct ConfirmationBody {
    #[serde(default)]
    confirmation_url: Option<String>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    description: String,
}

impl HttpGateway {
    pub fn new(
        client: reqwest::Client,
        config: &PaymentConfig,
        shop_id: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            currency: config.currency.clone(),
            return_url: config.return_url.clone(),
            shop_id: shop_id.into(),
            secret_key: secret_key.into(),
        }
    }

    async fn read(response: reqwest::Response) -> Result<PaymentBody, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let body: ErrorBody = response.json().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                description: body.description,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_payment(&self, request: &PaymentRequest) -> Result<GatewayPayment, GatewayError> {
        let body = CreateBody {
            amount: Money {
                value: format!("{}.00", request.amount),
                currency: self.currency.clone(),
            },
            capture: true,
            confirmation: Confirmation {
                kind: "redirect",
                return_url: &self.return_url,
            },
            description: &request.description,
            metadata: &request.metadata,
        };
        let response = self
            .client
            .post(format!("{}/payments", self.api_url))
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .header("Idempotence-Key", &request.idempotence_key)
            .json(&body)
            .send()
            .await?;
        let payment = Self::read(response).await?;
        let confirmation_url = payment
            .confirmation
            .and_then(|c| c.confirmation_url)
            .ok_or_else(|| GatewayError::MissingConfirmation(payment.id.clone()))?;
        Ok(GatewayPayment {
            status: PaymentStatus::from_gateway(&payment.status),
            id: payment.id,
            confirmation_url,
        })
    }

    async fn payment_status(&self, payment_id: &str) -> Result<PaymentStatus, GatewayError> {
        let response = self
            .client
            .get(format!("{}/payments/{payment_id}", self.api_url))
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .send()
            .await?;
        let payment = Self::read(response).await?;
        Ok(PaymentStatus::from_gateway(&payment.status))
    }
}

/// Gateway double that replays a fixed sequence of statuses. The last status
/// repeats once the script runs out.
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Result<PaymentStatus, String>>>,
    last: Mutex<PaymentStatus>,
    requests: Mutex<Vec<PaymentRequest>>,
    reject_create: bool,
}

impl ScriptedGateway {
    pub fn new(statuses: impl IntoIterator<Item = PaymentStatus>) -> Self {
        Self::with_script(statuses.into_iter().map(Ok))
    }

    /// Like [`ScriptedGateway::new`], but `Err` entries fail that poll.
    pub fn with_script(script: impl IntoIterator<Item = Result<PaymentStatus, String>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(PaymentStatus::Pending),
            requests: Mutex::new(Vec::new()),
            reject_create: false,
        }
    }

    pub fn rejecting() -> Self {
        Self {
            reject_create: true,
            ..Self::new([])
        }
    }

    pub fn requests(&self) -> Vec<PaymentRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_payment(&self, request: &PaymentRequest) -> Result<GatewayPayment, GatewayError> {
        if self.reject_create {
            return Err(GatewayError::Rejected {
                status: 400,
                description: "invalid_request".to_string(),
            });
        }
        let mut requests = self.requests.lock();
        requests.push(request.clone());
        let id = format!("ext-{}", requests.len());
        Ok(GatewayPayment {
            confirmation_url: format!("https://pay.example/{id}"),
            id,
            status: PaymentStatus::Pending,
        })
    }

    async fn payment_status(&self, _payment_id: &str) -> Result<PaymentStatus, GatewayError> {
        let next = self.script.lock().pop_front();
        match next {
            Some(Ok(status)) => {
                *self.last.lock() = status;
                Ok(status)
            }
            Some(Err(reason)) => Err(GatewayError::Unavailable(reason)),
            None => Ok(*self.last.lock()),
        }
    }
}
