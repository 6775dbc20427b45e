//! Push notifications to participants.
//!
//! Delivery is always best effort: callers go through [`best_effort`], which
//! logs failures and never lets them affect the operation that triggered them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
#[error("push delivery failed: {0}")]
pub struct NotifyError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

impl PushMessage {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.data.insert(key.to_owned(), value.into());
        self
    }
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, token: &str, message: &PushMessage) -> Result<(), NotifyError>;
}

/// Send `message`, logging instead of failing.
pub async fn best_effort(notifier: &dyn PushNotifier, token: Option<&str>, message: &PushMessage) {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        debug!(title = %message.title, "no push token, notification not sent");
        return;
    };
    if let Err(e) = notifier.notify(token, message).await {
        warn!(
            token = %redact(token),
            title = %message.title,
            reason = %e,
            "push notification dropped"
        );
    }
}

/// Device tokens are credentials; only their tail goes to the logs.
fn redact(token: &str) -> String {
    if token.chars().count() <= 8 {
        return "...".to_string();
    }
    let tail: String = token
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{tail}")
}

/// Expo push API client.
pub struct ExpoNotifier {
    client: reqwest::Client,
    endpoint: String,
}

pub const EXPO_PUSH_URL: &str = "https://exp.host/--/api/v2/push/send";

#[derive(Serialize)]
struct ExpoPush<'a> {
    to: &'a str,
    sound: &'static str,
    title: &'a str,
    body: &'a str,
    data: &'a BTreeMap<String, String>,
}

impl ExpoNotifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoint(client, EXPO_PUSH_URL)
    }

    pub fn with_endpoint(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl PushNotifier for ExpoNotifier {
    async fn notify(&self, token: &str, message: &PushMessage) -> Result<(), NotifyError> {
        let payload = ExpoPush {
            to: token,
            sound: "default",
            title: &message.title,
            body: &message.body,
            data: &message.data,
        };
        self.client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| NotifyError(e.to_string()))?;
        Ok(())
    }
}

/// Keeps every notification in memory. Can be told to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, PushMessage)>>,
    failing: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let notifier = Self::default();
        *notifier.failing.lock() = true;
        notifier
    }

    pub fn sent(&self) -> Vec<(String, PushMessage)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl PushNotifier for RecordingNotifier {
    async fn notify(&self, token: &str, message: &PushMessage) -> Result<(), NotifyError> {
        if *self.failing.lock() {
            return Err(NotifyError("push service unreachable".to_string()));
        }
        self.sent.lock().push((token.to_owned(), message.clone()));
        Ok(())
    }
}
