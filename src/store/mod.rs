//! Document store contract.
//!
//! Everything the services persist (wallets, ledger entries, offers, deals,
//! orders, payment records) lives in a [`DocumentStore`]: JSON documents
//! addressed by collection and id, each carrying a version that increases on
//! every write. Writes are submitted as batches whose preconditions are
//! checked together, so a batch either lands completely or not at all.
//!
//! Read-modify-write sequences go through [`Txn`] and [`run_txn`], which pin
//! the versions observed during the reads and retry the whole body when
//! another writer got there first.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

mod memory;
mod txn;

pub use memory::MemoryStore;
pub use txn::{DEFAULT_ATTEMPTS, Txn, run_txn};

/// Collections known to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Wallets,
    Transactions,
    Offers,
    Deals,
    Orders,
    Payments,
}

impl Collection {
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Wallets => "wallets",
            Collection::Transactions => "transactions",
            Collection::Offers => "offers",
            Collection::Deals => "deals",
            Collection::Orders => "orders",
            Collection::Payments => "payments",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored document together with its version.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub id: String,
    pub version: u64,
    pub body: T,
}

/// Condition a write requires of the current document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// The document must not exist yet.
    Absent,
    /// The document must exist at exactly this version.
    Version(u64),
    /// No condition.
    Any,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Put {
        collection: Collection,
        id: String,
        body: Value,
        precondition: Precondition,
    },
    /// Asserts a document is unchanged without writing it.
    Check {
        collection: Collection,
        id: String,
        precondition: Precondition,
    },
}

impl Write {
    pub fn key(&self) -> (Collection, &str) {
        match self {
            Write::Put { collection, id, .. } | Write::Check { collection, id, .. } => {
                (*collection, id.as_str())
            }
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            Write::Put { precondition, .. } | Write::Check { precondition, .. } => *precondition,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write conflict on {collection}/{id}")]
    Conflict { collection: Collection, id: String },

    #[error("gave up after {attempts} conflicting attempts")]
    Contention { attempts: u32 },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed document {collection}/{id}: {source}")]
    Malformed {
        collection: Collection,
        id: String,
        source: serde_json::Error,
    },

    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: Collection, id: &str)
    -> Result<Option<Versioned<Value>>, StoreError>;

    /// Documents whose top-level `field` equals `value`.
    async fn query(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Versioned<Value>>, StoreError>;

    async fn list(&self, collection: Collection) -> Result<Vec<Versioned<Value>>, StoreError>;

    /// Apply all writes atomically, or none of them if any precondition fails.
    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError>;
}

/// Decode a raw document into a typed body.
pub fn decode<T: serde::de::DeserializeOwned>(
    collection: Collection,
    doc: Versioned<Value>,
) -> Result<Versioned<T>, StoreError> {
    let body = serde_json::from_value(doc.body).map_err(|source| StoreError::Malformed {
        collection,
        id: doc.id.clone(),
        source,
    })?;
    Ok(Versioned {
        id: doc.id,
        version: doc.version,
        body,
    })
}

/// Typed get outside of a transaction.
pub async fn fetch<T: serde::de::DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: Collection,
    id: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(collection, id).await? {
        Some(doc) => Ok(Some(decode(collection, doc)?.body)),
        None => Ok(None),
    }
}

/// Typed equality query outside of a transaction.
pub async fn fetch_where<T: serde::de::DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: Collection,
    field: &str,
    value: impl Into<Value>,
) -> Result<Vec<T>, StoreError> {
    let value = value.into();
    store
        .query(collection, field, &value)
        .await?
        .into_iter()
        .map(|doc| decode(collection, doc).map(|d| d.body))
        .collect()
}

/// Every document in a collection, typed.
pub async fn fetch_all<T: serde::de::DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: Collection,
) -> Result<Vec<T>, StoreError> {
    store
        .list(collection)
        .await?
        .into_iter()
        .map(|doc| decode(collection, doc).map(|d| d.body))
        .collect()
}
