//! Append-only transaction log.
//!
//! Entries are only ever created, never updated, and are staged in the same
//! [`Txn`] as the balance change they describe so the two land together.

use crate::model::Transaction;
use crate::store::{Collection, DocumentStore, StoreError, Txn, fetch_where};

/// Stage `entry` for creation inside `txn`.
pub fn record(txn: &mut Txn, entry: &Transaction) -> Result<(), StoreError> {
    txn.create(Collection::Transactions, &entry.id, entry)
}

/// Entries for a user, newest first.
pub async fn for_user(
    store: &dyn DocumentStore,
    user_id: &str,
) -> Result<Vec<Transaction>, StoreError> {
    let mut entries: Vec<Transaction> =
        fetch_where(store, Collection::Transactions, "user_id", user_id).await?;
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(entries)
}

/// Entries touching a deal across all participants, newest first.
pub async fn for_deal(
    store: &dyn DocumentStore,
    deal_id: &str,
) -> Result<Vec<Transaction>, StoreError> {
    let mut entries: Vec<Transaction> =
        fetch_where(store, Collection::Transactions, "deal_id", deal_id).await?;
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(entries)
}
