use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::{Collection, DocumentStore, Precondition, StoreError, Versioned, Write, decode};

/// Attempts [`run_txn`] makes before reporting contention.
pub const DEFAULT_ATTEMPTS: u32 = 8;

type Key = (Collection, String);

#[derive(Debug)]
struct Staged {
    body: Value,
    create: bool,
}

/// Optimistic read-modify-write unit.
///
/// Every document read is pinned at the version observed; at commit, writes
/// carry that version as their precondition and untouched reads are asserted
/// with [`Write::Check`]. Reads see writes already staged in the same `Txn`.
pub struct Txn {
    store: Arc<dyn DocumentStore>,
    reads: HashMap<Key, Option<Versioned<Value>>>,
    writes: BTreeMap<Key, Staged>,
}

impl Txn {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
        }
    }

    pub async fn get<T: DeserializeOwned>(
        &mut self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        let key = (collection, id.to_owned());

        if let Some(staged) = self.writes.get(&key) {
            let doc = Versioned {
                id: id.to_owned(),
                version: 0,
                body: staged.body.clone(),
            };
            return Ok(Some(decode(collection, doc)?.body));
        }

        let doc = match self.reads.get(&key) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = self.store.get(collection, id).await?;
                self.reads.insert(key, fetched.clone());
                fetched
            }
        };

        doc.map(|d| decode(collection, d).map(|d| d.body))
            .transpose()
    }

    /// Equality query; every returned document is pinned like a `get`.
    pub async fn query<T: DeserializeOwned>(
        &mut self,
        collection: Collection,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Vec<T>, StoreError> {
        let value = value.into();
        let docs = self.store.query(collection, field, &value).await?;
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            let key = (collection, doc.id.clone());
            if let Some(staged) = self.writes.get(&key) {
                if staged.body.get(field) != Some(&value) {
                    continue;
                }
                out.push(
                    decode(
                        collection,
                        Versioned {
                            id: doc.id.clone(),
                            version: 0,
                            body: staged.body.clone(),
                        },
                    )?
                    .body,
                );
                continue;
            }
            self.reads.entry(key).or_insert_with(|| Some(doc.clone()));
            out.push(decode(collection, doc)?.body);
        }
        Ok(out)
    }

    /// Stage an overwrite of a document, creating it if the read saw nothing.
    pub fn put<T: Serialize>(
        &mut self,
        collection: Collection,
        id: &str,
        body: &T,
    ) -> Result<(), StoreError> {
        let key = (collection, id.to_owned());
        let create = self.writes.get(&key).map(|s| s.create).unwrap_or(false);
        self.writes.insert(
            key,
            Staged {
                body: serde_json::to_value(body)?,
                create,
            },
        );
        Ok(())
    }

    /// Stage a brand new document; the commit fails if the id is taken.
    pub fn create<T: Serialize>(
        &mut self,
        collection: Collection,
        id: &str,
        body: &T,
    ) -> Result<(), StoreError> {
        self.writes.insert(
            (collection, id.to_owned()),
            Staged {
                body: serde_json::to_value(body)?,
                create: true,
            },
        );
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    fn observed(&self, key: &Key) -> Option<Precondition> {
        self.reads.get(key).map(|doc| match doc {
            Some(doc) => Precondition::Version(doc.version),
            None => Precondition::Absent,
        })
    }

    fn into_writes(self) -> Vec<Write> {
        let mut batch = Vec::with_capacity(self.reads.len() + self.writes.len());

        for (key, doc) in &self.reads {
            if self.writes.contains_key(key) {
                continue;
            }
            let precondition = match doc {
                Some(doc) => Precondition::Version(doc.version),
                None => Precondition::Absent,
            };
            batch.push(Write::Check {
                collection: key.0,
                id: key.1.clone(),
                precondition,
            });
        }

        let preconditions: Vec<Precondition> = self
            .writes
            .iter()
            .map(|(key, staged)| {
                if staged.create {
                    Precondition::Absent
                } else {
                    self.observed(key).unwrap_or(Precondition::Any)
                }
            })
            .collect();

        for (((collection, id), staged), precondition) in
            self.writes.into_iter().zip(preconditions)
        {
            batch.push(Write::Put {
                collection,
                id,
                body: staged.body,
                precondition,
            });
        }

        batch
    }

    /// Submit the staged writes as one atomic batch.
    pub async fn commit(self) -> Result<(), StoreError> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let store = self.store.clone();
        store.commit(self.into_writes()).await
    }
}

/// Run `body` in a fresh [`Txn`] and commit it, retrying the whole body when
/// the commit loses a race. Errors returned by `body` abort without writing.
pub async fn run_txn<T, E, F, Fut>(
    store: &Arc<dyn DocumentStore>,
    attempts: u32,
    mut body: F,
) -> Result<T, E>
where
    F: FnMut(Txn) -> Fut,
    Fut: Future<Output = Result<(T, Txn), E>>,
    E: From<StoreError>,
{
    for attempt in 1..=attempts {
        let (value, txn) = body(Txn::new(store.clone())).await?;
        match txn.commit().await {
            Ok(()) => return Ok(value),
            Err(StoreError::Conflict { collection, id }) => {
                debug!(attempt, %collection, id, "transaction conflict, retrying");
                tokio::task::yield_now().await;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(StoreError::Contention { attempts }.into())
}
