use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{Collection, DocumentStore, Precondition, StoreError, Versioned, Write};

#[derive(Debug, Default)]
struct Inner {
    docs: HashMap<Collection, BTreeMap<String, Versioned<Value>>>,
    failing_commits: u32,
    failing_reads: u32,
}

impl Inner {
    fn take_failure(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

/// In-process [`DocumentStore`], used by tests and the replay binary.
///
/// Commits hold a single lock while checking and applying a batch, which
/// gives the same all-or-nothing visibility a transactional backend would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with [`StoreError::Unavailable`].
    pub fn fail_next_commits(&self, n: u32) {
        self.inner.lock().failing_commits = n;
    }

    /// Make the next `n` reads fail with [`StoreError::Unavailable`].
    pub fn fail_next_reads(&self, n: u32) {
        self.inner.lock().failing_reads = n;
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: Collection) -> usize {
        self.inner
            .lock()
            .docs
            .get(&collection)
            .map_or(0, BTreeMap::len)
    }

    fn check(inner: &Inner, write: &Write) -> Result<(), StoreError> {
        let (collection, id) = write.key();
        let current = inner
            .docs
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .map(|doc| doc.version);

        let ok = match (write.precondition(), current) {
            (Precondition::Any, _) => true,
            (Precondition::Absent, None) => true,
            (Precondition::Version(expected), Some(actual)) => expected == actual,
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(StoreError::Conflict {
                collection,
                id: id.to_owned(),
            })
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Versioned<Value>>, StoreError> {
        let mut inner = self.inner.lock();
        if Inner::take_failure(&mut inner.failing_reads) {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        Ok(inner
            .docs
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn query(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Versioned<Value>>, StoreError> {
        let mut inner = self.inner.lock();
        if Inner::take_failure(&mut inner.failing_reads) {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        Ok(inner
            .docs
            .get(&collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| doc.body.get(field) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list(&self, collection: Collection) -> Result<Vec<Versioned<Value>>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .docs
            .get(&collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if Inner::take_failure(&mut inner.failing_commits) {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }

        for write in &writes {
            Self::check(&inner, write)?;
        }

        for write in writes {
            if let Write::Put {
                collection,
                id,
                body,
                ..
            } = write
            {
                let docs = inner.docs.entry(collection).or_default();
                let version = docs.get(&id).map_or(1, |doc| doc.version + 1);
                docs.insert(id.clone(), Versioned { id, version, body });
            }
        }

        Ok(())
    }
}
