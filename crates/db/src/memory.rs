use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::store::{DocumentStore, Query, merge_patch};

/// In-process document store, used by tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<(String, String), Entry>,
    seq: u64,
}

struct Entry {
    doc: Value,
    seq: u64,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let inner = self.lock();
        Ok(inner.docs.get(&(collection.to_string(), id.to_string())).map(|e| e.doc.clone()))
    }

    async fn create_if_absent(
        &self,
        collection: &str,
        id: &str,
        doc: Value,
    ) -> Result<(Value, bool)> {
        let mut inner = self.lock();
        let key = (collection.to_string(), id.to_string());
        if let Some(existing) = inner.docs.get(&key) {
            return Ok((existing.doc.clone(), false));
        }
        inner.seq += 1;
        let seq = inner.seq;
        inner.docs.insert(key, Entry { doc: doc.clone(), seq });
        Ok((doc, true))
    }

    async fn merge(&self, collection: &str, id: &str, patch: &Value) -> Result<Option<Value>> {
        let mut inner = self.lock();
        let Some(entry) = inner.docs.get_mut(&(collection.to_string(), id.to_string())) else {
            return Ok(None);
        };
        merge_patch(&mut entry.doc, patch);
        Ok(Some(entry.doc.clone()))
    }

    async fn list(&self, collection: &str, query: &Query) -> Result<Vec<Value>> {
        let inner = self.lock();
        let mut matched = inner
            .docs
            .iter()
            .filter(|((c, _), e)| c == collection && query.matches(&e.doc))
            .map(|(_, e)| (e.seq, e.doc.clone()))
            .collect::<Vec<_>>();
        matched.sort_by(|a, b| b.0.cmp(&a.0));
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matched.into_iter().take(limit).map(|(_, doc)| doc).collect())
    }
}
