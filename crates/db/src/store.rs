use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

pub const REPOS: &str = "repos";
pub const COMMITS: &str = "commits";
pub const VIDEOS: &str = "videos";
pub const WEBHOOK_DELIVERIES: &str = "webhook_deliveries";

/// Keyed JSON documents grouped into collections.
///
/// Updates are partial: `merge` applies a JSON merge patch so writers touching
/// different fields of the same document never clobber each other.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Insert `doc` unless a document with this id exists. Returns the stored
    /// document and whether it was created by this call.
    async fn create_if_absent(&self, collection: &str, id: &str, doc: Value)
    -> Result<(Value, bool)>;

    /// Apply a merge patch. Returns `None` if the document does not exist.
    async fn merge(&self, collection: &str, id: &str, patch: &Value) -> Result<Option<Value>>;

    /// Documents matching every filter, newest first.
    async fn list(&self, collection: &str, query: &Query) -> Result<Vec<Value>>;
}

/// Top-level string field must equal one of `values`.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self { Self::default() }

    pub fn eq(self, field: &str, value: impl Into<String>) -> Self {
        self.any_of(field, [value.into()])
    }

    pub fn any_of(mut self, field: &str, values: impl IntoIterator<Item = String>) -> Self {
        let values = values.into_iter().collect();
        self.filters.push(Filter { field: field.to_string(), values });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.filters.iter().all(|f| {
            let value = doc.get(&f.field).and_then(Value::as_str);
            value.is_some_and(|v| f.values.iter().any(|x| x == v))
        })
    }
}

/// RFC 7396 JSON merge patch. `null` members remove keys, objects merge
/// recursively, anything else replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
