use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::RwLock;

use async_trait::async_trait;

use jobwarden_core::{CreateItem, Item, UpsertItem};

use super::{JobStore, StoreError};

/// Status codes reported by [`InMemoryJobStore`].
pub mod codes {
    pub const ALREADY_EXISTS: &str = "ALREADY_EXISTS";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CONDITION_FAILED: &str = "CONDITION_FAILED";
    pub const INTERNAL: &str = "INTERNAL";
}

/// In-memory keyed item store.
///
/// Intended for tests/dev. Every operation runs under one write lock, which
/// gives the per-key atomicity the orchestrator relies on.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<HashMap<String, HashMap<String, Item>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::new(codes::INTERNAL, "lock poisoned")
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_if_absent(&self, request: CreateItem) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        let table = tables.entry(request.table_name).or_default();

        match table.entry(request.key) {
            Entry::Occupied(e) => Err(StoreError::new(
                codes::ALREADY_EXISTS,
                format!("item '{}' already exists", e.key()),
            )),
            Entry::Vacant(e) => {
                e.insert(request.attributes);
                Ok(())
            }
        }
    }

    async fn get(&self, table_name: &str, key: &str) -> Result<Item, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        tables
            .get(table_name)
            .and_then(|t| t.get(key))
            .cloned()
            .ok_or_else(|| StoreError::new(codes::NOT_FOUND, format!("no item '{key}'")))
    }

    async fn upsert_partial(&self, request: UpsertItem) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        let table = tables.entry(request.table_name).or_default();

        if let Some(condition) = &request.condition {
            let satisfied = table
                .get(&request.key)
                .and_then(|item| item.get(&condition.attribute))
                .is_some_and(|v| *v == condition.expected);
            if !satisfied {
                return Err(StoreError::new(
                    codes::CONDITION_FAILED,
                    format!(
                        "condition on '{}' failed for item '{}'",
                        condition.attribute, request.key
                    ),
                ));
            }
        }

        table.entry(request.key).or_default().extend(request.attributes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobwarden_core::{AttributeValue, WriteCondition};

    fn item(pairs: &[(&str, &str)]) -> Item {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), AttributeValue::S(v.to_string())))
            .collect()
    }

    fn create(key: &str, attributes: Item) -> CreateItem {
        CreateItem {
            table_name: "jobs".into(),
            key: key.into(),
            attributes,
        }
    }

    fn upsert(key: &str, attributes: Item) -> UpsertItem {
        UpsertItem {
            table_name: "jobs".into(),
            key: key.into(),
            attributes,
            condition: None,
        }
    }

    #[tokio::test]
    async fn create_is_conditional_on_absence() {
        let store = InMemoryJobStore::new();
        store.create_if_absent(create("a", item(&[("x", "1")]))).await.unwrap();

        let err = store
            .create_if_absent(create("a", item(&[("x", "2")])))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::ALREADY_EXISTS);
        assert_eq!(store.get("jobs", "a").await.unwrap(), item(&[("x", "1")]));
    }

    #[tokio::test]
    async fn missing_item_reports_not_found() {
        let store = InMemoryJobStore::new();
        let err = store.get("jobs", "missing").await.unwrap_err();
        assert_eq!(err.code, codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn upsert_merges_attributes() {
        let store = InMemoryJobStore::new();
        store
            .create_if_absent(create("a", item(&[("x", "1"), ("y", "1")])))
            .await
            .unwrap();
        store.upsert_partial(upsert("a", item(&[("y", "2")]))).await.unwrap();

        assert_eq!(
            store.get("jobs", "a").await.unwrap(),
            item(&[("x", "1"), ("y", "2")])
        );
    }

    #[tokio::test]
    async fn conditional_upsert_rejects_mismatch_and_missing_items() {
        let store = InMemoryJobStore::new();
        store.create_if_absent(create("a", item(&[("v", "1")]))).await.unwrap();

        let guard = WriteCondition {
            attribute: "v".into(),
            expected: AttributeValue::S("0".into()),
        };
        let err = store
            .upsert_partial(upsert("a", item(&[("v", "2")])).with_condition(guard.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::CONDITION_FAILED);

        let err = store
            .upsert_partial(upsert("b", item(&[("v", "2")])).with_condition(guard))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::CONDITION_FAILED);

        let guard = WriteCondition {
            attribute: "v".into(),
            expected: AttributeValue::S("1".into()),
        };
        store
            .upsert_partial(upsert("a", item(&[("v", "2")])).with_condition(guard))
            .await
            .unwrap();
        assert_eq!(store.get("jobs", "a").await.unwrap(), item(&[("v", "2")]));
    }
}
