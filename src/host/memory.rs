//! In-process host implementation.
//!
//! Backs the test suite and doubles as a reference for embedding
//! hosts. All collections live behind a single mutex per store, which
//! trivially satisfies the conditional-put atomicity contract.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{
    ChatSink, EventSink, FindOptions, Host, JobSpec, Scheduler, SecretVault, SortOrder, Storage,
    UserProfiles,
};
use crate::error::Result;
use crate::types::Profile;

#[derive(Default)]
pub struct MemoryStorage {
    collections: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_query(doc: &Value, query: &Value) -> bool {
    match query.as_object() {
        Some(fields) => fields.iter().all(|(k, v)| doc.get(k) == Some(v)),
        None => true,
    }
}

fn compare_field(a: &Value, b: &Value, field: &str) -> std::cmp::Ordering {
    let (va, vb) = (a.get(field), b.get(field));
    match (va.and_then(Value::as_f64), vb.and_then(Value::as_f64)) {
        (Some(na), Some(nb)) => na.partial_cmp(&nb).unwrap_or(std::cmp::Ordering::Equal),
        _ => {
            let sa = va.and_then(Value::as_str).unwrap_or("");
            let sb = vb.and_then(Value::as_str).unwrap_or("");
            sa.cmp(sb)
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, coll: &str, id: &str) -> Result<Option<Value>> {
        let collections = self.collections.lock().unwrap();
        Ok(collections.get(coll).and_then(|c| c.get(id)).cloned())
    }

    async fn put(&self, coll: &str, id: &str, doc: Value) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        collections
            .entry(coll.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn put_if_absent(&self, coll: &str, id: &str, doc: Value) -> Result<bool> {
        let mut collections = self.collections.lock().unwrap();
        let collection = collections.entry(coll.to_string()).or_default();
        if collection.contains_key(id) {
            return Ok(false);
        }
        collection.insert(id.to_string(), doc);
        Ok(true)
    }

    async fn delete(&self, coll: &str, id: &str) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        if let Some(collection) = collections.get_mut(coll) {
            collection.remove(id);
        }
        Ok(())
    }

    async fn find(&self, coll: &str, query: Value, opts: FindOptions) -> Result<Vec<Value>> {
        let collections = self.collections.lock().unwrap();
        let mut docs: Vec<Value> = collections
            .get(coll)
            .map(|c| {
                c.values()
                    .filter(|d| matches_query(d, &query))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some((field, order)) = &opts.sort {
            docs.sort_by(|a, b| {
                let ord = compare_field(a, b, field);
                match order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            });
        }
        let offset = opts.offset.unwrap_or(0);
        let docs: Vec<Value> = docs.into_iter().skip(offset).collect();
        Ok(match opts.limit {
            Some(limit) => docs.into_iter().take(limit).collect(),
            None => docs,
        })
    }

    async fn find_one(&self, coll: &str, query: Value) -> Result<Option<Value>> {
        let mut found = self
            .find(coll, query, FindOptions { limit: Some(1), ..Default::default() })
            .await?;
        Ok(found.pop())
    }

    async fn delete_many(&self, coll: &str, query: Value) -> Result<u64> {
        let mut collections = self.collections.lock().unwrap();
        let Some(collection) = collections.get_mut(coll) else {
            return Ok(0);
        };
        let ids: Vec<String> = collection
            .iter()
            .filter(|(_, d)| matches_query(d, &query))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            collection.remove(id);
        }
        Ok(ids.len() as u64)
    }
}

#[derive(Default)]
pub struct MemoryVault {
    secrets: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl SecretVault for MemoryVault {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.secrets.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.secrets
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.secrets.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Records scheduled jobs; fires are driven manually by tests through
/// the supervisor.
#[derive(Default)]
pub struct MemoryScheduler {
    pub jobs: Mutex<HashMap<String, JobSpec>>,
}

#[async_trait]
impl Scheduler for MemoryScheduler {
    async fn schedule(&self, job: JobSpec) -> Result<()> {
        self.jobs.lock().unwrap().insert(job.id.clone(), job);
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        self.jobs.lock().unwrap().remove(job_id);
        Ok(())
    }
}

/// Captures appended instructions per user.
#[derive(Default)]
pub struct MemoryChat {
    pub posts: Mutex<Vec<(String, String)>>,
    /// When set, `append_instruction` fails (sink-failure tests).
    pub fail: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl ChatSink for MemoryChat {
    async fn append_instruction(&self, user_id: &str, text: &str) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::error::MailError::Other("chat sink unavailable".into()));
        }
        self.posts
            .lock()
            .unwrap()
            .push((user_id.to_string(), text.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryEvents {
    pub emitted: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl EventSink for MemoryEvents {
    async fn emit(&self, name: &str, payload: Value) {
        self.emitted
            .lock()
            .unwrap()
            .push((name.to_string(), payload));
    }
}

#[derive(Default)]
pub struct MemoryProfiles {
    pub profiles: Mutex<HashMap<String, Profile>>,
}

#[async_trait]
impl UserProfiles for MemoryProfiles {
    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        Ok(self.profiles.lock().unwrap().get(user_id).cloned())
    }
}

/// Complete in-memory host.
pub struct MemoryHost {
    user_storage: Mutex<HashMap<String, Arc<MemoryStorage>>>,
    user_secrets: Mutex<HashMap<String, Arc<MemoryVault>>>,
    extension_storage: Arc<MemoryStorage>,
    pub scheduler: Arc<MemoryScheduler>,
    pub chat: Arc<MemoryChat>,
    pub events: Arc<MemoryEvents>,
    pub profiles: Arc<MemoryProfiles>,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self {
            user_storage: Mutex::new(HashMap::new()),
            user_secrets: Mutex::new(HashMap::new()),
            extension_storage: Arc::new(MemoryStorage::new()),
            scheduler: Arc::new(MemoryScheduler::default()),
            chat: Arc::new(MemoryChat::default()),
            events: Arc::new(MemoryEvents::default()),
            profiles: Arc::new(MemoryProfiles::default()),
        }
    }
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Host for MemoryHost {
    fn user_storage(&self, user_id: &str) -> Arc<dyn Storage> {
        let mut stores = self.user_storage.lock().unwrap();
        stores
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(MemoryStorage::new()))
            .clone()
    }

    fn user_secrets(&self, user_id: &str) -> Arc<dyn SecretVault> {
        let mut vaults = self.user_secrets.lock().unwrap();
        vaults
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(MemoryVault::default()))
            .clone()
    }

    fn extension_storage(&self) -> Arc<dyn Storage> {
        self.extension_storage.clone()
    }

    fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.scheduler.clone()
    }

    fn chat(&self) -> Arc<dyn ChatSink> {
        self.chat.clone()
    }

    fn events(&self) -> Arc<dyn EventSink> {
        self.events.clone()
    }

    fn profiles(&self) -> Arc<dyn UserProfiles> {
        self.profiles.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_if_absent_inserts_once() {
        let storage = MemoryStorage::new();
        assert!(storage
            .put_if_absent("processed", "a", json!({"uid": 1}))
            .await
            .unwrap());
        assert!(!storage
            .put_if_absent("processed", "a", json!({"uid": 2}))
            .await
            .unwrap());
        let doc = storage.get("processed", "a").await.unwrap().unwrap();
        assert_eq!(doc["uid"], 1);
    }

    #[tokio::test]
    async fn find_sorts_numerically_and_limits() {
        let storage = MemoryStorage::new();
        for uid in [3u32, 12, 7] {
            storage
                .put(
                    "processed",
                    &format!("doc-{uid}"),
                    json!({"account_id": "a", "uid": uid}),
                )
                .await
                .unwrap();
        }
        let top = storage
            .find(
                "processed",
                json!({"account_id": "a"}),
                FindOptions {
                    sort: Some(("uid".into(), SortOrder::Desc)),
                    limit: Some(1),
                    offset: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0]["uid"], 12);
    }

    #[tokio::test]
    async fn find_one_matches_all_query_fields() {
        let storage = MemoryStorage::new();
        storage
            .put("accounts", "a", json!({"provider": "gmail", "email": "x@gmail.com"}))
            .await
            .unwrap();
        let hit = storage
            .find_one("accounts", json!({"provider": "gmail", "email": "x@gmail.com"}))
            .await
            .unwrap();
        assert!(hit.is_some());
        let miss = storage
            .find_one("accounts", json!({"provider": "outlook", "email": "x@gmail.com"}))
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn delete_many_filters_by_query() {
        let storage = MemoryStorage::new();
        storage.put("processed", "1", json!({"account_id": "a"})).await.unwrap();
        storage.put("processed", "2", json!({"account_id": "b"})).await.unwrap();
        let removed = storage
            .delete_many("processed", json!({"account_id": "a"}))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(storage.get("processed", "2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn user_scopes_are_isolated() {
        let host = MemoryHost::new();
        host.user_storage("alice")
            .put("accounts", "x", json!({"id": "x"}))
            .await
            .unwrap();
        assert!(host
            .user_storage("bob")
            .get("accounts", "x")
            .await
            .unwrap()
            .is_none());
    }
}
