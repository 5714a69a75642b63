//! Host-platform seams.
//!
//! The extension never talks to a database, a secret store, a
//! scheduler, or the chat surface directly; it goes through these
//! narrow capabilities supplied by the embedding platform. Scheduler
//! fires travel the other way: the host pushes them into
//! [`crate::supervisor::Supervisor::on_scheduler_fire`].

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::types::Profile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Options for [`Storage::find`]. Sorting compares the named top-level
/// field; numbers sort numerically, everything else as strings.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Document KV store. One instance per user scope; a separate
/// extension-scoped instance holds the `users` registry collection.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, coll: &str, id: &str) -> Result<Option<Value>>;
    async fn put(&self, coll: &str, id: &str, doc: Value) -> Result<()>;
    /// Atomic conditional insert: stores `doc` iff no document with
    /// `id` exists, returning whether the insert happened. This is the
    /// primitive the exactly-once claim is built on.
    async fn put_if_absent(&self, coll: &str, id: &str, doc: Value) -> Result<bool>;
    async fn delete(&self, coll: &str, id: &str) -> Result<()>;
    /// Equality match on the top-level fields of `query`.
    async fn find(&self, coll: &str, query: Value, opts: FindOptions) -> Result<Vec<Value>>;
    async fn find_one(&self, coll: &str, query: Value) -> Result<Option<Value>>;
    async fn delete_many(&self, coll: &str, query: Value) -> Result<u64>;
}

/// Per-user secret vault.
#[async_trait]
pub trait SecretVault: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum Schedule {
    Interval(Duration),
    Cron(String),
    At(DateTime<Utc>),
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: String,
    pub schedule: Schedule,
    pub user_id: String,
}

/// Fire payload delivered by the host. `user_id` may be absent on
/// older hosts; the supervisor then recovers it from the job id.
#[derive(Debug, Clone)]
pub struct JobFire {
    pub job_id: String,
    pub user_id: Option<String>,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn schedule(&self, job: JobSpec) -> Result<()>;
    async fn cancel(&self, job_id: &str) -> Result<()>;
}

/// The conversational surface. Fire-and-forget from the ingestion
/// path: a failed post is logged, never rolled back.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn append_instruction(&self, user_id: &str, text: &str) -> Result<()>;
}

/// State-change events surfaced back to the host UI.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, name: &str, payload: Value);
}

#[async_trait]
pub trait UserProfiles: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>>;
}

/// The bundle of host capabilities handed to the extension at boot.
pub trait Host: Send + Sync {
    fn user_storage(&self, user_id: &str) -> Arc<dyn Storage>;
    fn user_secrets(&self, user_id: &str) -> Arc<dyn SecretVault>;
    fn extension_storage(&self) -> Arc<dyn Storage>;
    fn scheduler(&self) -> Arc<dyn Scheduler>;
    fn chat(&self) -> Arc<dyn ChatSink>;
    fn events(&self) -> Arc<dyn EventSink>;
    fn profiles(&self) -> Arc<dyn UserProfiles>;
}

/// Emit a `mail.*.changed` event with the standard `{at}` payload.
pub async fn emit_changed(events: &dyn EventSink, name: &str) {
    events
        .emit(name, serde_json::json!({ "at": Utc::now().to_rfc3339() }))
        .await;
}
