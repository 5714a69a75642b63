//! Extension-scoped user registry.
//!
//! The set of user ids known to have at least one enabled account;
//! the authoritative source for boot-time worker launch. Registration
//! is self-healing: any tool invocation that observes accounts
//! re-registers the user.

use chrono::Utc;
use serde_json::json;
use tracing::debug;

use crate::error::Result;
use crate::host::Storage;

use super::USERS;

pub async fn register(storage: &dyn Storage, user_id: &str) -> Result<()> {
    let inserted = storage
        .put_if_absent(
            USERS,
            user_id,
            json!({ "user_id": user_id, "registered_at": Utc::now().to_rfc3339() }),
        )
        .await?;
    if inserted {
        debug!(user_id, "registered user");
    }
    Ok(())
}

pub async fn unregister(storage: &dyn Storage, user_id: &str) -> Result<()> {
    storage.delete(USERS, user_id).await?;
    debug!(user_id, "unregistered user");
    Ok(())
}

pub async fn list(storage: &dyn Storage) -> Result<Vec<String>> {
    let docs = storage.find(USERS, json!({}), Default::default()).await?;
    Ok(docs
        .into_iter()
        .filter_map(|doc| {
            doc.get("user_id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryStorage;

    #[tokio::test]
    async fn register_is_idempotent() {
        let storage = MemoryStorage::new();
        register(&storage, "alice").await.unwrap();
        register(&storage, "alice").await.unwrap();
        register(&storage, "bob").await.unwrap();

        let mut users = list(&storage).await.unwrap();
        users.sort();
        assert_eq!(users, vec!["alice", "bob"]);

        unregister(&storage, "alice").await.unwrap();
        assert_eq!(list(&storage).await.unwrap(), vec!["bob"]);
    }
}
