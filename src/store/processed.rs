//! Dedup / watermark store: the exactly-once boundary.
//!
//! One row per (account, message-id), keyed by a deterministic id so
//! the host's conditional put makes claims atomic across concurrent
//! claimers. Rows live until the owning account is deleted.

use chrono::Utc;
use serde_json::json;

use crate::error::Result;
use crate::host::{FindOptions, SortOrder, Storage};
use crate::types::ProcessedRecord;

use super::PROCESSED;

/// Deterministic document id for (account, message-id). Message-IDs
/// can contain characters the host store dislikes in ids, so they are
/// sanitized; the raw value stays in the document.
pub fn processed_id(account_id: &str, message_id: &str) -> String {
    let sanitized: String = message_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    format!("prc_{account_id}_{sanitized}")
}

/// Highest processed UID for the account, or 0 when nothing has been
/// processed (the uninitialised baseline).
pub async fn watermark(storage: &dyn Storage, account_id: &str) -> Result<u32> {
    let top = storage
        .find(
            PROCESSED,
            json!({ "account_id": account_id }),
            FindOptions {
                sort: Some(("uid".into(), SortOrder::Desc)),
                limit: Some(1),
                offset: None,
            },
        )
        .await?;
    Ok(top
        .first()
        .and_then(|doc| doc.get("uid"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32)
}

pub async fn is_processed(
    storage: &dyn Storage,
    account_id: &str,
    message_id: &str,
) -> Result<bool> {
    Ok(storage
        .get(PROCESSED, &processed_id(account_id, message_id))
        .await?
        .is_some())
}

fn record_doc(account_id: &str, message_id: &str, uid: u32) -> serde_json::Value {
    serde_json::to_value(ProcessedRecord {
        account_id: account_id.to_string(),
        message_id: message_id.to_string(),
        uid,
        processed_at: Utc::now(),
    })
    .unwrap_or_else(|_| json!({ "account_id": account_id, "message_id": message_id, "uid": uid }))
}

/// Idempotent insert: already-present rows are left untouched.
pub async fn mark_processed(
    storage: &dyn Storage,
    account_id: &str,
    message_id: &str,
    uid: u32,
) -> Result<()> {
    storage
        .put_if_absent(
            PROCESSED,
            &processed_id(account_id, message_id),
            record_doc(account_id, message_id, uid),
        )
        .await?;
    Ok(())
}

/// Atomic claim: true for exactly one caller per (account,
/// message-id); the winner delivers, losers skip silently.
pub async fn try_claim(
    storage: &dyn Storage,
    account_id: &str,
    message_id: &str,
    uid: u32,
) -> Result<bool> {
    storage
        .put_if_absent(
            PROCESSED,
            &processed_id(account_id, message_id),
            record_doc(account_id, message_id, uid),
        )
        .await
}

pub async fn delete_for_account(storage: &dyn Storage, account_id: &str) -> Result<u64> {
    storage
        .delete_many(PROCESSED, json!({ "account_id": account_id }))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryStorage;
    use std::sync::Arc;

    #[tokio::test]
    async fn watermark_is_max_uid_or_zero() {
        let storage = MemoryStorage::new();
        assert_eq!(watermark(&storage, "a").await.unwrap(), 0);

        mark_processed(&storage, "a", "<m10@x>", 10).await.unwrap();
        mark_processed(&storage, "a", "<m12@x>", 12).await.unwrap();
        mark_processed(&storage, "a", "<m11@x>", 11).await.unwrap();
        assert_eq!(watermark(&storage, "a").await.unwrap(), 12);

        // Other accounts never affect the watermark.
        mark_processed(&storage, "b", "<m99@x>", 99).await.unwrap();
        assert_eq!(watermark(&storage, "a").await.unwrap(), 12);
    }

    #[tokio::test]
    async fn claim_succeeds_exactly_once() {
        let storage = MemoryStorage::new();
        assert!(try_claim(&storage, "a", "<m1@x>", 1).await.unwrap());
        assert!(!try_claim(&storage, "a", "<m1@x>", 1).await.unwrap());
        assert!(is_processed(&storage, "a", "<m1@x>").await.unwrap());
        // Same message-id under a different account is a new claim.
        assert!(try_claim(&storage, "b", "<m1@x>", 1).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_claims_have_a_single_winner() {
        let storage = Arc::new(MemoryStorage::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                try_claim(storage.as_ref(), "a", "<m14@x>", 14).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn processed_id_is_deterministic_and_sanitized() {
        let a = processed_id("acct", "<m1@example.com>");
        let b = processed_id("acct", "<m1@example.com>");
        assert_eq!(a, b);
        assert!(a.starts_with("prc_acct_"));
        assert!(!a.contains('<'));
        assert!(!a.contains('@'));
    }
}
