//! Account documents and their vault-held credentials.
//!
//! The account document never contains secrets; deleting an account
//! cascades to its credentials and processed rows.

use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::error::{MailError, Result};
use crate::host::{SecretVault, Storage};
use crate::types::{Account, Credentials};

use super::{processed, ACCOUNTS};

pub fn credentials_key(account_id: &str) -> String {
    format!("account-{account_id}-credentials")
}

pub async fn list(storage: &dyn Storage) -> Result<Vec<Account>> {
    let docs = storage
        .find(ACCOUNTS, json!({}), Default::default())
        .await?;
    let mut accounts = Vec::with_capacity(docs.len());
    for doc in docs {
        accounts.push(serde_json::from_value(doc)?);
    }
    Ok(accounts)
}

pub async fn list_enabled(storage: &dyn Storage) -> Result<Vec<Account>> {
    Ok(list(storage).await?.into_iter().filter(|a| a.enabled).collect())
}

pub async fn get(storage: &dyn Storage, account_id: &str) -> Result<Option<Account>> {
    match storage.get(ACCOUNTS, account_id).await? {
        Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
        None => Ok(None),
    }
}

pub async fn require(storage: &dyn Storage, account_id: &str) -> Result<Account> {
    get(storage, account_id)
        .await?
        .ok_or_else(|| MailError::AccountNotFound(account_id.to_string()))
}

pub async fn put(storage: &dyn Storage, account: &Account) -> Result<()> {
    storage
        .put(ACCOUNTS, &account.id, serde_json::to_value(account)?)
        .await
}

pub async fn set_last_sync(storage: &dyn Storage, account_id: &str) -> Result<()> {
    if let Some(mut account) = get(storage, account_id).await? {
        account.last_sync = Some(Utc::now());
        account.last_error = None;
        put(storage, &account).await?;
    }
    Ok(())
}

pub async fn set_last_error(storage: &dyn Storage, account_id: &str, error: &str) -> Result<()> {
    if let Some(mut account) = get(storage, account_id).await? {
        account.last_error = Some(error.to_string());
        put(storage, &account).await?;
    }
    Ok(())
}

/// Delete the account and everything keyed to it.
pub async fn delete(
    storage: &dyn Storage,
    vault: &dyn SecretVault,
    account_id: &str,
) -> Result<()> {
    storage.delete(ACCOUNTS, account_id).await?;
    vault.delete(&credentials_key(account_id)).await?;
    let removed = processed::delete_for_account(storage, account_id).await?;
    info!(account_id, removed_processed = removed, "deleted account");
    Ok(())
}

pub async fn load_credentials(
    vault: &dyn SecretVault,
    account_id: &str,
) -> Result<Option<Credentials>> {
    match vault.get(&credentials_key(account_id)).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn require_credentials(
    vault: &dyn SecretVault,
    account_id: &str,
) -> Result<Credentials> {
    load_credentials(vault, account_id).await?.ok_or_else(|| {
        MailError::Config(format!("no credentials stored for account {account_id}"))
    })
}

pub async fn store_credentials(
    vault: &dyn SecretVault,
    account_id: &str,
    creds: &Credentials,
) -> Result<()> {
    let raw = serde_json::to_string(creds)?;
    vault.set(&credentials_key(account_id), &raw).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::{MemoryStorage, MemoryVault};
    use crate::types::Provider;

    #[tokio::test]
    async fn roundtrip_and_cascade_delete() {
        let storage = MemoryStorage::new();
        let vault = MemoryVault::default();

        let account = Account::new(Provider::Icloud, "Me", "me@icloud.com");
        put(&storage, &account).await.unwrap();
        store_credentials(
            &vault,
            &account.id,
            &Credentials::Password {
                username: "me@icloud.com".into(),
                password: "secret".into(),
            },
        )
        .await
        .unwrap();
        processed::try_claim(&storage, &account.id, "<m1@x>", 10)
            .await
            .unwrap();

        assert!(get(&storage, &account.id).await.unwrap().is_some());
        assert!(load_credentials(&vault, &account.id).await.unwrap().is_some());

        delete(&storage, &vault, &account.id).await.unwrap();
        assert!(get(&storage, &account.id).await.unwrap().is_none());
        assert!(load_credentials(&vault, &account.id).await.unwrap().is_none());
        assert_eq!(processed::watermark(&storage, &account.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn last_sync_clears_last_error() {
        let storage = MemoryStorage::new();
        let mut account = Account::new(Provider::Icloud, "Me", "me@icloud.com");
        account.last_error = Some("boom".into());
        put(&storage, &account).await.unwrap();

        set_last_sync(&storage, &account.id).await.unwrap();
        let account = get(&storage, &account.id).await.unwrap().unwrap();
        assert!(account.last_sync.is_some());
        assert!(account.last_error.is_none());
    }
}
