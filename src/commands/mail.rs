//! Read-path tools over a live connection.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{MailError, Result};
use crate::imap::ImapConnector;
use crate::providers;
use crate::store::accounts;
use crate::supervisor::Supervisor;
use crate::types::FetchedEmail;

use super::{opt_u64_param, str_param};

const DEFAULT_RECENT_LIMIT: usize = 10;

async fn open_connector(
    supervisor: &Arc<Supervisor>,
    user_id: &str,
    account_id: &str,
) -> Result<ImapConnector> {
    let storage = supervisor.host().user_storage(user_id);
    let secrets = supervisor.host().user_secrets(user_id);
    let account = accounts::require(storage.as_ref(), account_id).await?;
    let creds = accounts::require_credentials(secrets.as_ref(), account_id).await?;
    let (creds, refreshed) =
        providers::ensure_fresh(supervisor.oauth_settings(), &account, creds).await?;
    if refreshed {
        accounts::store_credentials(secrets.as_ref(), account_id, &creds).await?;
    }
    Ok(ImapConnector::new(providers::connection_params(
        &account, &creds,
    )?))
}

fn summary(email: &FetchedEmail) -> Value {
    json!({
        "uid": email.uid,
        "message_id": email.message_id,
        "from": email.email.from_addr,
        "from_name": email.email.from_name,
        "subject": email.email.subject,
        "date": email.email.date.map(|d| d.to_rfc3339()),
    })
}

pub async fn list_recent(
    supervisor: &Arc<Supervisor>,
    user_id: &str,
    params: &Value,
) -> Result<Value> {
    let account_id = str_param(params, "account_id")?;
    let limit = opt_u64_param(params, "limit").unwrap_or(DEFAULT_RECENT_LIMIT as u64) as usize;

    let mut conn = open_connector(supervisor, user_id, &account_id).await?;
    let result = conn.list_recent(limit).await;
    conn.logout().await;

    let emails = result?;
    Ok(Value::Array(emails.iter().map(summary).collect()))
}

pub async fn get(supervisor: &Arc<Supervisor>, user_id: &str, params: &Value) -> Result<Value> {
    let account_id = str_param(params, "account_id")?;
    let uid = opt_u64_param(params, "uid")
        .ok_or_else(|| MailError::Config("missing parameter: uid".into()))? as u32;

    let mut conn = open_connector(supervisor, user_id, &account_id).await?;
    let result = conn.fetch_by_uid(uid).await;
    conn.logout().await;

    match result? {
        Some(email) => Ok(json!({
            "uid": email.uid,
            "message_id": email.message_id,
            "from": email.email.from_addr,
            "from_name": email.email.from_name,
            "to": email.email.to,
            "subject": email.email.subject,
            "date": email.email.date.map(|d| d.to_rfc3339()),
            "body": email.email.body,
        })),
        None => Err(MailError::Other(format!("message {uid} not found"))),
    }
}
