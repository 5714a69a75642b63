//! Account management tools.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::info;

use crate::error::{MailError, Result};
use crate::host::emit_changed;
use crate::imap::ImapConnector;
use crate::providers;
use crate::store::{accounts, registry};
use crate::supervisor::Supervisor;
use crate::types::{Account, AuthKind, Credentials, Provider, Security};

use super::{opt_bool_param, opt_str_param, opt_u64_param, str_param};

fn parse_provider(tag: &str) -> Result<Provider> {
    match tag {
        "icloud" => Ok(Provider::Icloud),
        "gmail" => Ok(Provider::Gmail),
        "outlook" => Ok(Provider::Outlook),
        "imap" => Ok(Provider::Imap),
        other => Err(MailError::Config(format!("unknown provider: {other}"))),
    }
}

fn parse_security(tag: &str) -> Result<Security> {
    match tag {
        "ssl" => Ok(Security::Ssl),
        "starttls" => Ok(Security::Starttls),
        "none" => Ok(Security::None),
        other => Err(MailError::Config(format!("unknown security mode: {other}"))),
    }
}

pub async fn list(supervisor: &Arc<Supervisor>, user_id: &str) -> Result<Value> {
    let storage = supervisor.host().user_storage(user_id);
    let list = accounts::list(storage.as_ref()).await?;
    // Self-healing: observing accounts re-registers the user.
    if list.iter().any(|a| a.enabled) {
        registry::register(supervisor.host().extension_storage().as_ref(), user_id).await?;
    }
    Ok(serde_json::to_value(list)?)
}

pub async fn add(supervisor: &Arc<Supervisor>, user_id: &str, params: &Value) -> Result<Value> {
    let provider = parse_provider(&str_param(params, "provider")?)?;
    let email = str_param(params, "email")?;
    let name = opt_str_param(params, "name").unwrap_or_else(|| email.clone());

    let mut account = Account::new(provider, &name, &email);
    if provider == Provider::Imap {
        account.imap_host = opt_str_param(params, "host");
        account.imap_port = opt_u64_param(params, "port").map(|p| p as u16);
        if let Some(security) = opt_str_param(params, "security") {
            account.security = parse_security(&security)?;
        }
    }
    if let Some(enabled) = opt_bool_param(params, "enabled") {
        account.enabled = enabled;
    }
    account.validate()?;

    let creds = match account.auth {
        AuthKind::Password => Credentials::Password {
            username: opt_str_param(params, "username").unwrap_or_else(|| email.clone()),
            password: str_param(params, "password")?,
        },
        AuthKind::Oauth2 => {
            // Admin path for pre-obtained tokens; end users go through
            // the startOAuth device flow instead.
            let refresh_token = str_param(params, "refresh_token").map_err(|_| {
                MailError::Config(
                    "oauth2 accounts need a refresh_token, or use the startOAuth flow".into(),
                )
            })?;
            Credentials::Oauth2 {
                access_token: opt_str_param(params, "access_token").unwrap_or_default(),
                refresh_token,
                // Forces a refresh before first use.
                expires_at: Utc::now(),
            }
        }
    };

    let storage = supervisor.host().user_storage(user_id);
    let secrets = supervisor.host().user_secrets(user_id);
    accounts::store_credentials(secrets.as_ref(), &account.id, &creds).await?;
    accounts::put(storage.as_ref(), &account).await?;

    supervisor.on_account_saved(user_id, &account.id).await;
    emit_changed(supervisor.host().events().as_ref(), "mail.account.changed").await;
    info!(user_id, account_id = %account.id, provider = provider.as_str(), "account added");
    Ok(serde_json::to_value(account)?)
}

pub async fn update(supervisor: &Arc<Supervisor>, user_id: &str, params: &Value) -> Result<Value> {
    let account_id = str_param(params, "id")?;
    let storage = supervisor.host().user_storage(user_id);
    let secrets = supervisor.host().user_secrets(user_id);
    let mut account = accounts::require(storage.as_ref(), &account_id).await?;

    if let Some(name) = opt_str_param(params, "name") {
        account.name = name;
    }
    if let Some(email) = opt_str_param(params, "email") {
        account.email = email;
    }
    if let Some(host) = opt_str_param(params, "host") {
        account.imap_host = Some(host);
    }
    if let Some(port) = opt_u64_param(params, "port") {
        account.imap_port = Some(port as u16);
    }
    if let Some(security) = opt_str_param(params, "security") {
        account.security = parse_security(&security)?;
    }
    let enabled_change = opt_bool_param(params, "enabled");
    if let Some(enabled) = enabled_change {
        account.enabled = enabled;
    }
    account.validate()?;

    if let Some(password) = opt_str_param(params, "password") {
        if account.auth != AuthKind::Password {
            return Err(MailError::Config(
                "this account does not use password authentication".into(),
            ));
        }
        let username = opt_str_param(params, "username").unwrap_or_else(|| account.email.clone());
        accounts::store_credentials(
            secrets.as_ref(),
            &account.id,
            &Credentials::Password { username, password },
        )
        .await?;
    }

    accounts::put(storage.as_ref(), &account).await?;

    if account.enabled {
        supervisor.on_account_saved(user_id, &account.id).await;
    } else {
        supervisor.on_account_deleted(user_id, &account.id).await;
    }
    emit_changed(supervisor.host().events().as_ref(), "mail.account.changed").await;
    Ok(serde_json::to_value(account)?)
}

pub async fn delete(supervisor: &Arc<Supervisor>, user_id: &str, params: &Value) -> Result<Value> {
    let account_id = str_param(params, "id")?;
    let storage = supervisor.host().user_storage(user_id);
    let secrets = supervisor.host().user_secrets(user_id);

    accounts::require(storage.as_ref(), &account_id).await?;
    accounts::delete(storage.as_ref(), secrets.as_ref(), &account_id).await?;
    supervisor.on_account_deleted(user_id, &account_id).await;
    emit_changed(supervisor.host().events().as_ref(), "mail.account.changed").await;
    info!(user_id, account_id = %account_id, "account deleted");
    Ok(Value::Null)
}

/// Connect, take the INBOX lock, disconnect. Auth failures surface
/// with the server's response text and land in `last_error`.
pub async fn test(supervisor: &Arc<Supervisor>, user_id: &str, params: &Value) -> Result<Value> {
    let account_id = str_param(params, "id")?;
    let storage = supervisor.host().user_storage(user_id);
    let secrets = supervisor.host().user_secrets(user_id);

    let account = accounts::require(storage.as_ref(), &account_id).await?;
    let creds = accounts::require_credentials(secrets.as_ref(), &account_id).await?;
    let (creds, refreshed) =
        providers::ensure_fresh(supervisor.oauth_settings(), &account, creds).await?;
    if refreshed {
        accounts::store_credentials(secrets.as_ref(), &account_id, &creds).await?;
    }

    let params = providers::connection_params(&account, &creds)?;
    let mut conn = ImapConnector::new(params);
    match conn.test().await {
        Ok(()) => {
            accounts::set_last_sync(storage.as_ref(), &account_id).await?;
            Ok(serde_json::json!({ "connected": true }))
        }
        Err(e) => {
            accounts::set_last_error(storage.as_ref(), &account_id, &e.to_string()).await?;
            Err(e)
        }
    }
}
