//! UI actions and the in-flight edit state.
//!
//! The host calls these synchronously from its settings surface. Edit
//! state is in-memory only, per user, and bounded: past 100 users the
//! oldest entry is evicted. The OAuth device flow started here runs
//! its polling loop in the background and reports through
//! `oauth_status`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::commands::{err, ok, opt_str_param, str_param};
use crate::error::{MailError, Result};
use crate::host::emit_changed;
use crate::imap::ImapConnector;
use crate::oauth::{self, DeviceFlowConfig};
use crate::providers;
use crate::store::{accounts, settings};
use crate::supervisor::Supervisor;
use crate::types::{Account, AuthKind, Credentials, Provider, Security};

const EDIT_STATE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthStatus {
    Idle,
    Pending,
    Connected,
    Failed,
}

impl Default for OAuthStatus {
    fn default() -> Self {
        OAuthStatus::Idle
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FormFields {
    pub provider: String,
    pub name: String,
    pub email: String,
    pub host: String,
    pub port: String,
    pub security: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EditState {
    pub open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editing_account_id: Option<String>,
    pub form: FormFields,
    pub oauth_status: OAuthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-user edit states with oldest-first eviction at capacity.
#[derive(Default)]
pub struct EditStateMap {
    states: HashMap<String, EditState>,
    order: VecDeque<String>,
}

impl EditStateMap {
    pub fn get(&self, user_id: &str) -> EditState {
        self.states.get(user_id).cloned().unwrap_or_default()
    }

    pub fn set(&mut self, user_id: &str, state: EditState) {
        if !self.states.contains_key(user_id) {
            self.order.push_back(user_id.to_string());
            if self.order.len() > EDIT_STATE_CAPACITY {
                if let Some(evicted) = self.order.pop_front() {
                    self.states.remove(&evicted);
                }
            }
        }
        self.states.insert(user_id.to_string(), state);
    }

    pub fn update(&mut self, user_id: &str, apply: impl FnOnce(&mut EditState)) -> EditState {
        let mut state = self.get(user_id);
        apply(&mut state);
        self.set(user_id, state.clone());
        state
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.states.len()
    }
}

/// Entry point for host UI actions.
pub async fn handle_action(
    supervisor: &Arc<Supervisor>,
    user_id: &str,
    action: &str,
    params: Value,
) -> Value {
    if user_id.is_empty() {
        return err("user id is required");
    }
    let result = match action {
        "getAccounts" => get_accounts(supervisor, user_id).await,
        "getEditState" => Ok(edit_state_value(supervisor, user_id)),
        "showAddForm" => show_add_form(supervisor, user_id).await,
        "editAccount" => edit_account(supervisor, user_id, &params).await,
        "closeModal" => close_modal(supervisor, user_id).await,
        "updateFormField" => update_form_field(supervisor, user_id, &params).await,
        "startOAuth" => start_oauth(supervisor, user_id).await,
        "testConnection" => test_connection(supervisor, user_id).await,
        "saveAccount" => save_account(supervisor, user_id).await,
        "deleteAccount" => delete_account(supervisor, user_id, &params).await,
        "getSettings" => get_settings(supervisor, user_id).await,
        "updateSetting" => update_setting(supervisor, user_id, &params).await,
        other => Err(MailError::Config(format!("unknown action: {other}"))),
    };
    match result {
        Ok(data) => ok(data),
        Err(e) => err(&e.to_string()),
    }
}

fn edit_state_value(supervisor: &Supervisor, user_id: &str) -> Value {
    let state = supervisor.edit.lock().unwrap().get(user_id);
    serde_json::to_value(state).unwrap_or(Value::Null)
}

async fn emit_edit_changed(supervisor: &Supervisor) {
    emit_changed(supervisor.host().events().as_ref(), "mail.edit.changed").await;
}

async fn get_accounts(supervisor: &Arc<Supervisor>, user_id: &str) -> Result<Value> {
    let storage = supervisor.host().user_storage(user_id);
    let list = accounts::list(storage.as_ref()).await?;
    Ok(serde_json::to_value(list)?)
}

async fn show_add_form(supervisor: &Arc<Supervisor>, user_id: &str) -> Result<Value> {
    let state = supervisor.edit.lock().unwrap().update(user_id, |state| {
        *state = EditState {
            open: true,
            form: FormFields {
                provider: "imap".into(),
                security: "ssl".into(),
                port: "993".into(),
                ..Default::default()
            },
            ..Default::default()
        };
    });
    emit_edit_changed(supervisor).await;
    Ok(serde_json::to_value(state)?)
}

async fn edit_account(supervisor: &Arc<Supervisor>, user_id: &str, params: &Value) -> Result<Value> {
    let account_id = str_param(params, "id")?;
    let storage = supervisor.host().user_storage(user_id);
    let account = accounts::require(storage.as_ref(), &account_id).await?;

    let state = supervisor.edit.lock().unwrap().update(user_id, |state| {
        *state = EditState {
            open: true,
            editing_account_id: Some(account.id.clone()),
            form: FormFields {
                provider: account.provider.as_str().into(),
                name: account.name.clone(),
                email: account.email.clone(),
                host: account.imap_host.clone().unwrap_or_default(),
                port: account
                    .imap_port
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
                security: match account.security {
                    Security::Ssl => "ssl".into(),
                    Security::Starttls => "starttls".into(),
                    Security::None => "none".into(),
                },
                username: String::new(),
                password: String::new(),
            },
            ..Default::default()
        };
    });
    emit_edit_changed(supervisor).await;
    Ok(serde_json::to_value(state)?)
}

async fn close_modal(supervisor: &Arc<Supervisor>, user_id: &str) -> Result<Value> {
    supervisor
        .edit
        .lock()
        .unwrap()
        .set(user_id, EditState::default());
    emit_edit_changed(supervisor).await;
    Ok(Value::Null)
}

async fn update_form_field(
    supervisor: &Arc<Supervisor>,
    user_id: &str,
    params: &Value,
) -> Result<Value> {
    let field = str_param(params, "field")?;
    let value = str_param(params, "value")?;
    let state = supervisor.edit.lock().unwrap().update(user_id, |state| {
        let form = &mut state.form;
        match field.as_str() {
            "provider" => form.provider = value.clone(),
            "name" => form.name = value.clone(),
            "email" => form.email = value.clone(),
            "host" => form.host = value.clone(),
            "port" => form.port = value.clone(),
            "security" => form.security = value.clone(),
            "username" => form.username = value.clone(),
            "password" => form.password = value.clone(),
            _ => {}
        }
    });
    emit_edit_changed(supervisor).await;
    Ok(serde_json::to_value(state)?)
}

fn parse_provider(tag: &str) -> Result<Provider> {
    match tag {
        "icloud" => Ok(Provider::Icloud),
        "gmail" => Ok(Provider::Gmail),
        "outlook" => Ok(Provider::Outlook),
        "imap" => Ok(Provider::Imap),
        other => Err(MailError::Config(format!("unknown provider: {other}"))),
    }
}

fn parse_security(tag: &str) -> Security {
    match tag {
        "starttls" => Security::Starttls,
        "none" => Security::None,
        _ => Security::Ssl,
    }
}

/// Build an account from the current form, carrying over identity and
/// history when editing.
fn account_from_form(state: &EditState, existing: Option<Account>) -> Result<Account> {
    let form = &state.form;
    let provider = parse_provider(&form.provider)?;
    if form.email.is_empty() {
        return Err(MailError::Config("email address is required".into()));
    }

    let mut account = match existing {
        Some(existing) => existing,
        None => Account::new(provider, &form.name, &form.email),
    };
    account.provider = provider;
    account.auth = if provider.uses_oauth() {
        AuthKind::Oauth2
    } else {
        AuthKind::Password
    };
    account.name = if form.name.is_empty() {
        form.email.clone()
    } else {
        form.name.clone()
    };
    account.email = form.email.clone();
    if provider == Provider::Imap {
        account.imap_host = Some(form.host.clone()).filter(|h| !h.is_empty());
        account.imap_port = form.port.parse().ok();
        account.security = parse_security(&form.security);
    }
    account.validate()?;
    Ok(account)
}

fn form_credentials(state: &EditState) -> Option<Credentials> {
    if state.form.password.is_empty() {
        return None;
    }
    let username = if state.form.username.is_empty() {
        state.form.email.clone()
    } else {
        state.form.username.clone()
    };
    Some(Credentials::Password {
        username,
        password: state.form.password.clone(),
    })
}

/// Start the device-code flow for the provider in the form. The
/// pending poll runs in the background; progress lands in the edit
/// state, and a success upserts the account and starts ingestion.
async fn start_oauth(supervisor: &Arc<Supervisor>, user_id: &str) -> Result<Value> {
    let state = supervisor.edit.lock().unwrap().get(user_id);
    let provider = parse_provider(&state.form.provider)?;
    if !provider.uses_oauth() {
        return Err(MailError::Config(format!(
            "{} does not use oauth2",
            provider.as_str()
        )));
    }
    if state.form.email.is_empty() {
        return Err(MailError::Config("email address is required".into()));
    }

    let config = DeviceFlowConfig::for_provider(provider, supervisor.oauth_settings())
        .map_err(|e| MailError::OAuth(e.to_string()))?;
    let client = oauth::http_client().map_err(|e| MailError::OAuth(e.to_string()))?;
    let authorization = oauth::initiate(&client, &config)
        .await
        .map_err(|e| MailError::OAuth(e.to_string()))?;

    let updated = supervisor.edit.lock().unwrap().update(user_id, |s| {
        s.oauth_status = OAuthStatus::Pending;
        s.user_code = Some(authorization.user_code.clone());
        s.verification_uri = Some(authorization.verification_uri.clone());
        s.error = None;
    });
    emit_edit_changed(supervisor).await;

    let supervisor = supervisor.clone();
    let user = user_id.to_string();
    let email = state.form.email.clone();
    let display_name = state.form.name.clone();
    tokio::spawn(async move {
        match oauth::poll_until_authorized(&client, &config, &authorization).await {
            Ok(token) => {
                if let Err(e) = complete_oauth(
                    &supervisor,
                    &user,
                    provider,
                    &email,
                    &display_name,
                    token,
                )
                .await
                {
                    warn!(user_id = %user, error = %e, "oauth completion failed");
                    supervisor.edit.lock().unwrap().update(&user, |s| {
                        s.oauth_status = OAuthStatus::Failed;
                        s.error = Some(e.to_string());
                    });
                }
            }
            Err(e) => {
                warn!(user_id = %user, error = %e, "device authorization failed");
                supervisor.edit.lock().unwrap().update(&user, |s| {
                    s.oauth_status = OAuthStatus::Failed;
                    s.error = Some(e.to_string());
                });
            }
        }
        emit_edit_changed(&supervisor).await;
    });

    Ok(serde_json::to_value(updated)?)
}

/// Upsert the account for a completed device flow and start its
/// ingestion.
async fn complete_oauth(
    supervisor: &Arc<Supervisor>,
    user_id: &str,
    provider: Provider,
    email: &str,
    display_name: &str,
    token: crate::oauth::TokenResponse,
) -> Result<()> {
    let storage = supervisor.host().user_storage(user_id);
    let secrets = supervisor.host().user_secrets(user_id);

    let existing = accounts::list(storage.as_ref())
        .await?
        .into_iter()
        .find(|a| a.provider == provider && a.email == email);
    let account = match existing {
        Some(account) => account,
        None => {
            let name = if display_name.is_empty() {
                email
            } else {
                display_name
            };
            Account::new(provider, name, email)
        }
    };

    let creds = Credentials::Oauth2 {
        access_token: token.access_token.clone(),
        refresh_token: token
            .refresh_token
            .clone()
            .ok_or_else(|| MailError::OAuth("authorization returned no refresh token".into()))?,
        expires_at: token.expires_at(),
    };
    accounts::store_credentials(secrets.as_ref(), &account.id, &creds).await?;
    accounts::put(storage.as_ref(), &account).await?;

    supervisor.on_account_saved(user_id, &account.id).await;
    supervisor.edit.lock().unwrap().update(user_id, |s| {
        s.oauth_status = OAuthStatus::Connected;
    });
    emit_changed(supervisor.host().events().as_ref(), "mail.account.changed").await;
    info!(user_id, account_id = %account.id, "oauth account connected");
    Ok(())
}

/// Probe the connection described by the form (or the stored
/// credentials when editing with the password left blank).
async fn test_connection(supervisor: &Arc<Supervisor>, user_id: &str) -> Result<Value> {
    let state = supervisor.edit.lock().unwrap().get(user_id);
    let storage = supervisor.host().user_storage(user_id);
    let secrets = supervisor.host().user_secrets(user_id);

    let existing = match &state.editing_account_id {
        Some(id) => accounts::get(storage.as_ref(), id).await?,
        None => None,
    };
    let account = account_from_form(&state, existing)?;

    let creds = match form_credentials(&state) {
        Some(creds) => creds,
        None => accounts::require_credentials(secrets.as_ref(), &account.id).await?,
    };
    let (creds, _) =
        providers::ensure_fresh(supervisor.oauth_settings(), &account, creds).await?;

    let params = providers::connection_params(&account, &creds)?;
    let mut conn = ImapConnector::new(params);
    match conn.test().await {
        Ok(()) => Ok(json!({ "connected": true })),
        Err(e) => {
            accounts::set_last_error(storage.as_ref(), &account.id, &e.to_string()).await.ok();
            Err(e)
        }
    }
}

async fn save_account(supervisor: &Arc<Supervisor>, user_id: &str) -> Result<Value> {
    let state = supervisor.edit.lock().unwrap().get(user_id);
    let storage = supervisor.host().user_storage(user_id);
    let secrets = supervisor.host().user_secrets(user_id);

    let existing = match &state.editing_account_id {
        Some(id) => accounts::get(storage.as_ref(), id).await?,
        None => None,
    };
    let is_new = existing.is_none();
    let account = account_from_form(&state, existing)?;

    if account.auth == AuthKind::Password {
        match form_credentials(&state) {
            Some(creds) => {
                accounts::store_credentials(secrets.as_ref(), &account.id, &creds).await?
            }
            None if is_new => {
                return Err(MailError::Config("password is required".into()));
            }
            None => {}
        }
    } else if is_new {
        // OAuth accounts come in through the device flow.
        return Err(MailError::Config(
            "use startOAuth to connect this provider".into(),
        ));
    }

    accounts::put(storage.as_ref(), &account).await?;
    supervisor.on_account_saved(user_id, &account.id).await;
    supervisor
        .edit
        .lock()
        .unwrap()
        .set(user_id, EditState::default());
    emit_changed(supervisor.host().events().as_ref(), "mail.account.changed").await;
    emit_edit_changed(supervisor).await;
    Ok(serde_json::to_value(account)?)
}

async fn delete_account(
    supervisor: &Arc<Supervisor>,
    user_id: &str,
    params: &Value,
) -> Result<Value> {
    let account_id = str_param(params, "id")?;
    let storage = supervisor.host().user_storage(user_id);
    let secrets = supervisor.host().user_secrets(user_id);

    accounts::require(storage.as_ref(), &account_id).await?;
    accounts::delete(storage.as_ref(), secrets.as_ref(), &account_id).await?;
    supervisor.on_account_deleted(user_id, &account_id).await;
    emit_changed(supervisor.host().events().as_ref(), "mail.account.changed").await;
    Ok(Value::Null)
}

async fn get_settings(supervisor: &Arc<Supervisor>, user_id: &str) -> Result<Value> {
    let storage = supervisor.host().user_storage(user_id);
    let settings = settings::get(storage.as_ref()).await?;
    Ok(serde_json::to_value(settings)?)
}

async fn update_setting(
    supervisor: &Arc<Supervisor>,
    user_id: &str,
    params: &Value,
) -> Result<Value> {
    let instruction = opt_str_param(params, "instruction").unwrap_or_default();
    let storage = supervisor.host().user_storage(user_id);
    let settings = settings::update_instruction(storage.as_ref(), &instruction).await?;
    emit_changed(
        supervisor.host().events().as_ref(),
        "mail.settings.changed",
    )
    .await;
    Ok(serde_json::to_value(settings)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edit_state_map_evicts_oldest_at_capacity() {
        let mut map = EditStateMap::default();
        for i in 0..(EDIT_STATE_CAPACITY + 10) {
            map.set(
                &format!("user-{i}"),
                EditState {
                    open: true,
                    ..Default::default()
                },
            );
        }
        assert_eq!(map.len(), EDIT_STATE_CAPACITY);
        // The earliest users were evicted, the latest kept.
        assert!(!map.get("user-0").open);
        assert!(map.get("user-109").open);
    }

    #[test]
    fn updating_existing_user_does_not_evict() {
        let mut map = EditStateMap::default();
        for i in 0..EDIT_STATE_CAPACITY {
            map.set(&format!("user-{i}"), EditState::default());
        }
        map.update("user-0", |s| s.open = true);
        assert_eq!(map.len(), EDIT_STATE_CAPACITY);
        assert!(map.get("user-0").open);
    }

    #[test]
    fn account_from_form_builds_generic_imap() {
        let state = EditState {
            form: FormFields {
                provider: "imap".into(),
                name: "Work".into(),
                email: "me@corp.example".into(),
                host: "mail.corp.example".into(),
                port: "143".into(),
                security: "starttls".into(),
                username: "me".into(),
                password: "pw".into(),
            },
            ..Default::default()
        };
        let account = account_from_form(&state, None).unwrap();
        assert_eq!(account.provider, Provider::Imap);
        assert_eq!(account.imap_host.as_deref(), Some("mail.corp.example"));
        assert_eq!(account.imap_port, Some(143));
        assert_eq!(account.security, Security::Starttls);

        let creds = form_credentials(&state).unwrap();
        match creds {
            Credentials::Password { username, .. } => assert_eq!(username, "me"),
            _ => panic!("expected password credentials"),
        }
    }

    #[test]
    fn account_from_form_requires_email_and_host() {
        let state = EditState {
            form: FormFields {
                provider: "imap".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(account_from_form(&state, None).is_err());
    }
}
