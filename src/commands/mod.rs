//! Tool surface exposed to the host.
//!
//! Nine stable command names, each returning
//! `{"success": true, "data": …}` or `{"success": false, "error": …}`.
//! Every tool requires a present user id.

mod accounts;
mod mail;
mod settings;

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::error::{MailError, Result};
use crate::supervisor::Supervisor;

pub fn ok(data: Value) -> Value {
    json!({ "success": true, "data": data })
}

pub fn err(message: &str) -> Value {
    json!({ "success": false, "error": message })
}

pub fn str_param(params: &Value, name: &str) -> Result<String> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| MailError::Config(format!("missing parameter: {name}")))
}

pub fn opt_str_param(params: &Value, name: &str) -> Option<String> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub fn opt_u64_param(params: &Value, name: &str) -> Option<u64> {
    params.get(name).and_then(Value::as_u64)
}

pub fn opt_bool_param(params: &Value, name: &str) -> Option<bool> {
    params.get(name).and_then(Value::as_bool)
}

/// Route one tool invocation.
pub async fn dispatch(
    supervisor: &Arc<Supervisor>,
    user_id: Option<&str>,
    tool: &str,
    params: Value,
) -> Value {
    let Some(user_id) = user_id.filter(|u| !u.is_empty()) else {
        return err("user id is required");
    };
    debug!(user_id, tool, "tool invocation");

    let result = match tool {
        "mail_accounts_list" => accounts::list(supervisor, user_id).await,
        "mail_accounts_add" => accounts::add(supervisor, user_id, &params).await,
        "mail_accounts_update" => accounts::update(supervisor, user_id, &params).await,
        "mail_accounts_delete" => accounts::delete(supervisor, user_id, &params).await,
        "mail_accounts_test" => accounts::test(supervisor, user_id, &params).await,
        "mail_list_recent" => mail::list_recent(supervisor, user_id, &params).await,
        "mail_get" => mail::get(supervisor, user_id, &params).await,
        "mail_settings_get" => settings::get(supervisor, user_id).await,
        "mail_settings_update" => settings::update(supervisor, user_id, &params).await,
        other => Err(MailError::Config(format!("unknown tool: {other}"))),
    };
    match result {
        Ok(data) => ok(data),
        Err(e) => err(&e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryHost;

    #[tokio::test]
    async fn missing_user_id_is_rejected() {
        let host = Arc::new(MemoryHost::new());
        let supervisor = Supervisor::activate(host).await.unwrap();

        let out = dispatch(&supervisor, None, "mail_accounts_list", json!({})).await;
        assert_eq!(out["success"], false);
        assert!(out["error"].as_str().unwrap().contains("user id"));

        let out = dispatch(&supervisor, Some(""), "mail_accounts_list", json!({})).await;
        assert_eq!(out["success"], false);
        supervisor.dispose().await;
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_envelope() {
        let host = Arc::new(MemoryHost::new());
        let supervisor = Supervisor::activate(host).await.unwrap();
        let out = dispatch(&supervisor, Some("alice"), "mail_frobnicate", json!({})).await;
        assert_eq!(out["success"], false);
        supervisor.dispose().await;
    }
}
