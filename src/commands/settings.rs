//! Settings tools.

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::host::emit_changed;
use crate::store::settings;
use crate::supervisor::Supervisor;

use super::opt_str_param;

pub async fn get(supervisor: &Arc<Supervisor>, user_id: &str) -> Result<Value> {
    let storage = supervisor.host().user_storage(user_id);
    let settings = settings::get(storage.as_ref()).await?;
    Ok(serde_json::to_value(settings)?)
}

pub async fn update(supervisor: &Arc<Supervisor>, user_id: &str, params: &Value) -> Result<Value> {
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
