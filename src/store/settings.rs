//! Per-user settings: the instruction template appended to every
//! delivered email. Created lazily on first read.

use crate::error::Result;
use crate::host::Storage;
use crate::types::Settings;

use super::SETTINGS;

const DOC_ID: &str = "user";

pub async fn get(storage: &dyn Storage) -> Result<Settings> {
    match storage.get(SETTINGS, DOC_ID).await? {
        Some(doc) => Ok(serde_json::from_value(doc)?),
        None => {
            let settings = Settings::default();
            storage
                .put(SETTINGS, DOC_ID, serde_json::to_value(&settings)?)
                .await?;
            Ok(settings)
        }
    }
}

pub async fn update_instruction(storage: &dyn Storage, instruction: &str) -> Result<Settings> {
    let settings = Settings {
        instruction: instruction.to_string(),
    };
    storage
        .put(SETTINGS, DOC_ID, serde_json::to_value(&settings)?)
        .await?;
    Ok(settings)
}
