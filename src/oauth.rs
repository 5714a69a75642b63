//! OAuth 2.0 Device Authorization Grant (RFC 8628).
//!
//! Keeps the XOAUTH2 IDLE sessions authenticated: device-code
//! initiation for first-time account linking, pending-authorization
//! polling, and refresh-token exchange for the 30-minute refresh loop.
//! Gmail requires a client secret; Outlook authorizes public clients
//! against a tenant (default `common`).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::Provider;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_POLL_ITERATIONS: u32 = 60;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("OAuth configuration error: {0}")]
    Configuration(String),

    #[error("OAuth request failed: {0}")]
    Request(String),

    #[error("Authorization failed: {error}: {description}")]
    Authorization { error: String, description: String },

    #[error("Authorization timed out waiting for the user")]
    AuthorizationTimeout,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
}

/// Provider-global client registration, loaded from host settings at
/// boot.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct OAuthClientSettings {
    #[serde(default)]
    pub gmail_client_id: String,
    #[serde(default)]
    pub gmail_client_secret: String,
    #[serde(default)]
    pub outlook_client_id: String,
    /// Azure AD tenant; `common` for multi-tenant consumer apps.
    #[serde(default)]
    pub outlook_tenant: Option<String>,
}

/// Resolved endpoints + client for one provider.
#[derive(Debug, Clone)]
pub struct DeviceFlowConfig {
    pub device_endpoint: String,
    pub token_endpoint: String,
    pub scope: String,
    pub client_id: String,
    pub client_secret: Option<String>,
}

impl DeviceFlowConfig {
    pub fn for_provider(
        provider: Provider,
        settings: &OAuthClientSettings,
    ) -> Result<Self, OAuthError> {
        match provider {
            Provider::Gmail => {
                if settings.gmail_client_id.is_empty() || settings.gmail_client_secret.is_empty() {
                    return Err(OAuthError::Configuration(
                        "gmail client id and secret are not configured".into(),
                    ));
                }
                Ok(Self {
                    device_endpoint: "https://oauth2.googleapis.com/device/code".into(),
                    token_endpoint: "https://oauth2.googleapis.com/token".into(),
                    scope: "https://mail.google.com/".into(),
                    client_id: settings.gmail_client_id.clone(),
                    client_secret: Some(settings.gmail_client_secret.clone()),
                })
            }
            Provider::Outlook => {
                if settings.outlook_client_id.is_empty() {
                    return Err(OAuthError::Configuration(
                        "outlook client id is not configured".into(),
                    ));
                }
                let tenant = settings
                    .outlook_tenant
                    .clone()
                    .unwrap_or_else(|| "common".into());
                Ok(Self {
                    device_endpoint: format!(
                        "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/devicecode"
                    ),
                    token_endpoint: format!(
                        "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token"
                    ),
                    scope: "https://outlook.office.com/IMAP.AccessAsUser.All offline_access"
                        .into(),
                    client_id: settings.outlook_client_id.clone(),
                    client_secret: None,
                })
            }
            other => Err(OAuthError::Configuration(format!(
                "provider {} does not use oauth2",
                other.as_str()
            ))),
        }
    }
}

/// Response of the device-code initiation call.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_expires_in() -> u64 {
    900
}

fn default_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub token_type: String,
}

impl TokenResponse {
    /// Absolute expiry for storage alongside the tokens.
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(self.expires_in as i64)
    }
}

/// One poll of the token endpoint during the device flow.
#[derive(Debug)]
pub enum PollStatus {
    Authorized(TokenResponse),
    /// `authorization_pending`: the user has not finished yet.
    Pending,
    /// `slow_down`: keep polling, at a gentler pace.
    SlowDown,
}

pub fn http_client() -> Result<reqwest::Client, OAuthError> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| OAuthError::Configuration(e.to_string()))
}

/// Start a device-code flow: returns the user code and verification
/// URI to display, plus the device code to poll with.
pub async fn initiate(
    client: &reqwest::Client,
    config: &DeviceFlowConfig,
) -> Result<DeviceAuthorization, OAuthError> {
    debug!(endpoint = %config.device_endpoint, "initiating device authorization");

    let response = client
        .post(&config.device_endpoint)
        .form(&[
            ("client_id", config.client_id.as_str()),
            ("scope", config.scope.as_str()),
        ])
        .send()
        .await
        .map_err(|e| OAuthError::Request(e.to_string()))?;

    if !response.status().is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(OAuthError::Request(format!(
            "device authorization rejected: {text}"
        )));
    }

    response
        .json()
        .await
        .map_err(|e| OAuthError::Request(format!("bad device authorization response: {e}")))
}

/// Single poll of the token endpoint with the device code.
pub async fn poll_once(
    client: &reqwest::Client,
    config: &DeviceFlowConfig,
    device_code: &str,
) -> Result<PollStatus, OAuthError> {
    let mut params = vec![
        ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
        ("device_code", device_code),
        ("client_id", config.client_id.as_str()),
    ];
    if let Some(secret) = &config.client_secret {
        params.push(("client_secret", secret.as_str()));
    }

    let response = client
        .post(&config.token_endpoint)
        .form(&params)
        .send()
        .await
        .map_err(|e| OAuthError::Request(e.to_string()))?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| OAuthError::Request(format!("bad token response: {e}")))?;

    interpret_poll_body(status.is_success(), &body)
}

/// Shared interpretation of a device-flow token response body.
fn interpret_poll_body(success: bool, body: &Value) -> Result<PollStatus, OAuthError> {
    if success {
        let token: TokenResponse = serde_json::from_value(body.clone())
            .map_err(|e| OAuthError::Request(format!("bad token response: {e}")))?;
        return Ok(PollStatus::Authorized(token));
    }
    match body.get("error").and_then(Value::as_str) {
        Some("authorization_pending") => Ok(PollStatus::Pending),
        Some("slow_down") => Ok(PollStatus::SlowDown),
        Some(error) => Err(OAuthError::Authorization {
            error: error.to_string(),
            description: body
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        }),
        None => Err(OAuthError::Request(format!(
            "token endpoint returned an unrecognised error: {body}"
        ))),
    }
}

/// Poll until the user authorizes, the server reports a fatal error,
/// or 60 iterations elapse (~5 minutes at the default interval).
pub async fn poll_until_authorized(
    client: &reqwest::Client,
    config: &DeviceFlowConfig,
    authorization: &DeviceAuthorization,
) -> Result<TokenResponse, OAuthError> {
    let mut interval = Duration::from_secs(authorization.interval.max(1));

    for iteration in 0..MAX_POLL_ITERATIONS {
        tokio::time::sleep(interval).await;
        match poll_once(client, config, &authorization.device_code).await? {
            PollStatus::Authorized(token) => {
                debug!(iteration, "device authorization granted");
                return Ok(token);
            }
            PollStatus::Pending => {}
            PollStatus::SlowDown => {
                interval += Duration::from_secs(5);
            }
        }
    }
    Err(OAuthError::AuthorizationTimeout)
}

/// Exchange a refresh token for a fresh access token. When the server
/// omits a rotated refresh token the incoming one is carried forward.
pub async fn refresh(
    client: &reqwest::Client,
    config: &DeviceFlowConfig,
    refresh_token: &str,
) -> Result<TokenResponse, OAuthError> {
    let mut params = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", config.client_id.as_str()),
    ];
    if let Some(secret) = &config.client_secret {
        params.push(("client_secret", secret.as_str()));
    }

    debug!(endpoint = %config.token_endpoint, "refreshing access token");

    let response = client
        .post(&config.token_endpoint)
        .form(&params)
        .send()
        .await
        .map_err(|e| OAuthError::Request(e.to_string()))?;

    if !response.status().is_success() {
        let text = response.text().await.unwrap_or_default();
        warn!("token refresh rejected: {text}");
        return Err(OAuthError::RefreshFailed(text));
    }

    let mut token: TokenResponse = response
        .json()
        .await
        .map_err(|e| OAuthError::RefreshFailed(e.to_string()))?;

    if token.refresh_token.is_none() {
        token.refresh_token = Some(refresh_token.to_string());
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings() -> OAuthClientSettings {
        OAuthClientSettings {
            gmail_client_id: "gid".into(),
            gmail_client_secret: "gsecret".into(),
            outlook_client_id: "oid".into(),
            outlook_tenant: None,
        }
    }

    #[test]
    fn gmail_config_carries_secret_and_scope() {
        let config = DeviceFlowConfig::for_provider(Provider::Gmail, &settings()).unwrap();
        assert_eq!(config.device_endpoint, "https://oauth2.googleapis.com/device/code");
        assert_eq!(config.scope, "https://mail.google.com/");
        assert_eq!(config.client_secret.as_deref(), Some("gsecret"));
    }

    #[test]
    fn outlook_defaults_to_common_tenant_without_secret() {
        let config = DeviceFlowConfig::for_provider(Provider::Outlook, &settings()).unwrap();
        assert!(config.device_endpoint.contains("/common/"));
        assert!(config.scope.contains("offline_access"));
        assert!(config.client_secret.is_none());
    }

    #[test]
    fn password_providers_have_no_flow() {
        assert!(DeviceFlowConfig::for_provider(Provider::Icloud, &settings()).is_err());
        assert!(DeviceFlowConfig::for_provider(Provider::Imap, &settings()).is_err());
    }

    #[test]
    fn pending_and_slow_down_are_not_fatal() {
        let pending = interpret_poll_body(false, &json!({"error": "authorization_pending"}));
        assert!(matches!(pending, Ok(PollStatus::Pending)));

        let slow = interpret_poll_body(false, &json!({"error": "slow_down"}));
        assert!(matches!(slow, Ok(PollStatus::SlowDown)));
    }

    #[test]
    fn other_errors_are_fatal() {
        let denied = interpret_poll_body(
            false,
            &json!({"error": "access_denied", "error_description": "user said no"}),
        );
        match denied {
            Err(OAuthError::Authorization { error, description }) => {
                assert_eq!(error, "access_denied");
                assert_eq!(description, "user said no");
            }
            other => panic!("expected fatal authorization error, got {other:?}"),
        }
    }

    #[test]
    fn successful_body_parses_into_token() {
        let ok = interpret_poll_body(
            true,
            &json!({"access_token": "at", "refresh_token": "rt", "expires_in": 3600, "token_type": "Bearer"}),
        );
        match ok {
            Ok(PollStatus::Authorized(token)) => {
                assert_eq!(token.access_token, "at");
                assert_eq!(token.refresh_token.as_deref(), Some("rt"));
                let remaining = token.expires_at() - Utc::now();
                assert!(remaining > chrono::Duration::minutes(59));
            }
            other => panic!("expected authorized, got {other:?}"),
        }
    }
}
