//! Provider adapter: per-provider connection parameters and the
//! token-refresh capability.
//!
//! The fixed providers carry their endpoints as data; there is no
//! inheritance, just a match over the tag. Credential/provider
//! mismatches fail fast before any socket is opened.

use chrono::Utc;
use tracing::info;

use crate::error::{MailError, Result};
use crate::oauth::{self, DeviceFlowConfig, OAuthClientSettings};
use crate::types::{Account, Credentials, Provider, Security};

/// Refresh when the token has less than this many seconds left.
const REFRESH_BUFFER_SECS: i64 = 300;

/// Everything the connector needs to dial one mailbox.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub security: Security,
    pub auth: SessionAuth,
}

#[derive(Debug, Clone)]
pub enum SessionAuth {
    Login { username: String, password: String },
    XOAuth2 { user: String, access_token: String },
}

fn fixed_endpoint(provider: Provider) -> Option<(&'static str, u16)> {
    match provider {
        Provider::Icloud => Some(("imap.mail.me.com", 993)),
        Provider::Gmail => Some(("imap.gmail.com", 993)),
        Provider::Outlook => Some(("outlook.office365.com", 993)),
        Provider::Imap => None,
    }
}

/// Build connection parameters for an account, enforcing the
/// credential-type invariants of the data model.
pub fn connection_params(account: &Account, creds: &Credentials) -> Result<ConnectionParams> {
    if creds.kind() != account.auth {
        return Err(MailError::Config(format!(
            "credential type mismatch for account {}: account expects {:?}",
            account.id, account.auth
        )));
    }

    let (host, port, security) = match fixed_endpoint(account.provider) {
        Some((host, port)) => (host.to_string(), port, Security::Ssl),
        None => {
            let host = account
                .imap_host
                .clone()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| {
                    MailError::Config("generic IMAP account requires a host".into())
                })?;
            (host, account.imap_port.unwrap_or(993), account.security)
        }
    };

    let auth = match creds {
        Credentials::Password { username, password } => {
            if account.provider.uses_oauth() {
                return Err(MailError::Config(format!(
                    "{} requires oauth2 credentials",
                    account.provider.as_str()
                )));
            }
            SessionAuth::Login {
                username: username.clone(),
                password: password.clone(),
            }
        }
        Credentials::Oauth2 { access_token, .. } => {
            if !account.provider.uses_oauth() {
                return Err(MailError::Config(format!(
                    "{} requires password credentials",
                    account.provider.as_str()
                )));
            }
            SessionAuth::XOAuth2 {
                user: account.email.clone(),
                access_token: access_token.clone(),
            }
        }
    };

    Ok(ConnectionParams {
        host,
        port,
        security,
        auth,
    })
}

/// True when the credentials will expire within the 5-minute buffer.
/// Password credentials never need refreshing.
pub fn needs_refresh(creds: &Credentials) -> bool {
    match creds {
        Credentials::Password { .. } => false,
        Credentials::Oauth2 { expires_at, .. } => {
            Utc::now() >= *expires_at - chrono::Duration::seconds(REFRESH_BUFFER_SECS)
        }
    }
}

/// Return credentials that are safe to open a session with. Fresh
/// credentials are returned unchanged (`refreshed = false`, no vault
/// write expected of the caller); stale OAuth2 credentials are
/// exchanged at the provider's token endpoint.
pub async fn ensure_fresh(
    settings: &OAuthClientSettings,
    account: &Account,
    creds: Credentials,
) -> Result<(Credentials, bool)> {
    if !needs_refresh(&creds) {
        return Ok((creds, false));
    }
    let Credentials::Oauth2 { refresh_token, .. } = &creds else {
        return Ok((creds, false));
    };

    let config = DeviceFlowConfig::for_provider(account.provider, settings)
        .map_err(|e| MailError::OAuth(e.to_string()))?;
    let client = oauth::http_client().map_err(|e| MailError::OAuth(e.to_string()))?;
    let token = oauth::refresh(&client, &config, refresh_token)
        .await
        .map_err(|e| MailError::OAuth(e.to_string()))?;

    info!(
        account_id = %account.id,
        provider = account.provider.as_str(),
        "refreshed oauth2 credentials"
    );

    let refreshed = Credentials::Oauth2 {
        access_token: token.access_token.clone(),
        refresh_token: token
            .refresh_token
            .clone()
            .unwrap_or_else(|| refresh_token.clone()),
        expires_at: token.expires_at(),
    };
    Ok((refreshed, true))
}
