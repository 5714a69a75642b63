//! Data model: accounts, credentials, parsed mail, settings.
//!
//! Every persisted document serializes through serde with ISO-8601
//! string timestamps. Credentials never appear inside the account
//! document; they live in the host secret vault keyed by account id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MailError;

/// Mail provider tag. Fixed providers carry their endpoints as data
/// (see [`crate::providers`]); `Imap` is the generic escape hatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Icloud,
    Gmail,
    Outlook,
    Imap,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Icloud => "icloud",
            Provider::Gmail => "gmail",
            Provider::Outlook => "outlook",
            Provider::Imap => "imap",
        }
    }

    /// Providers that authenticate with XOAUTH2 bearer tokens.
    pub fn uses_oauth(&self) -> bool {
        matches!(self, Provider::Gmail | Provider::Outlook)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    Ssl,
    Starttls,
    None,
}

impl Default for Security {
    fn default() -> Self {
        Security::Ssl
    }
}

/// Auth discriminator stored on the account; must match the type of
/// the credentials in the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Password,
    Oauth2,
}

/// One watched mailbox. Stored in the per-user `accounts` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub provider: Provider,
    pub name: String,
    pub email: String,
    /// Host/port/security are only meaningful for `Provider::Imap`;
    /// fixed providers ignore them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imap_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imap_port: Option<u16>,
    #[serde(default)]
    pub security: Security,
    pub auth: AuthKind,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Account {
    pub fn new(provider: Provider, name: &str, email: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider,
            name: name.to_string(),
            email: email.to_string(),
            imap_host: None,
            imap_port: None,
            security: Security::Ssl,
            auth: if provider.uses_oauth() {
                AuthKind::Oauth2
            } else {
                AuthKind::Password
            },
            enabled: true,
            created_at: Utc::now(),
            last_sync: None,
            last_error: None,
        }
    }

    /// Model invariants: generic IMAP needs a host, Gmail/Outlook need
    /// OAuth2, iCloud needs an app-specific password.
    pub fn validate(&self) -> Result<(), MailError> {
        match self.provider {
            Provider::Imap => {
                if self.imap_host.as_deref().unwrap_or("").is_empty() {
                    return Err(MailError::Config(
                        "generic IMAP account requires a host".into(),
                    ));
                }
            }
            Provider::Gmail | Provider::Outlook => {
                if self.auth != AuthKind::Oauth2 {
                    return Err(MailError::Config(format!(
                        "{} accounts require oauth2 authentication",
                        self.provider.as_str()
                    )));
                }
            }
            Provider::Icloud => {
                if self.auth != AuthKind::Password {
                    return Err(MailError::Config(
                        "icloud accounts require an app-specific password".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Credentials sum type, stored JSON-encoded in the secret vault
/// under `account-<id>-credentials`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Credentials {
    Password {
        username: String,
        password: String,
    },
    Oauth2 {
        access_token: String,
        refresh_token: String,
        expires_at: DateTime<Utc>,
    },
}

impl Credentials {
    pub fn kind(&self) -> AuthKind {
        match self {
            Credentials::Password { .. } => AuthKind::Password,
            Credentials::Oauth2 { .. } => AuthKind::Oauth2,
        }
    }
}

/// Result of parsing one RFC-822 message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedEmail {
    pub from_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    /// Plain-text body after transfer decoding and HTML stripping.
    pub body: String,
}

/// One message as pulled from the server: UID plus parsed content.
#[derive(Debug, Clone)]
pub struct FetchedEmail {
    pub uid: u32,
    pub message_id: String,
    pub email: ParsedEmail,
}

/// Exactly-once ledger row, one per (account, message-id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub account_id: String,
    pub message_id: String,
    pub uid: u32,
    pub processed_at: DateTime<Utc>,
}

/// Per-user settings. Created lazily on first read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Free-form prompt appended to every delivered email.
    #[serde(default)]
    pub instruction: String,
}

/// Optional user profile used only for delivery formatting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_imap_requires_host() {
        let mut account = Account::new(Provider::Imap, "Work", "me@corp.example");
        assert!(account.validate().is_err());
        account.imap_host = Some("mail.corp.example".into());
        assert!(account.validate().is_ok());
    }

    #[test]
    fn oauth_providers_reject_password_auth() {
        let mut account = Account::new(Provider::Gmail, "Personal", "me@gmail.com");
        assert_eq!(account.auth, AuthKind::Oauth2);
        assert!(account.validate().is_ok());
        account.auth = AuthKind::Password;
        assert!(account.validate().is_err());
    }

    #[test]
    fn icloud_requires_password() {
        let mut account = Account::new(Provider::Icloud, "Me", "me@icloud.com");
        assert!(account.validate().is_ok());
        account.auth = AuthKind::Oauth2;
        assert!(account.validate().is_err());
    }

    #[test]
    fn credentials_roundtrip_tagged_json() {
        let creds = Credentials::Password {
            username: "me@icloud.com".into(),
            password: "abcd-efgh-ijkl-mnop".into(),
        };
        let json = serde_json::to_string(&creds).unwrap();
        assert!(json.contains("\"type\":\"password\""));
        let back: Credentials = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), AuthKind::Password);
    }

    #[test]
    fn account_document_omits_credentials() {
        let account = Account::new(Provider::Icloud, "Me", "me@icloud.com");
        let doc = serde_json::to_value(&account).unwrap();
        assert!(doc.get("password").is_none());
        assert!(doc.get("access_token").is_none());
        assert!(doc.get("created_at").unwrap().is_string());
    }
}
