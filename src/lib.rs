//! mailfeed - email ingestion extension
//!
//! Watches a user's IMAP mailboxes (iCloud, Gmail, Outlook, generic
//! IMAP) over long-lived IDLE connections, backstopped by a periodic
//! poll, and delivers each newly received message exactly once as a
//! formatted instruction to the host's conversational agent.
//!
//! ## Module Organization
//!
//! - `supervisor`: lifecycle: boot, per-user workers, poll jobs, shutdown
//! - `ingest/`: per-user worker, claim-then-deliver pipeline, formatter
//! - `imap/`: connector, fetch path, IDLE session state machine
//! - `oauth`: OAuth2 device-authorization grant + token refresh
//! - `providers`: per-provider endpoints and credential rules
//! - `store/`: typed accessors over the host document store and vault
//! - `commands/`: the `mail_*` tool surface
//! - `actions`: host UI actions and the in-flight edit state
//! - `host/`: the narrow interfaces the embedding platform implements
//! - `parser`: RFC-822 source to plain-text email
//!
//! The host boots the extension with [`Supervisor::activate`], routes
//! scheduler fires into [`Supervisor::on_scheduler_fire`], dispatches
//! tools through [`commands::dispatch`] and UI actions through
//! [`actions::handle_action`], and tears down with
//! [`Supervisor::dispose`].

pub mod actions;
pub mod commands;
pub mod error;
pub mod host;
pub mod imap;
pub mod ingest;
pub mod oauth;
pub mod parser;
pub mod providers;
pub mod retry;
pub mod store;
pub mod supervisor;
pub mod types;

pub use error::{MailError, Result};
pub use supervisor::Supervisor;
