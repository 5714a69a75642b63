//! IMAP access layer: connector, fetch path, and the IDLE session
//! state machine.

pub mod connection;
pub mod fetch;
pub mod idle;

pub use connection::{ImapConnector, ImapSession};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::providers;
use crate::types::{Account, Credentials, FetchedEmail};

use idle::{spawn_idle_session, IdleConfig, IdleSessionHandle, SessionEvent};

/// Narrow mailbox-read capability consumed by the ingestion path.
/// The production implementation is [`ImapConnector`]; tests script
/// their own.
#[async_trait]
pub trait MailSource: Send {
    /// Messages with UID strictly greater than `since_uid`, ascending,
    /// capped to the most recent `limit`.
    async fn fetch_since(&mut self, since_uid: u32, limit: usize) -> Result<Vec<FetchedEmail>>;

    /// Release the underlying connection cleanly. Default: nothing to
    /// release.
    async fn close(&mut self) {}
}

/// How the ingestion worker reaches mailboxes: short-lived fetch
/// connections plus long-lived monitors that push [`SessionEvent`]s
/// until cancelled. The supervisor injects the backend, so everything
/// above this seam runs against scripted mailboxes in tests.
pub trait MailboxBackend: Send + Sync {
    fn open_source(&self, account: &Account, creds: &Credentials) -> Result<Box<dyn MailSource>>;

    fn start_monitor(
        &self,
        account: &Account,
        creds: &Credentials,
        events: flume::Sender<SessionEvent>,
        cancel: &CancellationToken,
        config: &IdleConfig,
    ) -> Result<IdleSessionHandle>;
}

/// Production backend: dials real IMAP connections.
pub struct ImapMailboxes;

impl MailboxBackend for ImapMailboxes {
    fn open_source(&self, account: &Account, creds: &Credentials) -> Result<Box<dyn MailSource>> {
        let params = providers::connection_params(account, creds)?;
        Ok(Box::new(ImapConnector::new(params)))
    }

    fn start_monitor(
        &self,
        account: &Account,
        creds: &Credentials,
        events: flume::Sender<SessionEvent>,
        cancel: &CancellationToken,
        config: &IdleConfig,
    ) -> Result<IdleSessionHandle> {
        let params = providers::connection_params(account, creds)?;
        Ok(spawn_idle_session(
            account.id.clone(),
            ImapConnector::new(params),
            events,
            cancel,
            config.clone(),
        ))
    }
}
