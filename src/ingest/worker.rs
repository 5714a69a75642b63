//! Per-user ingestion worker.
//!
//! Supervises one IDLE session per enabled account plus a 30-minute
//! token-refresh loop, and consumes new-mail events. The same
//! ingestion path also serves scheduler poll fires; the exactly-once
//! contract rests on the claim, not on serialising the two.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::host::{ChatSink, Host, SecretVault, Storage, UserProfiles};
use crate::imap::fetch::DEFAULT_FETCH_LIMIT;
use crate::imap::idle::{IdleConfig, IdleSessionHandle, SessionEvent};
use crate::imap::{MailSource, MailboxBackend};
use crate::oauth::OAuthClientSettings;
use crate::providers;
use crate::store::{accounts, processed, settings};
use crate::types::{Account, Credentials};

use super::delivery;

/// Everything the ingestion path needs for one user, shareable across
/// the worker task and poll fires.
#[derive(Clone)]
pub struct UserContext {
    pub user_id: String,
    pub storage: Arc<dyn Storage>,
    pub secrets: Arc<dyn SecretVault>,
    pub chat: Arc<dyn ChatSink>,
    pub profiles: Arc<dyn UserProfiles>,
    pub oauth: OAuthClientSettings,
    pub mailboxes: Arc<dyn MailboxBackend>,
    /// Accounts already baseline-resynced in this process lifetime.
    pub initialized: Arc<Mutex<HashSet<String>>>,
}

impl UserContext {
    pub fn new(
        host: &dyn Host,
        user_id: &str,
        oauth: OAuthClientSettings,
        mailboxes: Arc<dyn MailboxBackend>,
        initialized: Arc<Mutex<HashSet<String>>>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            storage: host.user_storage(user_id),
            secrets: host.user_secrets(user_id),
            chat: host.chat(),
            profiles: host.profiles(),
            oauth,
            mailboxes,
            initialized,
        }
    }

    fn is_initialized(&self, account_id: &str) -> bool {
        self.initialized.lock().unwrap().contains(account_id)
    }

    fn mark_initialized(&self, account_id: &str) {
        self.initialized
            .lock()
            .unwrap()
            .insert(account_id.to_string());
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub refresh_interval: Duration,
    pub idle: IdleConfig,
    pub fetch_limit: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30 * 60),
            idle: IdleConfig::default(),
            fetch_limit: DEFAULT_FETCH_LIMIT,
        }
    }
}

/// Runtime control messages from the supervisor.
#[derive(Debug)]
pub enum WorkerControl {
    /// Account added or edited: (re)start its IDLE session.
    RestartAccount(String),
    /// Account deleted or disabled: stop its IDLE session.
    StopAccount(String),
}

pub struct WorkerHandle {
    pub user_id: String,
    cancel: CancellationToken,
    control: flume::Sender<WorkerControl>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn send_control(&self, control: WorkerControl) {
        let _ = self.control.send(control);
    }

    /// Cancel and wait for the drain (IDLE LOGOUTs included).
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

pub fn spawn_worker(
    ctx: UserContext,
    config: WorkerConfig,
    parent: &CancellationToken,
) -> WorkerHandle {
    let cancel = parent.child_token();
    let (control_tx, control_rx) = flume::unbounded();
    let user_id = ctx.user_id.clone();
    let join = tokio::spawn(run_worker(ctx, config, cancel.clone(), control_rx));
    WorkerHandle {
        user_id,
        cancel,
        control: control_tx,
        join,
    }
}

async fn run_worker(
    ctx: UserContext,
    config: WorkerConfig,
    cancel: CancellationToken,
    control_rx: flume::Receiver<WorkerControl>,
) {
    info!(user_id = %ctx.user_id, "ingestion worker starting");

    let (event_tx, event_rx) = flume::unbounded::<SessionEvent>();
    let mut sessions: HashMap<String, IdleSessionHandle> = HashMap::new();

    match accounts::list_enabled(ctx.storage.as_ref()).await {
        Ok(enabled) => {
            for account in enabled {
                if let Some(handle) =
                    start_session(&ctx, &account.id, &event_tx, &cancel, &config.idle).await
                {
                    sessions.insert(account.id.clone(), handle);
                }
            }
        }
        Err(e) => error!(user_id = %ctx.user_id, error = %e, "failed to load accounts"),
    }

    let mut refresh = tokio::time::interval(config.refresh_interval);
    refresh.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = event_rx.recv_async() => match event {
                Ok(SessionEvent::NewMail { account_id }) => {
                    if let Err(e) = ingest_via_imap(&ctx, &account_id, config.fetch_limit).await {
                        warn!(
                            user_id = %ctx.user_id,
                            account_id = %account_id,
                            error = %e,
                            "ingestion failed"
                        );
                        let _ = accounts::set_last_error(
                            ctx.storage.as_ref(),
                            &account_id,
                            &e.to_string(),
                        )
                        .await;
                    }
                }
                Ok(SessionEvent::Dead { account_id, error }) => {
                    // Left down until the next worker restart or an
                    // explicit account edit.
                    warn!(
                        user_id = %ctx.user_id,
                        account_id = %account_id,
                        error = %error,
                        "IDLE session dead"
                    );
                    sessions.remove(&account_id);
                    let _ = accounts::set_last_error(ctx.storage.as_ref(), &account_id, &error)
                        .await;
                }
                // Unreachable while the worker holds its own sender.
                Err(_) => break,
            },

            msg = control_rx.recv_async() => {
                if let Ok(control) = msg {
                    apply_control(&ctx, control, &mut sessions, &event_tx, &cancel, &config).await;
                }
            }

            _ = refresh.tick() => {
                refresh_pass(&ctx, &mut sessions, &event_tx, &cancel, &config).await;
            }
        }
    }

    info!(user_id = %ctx.user_id, "ingestion worker draining");
    for (_, session) in sessions.drain() {
        session.stop().await;
    }
}

async fn apply_control(
    ctx: &UserContext,
    control: WorkerControl,
    sessions: &mut HashMap<String, IdleSessionHandle>,
    event_tx: &flume::Sender<SessionEvent>,
    cancel: &CancellationToken,
    config: &WorkerConfig,
) {
    match control {
        WorkerControl::RestartAccount(account_id) => {
            if let Some(existing) = sessions.remove(&account_id) {
                existing.stop().await;
            }
            if let Some(handle) =
                start_session(ctx, &account_id, event_tx, cancel, &config.idle).await
            {
                sessions.insert(account_id, handle);
            }
        }
        WorkerControl::StopAccount(account_id) => {
            if let Some(existing) = sessions.remove(&account_id) {
                existing.stop().await;
            }
        }
    }
}

/// Hand one account to a fresh monitor through the mailbox backend.
/// The monitor resyncs on connect, so starting a session is what
/// establishes the baseline for a new account. Failures are recorded
/// on the account and leave it without a session.
async fn start_session(
    ctx: &UserContext,
    account_id: &str,
    event_tx: &flume::Sender<SessionEvent>,
    cancel: &CancellationToken,
    idle_config: &IdleConfig,
) -> Option<IdleSessionHandle> {
    let account = match accounts::get(ctx.storage.as_ref(), account_id).await {
        Ok(Some(account)) if account.enabled => account,
        Ok(_) => return None,
        Err(e) => {
            warn!(account_id, error = %e, "failed to load account");
            return None;
        }
    };

    let creds = match fresh_credentials(ctx, &account).await {
        Ok(creds) => creds,
        Err(e) => {
            warn!(account_id, error = %e, "failed to prepare credentials");
            let _ = accounts::set_last_error(ctx.storage.as_ref(), account_id, &e.to_string())
                .await;
            return None;
        }
    };

    debug!(account_id, "starting IDLE session");
    match ctx
        .mailboxes
        .start_monitor(&account, &creds, event_tx.clone(), cancel, idle_config)
    {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(account_id, error = %e, "failed to start monitor");
            let _ = accounts::set_last_error(ctx.storage.as_ref(), account_id, &e.to_string())
                .await;
            None
        }
    }
}

/// Load credentials and refresh them when close to expiry, persisting
/// the rotation.
async fn fresh_credentials(ctx: &UserContext, account: &Account) -> Result<Credentials> {
    let creds = accounts::require_credentials(ctx.secrets.as_ref(), &account.id).await?;
    let (creds, refreshed) = providers::ensure_fresh(&ctx.oauth, account, creds).await?;
    if refreshed {
        accounts::store_credentials(ctx.secrets.as_ref(), &account.id, &creds).await?;
    }
    Ok(creds)
}

/// Token-refresh loop body: refresh every OAuth2 account inside the
/// expiry buffer, then tear down and restart its IDLE session with
/// the new token. A failed refresh keeps the stale session; the
/// server will drop it eventually and the session machine reconnects.
async fn refresh_pass(
    ctx: &UserContext,
    sessions: &mut HashMap<String, IdleSessionHandle>,
    event_tx: &flume::Sender<SessionEvent>,
    cancel: &CancellationToken,
    config: &WorkerConfig,
) {
    let account_ids: Vec<String> = sessions.keys().cloned().collect();
    for account_id in account_ids {
        let creds = match accounts::load_credentials(ctx.secrets.as_ref(), &account_id).await {
            Ok(Some(creds)) => creds,
            Ok(None) => continue,
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "failed to read credentials");
                continue;
            }
        };
        if !providers::needs_refresh(&creds) {
            continue;
        }
        let account = match accounts::get(ctx.storage.as_ref(), &account_id).await {
            Ok(Some(account)) => account,
            _ => continue,
        };
        match providers::ensure_fresh(&ctx.oauth, &account, creds).await {
            Ok((fresh, true)) => {
                if let Err(e) =
                    accounts::store_credentials(ctx.secrets.as_ref(), &account_id, &fresh).await
                {
                    warn!(account_id = %account_id, error = %e, "failed to persist tokens");
                    continue;
                }
                info!(account_id = %account_id, "restarting IDLE with refreshed token");
                if let Some(existing) = sessions.remove(&account_id) {
                    existing.stop().await;
                }
                if let Some(handle) =
                    start_session(ctx, &account_id, event_tx, cancel, &config.idle).await
                {
                    sessions.insert(account_id, handle);
                }
            }
            Ok((_, false)) => {}
            Err(e) => {
                // Retried on the next tick.
                warn!(account_id = %account_id, error = %e, "token refresh failed");
            }
        }
    }
}

/// Open a short-lived fetch source and run the ingestion path for
/// one account. Monitors keep exclusive ownership of their own
/// sockets, so fetching always opens its own.
pub async fn ingest_via_imap(ctx: &UserContext, account_id: &str, limit: usize) -> Result<usize> {
    let Some(account) = accounts::get(ctx.storage.as_ref(), account_id).await? else {
        return Ok(0);
    };
    if !account.enabled {
        return Ok(0);
    }
    let creds = fresh_credentials(ctx, &account).await?;
    let mut source = ctx.mailboxes.open_source(&account, &creds)?;
    let outcome = ingest_account(ctx, account_id, source.as_mut(), limit).await;
    source.close().await;
    outcome
}

/// The ingestion path proper: baseline and session-restart rules,
/// then claim-then-deliver in ascending UID order. Returns the number
/// of delivered instructions.
pub async fn ingest_account(
    ctx: &UserContext,
    account_id: &str,
    source: &mut dyn MailSource,
    limit: usize,
) -> Result<usize> {
    // Re-load: the account may have been disabled or deleted since
    // the event fired.
    let Some(account) = accounts::get(ctx.storage.as_ref(), account_id).await? else {
        return Ok(0);
    };
    if !account.enabled {
        return Ok(0);
    }

    let since = processed::watermark(ctx.storage.as_ref(), account_id).await?;

    // Baseline on first ever connect (watermark 0) and on the first
    // event after process start: advance the watermark to the current
    // top of the mailbox without notifying, so neither inbox history
    // nor downtime backlog is replayed.
    if since == 0 || !ctx.is_initialized(account_id) {
        let emails = source.fetch_since(since, limit).await?;
        if let Some(top) = emails.last() {
            processed::mark_processed(ctx.storage.as_ref(), account_id, &top.message_id, top.uid)
                .await?;
            debug!(
                account_id,
                uid = top.uid,
                fresh = since == 0,
                "baseline watermark set"
            );
        }
        ctx.mark_initialized(account_id);
        accounts::set_last_sync(ctx.storage.as_ref(), account_id).await?;
        return Ok(0);
    }

    let emails = source.fetch_since(since, limit).await?;
    if emails.is_empty() {
        accounts::set_last_sync(ctx.storage.as_ref(), account_id).await?;
        return Ok(0);
    }

    let user_settings = settings::get(ctx.storage.as_ref()).await?;
    let timezone = match ctx.profiles.get_profile(&ctx.user_id).await {
        Ok(Some(profile)) => delivery::parse_timezone(profile.timezone.as_deref()),
        _ => None,
    };

    let mut delivered = 0usize;
    for email in &emails {
        let claimed =
            processed::try_claim(ctx.storage.as_ref(), account_id, &email.message_id, email.uid)
                .await?;
        if !claimed {
            // Another claimer (poll vs IDLE race) won; skip silently.
            continue;
        }
        let text =
            delivery::format_instruction(email, &account, &user_settings.instruction, timezone);
        delivery::deliver(ctx.chat.as_ref(), &ctx.user_id, &text).await;
        delivered += 1;
    }

    accounts::set_last_sync(ctx.storage.as_ref(), account_id).await?;
    debug!(account_id, delivered, "ingestion pass complete");
    Ok(delivered)
}
