//! Supervisor: extension lifecycle.
//!
//! Boots one ingestion worker and one poll job per registered user,
//! dispatches scheduler fires, reacts to account add/edit/delete, and
//! drains everything on shutdown. Also owns the two pieces of
//! process-lifetime state: the initialized-account set and the
//! per-user edit-state map.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actions::EditStateMap;
use crate::error::Result;
use crate::host::{Host, JobFire, JobSpec, Schedule};
use crate::imap::{ImapMailboxes, MailboxBackend};
use crate::ingest::{self, UserContext, WorkerConfig, WorkerControl, WorkerHandle};
use crate::oauth::OAuthClientSettings;
use crate::store::{accounts, registry};

const POLL_JOB_PREFIX: &str = "mailfeed-poll-";
const POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Extension storage document holding the provider-global OAuth
/// client registration.
const OAUTH_SETTINGS_COLL: &str = "settings";
const OAUTH_SETTINGS_ID: &str = "oauth-clients";

pub struct Supervisor {
    host: Arc<dyn Host>,
    oauth: OAuthClientSettings,
    config: WorkerConfig,
    mailboxes: Arc<dyn MailboxBackend>,
    workers: tokio::sync::Mutex<HashMap<String, WorkerHandle>>,
    initialized: Arc<Mutex<HashSet<String>>>,
    pub(crate) edit: Mutex<EditStateMap>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Boot the extension: load OAuth client configuration, then start
    /// a worker and a poll job for every registered user.
    pub async fn activate(host: Arc<dyn Host>) -> Result<Arc<Self>> {
        Self::activate_with(host, WorkerConfig::default(), Arc::new(ImapMailboxes)).await
    }

    pub async fn activate_with(
        host: Arc<dyn Host>,
        config: WorkerConfig,
        mailboxes: Arc<dyn MailboxBackend>,
    ) -> Result<Arc<Self>> {
        let oauth = load_oauth_settings(host.as_ref()).await;

        let supervisor = Arc::new(Self {
            host,
            oauth,
            config,
            mailboxes,
            workers: tokio::sync::Mutex::new(HashMap::new()),
            initialized: Arc::new(Mutex::new(HashSet::new())),
            edit: Mutex::new(EditStateMap::default()),
            shutdown: CancellationToken::new(),
        });

        let users = registry::list(supervisor.host.extension_storage().as_ref()).await?;
        info!(users = users.len(), "activating mail ingestion");
        for user_id in users {
            supervisor.start_user(&user_id).await;
        }
        Ok(supervisor)
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn oauth_settings(&self) -> &OAuthClientSettings {
        &self.oauth
    }

    pub fn user_context(&self, user_id: &str) -> UserContext {
        UserContext::new(
            self.host.as_ref(),
            user_id,
            self.oauth.clone(),
            self.mailboxes.clone(),
            self.initialized.clone(),
        )
    }

    /// Ensure a worker and a poll job exist for the user. Idempotent.
    pub async fn start_user(&self, user_id: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        {
            let mut workers = self.workers.lock().await;
            if !workers.contains_key(user_id) {
                let handle = ingest::spawn_worker(
                    self.user_context(user_id),
                    self.config.clone(),
                    &self.shutdown,
                );
                workers.insert(user_id.to_string(), handle);
                debug!(user_id, "started ingestion worker");
            }
        }
        let job = JobSpec {
            id: poll_job_id(user_id),
            schedule: Schedule::Interval(POLL_INTERVAL),
            user_id: user_id.to_string(),
        };
        if let Err(e) = self.host.scheduler().schedule(job).await {
            warn!(user_id, error = %e, "failed to schedule poll job");
        }
    }

    /// Stop the user's worker and cancel their poll job.
    pub async fn stop_user(&self, user_id: &str) {
        let handle = self.workers.lock().await.remove(user_id);
        if let Some(handle) = handle {
            handle.stop().await;
            debug!(user_id, "stopped ingestion worker");
        }
        if let Err(e) = self.host.scheduler().cancel(&poll_job_id(user_id)).await {
            warn!(user_id, error = %e, "failed to cancel poll job");
        }
    }

    pub async fn worker_running(&self, user_id: &str) -> bool {
        self.workers.lock().await.contains_key(user_id)
    }

    /// Account added or edited: register the user, make sure their
    /// worker runs, and restart the account's IDLE session.
    pub async fn on_account_saved(&self, user_id: &str, account_id: &str) {
        if let Err(e) =
            registry::register(self.host.extension_storage().as_ref(), user_id).await
        {
            warn!(user_id, error = %e, "failed to register user");
        }
        self.start_user(user_id).await;
        if let Some(handle) = self.workers.lock().await.get(user_id) {
            handle.send_control(WorkerControl::RestartAccount(account_id.to_string()));
        }
    }

    /// Account deleted: stop its session; when the user has no
    /// accounts left, unregister them and tear the worker down.
    pub async fn on_account_deleted(&self, user_id: &str, account_id: &str) {
        if let Some(handle) = self.workers.lock().await.get(user_id) {
            handle.send_control(WorkerControl::StopAccount(account_id.to_string()));
        }
        let storage = self.host.user_storage(user_id);
        match accounts::list(storage.as_ref()).await {
            Ok(remaining) if remaining.is_empty() => {
                if let Err(e) =
                    registry::unregister(self.host.extension_storage().as_ref(), user_id).await
                {
                    warn!(user_id, error = %e, "failed to unregister user");
                }
                self.stop_user(user_id).await;
            }
            Ok(_) => {}
            Err(e) => warn!(user_id, error = %e, "failed to list accounts after delete"),
        }
    }

    /// Scheduler fire: the periodic fallback that backstops IDLE.
    /// Drives the normal ingestion path for every enabled account of
    /// the user; the claim keeps concurrent IDLE deliveries unique.
    pub async fn on_scheduler_fire(&self, fire: JobFire) {
        let Some(user_id) = fire
            .user_id
            .clone()
            .or_else(|| fire.job_id.strip_prefix(POLL_JOB_PREFIX).map(str::to_string))
        else {
            warn!(job_id = %fire.job_id, "scheduler fire without a resolvable user");
            return;
        };
        if self.shutdown.is_cancelled() {
            return;
        }
        debug!(user_id = %user_id, "poll tick");

        let ctx = self.user_context(&user_id);
        let enabled = match accounts::list_enabled(ctx.storage.as_ref()).await {
            Ok(enabled) => enabled,
            Err(e) => {
                error!(user_id = %user_id, error = %e, "poll failed to list accounts");
                return;
            }
        };
        for account in enabled {
            if let Err(e) = ingest::ingest_via_imap(&ctx, &account.id, self.config.fetch_limit).await
            {
                warn!(
                    user_id = %user_id,
                    account_id = %account.id,
                    error = %e,
                    "poll ingestion failed"
                );
                let _ = accounts::set_last_error(ctx.storage.as_ref(), &account.id, &e.to_string())
                    .await;
            }
        }
    }

    /// Shut everything down: cancel worker contexts, drain IDLE
    /// sessions, cancel poll jobs. Idempotent.
    pub async fn dispose(&self) {
        info!("disposing mail ingestion");
        self.shutdown.cancel();
        let drained: Vec<(String, WorkerHandle)> =
            self.workers.lock().await.drain().collect();
        for (user_id, handle) in drained {
            handle.stop().await;
            if let Err(e) = self.host.scheduler().cancel(&poll_job_id(&user_id)).await {
                warn!(user_id = %user_id, error = %e, "failed to cancel poll job");
            }
        }
    }
}

pub fn poll_job_id(user_id: &str) -> String {
    format!("{POLL_JOB_PREFIX}{user_id}")
}

async fn load_oauth_settings(host: &dyn Host) -> OAuthClientSettings {
    match host
        .extension_storage()
        .get(OAUTH_SETTINGS_COLL, OAUTH_SETTINGS_ID)
        .await
    {
        Ok(Some(doc)) => serde_json::from_value(doc).unwrap_or_else(|e| {
            warn!(error = %e, "malformed oauth client settings, using defaults");
            OAuthClientSettings::default()
        }),
        Ok(None) => OAuthClientSettings::default(),
        Err(e) => {
            warn!(error = %e, "failed to load oauth client settings");
            OAuthClientSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryHost;

    #[tokio::test]
    async fn activate_starts_workers_and_poll_jobs_for_registered_users() {
        let host = Arc::new(MemoryHost::new());
        registry::register(host.extension_storage().as_ref(), "alice")
            .await
            .unwrap();
        registry::register(host.extension_storage().as_ref(), "bob")
            .await
            .unwrap();

        let supervisor = Supervisor::activate(host.clone()).await.unwrap();
        assert!(supervisor.worker_running("alice").await);
        assert!(supervisor.worker_running("bob").await);
        {
            let jobs = host.scheduler.jobs.lock().unwrap();
            assert!(jobs.contains_key(&poll_job_id("alice")));
            assert!(jobs.contains_key(&poll_job_id("bob")));
        }

        supervisor.dispose().await;
        assert!(!supervisor.worker_running("alice").await);
        assert!(host.scheduler.jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_user_is_idempotent() {
        let host = Arc::new(MemoryHost::new());
        let supervisor = Supervisor::activate(host.clone()).await.unwrap();
        supervisor.start_user("alice").await;
        supervisor.start_user("alice").await;
        assert!(supervisor.worker_running("alice").await);
        assert_eq!(host.scheduler.jobs.lock().unwrap().len(), 1);
        supervisor.dispose().await;
    }

    #[tokio::test]
    async fn fire_user_resolution_falls_back_to_job_id() {
        let host = Arc::new(MemoryHost::new());
        let supervisor = Supervisor::activate(host.clone()).await.unwrap();
        // No accounts: the fire resolves the user and finds nothing to
        // ingest; it must not panic or hang.
        supervisor
            .on_scheduler_fire(JobFire {
                job_id: poll_job_id("alice"),
                user_id: None,
            })
            .await;
        supervisor.dispose().await;
    }
}
