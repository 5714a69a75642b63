//! IDLE session: one long-lived monitored connection per account.
//!
//! Keeps a live IDLE on INBOX, refreshes it before the server's
//! ~29-minute timeout, and reconnects with 5-second spacing on socket
//! errors. Every successful connect+select emits one synthetic
//! new-mail event so the consumer resyncs right away instead of
//! waiting for the next push. After five consecutive failed
//! reconnects the session reports itself dead and the account stays
//! down until the worker is restarted or the account is edited.

use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::MailError;

use super::connection::ImapConnector;

#[derive(Debug, Clone)]
pub struct IdleConfig {
    /// Re-issue IDLE after this long (before the server's ~29 min cap).
    pub refresh_after: Duration,
    /// Spacing between reconnect attempts.
    pub reconnect_wait: Duration,
    /// Consecutive reconnect failures tolerated before going dead.
    pub max_reconnect_attempts: u32,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            refresh_after: Duration::from_secs(25 * 60),
            reconnect_wait: Duration::from_secs(5),
            max_reconnect_attempts: 5,
        }
    }
}

/// Events surfaced to the ingestion worker. Duplicate `NewMail`
/// events are fine; dedup happens at the claim.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    NewMail { account_id: String },
    Dead { account_id: String, error: String },
}

pub struct IdleSessionHandle {
    pub account_id: String,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl IdleSessionHandle {
    /// Wrap an externally spawned monitor task. The task must honor
    /// `cancel` and exit promptly when it fires.
    pub fn new(account_id: String, cancel: CancellationToken, join: JoinHandle<()>) -> Self {
        Self {
            account_id,
            cancel,
            join,
        }
    }

    /// Request shutdown and wait for the LOGOUT to complete.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

pub fn spawn_idle_session(
    account_id: String,
    connector: ImapConnector,
    events: flume::Sender<SessionEvent>,
    parent: &CancellationToken,
    config: IdleConfig,
) -> IdleSessionHandle {
    let cancel = parent.child_token();
    let join = tokio::spawn(idle_session_loop(
        account_id.clone(),
        connector,
        events,
        cancel.clone(),
        config,
    ));
    IdleSessionHandle {
        account_id,
        cancel,
        join,
    }
}

/// Outcome of one idling round.
enum Round {
    Again,
    Reconnect(MailError),
}

async fn idle_session_loop(
    account_id: String,
    mut conn: ImapConnector,
    events: flume::Sender<SessionEvent>,
    cancel: CancellationToken,
    config: IdleConfig,
) {
    let mut reconnect_attempts: u32 = 0;

    'connect: loop {
        if cancel.is_cancelled() {
            conn.logout().await;
            return;
        }

        let setup_result = tokio::select! {
            _ = cancel.cancelled() => {
                conn.logout().await;
                return;
            }
            result = async {
                conn.connect().await?;
                conn.select_inbox().await
            } => result,
        };

        match setup_result {
            Ok(exists) => {
                info!(account_id = %account_id, exists, "IDLE session established");
                // Resync immediately: the first connect runs the
                // baseline rules, and a reconnect may have missed
                // pushes while the socket was down. Dedup is
                // downstream, so an extra event is harmless.
                let _ = events.send(SessionEvent::NewMail {
                    account_id: account_id.clone(),
                });
            }
            Err(error) => {
                conn.discard();
                reconnect_attempts += 1;
                warn!(
                    account_id = %account_id,
                    attempt = reconnect_attempts,
                    error = %error,
                    "IDLE session setup failed"
                );
                if reconnect_attempts > config.max_reconnect_attempts {
                    let _ = events.send(SessionEvent::Dead {
                        account_id,
                        error: error.to_string(),
                    });
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(config.reconnect_wait) => {}
                }
                continue 'connect;
            }
        }

        loop {
            let round = idle_round(&account_id, &mut conn, &events, &cancel, &config).await;
            match round {
                Some(Round::Again) => {
                    reconnect_attempts = 0;
                }
                Some(Round::Reconnect(error)) => {
                    conn.discard();
                    reconnect_attempts += 1;
                    warn!(
                        account_id = %account_id,
                        attempt = reconnect_attempts,
                        error = %error,
                        "IDLE dropped, reconnecting"
                    );
                    if reconnect_attempts > config.max_reconnect_attempts {
                        let _ = events.send(SessionEvent::Dead {
                            account_id,
                            error: error.to_string(),
                        });
                        return;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(config.reconnect_wait) => {}
                    }
                    continue 'connect;
                }
                // Cancelled: connection already drained.
                None => return,
            }
        }
    }
}

/// One IDLE round trip: enter IDLE, wait for new data, the refresh
/// deadline, or cancellation; leave IDLE cleanly. Returns `None` on
/// cancellation.
async fn idle_round(
    account_id: &str,
    conn: &mut ImapConnector,
    events: &flume::Sender<SessionEvent>,
    cancel: &CancellationToken,
    config: &IdleConfig,
) -> Option<Round> {
    let Some(session) = conn.take_session() else {
        return Some(Round::Reconnect(MailError::Protocol(
            "session lost before IDLE".into(),
        )));
    };

    let mut idle = session.idle();
    if let Err(e) = idle.init().await {
        if let Ok(session) = idle.done().await {
            conn.restore_session(session);
        }
        return Some(Round::Reconnect(MailError::Protocol(format!(
            "IDLE init failed: {e}"
        ))));
    }

    let (idle_wait, _stop) = idle.wait_with_timeout(config.refresh_after);

    tokio::select! {
        _ = cancel.cancelled() => {
            if let Ok(session) = idle.done().await {
                conn.restore_session(session);
            }
            conn.logout().await;
            None
        }
        outcome = idle_wait => {
            match idle.done().await {
                Ok(session) => conn.restore_session(session),
                Err(e) => {
                    return Some(Round::Reconnect(MailError::Network(format!(
                        "failed to end IDLE: {e}"
                    ))));
                }
            }
            match outcome {
                Ok(IdleResponse::NewData(_)) => {
                    debug!(account_id = %account_id, "IDLE reported new data");
                    let _ = events.send(SessionEvent::NewMail {
                        account_id: account_id.to_string(),
                    });
                    Some(Round::Again)
                }
                // Refresh deadline reached: DONE was sent above, the
                // next round re-enters IDLE.
                Ok(IdleResponse::Timeout) => {
                    debug!(account_id = %account_id, "refreshing IDLE");
                    Some(Round::Again)
                }
                Ok(IdleResponse::ManualInterrupt) => Some(Round::Again),
                Err(e) => Some(Round::Reconnect(MailError::Network(format!(
                    "IDLE wait failed: {e}"
                )))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ConnectionParams, SessionAuth};
    use crate::types::Security;

    fn unreachable_connector() -> ImapConnector {
        ImapConnector::new(ConnectionParams {
            host: "127.0.0.1".into(),
            port: 1,
            security: Security::None,
            auth: SessionAuth::Login {
                username: "u".into(),
                password: "p".into(),
            },
        })
    }

    #[test]
    fn default_config_matches_contract() {
        let config = IdleConfig::default();
        assert_eq!(config.refresh_after, Duration::from_secs(1500));
        assert_eq!(config.reconnect_wait, Duration::from_secs(5));
        assert_eq!(config.max_reconnect_attempts, 5);
    }

    #[tokio::test]
    async fn cancelled_session_exits_without_dead_event() {
        let (tx, rx) = flume::unbounded();
        let parent = CancellationToken::new();
        parent.cancel();
        let handle = spawn_idle_session(
            "acct".into(),
            unreachable_connector(),
            tx,
            &parent,
            IdleConfig::default(),
        );
        handle.stop().await;
        assert!(rx.try_recv().is_err());
    }
}
