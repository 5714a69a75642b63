//! Fetch path: UID SEARCH above the watermark, UID FETCH of the raw
//! source, tolerant parsing.
//!
//! A single unparseable message is logged and skipped; it never fails
//! the batch. Transient network faults retry with backoff, with the
//! stale session discarded between attempts.

use async_imap::types::Fetch;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::error::{MailError, Result};
use crate::parser;
use crate::retry::RetryPolicy;
use crate::types::FetchedEmail;

use super::connection::ImapConnector;
use super::MailSource;

pub const DEFAULT_FETCH_LIMIT: usize = 50;

/// Collect a FETCH stream, skipping individual responses that fail to
/// parse at the protocol level.
async fn collect_tolerant<E: std::fmt::Display>(
    stream: impl futures::Stream<Item = std::result::Result<Fetch, E>>,
    context: &str,
) -> Vec<Fetch> {
    futures::pin_mut!(stream);
    let mut items = Vec::new();
    while let Some(result) = stream.next().await {
        match result {
            Ok(fetch) => items.push(fetch),
            Err(e) => {
                warn!("skipping unparseable IMAP response ({context}): {e}");
            }
        }
    }
    items
}

impl ImapConnector {
    /// Messages with UID strictly above `since_uid`, ascending, capped
    /// to the most recent `limit`.
    pub async fn fetch_since(&mut self, since_uid: u32, limit: usize) -> Result<Vec<FetchedEmail>> {
        let policy = RetryPolicy::default();
        let mut attempt = 0u32;
        loop {
            match fetch_since_once(self, since_uid, limit).await {
                Ok(emails) => return Ok(emails),
                Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                    let delay = policy.delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient fetch failure, reconnecting"
                    );
                    self.discard();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The most recent `limit` messages regardless of watermark.
    pub async fn list_recent(&mut self, limit: usize) -> Result<Vec<FetchedEmail>> {
        self.fetch_since(0, limit).await
    }

    /// A single message by UID, when it still exists.
    pub async fn fetch_by_uid(&mut self, uid: u32) -> Result<Option<FetchedEmail>> {
        let policy = RetryPolicy::default();
        let mut attempt = 0u32;
        loop {
            let outcome = async {
                self.connect().await?;
                self.select_inbox().await?;
                fetch_uids(self, &[uid]).await
            }
            .await;
            match outcome {
                Ok(mut fetched) => return Ok(fetched.pop()),
                Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                    self.discard();
                    tokio::time::sleep(policy.delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

async fn fetch_since_once(
    conn: &mut ImapConnector,
    since_uid: u32,
    limit: usize,
) -> Result<Vec<FetchedEmail>> {
    conn.connect().await?;
    conn.select_inbox().await?;

    let query = if since_uid == 0 {
        "ALL".to_string()
    } else {
        format!("UID {}:*", since_uid + 1)
    };

    let uid_set = conn
        .session_mut()?
        .uid_search(&query)
        .await
        .map_err(|e| MailError::Protocol(format!("SEARCH failed: {e}")))?;

    // `UID n:*` always matches the newest message even when its UID is
    // below n, so filter explicitly.
    let mut uids: Vec<u32> = uid_set.into_iter().filter(|&uid| uid > since_uid).collect();
    uids.sort_unstable();
    if uids.len() > limit {
        uids = uids.split_off(uids.len() - limit);
    }

    if uids.is_empty() {
        return Ok(vec![]);
    }
    debug!(count = uids.len(), since_uid, "fetching new messages");

    fetch_uids(conn, &uids).await
}

async fn fetch_uids(conn: &mut ImapConnector, uids: &[u32]) -> Result<Vec<FetchedEmail>> {
    let uid_list: String = uids
        .iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let session = conn.session_mut()?;
    let stream = session
        .uid_fetch(&uid_list, "(UID BODY.PEEK[])")
        .await
        .map_err(|e| MailError::Protocol(format!("FETCH failed: {e}")))?;
    let fetches = collect_tolerant(stream, "message source").await;

    let mut emails = Vec::with_capacity(fetches.len());
    for fetch in &fetches {
        let Some(uid) = fetch.uid else {
            warn!("FETCH response missing UID, skipping");
            continue;
        };
        let Some(raw) = fetch.body() else {
            warn!(uid, "FETCH response missing body, skipping");
            continue;
        };
        match parser::parse(raw) {
            Ok(message) => emails.push(FetchedEmail {
                uid,
                // A missing Message-ID still needs a stable dedup key.
                message_id: message
                    .message_id
                    .unwrap_or_else(|| format!("<uid-{uid}>")),
                email: message.email,
            }),
            Err(e) => {
                warn!(uid, error = %e, "failed to parse message, skipping");
            }
        }
    }

    emails.sort_by_key(|e| e.uid);
    Ok(emails)
}

#[async_trait]
impl MailSource for ImapConnector {
    async fn fetch_since(&mut self, since_uid: u32, limit: usize) -> Result<Vec<FetchedEmail>> {
        ImapConnector::fetch_since(self, since_uid, limit).await
    }

    async fn close(&mut self) {
        self.logout().await;
    }
}
