//! Single-connection IMAP wrapper.
//!
//! Owns one authenticated session at a time. Supports direct TLS,
//! STARTTLS upgrade, and plain TCP; LOGIN and XOAUTH2 SASL. Every
//! network phase runs under a 30 s timeout and connect attempts retry
//! on transient faults only.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_imap::Session;
use async_native_tls::TlsStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

use crate::error::{MailError, Result};
use crate::providers::{ConnectionParams, SessionAuth};
use crate::retry::{retry, RetryPolicy};
use crate::types::Security;

const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Unifies direct-TLS and plain sessions so the rest of the crate
/// handles one session type.
pub enum MailStream {
    Tls(TlsStream<Compat<TcpStream>>),
    Plain(Compat<TcpStream>),
}

impl futures::io::AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MailStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            MailStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl futures::io::AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MailStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            MailStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Tls(s) => Pin::new(s).poll_flush(cx),
            MailStream::Plain(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Tls(s) => Pin::new(s).poll_close(cx),
            MailStream::Plain(s) => Pin::new(s).poll_close(cx),
        }
    }
}

impl std::fmt::Debug for MailStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailStream::Tls(_) => write!(f, "MailStream::Tls"),
            MailStream::Plain(_) => write!(f, "MailStream::Plain"),
        }
    }
}

pub type ImapSession = Session<MailStream>;

/// XOAUTH2 SASL authenticator: base64 encoding of the response is
/// handled by async-imap.
struct XOAuth2 {
    response: Vec<u8>,
}

impl XOAuth2 {
    fn new(user: &str, access_token: &str) -> Self {
        let s = format!("user={user}\x01auth=Bearer {access_token}\x01\x01");
        Self {
            response: s.into_bytes(),
        }
    }
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = Vec<u8>;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        // First (empty) challenge gets the XOAUTH2 string; a second
        // challenge means the server rejected it, so send an empty
        // line to collect the real error.
        std::mem::take(&mut self.response)
    }
}

async fn with_timeout<T, F>(what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(IO_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(MailError::Timeout(format!("{what} timed out"))),
    }
}

/// Extract a bracketed IMAP response code, e.g. `AUTHENTICATIONFAILED`
/// out of `NO [AUTHENTICATIONFAILED] Invalid credentials`.
fn response_code(text: &str) -> Option<String> {
    let start = text.find('[')?;
    let end = text[start..].find(']')? + start;
    let code = text[start + 1..end].split_whitespace().next()?;
    Some(code.to_string())
}

fn auth_error(text: String) -> MailError {
    MailError::Auth {
        code: response_code(&text),
        response: text,
    }
}

pub struct ImapConnector {
    params: ConnectionParams,
    session: Option<ImapSession>,
}

impl ImapConnector {
    pub fn new(params: ConnectionParams) -> Self {
        Self {
            params,
            session: None,
        }
    }

    /// Open a socket and authenticate. Transient faults retry up to
    /// 3 attempts with backoff; authentication failures do not.
    pub async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let params = self.params.clone();
        let session = retry(RetryPolicy::default(), |attempt| {
            let params = params.clone();
            async move {
                debug!(host = %params.host, port = params.port, attempt, "connecting to IMAP server");
                open_session(&params).await
            }
        })
        .await?;
        info!(host = %self.params.host, "connected to IMAP server");
        self.session = Some(session);
        Ok(())
    }

    pub(crate) fn session_mut(&mut self) -> Result<&mut ImapSession> {
        self.session
            .as_mut()
            .ok_or_else(|| MailError::Protocol("not connected".into()))
    }

    /// Hand the session to an IDLE handle; pair with
    /// [`restore_session`](Self::restore_session).
    pub fn take_session(&mut self) -> Option<ImapSession> {
        self.session.take()
    }

    pub fn restore_session(&mut self, session: ImapSession) {
        self.session = Some(session);
    }

    /// Drop the session without LOGOUT. Used when the socket is
    /// already known dead.
    pub fn discard(&mut self) {
        self.session = None;
    }

    /// SELECT INBOX, returning the mailbox's EXISTS count.
    pub async fn select_inbox(&mut self) -> Result<u32> {
        let session = self.session_mut()?;
        let mailbox = with_timeout("SELECT INBOX", async {
            session
                .select("INBOX")
                .await
                .map_err(|e| MailError::Protocol(format!("SELECT failed: {e}")))
        })
        .await?;
        Ok(mailbox.exists)
    }

    /// Connectivity probe: connect, take the INBOX lock read-only,
    /// LOGOUT. Throws with server detail on any failure.
    pub async fn test(&mut self) -> Result<()> {
        self.connect().await?;
        let session = self.session_mut()?;
        let outcome = with_timeout("EXAMINE INBOX", async {
            session
                .examine("INBOX")
                .await
                .map_err(|e| MailError::Protocol(format!("EXAMINE failed: {e}")))
        })
        .await;
        self.logout().await;
        outcome.map(|_| ())
    }

    pub async fn logout(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = tokio::time::timeout(IO_TIMEOUT, session.logout()).await;
        }
    }
}

async fn open_session(params: &ConnectionParams) -> Result<ImapSession> {
    let stream = open_stream(params).await?;
    let client = async_imap::Client::new(stream);

    let session = match &params.auth {
        SessionAuth::Login { username, password } => {
            with_timeout("LOGIN", async {
                client
                    .login(username, password)
                    .await
                    .map_err(|(e, _)| auth_error(e.to_string()))
            })
            .await?
        }
        SessionAuth::XOAuth2 { user, access_token } => {
            let authenticator = XOAuth2::new(user, access_token);
            with_timeout("AUTHENTICATE XOAUTH2", async {
                client
                    .authenticate("XOAUTH2", authenticator)
                    .await
                    .map_err(|(e, _)| auth_error(e.to_string()))
            })
            .await?
        }
    };
    Ok(session)
}

async fn open_stream(params: &ConnectionParams) -> Result<MailStream> {
    let addr = (params.host.as_str(), params.port);

    match params.security {
        Security::Ssl => {
            let tcp = with_timeout("TCP connect", async {
                TcpStream::connect(addr).await.map_err(MailError::from)
            })
            .await?;
            let tls = async_native_tls::TlsConnector::new();
            let stream = with_timeout("TLS handshake", async {
                tls.connect(&params.host, tcp.compat())
                    .await
                    .map_err(|e| MailError::Network(format!("TLS handshake failed: {e}")))
            })
            .await?;
            Ok(MailStream::Tls(stream))
        }
        Security::None => {
            let tcp = with_timeout("TCP connect", async {
                TcpStream::connect(addr).await.map_err(MailError::from)
            })
            .await?;
            Ok(MailStream::Plain(tcp.compat()))
        }
        Security::Starttls => open_starttls(params, addr).await,
    }
}

/// STARTTLS upgrade: the greeting and the STARTTLS exchange happen on
/// the plain socket, then the TLS session starts without a second
/// greeting.
async fn open_starttls(params: &ConnectionParams, addr: (&str, u16)) -> Result<MailStream> {
    let mut tcp = with_timeout("TCP connect", async {
        TcpStream::connect(addr).await.map_err(MailError::from)
    })
    .await?;

    let mut buf = vec![0u8; 4096];
    let n = with_timeout("server greeting", async {
        tcp.read(&mut buf).await.map_err(MailError::from)
    })
    .await?;
    let greeting = String::from_utf8_lossy(&buf[..n]);
    if !greeting.contains("OK") {
        return Err(MailError::Protocol(format!(
            "unexpected server greeting: {}",
            greeting.trim()
        )));
    }

    with_timeout("STARTTLS", async {
        tcp.write_all(b"a001 STARTTLS\r\n")
            .await
            .map_err(MailError::from)
    })
    .await?;
    let n = with_timeout("STARTTLS response", async {
        tcp.read(&mut buf).await.map_err(MailError::from)
    })
    .await?;
    let response = String::from_utf8_lossy(&buf[..n]);
    if !response.contains("OK") {
        return Err(MailError::Protocol(format!(
            "STARTTLS rejected: {}",
            response.trim()
        )));
    }

    let tls = async_native_tls::TlsConnector::new();
    let stream = with_timeout("TLS upgrade", async {
        tls.connect(&params.host, tcp.compat())
            .await
            .map_err(|e| MailError::Network(format!("TLS upgrade failed: {e}")))
    })
    .await?;
    Ok(MailStream::Tls(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_code_extraction() {
        assert_eq!(
            response_code("NO [AUTHENTICATIONFAILED] Invalid credentials"),
            Some("AUTHENTICATIONFAILED".to_string())
        );
        assert_eq!(response_code("NO login rejected"), None);
    }

    #[test]
    fn auth_error_carries_code_and_text() {
        let err = auth_error("NO [AUTHENTICATIONFAILED] Invalid credentials".into());
        match err {
            MailError::Auth { code, response } => {
                assert_eq!(code.as_deref(), Some("AUTHENTICATIONFAILED"));
                assert!(response.contains("Invalid credentials"));
            }
            other => panic!("expected auth error, got {other:?}"),
        }
        assert!(!auth_error("x".into()).is_transient());
    }

    #[test]
    fn xoauth2_initial_response_format() {
        let mut auth = XOAuth2::new("me@gmail.com", "ya29.token");
        let first = async_imap::Authenticator::process(&mut auth, b"");
        assert_eq!(
            first,
            b"user=me@gmail.com\x01auth=Bearer ya29.token\x01\x01".to_vec()
        );
        // Second challenge gets an empty reply.
        let second = async_imap::Authenticator::process(&mut auth, b"challenge");
        assert!(second.is_empty());
    }
}
