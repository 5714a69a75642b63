//! RFC-822 message parsing.
//!
//! Turns the raw source fetched over IMAP into a [`ParsedEmail`]:
//! RFC-2047 aware headers, transfer-decoded body, text/plain preferred
//! with an HTML-to-text fallback. One bad message must never fail a
//! batch, so everything here surfaces as a recoverable `Parse` error.

use chrono::{TimeZone, Utc};
use mailparse::{MailHeaderMap, ParsedMail};

use crate::error::{MailError, Result};
use crate::types::ParsedEmail;

pub struct ParsedMessage {
    pub message_id: Option<String>,
    pub email: ParsedEmail,
}

pub fn parse(raw: &[u8]) -> Result<ParsedMessage> {
    let mail = mailparse::parse_mail(raw).map_err(|e| MailError::Parse(e.to_string()))?;

    let message_id = mail
        .headers
        .get_first_value("Message-ID")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let subject = mail
        .headers
        .get_first_value("Subject")
        .unwrap_or_default()
        .trim()
        .to_string();

    let (from_name, from_addr) = first_address(&mail, "From");
    let to = address_list(&mail, "To");
    let date = mail
        .headers
        .get_first_value("Date")
        .and_then(|v| mailparse::dateparse(&v).ok())
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single());

    let body = extract_body(&mail);

    Ok(ParsedMessage {
        message_id,
        email: ParsedEmail {
            from_addr,
            from_name,
            to,
            subject,
            date,
            body,
        },
    })
}

fn first_address(mail: &ParsedMail, header: &str) -> (Option<String>, String) {
    let Some(h) = mail.headers.get_first_header(header) else {
        return (None, String::new());
    };
    match mailparse::addrparse_header(h) {
        Ok(list) => {
            for addr in list.iter() {
                if let mailparse::MailAddr::Single(single) = addr {
                    return (
                        single.display_name.clone().filter(|n| !n.is_empty()),
                        single.addr.clone(),
                    );
                }
            }
            (None, String::new())
        }
        Err(_) => (None, h.get_value().trim().to_string()),
    }
}

fn address_list(mail: &ParsedMail, header: &str) -> Vec<String> {
    let Some(h) = mail.headers.get_first_header(header) else {
        return vec![];
    };
    match mailparse::addrparse_header(h) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                mailparse::MailAddr::Single(s) => vec![s.addr.clone()],
                mailparse::MailAddr::Group(g) => {
                    g.addrs.iter().map(|s| s.addr.clone()).collect()
                }
            })
            .collect(),
        Err(_) => vec![h.get_value().trim().to_string()],
    }
}

/// Prefer the first text/plain part anywhere in the MIME tree; fall
/// back to text/html rendered as plain text; else the top-level body.
fn extract_body(mail: &ParsedMail) -> String {
    if let Some(plain) = find_part(mail, "text/plain") {
        return normalize(&plain);
    }
    if let Some(html) = find_part(mail, "text/html") {
        let rendered = html2text::from_read(html.as_bytes(), 80);
        return normalize(&rendered);
    }
    normalize(&mail.get_body().unwrap_or_default())
}

fn find_part(mail: &ParsedMail, mimetype: &str) -> Option<String> {
    if mail.ctype.mimetype.eq_ignore_ascii_case(mimetype) {
        return mail.get_body().ok();
    }
    mail.subparts
        .iter()
        .find_map(|part| find_part(part, mimetype))
}

/// Collapse line endings and trim trailing whitespace; content-level
/// cleanup (signatures, quoted history) is not this layer's job.
fn normalize(body: &str) -> String {
    body.replace("\r\n", "\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "Message-ID: <m1@example.com>\r\n\
From: Alice Example <alice@example.com>\r\n\
To: bot@example.com\r\n\
Subject: Hello\r\n\
Date: Mon, 6 Jan 2025 10:00:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Line one.\r\nLine two.\r\n";

    #[test]
    fn parses_simple_plain_text() {
        let msg = parse(SIMPLE.as_bytes()).unwrap();
        assert_eq!(msg.message_id.as_deref(), Some("<m1@example.com>"));
        assert_eq!(msg.email.subject, "Hello");
        assert_eq!(msg.email.from_addr, "alice@example.com");
        assert_eq!(msg.email.from_name.as_deref(), Some("Alice Example"));
        assert_eq!(msg.email.to, vec!["bot@example.com"]);
        assert_eq!(msg.email.body, "Line one.\nLine two.");
        assert!(msg.email.date.is_some());
    }

    #[test]
    fn decodes_rfc2047_subject() {
        let raw = "From: a@b.c\r\n\
Subject: =?UTF-8?B?SMOpbGxv?=\r\n\
\r\n\
body\r\n";
        let msg = parse(raw.as_bytes()).unwrap();
        assert_eq!(msg.email.subject, "Héllo");
    }

    #[test]
    fn prefers_plain_part_in_multipart() {
        let raw = "From: a@b.c\r\n\
Subject: multi\r\n\
Content-Type: multipart/alternative; boundary=\"xyz\"\r\n\
\r\n\
--xyz\r\n\
Content-Type: text/plain\r\n\
\r\n\
plain body\r\n\
--xyz\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>html body</p>\r\n\
--xyz--\r\n";
        let msg = parse(raw.as_bytes()).unwrap();
        assert_eq!(msg.email.body, "plain body");
    }

    #[test]
    fn renders_html_when_no_plain_part() {
        let raw = "From: a@b.c\r\n\
Subject: html only\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><p>Hello <b>world</b></p></body></html>\r\n";
        let msg = parse(raw.as_bytes()).unwrap();
        assert!(msg.email.body.contains("Hello"));
        assert!(msg.email.body.contains("world"));
        assert!(!msg.email.body.contains('<'));
    }

    #[test]
    fn decodes_quoted_printable_body() {
        let raw = "From: a@b.c\r\n\
Subject: qp\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
caf=C3=A9\r\n";
        let msg = parse(raw.as_bytes()).unwrap();
        assert_eq!(msg.email.body, "café");
    }

    #[test]
    fn missing_message_id_is_none() {
        let raw = "From: a@b.c\r\nSubject: x\r\n\r\nbody\r\n";
        let msg = parse(raw.as_bytes()).unwrap();
        assert!(msg.message_id.is_none());
    }
}
