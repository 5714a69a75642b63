//! Delivery formatter and chat sink.
//!
//! Renders one fetched email plus the user's instruction template
//! into a single chat instruction. Posting is fire-and-forget: after
//! a successful claim the message is delivered at most once, and a
//! failed post is logged without rolling the claim back.

use chrono::Utc;
use chrono_tz::Tz;
use tracing::warn;

use crate::host::ChatSink;
use crate::types::{Account, FetchedEmail};

/// Body text is capped at this many characters in the instruction.
const BODY_LIMIT: usize = 2_000;

pub fn format_instruction(
    email: &FetchedEmail,
    account: &Account,
    instruction: &str,
    timezone: Option<Tz>,
) -> String {
    let parsed = &email.email;

    let from = match &parsed.from_name {
        Some(name) => format!("{name} <{}>", parsed.from_addr),
        None => parsed.from_addr.clone(),
    };

    let to = if parsed.to.is_empty() {
        account.email.clone()
    } else {
        parsed.to.join(", ")
    };

    let subject = if parsed.subject.is_empty() {
        "(No subject)"
    } else {
        &parsed.subject
    };

    let date = parsed.date.unwrap_or_else(Utc::now);
    let date = match timezone {
        Some(tz) => date.with_timezone(&tz).to_rfc2822(),
        None => date.to_rfc2822(),
    };

    let mut body: String = parsed.body.chars().take(BODY_LIMIT).collect();
    if parsed.body.chars().count() > BODY_LIMIT {
        body.push('…');
    }

    let mut block = format!(
        "[New Email]\n\
From: {from}\n\
To: {to} ({account_name})\n\
Subject: {subject}\n\
Date: {date}\n\
Email content:\n\
---\n\
{body}\n\
---",
        account_name = account.name,
    );
    if !instruction.is_empty() {
        block.push('\n');
        block.push_str(instruction);
    }
    block
}

/// Post the instruction. A sink failure is observable only in logs.
pub async fn deliver(chat: &dyn ChatSink, user_id: &str, text: &str) {
    if let Err(e) = chat.append_instruction(user_id, text).await {
        warn!(user_id, error = %e, "failed to deliver chat instruction");
    }
}

/// Parse the profile timezone string, when present and valid.
pub fn parse_timezone(tz: Option<&str>) -> Option<Tz> {
    tz.and_then(|name| name.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParsedEmail, Provider};
    use chrono::TimeZone;

    fn sample_email(body: &str) -> FetchedEmail {
        FetchedEmail {
            uid: 13,
            message_id: "<m13@x>".into(),
            email: ParsedEmail {
                from_addr: "alice@example.com".into(),
                from_name: Some("Alice".into()),
                to: vec!["bot@example.com".into()],
                subject: "Quarterly numbers".into(),
                date: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single(),
                body: body.into(),
            },
        }
    }

    fn sample_account() -> Account {
        Account::new(Provider::Icloud, "Personal", "bot@example.com")
    }

    #[test]
    fn block_has_expected_shape() {
        let text = format_instruction(
            &sample_email("Hello there."),
            &sample_account(),
            "Reply politely.",
            None,
        );
        assert!(text.starts_with("[New Email]\n"));
        assert!(text.contains("From: Alice <alice@example.com>"));
        assert!(text.contains("To: bot@example.com (Personal)"));
        assert!(text.contains("Subject: Quarterly numbers"));
        assert!(text.contains("---\nHello there.\n---"));
        assert!(text.ends_with("Reply politely."));
    }

    #[test]
    fn empty_subject_and_instruction() {
        let mut email = sample_email("body");
        email.email.subject.clear();
        let text = format_instruction(&email, &sample_account(), "", None);
        assert!(text.contains("Subject: (No subject)"));
        assert!(text.ends_with("---"));
    }

    #[test]
    fn long_body_is_truncated_with_sentinel() {
        let long = "x".repeat(5_000);
        let text = format_instruction(&sample_email(&long), &sample_account(), "", None);
        assert!(text.contains('…'));
        let body_section = text.split("---").nth(1).unwrap();
        assert!(body_section.chars().count() <= BODY_LIMIT + 3);
    }

    #[test]
    fn timezone_localises_the_date() {
        let tz = parse_timezone(Some("Europe/Berlin")).unwrap();
        let text = format_instruction(&sample_email("b"), &sample_account(), "", Some(tz));
        // June: CEST, UTC+2.
        assert!(text.contains("+0200"));
    }

    #[test]
    fn invalid_timezone_is_ignored() {
        assert!(parse_timezone(Some("Not/AZone")).is_none());
        assert!(parse_timezone(None).is_none());
    }
}
