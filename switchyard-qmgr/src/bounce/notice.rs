//! Delivery status notification text (RFC 3464).

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use switchyard_spool::{LogEntry, QueueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Action {
    Failed,
    Delayed,
}

impl Action {
    const fn name(self) -> &'static str {
        match self {
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        }
    }
}

#[derive(Debug)]
pub(super) struct Report<'a> {
    pub queue_id: QueueId,
    pub reporting_mta: &'a str,
    pub from: &'a str,
    pub to: &'a str,
    pub arrival: u64,
    pub action: Action,
    pub expired: bool,
    pub entries: &'a [LogEntry],
}

fn rfc2822(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_default()
        .to_rfc2822()
}

impl Report<'_> {
    fn subject(&self) -> &'static str {
        match self.action {
            Action::Failed => "Undelivered Mail Returned to Sender",
            Action::Delayed => "Delayed Mail (still being retried)",
        }
    }

    fn explanation(&self, out: &mut String) {
        let _ = writeln!(out, "This is the mail system at host {}.", self.reporting_mta);
        out.push('\n');
        match (self.action, self.expired) {
            (Action::Failed, true) => {
                out.push_str(
                    "Your message could not be delivered before its queue lifetime ran out.\n\
                     It has been returned to you with the reasons below.\n",
                );
            }
            (Action::Failed, false) => {
                out.push_str(
                    "Your message could not be delivered to one or more recipients.\n\
                     It has been returned to you with the reasons below.\n",
                );
            }
            (Action::Delayed, _) => {
                out.push_str(
                    "Your message could not be delivered yet. Delivery will be retried;\n\
                     you do not need to resend it.\n",
                );
            }
        }
        out.push('\n');
        for entry in self.entries {
            let _ = writeln!(out, "<{}>: {}", entry.recipient, entry.dsn.reason);
        }
    }

    fn delivery_status(&self, out: &mut String) {
        let _ = writeln!(out, "Reporting-MTA: dns; {}", self.reporting_mta);
        let _ = writeln!(out, "X-Switchyard-Queue-ID: {}", self.queue_id);
        let _ = writeln!(out, "Arrival-Date: {}", rfc2822(self.arrival));

        for entry in self.entries {
            out.push('\n');
            let _ = writeln!(out, "Final-Recipient: rfc822; {}", entry.recipient);
            if entry.original != entry.recipient {
                let _ = writeln!(out, "Original-Recipient: rfc822; {}", entry.original);
            }
            let _ = writeln!(out, "Action: {}", self.action.name());
            let status = if self.action == Action::Failed && self.expired {
                // Whatever kept it queued is final now.
                entry.dsn.status.replacen('4', "5", 1)
            } else {
                entry.dsn.status.clone()
            };
            let _ = writeln!(out, "Status: {status}");
            let _ = writeln!(out, "Diagnostic-Code: X-Switchyard; {}", entry.dsn.reason);
        }
    }

    /// The complete message, CRLF line endings.
    pub fn compose(&self, now: DateTime<Utc>) -> Vec<u8> {
        let boundary = format!("{}/{}", self.queue_id, self.reporting_mta);
        let mut out = String::with_capacity(1024 + 256 * self.entries.len());

        let _ = writeln!(out, "Date: {}", now.to_rfc2822());
        let _ = writeln!(out, "From: {}", self.from);
        let _ = writeln!(out, "To: {}", self.to);
        let _ = writeln!(out, "Subject: {}", self.subject());
        let _ = writeln!(out, "Auto-Submitted: auto-replied");
        let _ = writeln!(out, "MIME-Version: 1.0");
        let _ = writeln!(
            out,
            "Content-Type: multipart/report; report-type=delivery-status;\n\tboundary=\"{boundary}\""
        );
        out.push('\n');

        let _ = writeln!(out, "--{boundary}");
        out.push_str("Content-Description: Notification\n");
        out.push_str("Content-Type: text/plain; charset=us-ascii\n\n");
        self.explanation(&mut out);
        out.push('\n');

        let _ = writeln!(out, "--{boundary}");
        out.push_str("Content-Description: Delivery report\n");
        out.push_str("Content-Type: message/delivery-status\n\n");
        self.delivery_status(&mut out);
        out.push('\n');
        let _ = writeln!(out, "--{boundary}--");

        out.replace('\n', "\r\n").into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use switchyard_common::Dsn;

    use super::*;

    #[test]
    fn test_expired_report_has_permanent_status() {
        let entries = [LogEntry {
            offset: 120,
            original: String::from("User@example.com"),
            recipient: String::from("user@example.com"),
            dsn: Dsn::new("4.4.1", "connection refused"),
        }];
        let report = Report {
            queue_id: QueueId::generate(),
            reporting_mta: "mx.example.org",
            from: "MAILER-DAEMON@mx.example.org",
            to: "sender@example.net",
            arrival: 1_700_000_000,
            action: Action::Failed,
            expired: true,
            entries: &entries,
        };

        let text = String::from_utf8(report.compose(Utc::now())).unwrap();
        assert!(text.contains("Subject: Undelivered Mail Returned to Sender\r\n"));
        assert!(text.contains("Status: 5.4.1\r\n"));
        assert!(text.contains("Original-Recipient: rfc822; User@example.com\r\n"));
        assert!(text.contains("<user@example.com>: connection refused\r\n"));
        assert!(text.ends_with("--\r\n"));
    }
}
