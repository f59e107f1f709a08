//! Small helpers for envelope addresses. Addresses are kept in their
//! internal (unquoted) form; no RFC 5322 parsing happens here.

/// Characters allowed as VERP delimiters.
pub const VERP_DELIMITER_FILTER: &str = "-=+";

/// Split at the last `@`. Addresses without one have no domain.
#[must_use]
pub fn split(address: &str) -> (&str, Option<&str>) {
    address
        .rfind('@')
        .map_or((address, None), |at| (&address[..at], Some(&address[at + 1..])))
}

/// The domain part, if any, including an empty one for `user@`.
#[must_use]
pub fn domain(address: &str) -> Option<&str> {
    split(address).1
}

#[must_use]
pub fn local_part(address: &str) -> &str {
    split(address).0
}

/// Whether `local_part(address)` equals `local` ignoring ASCII case.
#[must_use]
pub fn local_part_is(address: &str, local: &str) -> bool {
    local_part(address).eq_ignore_ascii_case(local)
}

/// A VERP request carries exactly two delimiter characters from the filter.
#[must_use]
pub fn verp_delims_valid(delims: &str) -> bool {
    let mut chars = delims.chars();
    matches!(
        (chars.next(), chars.next(), chars.next()),
        (Some(first), Some(second), None)
            if VERP_DELIMITER_FILTER.contains(first) && VERP_DELIMITER_FILTER.contains(second)
    )
}

/// Encode the recipient into the sender address:
/// `owner@list.example` + `+=` + `user@host.example` becomes
/// `owner+user=host.example@list.example`.
#[must_use]
pub fn verp_sender(sender: &str, delims: &str, recipient: &str) -> String {
    if sender.is_empty() {
        return String::new();
    }

    let mut chars = delims.chars();
    let (Some(first), Some(second)) = (chars.next(), chars.next()) else {
        return sender.to_string();
    };

    let (sender_local, sender_domain) = split(sender);
    let (rcpt_local, rcpt_domain) = split(recipient);

    let mut verp = String::with_capacity(sender.len() + recipient.len() + 2);
    verp.push_str(sender_local);
    verp.push(first);
    verp.push_str(rcpt_local);
    if let Some(rcpt_domain) = rcpt_domain.filter(|d| !d.is_empty()) {
        verp.push(second);
        verp.push_str(rcpt_domain);
    }
    if let Some(sender_domain) = sender_domain.filter(|d| !d.is_empty()) {
        verp.push('@');
        verp.push_str(sender_domain);
    }
    verp
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_split() {
        assert_eq!(split("user@example.com"), ("user", Some("example.com")));
        assert_eq!(split("\"a@b\"@example.com"), ("\"a@b\"", Some("example.com")));
        assert_eq!(split("postmaster"), ("postmaster", None));
        assert_eq!(split("user@"), ("user", Some("")));
    }

    #[test]
    fn test_local_part_is() {
        assert!(local_part_is("Double-Bounce@example.com", "double-bounce"));
        assert!(local_part_is("double-bounce", "double-bounce"));
        assert!(!local_part_is("double-bouncer@example.com", "double-bounce"));
    }

    #[test]
    fn test_verp_delims() {
        assert!(verp_delims_valid("+="));
        assert!(verp_delims_valid("-="));
        assert!(!verp_delims_valid("+"));
        assert!(!verp_delims_valid("+=+"));
        assert!(!verp_delims_valid("+x"));
    }

    #[test]
    fn test_verp_sender() {
        assert_eq!(
            verp_sender("owner@list.example", "+=", "user@host.example"),
            "owner+user=host.example@list.example"
        );
        assert_eq!(verp_sender("owner@list.example", "+=", "user"), "owner+user@list.example");
        assert_eq!(verp_sender("owner", "-=", "user@host"), "owner-user=host");
        assert_eq!(verp_sender("", "+=", "user@host"), "");
    }
}
