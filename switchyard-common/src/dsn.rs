//! Enhanced status codes (RFC 3463) paired with a human readable reason.

use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// The class digit of an enhanced status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsnClass {
    Success,
    Temporary,
    Permanent,
}

/// A delivery status: `x.y.z` enhanced code plus free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dsn {
    pub status: String,
    pub reason: String,
}

impl Dsn {
    pub fn new(status: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            reason: reason.into(),
        }
    }

    /// Split `"4.3.0 mail transport unavailable"` into status and reason.
    ///
    /// Text without a leading enhanced status code is kept whole as the
    /// reason, with `default_status` filled in.
    pub fn parse(text: &str, default_status: &str) -> Self {
        let text = text.trim();
        match text.split_once(' ') {
            Some((status, reason)) if is_valid_status(status) => Self::new(status, reason.trim()),
            None if is_valid_status(text) => Self::new(text, ""),
            _ => Self::new(default_status, text),
        }
    }

    #[must_use]
    pub fn class(&self) -> Option<DsnClass> {
        if !is_valid_status(&self.status) {
            return None;
        }

        match self.status.as_bytes()[0] {
            b'2' => Some(DsnClass::Success),
            b'4' => Some(DsnClass::Temporary),
            b'5' => Some(DsnClass::Permanent),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.class() == Some(DsnClass::Temporary)
    }

    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.class() == Some(DsnClass::Permanent)
    }

    /// Replace an unusable status or reason with a generic temporary one.
    ///
    /// Agents sometimes report a deferral with a success or malformed code;
    /// the scheduler only ever wants a `4.x.x` status for throttle reasons.
    #[must_use]
    pub fn sanitized_temporary(mut self) -> Self {
        if !self.is_temporary() {
            self.status = String::from("4.0.0");
        }
        if self.reason.trim().is_empty() {
            self.reason = String::from("unknown error");
        }
        self
    }

    /// Prefix the reason text, keeping the status.
    #[must_use]
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.reason.insert_str(0, prefix);
        self
    }
}

impl Display for Dsn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            f.write_str(&self.status)
        } else {
            write!(f, "{} {}", self.status, self.reason)
        }
    }
}

/// `class.subject.detail` where class is 2, 4 or 5, subject has 1 to 3 digits
/// and detail 1 to 3 digits.
#[must_use]
pub fn is_valid_status(status: &str) -> bool {
    let mut parts = status.split('.');
    let (Some(class), Some(subject), Some(detail), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    let digits = |s: &str, max: usize| {
        !s.is_empty() && s.len() <= max && s.bytes().all(|b| b.is_ascii_digit())
    };

    matches!(class, "2" | "4" | "5") && digits(subject, 3) && digits(detail, 3)
}
