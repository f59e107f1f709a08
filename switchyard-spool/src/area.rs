use std::fmt;

/// The subdirectories of a queue directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueArea {
    /// Newly written mail waiting for admission
    Incoming,
    /// Mail admitted into the scheduler's working set
    Active,
    /// Mail waiting for its retry time
    Deferred,
    /// Files that failed envelope validation
    Corrupt,
    /// Per-message logs of recipients that failed permanently
    Bounce,
    /// Per-message logs of recipients that failed temporarily
    Defer,
}

impl QueueArea {
    pub const ALL: [Self; 6] = [
        Self::Incoming,
        Self::Active,
        Self::Deferred,
        Self::Corrupt,
        Self::Bounce,
        Self::Defer,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Active => "active",
            Self::Deferred => "deferred",
            Self::Corrupt => "corrupt",
            Self::Bounce => "bounce",
            Self::Defer => "defer",
        }
    }
}

impl fmt::Display for QueueArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
