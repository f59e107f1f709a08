use std::fmt;

/// Name of a queue file.
///
/// Queue ids are ULIDs, so a directory listing sorts by creation time and ids
/// stay unique across queue areas. Anything that is not a bare ULID is refused
/// before it gets near a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId {
    id: ulid::Ulid,
}

impl QueueId {
    /// Parse a directory entry name.
    ///
    /// Rejects path separators, traversal patterns and anything that is not a
    /// canonical 26 character ULID.
    #[must_use]
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.len() != ulid::ULID_LEN
            || filename.contains(['/', '\\'])
            || filename.contains("..")
        {
            return None;
        }

        let id = ulid::Ulid::from_string(filename).ok()?;

        // Lower case input parses too, but would not round-trip to the same file
        (id.to_string() == filename).then_some(Self { id })
    }

    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.id.timestamp_ms()
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl std::str::FromStr for QueueId {
    type Err = crate::SpoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_filename(s).ok_or_else(|| crate::SpoolError::InvalidQueueId(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_id_validation() {
        assert!(QueueId::from_filename("01ARZ3NDEKTSV4RRFFQ69G5FAV").is_some());

        assert!(QueueId::from_filename("../etc/passwd").is_none());
        assert!(QueueId::from_filename("01ARZ3NDEKTSV4RRFFQ69G5F/V").is_none());
        assert!(QueueId::from_filename("01ARZ3NDEKTSV4RRFFQ69G5FAV.tmp").is_none());
        assert!(QueueId::from_filename("01arz3ndektsv4rrffq69g5fav").is_none());
        assert!(QueueId::from_filename("").is_none());
    }

    #[test]
    fn test_queue_id_round_trip() {
        let id = QueueId::generate();
        assert_eq!(QueueId::from_filename(&id.to_string()), Some(id));
        assert_eq!(id.to_string().parse::<QueueId>().ok(), Some(id));
    }
}
