//! Queue area scanners and the requests that drive them.
//!
//! A scanner holds the flags of the pass in progress and the flags requested
//! for the next one. Asking for a scan while one is running does not
//! interrupt it; the scanner restarts with the new flags once it reaches the
//! end of the directory.

use std::ops::{BitOr, BitOrAssign};

use switchyard_common::internal;
use switchyard_spool::{QueueArea, QueueId, QueueStore, ScanDir};

use crate::{QmgrError, QueueManager, message::LoadFlags};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanFlags {
    /// Start a pass if none is running
    pub start: bool,
    /// Ignore file modification times
    pub scan_all: bool,
    /// Revive every dead transport and destination right away
    pub flush_once: bool,
    /// Deliver through `defer_transports` as well
    pub flush_dfxp: bool,
    /// Revive what each loaded message needs
    pub flush_each: bool,
}

impl ScanFlags {
    pub const NONE: Self = Self {
        start: false,
        scan_all: false,
        flush_once: false,
        flush_dfxp: false,
        flush_each: false,
    };

    pub const START: Self = Self {
        start: true,
        ..Self::NONE
    };

    pub const SCAN_ALL: Self = Self {
        scan_all: true,
        ..Self::NONE
    };

    pub const FLUSH_ONCE: Self = Self {
        flush_once: true,
        ..Self::NONE
    };

    pub const FLUSH_DFXP: Self = Self {
        flush_dfxp: true,
        ..Self::NONE
    };

    /// How files found by a pass with these flags are loaded.
    #[must_use]
    pub const fn load_flags(self) -> LoadFlags {
        LoadFlags {
            flush_dfxp: self.flush_dfxp,
            flush_each: self.flush_each,
            force_expire: false,
        }
    }
}

impl BitOr for ScanFlags {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        Self {
            start: self.start || other.start,
            scan_all: self.scan_all || other.scan_all,
            flush_once: self.flush_once || other.flush_once,
            flush_dfxp: self.flush_dfxp || other.flush_dfxp,
            flush_each: self.flush_each || other.flush_each,
        }
    }
}

impl BitOrAssign for ScanFlags {
    fn bitor_assign(&mut self, other: Self) {
        *self = *self | other;
    }
}

#[derive(Debug)]
pub struct QueueScan {
    area: QueueArea,
    handle: Option<ScanDir>,
    /// Flags of the pass in progress
    flags: ScanFlags,
    /// Flags for the pass after this one
    next: ScanFlags,
}

impl QueueScan {
    #[must_use]
    pub const fn new(area: QueueArea) -> Self {
        Self {
            area,
            handle: None,
            flags: ScanFlags::NONE,
            next: ScanFlags::NONE,
        }
    }

    #[must_use]
    pub const fn area(&self) -> QueueArea {
        self.area
    }

    #[must_use]
    pub const fn flags(&self) -> ScanFlags {
        self.flags
    }

    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.handle.is_none()
    }

    fn begin(&mut self, store: &QueueStore) -> Result<(), QmgrError> {
        self.flags = std::mem::take(&mut self.next);
        let handle = ScanDir::open(store.area_path(self.area)).map_err(|source| QmgrError::Scan {
            area: self.area,
            source,
        })?;
        self.handle = Some(handle);
        internal!(level = DEBUG, area = %self.area, flags = ?self.flags, "queue scan started");
        Ok(())
    }

    /// Merge a request; returns whether a pass should start now.
    fn request(&mut self, flags: ScanFlags) -> bool {
        if self.handle.is_some() {
            // These change how the rest of the running pass behaves.
            self.flags.scan_all |= flags.scan_all;
            self.flags.flush_dfxp |= flags.flush_dfxp;
        }
        self.next |= flags;
        self.handle.is_none() && flags.start
    }

    /// The next queue id of the running pass, restarting once if another pass
    /// was requested meanwhile.
    pub fn next(&mut self, store: &QueueStore) -> Result<Option<QueueId>, QmgrError> {
        loop {
            let Some(handle) = self.handle.as_mut() else {
                return Ok(None);
            };
            let found = handle.next_id().map_err(|source| QmgrError::Scan {
                area: self.area,
                source,
            })?;
            if found.is_some() {
                return Ok(found);
            }

            self.handle = None;
            internal!(level = DEBUG, area = %self.area, "queue scan done");
            if !self.next.start {
                return Ok(None);
            }
            self.begin(store)?;
        }
    }
}

impl QueueManager {
    /// The next file of the pass over `area`, with the flags it is to be
    /// loaded under.
    pub(crate) fn scan_next(&mut self, area: QueueArea) -> Result<Option<(QueueId, ScanFlags)>, QmgrError> {
        let scan = match area {
            QueueArea::Deferred => &mut self.deferred,
            _ => &mut self.incoming,
        };
        let found = scan.next(&self.store)?;
        Ok(found.map(|queue_id| (queue_id, scan.flags())))
    }

    /// Ask for a pass over `area`.
    ///
    /// A flush request revives everything before the scan starts; the flag
    /// itself is not remembered.
    pub fn scan_request(&mut self, area: QueueArea, mut flags: ScanFlags) {
        if flags.flush_once {
            self.enable_all();
            flags.flush_once = false;
        }

        let scan = match area {
            QueueArea::Deferred => &mut self.deferred,
            _ => &mut self.incoming,
        };
        if scan.request(flags)
            && let Err(err) = scan.begin(&self.store)
        {
            internal!(level = ERROR, %area, error = %err, "cannot start queue scan");
        }
    }
}
