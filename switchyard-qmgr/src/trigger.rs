//! Single-byte scan requests from the control socket.

use switchyard_common::internal;
use switchyard_spool::QueueArea;

use crate::{QueueManager, scan::ScanFlags};

/// The bytes understood on the trigger socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// `I`: scan the incoming area
    ScanIncoming,
    /// `D`: scan the deferred area
    ScanDeferred,
    /// `A`: scan both areas ignoring file timestamps
    ScanAll,
    /// `F`: revive every dead transport and destination, then scan
    FlushDead,
    /// `W`: new mail may have arrived
    Wakeup,
}

impl Trigger {
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'I' => Some(Self::ScanIncoming),
            b'D' => Some(Self::ScanDeferred),
            b'A' => Some(Self::ScanAll),
            b'F' => Some(Self::FlushDead),
            b'W' => Some(Self::Wakeup),
            _ => None,
        }
    }

    #[must_use]
    pub const fn byte(self) -> u8 {
        match self {
            Self::ScanIncoming => b'I',
            Self::ScanDeferred => b'D',
            Self::ScanAll => b'A',
            Self::FlushDead => b'F',
            Self::Wakeup => b'W',
        }
    }
}

impl QueueManager {
    /// Apply one batch of trigger bytes.
    ///
    /// Repeated bytes count once. Requests that change how a scan behaves
    /// are applied before the ones that start scans, so a batch like `IA`
    /// starts a single incoming pass that already ignores timestamps.
    pub fn trigger(&mut self, bytes: &[u8]) {
        let mut incoming = ScanFlags::NONE;
        let mut deferred = ScanFlags::NONE;

        for &byte in bytes {
            match Trigger::from_byte(byte) {
                Some(Trigger::ScanAll) => {
                    incoming |= ScanFlags::SCAN_ALL;
                    deferred |= ScanFlags::SCAN_ALL;
                }
                Some(Trigger::FlushDead) => {
                    let flush = ScanFlags::FLUSH_ONCE | ScanFlags::FLUSH_DFXP;
                    incoming |= flush;
                    deferred |= flush;
                }
                Some(Trigger::ScanIncoming | Trigger::Wakeup) => incoming |= ScanFlags::START,
                Some(Trigger::ScanDeferred) => deferred |= ScanFlags::START,
                None => internal!(level = DEBUG, byte, "ignoring unknown trigger request"),
            }
        }

        // One flush is enough for both areas.
        if deferred.flush_once {
            incoming.flush_once = false;
        }
        if deferred != ScanFlags::NONE {
            self.scan_request(QueueArea::Deferred, deferred);
        }
        if incoming != ScanFlags::NONE {
            self.scan_request(QueueArea::Incoming, incoming);
        }
    }
}
