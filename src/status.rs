use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

/// Whether a modem was found at startup, and in what shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RockBlockStatus {
    #[default]
    Unknown,
    Installed,
    Missing,
    Broken,
}

impl fmt::Display for RockBlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RockBlockStatus::Unknown => "Unknown",
            RockBlockStatus::Installed => "Installed",
            RockBlockStatus::Missing => "Missing",
            RockBlockStatus::Broken => "Broken",
        };
        f.write_str(s)
    }
}

/// Last-known state of the modem and the link, as shown in the UI.
#[derive(Debug, Clone, Default)]
pub struct Status {
    /// Signal bars, 0-5 (-1 after a failed reading).
    pub signal_strength: i32,
    /// Whether the last reading met the send threshold.
    pub signal_good: bool,
    /// When the signal was last measured.
    pub signal_time: Option<DateTime<Utc>>,
    pub rockblock: RockBlockStatus,
    /// MO status code of the most recent failed transmission.
    pub last_txfailed_mo_status: i32,
    /// Modem IMEI, once read.
    pub serial_identifier: Option<String>,
    /// Senders with messages the user has not looked at yet.
    pub pending_senders: BTreeSet<String>,
}

/// Process-wide snapshot of [`Status`].
///
/// The queue-manager worker is the only writer; UI handlers read
/// best-effort snapshots and never block on driver I/O.
#[derive(Clone, Default)]
pub struct StatusCache {
    inner: Arc<Mutex<Status>>,
}

impl StatusCache {
    pub fn new() -> StatusCache {
        StatusCache::default()
    }

    pub fn snapshot(&self) -> Status {
        self.inner.lock().unwrap().clone()
    }

    pub(crate) fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Status) -> R,
    {
        f(&mut self.inner.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_detached() {
        let cache = StatusCache::new();
        cache.update(|s| {
            s.signal_strength = 4;
            s.signal_good = true;
            s.pending_senders.insert("alice".to_string());
        });

        let snap = cache.snapshot();
        cache.update(|s| s.signal_strength = 0);

        assert_eq!(snap.signal_strength, 4);
        assert!(snap.signal_good);
        assert!(snap.pending_senders.contains("alice"));
        assert_eq!(cache.snapshot().signal_strength, 0);
    }

    #[test]
    fn status_display() {
        assert_eq!(RockBlockStatus::Installed.to_string(), "Installed");
        assert_eq!(RockBlockStatus::default(), RockBlockStatus::Unknown);
    }
}
