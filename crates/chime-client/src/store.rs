// Ordered, deduplicated notification list for one session.
use chime_common::{NotificationId, NotificationRecord, PulledRecord, ReadState};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable view handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub version: u64,
    pub records: Arc<[NotificationRecord]>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            version: 0,
            records: Arc::from(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NotificationRecord> {
        self.records.iter()
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub dropped: usize,
    pub changed: bool,
    pub version: u64,
}

/// Newest first: `created_at` descending, then `id` descending.
pub fn display_order(a: &NotificationRecord, b: &NotificationRecord) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

/// Records keyed by id plus a cached sorted view.
///
/// ```
/// use chime_client::NotificationStore;
/// use chime_common::NotificationRecord;
/// use chrono::{TimeZone, Utc};
///
/// let mut store = NotificationStore::new();
/// let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
/// let batch = vec![Ok(NotificationRecord::new(1_i64, "hello", at))];
/// assert!(store.merge(batch.clone()).changed);
/// assert!(!store.merge(batch).changed);
/// assert_eq!(store.version(), 1);
/// ```
#[derive(Debug)]
pub struct NotificationStore {
    records: HashMap<NotificationId, NotificationRecord>,
    sorted: Arc<[NotificationRecord]>,
    version: u64,
    dropped_total: u64,
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationStore {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            sorted: Arc::from(Vec::new()),
            version: 0,
            dropped_total: 0,
        }
    }

    /// Fold a pulled batch into the store. Never fails: malformed elements are
    /// dropped and counted. `version` moves only when content changed.
    pub fn merge<I>(&mut self, batch: I) -> MergeOutcome
    where
        I: IntoIterator<Item = PulledRecord>,
    {
        let mut outcome = MergeOutcome::default();
        for pulled in batch {
            let record = match pulled {
                Ok(record) => record,
                Err(malformed) => {
                    outcome.dropped += 1;
                    tracing::warn!(reason = %malformed.reason, "dropping malformed notification");
                    continue;
                }
            };
            match self.records.get(&record.id) {
                None => {
                    outcome.inserted += 1;
                    self.records.insert(record.id.clone(), record);
                }
                Some(existing) if *existing == record => outcome.unchanged += 1,
                Some(_) => {
                    outcome.updated += 1;
                    self.records.insert(record.id.clone(), record);
                }
            }
        }
        self.dropped_total += outcome.dropped as u64;
        outcome.changed = outcome.inserted > 0 || outcome.updated > 0;
        if outcome.changed {
            self.version += 1;
            self.rebuild_sorted();
        }
        outcome.version = self.version;
        outcome
    }

    /// Local read acknowledgement. Returns true when the record changed.
    pub fn mark_read(&mut self, id: &NotificationId) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if record.read_state == ReadState::Read {
            return false;
        }
        record.read_state = ReadState::Read;
        self.version += 1;
        self.rebuild_sorted();
        true
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: self.version,
            records: Arc::clone(&self.sorted),
        }
    }

    pub fn get(&self, id: &NotificationId) -> Option<&NotificationRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    fn rebuild_sorted(&mut self) {
        let mut sorted = self.records.values().cloned().collect::<Vec<_>>();
        sorted.sort_by(display_order);
        self.sorted = Arc::from(sorted);
    }
}
