use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use super::RepositoryError;
use crate::event::{EventKey, EventRecord};

/// Point-in-time counts keyed by `"<Type>-<ChangeType>"`.
pub type EventCounts = BTreeMap<String, u64>;

/// Aggregate view over every decoded event.
///
/// Implementations must tolerate any number of concurrent `record` and
/// `counts` callers. `counts` hands out an owned copy that later writes never
/// touch.
pub trait EventRepository: Send + Sync {
    /// Count one decoded event.
    fn record(&self, event: &EventRecord) -> Result<(), RepositoryError>;

    /// Snapshot of all counts.
    fn counts(&self) -> Result<EventCounts, RepositoryError>;
}

impl<T: EventRepository + ?Sized> EventRepository for Arc<T> {
    fn record(&self, event: &EventRecord) -> Result<(), RepositoryError> {
        (**self).record(event)
    }

    fn counts(&self) -> Result<EventCounts, RepositoryError> {
        (**self).counts()
    }
}

#[derive(Debug)]
struct Slot {
    count: u64,
    last: EventRecord,
}

/// Lock-protected counter map with copy-on-read snapshots.
#[derive(Debug, Default)]
pub struct InMemoryEventRepository {
    slots: RwLock<HashMap<String, Slot>>,
}

impl InMemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent record seen for `key`, if any.
    pub fn last_seen(&self, key: &EventKey) -> Option<EventRecord> {
        self.slots
            .read()
            .get(&key.to_string())
            .map(|slot| slot.last.clone())
    }

    /// Total records counted across all keys.
    pub fn total(&self) -> u64 {
        self.slots.read().values().map(|slot| slot.count).sum()
    }
}

impl EventRepository for InMemoryEventRepository {
    fn record(&self, event: &EventRecord) -> Result<(), RepositoryError> {
        let key = event.key().to_string();

        let mut slots = self.slots.write();
        match slots.get_mut(&key) {
            Some(slot) => {
                slot.count += 1;
                slot.last = event.clone();
            }
            None => {
                slots.insert(
                    key,
                    Slot {
                        count: 1,
                        last: event.clone(),
                    },
                );
            }
        }

        Ok(())
    }

    fn counts(&self) -> Result<EventCounts, RepositoryError> {
        let slots = self.slots.read();
        Ok(slots
            .iter()
            .map(|(key, slot)| (key.clone(), slot.count))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChangeType, EventType};

    fn app(change: ChangeType) -> EventRecord {
        EventRecord::new(EventType::App, change)
    }

    #[test]
    fn test_record_and_counts() {
        let repo = InMemoryEventRepository::new();
        repo.record(&app(ChangeType::Add)).expect("record");
        repo.record(&app(ChangeType::Add)).expect("record");
        repo.record(&EventRecord::new(EventType::Node, ChangeType::Remove))
            .expect("record");

        let counts = repo.counts().expect("counts");
        assert_eq!(counts.len(), 2);
        assert_eq!(counts.get("APP-ADD"), Some(&2));
        assert_eq!(counts.get("NODE-REMOVE"), Some(&1));
        assert_eq!(repo.total(), 3);
    }

    #[test]
    fn test_empty_counts() {
        let repo = InMemoryEventRepository::new();
        assert!(repo.counts().expect("counts").is_empty());
    }

    #[test]
    fn test_concurrent_record() {
        let repo = Arc::new(InMemoryEventRepository::new());

        std::thread::scope(|s| {
            for _ in 0..10 {
                let repo = Arc::clone(&repo);
                s.spawn(move || {
                    for _ in 0..200 {
                        repo.record(&app(ChangeType::Add)).expect("record");
                        repo.record(&app(ChangeType::Add)).expect("record");
                        repo.record(&app(ChangeType::Set)).expect("record");
                    }
                });
            }
        });

        let counts = repo.counts().expect("counts");
        assert_eq!(counts.get("APP-ADD"), Some(&4000));
        assert_eq!(counts.get("APP-SET"), Some(&2000));
    }

    #[test]
    fn test_snapshot_isolation() {
        let repo = InMemoryEventRepository::new();
        repo.record(&app(ChangeType::Add)).expect("record");

        let before = repo.counts().expect("counts");
        repo.record(&app(ChangeType::Add)).expect("record");
        repo.record(&app(ChangeType::Remove)).expect("record");

        assert_eq!(before.get("APP-ADD"), Some(&1));
        assert!(!before.contains_key("APP-REMOVE"));

        let after = repo.counts().expect("counts");
        assert_eq!(after.get("APP-ADD"), Some(&2));
        assert_eq!(after.get("APP-REMOVE"), Some(&1));
    }

    #[test]
    fn test_counts_concurrent_with_writers() {
        let repo = Arc::new(InMemoryEventRepository::new());

        std::thread::scope(|s| {
            let writer = Arc::clone(&repo);
            s.spawn(move || {
                for _ in 0..1000 {
                    writer.record(&app(ChangeType::Add)).expect("record");
                }
            });

            for _ in 0..4 {
                let reader = Arc::clone(&repo);
                s.spawn(move || {
                    let mut last = 0;
                    for _ in 0..200 {
                        let now = reader
                            .counts()
                            .expect("counts")
                            .get("APP-ADD")
                            .copied()
                            .unwrap_or(0);
                        assert!(now >= last, "counts went backwards");
                        last = now;
                    }
                });
            }
        });

        assert_eq!(repo.counts().expect("counts").get("APP-ADD"), Some(&1000));
    }

    #[test]
    fn test_last_seen() {
        let repo = InMemoryEventRepository::new();
        let mut first = app(ChangeType::Add);
        first.object_id = "app-1".to_string();
        let mut second = app(ChangeType::Add);
        second.object_id = "app-2".to_string();

        repo.record(&first).expect("record");
        repo.record(&second).expect("record");

        let last = repo.last_seen(&second.key()).expect("seen");
        assert_eq!(last.object_id, "app-2");
        assert!(repo
            .last_seen(&EventRecord::new(EventType::Queue, ChangeType::Add).key())
            .is_none());
    }
}
