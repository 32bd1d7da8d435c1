use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::schedule::overlapping_ids;

/// Persistence seam for event records.
///
/// Implementations need not be transactional: the engine serializes every
/// write that can affect a stage timeline before calling in.
pub trait BookingStore: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point lookup, deleted records included.
    fn get(&self, id: &Ulid) -> Option<EventRecord>;

    /// Store a new record and return its id.
    fn insert(&self, record: EventRecord) -> Ulid;

    /// Apply a partial update. Returns false when the id is unknown.
    fn update(&self, id: &Ulid, patch: &EventPatch, last_modified: Ms) -> bool;

    /// Mark deleted and drop from the stage timeline. Returns false when the
    /// id is unknown or already deleted.
    fn soft_delete(&self, id: &Ulid, last_modified: Ms) -> bool;

    /// Names of non-deleted events on `stage_id` with
    /// `existing.start < span.end && existing.end > span.start`, skipping `exclude`.
    fn find_overlaps(&self, stage_id: &Ulid, span: &Span, exclude: Option<Ulid>) -> Vec<String>;

    /// Snapshot of every record matching the predicate, deleted included.
    fn scan(&self, predicate: &dyn Fn(&EventRecord) -> bool) -> Vec<EventRecord>;

    /// True if any non-deleted record matches.
    fn any_live(&self, predicate: &dyn Fn(&EventRecord) -> bool) -> bool;
}

pub struct InMemoryStore {
    events: DashMap<Ulid, EventRecord>,
    /// Stage id → live bookings sorted by start.
    timelines: DashMap<Ulid, StageTimeline>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            events: DashMap::new(),
            timelines: DashMap::new(),
        }
    }

    // ── Timeline index ───────────────────────────────────────
    // Callers never hold an `events` guard while touching `timelines`.

    fn index(&self, stage_id: Ulid, slot: Slot) {
        self.timelines.entry(stage_id).or_default().insert(slot);
    }

    fn unindex(&self, stage_id: &Ulid, event_id: Ulid) {
        let now_empty = match self.timelines.get_mut(stage_id) {
            Some(mut tl) => {
                tl.remove(event_id);
                tl.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.timelines.remove_if(stage_id, |_, tl| tl.is_empty());
        }
    }

    pub fn stage_booking_count(&self, stage_id: &Ulid) -> usize {
        self.timelines.get(stage_id).map_or(0, |tl| tl.slots.len())
    }
}

impl BookingStore for InMemoryStore {
    fn len(&self) -> usize {
        self.events.len()
    }

    fn get(&self, id: &Ulid) -> Option<EventRecord> {
        self.events.get(id).map(|e| e.value().clone())
    }

    fn insert(&self, record: EventRecord) -> Ulid {
        let id = record.id;
        let slot = record.slot();
        if let Some(old) = self.events.insert(id, record)
            && let Some((stage_id, _)) = old.slot()
        {
            self.unindex(&stage_id, id);
        }
        if let Some((stage_id, slot)) = slot {
            self.index(stage_id, slot);
        }
        id
    }

    fn update(&self, id: &Ulid, patch: &EventPatch, last_modified: Ms) -> bool {
        let (old_slot, new_slot) = {
            let Some(mut rec) = self.events.get_mut(id) else {
                return false;
            };
            let old_slot = rec.slot();
            patch.apply(&mut rec, last_modified);
            (old_slot, rec.slot())
        };
        if old_slot != new_slot {
            if let Some((stage_id, _)) = old_slot {
                self.unindex(&stage_id, *id);
            }
            if let Some((stage_id, slot)) = new_slot {
                self.index(stage_id, slot);
            }
        }
        true
    }

    fn soft_delete(&self, id: &Ulid, last_modified: Ms) -> bool {
        let old_slot = {
            let Some(mut rec) = self.events.get_mut(id) else {
                return false;
            };
            if rec.deleted {
                return false;
            }
            let old_slot = rec.slot();
            rec.deleted = true;
            rec.last_modified = last_modified;
            old_slot
        };
        if let Some((stage_id, _)) = old_slot {
            self.unindex(&stage_id, *id);
        }
        true
    }

    fn find_overlaps(&self, stage_id: &Ulid, span: &Span, exclude: Option<Ulid>) -> Vec<String> {
        let ids = match self.timelines.get(stage_id) {
            Some(tl) => overlapping_ids(&tl, span, exclude),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.events.get(id))
            .filter(|rec| !rec.deleted)
            .map(|rec| rec.name.clone())
            .collect()
    }

    fn scan(&self, predicate: &dyn Fn(&EventRecord) -> bool) -> Vec<EventRecord> {
        self.events
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }

    fn any_live(&self, predicate: &dyn Fn(&EventRecord) -> bool) -> bool {
        self.events
            .iter()
            .any(|e| !e.value().deleted && predicate(e.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = 60_000;

    fn record(name: &str, stage_id: Option<Ulid>, span: Option<Span>) -> EventRecord {
        EventRecord {
            id: Ulid::new(),
            name: name.into(),
            stage_id,
            span,
            talent_ids: vec![],
            collaborator_ids: vec![],
            tags: vec![],
            kind: None,
            description: None,
            deleted: false,
            last_modified: 0,
        }
    }

    #[test]
    fn insert_indexes_booking() {
        let store = InMemoryStore::new();
        let stage = Ulid::new();
        store.insert(record("a", Some(stage), Some(Span::new(0, 60 * M))));
        store.insert(record("no dates", Some(stage), None));
        store.insert(record("no stage", None, Some(Span::new(0, 60 * M))));
        assert_eq!(store.len(), 3);
        assert_eq!(store.stage_booking_count(&stage), 1);
    }

    #[test]
    fn find_overlaps_half_open_and_exclusion() {
        let store = InMemoryStore::new();
        let stage = Ulid::new();
        let a = store.insert(record("a", Some(stage), Some(Span::new(0, 60 * M))));

        assert_eq!(
            store.find_overlaps(&stage, &Span::new(30 * M, 90 * M), None),
            vec!["a".to_string()]
        );
        assert!(store.find_overlaps(&stage, &Span::new(60 * M, 90 * M), None).is_empty());
        assert!(store.find_overlaps(&stage, &Span::new(30 * M, 90 * M), Some(a)).is_empty());
        assert!(store.find_overlaps(&Ulid::new(), &Span::new(0, 60 * M), None).is_empty());
    }

    #[test]
    fn update_moves_booking_between_stages() {
        let store = InMemoryStore::new();
        let s1 = Ulid::new();
        let s2 = Ulid::new();
        let id = store.insert(record("a", Some(s1), Some(Span::new(0, 60 * M))));

        let patch = EventPatch {
            stage_id: Some(Some(s2)),
            ..Default::default()
        };
        assert!(store.update(&id, &patch, 7));
        assert_eq!(store.stage_booking_count(&s1), 0);
        assert_eq!(store.stage_booking_count(&s2), 1);
        assert_eq!(store.get(&id).unwrap().last_modified, 7);
        assert!(!store.update(&Ulid::new(), &patch, 8));
    }

    #[test]
    fn soft_delete_leaves_record_but_frees_slot() {
        let store = InMemoryStore::new();
        let stage = Ulid::new();
        let id = store.insert(record("a", Some(stage), Some(Span::new(0, 60 * M))));

        assert!(store.soft_delete(&id, 9));
        assert!(!store.soft_delete(&id, 10));
        let rec = store.get(&id).unwrap();
        assert!(rec.deleted);
        assert_eq!(rec.last_modified, 9);
        assert!(store.find_overlaps(&stage, &Span::new(0, 60 * M), None).is_empty());
        assert!(!store.any_live(&|r| r.id == id));
        assert_eq!(store.scan(&|r| r.id == id).len(), 1);
    }
}
