use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A booking on a stage timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub event_id: Ulid,
    pub span: Span,
}

/// Every live booking of one stage, sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct StageTimeline {
    pub slots: Vec<Slot>,
}

impl StageTimeline {
    /// Insert slot maintaining sort order by span.start.
    pub fn insert(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove(&mut self, event_id: Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.event_id == event_id)?;
        Some(self.slots.remove(pos))
    }

    /// Slots whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Slot> {
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A stored event. `span` holds start/end as a pair so one can never be set
/// without the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Ulid,
    pub name: String,
    pub stage_id: Option<Ulid>,
    pub span: Option<Span>,
    pub talent_ids: Vec<Ulid>,
    pub collaborator_ids: Vec<Ulid>,
    pub tags: Vec<String>,
    pub kind: Option<String>,
    pub description: Option<String>,
    pub deleted: bool,
    pub last_modified: Ms,
}

impl EventRecord {
    pub fn start(&self) -> Option<Ms> {
        self.span.map(|s| s.start)
    }

    pub fn end(&self) -> Option<Ms> {
        self.span.map(|s| s.end)
    }

    /// The stage timeline slot this event occupies, if any.
    pub fn slot(&self) -> Option<(Ulid, Slot)> {
        if self.deleted {
            return None;
        }
        match (self.stage_id, self.span) {
            (Some(stage_id), Some(span)) => Some((
                stage_id,
                Slot {
                    event_id: self.id,
                    span,
                },
            )),
            _ => None,
        }
    }

    pub fn involves_talent(&self, talent_id: &Ulid) -> bool {
        self.talent_ids.contains(talent_id) || self.collaborator_ids.contains(talent_id)
    }
}

/// Create payload. `id` is assigned by the engine when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewEvent {
    pub id: Option<Ulid>,
    pub name: String,
    pub stage_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub talent_ids: Vec<Ulid>,
    pub collaborator_ids: Vec<Ulid>,
    pub tags: Vec<String>,
    pub kind: Option<String>,
    pub description: Option<String>,
}

/// Sparse update payload. `None` means "not part of the update";
/// `Some(None)` on a nullable field means "set to null".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPatch {
    pub name: Option<String>,
    pub stage_id: Option<Option<Ulid>>,
    pub start: Option<Option<Ms>>,
    pub end: Option<Option<Ms>>,
    pub talent_ids: Option<Vec<Ulid>>,
    pub collaborator_ids: Option<Vec<Ulid>>,
    pub tags: Option<Vec<String>>,
    pub kind: Option<Option<String>>,
    pub description: Option<Option<String>>,
}

impl EventPatch {
    pub fn is_empty(&self) -> bool {
        *self == EventPatch::default()
    }

    /// True when the update can move the event on the schedule.
    pub fn touches_schedule(&self) -> bool {
        self.start.is_some() || self.end.is_some() || self.stage_id.is_some()
    }

    /// Overlay the patch onto the current schedule fields.
    pub fn effective_schedule(&self, current: &EventRecord) -> (Option<Ulid>, Option<Ms>, Option<Ms>) {
        (
            self.stage_id.unwrap_or(current.stage_id),
            self.start.unwrap_or(current.start()),
            self.end.unwrap_or(current.end()),
        )
    }

    /// Apply to a record. Start/end are resolved against the record's
    /// current span; a half-set pair clears the span.
    pub fn apply(&self, rec: &mut EventRecord, last_modified: Ms) {
        if let Some(name) = &self.name {
            rec.name = name.clone();
        }
        if self.touches_schedule() {
            let (stage_id, start, end) = self.effective_schedule(rec);
            rec.stage_id = stage_id;
            rec.span = match (start, end) {
                (Some(s), Some(e)) => Some(Span::new(s, e)),
                _ => None,
            };
        }
        if let Some(ids) = &self.talent_ids {
            rec.talent_ids = ids.clone();
        }
        if let Some(ids) = &self.collaborator_ids {
            rec.collaborator_ids = ids.clone();
        }
        if let Some(tags) = &self.tags {
            rec.tags = tags.clone();
        }
        if let Some(kind) = &self.kind {
            rec.kind = kind.clone();
        }
        if let Some(description) = &self.description {
            rec.description = description.clone();
        }
        rec.last_modified = last_modified;
    }
}

/// The WAL record format. One variant per committed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    EventCreated {
        record: EventRecord,
    },
    EventUpdated {
        id: Ulid,
        patch: EventPatch,
        last_modified: Ms,
    },
    EventDeleted {
        id: Ulid,
        last_modified: Ms,
    },
    StageRegistered {
        id: Ulid,
        name: String,
    },
    TalentRegistered {
        id: Ulid,
        name: String,
    },
}

impl Mutation {
    /// Short label used in notifications and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::EventCreated { .. } => "event_created",
            Mutation::EventUpdated { .. } => "event_updated",
            Mutation::EventDeleted { .. } => "event_deleted",
            Mutation::StageRegistered { .. } => "stage_registered",
            Mutation::TalentRegistered { .. } => "talent_registered",
        }
    }
}

// ── Directory & read-side types ──────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInfo {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalentInfo {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRef {
    pub id: Ulid,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalentRef {
    pub id: Ulid,
    pub name: Option<String>,
}

/// An event with its stage and talents resolved against the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventView {
    pub event: EventRecord,
    pub stage: Option<StageRef>,
    pub talents: Vec<TalentRef>,
    pub collaborators: Vec<TalentRef>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    StartAsc,
    StartDesc,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub ids: Vec<Ulid>,
    pub stage_ids: Vec<Ulid>,
    pub talent_ids: Vec<Ulid>,
    pub kind: Option<String>,
    pub tags: Vec<String>,
    pub end_from: Option<Ms>,
    pub end_to: Option<Ms>,
    /// Incremental sync: include deleted events modified at or after this instant.
    pub modified_since: Option<Ms>,
    pub q: Option<String>,
    pub order: SortOrder,
}
