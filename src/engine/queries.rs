use std::cmp::Ordering;
use std::collections::BTreeSet;

use ulid::Ulid;

use crate::model::*;

use super::Engine;

impl Engine {
    /// Stored, non-deleted record.
    pub(super) fn live_record(&self, id: &Ulid) -> Option<EventRecord> {
        self.store.get(id).filter(|r| !r.deleted)
    }

    /// Resolve stage and talent references. Unknown ids resolve to id-only refs.
    pub fn view(&self, event: EventRecord) -> EventView {
        let stage = event.stage_id.map(|id| StageRef {
            id,
            name: self.stages.get(&id).map(|n| n.value().clone()),
        });
        let talent_ref = |id: &Ulid| TalentRef {
            id: *id,
            name: self.talents.get(id).map(|n| n.value().clone()),
        };
        let talents = event.talent_ids.iter().map(talent_ref).collect();
        let collaborators = event.collaborator_ids.iter().map(talent_ref).collect();
        EventView {
            event,
            stage,
            talents,
            collaborators,
        }
    }

    pub fn get_event(&self, id: &Ulid) -> Option<EventView> {
        self.live_record(id).map(|r| self.view(r))
    }

    /// Names of non-deleted bookings on `stage_id` overlapping `[span.start, span.end)`,
    /// other than `exclude`. Unstaged candidates never conflict.
    pub fn find_overlaps(
        &self,
        span: &Span,
        stage_id: Option<Ulid>,
        exclude: Option<Ulid>,
    ) -> Vec<String> {
        match stage_id {
            Some(stage_id) => self.store.find_overlaps(&stage_id, span, exclude),
            None => Vec::new(),
        }
    }

    pub fn list_events(&self, filter: &EventFilter) -> Vec<EventView> {
        let mut records = self.store.scan(&|r| self.matches(r, filter));
        records.sort_by(|a, b| compare_by_start(a, b, filter.order));
        records.into_iter().map(|r| self.view(r)).collect()
    }

    fn matches(&self, r: &EventRecord, f: &EventFilter) -> bool {
        match f.modified_since {
            Some(since) => {
                if r.last_modified < since {
                    return false;
                }
            }
            None => {
                if r.deleted {
                    return false;
                }
            }
        }
        if !f.ids.is_empty() && !f.ids.contains(&r.id) {
            return false;
        }
        if f.end_from.is_some() || f.end_to.is_some() {
            let Some(end) = r.end() else {
                return false;
            };
            if f.end_from.is_some_and(|from| end < from) || f.end_to.is_some_and(|to| end > to) {
                return false;
            }
        }
        // Stage and talent criteria are alternatives, not a conjunction.
        if !f.stage_ids.is_empty() || !f.talent_ids.is_empty() {
            let on_stage = r.stage_id.is_some_and(|s| f.stage_ids.contains(&s));
            let with_talent = f.talent_ids.iter().any(|t| r.involves_talent(t));
            if !on_stage && !with_talent {
                return false;
            }
        }
        if let Some(kind) = &f.kind
            && r.kind.as_ref() != Some(kind)
        {
            return false;
        }
        if !f.tags.is_empty() && !r.tags.iter().any(|t| f.tags.contains(t)) {
            return false;
        }
        if let Some(q) = &f.q
            && !self.matches_text(r, &q.to_lowercase())
        {
            return false;
        }
        true
    }

    /// Case-insensitive search over event, stage and talent names.
    fn matches_text(&self, r: &EventRecord, needle: &str) -> bool {
        if r.name.to_lowercase().contains(needle) {
            return true;
        }
        if let Some(stage_id) = r.stage_id
            && let Some(name) = self.stages.get(&stage_id)
            && name.to_lowercase().contains(needle)
        {
            return true;
        }
        r.talent_ids
            .iter()
            .chain(r.collaborator_ids.iter())
            .filter_map(|id| self.talents.get(id))
            .any(|name| name.to_lowercase().contains(needle))
    }

    /// Distinct non-empty tags of live events, sorted.
    pub fn tags(&self) -> Vec<String> {
        let tags: BTreeSet<String> = self
            .store
            .scan(&|r| !r.deleted)
            .into_iter()
            .flat_map(|r| r.tags)
            .filter(|t| !t.is_empty())
            .collect();
        tags.into_iter().collect()
    }

    /// Does a live event match every given reference? Malformed ids never match.
    pub fn event_exists(
        &self,
        event_id: Option<&str>,
        talent_id: Option<&str>,
        stage_id: Option<&str>,
    ) -> bool {
        let parse = |v: Option<&str>| -> Result<Option<Ulid>, ()> {
            v.map(|s| Ulid::from_string(s).map_err(|_| ())).transpose()
        };
        let (Ok(event_id), Ok(talent_id), Ok(stage_id)) =
            (parse(event_id), parse(talent_id), parse(stage_id))
        else {
            return false;
        };
        if let Some(id) = event_id {
            return self
                .live_record(&id)
                .is_some_and(|r| matches_refs(&r, talent_id, stage_id));
        }
        self.store
            .any_live(&|r| matches_refs(r, talent_id, stage_id))
    }

    pub fn list_stages(&self) -> Vec<StageInfo> {
        let mut stages: Vec<StageInfo> = self
            .stages
            .iter()
            .map(|e| StageInfo {
                id: *e.key(),
                name: e.value().clone(),
            })
            .collect();
        stages.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        stages
    }

    pub fn list_talents(&self) -> Vec<TalentInfo> {
        let mut talents: Vec<TalentInfo> = self
            .talents
            .iter()
            .map(|e| TalentInfo {
                id: *e.key(),
                name: e.value().clone(),
            })
            .collect();
        talents.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        talents
    }
}

fn matches_refs(r: &EventRecord, talent_id: Option<Ulid>, stage_id: Option<Ulid>) -> bool {
    talent_id.is_none_or(|t| r.involves_talent(&t)) && stage_id.is_none_or(|s| r.stage_id == Some(s))
}

/// Dated events first in start order, undated ones last; id breaks ties.
fn compare_by_start(a: &EventRecord, b: &EventRecord, order: SortOrder) -> Ordering {
    let by_start = match (a.start(), b.start()) {
        (Some(x), Some(y)) => match order {
            SortOrder::StartAsc => x.cmp(&y),
            SortOrder::StartDesc => y.cmp(&x),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_start.then(a.id.cmp(&b.id))
}
