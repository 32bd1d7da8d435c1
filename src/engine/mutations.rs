use std::sync::atomic::Ordering;

use tokio::sync::oneshot;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::time::now_ms;

use super::schedule::validate_dates;
use super::{Engine, EngineError, WalCommand};

/// Count and log a scheduling rejection on its way out.
fn rejected(err: EngineError) -> EngineError {
    if err.is_schedule_rejection() {
        metrics::counter!(crate::observability::SCHEDULE_REJECTIONS_TOTAL, "reason" => err.reason())
            .increment(1);
        debug!("schedule rejected: {err}");
    }
    err
}

fn check_name(name: &str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_tags(tags: &[String]) -> Result<(), EngineError> {
    if tags.len() > MAX_TAGS_PER_EVENT {
        return Err(EngineError::LimitExceeded("too many tags"));
    }
    if tags.iter().any(|t| t.len() > MAX_TAG_LEN) {
        return Err(EngineError::LimitExceeded("tag too long"));
    }
    Ok(())
}

fn check_talents(ids: &[Ulid]) -> Result<(), EngineError> {
    if ids.len() > MAX_TALENTS_PER_EVENT {
        return Err(EngineError::LimitExceeded("too many talents"));
    }
    Ok(())
}

fn check_description(description: Option<&String>) -> Result<(), EngineError> {
    if description.is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    Ok(())
}

fn check_patch_fields(patch: &EventPatch) -> Result<(), EngineError> {
    if let Some(name) = &patch.name {
        check_name(name)?;
    }
    if let Some(tags) = &patch.tags {
        check_tags(tags)?;
    }
    if let Some(ids) = &patch.talent_ids {
        check_talents(ids)?;
    }
    if let Some(ids) = &patch.collaborator_ids {
        check_talents(ids)?;
    }
    if let Some(description) = &patch.description {
        check_description(description.as_ref())?;
    }
    Ok(())
}

fn check_stage_ref(engine: &Engine, stage_id: Option<Ulid>) -> Result<(), EngineError> {
    match stage_id {
        Some(id) if !engine.stages.contains_key(&id) => {
            Err(EngineError::UnknownReference { kind: "stage", id })
        }
        _ => Ok(()),
    }
}

fn check_talent_refs(engine: &Engine, kind: &'static str, ids: &[Ulid]) -> Result<(), EngineError> {
    match ids.iter().find(|id| !engine.talents.contains_key(*id)) {
        Some(&id) => Err(EngineError::UnknownReference { kind, id }),
        None => Ok(()),
    }
}

/// Only the references the patch sets are checked.
fn check_patch_refs(engine: &Engine, patch: &EventPatch) -> Result<(), EngineError> {
    if let Some(ids) = &patch.talent_ids {
        check_talent_refs(engine, "talent", ids)?;
    }
    if let Some(ids) = &patch.collaborator_ids {
        check_talent_refs(engine, "collaborator", ids)?;
    }
    check_stage_ref(engine, patch.stage_id.flatten())
}

/// A create between admission and commit. Reserves its id against other
/// creates of the same id and one slot of the per-tenant event cap.
struct Admission<'a> {
    engine: &'a Engine,
    id: Ulid,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.engine.creates_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.engine.pending_ids.remove(&self.id);
    }
}

/// Date validation plus overlap check against the stage timeline.
/// Caller holds the gate of `stage_id`.
fn check_schedule(
    engine: &Engine,
    stage_id: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
    exclude: Option<Ulid>,
) -> Result<Option<Span>, EngineError> {
    let span = validate_dates(start, end).map_err(rejected)?;
    if let (Some(stage_id), Some(span)) = (stage_id, span) {
        let overlaps = engine.store.find_overlaps(&stage_id, &span, exclude);
        if !overlaps.is_empty() {
            return Err(rejected(EngineError::EventsOverlap(overlaps)));
        }
    }
    Ok(span)
}

impl Engine {
    /// Validate and persist a new event. Dates are truncated to the minute
    /// before the overlap check and before storage.
    pub async fn create_event(&self, new: NewEvent) -> Result<EventView, EngineError> {
        check_name(&new.name)?;
        check_tags(&new.tags)?;
        check_talents(&new.talent_ids)?;
        check_talents(&new.collaborator_ids)?;
        check_description(new.description.as_ref())?;
        // Presence/order/range/duration first: these need no lock.
        validate_dates(new.start, new.end).map_err(rejected)?;
        // Directory entries are never removed, so these hold once true.
        check_talent_refs(self, "talent", &new.talent_ids)?;
        check_talent_refs(self, "collaborator", &new.collaborator_ids)?;
        check_stage_ref(self, new.stage_id)?;

        let id = new.id.unwrap_or_else(Ulid::new);
        let _admission = self.admit(id)?;
        let _gates = self.lock_gates(vec![new.stage_id]).await;

        let span = check_schedule(self, new.stage_id, new.start, new.end, None)?;

        let record = EventRecord {
            id,
            name: new.name,
            stage_id: new.stage_id,
            span,
            talent_ids: new.talent_ids,
            collaborator_ids: new.collaborator_ids,
            tags: new.tags,
            kind: new.kind,
            description: new.description,
            deleted: false,
            last_modified: now_ms(),
        };
        let stage_id = record.stage_id;
        let mutation = Mutation::EventCreated {
            record: record.clone(),
        };
        self.persist_and_apply(&mutation, &[stage_id]).await?;
        debug!(%id, "event created");
        Ok(self.view(record))
    }

    /// Reserve `id` for a create and count it against the event cap until
    /// the returned guard drops. Fails when the id is stored or another
    /// create of it is in flight.
    fn admit(&self, id: Ulid) -> Result<Admission<'_>, EngineError> {
        if !self.pending_ids.insert(id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let in_flight = self.creates_in_flight.fetch_add(1, Ordering::SeqCst);
        let admission = Admission { engine: self, id };
        if self.store.get(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        // Every earlier admission either still counts here or is already stored.
        if self.store.len() + in_flight >= MAX_EVENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many events"));
        }
        Ok(admission)
    }

    /// Merge `patch` over the stored event and persist it.
    ///
    /// Returns `Ok(None)` when the event does not exist (or is deleted).
    /// Updates that touch start, end or stage are re-validated against the
    /// effective post-update values, with the event's own booking excluded
    /// from the overlap check.
    pub async fn update_event(
        &self,
        id: Ulid,
        patch: EventPatch,
    ) -> Result<Option<EventView>, EngineError> {
        check_patch_fields(&patch)?;
        check_patch_refs(self, &patch)?;

        for _ in 0..MAX_GATE_RETRIES {
            let Some(current) = self.live_record(&id) else {
                return Ok(None);
            };
            if patch.is_empty() {
                return Ok(Some(self.view(current)));
            }

            let mut keys = vec![current.stage_id];
            if patch.touches_schedule() {
                keys.push(patch.stage_id.unwrap_or(current.stage_id));
            }
            let _gates = self.lock_gates(keys).await;

            // Re-read under the gates; a concurrent stage move means we locked
            // the wrong timeline.
            let current = match self.live_record(&id) {
                None => return Ok(None),
                Some(c) if c.stage_id != current.stage_id => continue,
                Some(c) => c,
            };

            let resolved = if patch.touches_schedule() {
                let (stage_id, start, end) = patch.effective_schedule(&current);
                let span = check_schedule(self, stage_id, start, end, Some(id))?;
                EventPatch {
                    stage_id: Some(stage_id),
                    start: Some(span.map(|s| s.start)),
                    end: Some(span.map(|s| s.end)),
                    ..patch.clone()
                }
            } else {
                patch.clone()
            };

            let target_stage = resolved.stage_id.unwrap_or(current.stage_id);
            let mutation = Mutation::EventUpdated {
                id,
                patch: resolved,
                last_modified: now_ms(),
            };
            self.persist_and_apply(&mutation, &[current.stage_id, target_stage])
                .await?;
            debug!(%id, "event updated");
            return Ok(self.get_event(&id));
        }
        Err(EngineError::LimitExceeded("event moved concurrently too many times"))
    }

    /// Soft delete. Returns false when the event is absent or already deleted.
    pub async fn delete_event(&self, id: Ulid) -> Result<bool, EngineError> {
        for _ in 0..MAX_GATE_RETRIES {
            let Some(current) = self.live_record(&id) else {
                return Ok(false);
            };
            let _gates = self.lock_gates(vec![current.stage_id]).await;
            match self.live_record(&id) {
                None => return Ok(false),
                Some(c) if c.stage_id != current.stage_id => continue,
                Some(_) => {}
            }

            let mutation = Mutation::EventDeleted {
                id,
                last_modified: now_ms(),
            };
            self.persist_and_apply(&mutation, &[current.stage_id]).await?;
            debug!(%id, "event deleted");
            return Ok(true);
        }
        Err(EngineError::LimitExceeded("event moved concurrently too many times"))
    }

    /// Upsert a stage name in the directory.
    pub async fn register_stage(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        check_name(&name)?;
        if !self.stages.contains_key(&id) && self.stages.len() >= MAX_DIRECTORY_ENTRIES {
            return Err(EngineError::LimitExceeded("too many stages"));
        }
        let mutation = Mutation::StageRegistered { id, name };
        self.persist_and_apply(&mutation, &[Some(id)]).await
    }

    /// Upsert a talent name in the directory.
    pub async fn register_talent(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        check_name(&name)?;
        if !self.talents.contains_key(&id) && self.talents.len() >= MAX_DIRECTORY_ENTRIES {
            return Err(EngineError::LimitExceeded("too many talents"));
        }
        let mutation = Mutation::TalentRegistered { id, name };
        self.persist_and_apply(&mutation, &[]).await
    }

    /// Compact the WAL by rewriting it with only the mutations needed to
    /// recreate the current state. Deleted events are kept so incremental
    /// sync consumers still see the tombstone.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _commit = self.commit_lock.write().await;
        let mut mutations = Vec::new();

        for entry in self.stages.iter() {
            mutations.push(Mutation::StageRegistered {
                id: *entry.key(),
                name: entry.value().clone(),
            });
        }
        for entry in self.talents.iter() {
            mutations.push(Mutation::TalentRegistered {
                id: *entry.key(),
                name: entry.value().clone(),
            });
        }
        let mut records = self.store.scan(&|_| true);
        records.sort_by_key(|r| r.id);
        mutations.extend(records.into_iter().map(|record| Mutation::EventCreated { record }));

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                mutations,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
