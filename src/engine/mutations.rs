use tracing::{debug, warn};

use crate::limits::*;
use crate::model::*;

use super::conflict::check_new_allocation;
use super::{Engine, EngineError, Entity};

pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end).ok_or(EngineError::InvalidSpan { start, end })?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(span)
}

fn check_len(text: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if text.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn validate_event_text(title: &str, description: &str) -> Result<(), EngineError> {
    check_len(title, MAX_TITLE_LEN, "event title too long")?;
    check_len(description, MAX_DESCRIPTION_LEN, "event description too long")
}

fn validate_resource_text(name: &str, kind: &str) -> Result<(), EngineError> {
    check_len(name, MAX_NAME_LEN, "resource name too long")?;
    check_len(kind, MAX_KIND_LEN, "resource type too long")
}

impl Engine {
    // ── Events ───────────────────────────────────────────────

    pub async fn create_event(
        &self,
        title: String,
        start: Ms,
        end: Ms,
        description: String,
    ) -> Result<EventInfo, EngineError> {
        let span = validate_span(start, end)?;
        validate_event_text(&title, &description)?;

        let mut schedule = self.schedule.write().await;
        if schedule.events.len() >= MAX_EVENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many events"));
        }
        let event = EventInfo {
            id: schedule.next_event_id,
            title,
            span,
            description,
        };
        self.persist_and_apply(&mut schedule, Change::EventCreated { event: event.clone() })
            .await?;
        debug!(event_id = event.id, "event created");
        Ok(event)
    }

    /// Apply `patch` to an existing event. `Ok(None)` if the event does not exist.
    ///
    /// Conflict flags on the event's allocations are left as they were.
    pub async fn update_event(
        &self,
        id: Id,
        patch: EventPatch,
    ) -> Result<Option<EventInfo>, EngineError> {
        let mut schedule = self.schedule.write().await;
        let Some(current) = schedule.events.get(&id) else {
            debug!(event_id = id, "update of missing event ignored");
            return Ok(None);
        };

        let span = validate_span(
            patch.start.unwrap_or(current.span.start),
            patch.end.unwrap_or(current.span.end),
        )?;
        let event = EventInfo {
            id,
            title: patch.title.unwrap_or_else(|| current.title.clone()),
            span,
            description: patch.description.unwrap_or_else(|| current.description.clone()),
        };
        validate_event_text(&event.title, &event.description)?;

        self.persist_and_apply(&mut schedule, Change::EventUpdated { event: event.clone() })
            .await?;
        debug!(event_id = id, "event updated");
        Ok(Some(event))
    }

    /// Delete an event and every allocation referencing it.
    /// Returns `false` if the event does not exist.
    pub async fn delete_event(&self, id: Id) -> Result<bool, EngineError> {
        let mut schedule = self.schedule.write().await;
        if !schedule.events.contains_key(&id) {
            return Ok(false);
        }
        let cascaded = schedule
            .allocations
            .values()
            .filter(|a| a.event_id == id)
            .count();
        self.persist_and_apply(&mut schedule, Change::EventDeleted { id })
            .await?;
        debug!(event_id = id, cascaded, "event deleted");
        Ok(true)
    }

    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(
        &self,
        name: String,
        kind: String,
    ) -> Result<ResourceInfo, EngineError> {
        validate_resource_text(&name, &kind)?;

        let mut schedule = self.schedule.write().await;
        if schedule.resources.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        let resource = ResourceInfo {
            id: schedule.next_resource_id,
            name,
            kind,
        };
        self.persist_and_apply(
            &mut schedule,
            Change::ResourceCreated { resource: resource.clone() },
        )
        .await?;
        debug!(resource_id = resource.id, "resource created");
        Ok(resource)
    }

    /// Apply `patch` to an existing resource. `Ok(None)` if it does not exist.
    pub async fn update_resource(
        &self,
        id: Id,
        patch: ResourcePatch,
    ) -> Result<Option<ResourceInfo>, EngineError> {
        let mut schedule = self.schedule.write().await;
        let Some(current) = schedule.resources.get(&id) else {
            debug!(resource_id = id, "update of missing resource ignored");
            return Ok(None);
        };
        let resource = ResourceInfo {
            id,
            name: patch.name.unwrap_or_else(|| current.name.clone()),
            kind: patch.kind.unwrap_or_else(|| current.kind.clone()),
        };
        validate_resource_text(&resource.name, &resource.kind)?;

        self.persist_and_apply(
            &mut schedule,
            Change::ResourceUpdated { resource: resource.clone() },
        )
        .await?;
        debug!(resource_id = id, "resource updated");
        Ok(Some(resource))
    }

    /// Delete a resource and every allocation referencing it.
    /// Returns `false` if the resource does not exist.
    pub async fn delete_resource(&self, id: Id) -> Result<bool, EngineError> {
        let mut schedule = self.schedule.write().await;
        if !schedule.resources.contains_key(&id) {
            return Ok(false);
        }
        let cascaded = schedule
            .allocations
            .values()
            .filter(|a| a.resource_id == id)
            .count();
        self.persist_and_apply(&mut schedule, Change::ResourceDeleted { id })
            .await?;
        debug!(resource_id = id, cascaded, "resource deleted");
        Ok(true)
    }

    // ── Allocations ──────────────────────────────────────────

    /// Bind `resource_id` to `event_id`.
    ///
    /// A repeated pair is rejected before anything is written. Overlaps with
    /// other events on the resource do not block the allocation: it is stored
    /// with `conflict = true` and the overlaps are returned.
    pub async fn allocate(
        &self,
        event_id: Id,
        resource_id: Id,
    ) -> Result<AllocationOutcome, EngineError> {
        let mut schedule = self.schedule.write().await;
        let event = schedule
            .events
            .get(&event_id)
            .ok_or(EngineError::NotFound(Entity::Event, event_id))?;
        let resource = schedule
            .resources
            .get(&resource_id)
            .ok_or(EngineError::NotFound(Entity::Resource, resource_id))?;
        if schedule.find_allocation(event_id, resource_id).is_some() {
            return Err(EngineError::DuplicateAllocation { event_id, resource_id });
        }
        if schedule.allocations.len() >= MAX_ALLOCATIONS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many allocations"));
        }

        let check = check_new_allocation(event, resource, &schedule.allocations_on(resource_id));
        let allocation = AllocationInfo {
            id: schedule.next_allocation_id,
            event_id,
            resource_id,
            conflict: check.conflict,
        };
        self.persist_and_apply(&mut schedule, Change::AllocationCreated { allocation })
            .await?;

        if check.conflict {
            metrics::counter!(crate::observability::CONFLICTS_DETECTED_TOTAL)
                .increment(check.conflicts.len() as u64);
            for record in &check.conflicts {
                warn!(
                    allocation_id = allocation.id,
                    conflict = %serde_json::to_string(record).unwrap_or_default(),
                    "{CONFLICT_MESSAGE}"
                );
            }
        } else {
            debug!(allocation_id = allocation.id, event_id, resource_id, "resource allocated");
        }

        Ok(AllocationOutcome {
            allocation,
            conflicts: check.conflicts,
        })
    }

    /// Remove one allocation. Returns `false` if it does not exist.
    pub async fn deallocate(&self, id: Id) -> Result<bool, EngineError> {
        let mut schedule = self.schedule.write().await;
        if !schedule.allocations.contains_key(&id) {
            return Ok(false);
        }
        self.persist_and_apply(&mut schedule, Change::AllocationDeleted { id })
            .await?;
        debug!(allocation_id = id, "allocation removed");
        Ok(true)
    }
}
