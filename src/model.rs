use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Wall-clock milliseconds, no zone. The only time type.
pub type Ms = i64;

/// Row identifier. Each table has its own sequence starting at 1.
pub type Id = u64;

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

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Strict on both sides: spans that only touch do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Intersection with `window`, or `None` if it is empty.
    pub fn clamp(&self, window: &Span) -> Option<Span> {
        Span::try_new(self.start.max(window.start), self.end.min(window.end))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInfo {
    pub id: Id,
    pub title: String,
    pub span: Span,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: Id,
    pub name: String,
    /// Category label ("room", "projector", ...). Exposed as the `type` column.
    pub kind: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationInfo {
    pub id: Id,
    pub event_id: Id,
    pub resource_id: Id,
    /// Computed once when the allocation is created; never re-evaluated.
    pub conflict: bool,
}

/// Partial update for an event. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPatch {
    pub title: Option<String>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub description: Option<String>,
}

/// Partial update for a resource. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePatch {
    pub name: Option<String>,
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationFilter {
    pub id: Option<Id>,
    pub event_id: Option<Id>,
    pub resource_id: Option<Id>,
}

impl AllocationFilter {
    pub fn matches(&self, a: &AllocationInfo) -> bool {
        self.id.is_none_or(|id| a.id == id)
            && self.event_id.is_none_or(|id| a.event_id == id)
            && self.resource_id.is_none_or(|id| a.resource_id == id)
    }
}

/// Shown to the client whenever an allocation overlaps another event.
pub const CONFLICT_MESSAGE: &str = "Resource conflicts with another event.";

/// One double-booking, rendered for the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub resource: String,
    pub event1: String,
    pub event1_time: String,
    pub event2: String,
    pub event2_time: String,
}

/// A persisted allocation plus the double-bookings found when it was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationOutcome {
    pub allocation: AllocationInfo,
    pub conflicts: Vec<ConflictRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationRow {
    pub resource: String,
    pub total_events: u64,
    /// Rounded to 2 decimals.
    pub hours: f64,
    pub upcoming: u64,
}

/// In-memory state of one tenant. Ordered maps give ascending-id iteration,
/// which the conflict listing and the report rely on.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub events: BTreeMap<Id, EventInfo>,
    pub resources: BTreeMap<Id, ResourceInfo>,
    pub allocations: BTreeMap<Id, AllocationInfo>,
    pub next_event_id: Id,
    pub next_resource_id: Id,
    pub next_allocation_id: Id,
}

impl Schedule {
    pub fn new() -> Self {
        Self {
            next_event_id: 1,
            next_resource_id: 1,
            next_allocation_id: 1,
            ..Default::default()
        }
    }

    pub fn find_allocation(&self, event_id: Id, resource_id: Id) -> Option<&AllocationInfo> {
        self.allocations
            .values()
            .find(|a| a.event_id == event_id && a.resource_id == resource_id)
    }

    /// Allocations bound to `resource_id`, paired with their events.
    /// Allocations whose event is missing are skipped.
    pub fn allocations_on(&self, resource_id: Id) -> Vec<(&AllocationInfo, &EventInfo)> {
        self.allocations
            .values()
            .filter(|a| a.resource_id == resource_id)
            .filter_map(|a| self.events.get(&a.event_id).map(|e| (a, e)))
            .collect()
    }

    /// Apply a change. Deletes cascade to allocations so replay reproduces them.
    pub fn apply(&mut self, change: &Change) {
        match change {
            Change::EventCreated { event } | Change::EventUpdated { event } => {
                self.next_event_id = self.next_event_id.max(event.id + 1);
                self.events.insert(event.id, event.clone());
            }
            Change::EventDeleted { id } => {
                self.allocations.retain(|_, a| a.event_id != *id);
                self.events.remove(id);
            }
            Change::ResourceCreated { resource } | Change::ResourceUpdated { resource } => {
                self.next_resource_id = self.next_resource_id.max(resource.id + 1);
                self.resources.insert(resource.id, resource.clone());
            }
            Change::ResourceDeleted { id } => {
                self.allocations.retain(|_, a| a.resource_id != *id);
                self.resources.remove(id);
            }
            Change::AllocationCreated { allocation } => {
                self.next_allocation_id = self.next_allocation_id.max(allocation.id + 1);
                self.allocations.insert(allocation.id, *allocation);
            }
            Change::AllocationDeleted { id } => {
                self.allocations.remove(id);
            }
            Change::SequenceAdvanced {
                next_event_id,
                next_resource_id,
                next_allocation_id,
            } => {
                self.next_event_id = self.next_event_id.max(*next_event_id);
                self.next_resource_id = self.next_resource_id.max(*next_resource_id);
                self.next_allocation_id = self.next_allocation_id.max(*next_allocation_id);
            }
        }
    }
}

/// WAL record. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    EventCreated { event: EventInfo },
    EventUpdated { event: EventInfo },
    EventDeleted { id: Id },
    ResourceCreated { resource: ResourceInfo },
    ResourceUpdated { resource: ResourceInfo },
    ResourceDeleted { id: Id },
    AllocationCreated { allocation: AllocationInfo },
    AllocationDeleted { id: Id },
    /// Written by compaction so ids of deleted rows are never handed out again.
    SequenceAdvanced {
        next_event_id: Id,
        next_resource_id: Id,
        next_allocation_id: Id,
    },
}
