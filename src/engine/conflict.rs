use std::collections::HashSet;

use crate::model::*;
use crate::time::format_range;

/// Result of testing a candidate allocation against a resource's bookings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictCheck {
    pub conflict: bool,
    pub conflicts: Vec<ConflictRecord>,
}

fn record(resource: &ResourceInfo, first: &EventInfo, second: &EventInfo) -> ConflictRecord {
    ConflictRecord {
        resource: resource.name.clone(),
        event1: first.title.clone(),
        event1_time: format_range(&first.span),
        event2: second.title.clone(),
        event2_time: format_range(&second.span),
    }
}

/// Test `candidate` against every allocation already bound to `resource`.
///
/// Each record names the existing event first and the candidate second.
/// A conflict never blocks the allocation; the caller stores the flag.
pub fn check_new_allocation(
    candidate: &EventInfo,
    resource: &ResourceInfo,
    existing: &[(&AllocationInfo, &EventInfo)],
) -> ConflictCheck {
    let conflicts: Vec<ConflictRecord> = existing
        .iter()
        .filter(|(_, event)| event.span.overlaps(&candidate.span))
        .map(|(_, event)| record(resource, event, candidate))
        .collect();
    ConflictCheck {
        conflict: !conflicts.is_empty(),
        conflicts,
    }
}

/// All-pairs conflict listing over a snapshot.
///
/// A pair of allocations on the same resource is reported when their events
/// overlap or when either allocation was flagged at creation time. The stored
/// flag is never re-evaluated, so after an event is moved a flagged pair keeps
/// being reported until one side is deallocated.
///
/// Pairs are visited in ascending allocation-id order. Within a record the
/// lower event id comes first; each `(resource, event, event)` is reported once.
pub fn list_all_conflicts(schedule: &Schedule) -> Vec<ConflictRecord> {
    let allocations: Vec<(&AllocationInfo, &EventInfo)> = schedule
        .allocations
        .values()
        .filter_map(|a| schedule.events.get(&a.event_id).map(|e| (a, e)))
        .collect();

    let mut seen: HashSet<(Id, Id, Id)> = HashSet::new();
    let mut out = Vec::new();

    for i in 0..allocations.len() {
        for j in (i + 1)..allocations.len() {
            let (a1, e1) = allocations[i];
            let (a2, e2) = allocations[j];
            if a1.resource_id != a2.resource_id {
                continue;
            }
            if !(e1.span.overlaps(&e2.span) || a1.conflict || a2.conflict) {
                continue;
            }
            let (low, high) = if e1.id <= e2.id { (e1, e2) } else { (e2, e1) };
            if !seen.insert((a1.resource_id, low.id, high.id)) {
                continue;
            }
            let Some(resource) = schedule.resources.get(&a1.resource_id) else {
                continue;
            };
            out.push(record(resource, low, high));
        }
    }
    out
}
