use crate::model::*;

const MS_PER_HOUR: f64 = 3_600_000.0;

// ── Utilization Report ────────────────────────────────────────────

/// Per-resource utilization inside `window`, one row per resource in id order.
///
/// `hours` sums each allocated event's overlap with the window. `upcoming`
/// counts allocated events starting strictly after `now` and ignores the window.
pub fn utilization(schedule: &Schedule, window: &Span, now: Ms) -> Vec<UtilizationRow> {
    schedule
        .resources
        .values()
        .map(|resource| {
            let mut overlap_ms: Ms = 0;
            let mut total_events = 0u64;
            let mut upcoming = 0u64;

            for (_, event) in schedule.allocations_on(resource.id) {
                total_events += 1;
                if let Some(clamped) = event.span.clamp(window) {
                    overlap_ms += clamped.duration_ms();
                }
                if event.span.start > now {
                    upcoming += 1;
                }
            }

            UtilizationRow {
                resource: resource.name.clone(),
                total_events,
                hours: round_hours(overlap_ms),
                upcoming,
            }
        })
        .collect()
}

fn round_hours(ms: Ms) -> f64 {
    ((ms as f64 / MS_PER_HOUR) * 100.0).round() / 100.0
}
