use crate::model::*;

use super::conflict::list_all_conflicts;
use super::mutations::validate_span;
use super::report::utilization;
use super::{Engine, EngineError};

impl Engine {
    pub async fn list_events(&self) -> Vec<EventInfo> {
        self.schedule.read().await.events.values().cloned().collect()
    }

    pub async fn get_event(&self, id: Id) -> Option<EventInfo> {
        self.schedule.read().await.events.get(&id).cloned()
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        self.schedule.read().await.resources.values().cloned().collect()
    }

    pub async fn get_resource(&self, id: Id) -> Option<ResourceInfo> {
        self.schedule.read().await.resources.get(&id).cloned()
    }

    pub async fn list_allocations(&self, filter: AllocationFilter) -> Vec<AllocationInfo> {
        self.schedule
            .read()
            .await
            .allocations
            .values()
            .filter(|a| filter.matches(a))
            .copied()
            .collect()
    }

    /// Every double-booking in the tenant, recomputed from one snapshot.
    pub async fn list_conflicts(&self) -> Vec<ConflictRecord> {
        let schedule = self.schedule.read().await;
        list_all_conflicts(&schedule)
    }

    /// Utilization of every resource inside `[start, end)`; `now` decides
    /// which events count as upcoming.
    pub async fn utilization(
        &self,
        start: Ms,
        end: Ms,
        now: Ms,
    ) -> Result<Vec<UtilizationRow>, EngineError> {
        let window = validate_span(start, end)?;
        let schedule = self.schedule.read().await;
        Ok(utilization(&schedule, &window, now))
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> Schedule {
        self.schedule.read().await.clone()
    }
}
