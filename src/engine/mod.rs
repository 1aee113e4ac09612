mod conflict;
mod error;
mod mutations;
mod queries;
mod report;
#[cfg(test)]
mod tests;

pub use conflict::{check_new_allocation, list_all_conflicts, ConflictCheck};
pub use error::{EngineError, Entity};
pub use report::utilization;

use std::io;
use std::path::PathBuf;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::model::*;
use crate::wal::Wal;

/// Storage context for one tenant: the in-memory schedule plus its WAL.
///
/// Lock order is always `schedule` then `wal`. Mutations hold the schedule
/// write lock across validate, append and apply, so two allocations on the
/// same resource never miss each other.
pub struct Engine {
    schedule: RwLock<Schedule>,
    wal: Mutex<Wal>,
    compact_threshold: u64,
}

impl Engine {
    /// Replay the WAL at `wal_path` (creating it if absent) and open it for append.
    pub fn open(wal_path: PathBuf, compact_threshold: u64) -> io::Result<Self> {
        let changes = Wal::replay(&wal_path)?;
        let mut schedule = Schedule::new();
        for change in &changes {
            schedule.apply(change);
        }
        let wal = Wal::open(&wal_path)?;
        info!(
            "opened {} ({} changes, {} events, {} resources, {} allocations)",
            wal_path.display(),
            changes.len(),
            schedule.events.len(),
            schedule.resources.len(),
            schedule.allocations.len()
        );

        Ok(Self {
            schedule: RwLock::new(schedule),
            wal: Mutex::new(wal),
            compact_threshold,
        })
    }

    /// Flush and fsync the WAL. The engine stays usable afterwards.
    pub async fn close(&self) -> Result<(), EngineError> {
        let _schedule = self.schedule.write().await;
        let mut wal = self.wal.lock().await;
        wal.flush_sync()?;
        debug!("closed {}", wal.path().display());
        Ok(())
    }

    /// WAL-append + apply in one call. Compacts once the threshold is reached.
    pub(super) async fn persist_and_apply(
        &self,
        schedule: &mut Schedule,
        change: Change,
    ) -> Result<(), EngineError> {
        let mut wal = self.wal.lock().await;
        let started = Instant::now();
        wal.append(&change)?;
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        schedule.apply(&change);

        if self.compact_threshold > 0 && wal.appends_since_compact() >= self.compact_threshold {
            // The change is already durable; a failed compaction only leaves a longer log.
            if let Err(e) = wal.compact(&compaction_changes(schedule)) {
                warn!("compaction of {} failed: {e}", wal.path().display());
            } else {
                debug!("compacted {}", wal.path().display());
            }
        }
        Ok(())
    }

    /// Rewrite the WAL with only the changes needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let schedule = self.schedule.read().await;
        let mut wal = self.wal.lock().await;
        wal.compact(&compaction_changes(&schedule))?;
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.lock().await.appends_since_compact()
    }
}

/// Minimal change list for `schedule`: sequences first, then rows in id order.
fn compaction_changes(schedule: &Schedule) -> Vec<Change> {
    let mut changes = Vec::with_capacity(
        1 + schedule.events.len() + schedule.resources.len() + schedule.allocations.len(),
    );
    changes.push(Change::SequenceAdvanced {
        next_event_id: schedule.next_event_id,
        next_resource_id: schedule.next_resource_id,
        next_allocation_id: schedule.next_allocation_id,
    });
    changes.extend(
        schedule
            .events
            .values()
            .map(|event| Change::EventCreated { event: event.clone() }),
    );
    changes.extend(
        schedule
            .resources
            .values()
            .map(|resource| Change::ResourceCreated { resource: resource.clone() }),
    );
    changes.extend(
        schedule
            .allocations
            .values()
            .map(|allocation| Change::AllocationCreated { allocation: *allocation }),
    );
    changes
}
