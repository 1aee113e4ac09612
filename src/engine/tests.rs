use super::*;
use crate::time::parse_instant;
use tokio_test::{assert_err, assert_ok};

const H: Ms = 3_600_000; // 1 hour in ms

fn at(s: &str) -> Ms {
    parse_instant(s).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("allot_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open(name: &str) -> Engine {
    Engine::open(test_wal_path(name), 0).unwrap()
}

async fn event(engine: &Engine, title: &str, start: &str, end: &str) -> Id {
    engine
        .create_event(title.into(), at(start), at(end), String::new())
        .await
        .unwrap()
        .id
}

async fn room(engine: &Engine, name: &str) -> Id {
    engine
        .create_resource(name.into(), "room".into())
        .await
        .unwrap()
        .id
}

// ── Events ───────────────────────────────────────────────

#[tokio::test]
async fn create_event_assigns_sequential_ids() {
    let engine = open("event_ids.wal");
    let a = event(&engine, "A", "2024-01-01T09:00", "2024-01-01T10:00").await;
    let b = event(&engine, "B", "2024-01-01T09:00", "2024-01-01T10:00").await;
    assert_eq!((a, b), (1, 2));
    assert_eq!(engine.list_events().await.len(), 2);
}

#[tokio::test]
async fn create_event_rejects_inverted_and_empty_spans() {
    let engine = open("event_invalid_span.wal");
    let start = at("2024-01-01T10:00");

    let err = engine
        .create_event("Backwards".into(), start, start - H, String::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidSpan { .. }));
    assert_eq!(err.to_string(), "Start time must be before end time");

    assert_err!(
        engine
            .create_event("Empty".into(), start, start, String::new())
            .await
    );
    assert!(engine.list_events().await.is_empty());
    assert_eq!(engine.wal_appends_since_compact().await, 0);
}

#[tokio::test]
async fn create_event_rejects_long_title() {
    let engine = open("event_long_title.wal");
    let title = "x".repeat(crate::limits::MAX_TITLE_LEN + 1);
    let err = engine
        .create_event(title, 0, H, String::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn update_event_merges_patch() {
    let engine = open("event_update.wal");
    let id = event(&engine, "Standup", "2024-01-01T09:00", "2024-01-01T09:15").await;

    let updated = engine
        .update_event(
            id,
            EventPatch {
                end: Some(at("2024-01-01T09:30")),
                description: Some("daily".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.title, "Standup");
    assert_eq!(updated.span, Span::new(at("2024-01-01T09:00"), at("2024-01-01T09:30")));
    assert_eq!(updated.description, "daily");
    assert_eq!(engine.get_event(id).await, Some(updated));
}

#[tokio::test]
async fn update_event_validates_merged_span() {
    let engine = open("event_update_invalid.wal");
    let id = event(&engine, "Standup", "2024-01-01T09:00", "2024-01-01T10:00").await;

    let err = engine
        .update_event(
            id,
            EventPatch { start: Some(at("2024-01-01T11:00")), ..Default::default() },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidSpan { .. }));

    let unchanged = engine.get_event(id).await.unwrap();
    assert_eq!(unchanged.span.start, at("2024-01-01T09:00"));
}

#[tokio::test]
async fn update_and_delete_missing_are_noops() {
    let engine = open("missing_noop.wal");
    assert_eq!(assert_ok!(engine.update_event(42, EventPatch::default()).await), None);
    assert_eq!(assert_ok!(engine.update_resource(42, ResourcePatch::default()).await), None);
    assert!(!assert_ok!(engine.delete_event(42).await));
    assert!(!assert_ok!(engine.delete_resource(42).await));
    assert!(!assert_ok!(engine.deallocate(42).await));
    assert_eq!(engine.wal_appends_since_compact().await, 0);
}

// ── Resources ────────────────────────────────────────────

#[tokio::test]
async fn resource_crud() {
    let engine = open("resource_crud.wal");
    let id = room(&engine, "Room A").await;

    let updated = engine
        .update_resource(id, ResourcePatch { kind: Some("auditorium".into()), ..Default::default() })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.name, "Room A");
    assert_eq!(updated.kind, "auditorium");

    assert!(engine.delete_resource(id).await.unwrap());
    assert!(engine.get_resource(id).await.is_none());
    assert!(engine.list_resources().await.is_empty());
}

// ── Allocations ──────────────────────────────────────────

#[tokio::test]
async fn touching_events_allocate_cleanly() {
    let engine = open("alloc_touching.wal");
    let e1 = event(&engine, "First", "2024-01-01T09:00", "2024-01-01T10:00").await;
    let e2 = event(&engine, "Second", "2024-01-01T10:00", "2024-01-01T11:00").await;
    let r = room(&engine, "Room A").await;

    let first = engine.allocate(e1, r).await.unwrap();
    let second = engine.allocate(e2, r).await.unwrap();
    assert!(!first.allocation.conflict);
    assert!(!second.allocation.conflict);
    assert!(second.conflicts.is_empty());
    assert!(engine.list_conflicts().await.is_empty());
}

#[tokio::test]
async fn overlapping_allocation_is_stored_with_flag() {
    let engine = open("alloc_overlap.wal");
    let e1 = event(&engine, "Planning", "2024-01-01T09:00", "2024-01-01T11:00").await;
    let e2 = event(&engine, "Retro", "2024-01-01T10:00", "2024-01-01T12:00").await;
    let r = room(&engine, "Room A").await;

    engine.allocate(e1, r).await.unwrap();
    let outcome = engine.allocate(e2, r).await.unwrap();

    assert!(outcome.allocation.conflict);
    assert_eq!(
        outcome.conflicts,
        vec![ConflictRecord {
            resource: "Room A".into(),
            event1: "Planning".into(),
            event1_time: "2024-01-01 09:00 - 11:00".into(),
            event2: "Retro".into(),
            event2_time: "2024-01-01 10:00 - 12:00".into(),
        }]
    );
    // Persisted despite the conflict.
    assert_eq!(engine.list_allocations(AllocationFilter::default()).await.len(), 2);
    assert_eq!(engine.list_conflicts().await, outcome.conflicts);
}

#[tokio::test]
async fn duplicate_allocation_rejected() {
    let engine = open("alloc_duplicate.wal");
    let e = event(&engine, "Demo", "2024-01-01T09:00", "2024-01-01T10:00").await;
    let r = room(&engine, "Room A").await;

    engine.allocate(e, r).await.unwrap();
    let appends = engine.wal_appends_since_compact().await;

    let err = engine.allocate(e, r).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::DuplicateAllocation { event_id, resource_id } if event_id == e && resource_id == r
    ));
    assert_eq!(err.to_string(), "Resource already allocated to this event.");
    assert_eq!(engine.list_allocations(AllocationFilter::default()).await.len(), 1);
    assert_eq!(engine.wal_appends_since_compact().await, appends);
}

#[tokio::test]
async fn allocate_missing_entities() {
    let engine = open("alloc_missing.wal");
    let e = event(&engine, "Demo", "2024-01-01T09:00", "2024-01-01T10:00").await;
    let r = room(&engine, "Room A").await;

    assert!(matches!(
        engine.allocate(99, r).await,
        Err(EngineError::NotFound(Entity::Event, 99))
    ));
    assert!(matches!(
        engine.allocate(e, 99).await,
        Err(EngineError::NotFound(Entity::Resource, 99))
    ));
}

#[tokio::test]
async fn concurrent_allocations_see_each_other() {
    let engine = std::sync::Arc::new(open("alloc_concurrent.wal"));
    let e1 = event(&engine, "A", "2024-01-01T09:00", "2024-01-01T11:00").await;
    let e2 = event(&engine, "B", "2024-01-01T10:00", "2024-01-01T12:00").await;
    let r = room(&engine, "Room A").await;

    let (a, b) = tokio::join!(engine.allocate(e1, r), engine.allocate(e2, r));
    let flags = [a.unwrap().allocation.conflict, b.unwrap().allocation.conflict];
    // Serialized: exactly the second writer sees the first.
    assert_eq!(flags.iter().filter(|f| **f).count(), 1);
}

#[tokio::test]
async fn deleting_resource_cascades_to_allocations_and_queries() {
    let engine = open("cascade_resource.wal");
    let e1 = event(&engine, "A", "2024-01-01T09:00", "2024-01-01T11:00").await;
    let e2 = event(&engine, "B", "2024-01-01T10:00", "2024-01-01T12:00").await;
    let gone = room(&engine, "Doomed").await;
    let kept = room(&engine, "Kept").await;
    engine.allocate(e1, gone).await.unwrap();
    engine.allocate(e2, gone).await.unwrap();
    engine.allocate(e1, kept).await.unwrap();

    assert!(engine.delete_resource(gone).await.unwrap());

    let remaining = engine.list_allocations(AllocationFilter::default()).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].resource_id, kept);
    assert!(engine.list_conflicts().await.is_empty());
    let report = engine
        .utilization(at("2024-01-01T00:00"), at("2024-01-02T00:00"), 0)
        .await
        .unwrap();
    assert!(report.iter().all(|row| row.resource != "Doomed"));
}

#[tokio::test]
async fn deleting_event_cascades_to_allocations() {
    let engine = open("cascade_event.wal");
    let e = event(&engine, "A", "2024-01-01T09:00", "2024-01-01T11:00").await;
    let r1 = room(&engine, "R1").await;
    let r2 = room(&engine, "R2").await;
    engine.allocate(e, r1).await.unwrap();
    engine.allocate(e, r2).await.unwrap();

    assert!(engine.delete_event(e).await.unwrap());
    assert!(engine.list_allocations(AllocationFilter::default()).await.is_empty());
}

#[tokio::test]
async fn deallocate_clears_listing() {
    let engine = open("deallocate.wal");
    let e1 = event(&engine, "A", "2024-01-01T09:00", "2024-01-01T11:00").await;
    let e2 = event(&engine, "B", "2024-01-01T10:00", "2024-01-01T12:00").await;
    let r = room(&engine, "Room A").await;
    engine.allocate(e1, r).await.unwrap();
    let second = engine.allocate(e2, r).await.unwrap();
    assert_eq!(engine.list_conflicts().await.len(), 1);

    assert!(engine.deallocate(second.allocation.id).await.unwrap());
    assert!(engine.list_conflicts().await.is_empty());
}

#[tokio::test]
async fn stale_flag_survives_event_move() {
    let engine = open("stale_flag.wal");
    let e1 = event(&engine, "A", "2024-01-01T09:00", "2024-01-01T11:00").await;
    let e2 = event(&engine, "B", "2024-01-01T10:00", "2024-01-01T12:00").await;
    let r = room(&engine, "Room A").await;
    engine.allocate(e1, r).await.unwrap();
    engine.allocate(e2, r).await.unwrap();

    // Move B clear of A. The flag stored on B's allocation keeps the pair listed.
    engine
        .update_event(
            e2,
            EventPatch {
                start: Some(at("2024-01-01T14:00")),
                end: Some(at("2024-01-01T15:00")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let conflicts = engine.list_conflicts().await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].event2_time, "2024-01-01 14:00 - 15:00");
}

#[tokio::test]
async fn allocation_filter_by_resource() {
    let engine = open("alloc_filter.wal");
    let e = event(&engine, "A", "2024-01-01T09:00", "2024-01-01T11:00").await;
    let r1 = room(&engine, "R1").await;
    let r2 = room(&engine, "R2").await;
    engine.allocate(e, r1).await.unwrap();
    engine.allocate(e, r2).await.unwrap();

    let on_r2 = engine
        .list_allocations(AllocationFilter { resource_id: Some(r2), ..Default::default() })
        .await;
    assert_eq!(on_r2.len(), 1);
    assert_eq!(on_r2[0].resource_id, r2);
}

// ── Report ───────────────────────────────────────────────

#[tokio::test]
async fn utilization_six_hours() {
    let engine = open("report_six_hours.wal");
    let e = event(&engine, "Workshop", "2024-01-01T12:00", "2024-01-01T18:00").await;
    let r = room(&engine, "Room A").await;
    engine.allocate(e, r).await.unwrap();

    let rows = engine
        .utilization(at("2024-01-01T00:00"), at("2024-01-02T00:00"), at("2025-01-01T00:00"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].hours, 6.0);
    assert_eq!(rows[0].total_events, 1);
    assert_eq!(rows[0].upcoming, 0);
}

#[tokio::test]
async fn utilization_rejects_inverted_window() {
    let engine = open("report_invalid.wal");
    let start = at("2024-01-02T00:00");
    assert!(matches!(
        engine.utilization(start, start - H, 0).await,
        Err(EngineError::InvalidSpan { .. })
    ));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_schedule() {
    let path = test_wal_path("replay.wal");
    {
        let engine = Engine::open(path.clone(), 0).unwrap();
        let e1 = event(&engine, "A", "2024-01-01T09:00", "2024-01-01T11:00").await;
        let e2 = event(&engine, "B", "2024-01-01T10:00", "2024-01-01T12:00").await;
        let e3 = event(&engine, "C", "2024-01-01T13:00", "2024-01-01T14:00").await;
        let r = room(&engine, "Room A").await;
        let doomed = room(&engine, "Doomed").await;
        engine.allocate(e1, r).await.unwrap();
        engine.allocate(e2, r).await.unwrap();
        engine.allocate(e3, doomed).await.unwrap();
        engine.delete_resource(doomed).await.unwrap();
        engine.close().await.unwrap();
    }

    let engine = Engine::open(path, 0).unwrap();
    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.events.len(), 3);
    assert_eq!(snapshot.resources.len(), 1);
    let flags: Vec<bool> = snapshot.allocations.values().map(|a| a.conflict).collect();
    assert_eq!(flags, vec![false, true]);
    assert_eq!(engine.list_conflicts().await.len(), 1);

    // Ids continue after the highest ever used, including the deleted resource.
    assert_eq!(room(&engine, "New").await, 3);
    assert_eq!(snapshot.next_allocation_id, 4);
}

#[tokio::test]
async fn compaction_preserves_state_and_sequences() {
    let path = test_wal_path("compaction.wal");
    {
        let engine = Engine::open(path.clone(), 0).unwrap();
        let e = event(&engine, "A", "2024-01-01T09:00", "2024-01-01T11:00").await;
        for i in 0..10 {
            let r = room(&engine, &format!("Temp {i}")).await;
            engine.allocate(e, r).await.unwrap();
            engine.delete_resource(r).await.unwrap();
        }
        let kept = room(&engine, "Kept").await;
        engine.allocate(e, kept).await.unwrap();

        let before = std::fs::metadata(&path).unwrap().len();
        engine.compact_wal().await.unwrap();
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }

    let engine = Engine::open(path, 0).unwrap();
    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.resources.len(), 1);
    assert_eq!(snapshot.allocations.len(), 1);
    assert_eq!(snapshot.next_resource_id, 12);
    assert_eq!(snapshot.next_allocation_id, 12);
    assert_eq!(room(&engine, "After").await, 12);
}

#[tokio::test]
async fn automatic_compaction_at_threshold() {
    let path = test_wal_path("auto_compact.wal");
    let engine = Engine::open(path.clone(), 5).unwrap();
    for i in 0..5 {
        room(&engine, &format!("R{i}")).await;
    }
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    room(&engine, "R5").await;
    assert_eq!(engine.wal_appends_since_compact().await, 1);
    drop(engine);

    let engine = Engine::open(path, 5).unwrap();
    assert_eq!(engine.list_resources().await.len(), 6);
}
