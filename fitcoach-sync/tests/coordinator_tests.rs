use chrono::{DateTime, Duration, Utc};
use fitcoach_sync::queue::OperationKind;
use fitcoach_sync::remote::{AccountStatus, Failure, RemoteOp, RemoteStore, SavePolicy};
use fitcoach_sync::{
    ChangeOrigin, CodecRegistry, ConflictDecision, ConflictStrategy, Entity, Exercise,
    ExerciseSet, FoodEntry, InMemoryLocalStore, InMemoryRemoteStore, LocalChange, LocalStore,
    MealType, Record, RetryPolicy, SyncConfig, SyncCoordinator, SyncError, SyncKind, SyncPhase,
    SyncTrigger, TokenScope, TriggerOutcome, WorkoutSession, WorkoutStatus, ZoneId,
};
use fitcoach_sync::tokens::ChangeTokenStore;
use fitcoach_types::{EntityId, RecordKey, RecordType};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    remote: Arc<InMemoryRemoteStore>,
    local: Arc<InMemoryLocalStore>,
    coordinator: Arc<SyncCoordinator>,
}

fn test_config() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy::none(),
        ..SyncConfig::default()
    }
}

fn harness() -> Harness {
    harness_with(test_config(), InMemoryLocalStore::new())
}

fn init_tracing() {
    // RUST_LOG=fitcoach_sync=debug to see pass logs.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness_with(config: SyncConfig, local: InMemoryLocalStore) -> Harness {
    init_tracing();
    let remote = Arc::new(InMemoryRemoteStore::new());
    let local = Arc::new(local);
    let coordinator =
        Arc::new(SyncCoordinator::open(config, remote.clone(), local.clone()).unwrap());
    Harness {
        remote,
        local,
        coordinator,
    }
}

fn earlier() -> DateTime<Utc> {
    Utc::now() - Duration::minutes(10)
}

fn exercise(name: &str) -> Exercise {
    Exercise {
        id: EntityId::new(),
        name: name.to_string(),
        category: "strength".to_string(),
        equipment: Some("barbell".to_string()),
        instructions: None,
        muscle_groups: vec!["chest".to_string()],
        is_custom: true,
        modified_at: earlier(),
    }
}

fn session(name: &str) -> WorkoutSession {
    WorkoutSession {
        id: EntityId::new(),
        name: name.to_string(),
        status: WorkoutStatus::Completed,
        started_at: earlier(),
        completed_at: Some(earlier()),
        notes: None,
        tags: Vec::new(),
        modified_at: earlier(),
    }
}

fn set_of(session: &WorkoutSession) -> ExerciseSet {
    ExerciseSet {
        id: EntityId::new(),
        session_id: session.id,
        exercise_id: None,
        set_index: 0,
        reps: Some(8),
        weight_kg: Some(80.0),
        duration_secs: None,
        completed: true,
        modified_at: earlier(),
    }
}

fn food(name: &str) -> FoodEntry {
    FoodEntry {
        id: EntityId::new(),
        name: name.to_string(),
        meal: MealType::Lunch,
        consumed_at: earlier(),
        calories: 540.0,
        protein_g: Some(32.5),
        carbs_g: None,
        fat_g: None,
        modified_at: earlier(),
    }
}

fn zone_of(h: &Harness, record_type: RecordType) -> ZoneId {
    h.coordinator.zones().zone_for(record_type).unwrap().id.clone()
}

/// Writes an entity to the remote as another device would.
async fn remote_write(h: &Harness, entity: Entity) -> Record {
    let record = CodecRegistry::standard().encode(&entity).unwrap();
    let zone = zone_of(h, entity.record_type());
    h.remote
        .save_records(&zone, &[record], SavePolicy::AllKeys)
        .await
        .unwrap()
        .remove(0)
}

/// Commits a user edit locally and hands it to the coordinator.
async fn local_edit(h: &Harness, changes: Vec<LocalChange>) -> usize {
    let event = h.local.apply(ChangeOrigin::Local, changes).unwrap();
    h.coordinator.handle_local_commit(event).await.unwrap()
}

/// Seeds the local store without going through change detection.
fn seed_local(h: &Harness, entities: Vec<Entity>) {
    h.local
        .apply(
            ChangeOrigin::Local,
            entities.into_iter().map(LocalChange::Upsert).collect(),
        )
        .unwrap();
}

fn local_exercise_name(h: &Harness, key: &RecordKey) -> Option<String> {
    match h.local.fetch(key).unwrap()? {
        Entity::Exercise(e) => Some(e.name),
        _ => None,
    }
}

fn remote_name(record: &Record) -> Option<String> {
    match record.get("name")? {
        fitcoach_sync::FieldValue::String(s) => Some(s.clone()),
        _ => None,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ── Initial and full sync ────────────────────────────────────────

#[tokio::test]
async fn initial_sync_creates_zones_and_downloads() {
    let h = harness();
    h.remote
        .create_zone(&ZoneId::private("exerciseLibrary"))
        .await
        .unwrap();
    let bench = exercise("Bench Press");
    remote_write(&h, Entity::Exercise(bench.clone())).await;

    let report = h.coordinator.perform_initial_sync().await.unwrap();

    assert_eq!(report.kind, SyncKind::Full);
    assert_eq!(report.downloaded, 1);
    assert_eq!(h.remote.zones(fitcoach_sync::DatabaseScope::Private).len(), 4);
    assert_eq!(h.local.snapshot(), vec![Entity::Exercise(bench)]);
    assert!(h.coordinator.is_initial_sync_completed());
    assert!(h.coordinator.last_sync_timestamp().unwrap().is_some());
    assert_eq!(h.coordinator.phase(), SyncPhase::Idle);
}

#[tokio::test]
async fn initial_sync_uploads_local_entities() {
    let h = harness();
    let squat = exercise("Squat");
    let key = Entity::Exercise(squat.clone()).key();
    seed_local(&h, vec![Entity::Exercise(squat)]);

    let report = h.coordinator.perform_initial_sync().await.unwrap();

    assert_eq!(report.uploaded, 1);
    let stored = h
        .remote
        .record(&ZoneId::private("exerciseLibrary"), &key.to_string())
        .unwrap();
    assert_eq!(remote_name(&stored).as_deref(), Some("Squat"));
}

#[tokio::test]
async fn failed_initial_sync_leaves_flag_unset() {
    let h = harness();
    h.remote.fail_next(RemoteOp::QueryRecords, Failure::Terminal);

    assert!(h.coordinator.perform_initial_sync().await.is_err());
    assert!(!h.coordinator.is_initial_sync_completed());
    assert!(h.coordinator.last_sync_timestamp().unwrap().is_none());
}

#[tokio::test]
async fn initial_sync_flag_is_observable() {
    let h = harness();
    let mut flag = h.coordinator.subscribe_initial_sync();
    assert!(!*flag.borrow());

    h.coordinator.perform_initial_sync().await.unwrap();

    flag.changed().await.unwrap();
    assert!(*flag.borrow());
}

#[tokio::test]
async fn repeated_full_sync_is_idempotent() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    remote_write(&h, Entity::Exercise(exercise("Row"))).await;

    let first = h.coordinator.perform_full_sync().await.unwrap();
    let second = h.coordinator.perform_full_sync().await.unwrap();

    assert_eq!(first.downloaded, 1);
    assert_eq!(second.downloaded, 0);
    assert_eq!(h.local.len(), 1);
}

#[tokio::test]
async fn undecodable_records_are_skipped() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    let mut junk = Record::with_raw_key(RecordType::Exercise, "Exercise/not-a-uuid");
    junk.set("name", fitcoach_sync::FieldValue::String("junk".into()));
    h.remote
        .save_records(&ZoneId::private("exerciseLibrary"), &[junk], SavePolicy::AllKeys)
        .await
        .unwrap();
    remote_write(&h, Entity::Exercise(exercise("Dip"))).await;

    let report = h.coordinator.perform_full_sync().await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.downloaded, 1);
}

#[tokio::test]
async fn full_sync_reconciles_interrupted_migration() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    let legacy = ZoneId::private("exercises");
    let library = zone_of(&h, RecordType::Exercise);
    h.remote.create_zone(&legacy).await.unwrap();
    let codecs = CodecRegistry::standard();
    let moved: Vec<Record> = ["Row", "Dip"]
        .into_iter()
        .map(|name| codecs.encode(&Entity::Exercise(exercise(name))).unwrap())
        .collect();
    h.remote
        .save_records(&legacy, &moved, SavePolicy::AllKeys)
        .await
        .unwrap();

    h.remote
        .fail_next_in_zone(RemoteOp::DeleteRecords, &legacy, Failure::Transient);
    let err = h
        .coordinator
        .zones()
        .migrate(&legacy, &library, &[RecordType::Exercise])
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::PartialMigration { .. }));

    let late = codecs.encode(&Entity::Exercise(exercise("Lunge"))).unwrap();
    h.remote
        .save_records(&legacy, &[late], SavePolicy::AllKeys)
        .await
        .unwrap();

    let report = h.coordinator.perform_full_sync().await.unwrap();

    assert_eq!(report.reconciled, 3);
    assert!(h.remote.records(&legacy).is_empty());
    assert_eq!(h.remote.records(&library).len(), 3);
    assert_eq!(h.local.len(), 3);

    let again = h.coordinator.perform_full_sync().await.unwrap();
    assert_eq!(again.reconciled, 0);
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = SyncConfig {
        state_dir: Some(dir.path().to_path_buf()),
        ..test_config()
    };
    let remote = Arc::new(InMemoryRemoteStore::new());
    let local = Arc::new(InMemoryLocalStore::new());
    {
        let coordinator =
            SyncCoordinator::open(config.clone(), remote.clone(), local.clone()).unwrap();
        coordinator.perform_initial_sync().await.unwrap();
        coordinator.perform_incremental_sync().await.unwrap();
    }

    let reopened = SyncCoordinator::open(config.clone(), remote.clone(), local.clone()).unwrap();
    assert!(reopened.is_initial_sync_completed());
    assert!(reopened.last_sync_timestamp().unwrap().is_some());

    let tokens = ChangeTokenStore::open(config.tokens_path().unwrap()).unwrap();
    assert!(
        tokens
            .token_for(&TokenScope::Zone(ZoneId::private("workouts")))
            .is_some()
    );
}

// ── Incremental sync ─────────────────────────────────────────────

#[tokio::test]
async fn incremental_without_prior_sync_runs_full() {
    let h = harness();
    h.coordinator.zones().create_all().await.unwrap();

    let report = h.coordinator.perform_incremental_sync().await.unwrap();

    assert_eq!(report.kind, SyncKind::Full);
}

#[tokio::test]
async fn incremental_downloads_remote_changes() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    let lunch = food("Chicken bowl");
    remote_write(&h, Entity::FoodEntry(lunch.clone())).await;

    let report = h.coordinator.perform_incremental_sync().await.unwrap();

    assert_eq!(report.kind, SyncKind::Incremental);
    assert_eq!(report.downloaded, 1);
    assert_eq!(h.local.snapshot(), vec![Entity::FoodEntry(lunch)]);
}

#[tokio::test]
async fn tokens_track_latest_response() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    let scope = TokenScope::Zone(ZoneId::private("nutrition"));

    let mut previous: Option<Vec<u8>> = None;
    for i in 0..3 {
        remote_write(&h, Entity::FoodEntry(food(&format!("meal {i}")))).await;
        h.coordinator.perform_incremental_sync().await.unwrap();

        let token = h.coordinator.change_token(&scope).await.unwrap();
        let expected = h.remote.current_sequence().to_be_bytes().to_vec();
        assert_eq!(token.as_bytes(), expected.as_slice());
        if let Some(prev) = previous {
            assert!(token.as_bytes() > prev.as_slice());
        }
        previous = Some(token.as_bytes().to_vec());
    }
}

#[tokio::test]
async fn incremental_applies_remote_deletions() {
    let h = harness();
    let row = exercise("Row");
    let key = Entity::Exercise(row.clone()).key();
    seed_local(&h, vec![Entity::Exercise(row)]);
    h.coordinator.perform_initial_sync().await.unwrap();

    h.remote
        .delete_records(&ZoneId::private("exerciseLibrary"), &[key.to_string()])
        .await
        .unwrap();
    let report = h.coordinator.perform_incremental_sync().await.unwrap();

    assert_eq!(report.deleted, 1);
    assert!(h.local.is_empty());
}

#[tokio::test]
async fn cascade_delete_reaches_local_children() {
    let h = harness();
    let workout = session("Push day");
    let set = set_of(&workout);
    let session_key = Entity::WorkoutSession(workout.clone()).key();
    seed_local(
        &h,
        vec![Entity::WorkoutSession(workout), Entity::ExerciseSet(set)],
    );
    h.coordinator.perform_initial_sync().await.unwrap();

    h.remote
        .delete_records(&ZoneId::private("workouts"), &[session_key.to_string()])
        .await
        .unwrap();
    let report = h.coordinator.perform_incremental_sync().await.unwrap();

    assert_eq!(report.deleted, 2);
    assert!(h.local.is_empty());
}

#[tokio::test]
async fn interrupted_incremental_does_not_resurrect_deletions() {
    let h = harness();
    let workout = session("Leg day");
    let workout_key = Entity::WorkoutSession(workout.clone()).key();
    seed_local(&h, vec![Entity::WorkoutSession(workout)]);
    h.coordinator.perform_initial_sync().await.unwrap();

    let nutrition = ZoneId::private("nutrition");
    h.remote
        .delete_records(&ZoneId::private("workouts"), &[workout_key.to_string()])
        .await
        .unwrap();
    let dinner = food("Salmon");
    remote_write(&h, Entity::FoodEntry(dinner.clone())).await;
    h.remote
        .fail_next_in_zone(RemoteOp::FetchZoneChanges, &nutrition, Failure::Transient);

    let err = h.coordinator.perform_incremental_sync().await.unwrap_err();
    assert!(err.is_retryable());
    assert!(h.local.fetch(&workout_key).unwrap().is_none());
    assert!(h.local.is_empty());

    let report = h.coordinator.perform_incremental_sync().await.unwrap();
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.deleted, 0);
    assert_eq!(h.local.snapshot(), vec![Entity::FoodEntry(dinner)]);
}

#[tokio::test]
async fn failed_local_write_keeps_zone_token() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    h.coordinator.perform_incremental_sync().await.unwrap();
    let scope = TokenScope::Zone(ZoneId::private("nutrition"));
    let before = h.coordinator.change_token(&scope).await;

    let snack = food("Apple");
    remote_write(&h, Entity::FoodEntry(snack.clone())).await;
    h.local.fail_next_apply();
    assert!(h.coordinator.perform_incremental_sync().await.is_err());
    assert_eq!(h.coordinator.change_token(&scope).await, before);

    let report = h.coordinator.perform_incremental_sync().await.unwrap();
    assert_eq!(report.downloaded, 1);
    assert_eq!(h.local.snapshot(), vec![Entity::FoodEntry(snack)]);
}

#[tokio::test]
async fn deleted_zone_drops_its_token() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    h.coordinator.perform_incremental_sync().await.unwrap();
    let nutrition = ZoneId::private("nutrition");
    let scope = TokenScope::Zone(nutrition.clone());
    assert!(h.coordinator.change_token(&scope).await.is_some());

    h.remote.delete_zone(&nutrition).await.unwrap();
    h.coordinator.perform_incremental_sync().await.unwrap();

    assert!(h.coordinator.change_token(&scope).await.is_none());
}

#[tokio::test]
async fn zone_sync_touches_only_that_zone() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    let lunch = food("Soup");
    remote_write(&h, Entity::FoodEntry(lunch.clone())).await;
    remote_write(&h, Entity::Exercise(exercise("Lunge"))).await;
    h.remote.reset_counts();

    let report = h
        .coordinator
        .sync_zone(&ZoneId::private("nutrition"))
        .await
        .unwrap();

    assert_eq!(report.downloaded, 1);
    assert_eq!(h.local.snapshot(), vec![Entity::FoodEntry(lunch)]);
    assert_eq!(h.remote.call_count(RemoteOp::FetchDatabaseChanges), 0);
}

// ── Local changes and the offline queue ──────────────────────────

#[tokio::test]
async fn local_edit_is_pushed_when_online() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    let curl = exercise("Curl");
    let key = Entity::Exercise(curl.clone()).key();

    let queued = local_edit(&h, vec![LocalChange::Upsert(Entity::Exercise(curl))]).await;

    assert_eq!(queued, 1);
    assert!(h.coordinator.queue().is_empty().unwrap());
    assert!(
        h.remote
            .record(&ZoneId::private("exerciseLibrary"), &key.to_string())
            .is_some()
    );
}

#[tokio::test]
async fn sync_origin_commits_are_ignored() {
    let h = harness();
    let event = h
        .local
        .apply(
            ChangeOrigin::Sync,
            vec![LocalChange::Upsert(Entity::Exercise(exercise("Echo")))],
        )
        .unwrap();

    assert_eq!(h.coordinator.handle_local_commit(event).await.unwrap(), 0);
    assert!(h.coordinator.queue().is_empty().unwrap());
}

#[tokio::test]
async fn offline_edits_coalesce_into_one_save() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    h.coordinator.set_online(false).await;

    let mut bench = exercise("Bench Press");
    let key = Entity::Exercise(bench.clone()).key();
    local_edit(&h, vec![LocalChange::Upsert(Entity::Exercise(bench.clone()))]).await;
    bench.name = "Bench Press 2".to_string();
    bench.modified_at = Utc::now();
    local_edit(&h, vec![LocalChange::Upsert(Entity::Exercise(bench))]).await;

    let pending = h.coordinator.queue().list().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, OperationKind::Save);

    h.remote.reset_counts();
    h.coordinator.set_online(true).await;

    assert_eq!(h.remote.call_count(RemoteOp::SaveRecords), 1);
    let stored = h
        .remote
        .record(&ZoneId::private("exerciseLibrary"), &key.to_string())
        .unwrap();
    assert_eq!(remote_name(&stored).as_deref(), Some("Bench Press 2"));
    assert!(h.coordinator.queue().is_empty().unwrap());
}

#[tokio::test]
async fn offline_save_then_delete_never_reaches_remote_as_save() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    h.coordinator.set_online(false).await;

    let press = exercise("Overhead Press");
    let key = Entity::Exercise(press.clone()).key();
    local_edit(&h, vec![LocalChange::Upsert(Entity::Exercise(press))]).await;
    local_edit(&h, vec![LocalChange::Delete(key)]).await;

    h.remote.reset_counts();
    h.coordinator.set_online(true).await;

    assert_eq!(h.remote.call_count(RemoteOp::SaveRecords), 0);
    assert_eq!(h.remote.call_count(RemoteOp::DeleteRecords), 1);
    assert!(
        h.remote
            .record(&ZoneId::private("exerciseLibrary"), &key.to_string())
            .is_none()
    );
}

#[tokio::test]
async fn transient_push_failure_keeps_operation() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    h.remote.fail_next(RemoteOp::SaveRecords, Failure::Timeout);

    let plank = exercise("Plank");
    local_edit(&h, vec![LocalChange::Upsert(Entity::Exercise(plank))]).await;

    let pending = h.coordinator.queue().list().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 1);

    let report = h.coordinator.perform_incremental_sync().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert!(h.coordinator.queue().is_empty().unwrap());
}

#[tokio::test]
async fn repeated_push_failures_never_drop_the_edit() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    for _ in 0..6 {
        h.remote.fail_next(RemoteOp::SaveRecords, Failure::Timeout);
    }

    let row = exercise("Seated Row");
    let key = Entity::Exercise(row.clone()).key();
    local_edit(&h, vec![LocalChange::Upsert(Entity::Exercise(row))]).await;
    for _ in 0..5 {
        let report = h.coordinator.push_pending().await.unwrap();
        assert!(report.dropped.is_empty());
    }
    let pending = h.coordinator.queue().pending_for(&key).unwrap().unwrap();
    assert_eq!(pending.retry_count, 6);

    let report = h.coordinator.perform_incremental_sync().await.unwrap();

    assert_eq!(report.pushed, 1);
    assert_eq!(report.dropped, 0);
    assert!(
        h.remote
            .record(&zone_of(&h, RecordType::Exercise), &key.to_string())
            .is_some()
    );
}

#[tokio::test]
async fn non_finite_edit_does_not_block_the_queue() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    h.coordinator.set_online(false).await;

    let mut shake = food("Shake");
    shake.protein_g = Some(f64::INFINITY);
    let salad = food("Salad");
    let salad_key = Entity::FoodEntry(salad.clone()).key();
    let queued = local_edit(
        &h,
        vec![
            LocalChange::Upsert(Entity::FoodEntry(shake)),
            LocalChange::Upsert(Entity::FoodEntry(salad)),
        ],
    )
    .await;
    assert_eq!(queued, 1);

    h.coordinator.set_online(true).await;
    h.coordinator.perform_incremental_sync().await.unwrap();

    assert!(h.coordinator.queue().is_empty().unwrap());
    assert!(
        h.remote
            .record(&zone_of(&h, RecordType::FoodEntry), &salad_key.to_string())
            .is_some()
    );
}

#[tokio::test]
async fn edit_before_zones_exist_creates_the_zone() {
    let h = harness();
    let squat = exercise("Goblet Squat");
    let key = Entity::Exercise(squat.clone()).key();

    local_edit(&h, vec![LocalChange::Upsert(Entity::Exercise(squat))]).await;

    let library = zone_of(&h, RecordType::Exercise);
    assert!(
        h.remote
            .zones(fitcoach_sync::DatabaseScope::Private)
            .contains(&library)
    );
    assert!(h.remote.record(&library, &key.to_string()).is_some());
    assert!(h.coordinator.queue().is_empty().unwrap());
}

#[tokio::test]
async fn change_detection_queues_user_commits() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    let detector = h.coordinator.start_change_detection();

    let lunge = exercise("Lunge");
    let key = Entity::Exercise(lunge.clone()).key();
    h.local
        .apply(
            ChangeOrigin::Local,
            vec![LocalChange::Upsert(Entity::Exercise(lunge))],
        )
        .unwrap();

    let remote = h.remote.clone();
    wait_until(|| {
        remote
            .record(&ZoneId::private("exerciseLibrary"), &key.to_string())
            .is_some()
    })
    .await;
    detector.abort();
}

#[tokio::test]
async fn change_detection_ignores_sync_writes() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    let detector = h.coordinator.start_change_detection();
    remote_write(&h, Entity::Exercise(exercise("Pull-up"))).await;
    h.remote.reset_counts();

    let report = h.coordinator.perform_incremental_sync().await.unwrap();
    assert_eq!(report.downloaded, 1);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(h.coordinator.queue().is_empty().unwrap());
    assert_eq!(h.remote.call_count(RemoteOp::SaveRecords), 0);
    detector.abort();
}

#[tokio::test]
async fn missed_commits_force_full_sync() {
    let h = harness_with(test_config(), InMemoryLocalStore::with_event_capacity(1));
    h.coordinator.perform_initial_sync().await.unwrap();
    assert!(h.coordinator.last_sync_timestamp().unwrap().is_some());
    let detector = h.coordinator.start_change_detection();

    for name in ["A", "B", "C"] {
        seed_local(&h, vec![Entity::Exercise(exercise(name))]);
    }

    let coordinator = h.coordinator.clone();
    wait_until(|| coordinator.last_sync_timestamp().unwrap().is_none()).await;
    detector.abort();

    let report = h.coordinator.perform_incremental_sync().await.unwrap();
    assert_eq!(report.kind, SyncKind::Full);
}

// ── Conflicts ────────────────────────────────────────────────────

/// Sets up an exercise edited offline locally and remotely.
async fn conflicting_edit(h: &Harness, local_modified: DateTime<Utc>) -> RecordKey {
    let original = exercise("Original");
    let key = Entity::Exercise(original.clone()).key();
    seed_local(h, vec![Entity::Exercise(original.clone())]);
    h.coordinator.perform_initial_sync().await.unwrap();
    h.coordinator.set_online(false).await;

    let mut mine = original.clone();
    mine.name = "Local".to_string();
    mine.modified_at = local_modified;
    local_edit(h, vec![LocalChange::Upsert(Entity::Exercise(mine))]).await;

    let mut theirs = original;
    theirs.name = "Remote".to_string();
    theirs.modified_at = Utc::now();
    remote_write(h, Entity::Exercise(theirs)).await;
    key
}

#[tokio::test]
async fn server_wins_by_default() {
    let h = harness();
    let key = conflicting_edit(&h, Utc::now()).await;

    let report = h.coordinator.perform_incremental_sync().await.unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(local_exercise_name(&h, &key).as_deref(), Some("Remote"));
    assert!(h.coordinator.queue().is_empty().unwrap());
}

#[tokio::test]
async fn client_wins_requeues_local_version() {
    let h = harness();
    h.coordinator
        .set_conflict_resolution_strategy(ConflictStrategy::ClientWins)
        .await;
    let key = conflicting_edit(&h, Utc::now()).await;

    h.coordinator.perform_incremental_sync().await.unwrap();
    assert_eq!(local_exercise_name(&h, &key).as_deref(), Some("Local"));
    assert!(h.coordinator.queue().pending_for(&key).unwrap().is_some());

    h.coordinator.set_online(true).await;
    let stored = h
        .remote
        .record(&ZoneId::private("exerciseLibrary"), &key.to_string())
        .unwrap();
    assert_eq!(remote_name(&stored).as_deref(), Some("Local"));
}

#[tokio::test]
async fn newest_wins_prefers_newer_local_edit() {
    let h = harness();
    h.coordinator
        .set_conflict_resolution_strategy(ConflictStrategy::NewestWins)
        .await;
    let key = {
        let original = exercise("Original");
        let key = Entity::Exercise(original.clone()).key();
        seed_local(&h, vec![Entity::Exercise(original.clone())]);
        h.coordinator.perform_initial_sync().await.unwrap();
        h.coordinator.set_online(false).await;

        h.remote.set_server_time(Some(Utc::now() - Duration::hours(1)));
        let mut theirs = original.clone();
        theirs.name = "Remote".to_string();
        remote_write(&h, Entity::Exercise(theirs)).await;

        let mut mine = original;
        mine.name = "Local".to_string();
        mine.modified_at = Utc::now();
        local_edit(&h, vec![LocalChange::Upsert(Entity::Exercise(mine))]).await;
        key
    };

    h.coordinator.perform_incremental_sync().await.unwrap();

    assert_eq!(local_exercise_name(&h, &key).as_deref(), Some("Local"));
}

#[tokio::test]
async fn newest_wins_tie_goes_to_remote() {
    let h = harness();
    h.coordinator
        .set_conflict_resolution_strategy(ConflictStrategy::NewestWins)
        .await;
    let tie = Utc::now();
    let original = exercise("Original");
    let key = Entity::Exercise(original.clone()).key();
    seed_local(&h, vec![Entity::Exercise(original.clone())]);
    h.coordinator.perform_initial_sync().await.unwrap();
    h.coordinator.set_online(false).await;

    let mut mine = original.clone();
    mine.name = "Local".to_string();
    mine.modified_at = tie;
    local_edit(&h, vec![LocalChange::Upsert(Entity::Exercise(mine))]).await;

    h.remote.set_server_time(Some(tie));
    let mut theirs = original;
    theirs.name = "Remote".to_string();
    remote_write(&h, Entity::Exercise(theirs)).await;

    h.coordinator.perform_incremental_sync().await.unwrap();

    assert_eq!(local_exercise_name(&h, &key).as_deref(), Some("Remote"));
}

#[tokio::test]
async fn manual_conflict_is_parked_until_resolved() {
    let h = harness();
    h.coordinator
        .set_conflict_resolution_strategy(ConflictStrategy::Manual)
        .await;
    let key = conflicting_edit(&h, Utc::now()).await;

    let report = h.coordinator.perform_incremental_sync().await.unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(local_exercise_name(&h, &key).as_deref(), Some("Local"));
    assert!(h.coordinator.queue().is_empty().unwrap());
    let parked = h.coordinator.conflicted_entities().await;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].key, key);
    assert_eq!(
        parked[0].remote.as_ref().and_then(remote_name).as_deref(),
        Some("Remote")
    );

    assert!(
        h.coordinator
            .resolve_conflict(&key, ConflictDecision::UseRemote)
            .await
            .unwrap()
    );
    assert_eq!(local_exercise_name(&h, &key).as_deref(), Some("Remote"));
    assert!(h.coordinator.conflicted_entities().await.is_empty());
}

#[tokio::test]
async fn manual_resolution_can_keep_local() {
    let h = harness();
    h.coordinator
        .set_conflict_resolution_strategy(ConflictStrategy::Manual)
        .await;
    let key = conflicting_edit(&h, Utc::now()).await;
    h.coordinator.perform_incremental_sync().await.unwrap();
    h.coordinator.set_online(true).await;

    h.coordinator
        .resolve_conflict(&key, ConflictDecision::UseLocal)
        .await
        .unwrap();

    let stored = h
        .remote
        .record(&ZoneId::private("exerciseLibrary"), &key.to_string())
        .unwrap();
    assert_eq!(remote_name(&stored).as_deref(), Some("Local"));
    assert!(h.coordinator.queue().is_empty().unwrap());
}

#[tokio::test]
async fn resolving_unknown_conflict_returns_false() {
    let h = harness();
    let key = RecordKey::new(RecordType::Goal, EntityId::new());

    assert!(
        !h.coordinator
            .resolve_conflict(&key, ConflictDecision::UseRemote)
            .await
            .unwrap()
    );
    assert!(
        h.coordinator
            .resolve_conflict(&key, ConflictDecision::RequiresManualResolution)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn identical_content_is_not_a_conflict() {
    let h = harness();
    let original = exercise("Same");
    seed_local(&h, vec![Entity::Exercise(original.clone())]);
    h.coordinator.perform_initial_sync().await.unwrap();
    h.coordinator.set_online(false).await;

    let mut edited = original;
    edited.name = "Same everywhere".to_string();
    local_edit(&h, vec![LocalChange::Upsert(Entity::Exercise(edited.clone()))]).await;
    remote_write(&h, Entity::Exercise(edited)).await;

    let report = h.coordinator.perform_incremental_sync().await.unwrap();

    assert_eq!(report.conflicts, 0);
    assert!(h.coordinator.queue().is_empty().unwrap());
}

#[tokio::test]
async fn clearing_a_field_reaches_the_remote_without_conflict() {
    let h = harness();
    let mut bench = exercise("Bench Press");
    let key = Entity::Exercise(bench.clone()).key();
    seed_local(&h, vec![Entity::Exercise(bench.clone())]);
    h.coordinator.perform_initial_sync().await.unwrap();

    bench.equipment = None;
    bench.modified_at = Utc::now();
    local_edit(&h, vec![LocalChange::Upsert(Entity::Exercise(bench))]).await;
    let report = h.coordinator.perform_incremental_sync().await.unwrap();

    assert_eq!(report.conflicts, 0);
    let Some(Entity::Exercise(local)) = h.local.fetch(&key).unwrap() else {
        panic!("exercise missing locally");
    };
    assert_eq!(local.equipment, None);
    let stored = h
        .remote
        .record(&zone_of(&h, RecordType::Exercise), &key.to_string())
        .unwrap();
    assert!(stored.get("equipment").is_none());
}

#[tokio::test]
async fn zone_sync_keeps_other_zones_edits_pending() {
    let h = harness();
    h.coordinator
        .set_conflict_resolution_strategy(ConflictStrategy::ClientWins)
        .await;
    let original = exercise("Original");
    let key = Entity::Exercise(original.clone()).key();
    seed_local(&h, vec![Entity::Exercise(original.clone())]);
    h.coordinator.perform_initial_sync().await.unwrap();
    let synced_at = h.coordinator.last_sync_timestamp().unwrap();

    let mut mine = original.clone();
    mine.name = "Local".to_string();
    mine.modified_at = Utc::now();
    seed_local(&h, vec![Entity::Exercise(mine)]);
    let mut theirs = original;
    theirs.name = "Remote".to_string();
    theirs.modified_at = Utc::now();
    remote_write(&h, Entity::Exercise(theirs)).await;

    h.coordinator
        .sync_zone(&zone_of(&h, RecordType::FoodEntry))
        .await
        .unwrap();
    assert_eq!(h.coordinator.last_sync_timestamp().unwrap(), synced_at);

    let report = h.coordinator.perform_incremental_sync().await.unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(local_exercise_name(&h, &key).as_deref(), Some("Local"));
    assert!(h.coordinator.queue().pending_for(&key).unwrap().is_some());
}

// ── Authorization, triggers and reset ────────────────────────────

#[tokio::test]
async fn unavailable_account_disables_sync() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    h.remote.set_account_status(AccountStatus::NoAccount);

    let err = h.coordinator.perform_incremental_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::RemoteUnavailable(_)));
    assert_eq!(h.coordinator.phase(), SyncPhase::DisabledUntilReauthorized);

    h.remote.set_account_status(AccountStatus::Available);
    h.coordinator.perform_incremental_sync().await.unwrap();
    assert_eq!(h.coordinator.phase(), SyncPhase::Idle);
}

#[tokio::test]
async fn losing_account_mid_pass_disables_sync() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    h.remote
        .fail_next(RemoteOp::FetchDatabaseChanges, Failure::Unavailable);

    assert!(h.coordinator.perform_incremental_sync().await.is_err());
    assert_eq!(h.coordinator.phase(), SyncPhase::DisabledUntilReauthorized);
}

#[tokio::test]
async fn trigger_runs_a_pass() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    let lunch = food("Wrap");
    remote_write(&h, Entity::FoodEntry(lunch.clone())).await;

    let outcome = h.coordinator.trigger(SyncTrigger::Foreground).await;

    assert_eq!(outcome, TriggerOutcome::Ran);
    assert_eq!(h.local.snapshot(), vec![Entity::FoodEntry(lunch)]);
}

#[tokio::test]
async fn trigger_swallows_failures() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    h.remote.set_account_status(AccountStatus::Restricted);

    let outcome = h.coordinator.trigger(SyncTrigger::UserRequested).await;

    assert_eq!(outcome, TriggerOutcome::Ran);
    assert_eq!(h.coordinator.phase(), SyncPhase::DisabledUntilReauthorized);
}

#[tokio::test]
async fn reset_forgets_progress_but_keeps_queue() {
    let h = harness();
    h.coordinator.perform_initial_sync().await.unwrap();
    h.coordinator.perform_incremental_sync().await.unwrap();
    h.coordinator.set_online(false).await;
    local_edit(
        &h,
        vec![LocalChange::Upsert(Entity::Exercise(exercise("Queued")))],
    )
    .await;

    h.coordinator.reset_sync_state().await.unwrap();

    assert!(!h.coordinator.is_initial_sync_completed());
    assert!(h.coordinator.last_sync_timestamp().unwrap().is_none());
    assert!(
        h.coordinator
            .change_token(&TokenScope::Zone(ZoneId::private("workouts")))
            .await
            .is_none()
    );
    assert_eq!(h.coordinator.queue().len().unwrap(), 1);
}
