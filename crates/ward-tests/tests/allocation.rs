use eyre::Result;
use ward_core::{AllocError, HistoryFilter, PoolKind, RecordKind, SubjectKind, UnitStatus};
use ward_tests::TestCtxBuilder;

mod util;

#[tokio::test]
#[ntest::timeout(20_000)]
async fn allocate_and_discharge() -> Result<()> {
    let ctx = TestCtxBuilder::from_env()?.build().await?;
    let api = ctx.api.as_actor("nurse-joy");

    let alice = api.register(SubjectKind::Patient, "Alice").await?.result?;
    let room = api.allocate(alice.id, PoolKind::General).await?.result?;
    assert_eq!(room.label, "GEN-1");
    assert_eq!(room.status, UnitStatus::Booked);
    assert_eq!(room.assigned_subject, Some(alice.id));
    assert_eq!(room.assigned_at, Some(ctx.now()));
    assert_eq!(util::held_units(&ctx, PoolKind::General).await?, 1);

    let alice = api.get_subject(alice.id).await?.result?;
    assert_eq!(alice.assigned_unit(PoolKind::General), Some(room.id));

    ctx.advance(chrono::Duration::hours(30));
    let record = api.release(room.id, "recovered").await?.result?;
    assert_eq!(record.kind, RecordKind::Discharge);
    assert_eq!(record.subject_id, alice.id);
    assert_eq!(record.subject_name, "Alice");
    assert_eq!(record.unit_label, "GEN-1");
    assert_eq!(record.reason, "recovered");
    assert_eq!(record.released_by, "nurse-joy");
    assert_eq!(record.assigned_at, room.assigned_at);
    assert_eq!(record.released_at, ctx.now());

    let room = api.unit_status(room.id).await?.result?;
    assert_eq!(room.status, UnitStatus::Available);
    assert_eq!(room.assigned_subject, None);
    assert_eq!(util::held_units(&ctx, PoolKind::General).await?, 0);

    let alice = api.get_subject(alice.id).await?.result?;
    assert!(!alice.holds_any());
    assert_eq!(alice.discharged_at, Some(ctx.now()));

    let history = api
        .history(HistoryFilter {
            subject: Some(alice.id),
            ..Default::default()
        })
        .await?
        .result?;
    assert_eq!(history, vec![record], "Exactly one record must be appended.");

    drop(api);
    ctx.finish().await;
    Ok(())
}

#[tokio::test]
#[ntest::timeout(20_000)]
async fn lowest_free_unit_is_selected() -> Result<()> {
    let ctx = TestCtxBuilder::from_env()?.build().await?;
    let subjects = util::register_many(&ctx, SubjectKind::Patient, "patient", 3).await?;

    let first = ctx.api.allocate(subjects[0].id, PoolKind::General).await?.result?;
    let second = ctx.api.allocate(subjects[1].id, PoolKind::General).await?.result?;
    assert_eq!((first.label.as_str(), second.label.as_str()), ("GEN-1", "GEN-2"));

    ctx.api.release(first.id, "transferred").await?.result?;
    let third = ctx.api.allocate(subjects[2].id, PoolKind::General).await?.result?;
    assert_eq!(third.label, "GEN-1", "A freed unit must be handed out again first.");

    ctx.finish().await;
    Ok(())
}

#[tokio::test]
#[ntest::timeout(20_000)]
async fn explicit_unit_cannot_be_booked_twice() -> Result<()> {
    let ctx = TestCtxBuilder::from_env()?.build().await?;
    let alice = ctx.api.register(SubjectKind::Patient, "Alice").await?.result?;
    let bob = ctx.api.register(SubjectKind::Patient, "Bob").await?.result?;

    let room = ctx
        .api
        .allocate_unit(alice.id, PoolKind::General, Some(7))
        .await?
        .result?;
    assert_eq!(room.label, "GEN-7");

    let second = ctx.api.allocate_unit(bob.id, PoolKind::General, Some(7)).await?;
    assert!(matches!(second.result, Err(AllocError::AlreadyAllocated(_))));

    // one unit per pool and subject
    let again = ctx.api.allocate(alice.id, PoolKind::General).await?;
    assert!(matches!(again.result, Err(AllocError::AlreadyAllocated(_))));

    let wrong_pool = ctx.api.allocate_unit(bob.id, PoolKind::General, Some(51)).await?;
    assert!(matches!(wrong_pool.result, Err(AllocError::InvalidInput(_))));

    let room = ctx.api.unit_status(7).await?.result?;
    assert_eq!(room.assigned_subject, Some(alice.id));

    ctx.finish().await;
    Ok(())
}

#[tokio::test]
#[ntest::timeout(20_000)]
async fn icu_pool_runs_out() -> Result<()> {
    let ctx = TestCtxBuilder::from_env()?.build().await?;
    let subjects = util::register_many(&ctx, SubjectKind::EmergencyPatient, "emergency", 26).await?;

    for subject in &subjects[..25] {
        ctx.api.allocate(subject.id, PoolKind::Icu).await?.result?;
    }
    let last = ctx.api.allocate(subjects[25].id, PoolKind::Icu).await?;
    assert_eq!(last.result, Err(AllocError::PoolExhausted(PoolKind::Icu)));

    let (summary, rate) = ctx.api.pool_summary(PoolKind::Icu).await?.result?;
    assert_eq!((summary.available, summary.held), (0, 25));
    assert_eq!(rate, 1.0);
    assert_eq!(ctx.api.available_count(PoolKind::Icu).await?.result?, 0);
    assert_eq!(ctx.api.occupancy_rate(PoolKind::Icu).await?.result?, 1.0);
    assert_eq!(ctx.api.available_count(PoolKind::General).await?.result?, 50);
    assert_eq!(ctx.api.occupancy_rate(PoolKind::General).await?.result?, 0.0);

    // the other pools are untouched
    assert_eq!(util::held_units(&ctx, PoolKind::General).await?, 0);

    ctx.finish().await;
    Ok(())
}

#[tokio::test]
#[ntest::timeout(20_000)]
async fn release_errors() -> Result<()> {
    let ctx = TestCtxBuilder::from_env()?.build().await?;
    let alice = ctx.api.register(SubjectKind::Patient, "Alice").await?.result?;
    let room = ctx.api.allocate(alice.id, PoolKind::General).await?.result?;

    let no_reason = ctx.api.release(room.id, "   ").await?;
    assert!(matches!(no_reason.result, Err(AllocError::InvalidInput(_))));
    let room = ctx.api.unit_status(room.id).await?.result?;
    assert_eq!(room.status, UnitStatus::Booked, "A rejected release must change nothing.");

    let free = ctx.api.release(3, "recovered").await?;
    assert_eq!(free.result, Err(AllocError::NotAllocated(3)));

    let unknown = ctx.api.release(999, "recovered").await?;
    assert!(matches!(unknown.result, Err(AllocError::NotFound(_))));

    ctx.api.release(room.id, "recovered").await?.result?;
    let twice = ctx.api.release(room.id, "recovered").await?;
    assert_eq!(twice.result, Err(AllocError::NotAllocated(room.id)));

    let history = ctx.api.history(HistoryFilter::default()).await?.result?;
    assert_eq!(history.len(), 1);

    ctx.finish().await;
    Ok(())
}

#[tokio::test]
#[ntest::timeout(20_000)]
async fn registration_and_pending_lists() -> Result<()> {
    let ctx = TestCtxBuilder::from_env()?.build().await?;

    let nameless = ctx.api.register(SubjectKind::Patient, "  ").await?;
    assert!(matches!(nameless.result, Err(AllocError::InvalidInput(_))));

    let patients = util::register_many(&ctx, SubjectKind::Patient, "patient", 3).await?;
    let request = ctx
        .api
        .register(SubjectKind::AmbulanceRequest, "Main St 1")
        .await?
        .result?;

    let pending = ctx.api.pending_subjects(PoolKind::General).await?.result?;
    assert_eq!(pending.len(), 3);

    let room = ctx.api.allocate(patients[0].id, PoolKind::General).await?.result?;
    let pending = ctx.api.pending_subjects(PoolKind::General).await?.result?;
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|s| s.id != patients[0].id));

    // discharged subjects do not wait for a room again
    ctx.api.release(room.id, "recovered").await?.result?;
    let pending = ctx.api.pending_subjects(PoolKind::General).await?.result?;
    assert_eq!(pending.len(), 2);

    let waiting = ctx.api.pending_subjects(PoolKind::Ambulance).await?.result?;
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].id, request.id);

    let unknown = ctx.api.get_subject(uuid::Uuid::new_v4()).await?;
    assert!(matches!(unknown.result, Err(AllocError::NotFound(_))));

    ctx.finish().await;
    Ok(())
}

#[tokio::test]
#[ntest::timeout(20_000)]
async fn history_filters() -> Result<()> {
    let ctx = TestCtxBuilder::from_env()?.build().await?;
    let alice = ctx.api.register(SubjectKind::Patient, "Alice").await?.result?;
    let bob = ctx.api.register(SubjectKind::EmergencyPatient, "Bob").await?.result?;

    let room = ctx.api.allocate(alice.id, PoolKind::General).await?.result?;
    let icu = ctx.api.allocate(bob.id, PoolKind::Icu).await?.result?;
    ctx.api.release(room.id, "recovered").await?.result?;
    ctx.api.release(icu.id, "moved to general").await?.result?;

    let all = ctx.api.history(HistoryFilter::default()).await?.result?;
    assert_eq!(all.len(), 2);
    assert!(all[0].id < all[1].id, "Records must be listed oldest first.");

    let icu_only = ctx
        .api
        .history(HistoryFilter {
            pool: Some(PoolKind::Icu),
            subject: None,
        })
        .await?
        .result?;
    assert_eq!(icu_only.len(), 1);
    assert_eq!(icu_only[0].subject_id, bob.id);

    let nothing = ctx
        .api
        .history(HistoryFilter {
            pool: Some(PoolKind::Icu),
            subject: Some(alice.id),
        })
        .await?
        .result?;
    assert!(nothing.is_empty());

    ctx.finish().await;
    Ok(())
}
