use eyre::Result;
use ward_core::{PoolKind, RoomClass, UnitKind, UnitStatus};
use ward_tests::TestCtxBuilder;

mod util;

#[tokio::test]
#[ntest::timeout(20_000)]
async fn seeding_twice_keeps_the_fixed_pools() -> Result<()> {
    let ctx = TestCtxBuilder::from_env()?.build().await?;

    // `build()` already seeded, so this must not add anything
    assert_eq!(
        ctx.api.seed_pools().await?.result?,
        0,
        "Seeding an already seeded store must create no units."
    );

    let units = ctx.api.list_units(None, None).await?.result?;
    assert_eq!(units.len(), 80);
    for (pool, expected) in [
        (PoolKind::General, 50),
        (PoolKind::Icu, 25),
        (PoolKind::Ambulance, 5),
    ] {
        let (summary, rate) = ctx.api.pool_summary(pool).await?.result?;
        assert_eq!(summary.total, expected, "{pool} must have {expected} units.");
        assert_eq!(summary.available, expected);
        assert_eq!(rate, 0.0);
    }

    assert!(units.iter().all(|u| u.status == UnitStatus::Available));
    assert!(units.windows(2).all(|w| w[0].id < w[1].id), "Units must be ordered by id.");

    ctx.finish().await;
    Ok(())
}

#[tokio::test]
#[ntest::timeout(20_000)]
async fn unit_labels_and_classes() -> Result<()> {
    let ctx = TestCtxBuilder::from_env()?.build().await?;

    let general = ctx.api.list_units(Some(PoolKind::General), None).await?.result?;
    assert_eq!(general[0].label, "GEN-1");
    assert_eq!(general[0].kind, UnitKind::GeneralRoom(RoomClass::Single));
    assert_eq!(general[20].kind, UnitKind::GeneralRoom(RoomClass::Double));
    assert_eq!(general[49].label, "GEN-50");
    assert_eq!(general[49].kind, UnitKind::GeneralRoom(RoomClass::Deluxe));

    let icu = ctx.api.list_units(Some(PoolKind::Icu), None).await?.result?;
    assert_eq!(icu.first().map(|u| u.label.as_str()), Some("ICU-1"));
    assert!(icu.iter().all(|u| u.kind == UnitKind::IcuRoom));

    let ambulances = ctx.api.list_units(Some(PoolKind::Ambulance), None).await?.result?;
    let labels: Vec<_> = ambulances.iter().map(|u| u.label.as_str()).collect();
    assert_eq!(labels, ["AMB-1", "AMB-2", "AMB-3", "AMB-4", "AMB-5"]);

    let available = ctx
        .api
        .list_units(None, Some(UnitStatus::Available))
        .await?
        .result?;
    assert_eq!(available.len(), 80);

    ctx.finish().await;
    Ok(())
}
