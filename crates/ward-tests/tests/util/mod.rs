use eyre::Result;
use ward_core::{PoolKind, Subject, SubjectKind};
use ward_tests::TestCtx;

/// Registers `count` subjects of `kind` named `{prefix}-{i}`.
#[allow(unused)]
pub async fn register_many(
    ctx: &TestCtx,
    kind: SubjectKind,
    prefix: &str,
    count: usize,
) -> Result<Vec<Subject>> {
    let mut subjects = Vec::with_capacity(count);
    for i in 0..count {
        subjects.push(ctx.api.register(kind, &format!("{prefix}-{i}")).await?.result?);
    }
    Ok(subjects)
}

/// Checks that the pool counts add up and returns the number of held units.
#[allow(unused)]
pub async fn held_units(ctx: &TestCtx, pool: PoolKind) -> Result<u32> {
    let (summary, rate) = ctx.api.pool_summary(pool).await?.result?;
    assert_eq!(
        summary.available + summary.held,
        summary.total,
        "Available and held {pool} units must add up to the pool size."
    );
    assert!(
        (rate - summary.held as f64 / summary.total as f64).abs() < 1e-9,
        "The occupancy rate must be held over total units."
    );
    Ok(summary.held)
}
