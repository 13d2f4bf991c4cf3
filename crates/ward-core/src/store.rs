//! Persistence interface consumed by the allocator

use chrono::{DateTime, Utc};

use crate::model::{
    HistoryFilter, HistoryRecord, NewRecord, PoolKind, ResourceUnit, Subject, SubjectId, UnitId,
    UnitStatus, UnitUpdate,
};
use crate::AllocResult;

/// Expected state of a unit for a compare-and-set
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct UnitState {
    pub status: UnitStatus,
    pub subject: Option<SubjectId>,
}

impl UnitState {
    pub const AVAILABLE: UnitState = UnitState {
        status: UnitStatus::Available,
        subject: None,
    };

    /// Current state of `unit`
    pub fn of(unit: &ResourceUnit) -> Self {
        Self {
            status: unit.status,
            subject: unit.assigned_subject,
        }
    }

    #[inline]
    pub fn matches(&self, unit: &ResourceUnit) -> bool {
        *self == Self::of(unit)
    }
}

/// Durable tables of units, subjects and the release log
///
/// Every write that changes an assignment is a compare-and-set: it fails with
/// [`Conflict`](crate::AllocError::Conflict) when the row no longer looks
/// like the caller expects, so two requests can never both win the same unit.
///
/// Implementations must report an unreachable backend as
/// [`StorageUnavailable`](crate::AllocError::StorageUnavailable) and never
/// as an empty result.
pub trait Store: Send + Sync {
    /// Insert `units` if and only if the unit table is empty
    ///
    /// The emptiness check and the insert happen as one step. Returns whether
    /// the units were inserted.
    fn seed_units(&self, units: &[ResourceUnit]) -> AllocResult<bool>;

    /// Number of units, optionally restricted to one pool
    fn count_units(&self, pool: Option<PoolKind>) -> AllocResult<u32>;

    /// Units ordered by ascending id
    fn list_units(
        &self,
        pool: Option<PoolKind>,
        status: Option<UnitStatus>,
    ) -> AllocResult<Vec<ResourceUnit>>;

    fn get_unit(&self, id: UnitId) -> AllocResult<ResourceUnit>;

    /// Apply `update` to unit `id` if its current state equals `expected`
    fn update_unit(
        &self,
        id: UnitId,
        expected: UnitState,
        update: UnitUpdate,
    ) -> AllocResult<ResourceUnit>;

    fn insert_subject(&self, subject: Subject) -> AllocResult<()>;

    fn get_subject(&self, id: SubjectId) -> AllocResult<Subject>;

    /// Subjects ordered by creation time
    fn list_subjects(&self) -> AllocResult<Vec<Subject>>;

    /// Set the subject's unit for `pool` to `new` if it currently is `expected`
    ///
    /// Assigning clears `discharged_at`; clearing the last held unit sets it
    /// to `at`.
    fn update_subject(
        &self,
        id: SubjectId,
        pool: PoolKind,
        expected: Option<UnitId>,
        new: Option<UnitId>,
        at: DateTime<Utc>,
    ) -> AllocResult<Subject>;

    /// Append a write-once release record
    fn append_history(&self, record: NewRecord) -> AllocResult<HistoryRecord>;

    /// Release records in insertion order
    fn list_history(&self, filter: &HistoryFilter) -> AllocResult<Vec<HistoryRecord>>;

    /// Hand unit `unit` to `subject`, updating both rows as one step
    ///
    /// Fails with [`Conflict`](crate::AllocError::Conflict) if the unit is no
    /// longer in state `expected`, and with
    /// [`AlreadyAllocated`](crate::AllocError::AlreadyAllocated) if the
    /// subject already holds a unit of the same pool. On failure neither row
    /// changes.
    fn assign(
        &self,
        unit: UnitId,
        expected: UnitState,
        subject: SubjectId,
        at: DateTime<Utc>,
    ) -> AllocResult<(ResourceUnit, Subject)>;

    /// Return `unit` to its pool and log the release, as one step
    ///
    /// `unit` is the held unit as last read; the write fails with
    /// [`Conflict`](crate::AllocError::Conflict) if the unit or its holder's
    /// slot changed since. On failure nothing is written.
    fn free(
        &self,
        unit: &ResourceUnit,
        record: NewRecord,
    ) -> AllocResult<(ResourceUnit, HistoryRecord)>;
}
