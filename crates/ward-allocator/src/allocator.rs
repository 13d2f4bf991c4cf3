//! Implementation of the allocator
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;
use ward_core::model::{AUTO_RETURN_REASON, SYSTEM_ACTOR};
use ward_core::{
    AllocError, AllocResult, AmbulanceStatus, Clock, Config, HistoryFilter, HistoryRecord,
    NewRecord, NewSubject, PoolKind, PoolSummary, RequestContext, ResourceUnit, Store, Subject,
    SubjectId, UnitId, UnitState, UnitStatus,
};

use crate::pools;

/// Assigns rooms and ambulances to subjects and takes them back
///
/// The allocator keeps no state of its own besides its configuration: every
/// decision is made against the [`Store`], whose compare-and-set writes keep
/// concurrent requests from handing out the same unit twice.
pub struct Allocator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    /// Time after dispatch at which an ambulance is considered back
    return_after: Duration,
}

impl Allocator {
    /// Create a new [`Allocator`]
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: &Config) -> Self {
        Self {
            store,
            clock,
            return_after: Duration::seconds(config.ambulance_return_secs as i64),
        }
    }

    /// Create the standard pools unless units already exist
    ///
    /// Returns the number of units created, `0` if the pools were already
    /// there.
    pub fn seed_pools(&self) -> AllocResult<u32> {
        let layout = pools::standard_layout();
        if self.store.seed_units(&layout)? {
            info!(units = layout.len(), "seeded unit pools");
            Ok(layout.len() as u32)
        } else {
            debug!(units = self.store.count_units(None)?, "unit pools already seeded");
            Ok(0)
        }
    }

    /// Record a new patient, emergency patient or ambulance request
    pub fn register_subject(&self, ctx: &RequestContext, new: NewSubject) -> AllocResult<Subject> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(AllocError::InvalidInput("name must not be empty".into()));
        }

        let subject = Subject {
            id: Uuid::new_v4(),
            kind: new.kind,
            name: name.to_owned(),
            contact: non_empty(new.contact),
            address: non_empty(new.address),
            blood_type: non_empty(new.blood_type),
            created_at: self.clock.now(),
            assignments: [None; 3],
            discharged_at: None,
        };
        self.store.insert_subject(subject.clone())?;
        info!(
            request_id = %ctx.request_id,
            actor = %ctx.actor,
            subject = %subject.id,
            kind = subject.kind.as_str(),
            "registered subject"
        );
        Ok(subject)
    }

    pub fn get_subject(&self, id: SubjectId) -> AllocResult<Subject> {
        self.store.get_subject(id)
    }

    /// Subjects served by `pool` that hold no unit of it and were not discharged
    pub fn pending_subjects(&self, pool: PoolKind) -> AllocResult<Vec<Subject>> {
        Ok(self
            .store
            .list_subjects()?
            .into_iter()
            .filter(|s| {
                s.kind.home_pool() == pool
                    && s.assigned_unit(pool).is_none()
                    && s.discharged_at.is_none()
            })
            .collect())
    }

    /// Give `subject` a unit of `pool`
    ///
    /// Without an explicit `unit` the available unit with the lowest id is
    /// taken. If another request wins that unit first, selection starts over.
    pub fn allocate(
        &self,
        ctx: &RequestContext,
        subject: SubjectId,
        pool: PoolKind,
        unit: Option<UnitId>,
    ) -> AllocResult<ResourceUnit> {
        let span = info_span!(
            "allocate",
            request_id = %ctx.request_id,
            actor = %ctx.actor,
            %subject,
            %pool
        );
        let _guard = span.enter();

        let holder = self.store.get_subject(subject)?;
        if let Some(held) = holder.assigned_unit(pool) {
            return Err(AllocError::AlreadyAllocated(format!(
                "subject {subject} already holds {pool} unit {held}"
            )));
        }

        let assigned = match unit {
            Some(id) => self.allocate_unit(subject, pool, id)?,
            None => self.allocate_any(subject, pool)?,
        };
        info!(unit = assigned.id, label = %assigned.label, "allocated unit");
        Ok(assigned)
    }

    fn allocate_unit(
        &self,
        subject: SubjectId,
        pool: PoolKind,
        id: UnitId,
    ) -> AllocResult<ResourceUnit> {
        let unit = self.store.get_unit(id)?;
        if unit.pool() != pool {
            return Err(AllocError::InvalidInput(format!(
                "unit {} is not a {pool} unit",
                unit.label
            )));
        }
        if unit.status.is_held() {
            return Err(AllocError::AlreadyAllocated(format!(
                "unit {} is {}",
                unit.label, unit.status
            )));
        }

        match self
            .store
            .assign(id, UnitState::AVAILABLE, subject, self.clock.now())
        {
            Ok((unit, _)) => Ok(unit),
            Err(AllocError::Conflict(_)) => Err(AllocError::AlreadyAllocated(format!(
                "unit {} was taken by a concurrent request",
                unit.label
            ))),
            Err(err) => Err(err),
        }
    }

    fn allocate_any(&self, subject: SubjectId, pool: PoolKind) -> AllocResult<ResourceUnit> {
        loop {
            // every lost race removes one unit from the available set, so this
            // terminates after at most one round per unit
            let candidate = self
                .store
                .list_units(Some(pool), Some(UnitStatus::Available))?
                .into_iter()
                .next()
                .ok_or(AllocError::PoolExhausted(pool))?;

            match self
                .store
                .assign(candidate.id, UnitState::AVAILABLE, subject, self.clock.now())
            {
                Ok((unit, _)) => return Ok(unit),
                Err(AllocError::Conflict(_)) => {
                    warn!(unit = candidate.id, "unit claimed concurrently, selecting again");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Free a held unit and append a discharge or return record
    pub fn release(
        &self,
        ctx: &RequestContext,
        unit: UnitId,
        reason: &str,
    ) -> AllocResult<HistoryRecord> {
        let span = info_span!(
            "release",
            request_id = %ctx.request_id,
            actor = %ctx.actor,
            unit
        );
        let _guard = span.enter();

        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AllocError::InvalidInput(
                "release reason must not be empty".into(),
            ));
        }
        let unit = self.store.get_unit(unit)?;
        self.release_unit(ctx, &unit, reason)
    }

    fn release_unit(
        &self,
        ctx: &RequestContext,
        unit: &ResourceUnit,
        reason: &str,
    ) -> AllocResult<HistoryRecord> {
        let Some(holder) = unit.assigned_subject else {
            return Err(AllocError::NotAllocated(unit.id));
        };
        let subject = self.store.get_subject(holder)?;

        let record = NewRecord {
            subject_id: holder,
            subject_name: subject.name,
            unit_id: unit.id,
            unit_label: unit.label.clone(),
            pool: unit.pool(),
            assigned_at: unit.assigned_at,
            released_at: self.clock.now(),
            reason: reason.to_owned(),
            released_by: ctx.actor.clone(),
        };

        match self.store.free(unit, record) {
            Ok((_, logged)) => {
                info!(
                    label = %logged.unit_label,
                    subject = %logged.subject_id,
                    reason = %logged.reason,
                    "released unit"
                );
                Ok(logged)
            }
            // released or reassigned by someone else since we read it
            Err(AllocError::Conflict(_)) => Err(AllocError::NotAllocated(unit.id)),
            Err(err) => Err(err),
        }
    }

    /// Return ambulance `unit` if it has been on service for at least
    /// `threshold`
    ///
    /// Returns the return record if the ambulance was reclaimed. Nothing
    /// happens for an ambulance that is available or not yet due.
    pub fn timed_auto_release(
        &self,
        ctx: &RequestContext,
        unit: UnitId,
        threshold: Duration,
    ) -> AllocResult<Option<HistoryRecord>> {
        let unit = self.store.get_unit(unit)?;
        if unit.pool() != PoolKind::Ambulance {
            return Err(AllocError::InvalidInput(format!(
                "{} is not an ambulance",
                unit.label
            )));
        }
        self.reclaim_if_due(ctx, &unit, threshold)
    }

    fn reclaim_if_due(
        &self,
        ctx: &RequestContext,
        unit: &ResourceUnit,
        threshold: Duration,
    ) -> AllocResult<Option<HistoryRecord>> {
        let (UnitStatus::OnService, Some(dispatched)) = (unit.status, unit.assigned_at) else {
            return Ok(None);
        };
        if self.clock.now() - dispatched < threshold {
            return Ok(None);
        }

        let system = RequestContext {
            actor: SYSTEM_ACTOR.to_owned(),
            request_id: ctx.request_id,
        };
        match self.release_unit(&system, unit, AUTO_RETURN_REASON) {
            Ok(record) => Ok(Some(record)),
            Err(AllocError::NotAllocated(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Return every ambulance whose service time is up
    pub fn reclaim_ambulances(&self, ctx: &RequestContext) -> AllocResult<Vec<HistoryRecord>> {
        let mut returned = Vec::new();
        for unit in self
            .store
            .list_units(Some(PoolKind::Ambulance), Some(UnitStatus::OnService))?
        {
            if let Some(record) = self.reclaim_if_due(ctx, &unit, self.return_after)? {
                returned.push(record);
            }
        }
        Ok(returned)
    }

    /// Current state of one unit
    ///
    /// Looking at an ambulance returns it first if its service time is up.
    pub fn unit_status(&self, ctx: &RequestContext, unit: UnitId) -> AllocResult<ResourceUnit> {
        let current = self.store.get_unit(unit)?;
        if current.pool() == PoolKind::Ambulance
            && self
                .reclaim_if_due(ctx, &current, self.return_after)?
                .is_some()
        {
            return self.store.get_unit(unit);
        }
        Ok(current)
    }

    /// Units ordered by id, optionally filtered
    ///
    /// Listings that include ambulances reclaim overdue ones first.
    pub fn list_units(
        &self,
        ctx: &RequestContext,
        pool: Option<PoolKind>,
        status: Option<UnitStatus>,
    ) -> AllocResult<Vec<ResourceUnit>> {
        if matches!(pool, None | Some(PoolKind::Ambulance)) {
            self.reclaim_ambulances(ctx)?;
        }
        self.store.list_units(pool, status)
    }

    /// Every ambulance with the seconds left until its automatic return
    pub fn ambulance_board(&self, ctx: &RequestContext) -> AllocResult<Vec<AmbulanceStatus>> {
        self.reclaim_ambulances(ctx)?;
        let now = self.clock.now();
        Ok(self
            .store
            .list_units(Some(PoolKind::Ambulance), None)?
            .into_iter()
            .map(|unit| {
                let returning_in_secs = unit
                    .assigned_at
                    .map(|at| (self.return_after - (now - at)).num_seconds().max(0) as u64);
                AmbulanceStatus {
                    unit,
                    returning_in_secs,
                }
            })
            .collect())
    }

    /// Number of available units in `pool`
    pub fn available_count(&self, pool: PoolKind) -> AllocResult<u32> {
        Ok(self
            .store
            .list_units(Some(pool), Some(UnitStatus::Available))?
            .len() as u32)
    }

    /// Held units of `pool` over all its units
    pub fn occupancy_rate(&self, pool: PoolKind) -> AllocResult<f64> {
        Ok(self.pool_summary(pool)?.occupancy_rate())
    }

    pub fn pool_summary(&self, pool: PoolKind) -> AllocResult<PoolSummary> {
        let units = self.store.list_units(Some(pool), None)?;
        let available = units
            .iter()
            .filter(|u| u.status == UnitStatus::Available)
            .count() as u32;
        Ok(PoolSummary {
            pool,
            total: units.len() as u32,
            available,
            held: units.len() as u32 - available,
        })
    }

    /// Discharge and return records, oldest first
    pub fn history(&self, filter: &HistoryFilter) -> AllocResult<Vec<HistoryRecord>> {
        self.store.list_history(filter)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}
