//! Process-local implementation of the store

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use ward_core::{
    AllocError, AllocResult, HistoryFilter, HistoryRecord, NewRecord, PoolKind, ResourceUnit,
    Store, Subject, SubjectId, UnitId, UnitState, UnitStatus, UnitUpdate,
};

/// Store keeping all tables in memory
///
/// Units live behind a single lock, which makes every compare-and-set on a
/// unit (and the seeding check) atomic. Subjects are sharded in a
/// [`DashMap`]; each subject update holds that subject's shard lock.
///
/// `assign` and `free` take the units lock first and the subject's shard
/// second, and write nothing until every check passed. No method locks in the
/// opposite order.
pub struct MemoryStore {
    /// All units, sorted by id
    units: Mutex<Vec<ResourceUnit>>,
    subjects: DashMap<SubjectId, Subject>,
    history: Mutex<Vec<HistoryRecord>>,
    next_record: AtomicU64,
    /// Cleared to simulate an unreachable backend
    online: AtomicBool,
}

impl MemoryStore {
    /// Create a new, empty [`MemoryStore`].
    pub fn new() -> Self {
        Self {
            units: Mutex::new(Vec::new()),
            subjects: DashMap::new(),
            history: Mutex::new(Vec::new()),
            next_record: AtomicU64::new(1),
            online: AtomicBool::new(true),
        }
    }

    /// Make every following call fail with
    /// [`AllocError::StorageUnavailable`] (or succeed again)
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn push_record(&self, record: NewRecord) -> HistoryRecord {
        let mut history = self.history.lock();
        let id = self.next_record.fetch_add(1, Ordering::SeqCst);
        let logged = HistoryRecord::from_new(id, record);
        history.push(logged.clone());
        logged
    }

    fn ensure_online(&self) -> AllocResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AllocError::StorageUnavailable(
                "memory store is offline".into(),
            ))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply(unit: &mut ResourceUnit, update: UnitUpdate) {
    match update {
        UnitUpdate::Assign { subject, at } => {
            unit.status = unit.pool().held_status();
            unit.assigned_subject = Some(subject);
            unit.assigned_at = Some(at);
        }
        UnitUpdate::Free => {
            unit.status = UnitStatus::Available;
            unit.assigned_subject = None;
            unit.assigned_at = None;
        }
    }
}

fn position(units: &[ResourceUnit], id: UnitId) -> AllocResult<usize> {
    units
        .binary_search_by_key(&id, |u| u.id)
        .map_err(|_| AllocError::unit_not_found(id))
}

impl Store for MemoryStore {
    fn seed_units(&self, units: &[ResourceUnit]) -> AllocResult<bool> {
        self.ensure_online()?;
        let mut table = self.units.lock();
        if !table.is_empty() {
            return Ok(false);
        }
        table.extend_from_slice(units);
        table.sort_by_key(|u| u.id);
        Ok(true)
    }

    fn count_units(&self, pool: Option<PoolKind>) -> AllocResult<u32> {
        self.ensure_online()?;
        Ok(self
            .units
            .lock()
            .iter()
            .filter(|u| pool.map_or(true, |p| u.pool() == p))
            .count() as u32)
    }

    fn list_units(
        &self,
        pool: Option<PoolKind>,
        status: Option<UnitStatus>,
    ) -> AllocResult<Vec<ResourceUnit>> {
        self.ensure_online()?;
        Ok(self
            .units
            .lock()
            .iter()
            .filter(|u| pool.map_or(true, |p| u.pool() == p))
            .filter(|u| status.map_or(true, |s| u.status == s))
            .cloned()
            .collect())
    }

    fn get_unit(&self, id: UnitId) -> AllocResult<ResourceUnit> {
        self.ensure_online()?;
        let table = self.units.lock();
        Ok(table[position(&table, id)?].clone())
    }

    fn update_unit(
        &self,
        id: UnitId,
        expected: UnitState,
        update: UnitUpdate,
    ) -> AllocResult<ResourceUnit> {
        self.ensure_online()?;
        let mut table = self.units.lock();
        let index = position(&table, id)?;
        let unit = &mut table[index];
        if !expected.matches(unit) {
            return Err(AllocError::Conflict(format!("unit {}", unit.label)));
        }
        apply(unit, update);
        Ok(unit.clone())
    }

    fn insert_subject(&self, subject: Subject) -> AllocResult<()> {
        self.ensure_online()?;
        self.subjects.insert(subject.id, subject);
        Ok(())
    }

    fn get_subject(&self, id: SubjectId) -> AllocResult<Subject> {
        self.ensure_online()?;
        self.subjects
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or_else(|| AllocError::subject_not_found(id))
    }

    fn list_subjects(&self) -> AllocResult<Vec<Subject>> {
        self.ensure_online()?;
        let mut subjects: Vec<Subject> = self.subjects.iter().map(|s| s.value().clone()).collect();
        subjects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(subjects)
    }

    fn update_subject(
        &self,
        id: SubjectId,
        pool: PoolKind,
        expected: Option<UnitId>,
        new: Option<UnitId>,
        at: DateTime<Utc>,
    ) -> AllocResult<Subject> {
        self.ensure_online()?;
        let mut subject = self
            .subjects
            .get_mut(&id)
            .ok_or_else(|| AllocError::subject_not_found(id))?;
        if subject.assigned_unit(pool) != expected {
            return Err(AllocError::Conflict(format!("subject {id}")));
        }

        subject.set_assigned_unit(pool, new);
        if new.is_some() {
            subject.discharged_at = None;
        } else if !subject.holds_any() {
            subject.discharged_at = Some(at);
        }
        Ok(subject.value().clone())
    }

    fn append_history(&self, record: NewRecord) -> AllocResult<HistoryRecord> {
        self.ensure_online()?;
        Ok(self.push_record(record))
    }

    fn list_history(&self, filter: &HistoryFilter) -> AllocResult<Vec<HistoryRecord>> {
        self.ensure_online()?;
        Ok(self
            .history
            .lock()
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    fn assign(
        &self,
        unit: UnitId,
        expected: UnitState,
        subject: SubjectId,
        at: DateTime<Utc>,
    ) -> AllocResult<(ResourceUnit, Subject)> {
        self.ensure_online()?;
        // units lock, then the subject's shard; both are checked before
        // either row is written
        let mut table = self.units.lock();
        let index = position(&table, unit)?;
        let claimed = &mut table[index];
        if !expected.matches(claimed) {
            return Err(AllocError::Conflict(format!("unit {}", claimed.label)));
        }
        let pool = claimed.pool();

        let mut holder = self
            .subjects
            .get_mut(&subject)
            .ok_or_else(|| AllocError::subject_not_found(subject))?;
        if let Some(held) = holder.assigned_unit(pool) {
            return Err(AllocError::AlreadyAllocated(format!(
                "subject {subject} already holds {pool} unit {held}"
            )));
        }

        apply(claimed, UnitUpdate::Assign { subject, at });
        holder.set_assigned_unit(pool, Some(unit));
        holder.discharged_at = None;
        Ok((claimed.clone(), holder.value().clone()))
    }

    fn free(
        &self,
        unit: &ResourceUnit,
        record: NewRecord,
    ) -> AllocResult<(ResourceUnit, HistoryRecord)> {
        self.ensure_online()?;
        let Some(subject) = unit.assigned_subject else {
            return Err(AllocError::NotAllocated(unit.id));
        };

        let mut table = self.units.lock();
        let index = position(&table, unit.id)?;
        let current = &mut table[index];
        if !UnitState::of(unit).matches(current) {
            return Err(AllocError::Conflict(format!("unit {}", current.label)));
        }
        let pool = current.pool();

        let mut holder = self
            .subjects
            .get_mut(&subject)
            .ok_or_else(|| AllocError::subject_not_found(subject))?;
        if holder.assigned_unit(pool) != Some(unit.id) {
            return Err(AllocError::Conflict(format!("subject {subject}")));
        }

        apply(current, UnitUpdate::Free);
        holder.set_assigned_unit(pool, None);
        if !holder.holds_any() {
            holder.discharged_at = Some(record.released_at);
        }
        let logged = self.push_record(record);
        Ok((current.clone(), logged))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use chrono::Utc;
    use uuid::Uuid;
    use ward_core::{SubjectKind, UnitKind};

    use super::*;
    use crate::pools::standard_layout;

    fn ambulance(id: UnitId) -> ResourceUnit {
        ResourceUnit::available(id, UnitKind::Ambulance, format!("AMB-{id}"))
    }

    fn subject() -> Subject {
        Subject {
            id: Uuid::new_v4(),
            kind: SubjectKind::AmbulanceRequest,
            name: "Ada".into(),
            contact: None,
            address: None,
            blood_type: None,
            created_at: Utc::now(),
            assignments: [None; 3],
            discharged_at: None,
        }
    }

    fn return_of(unit: &ResourceUnit) -> NewRecord {
        NewRecord {
            subject_id: unit.assigned_subject.unwrap(),
            subject_name: "Ada".into(),
            unit_id: unit.id,
            unit_label: unit.label.clone(),
            pool: unit.pool(),
            assigned_at: unit.assigned_at,
            released_at: Utc::now(),
            reason: "delivered".into(),
            released_by: "dispatch".into(),
        }
    }

    #[test]
    fn seeding_only_fills_an_empty_table() {
        let store = MemoryStore::new();
        assert!(store.seed_units(&[ambulance(1), ambulance(2)]).unwrap());
        assert!(!store.seed_units(&[ambulance(3)]).unwrap());
        assert_eq!(store.count_units(None).unwrap(), 2);
    }

    #[test]
    fn unit_update_is_compare_and_set() {
        let store = MemoryStore::new();
        store.seed_units(&[ambulance(1)]).unwrap();
        let assign = UnitUpdate::Assign {
            subject: Uuid::new_v4(),
            at: Utc::now(),
        };

        let held = store.update_unit(1, UnitState::AVAILABLE, assign).unwrap();
        assert_eq!(held.status, UnitStatus::OnService);
        assert!(held.is_consistent());

        let second = store.update_unit(1, UnitState::AVAILABLE, assign);
        assert!(matches!(second, Err(AllocError::Conflict(_))));

        let freed = store
            .update_unit(1, UnitState::of(&held), UnitUpdate::Free)
            .unwrap();
        assert_eq!(freed.status, UnitStatus::Available);
        assert!(freed.is_consistent());
    }

    #[test]
    fn assign_rejects_a_second_unit_for_the_subject() {
        let store = MemoryStore::new();
        store.seed_units(&[ambulance(1), ambulance(2)]).unwrap();
        let caller = subject();
        let id = caller.id;
        store.insert_subject(caller).unwrap();

        store.assign(1, UnitState::AVAILABLE, id, Utc::now()).unwrap();
        let again = store.assign(2, UnitState::AVAILABLE, id, Utc::now());
        assert!(matches!(again, Err(AllocError::AlreadyAllocated(_))));
        assert_eq!(store.get_unit(2).unwrap().status, UnitStatus::Available);

        let stranger = store.assign(2, UnitState::AVAILABLE, Uuid::new_v4(), Utc::now());
        assert!(matches!(stranger, Err(AllocError::NotFound(_))));
        assert_eq!(store.get_unit(2).unwrap().assigned_subject, None);
    }

    #[test]
    fn free_requires_the_holder_slot() {
        let store = MemoryStore::new();
        store.seed_units(&[ambulance(1)]).unwrap();
        let caller = subject();
        let id = caller.id;
        store.insert_subject(caller).unwrap();

        let (unit, _) = store.assign(1, UnitState::AVAILABLE, id, Utc::now()).unwrap();
        store.update_subject(id, PoolKind::Ambulance, Some(1), None, Utc::now()).unwrap();

        let freed = store.free(&unit, return_of(&unit));
        assert!(matches!(freed, Err(AllocError::Conflict(_))));
        assert_eq!(store.get_unit(1).unwrap().assigned_subject, Some(id));
        assert!(store.list_history(&HistoryFilter::default()).unwrap().is_empty());
    }

    /// Callers book and return two ambulances while a dispatcher returns
    /// whatever it sees out on service.
    #[test]
    fn assignments_stay_paired_under_contention() {
        let store = MemoryStore::new();
        store.seed_units(&[ambulance(1), ambulance(2)]).unwrap();
        let callers: Vec<SubjectId> = (0..4)
            .map(|_| {
                let caller = subject();
                let id = caller.id;
                store.insert_subject(caller).unwrap();
                id
            })
            .collect();
        let returned = AtomicU64::new(0);

        thread::scope(|scope| {
            for &id in &callers {
                let (store, returned) = (&store, &returned);
                scope.spawn(move || {
                    for round in 0..500 {
                        let target = 1 + round % 2;
                        let claimed = store.assign(target, UnitState::AVAILABLE, id, Utc::now());
                        let Ok((unit, _)) = claimed else {
                            continue;
                        };
                        if store.free(&unit, return_of(&unit)).is_ok() {
                            returned.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
            scope.spawn(|| {
                for round in 0..2000 {
                    let unit = store.get_unit(1 + round % 2).unwrap();
                    if unit.assigned_subject.is_some() && store.free(&unit, return_of(&unit)).is_ok() {
                        returned.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        });

        let units = store.list_units(None, None).unwrap();
        assert!(units.iter().all(|u| u.is_consistent()));
        for id in &callers {
            let holder = store.get_subject(*id).unwrap();
            let held: Vec<UnitId> = units
                .iter()
                .filter(|u| u.assigned_subject == Some(*id))
                .map(|u| u.id)
                .collect();
            let slot: Vec<UnitId> = holder.assigned_unit(PoolKind::Ambulance).into_iter().collect();
            assert_eq!(slot, held, "Subject slot and unit holder disagree for {id}.");
        }
        let history = store.list_history(&HistoryFilter::default()).unwrap();
        assert_eq!(history.len() as u64, returned.load(Ordering::SeqCst));
    }

    #[test]
    fn concurrent_seeding_inserts_once() {
        let store = MemoryStore::new();
        let layout = standard_layout();

        let (store, layout) = (&store, &layout);
        let inserted = thread::scope(|scope| {
            let seeders: Vec<_> = (0..8)
                .map(|_| scope.spawn(move || store.seed_units(layout).unwrap()))
                .collect();
            seeders
                .into_iter()
                .map(|seeder| seeder.join().unwrap())
                .filter(|&inserted| inserted)
                .count()
        });

        assert_eq!(inserted, 1, "Exactly one seeder may fill the table.");
        assert_eq!(store.count_units(None).unwrap(), 80);
        assert_eq!(store.count_units(Some(PoolKind::General)).unwrap(), 50);
        assert_eq!(store.count_units(Some(PoolKind::Icu)).unwrap(), 25);
        assert_eq!(store.count_units(Some(PoolKind::Ambulance)).unwrap(), 5);
    }

    #[test]
    fn offline_store_reports_unavailable() {
        let store = MemoryStore::new();
        store.seed_units(&[ambulance(1)]).unwrap();
        store.set_online(false);
        assert!(matches!(
            store.list_units(None, None),
            Err(AllocError::StorageUnavailable(_))
        ));
        store.set_online(true);
        assert_eq!(store.list_units(None, None).unwrap().len(), 1);
    }
}
