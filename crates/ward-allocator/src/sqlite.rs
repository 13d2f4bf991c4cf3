//! Durable implementation of the store on top of SQLite

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;
use ward_core::{
    AllocError, AllocResult, HistoryFilter, HistoryRecord, NewRecord, PoolKind, ResourceUnit,
    Store, Subject, SubjectId, SubjectKind, UnitId, UnitKind, UnitState, UnitStatus, UnitUpdate,
};

/// How long a write waits for another connection's transaction
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS units (
        id INTEGER PRIMARY KEY,
        label TEXT NOT NULL UNIQUE,
        unit_type TEXT NOT NULL,
        pool TEXT NOT NULL,
        is_icu INTEGER NOT NULL,
        status TEXT NOT NULL,
        subject_id TEXT,
        assigned_at TEXT
    );
    CREATE TABLE IF NOT EXISTS subjects (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        contact TEXT,
        address TEXT,
        blood_type TEXT,
        created_at TEXT NOT NULL,
        general_unit INTEGER,
        icu_unit INTEGER,
        ambulance_unit INTEGER,
        discharged_at TEXT
    );
    CREATE TABLE IF NOT EXISTS history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        subject_id TEXT NOT NULL,
        subject_name TEXT NOT NULL,
        unit_id INTEGER NOT NULL,
        unit_label TEXT NOT NULL,
        pool TEXT NOT NULL,
        assigned_at TEXT,
        released_at TEXT NOT NULL,
        reason TEXT NOT NULL,
        released_by TEXT NOT NULL
    );
";

const UNIT_COLUMNS: &str = "id, label, unit_type, status, subject_id, assigned_at";
const SUBJECT_COLUMNS: &str = "id, kind, name, contact, address, blood_type, created_at, \
     general_unit, icu_unit, ambulance_unit, discharged_at";
const HISTORY_COLUMNS: &str = "id, subject_id, subject_name, unit_id, unit_label, pool, \
     assigned_at, released_at, reason, released_by";

/// Store backed by a SQLite database
///
/// Assignment changes run in `IMMEDIATE` transactions, so the unit row, the
/// subject row and the release log change together or not at all.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn unavailable(err: rusqlite::Error) -> AllocError {
    AllocError::StorageUnavailable(err.to_string())
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> AllocResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| AllocError::StorageUnavailable(err.to_string()))?;
        }
        debug!(path = %path.display(), "opening sqlite store");
        Self::with_connection(Connection::open(path).map_err(unavailable)?)
    }

    /// Database that lives as long as the store
    pub fn open_in_memory() -> AllocResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(unavailable)?)
    }

    fn with_connection(conn: Connection) -> AllocResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(unavailable)?;
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn slot_column(pool: PoolKind) -> &'static str {
    match pool {
        PoolKind::General => "general_unit",
        PoolKind::Icu => "icu_unit",
        PoolKind::Ambulance => "ambulance_unit",
    }
}

fn conversion(index: usize, err: AllocError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn uuid_at(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(index)?;
    Uuid::parse_str(&text)
        .map_err(|err| conversion(index, AllocError::InvalidInput(err.to_string())))
}

fn row_to_unit(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResourceUnit> {
    let unit_type: String = row.get(2)?;
    let status: String = row.get(3)?;
    let subject: Option<String> = row.get(4)?;
    Ok(ResourceUnit {
        id: row.get(0)?,
        label: row.get(1)?,
        kind: UnitKind::from_type_name(&unit_type).ok_or_else(|| {
            conversion(2, AllocError::InvalidInput(format!("unit type `{unit_type}`")))
        })?,
        status: status.parse().map_err(|err| conversion(3, err))?,
        assigned_subject: match subject {
            Some(_) => Some(uuid_at(row, 4)?),
            None => None,
        },
        assigned_at: row.get(5)?,
    })
}

fn row_to_subject(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subject> {
    let kind: String = row.get(1)?;
    Ok(Subject {
        id: uuid_at(row, 0)?,
        kind: kind.parse().map_err(|err| conversion(1, err))?,
        name: row.get(2)?,
        contact: row.get(3)?,
        address: row.get(4)?,
        blood_type: row.get(5)?,
        created_at: row.get(6)?,
        assignments: [row.get(7)?, row.get(8)?, row.get(9)?],
        discharged_at: row.get(10)?,
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let pool: String = row.get(5)?;
    let pool: PoolKind = pool.parse().map_err(|err| conversion(5, err))?;
    let id: i64 = row.get(0)?;
    Ok(HistoryRecord::from_new(
        id as u64,
        NewRecord {
            subject_id: uuid_at(row, 1)?,
            subject_name: row.get(2)?,
            unit_id: row.get(3)?,
            unit_label: row.get(4)?,
            pool,
            assigned_at: row.get(6)?,
            released_at: row.get(7)?,
            reason: row.get(8)?,
            released_by: row.get(9)?,
        },
    ))
}

fn select_unit(conn: &Connection, id: UnitId) -> AllocResult<Option<ResourceUnit>> {
    conn.query_row(
        &format!("SELECT {UNIT_COLUMNS} FROM units WHERE id = ?1"),
        params![id],
        row_to_unit,
    )
    .optional()
    .map_err(unavailable)
}

fn select_subject(conn: &Connection, id: SubjectId) -> AllocResult<Option<Subject>> {
    conn.query_row(
        &format!("SELECT {SUBJECT_COLUMNS} FROM subjects WHERE id = ?1"),
        params![id.to_string()],
        row_to_subject,
    )
    .optional()
    .map_err(unavailable)
}

/// Compare-and-set on one unit row
fn cas_unit(
    conn: &Connection,
    id: UnitId,
    expected: UnitState,
    update: UnitUpdate,
) -> AllocResult<ResourceUnit> {
    let expected_subject = expected.subject.map(|s| s.to_string());
    let changed = match update {
        UnitUpdate::Assign { subject, at } => {
            let Some(unit) = select_unit(conn, id)? else {
                return Err(AllocError::unit_not_found(id));
            };
            conn.execute(
                "UPDATE units SET status = ?1, subject_id = ?2, assigned_at = ?3
                 WHERE id = ?4 AND status = ?5 AND subject_id IS ?6",
                params![
                    unit.pool().held_status().as_str(),
                    subject.to_string(),
                    at,
                    id,
                    expected.status.as_str(),
                    expected_subject
                ],
            )
        }
        UnitUpdate::Free => conn.execute(
            "UPDATE units SET status = ?1, subject_id = NULL, assigned_at = NULL
             WHERE id = ?2 AND status = ?3 AND subject_id IS ?4",
            params![
                UnitStatus::Available.as_str(),
                id,
                expected.status.as_str(),
                expected_subject
            ],
        ),
    }
    .map_err(unavailable)?;

    match select_unit(conn, id)? {
        None => Err(AllocError::unit_not_found(id)),
        Some(unit) if changed == 0 => Err(AllocError::Conflict(format!("unit {}", unit.label))),
        Some(unit) => Ok(unit),
    }
}

/// Compare-and-set on one assignment slot of a subject row
fn cas_subject(
    conn: &Connection,
    id: SubjectId,
    pool: PoolKind,
    expected: Option<UnitId>,
    new: Option<UnitId>,
    at: DateTime<Utc>,
) -> AllocResult<Subject> {
    let column = slot_column(pool);
    let key = id.to_string();
    let changed = conn
        .execute(
            &format!("UPDATE subjects SET {column} = ?1 WHERE id = ?2 AND {column} IS ?3"),
            params![new, key, expected],
        )
        .map_err(unavailable)?;

    if changed == 1 {
        match new {
            Some(_) => conn.execute(
                "UPDATE subjects SET discharged_at = NULL WHERE id = ?1",
                params![key],
            ),
            None => conn.execute(
                "UPDATE subjects SET discharged_at = ?1 WHERE id = ?2
                 AND general_unit IS NULL AND icu_unit IS NULL AND ambulance_unit IS NULL",
                params![at, key],
            ),
        }
        .map_err(unavailable)?;
    }

    match select_subject(conn, id)? {
        None => Err(AllocError::subject_not_found(id)),
        Some(_) if changed == 0 => Err(AllocError::Conflict(format!("subject {id}"))),
        Some(subject) => Ok(subject),
    }
}

fn insert_record(conn: &Connection, record: NewRecord) -> AllocResult<HistoryRecord> {
    conn.execute(
        "INSERT INTO history (subject_id, subject_name, unit_id, unit_label, pool,
                              assigned_at, released_at, reason, released_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.subject_id.to_string(),
            record.subject_name,
            record.unit_id,
            record.unit_label,
            record.pool.as_str(),
            record.assigned_at,
            record.released_at,
            record.reason,
            record.released_by
        ],
    )
    .map_err(unavailable)?;
    let id = conn.last_insert_rowid();
    Ok(HistoryRecord::from_new(id as u64, record))
}

impl Store for SqliteStore {
    fn seed_units(&self, units: &[ResourceUnit]) -> AllocResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;
        let existing: u32 = tx
            .query_row("SELECT COUNT(*) FROM units", [], |row| row.get(0))
            .map_err(unavailable)?;
        if existing > 0 {
            return Ok(false);
        }

        for unit in units {
            tx.execute(
                "INSERT INTO units (id, label, unit_type, pool, is_icu, status, subject_id, assigned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    unit.id,
                    unit.label,
                    unit.kind.type_name(),
                    unit.pool().as_str(),
                    unit.kind.is_icu(),
                    unit.status.as_str(),
                    unit.assigned_subject.map(|s| s.to_string()),
                    unit.assigned_at
                ],
            )
            .map_err(unavailable)?;
        }
        tx.commit().map_err(unavailable)?;
        Ok(true)
    }

    fn count_units(&self, pool: Option<PoolKind>) -> AllocResult<u32> {
        self.conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM units WHERE ?1 IS NULL OR pool = ?1",
                params![pool.map(PoolKind::as_str)],
                |row| row.get(0),
            )
            .map_err(unavailable)
    }

    fn list_units(
        &self,
        pool: Option<PoolKind>,
        status: Option<UnitStatus>,
    ) -> AllocResult<Vec<ResourceUnit>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {UNIT_COLUMNS} FROM units
                 WHERE (?1 IS NULL OR pool = ?1) AND (?2 IS NULL OR status = ?2)
                 ORDER BY id ASC"
            ))
            .map_err(unavailable)?;
        let rows = stmt
            .query_map(
                params![pool.map(PoolKind::as_str), status.map(UnitStatus::as_str)],
                row_to_unit,
            )
            .map_err(unavailable)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(unavailable)?;
        Ok(rows)
    }

    fn get_unit(&self, id: UnitId) -> AllocResult<ResourceUnit> {
        select_unit(&self.conn.lock(), id)?.ok_or_else(|| AllocError::unit_not_found(id))
    }

    fn update_unit(
        &self,
        id: UnitId,
        expected: UnitState,
        update: UnitUpdate,
    ) -> AllocResult<ResourceUnit> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;
        let unit = cas_unit(&tx, id, expected, update)?;
        tx.commit().map_err(unavailable)?;
        Ok(unit)
    }

    fn insert_subject(&self, subject: Subject) -> AllocResult<()> {
        let [general, icu, ambulance] = subject.assignments;
        self.conn
            .lock()
            .execute(
                &format!(
                    "INSERT INTO subjects ({SUBJECT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    subject.id.to_string(),
                    subject.kind.as_str(),
                    subject.name,
                    subject.contact,
                    subject.address,
                    subject.blood_type,
                    subject.created_at,
                    general,
                    icu,
                    ambulance,
                    subject.discharged_at
                ],
            )
            .map_err(unavailable)?;
        Ok(())
    }

    fn get_subject(&self, id: SubjectId) -> AllocResult<Subject> {
        select_subject(&self.conn.lock(), id)?.ok_or_else(|| AllocError::subject_not_found(id))
    }

    fn list_subjects(&self) -> AllocResult<Vec<Subject>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SUBJECT_COLUMNS} FROM subjects ORDER BY created_at ASC, id ASC"
            ))
            .map_err(unavailable)?;
        let rows = stmt
            .query_map([], row_to_subject)
            .map_err(unavailable)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(unavailable)?;
        Ok(rows)
    }

    fn update_subject(
        &self,
        id: SubjectId,
        pool: PoolKind,
        expected: Option<UnitId>,
        new: Option<UnitId>,
        at: DateTime<Utc>,
    ) -> AllocResult<Subject> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;
        let subject = cas_subject(&tx, id, pool, expected, new, at)?;
        tx.commit().map_err(unavailable)?;
        Ok(subject)
    }

    fn append_history(&self, record: NewRecord) -> AllocResult<HistoryRecord> {
        insert_record(&self.conn.lock(), record)
    }

    fn list_history(&self, filter: &HistoryFilter) -> AllocResult<Vec<HistoryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {HISTORY_COLUMNS} FROM history
                 WHERE (?1 IS NULL OR pool = ?1) AND (?2 IS NULL OR subject_id = ?2)
                 ORDER BY id ASC"
            ))
            .map_err(unavailable)?;
        let rows = stmt
            .query_map(
                params![
                    filter.pool.map(PoolKind::as_str),
                    filter.subject.map(|s| s.to_string())
                ],
                row_to_record,
            )
            .map_err(unavailable)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(unavailable)?;
        Ok(rows)
    }

    fn assign(
        &self,
        unit: UnitId,
        expected: UnitState,
        subject: SubjectId,
        at: DateTime<Utc>,
    ) -> AllocResult<(ResourceUnit, Subject)> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;
        let claimed = cas_unit(&tx, unit, expected, UnitUpdate::Assign { subject, at })?;
        let holder = match cas_subject(&tx, subject, claimed.pool(), None, Some(unit), at) {
            Ok(holder) => holder,
            // dropping the transaction rolls the unit claim back
            Err(AllocError::Conflict(_)) => {
                return Err(AllocError::AlreadyAllocated(format!(
                    "subject {subject} already holds a {} unit",
                    claimed.pool()
                )))
            }
            Err(err) => return Err(err),
        };
        tx.commit().map_err(unavailable)?;
        Ok((claimed, holder))
    }

    fn free(
        &self,
        unit: &ResourceUnit,
        record: NewRecord,
    ) -> AllocResult<(ResourceUnit, HistoryRecord)> {
        let Some(subject) = unit.assigned_subject else {
            return Err(AllocError::NotAllocated(unit.id));
        };
        let at = record.released_at;

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;
        let freed = cas_unit(&tx, unit.id, UnitState::of(unit), UnitUpdate::Free)?;
        cas_subject(&tx, subject, unit.pool(), Some(unit.id), None, at)?;
        let logged = insert_record(&tx, record)?;
        tx.commit().map_err(unavailable)?;
        Ok((freed, logged))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use chrono::Utc;
    use ward_core::{SubjectKind, UnitKind};

    use super::*;
    use crate::pools::standard_layout;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("ward-sqlite-{}", Uuid::new_v4()))
    }

    fn patient(name: &str) -> Subject {
        Subject {
            id: Uuid::new_v4(),
            kind: SubjectKind::Patient,
            name: name.into(),
            contact: Some("555-0100".into()),
            address: None,
            blood_type: Some("O+".into()),
            created_at: Utc::now(),
            assignments: [None; 3],
            discharged_at: None,
        }
    }

    #[test]
    fn seeding_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.seed_units(&standard_layout()).unwrap());
        assert!(!store.seed_units(&standard_layout()).unwrap());
        assert_eq!(store.count_units(None).unwrap(), 80);
        assert_eq!(store.count_units(Some(PoolKind::Icu)).unwrap(), 25);

        let first = store.get_unit(1).unwrap();
        assert_eq!(first.label, "GEN-1");
        assert_eq!(first.kind, UnitKind::GeneralRoom(ward_core::RoomClass::Single));
    }

    #[test]
    fn assign_and_free_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.seed_units(&standard_layout()).unwrap();
        let ada = patient("Ada");
        let id = ada.id;
        store.insert_subject(ada).unwrap();

        let now = Utc::now();
        let (unit, holder) = store.assign(3, UnitState::AVAILABLE, id, now).unwrap();
        assert_eq!(unit.status, UnitStatus::Booked);
        assert_eq!(unit.assigned_subject, Some(id));
        assert_eq!(holder.assigned_unit(PoolKind::General), Some(3));

        let again = store.assign(3, UnitState::AVAILABLE, id, now);
        assert!(matches!(again, Err(AllocError::Conflict(_))));
        let second = store.assign(4, UnitState::AVAILABLE, id, now);
        assert!(matches!(second, Err(AllocError::AlreadyAllocated(_))));
        assert_eq!(store.get_unit(4).unwrap().status, UnitStatus::Available);

        let record = NewRecord {
            subject_id: id,
            subject_name: "Ada".into(),
            unit_id: 3,
            unit_label: unit.label.clone(),
            pool: PoolKind::General,
            assigned_at: unit.assigned_at,
            released_at: now,
            reason: "recovered".into(),
            released_by: "nurse".into(),
        };
        let (freed, logged) = store.free(&unit, record).unwrap();
        assert_eq!(freed.status, UnitStatus::Available);
        assert_eq!(logged.reason, "recovered");

        let ada = store.get_subject(id).unwrap();
        assert_eq!(ada.assigned_unit(PoolKind::General), None);
        assert!(ada.discharged_at.is_some());
        assert_eq!(store.list_history(&HistoryFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = scratch_dir();
        let path = dir.join("ward.db");
        let ada = patient("Ada");
        let id = ada.id;

        {
            let store = SqliteStore::open(&path).unwrap();
            store.seed_units(&standard_layout()).unwrap();
            store.insert_subject(ada).unwrap();
            store.assign(51, UnitState::AVAILABLE, id, Utc::now()).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert!(!store.seed_units(&standard_layout()).unwrap());
        let icu = store.get_unit(51).unwrap();
        assert_eq!(icu.label, "ICU-1");
        assert_eq!(icu.assigned_subject, Some(id));
        assert_eq!(
            store.get_subject(id).unwrap().assigned_unit(PoolKind::Icu),
            Some(51)
        );
        drop(store);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn concurrent_first_start_seeds_once() {
        let dir = scratch_dir();
        let path = dir.join("ward.db");
        let stores: Vec<SqliteStore> = (0..4)
            .map(|_| SqliteStore::open(&path).unwrap())
            .collect();
        let layout = standard_layout();

        let layout = &layout;
        let inserted = thread::scope(|scope| {
            let seeders: Vec<_> = stores
                .iter()
                .map(|store| scope.spawn(move || store.seed_units(layout).unwrap()))
                .collect();
            seeders
                .into_iter()
                .map(|seeder| seeder.join().unwrap())
                .filter(|&inserted| inserted)
                .count()
        });

        assert_eq!(inserted, 1, "Exactly one connection may fill the table.");
        for store in &stores {
            assert_eq!(store.count_units(None).unwrap(), 80);
            assert_eq!(store.count_units(Some(PoolKind::General)).unwrap(), 50);
            assert_eq!(store.count_units(Some(PoolKind::Icu)).unwrap(), 25);
            assert_eq!(store.count_units(Some(PoolKind::Ambulance)).unwrap(), 5);
        }
        drop(stores);
        let _ = std::fs::remove_dir_all(dir);
    }
}
