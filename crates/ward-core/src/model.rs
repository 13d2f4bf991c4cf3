//! Units, subjects and the release log

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AllocError;

/// Identifier of a [`ResourceUnit`]
///
/// Ids are handed out in seeding order, so ascending id is also the order in
/// which free units are picked.
pub type UnitId = u32;

/// Identifier of a [`Subject`]
pub type SubjectId = Uuid;

/// Name recorded as the releasing actor for automatic returns
pub const SYSTEM_ACTOR: &str = "system";

/// Reason recorded for ambulances returned by the timed reclaim
pub const AUTO_RETURN_REASON: &str = "auto-returned";

/// Category of fungible units
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolKind {
    /// General ward rooms
    General,
    /// Intensive care rooms
    Icu,
    /// Ambulances
    Ambulance,
}

impl PoolKind {
    /// All pools, in seeding order
    pub const ALL: [PoolKind; 3] = [PoolKind::General, PoolKind::Icu, PoolKind::Ambulance];

    /// Status a unit of this pool takes while held
    pub fn held_status(self) -> UnitStatus {
        match self {
            PoolKind::Ambulance => UnitStatus::OnService,
            PoolKind::General | PoolKind::Icu => UnitStatus::Booked,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PoolKind::General => "general",
            PoolKind::Icu => "icu",
            PoolKind::Ambulance => "ambulance",
        }
    }

    /// Index of this pool in per-pool arrays
    #[inline]
    pub(crate) fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolKind {
    type Err = AllocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "general" | "gen" => Ok(PoolKind::General),
            "icu" => Ok(PoolKind::Icu),
            "ambulance" | "amb" => Ok(PoolKind::Ambulance),
            other => Err(AllocError::InvalidInput(format!("unknown pool `{other}`"))),
        }
    }
}

/// Comfort class of a general room
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum RoomClass {
    Single,
    Double,
    Deluxe,
}

/// What a unit is
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "class", rename_all = "kebab-case")]
pub enum UnitKind {
    GeneralRoom(RoomClass),
    IcuRoom,
    Ambulance,
}

impl UnitKind {
    /// The pool this unit belongs to
    pub fn pool(self) -> PoolKind {
        match self {
            UnitKind::GeneralRoom(_) => PoolKind::General,
            UnitKind::IcuRoom => PoolKind::Icu,
            UnitKind::Ambulance => PoolKind::Ambulance,
        }
    }

    /// Room type as shown on the room board (`Single`, `ICU`, ...)
    pub fn type_name(self) -> &'static str {
        match self {
            UnitKind::GeneralRoom(RoomClass::Single) => "Single",
            UnitKind::GeneralRoom(RoomClass::Double) => "Double",
            UnitKind::GeneralRoom(RoomClass::Deluxe) => "Deluxe",
            UnitKind::IcuRoom => "ICU",
            UnitKind::Ambulance => "Ambulance",
        }
    }

    /// Inverse of [`UnitKind::type_name()`]
    pub fn from_type_name(name: &str) -> Option<Self> {
        Some(match name {
            "Single" => UnitKind::GeneralRoom(RoomClass::Single),
            "Double" => UnitKind::GeneralRoom(RoomClass::Double),
            "Deluxe" => UnitKind::GeneralRoom(RoomClass::Deluxe),
            "ICU" => UnitKind::IcuRoom,
            "Ambulance" => UnitKind::Ambulance,
            _ => return None,
        })
    }

    #[inline]
    pub fn is_icu(self) -> bool {
        self == UnitKind::IcuRoom
    }
}

/// Availability of a unit
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitStatus {
    Available,
    /// Room held by a patient
    Booked,
    /// Ambulance dispatched to a request
    OnService,
}

impl UnitStatus {
    /// Whether a subject currently holds the unit
    #[inline]
    pub fn is_held(self) -> bool {
        self != UnitStatus::Available
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Available => "available",
            UnitStatus::Booked => "booked",
            UnitStatus::OnService => "on-service",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitStatus {
    type Err = AllocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "available" => Ok(UnitStatus::Available),
            "booked" => Ok(UnitStatus::Booked),
            "on-service" | "on_service" => Ok(UnitStatus::OnService),
            other => Err(AllocError::InvalidInput(format!("unknown status `{other}`"))),
        }
    }
}

/// A room or an ambulance
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ResourceUnit {
    pub id: UnitId,
    pub kind: UnitKind,
    /// Human readable code, e.g. `GEN-12`
    pub label: String,
    pub status: UnitStatus,
    /// Holder of the unit; present iff `status` is held
    pub assigned_subject: Option<SubjectId>,
    /// Admission or dispatch time; present iff `status` is held
    pub assigned_at: Option<DateTime<Utc>>,
}

impl ResourceUnit {
    /// Create an unassigned unit
    pub fn available(id: UnitId, kind: UnitKind, label: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            label: label.into(),
            status: UnitStatus::Available,
            assigned_subject: None,
            assigned_at: None,
        }
    }

    #[inline]
    pub fn pool(&self) -> PoolKind {
        self.kind.pool()
    }

    /// Check the holder/status invariant
    pub fn is_consistent(&self) -> bool {
        self.status.is_held() == self.assigned_subject.is_some()
            && self.status.is_held() == self.assigned_at.is_some()
            && (!self.status.is_held() || self.status == self.pool().held_status())
    }
}

/// New state written by a compare-and-set on a unit
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnitUpdate {
    /// Hand the unit to `subject` at time `at`
    Assign {
        subject: SubjectId,
        at: DateTime<Utc>,
    },
    /// Return the unit to its pool
    Free,
}

/// Who holds (or requests) units
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubjectKind {
    Patient,
    EmergencyPatient,
    AmbulanceRequest,
}

impl SubjectKind {
    /// The pool this kind of subject waits for
    pub fn home_pool(self) -> PoolKind {
        match self {
            SubjectKind::Patient => PoolKind::General,
            SubjectKind::EmergencyPatient => PoolKind::Icu,
            SubjectKind::AmbulanceRequest => PoolKind::Ambulance,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubjectKind::Patient => "patient",
            SubjectKind::EmergencyPatient => "emergency-patient",
            SubjectKind::AmbulanceRequest => "ambulance-request",
        }
    }
}

impl FromStr for SubjectKind {
    type Err = AllocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" => Ok(SubjectKind::Patient),
            "emergency-patient" => Ok(SubjectKind::EmergencyPatient),
            "ambulance-request" => Ok(SubjectKind::AmbulanceRequest),
            other => Err(AllocError::InvalidInput(format!(
                "unknown subject kind `{other}`"
            ))),
        }
    }
}

/// Data supplied when a subject is registered
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct NewSubject {
    pub kind: SubjectKind,
    pub name: String,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub blood_type: Option<String>,
}

impl NewSubject {
    pub fn new(kind: SubjectKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            contact: None,
            address: None,
            blood_type: None,
        }
    }
}

/// A patient, emergency patient or ambulance request
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    pub kind: SubjectKind,
    pub name: String,
    pub contact: Option<String>,
    pub address: Option<String>,
    pub blood_type: Option<String>,
    /// Request or admission time
    pub created_at: DateTime<Utc>,
    /// Unit held per pool, indexed by [`PoolKind`]
    pub assignments: [Option<UnitId>; 3],
    /// Set once the last held unit is released
    pub discharged_at: Option<DateTime<Utc>>,
}

impl Subject {
    /// The unit this subject holds in `pool`, if any
    #[inline]
    pub fn assigned_unit(&self, pool: PoolKind) -> Option<UnitId> {
        self.assignments[pool.slot()]
    }

    #[inline]
    pub fn set_assigned_unit(&mut self, pool: PoolKind, unit: Option<UnitId>) {
        self.assignments[pool.slot()] = unit;
    }

    /// Whether the subject holds a unit in any pool
    pub fn holds_any(&self) -> bool {
        self.assignments.iter().any(Option::is_some)
    }
}

/// Kind of a release log entry
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    /// A room was freed
    Discharge,
    /// An ambulance came back
    Return,
}

impl RecordKind {
    pub fn for_pool(pool: PoolKind) -> Self {
        match pool {
            PoolKind::Ambulance => RecordKind::Return,
            PoolKind::General | PoolKind::Icu => RecordKind::Discharge,
        }
    }
}

/// Release log entry before the store numbered it
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NewRecord {
    pub subject_id: SubjectId,
    pub subject_name: String,
    pub unit_id: UnitId,
    pub unit_label: String,
    pub pool: PoolKind,
    pub assigned_at: Option<DateTime<Utc>>,
    pub released_at: DateTime<Utc>,
    pub reason: String,
    pub released_by: String,
}

/// Immutable discharge/return log entry
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: u64,
    pub kind: RecordKind,
    pub subject_id: SubjectId,
    pub subject_name: String,
    pub unit_id: UnitId,
    pub unit_label: String,
    pub pool: PoolKind,
    pub assigned_at: Option<DateTime<Utc>>,
    pub released_at: DateTime<Utc>,
    pub reason: String,
    pub released_by: String,
}

impl HistoryRecord {
    /// Number `record` with `id`
    pub fn from_new(id: u64, record: NewRecord) -> Self {
        Self {
            id,
            kind: RecordKind::for_pool(record.pool),
            subject_id: record.subject_id,
            subject_name: record.subject_name,
            unit_id: record.unit_id,
            unit_label: record.unit_label,
            pool: record.pool,
            assigned_at: record.assigned_at,
            released_at: record.released_at,
            reason: record.reason,
            released_by: record.released_by,
        }
    }
}

/// Filter for [`crate::Store::list_history()`]
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub pool: Option<PoolKind>,
    pub subject: Option<SubjectId>,
}

impl HistoryFilter {
    pub fn matches(&self, record: &HistoryRecord) -> bool {
        self.pool.map_or(true, |pool| record.pool == pool)
            && self.subject.map_or(true, |subject| record.subject_id == subject)
    }
}

/// Counts over one pool
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PoolSummary {
    pub pool: PoolKind,
    pub total: u32,
    pub available: u32,
    pub held: u32,
}

impl PoolSummary {
    /// Held units over all units, `0.0` for an empty pool
    pub fn occupancy_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.held as f64 / self.total as f64
        }
    }
}

/// One line of the ambulance board
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AmbulanceStatus {
    pub unit: ResourceUnit,
    /// Seconds until the automatic return, while on service
    pub returning_in_secs: Option<u64>,
}
