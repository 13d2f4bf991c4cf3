//! 🏥 Data model and interfaces of the ward allocator

mod clock;
mod error;
pub mod model;
mod request;
mod store;

use std::path::PathBuf;

use serde::Deserialize;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AllocError, AllocResult};
pub use model::{
    AmbulanceStatus, HistoryFilter, HistoryRecord, NewRecord, NewSubject, PoolKind, PoolSummary,
    RecordKind, ResourceUnit, RoomClass, Subject, SubjectId, SubjectKind, UnitId, UnitKind,
    UnitStatus, UnitUpdate,
};
pub use request::{Command, Reply, Request, RequestContext, RequestHandler, Responder};
pub use store::{Store, UnitState};

/// Configuration of the allocator
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Seconds after dispatch at which an ambulance counts as returned
    pub ambulance_return_secs: u32,
    /// Interval of the background reclaim sweep in seconds; no sweep if unset
    pub sweep_interval_secs: Option<u32>,
    /// SQLite database file; the in-memory store is used if unset
    pub database: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ambulance_return_secs: 600,
            sweep_interval_secs: None,
            database: None,
        }
    }
}
