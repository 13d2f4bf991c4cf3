use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{
    AmbulanceStatus, HistoryFilter, HistoryRecord, NewSubject, PoolKind, PoolSummary,
    ResourceUnit, Subject, SubjectId, UnitId, UnitStatus,
};
use crate::AllocError;

/// Who is acting, for one request
///
/// Replaces any notion of a logged-in session: every mutating call receives
/// the context of the request that caused it.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct RequestContext {
    /// Name of the acting operator
    pub actor: String,
    /// Id used to correlate log lines of one request
    pub request_id: Uuid,
}

impl RequestContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            request_id: Uuid::new_v4(),
        }
    }

    /// Context for work the system does on its own
    pub fn system() -> Self {
        Self::new(crate::model::SYSTEM_ACTOR)
    }
}

/// Operation requested by the presentation layer
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    /// Create the fixed unit pools if they do not exist yet
    SeedPools,
    /// Register a patient, emergency patient or ambulance request
    RegisterSubject(NewSubject),
    GetSubject { subject: SubjectId },
    /// Subjects still waiting for a unit of `pool`
    PendingSubjects { pool: PoolKind },
    Allocate {
        subject: SubjectId,
        pool: PoolKind,
        #[serde(default)]
        unit: Option<UnitId>,
    },
    Release { unit: UnitId, reason: String },
    /// Current state of one unit, after the lazy ambulance reclaim
    UnitStatus { unit: UnitId },
    ListUnits {
        #[serde(default)]
        pool: Option<PoolKind>,
        #[serde(default)]
        status: Option<UnitStatus>,
    },
    PoolSummary { pool: PoolKind },
    /// Number of available units in `pool`
    AvailableCount { pool: PoolKind },
    /// Held units of `pool` over all its units
    OccupancyRate { pool: PoolKind },
    AmbulanceBoard,
    History {
        #[serde(default)]
        filter: HistoryFilter,
    },
}

impl Command {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::SeedPools => "seed-pools",
            Command::RegisterSubject(_) => "register-subject",
            Command::GetSubject { .. } => "get-subject",
            Command::PendingSubjects { .. } => "pending-subjects",
            Command::Allocate { .. } => "allocate",
            Command::Release { .. } => "release",
            Command::UnitStatus { .. } => "unit-status",
            Command::ListUnits { .. } => "list-units",
            Command::PoolSummary { .. } => "pool-summary",
            Command::AvailableCount { .. } => "available-count",
            Command::OccupancyRate { .. } => "occupancy-rate",
            Command::AmbulanceBoard => "ambulance-board",
            Command::History { .. } => "history",
        }
    }
}

/// Successful answer to a [`Command`]
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "reply", content = "data", rename_all = "kebab-case")]
pub enum Reply {
    /// Number of units created by seeding, zero if already seeded
    Seeded(u32),
    Subject(Subject),
    Subjects(Vec<Subject>),
    Unit(ResourceUnit),
    Units(Vec<ResourceUnit>),
    Record(HistoryRecord),
    Records(Vec<HistoryRecord>),
    Summary {
        summary: PoolSummary,
        occupancy_rate: f64,
    },
    Count(u32),
    /// Fraction between `0.0` and `1.0`
    Rate(f64),
    Ambulances(Vec<AmbulanceStatus>),
}

/// Sends the outcome of a request back to whoever issued it
///
/// Implemented by the HTTP layer and by test harnesses.
pub trait Responder {
    fn respond(self: Box<Self>, result: Result<Reply, AllocError>, context: &RequestContext);
}

/// A command together with its context and reply channel
pub struct Request {
    command: Command,
    context: RequestContext,
    responder: Box<dyn Responder + Send>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("command", &self.command)
            .field("context", &self.context)
            .field("responder", &format_args!(".."))
            .finish()
    }
}

impl Request {
    #[inline]
    pub fn new(
        command: Command,
        context: RequestContext,
        responder: Box<dyn Responder + Send>,
    ) -> Self {
        Self {
            command,
            context,
            responder,
        }
    }

    #[inline]
    pub fn command(&self) -> &Command {
        &self.command
    }

    #[inline]
    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Split the request so the command can be consumed before answering
    #[inline]
    pub fn into_parts(self) -> (Command, RequestContext, Box<dyn Responder + Send>) {
        (self.command, self.context, self.responder)
    }

    /// Answer the request
    #[inline]
    pub fn respond(self, result: Result<Reply, AllocError>) {
        self.responder.respond(result, &self.context)
    }
}

/// Entry point of the presentation layer into the allocator
pub trait RequestHandler {
    /// Handle one request
    ///
    /// This method may be called concurrently from different threads.
    fn handle(&self, request: Request);

    /// Stop background work and wait for it to finish
    fn shutdown(self);
}
