use std::sync::Arc;

use eyre::Result;
use flume::Sender;
use nanorand::Rng;
use tokio::sync::oneshot;
use uuid::Uuid;
use ward_core::{
    AllocError, AmbulanceStatus, Command, HistoryFilter, HistoryRecord, NewSubject, PoolKind,
    PoolSummary, Reply, RequestContext, ResourceUnit, Subject, SubjectId, SubjectKind, UnitId,
    UnitStatus,
};

pub mod mock;

pub type ApiResult<T> = std::result::Result<T, AllocError>;

struct RequestMsg {
    command: Command,
    context: RequestContext,
    response_channel: oneshot::Sender<ApiResult<Reply>>,
}

/// Client of the allocator under test
///
/// Every clone sends to the next worker thread, and all requests of one
/// [`Api`] carry the same actor.
pub struct Api {
    /// One channel per worker thread
    channels: Arc<Vec<Sender<RequestMsg>>>,

    my_channel: Sender<RequestMsg>,
    my_index: usize,
    actor: String,
}

impl Api {
    fn new(channels: Vec<Sender<RequestMsg>>) -> Self {
        let my_channel = channels[0].clone();
        Self {
            channels: Arc::new(channels),
            my_channel,
            my_index: 0,
            actor: String::from("test-operator"),
        }
    }

    /// The actor requests of this client are made as
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// A client acting as `actor`
    pub fn as_actor(&self, actor: impl Into<String>) -> Api {
        let mut api = self.clone();
        api.actor = actor.into();
        api
    }

    /// A client acting as a freshly named operator
    pub fn create_operator(&self) -> Api {
        let mut bytes = [0u8; 4];
        nanorand::tls_rng().fill(&mut bytes);
        self.as_actor(format!("operator-{}", u32::from_le_bytes(bytes)))
    }
}

impl Clone for Api {
    fn clone(&self) -> Self {
        let my_index = (self.my_index + 1) % self.channels.len();
        Self {
            channels: self.channels.clone(),
            my_channel: self.channels[my_index].clone(),
            my_index,
            actor: self.actor.clone(),
        }
    }
}

pub struct ApiResponse<T> {
    pub request_id: Uuid,
    pub result: ApiResult<T>,
}

impl<T> ApiResponse<T> {
    fn map<R>(self, func: impl FnOnce(T) -> R) -> ApiResponse<R> {
        ApiResponse {
            request_id: self.request_id,
            result: self.result.map(func),
        }
    }
}

macro_rules! expect_reply {
    ($response:expr, $name:literal, $pat:pat => $value:expr) => {
        $response.map(|reply| match reply {
            $pat => $value,
            resp => panic!("{} must not be answered by {resp:?}", $name),
        })
    };
}

impl Api {
    async fn make_request(&self, command: Command) -> Result<ApiResponse<Reply>> {
        let (sender, receiver) = oneshot::channel();
        let mut bytes = [0u8; 16];
        nanorand::tls_rng().fill(&mut bytes);
        let context = RequestContext {
            actor: self.actor.clone(),
            request_id: uuid::Builder::from_random_bytes(bytes).into_uuid(),
        };
        let request_id = context.request_id;
        let msg = RequestMsg {
            command,
            context,
            response_channel: sender,
        };
        self.my_channel.send_async(msg).await?;
        Ok(ApiResponse {
            request_id,
            result: receiver.await?,
        })
    }

    pub async fn seed_pools(&self) -> Result<ApiResponse<u32>> {
        let response = self.make_request(Command::SeedPools).await?;
        Ok(expect_reply!(response, "seed-pools", Reply::Seeded(n) => n))
    }

    pub async fn register_subject(&self, new: NewSubject) -> Result<ApiResponse<Subject>> {
        let response = self.make_request(Command::RegisterSubject(new)).await?;
        Ok(expect_reply!(response, "register-subject", Reply::Subject(s) => s))
    }

    /// Register a subject with only the required fields set
    pub async fn register(&self, kind: SubjectKind, name: &str) -> Result<ApiResponse<Subject>> {
        self.register_subject(NewSubject::new(kind, name)).await
    }

    pub async fn get_subject(&self, subject: SubjectId) -> Result<ApiResponse<Subject>> {
        let response = self.make_request(Command::GetSubject { subject }).await?;
        Ok(expect_reply!(response, "get-subject", Reply::Subject(s) => s))
    }

    pub async fn pending_subjects(&self, pool: PoolKind) -> Result<ApiResponse<Vec<Subject>>> {
        let response = self.make_request(Command::PendingSubjects { pool }).await?;
        Ok(expect_reply!(response, "pending-subjects", Reply::Subjects(s) => s))
    }

    /// Allocate the lowest available unit of `pool`
    pub async fn allocate(
        &self,
        subject: SubjectId,
        pool: PoolKind,
    ) -> Result<ApiResponse<ResourceUnit>> {
        self.allocate_unit(subject, pool, None).await
    }

    pub async fn allocate_unit(
        &self,
        subject: SubjectId,
        pool: PoolKind,
        unit: Option<UnitId>,
    ) -> Result<ApiResponse<ResourceUnit>> {
        let command = Command::Allocate {
            subject,
            pool,
            unit,
        };
        let response = self.make_request(command).await?;
        Ok(expect_reply!(response, "allocate", Reply::Unit(u) => u))
    }

    pub async fn release(&self, unit: UnitId, reason: &str) -> Result<ApiResponse<HistoryRecord>> {
        let command = Command::Release {
            unit,
            reason: reason.to_owned(),
        };
        let response = self.make_request(command).await?;
        Ok(expect_reply!(response, "release", Reply::Record(r) => r))
    }

    pub async fn unit_status(&self, unit: UnitId) -> Result<ApiResponse<ResourceUnit>> {
        let response = self.make_request(Command::UnitStatus { unit }).await?;
        Ok(expect_reply!(response, "unit-status", Reply::Unit(u) => u))
    }

    pub async fn list_units(
        &self,
        pool: Option<PoolKind>,
        status: Option<UnitStatus>,
    ) -> Result<ApiResponse<Vec<ResourceUnit>>> {
        let response = self.make_request(Command::ListUnits { pool, status }).await?;
        Ok(expect_reply!(response, "list-units", Reply::Units(u) => u))
    }

    /// Counts of `pool` together with its occupancy rate
    pub async fn pool_summary(&self, pool: PoolKind) -> Result<ApiResponse<(PoolSummary, f64)>> {
        let response = self.make_request(Command::PoolSummary { pool }).await?;
        Ok(expect_reply!(
            response,
            "pool-summary",
            Reply::Summary { summary, occupancy_rate } => (summary, occupancy_rate)
        ))
    }

    pub async fn available_count(&self, pool: PoolKind) -> Result<ApiResponse<u32>> {
        let response = self.make_request(Command::AvailableCount { pool }).await?;
        Ok(expect_reply!(response, "available-count", Reply::Count(n) => n))
    }

    pub async fn occupancy_rate(&self, pool: PoolKind) -> Result<ApiResponse<f64>> {
        let response = self.make_request(Command::OccupancyRate { pool }).await?;
        Ok(expect_reply!(response, "occupancy-rate", Reply::Rate(rate) => rate))
    }

    pub async fn ambulance_board(&self) -> Result<ApiResponse<Vec<AmbulanceStatus>>> {
        let response = self.make_request(Command::AmbulanceBoard).await?;
        Ok(expect_reply!(response, "ambulance-board", Reply::Ambulances(a) => a))
    }

    pub async fn history(&self, filter: HistoryFilter) -> Result<ApiResponse<Vec<HistoryRecord>>> {
        let response = self.make_request(Command::History { filter }).await?;
        Ok(expect_reply!(response, "history", Reply::Records(r) => r))
    }
}
