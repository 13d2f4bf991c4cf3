//! Front desk turning requests into allocator calls
use std::sync::Arc;

use tracing::debug;
use ward_core::{AllocResult, Command, Reply, Request, RequestContext, RequestHandler};

use crate::allocator::Allocator;
use crate::reclaimer::Reclaimer;

/// Handles requests of the presentation layer
///
/// ⚠️ Requests are executed on the calling thread; `handle()` may be called
/// from any number of threads at once.
pub struct Desk {
    allocator: Arc<Allocator>,
    reclaimer: Option<Reclaimer>,
}

impl Desk {
    /// Create a new [`Desk`]
    pub fn new(allocator: Arc<Allocator>, reclaimer: Option<Reclaimer>) -> Self {
        Self {
            allocator,
            reclaimer,
        }
    }

    /// The allocator behind this desk
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// Run `command` and build its reply
    pub fn execute(&self, command: Command, ctx: &RequestContext) -> AllocResult<Reply> {
        let allocator = &*self.allocator;
        Ok(match command {
            Command::SeedPools => Reply::Seeded(allocator.seed_pools()?),
            Command::RegisterSubject(new) => {
                Reply::Subject(allocator.register_subject(ctx, new)?)
            }
            Command::GetSubject { subject } => Reply::Subject(allocator.get_subject(subject)?),
            Command::PendingSubjects { pool } => {
                Reply::Subjects(allocator.pending_subjects(pool)?)
            }
            Command::Allocate {
                subject,
                pool,
                unit,
            } => Reply::Unit(allocator.allocate(ctx, subject, pool, unit)?),
            Command::Release { unit, reason } => {
                Reply::Record(allocator.release(ctx, unit, &reason)?)
            }
            Command::UnitStatus { unit } => Reply::Unit(allocator.unit_status(ctx, unit)?),
            Command::ListUnits { pool, status } => {
                Reply::Units(allocator.list_units(ctx, pool, status)?)
            }
            Command::PoolSummary { pool } => {
                let summary = allocator.pool_summary(pool)?;
                Reply::Summary {
                    summary,
                    occupancy_rate: summary.occupancy_rate(),
                }
            }
            Command::AvailableCount { pool } => Reply::Count(allocator.available_count(pool)?),
            Command::OccupancyRate { pool } => Reply::Rate(allocator.occupancy_rate(pool)?),
            Command::AmbulanceBoard => Reply::Ambulances(allocator.ambulance_board(ctx)?),
            Command::History { filter } => Reply::Records(allocator.history(&filter)?),
        })
    }
}

impl RequestHandler for Desk {
    fn handle(&self, rq: Request) {
        let name = rq.command().name();
        let (command, ctx, responder) = rq.into_parts();
        let result = self.execute(command, &ctx);
        if let Err(err) = &result {
            debug!(
                request_id = %ctx.request_id,
                command = name,
                code = err.code(),
                %err,
                "request failed"
            );
        }
        responder.respond(result, &ctx);
    }

    fn shutdown(self) {
        // stop the background sweep, if any
        if let Some(reclaimer) = self.reclaimer {
            reclaimer.shutdown();
        }
    }
}
