//! 🚑 Room/bed and ambulance allocation.
//!
//! The components are the [allocator][Allocator], its two
//! [store][ward_core::Store] implementations ([`MemoryStore`] and
//! [`SqliteStore`]), the request [desk][Desk] and the optional background
//! [reclaimer][Reclaimer].

use std::sync::Arc;
use std::time::Duration;

use ward_core::{AllocResult, Clock, Config, Store};

mod allocator;
mod database;
mod desk;
pub mod pools;
mod reclaimer;
mod sqlite;

pub use allocator::Allocator;
pub use database::MemoryStore;
pub use desk::Desk;
pub use reclaimer::Reclaimer;
pub use sqlite::SqliteStore;

/// Open the store selected by `config`
///
/// A configured database file selects the [`SqliteStore`], otherwise the
/// [`MemoryStore`] is used.
pub fn open_store(config: &Config) -> AllocResult<Arc<dyn Store>> {
    Ok(match &config.database {
        Some(path) => Arc::new(SqliteStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    })
}

/// Entrypoint of the allocator
///
/// Seeds the unit pools (a no-op if they already exist), starts the
/// background sweep if one is configured, and returns the desk which serves
/// the presentation layer.
pub fn launch(config: &Config, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> AllocResult<Desk> {
    let allocator = Arc::new(Allocator::new(store, clock, config));
    allocator.seed_pools()?;

    let reclaimer = config
        .sweep_interval_secs
        .filter(|secs| *secs > 0)
        .map(|secs| Reclaimer::spawn(allocator.clone(), Duration::from_secs(secs as u64)));

    Ok(Desk::new(allocator, reclaimer))
}
