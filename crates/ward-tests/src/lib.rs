use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use eyre::{eyre, Result};
use project_settings::ProjectSettings;
use ward_allocator::{Allocator, MemoryStore, SqliteStore};
use ward_core::{Clock, Config, ManualClock, Store};

mod api;
mod project_settings;
pub use api::{Api, ApiResponse, ApiResult};
pub use project_settings::StoreBackend;

pub struct TestCtxBuilder {
    /// Store the allocator runs on
    pub store: StoreBackend,
    /// Count of worker threads serving the API
    pub workers: u16,
    /// Seconds after which an ambulance returns on its own
    pub return_secs: u32,
    /// Interval of the background sweep in seconds, none if unset
    pub sweep_secs: Option<u32>,
    /// Initial time of the test clock
    pub start: DateTime<Utc>,
}

impl TestCtxBuilder {
    /// Create a new test context builder initialized with environment defaults
    pub fn from_env() -> Result<Self> {
        let settings = ProjectSettings::load()?;

        let start = Utc
            .with_ymd_and_hms(2024, 3, 1, 8, 0, 0)
            .single()
            .ok_or_else(|| eyre!("invalid start time"))?;

        Ok(TestCtxBuilder {
            store: settings.store,
            workers: settings.workers,
            return_secs: 600,
            sweep_secs: None,
            start,
        })
    }

    /// Select the store backend regardless of the environment
    pub fn with_store(mut self, store: StoreBackend) -> Self {
        self.store = store;
        self
    }

    /// Set the number of worker threads to use
    pub fn with_workers(mut self, workers: u16) -> Self {
        assert_ne!(workers, 0);
        self.workers = workers;
        self
    }

    /// Set the automatic ambulance return threshold (in seconds)
    pub fn with_return_secs(mut self, secs: u32) -> Self {
        self.return_secs = secs;
        self
    }

    /// Run the background sweep every `secs` seconds of wall time
    pub fn with_sweep_secs(mut self, secs: u32) -> Self {
        self.sweep_secs = Some(secs);
        self
    }

    /// Get the [`ward_core::Config`] for launching the allocator
    fn config(&self) -> Config {
        Config {
            ambulance_return_secs: self.return_secs,
            sweep_interval_secs: self.sweep_secs,
            database: None,
        }
    }

    /// Build the test context
    pub async fn build(self) -> Result<TestCtx> {
        let config = self.config();
        let clock = Arc::new(ManualClock::new(self.start));

        let (store, memory) = match self.store {
            StoreBackend::Memory => {
                let memory = Arc::new(MemoryStore::new());
                let store: Arc<dyn Store> = memory.clone();
                (store, Some(memory))
            }
            StoreBackend::Sqlite => {
                let store = tokio::task::spawn_blocking(SqliteStore::open_in_memory).await??;
                (Arc::new(store) as Arc<dyn Store>, None)
            }
        };

        let launch_clock: Arc<dyn Clock> = clock.clone();
        let desk = tokio::task::spawn_blocking(move || {
            ward_allocator::launch(&config, store, launch_clock)
        })
        .await??;
        let (desk, api) = api::mock::start(self.workers, desk);

        Ok(TestCtx {
            api,
            desk,
            clock,
            memory,
            store: self.store,
            return_secs: self.return_secs,
            drop_bomb: DropBomb,
        })
    }
}

/// Test context
pub struct TestCtx {
    /// API allowing to interact with the allocator
    pub api: Api,
    desk: api::mock::MockDesk,
    /// Clock the allocator reads; only moves when advanced
    pub clock: Arc<ManualClock>,
    memory: Option<Arc<MemoryStore>>,
    /// Store backend in use
    pub store: StoreBackend,
    /// Ambulance return threshold in seconds
    pub return_secs: u32,

    drop_bomb: DropBomb,
}

impl TestCtx {
    /// Move the allocator clock forward
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Current time of the allocator clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Simulate the store going down or coming back
    ///
    /// Only the in-memory store can be taken offline.
    pub fn set_store_online(&self, online: bool) -> Result<()> {
        let memory = self
            .memory
            .as_ref()
            .ok_or_else(|| eyre!("only the memory store can be taken offline"))?;
        memory.set_online(online);
        Ok(())
    }

    /// The allocator behind the API, for operations the API does not expose
    pub fn allocator(&self) -> &Allocator {
        self.desk.desk().allocator()
    }

    /// Shut down the allocator and finish the test
    pub async fn finish(self) {
        std::mem::forget(self.drop_bomb);
        drop(self.api);
        self.desk.shutdown().await
    }
}

struct DropBomb;

impl Drop for DropBomb {
    fn drop(&mut self) {
        eprintln!("@TestAuthor: You should call `ctx.finish().await` to shut the allocator down");
    }
}
