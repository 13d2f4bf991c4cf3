//! Background sweep returning overdue ambulances

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, tick, Sender};
use crossbeam::select;
use tracing::{info, warn};
use ward_core::RequestContext;

use crate::allocator::Allocator;

/// Thread that periodically runs [`Allocator::reclaim_ambulances()`]
///
/// Reads reclaim lazily anyway; the sweep only makes sure an ambulance that
/// nobody looks at does not stay on service forever.
pub struct Reclaimer {
    shutdown: Sender<()>,
    thread: JoinHandle<()>,
}

impl Reclaimer {
    /// Start sweeping every `interval`
    pub fn spawn(allocator: Arc<Allocator>, interval: Duration) -> Self {
        let (shutdown, shutdown_receiver) = bounded(1);
        let ticker = tick(interval);

        let thread = thread::spawn(move || loop {
            select! {
                recv(shutdown_receiver) -> _ => break,
                recv(ticker) -> _ => {
                    match allocator.reclaim_ambulances(&RequestContext::system()) {
                        Ok(returned) if !returned.is_empty() => {
                            info!(returned = returned.len(), "sweep returned ambulances");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "ambulance sweep failed"),
                    }
                }
            }
        });

        Self { shutdown, thread }
    }

    /// Stop the sweep and wait for the thread to exit
    pub fn shutdown(self) {
        let _ = self.shutdown.send(());
        if self.thread.join().is_err() {
            warn!("ambulance sweep thread panicked");
        }
    }
}
