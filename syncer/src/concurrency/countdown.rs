//! Rendezvous used by barrier jobs.
//!
//! A [`Countdown`] is created for every barrier with one [`Ack`] per queue. Each worker
//! acknowledges once it has processed the barrier, and the coordinator waits until all
//! acknowledgements arrived. Failures are collected and returned to the coordinator, an [`Ack`]
//! dropped without being completed counts as a failure so a crashed worker can never be mistaken
//! for a successful one.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::warn;

use crate::error::{ErrorKind, SyncerError, SyncerResult};
use crate::location::Location;
use crate::syncer_error;

#[derive(Debug)]
struct Shared {
    remaining: watch::Sender<usize>,
    failures: Mutex<Vec<SyncerError>>,
}

impl Shared {
    fn arrive(&self, result: SyncerResult<()>) {
        if let Err(err) = result
            && let Ok(mut failures) = self.failures.lock()
        {
            failures.push(err);
        }

        self.remaining
            .send_modify(|remaining| *remaining = remaining.saturating_sub(1));
    }
}

/// Waiting side of a barrier rendezvous.
#[derive(Debug)]
pub struct Countdown {
    shared: Arc<Shared>,
    remaining: watch::Receiver<usize>,
    location: Location,
}

impl Countdown {
    /// Creates a countdown expecting `parties` acknowledgements for a barrier at `location`.
    pub fn new(parties: usize, location: Location) -> (Countdown, Vec<Ack>) {
        let (tx, rx) = watch::channel(parties);
        let shared = Arc::new(Shared {
            remaining: tx,
            failures: Mutex::new(Vec::new()),
        });

        let acks = (0..parties)
            .map(|_| Ack {
                shared: Some(shared.clone()),
            })
            .collect();

        let countdown = Countdown {
            shared,
            remaining: rx,
            location,
        };

        (countdown, acks)
    }

    /// Number of acknowledgements still missing.
    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    /// Waits for every party, then returns the aggregated failures if any.
    pub async fn wait(mut self) -> SyncerResult<()> {
        // The sender lives in `shared`, held by `self`, so the channel cannot close here.
        let _ = self.remaining.wait_for(|remaining| *remaining == 0).await;

        let failures = match self.shared.failures.lock() {
            Ok(mut failures) => std::mem::take(&mut *failures),
            Err(_) => vec![syncer_error!(
                ErrorKind::InvalidState,
                "Barrier failure list was poisoned"
            )],
        };

        if failures.is_empty() {
            return Ok(());
        }

        warn!(
            location = %self.location,
            failures = failures.len(),
            "barrier was not acknowledged by every queue"
        );

        Err(failures.into())
    }
}

/// Acknowledging side of a barrier rendezvous, owned by one worker.
#[derive(Debug)]
pub struct Ack {
    shared: Option<Arc<Shared>>,
}

impl Ack {
    /// Acknowledges the barrier with the outcome of processing it.
    pub fn complete(mut self, result: SyncerResult<()>) {
        if let Some(shared) = self.shared.take() {
            shared.arrive(result);
        }
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.arrive(Err(syncer_error!(
                ErrorKind::QueueClosed,
                "Barrier was dropped before being acknowledged"
            )));
        }
    }
}
