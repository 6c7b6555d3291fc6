//! Public state distribution
//!
//! The engine publishes a fresh `PublicState` every tick into a watch
//! channel. Readers either poll the latest copy or wait for the next one;
//! they never see engine internals.

use tokio::sync::watch;
use tracing::trace;

use vc_core::{format_state_summary, PublicState, Result, VortecError};

/// Write side, owned by the engine
#[derive(Debug)]
pub struct StatePublisher {
    tx: watch::Sender<PublicState>,
}

impl StatePublisher {
    pub fn new(initial: PublicState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Replace the published state; succeeds with no readers attached
    pub fn publish(&self, state: PublicState) {
        trace!("{}", format_state_summary(&state));
        self.tx.send_replace(state);
    }

    pub fn subscribe(&self) -> StateReader {
        StateReader {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side, cheap to clone
#[derive(Debug, Clone)]
pub struct StateReader {
    rx: watch::Receiver<PublicState>,
}

impl StateReader {
    /// Copy of the latest published state
    pub fn snapshot(&self) -> PublicState {
        self.rx.borrow().clone()
    }

    /// Wait for the next publication and return a copy of it
    ///
    /// Fails with `ShuttingDown` once the engine has dropped its publisher.
    pub async fn changed(&mut self) -> Result<PublicState> {
        self.rx.changed().await.map_err(|_| VortecError::ShuttingDown)?;
        Ok(self.rx.borrow_and_update().clone())
    }
}
