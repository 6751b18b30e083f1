use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::sync::watch;

pub mod elector;

pub type EpochId = u64;

/// Publishes which leadership epoch, if any, this replica is in.
#[derive(Debug, Clone)]
pub struct LeadershipGate {
    state: Arc<watch::Sender<Option<EpochId>>>,
    last_epoch: Arc<AtomicU64>,
}

impl Default for LeadershipGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LeadershipGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);

        Self {
            state: Arc::new(state),
            last_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A gate for a replica that doesn't take part in an election.
    pub fn standalone() -> Self {
        let gate = Self::new();
        gate.promote();

        gate
    }

    /// Starts a new epoch unless this replica already leads.
    pub fn promote(&self) -> Epoch {
        if let Some(epoch) = self.current_epoch() {
            return epoch;
        }

        let id = self.last_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(Some(id));

        self.epoch(id)
    }

    pub fn demote(&self) {
        self.state.send_replace(None);
    }

    pub fn is_leader(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn current_epoch(&self) -> Option<Epoch> {
        let id = (*self.state.borrow())?;

        Some(self.epoch(id))
    }

    pub async fn wait_for_leadership(&self) -> Epoch {
        let mut state = self.state.subscribe();

        loop {
            if let Some(id) = *state.borrow_and_update() {
                return self.epoch(id);
            }

            // the sender lives as long as this gate, so this can't fail
            let _ = state.changed().await;
        }
    }

    fn epoch(&self, id: EpochId) -> Epoch {
        Epoch {
            id,
            state: self.state.subscribe(),
        }
    }
}

/// Capability handed to everything that may only act while this replica
/// leads in a particular epoch.
#[derive(Debug, Clone)]
pub struct Epoch {
    id: EpochId,
    state: watch::Receiver<Option<EpochId>>,
}

impl Epoch {
    pub fn id(&self) -> EpochId {
        self.id
    }

    pub fn is_current(&self) -> bool {
        *self.state.borrow() == Some(self.id)
    }

    /// Resolves once the epoch is over.
    pub async fn ended(&self) {
        let mut state = self.state.clone();

        while *state.borrow_and_update() == Some(self.id) {
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}
