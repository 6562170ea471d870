//! Anti-entropy between validators.
//!
//! Every other validator gets a [`PeerState`] task. The service pokes all of them whenever the
//! local round changes and on a fixed interval; each task then ships the local gossip state to
//! its peer and repairs what the peer is known to miss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tbft_protobuf::consensus::{GossipState, TbftMessage};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::consensus::SharedState;
use crate::peer_state::{PeerEvent, PeerState};
use crate::types::{MessageBus, ValidatorId};

const PEERS_LOCK_POISONED: &str = "gossip peers lock poisoned";

#[derive(Debug)]
struct PeerHandle {
    events: mpsc::Sender<PeerEvent>,
    task: JoinHandle<()>,
}

type Peers = Arc<Mutex<HashMap<ValidatorId, PeerHandle>>>;

pub(crate) struct GossipService {
    id: ValidatorId,
    shared: SharedState,
    message_bus: Arc<dyn MessageBus>,
    internal: mpsc::Sender<TbftMessage>,
    capacity: usize,
    interval: Duration,
    peers: Peers,
    trigger: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl GossipService {
    pub(crate) fn new(
        id: ValidatorId,
        shared: SharedState,
        message_bus: Arc<dyn MessageBus>,
        internal: mpsc::Sender<TbftMessage>,
        capacity: usize,
        interval: Duration,
    ) -> Self {
        Self {
            id,
            shared,
            message_bus,
            internal,
            capacity,
            interval,
            peers: Arc::new(Mutex::new(HashMap::new())),
            trigger: Arc::new(Notify::new()),
            task: None,
        }
    }

    /// Starts the periodic gossip. Triggers fired before the start are not lost.
    pub(crate) fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        debug!(id = %self.id, interval = ?self.interval, "Starting gossip.");
        self.task = Some(tokio::spawn(gossip_loop(
            Arc::clone(&self.peers),
            Arc::clone(&self.trigger),
            self.interval,
        )));
    }

    /// Spawns the task reconciling with `peer`. Adding this node or a known peer is a no-op.
    pub(crate) fn add_peer(&self, peer: &str) {
        if peer == self.id {
            return;
        }
        let mut peers = self.peers.lock().expect(PEERS_LOCK_POISONED);
        if peers.contains_key(peer) {
            return;
        }
        let (events, receiver) = mpsc::channel(self.capacity);
        let peer_state = PeerState::new(
            peer.to_string(),
            self.id.clone(),
            Arc::clone(&self.shared),
            Arc::clone(&self.message_bus),
            self.internal.clone(),
        );
        let task = tokio::spawn(peer_state.run(receiver));
        debug!(%peer, "Added gossip peer.");
        peers.insert(peer.to_string(), PeerHandle { events, task });
    }

    pub(crate) fn remove_peer(&self, peer: &str) {
        if let Some(handle) = self.peers.lock().expect(PEERS_LOCK_POISONED).remove(peer) {
            handle.task.abort();
            debug!(%peer, "Removed gossip peer.");
        }
    }

    /// Asks every peer task to reconcile now.
    pub(crate) fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Routes a gossip state received from the network to the task of its sender.
    pub(crate) fn on_remote_state(&self, state: GossipState) {
        let peers = self.peers.lock().expect(PEERS_LOCK_POISONED);
        let Some(handle) = peers.get(&state.id) else {
            debug!(peer = %state.id, "Gossip state from an unknown peer, ignoring.");
            return;
        };
        if let Err(err) = handle.events.try_send(PeerEvent::RemoteState(state)) {
            trace!(%err, "Dropped a peer gossip state.");
        }
    }
}

impl Drop for GossipService {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Ok(mut peers) = self.peers.lock() {
            for (_, handle) in peers.drain() {
                handle.task.abort();
            }
        }
    }
}

async fn gossip_loop(peers: Peers, trigger: Arc<Notify>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = trigger.notified() => {}
            _ = ticker.tick() => {}
        }
        let senders: Vec<_> = peers
            .lock()
            .expect(PEERS_LOCK_POISONED)
            .values()
            .map(|handle| handle.events.clone())
            .collect();
        for sender in senders {
            // Tasks read the latest state when they run, so a dropped poke loses nothing.
            if let Err(TrySendError::Closed(_)) = sender.try_send(PeerEvent::LocalState) {
                trace!("Gossip peer task has stopped.");
            }
        }
    }
}
