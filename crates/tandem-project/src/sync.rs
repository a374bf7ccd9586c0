//! Sync driver - per (branch, peer) acknowledgement tracking
//!
//! The transport is not part of this crate; whatever moves changes between
//! replicas reports what it sent, received and had acknowledged, and the
//! driver turns that into a status the editor can show. Local writes never
//! wait on any of this.

use crate::branches::now_millis;
use dashmap::DashMap;
use std::sync::Arc;
use tandem_core::{ChangeOrigin, DocumentId, DocumentStore, HeadSet};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Unknown,
    Syncing,
    FullySynced,
}

/// What we know about one peer's copy of one branch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPeerState {
    pub phase: SyncPhase,
    pub last_sent_heads: Option<HeadSet>,
    pub last_acked_heads: Option<HeadSet>,
    pub last_sent_time: Option<u64>,
    pub last_received_time: Option<u64>,
    pub connected: bool,
}

/// Branch-level summary across every peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Unknown,
    Syncing,
    FullySynced,
    /// No connected peer; `pending` local changes are not acknowledged yet
    Disconnected { pending: usize },
}

type PeerKey = (DocumentId, String);

pub struct SyncDriver {
    store: Arc<DocumentStore>,
    peers: DashMap<PeerKey, SyncPeerState>,
    changed: broadcast::Sender<DocumentId>,
}

impl SyncDriver {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        let (changed, _) = broadcast::channel(256);
        Self {
            store,
            peers: DashMap::new(),
            changed,
        }
    }

    /// Branch ids whose sync state changed
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentId> {
        self.changed.subscribe()
    }

    fn update(&self, branch: &DocumentId, peer: &str, f: impl FnOnce(&mut SyncPeerState)) {
        let pending = self.pending_for(branch);
        {
            let mut state = self
                .peers
                .entry((branch.clone(), peer.to_string()))
                .or_default();
            f(&mut state);
            state.phase = phase_of(&state, pending(state.last_acked_heads.as_ref()));
        }
        let _ = self.changed.send(branch.clone());
    }

    /// Closure counting local changes outside what `acked` covers
    fn pending_for(&self, branch: &DocumentId) -> impl Fn(Option<&HeadSet>) -> usize {
        let doc = self.store.get(branch).ok();
        move |acked| {
            let Some(doc) = &doc else { return 0 };
            let base = acked.map(|heads| doc.known_heads(heads)).unwrap_or_default();
            doc.changes_since(&base).map(|c| c.len()).unwrap_or(0)
        }
    }

    pub fn peer_connected(&self, branch: &DocumentId, peer: &str) {
        debug!(branch = %branch, peer, "Peer connected");
        self.update(branch, peer, |s| s.connected = true);
    }

    pub fn peer_disconnected(&self, branch: &DocumentId, peer: &str) {
        debug!(branch = %branch, peer, "Peer disconnected");
        self.update(branch, peer, |s| s.connected = false);
    }

    pub fn record_sent(&self, branch: &DocumentId, peer: &str, heads: HeadSet) {
        self.update(branch, peer, |s| {
            s.last_sent_heads = Some(heads);
            s.last_sent_time = Some(now_millis());
        });
    }

    pub fn record_received(&self, branch: &DocumentId, peer: &str) {
        self.update(branch, peer, |s| {
            s.connected = true;
            s.last_received_time = Some(now_millis());
        });
    }

    /// Record the heads a peer acknowledged; returns false when ignored
    pub fn record_ack(&self, branch: &DocumentId, peer: &str, heads: HeadSet) -> bool {
        let key = (branch.clone(), peer.to_string());
        let beheaded = heads.is_empty()
            && self
                .peers
                .get(&key)
                .and_then(|s| s.last_acked_heads.as_ref().map(|h| !h.is_empty()))
                .unwrap_or(false);
        if beheaded {
            warn!(branch = %branch, peer, "Peer acknowledged empty heads, ignoring");
            return false;
        }

        self.update(branch, peer, |s| s.last_acked_heads = Some(heads));
        true
    }

    /// Re-derive the phase of every peer of `branch` after a local write
    pub fn local_heads_changed(&self, branch: &DocumentId) {
        let pending = self.pending_for(branch);
        let mut touched = false;
        for mut entry in self.peers.iter_mut().filter(|e| &e.key().0 == branch) {
            let phase = phase_of(entry.value(), pending(entry.last_acked_heads.as_ref()));
            if entry.phase != phase {
                entry.phase = phase;
                touched = true;
            }
        }
        if touched {
            let _ = self.changed.send(branch.clone());
        }
    }

    pub fn peer_state(&self, branch: &DocumentId, peer: &str) -> Option<SyncPeerState> {
        self.peers
            .get(&(branch.clone(), peer.to_string()))
            .map(|s| s.clone())
    }

    pub fn status(&self, branch: &DocumentId) -> SyncStatus {
        let states: Vec<SyncPeerState> = self
            .peers
            .iter()
            .filter(|e| &e.key().0 == branch)
            .map(|e| e.value().clone())
            .collect();
        if states.is_empty() {
            return SyncStatus::Unknown;
        }

        let connected: Vec<&SyncPeerState> = states.iter().filter(|s| s.connected).collect();
        if connected.is_empty() {
            let pending = self.pending_for(branch);
            let pending = states
                .iter()
                .map(|s| pending(s.last_acked_heads.as_ref()))
                .min()
                .unwrap_or(0);
            return SyncStatus::Disconnected { pending };
        }

        if connected.iter().all(|s| s.phase == SyncPhase::FullySynced) {
            SyncStatus::FullySynced
        } else if connected.iter().any(|s| s.phase == SyncPhase::Syncing) {
            SyncStatus::Syncing
        } else {
            SyncStatus::Unknown
        }
    }

    /// Follow local writes on the store until it is dropped
    pub fn spawn_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let driver = Arc::clone(self);
        let mut events = self.store.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.origin == ChangeOrigin::Local => {
                        driver.local_heads_changed(&event.document_id)
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Sync watcher lagged behind store events");
                        let branches: Vec<DocumentId> =
                            driver.peers.iter().map(|e| e.key().0.clone()).collect();
                        for branch in branches {
                            driver.local_heads_changed(&branch);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn phase_of(state: &SyncPeerState, pending: usize) -> SyncPhase {
    match (&state.last_acked_heads, &state.last_sent_heads) {
        (Some(_), _) if pending == 0 => SyncPhase::FullySynced,
        (Some(_), _) | (None, Some(_)) => SyncPhase::Syncing,
        (None, None) => SyncPhase::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tandem_core::{ActorId, ChangeMetadata, DocPath};

    fn setup() -> (Arc<DocumentStore>, DocumentId, SyncDriver) {
        let store = Arc::new(DocumentStore::new(ActorId::new("alice")));
        let branch = DocumentId::new("branch:sync").unwrap();
        store.create(branch.clone()).unwrap();
        let driver = SyncDriver::new(store.clone());
        (store, branch, driver)
    }

    fn write(store: &DocumentStore, branch: &DocumentId, value: i64) {
        store
            .set(branch, DocPath::root().key("n"), value, ChangeMetadata::new())
            .unwrap();
    }

    #[test]
    fn test_phase_follows_acks() {
        let (store, branch, driver) = setup();
        assert_eq!(driver.status(&branch), SyncStatus::Unknown);

        write(&store, &branch, 1);
        driver.peer_connected(&branch, "server");
        assert_eq!(driver.peer_state(&branch, "server").unwrap().phase, SyncPhase::Unknown);

        let heads = store.heads(&branch).unwrap();
        driver.record_sent(&branch, "server", heads.clone());
        assert_eq!(driver.status(&branch), SyncStatus::Syncing);

        assert!(driver.record_ack(&branch, "server", heads));
        assert_eq!(driver.status(&branch), SyncStatus::FullySynced);

        // A local write regresses the peer to syncing
        write(&store, &branch, 2);
        driver.local_heads_changed(&branch);
        assert_eq!(driver.status(&branch), SyncStatus::Syncing);

        driver.peer_disconnected(&branch, "server");
        assert_eq!(driver.status(&branch), SyncStatus::Disconnected { pending: 1 });
    }

    #[test]
    fn test_empty_ack_after_progress_is_ignored() {
        let (store, branch, driver) = setup();
        write(&store, &branch, 1);
        let heads = store.heads(&branch).unwrap();
        driver.record_received(&branch, "server");
        assert!(driver.record_ack(&branch, "server", heads.clone()));

        assert!(!driver.record_ack(&branch, "server", HeadSet::new()));
        let state = driver.peer_state(&branch, "server").unwrap();
        assert_eq!(state.last_acked_heads, Some(heads));
        assert_eq!(state.phase, SyncPhase::FullySynced);
        assert!(state.connected);
        assert!(state.last_received_time.is_some());
    }

    #[test]
    fn test_disconnected_counts_unacked_changes() {
        let (store, branch, driver) = setup();
        driver.peer_connected(&branch, "server");
        assert!(driver.record_ack(&branch, "server", HeadSet::new()));
        write(&store, &branch, 1);
        write(&store, &branch, 2);
        driver.peer_disconnected(&branch, "server");
        assert_eq!(driver.status(&branch), SyncStatus::Disconnected { pending: 2 });
    }

    #[tokio::test]
    async fn test_watch_task_tracks_local_writes() {
        let (store, branch, driver) = setup();
        let driver = Arc::new(driver);
        let mut changed = driver.subscribe();
        let handle = driver.spawn_watch();

        write(&store, &branch, 1);
        let heads = store.heads(&branch).unwrap();
        driver.peer_connected(&branch, "server");
        driver.record_ack(&branch, "server", heads);
        assert_eq!(driver.status(&branch), SyncStatus::FullySynced);
        while changed.try_recv().is_ok() {}

        write(&store, &branch, 2);
        let notified = tokio::time::timeout(Duration::from_secs(1), changed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notified, branch);
        assert_eq!(driver.status(&branch), SyncStatus::Syncing);

        handle.abort();
    }
}
