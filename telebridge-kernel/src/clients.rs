use crate::config::ClientsConf;
use crate::contracts::ServerMessage;
use crate::models::TelemetrySnapshot;
use crate::state::{new_state, Shared, SnapshotStore};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ClientSendError {
    #[error("client connection is closed")]
    Closed,
    #[error("client did not drain its queue in time")]
    Timeout,
}

/// Un socket dashboard vu par le registre. La tâche du socket possède le
/// côté réception de `outbound`.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: Uuid,
    pub connected_at: OffsetDateTime,
    outbound: mpsc::Sender<ServerMessage>,
    last_revision: AtomicU64,
    last_activity: Mutex<OffsetDateTime>,
    closed: CancellationToken,
    send_timeout: Duration,
}

impl ClientHandle {
    pub fn new(outbound: mpsc::Sender<ServerMessage>, send_timeout: Duration) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            connected_at: now,
            outbound,
            last_revision: AtomicU64::new(0),
            last_activity: Mutex::new(now),
            closed: CancellationToken::new(),
            send_timeout,
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = OffsetDateTime::now_utc();
    }

    pub fn last_activity(&self) -> OffsetDateTime {
        *self.last_activity.lock()
    }

    pub fn last_revision(&self) -> u64 {
        self.last_revision.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Se résout quand le registre a fermé ce client.
    pub fn closed(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Résultats de commande, sans filtre de révision.
    pub async fn reply(&self, msg: ServerMessage) -> Result<(), ClientSendError> {
        self.send(msg).await
    }

    /// Envoie `snapshot` sauf si ce client a déjà reçu cette révision ou une
    /// plus récente. `Ok(false)` quand l'envoi est sauté.
    pub async fn push_snapshot(&self, snapshot: Arc<TelemetrySnapshot>) -> Result<bool, ClientSendError> {
        let rev = snapshot.revision;
        if self.last_revision.fetch_max(rev, Ordering::AcqRel) >= rev {
            return Ok(false);
        }
        self.send(ServerMessage::Data(snapshot)).await?;
        Ok(true)
    }

    /// Met en file sans attendre, tant que le client n'est pas encore visible
    /// des broadcasts.
    fn try_push_snapshot(&self, snapshot: Arc<TelemetrySnapshot>) -> Result<(), ClientSendError> {
        let rev = snapshot.revision;
        if self.last_revision.fetch_max(rev, Ordering::AcqRel) >= rev {
            return Ok(());
        }
        self.outbound
            .try_send(ServerMessage::Data(snapshot))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ClientSendError::Timeout,
                mpsc::error::TrySendError::Closed(_) => ClientSendError::Closed,
            })
    }

    async fn send(&self, msg: ServerMessage) -> Result<(), ClientSendError> {
        if self.is_closed() {
            return Err(ClientSendError::Closed);
        }
        self.outbound
            .send_timeout(msg, self.send_timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => ClientSendError::Timeout,
                mpsc::error::SendTimeoutError::Closed(_) => ClientSendError::Closed,
            })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub skipped: usize,
    pub dropped: usize,
}

/// Clients dashboard actifs et fan-out vers eux.
pub struct ClientRegistry {
    clients: Shared<HashMap<Uuid, Arc<ClientHandle>>>,
    store: Arc<SnapshotStore>,
    send_timeout: Duration,
    queue_capacity: usize,
    closing: AtomicBool,
}

impl ClientRegistry {
    pub fn new(store: Arc<SnapshotStore>, conf: &ClientsConf) -> Self {
        Self {
            clients: new_state(HashMap::new()),
            store,
            send_timeout: conf.send_timeout(),
            queue_capacity: conf.queue_capacity.max(1),
            closing: AtomicBool::new(false),
        }
    }

    /// Crée et enregistre un client. `None` une fois le registre fermé.
    pub fn connect(&self) -> Option<(Arc<ClientHandle>, mpsc::Receiver<ServerMessage>)> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let handle = Arc::new(ClientHandle::new(tx, self.send_timeout));
        if self.register(handle.clone()) {
            Some((handle, rx))
        } else {
            None
        }
    }

    /// Met le snapshot courant (s'il existe) en file pour `client` avant qu'il
    /// soit visible des broadcasts : son premier message data est le plus récent.
    pub fn register(&self, client: Arc<ClientHandle>) -> bool {
        let mut clients = self.clients.lock();
        if self.closing.load(Ordering::Acquire) {
            client.close();
            return false;
        }
        if let Some(snapshot) = self.store.read() {
            if let Err(e) = client.try_push_snapshot(snapshot) {
                debug!(client = %client.id, error = %e, "initial snapshot not queued");
                client.close();
                return false;
            }
        }
        clients.insert(client.id, client.clone());
        info!(client = %client.id, total = clients.len(), "client registered");
        true
    }

    /// Idempotent. Indique si le client était encore enregistré.
    pub fn unregister(&self, id: Uuid) -> bool {
        let removed = self.clients.lock().remove(&id);
        match removed {
            Some(client) => {
                client.close();
                info!(client = %id, "client unregistered");
                true
            }
            None => false,
        }
    }

    pub async fn broadcast(&self, snapshot: Arc<TelemetrySnapshot>) -> BroadcastReport {
        let targets: Vec<Arc<ClientHandle>> = self.clients.lock().values().cloned().collect();
        if targets.is_empty() {
            return BroadcastReport::default();
        }

        let sends = targets.iter().map(|client| {
            let snapshot = snapshot.clone();
            async move { (client, client.push_snapshot(snapshot).await) }
        });

        let mut report = BroadcastReport::default();
        for (client, outcome) in join_all(sends).await {
            match outcome {
                Ok(true) => report.delivered += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    debug!(client = %client.id, error = %e, "dropping client after failed send");
                    self.unregister(client.id);
                    report.dropped += 1;
                }
            }
        }
        report
    }

    /// Ferme tous les clients et refuse les enregistrements suivants.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<ClientHandle>> = {
            let mut clients = self.clients.lock();
            self.closing.store(true, Ordering::Release);
            clients.drain().map(|(_, c)| c).collect()
        };
        for client in &drained {
            client.close();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "closed all clients");
        }
        drained.len()
    }

    pub fn count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SnapshotPatch, Telemetry};
    use serde_json::json;

    fn registry(send_timeout_ms: u64, queue_capacity: usize) -> (ClientRegistry, Arc<SnapshotStore>) {
        let store = Arc::new(SnapshotStore::new());
        let conf = ClientsConf { send_timeout_ms, queue_capacity };
        (ClientRegistry::new(store.clone(), &conf), store)
    }

    fn update(store: &SnapshotStore, temperature: f64) -> Arc<TelemetrySnapshot> {
        let t: Telemetry = serde_json::from_value(json!({ "temperature": temperature })).unwrap();
        store.update(SnapshotPatch::Telemetry(t))
    }

    fn revision_of(msg: ServerMessage) -> u64 {
        match msg {
            ServerMessage::Data(s) => s.revision,
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn new_client_gets_current_snapshot_first() {
        let (registry, store) = registry(100, 8);
        update(&store, 21.0);

        let (_client, mut rx) = registry.connect().unwrap();
        assert_eq!(revision_of(rx.try_recv().unwrap()), 1);
        assert!(rx.try_recv().is_err());

        let snap = update(&store, 22.0);
        registry.broadcast(snap).await;
        assert_eq!(revision_of(rx.try_recv().unwrap()), 2);
    }

    #[tokio::test]
    async fn client_without_data_gets_nothing_on_connect() {
        let (registry, _store) = registry(100, 8);
        let (_client, mut rx) = registry.connect().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn revisions_never_go_backwards() {
        let (registry, store) = registry(100, 8);
        let (_client, mut rx) = registry.connect().unwrap();
        let old = update(&store, 1.0);
        let new = update(&store, 2.0);

        assert_eq!(registry.broadcast(new).await.delivered, 1);
        let report = registry.broadcast(old).await;
        assert_eq!(report.skipped, 1);

        assert_eq!(revision_of(rx.try_recv().unwrap()), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_client_does_not_block_others() {
        let (registry, store) = registry(100, 8);
        let (a, rx_a) = registry.connect().unwrap();
        let (_b, mut rx_b) = registry.connect().unwrap();
        drop(rx_a);

        let report = registry.broadcast(update(&store, 30.0)).await;
        assert_eq!(report, BroadcastReport { delivered: 1, skipped: 0, dropped: 1 });
        assert!(a.is_closed());
        assert_eq!(registry.count(), 1);
        assert_eq!(revision_of(rx_b.try_recv().unwrap()), 1);
    }

    #[tokio::test]
    async fn slow_client_is_dropped_after_send_timeout() {
        let (registry, store) = registry(20, 1);
        let (_slow, _rx_slow) = registry.connect().unwrap();
        let (_fast, mut rx_fast) = registry.connect().unwrap();

        registry.broadcast(update(&store, 1.0)).await;
        rx_fast.try_recv().unwrap();

        // file du client lent (capacité 1) encore pleine
        let report = registry.broadcast(update(&store, 2.0)).await;
        assert_eq!(report.dropped, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let (registry, _store) = registry(100, 8);
        let (client, _rx) = registry.connect().unwrap();
        assert!(registry.unregister(client.id));
        assert!(!registry.unregister(client.id));
        assert!(client.is_closed());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn close_all_refuses_new_clients() {
        let (registry, _store) = registry(100, 8);
        let (a, _rx_a) = registry.connect().unwrap();
        let (b, _rx_b) = registry.connect().unwrap();

        assert_eq!(registry.close_all(), 2);
        assert!(a.is_closed() && b.is_closed());
        assert!(registry.connect().is_none());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn replies_bypass_revision_gate() {
        let (registry, store) = registry(100, 8);
        update(&store, 1.0);
        let (client, mut rx) = registry.connect().unwrap();
        rx.try_recv().unwrap();

        client
            .reply(ServerMessage::Success { topic: "control/relay".into(), value: "ON".into() })
            .await
            .unwrap();
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Success { .. }));
    }
}
