/**
 * BRIDGE - Possède tous les composants d'une instance du bridge
 *
 * DÉMARRAGE : store vide -> boucle de connexion broker -> broadcaster -> clients.
 * ARRÊT : refus et fermeture des clients -> attente de leurs sessions ->
 * DISCONNECT broker -> arrêt du broadcaster -> attente des tâches (bornée).
 */

use crate::clients::ClientRegistry;
use crate::commands::CommandRouter;
use crate::config::BridgeConfig;
use crate::contracts::TopicRegistry;
use crate::ingest::Ingestor;
use crate::models::TelemetrySnapshot;
use crate::mqtt::{ControlPublisher, LinkState, LinkStatus, UpstreamLink};
use crate::state::SnapshotStore;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TrackedFuture;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub struct Bridge {
    config: BridgeConfig,
    store: Arc<SnapshotStore>,
    ingest: Ingestor,
    clients: Arc<ClientRegistry>,
    router: CommandRouter,
    upstream: Arc<dyn ControlPublisher>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    sessions: TaskTracker,
    started_at: Instant,
}

impl Bridge {
    /// Bridge complet avec un lien broker réel. À appeler dans un runtime tokio.
    pub fn start(config: BridgeConfig) -> Arc<Self> {
        let store = Arc::new(SnapshotStore::new());
        let topics = Arc::new(TopicRegistry::new(&config.topics));
        let ingest = Ingestor::new(store.clone(), topics.clone());
        let link = Arc::new(UpstreamLink::new(
            config.mqtt.clone(),
            config.reconnect.policy(),
            ingest.clone(),
        ));

        let bridge = Arc::new(Self::assemble(config, store, topics, ingest, link.clone()));
        bridge.tasks.spawn(link.run(bridge.shutdown.child_token()));
        bridge.spawn_broadcaster();
        bridge
    }

    /// Bridge autour d'un publisher piloté de l'extérieur (tests, devkit).
    pub fn with_upstream(config: BridgeConfig, upstream: Arc<dyn ControlPublisher>) -> Arc<Self> {
        let store = Arc::new(SnapshotStore::new());
        let topics = Arc::new(TopicRegistry::new(&config.topics));
        let ingest = Ingestor::new(store.clone(), topics.clone());

        let bridge = Arc::new(Self::assemble(config, store, topics, ingest, upstream));
        bridge.spawn_broadcaster();
        bridge
    }

    fn assemble(
        config: BridgeConfig,
        store: Arc<SnapshotStore>,
        topics: Arc<TopicRegistry>,
        ingest: Ingestor,
        upstream: Arc<dyn ControlPublisher>,
    ) -> Self {
        let clients = Arc::new(ClientRegistry::new(store.clone(), &config.clients));
        let router = CommandRouter::new(topics, upstream.clone());
        Self {
            config,
            store,
            ingest,
            clients,
            router,
            upstream,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            sessions: TaskTracker::new(),
            started_at: Instant::now(),
        }
    }

    /// Réveillé à chaque révision du store ; les rafales se réduisent à la dernière.
    fn spawn_broadcaster(&self) {
        let store = self.store.clone();
        let clients = self.clients.clone();
        let shutdown = self.shutdown.child_token();
        let mut revisions = store.subscribe();

        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = revisions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let Some(snapshot) = store.read() else { continue };
                let revision = snapshot.revision;
                let report = clients.broadcast(snapshot).await;
                debug!(
                    revision,
                    delivered = report.delivered,
                    dropped = report.dropped,
                    "snapshot broadcast"
                );
            }
            debug!("broadcaster stopped");
        });
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    pub fn upstream_connected(&self) -> bool {
        self.upstream.link_status().state == LinkState::Connected
    }

    pub fn link_status(&self) -> LinkStatus {
        self.upstream.link_status()
    }

    pub fn client_count(&self) -> usize {
        self.clients.count()
    }

    pub fn latest_snapshot(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.store.read()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Injecte un payload comme s'il arrivait du broker sur `topic`.
    pub fn ingest(&self, topic: &str, payload: &[u8]) -> Option<Arc<TelemetrySnapshot>> {
        self.ingest.handle(topic, payload)
    }

    /// Télémétrie postée en HTTP par un appareil sans accès broker.
    pub fn ingest_telemetry(&self, payload: &[u8]) -> Option<Arc<TelemetrySnapshot>> {
        self.ingest.ingest_telemetry(payload)
    }

    pub fn trigger_reconnect(&self) {
        self.upstream.trigger_reconnect();
    }

    pub fn track_session<F: Future>(&self, session: F) -> TrackedFuture<F> {
        self.sessions.track_future(session)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.clients.is_closing() || self.shutdown.is_cancelled()
    }

    /// Première phase d'arrêt, appelable depuis un handler de signal : refuse
    /// les nouveaux clients et ferme ceux connectés.
    pub fn begin_shutdown(&self) {
        let closed = self.clients.close_all();
        info!(closed, "bridge shutting down");
    }

    pub async fn shutdown(&self) {
        let grace = Duration::from_secs(self.config.http.shutdown_grace_secs);
        self.begin_shutdown();

        self.sessions.close();
        if tokio::time::timeout(grace, self.sessions.wait()).await.is_err() {
            warn!(remaining = self.sessions.len(), "client sessions still open after grace period");
        }

        self.shutdown.cancel();
        self.tasks.close();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            warn!(remaining = self.tasks.len(), "background tasks still running after grace period");
        }
        info!("bridge stopped");
    }
}
