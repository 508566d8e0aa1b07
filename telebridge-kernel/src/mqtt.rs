/**
 * LIEN BROKER - Connexion MQTT unique du bridge
 *
 * RÔLE : Connexion au broker, abonnement aux topics télémétrie et statut,
 * transmission des payloads entrants à l'ingestor et publication des valeurs
 * de contrôle pour le routeur de commandes.
 *
 * CYCLE : Connecting -> Connected -> (erreur) -> Backoff -> Connecting ...
 * Quand le plafond de tentatives est atteint, le lien reste en Disconnected
 * jusqu'à un appel à `trigger_reconnect`.
 */

use crate::backoff::ReconnectPolicy;
use crate::config::MqttConf;
use crate::contracts::{ErrorKind, TopicRegistry};
use crate::ingest::Ingestor;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter, SubscribeReasonCode,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{oneshot, Notify};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub state: LinkState,
    /// Échecs consécutifs depuis la dernière connexion réussie.
    pub attempt: u32,
    pub reconnects: u32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub since: OffsetDateTime,
    #[serde(skip)]
    ever_connected: bool,
}

impl LinkStatus {
    pub fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
            attempt: 0,
            reconnects: 0,
            last_error: None,
            since: OffsetDateTime::now_utc(),
            ever_connected: false,
        }
    }

    fn enter(&mut self, state: LinkState) {
        self.state = state;
        self.since = OffsetDateTime::now_utc();
    }

    pub fn record_connecting(&mut self) {
        self.enter(LinkState::Connecting);
    }

    pub fn record_connected(&mut self) {
        if self.ever_connected {
            self.reconnects = self.reconnects.saturating_add(1);
        }
        self.ever_connected = true;
        self.attempt = 0;
        self.last_error = None;
        self.enter(LinkState::Connected);
    }

    /// Renvoie le compteur de tentatives mis à jour.
    pub fn record_failure(&mut self, err: &str) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.last_error = Some(err.to_string());
        self.enter(LinkState::Backoff);
        self.attempt
    }

    pub fn record_disconnected(&mut self) {
        self.enter(LinkState::Disconnected);
    }

    /// Relance manuelle après épuisement des tentatives.
    pub fn reset_attempts(&mut self) {
        self.attempt = 0;
    }
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("subscribe request failed: {0}")]
    Subscribe(#[from] rumqttc::ClientError),
    #[error("broker refused subscription to {0}")]
    SubscriptionRefused(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PublishError {
    #[error("upstream link is not connected")]
    NotConnected,
    #[error("publish rejected: {0}")]
    PublishRejected(String),
    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),
}

impl PublishError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PublishError::NotConnected => ErrorKind::NotConnected,
            PublishError::PublishRejected(_) => ErrorKind::PublishRejected,
            PublishError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// Frontière entre le routeur de commandes et ce qui parle au broker.
#[async_trait]
pub trait ControlPublisher: Send + Sync {
    /// `topic` est le topic broker complet.
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), PublishError>;

    fn link_status(&self) -> LinkStatus;

    fn is_connected(&self) -> bool {
        self.link_status().state == LinkState::Connected
    }

    fn trigger_reconnect(&self) {}
}

/// Suivi des accusés QoS 1.
///
/// rumqttc ne renvoie pas le packet id depuis `publish` : les attentes sont
/// mises en file dans l'ordre des requêtes puis liées à un pkid quand la
/// boucle d'événements signale le `Outgoing::Publish` correspondant. Les
/// requêtes passent sous `UpstreamLink::publish_order`, les deux ordres restent identiques.
#[derive(Default)]
struct PendingAcks {
    next_ticket: u64,
    queued: VecDeque<(u64, oneshot::Sender<()>)>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
}

impl PendingAcks {
    fn enqueue(&mut self, tx: oneshot::Sender<()>) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.queued.push_back((ticket, tx));
        ticket
    }

    fn cancel(&mut self, ticket: u64) {
        self.queued.retain(|(t, _)| *t != ticket);
    }

    fn assign(&mut self, pkid: u16) {
        if pkid == 0 {
            return;
        }
        if let Some((_, tx)) = self.queued.pop_front() {
            self.inflight.insert(pkid, tx);
        }
    }

    fn acked(&mut self, pkid: u16) {
        if let Some(tx) = self.inflight.remove(&pkid) {
            // le receveur a peut-être déjà expiré
            let _ = tx.send(());
        }
    }

    /// Lâcher les senders fait échouer chaque attente en `NotConnected`.
    fn fail_all(&mut self) {
        self.queued.clear();
        self.inflight.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }
}

/// Le client ne refuse une requête que pour un topic invalide ou quand la
/// boucle d'événements a disparu, c'est-à-dire quand la session est tombée.
fn publish_failure(topic: &str, err: rumqttc::ClientError) -> PublishError {
    if topic.contains(['+', '#']) {
        PublishError::PublishRejected(format!("invalid topic {topic}: {err}"))
    } else {
        debug!(%topic, error = %err, "request channel closed, session is gone");
        PublishError::NotConnected
    }
}

/// Annule une attente en file si le future de publish est abandonné avant
/// que la requête n'atteigne le client.
struct TicketGuard<'a> {
    pending: &'a Mutex<PendingAcks>,
    ticket: Option<u64>,
}

impl TicketGuard<'_> {
    fn disarm(mut self) {
        self.ticket = None;
    }
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket {
            self.pending.lock().cancel(ticket);
        }
    }
}

pub struct UpstreamLink {
    conf: MqttConf,
    qos: QoS,
    policy: ReconnectPolicy,
    topics: Arc<TopicRegistry>,
    ingest: Ingestor,
    client: RwLock<Option<AsyncClient>>,
    status: Mutex<LinkStatus>,
    pending: Mutex<PendingAcks>,
    publish_order: tokio::sync::Mutex<()>,
    wake: Notify,
}

enum SessionEnd {
    Shutdown,
    Failed(LinkError),
}

impl UpstreamLink {
    pub fn new(conf: MqttConf, policy: ReconnectPolicy, ingest: Ingestor) -> Self {
        let qos = if conf.qos == 0 { QoS::AtMostOnce } else { QoS::AtLeastOnce };
        let topics = Arc::new(ingest.topics().clone());
        Self {
            conf,
            qos,
            policy,
            topics,
            ingest,
            client: RwLock::new(None),
            status: Mutex::new(LinkStatus::new()),
            pending: Mutex::new(PendingAcks::default()),
            publish_order: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
        }
    }

    /// Boucle de connexion. Rend la main quand `shutdown` est annulé, après
    /// un DISCONNECT si la session est active.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            self.status.lock().record_connecting();
            info!(host = %self.conf.host, port = self.conf.port, "connecting to broker");

            let end = self.session(&shutdown).await;
            *self.client.write() = None;
            self.pending.lock().fail_all();

            let err = match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(err) => err,
            };

            let attempt = self.status.lock().record_failure(&err.to_string());
            match self.policy.delay_for(attempt - 1) {
                Some(delay) => {
                    warn!(error = %err, attempt, ?delay, "upstream link down, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.wake.notified() => debug!("backoff cut short by reconnect trigger"),
                    }
                }
                None => {
                    error!(error = %err, attempt, "reconnect attempts exhausted, waiting for trigger");
                    self.status.lock().record_disconnected();
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.wake.notified() => {
                            info!("manual reconnect requested");
                            self.status.lock().reset_attempts();
                        }
                    }
                }
            }
        }

        self.status.lock().record_disconnected();
        info!("upstream link stopped");
    }

    async fn session(&self, shutdown: &CancellationToken) -> SessionEnd {
        let mut opts = MqttOptions::new(&self.conf.client_id, &self.conf.host, self.conf.port);
        opts.set_keep_alive(Duration::from_secs(self.conf.keep_alive_secs.max(5)));
        opts.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);
        *self.client.write() = Some(client.clone());

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    if self.is_connected() {
                        let _ = client.try_disconnect();
                        // un poll de plus envoie le DISCONNECT
                        let _ = tokio::time::timeout(Duration::from_millis(500), eventloop.poll()).await;
                    }
                    return SessionEnd::Shutdown;
                }
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    let filters = self
                        .topics
                        .subscriptions()
                        .map(|t| SubscribeFilter::new(t.to_string(), QoS::AtLeastOnce));
                    if let Err(e) = client.try_subscribe_many(filters) {
                        return SessionEnd::Failed(e.into());
                    }
                    debug!("connack received, subscribing");
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let refused = ack
                        .return_codes
                        .iter()
                        .zip(self.topics.subscriptions())
                        .find(|(code, _)| matches!(code, SubscribeReasonCode::Failure));
                    if let Some((_, topic)) = refused {
                        return SessionEnd::Failed(LinkError::SubscriptionRefused(topic.to_string()));
                    }
                    self.status.lock().record_connected();
                    info!(topics = ?self.topics.subscriptions(), "upstream link connected");
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    self.ingest.handle(&p.topic, &p.payload);
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => self.pending.lock().acked(ack.pkid),
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    if self.qos == QoS::AtLeastOnce {
                        self.pending.lock().assign(pkid);
                    }
                }
                Ok(_) => {}
                Err(e) => return SessionEnd::Failed(e.into()),
            }
        }
    }
}

#[async_trait]
impl ControlPublisher for UpstreamLink {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        let deadline = Instant::now() + self.conf.publish_timeout();
        let timeout = self.conf.publish_timeout();

        let ack = {
            let _order = timeout_at(deadline, self.publish_order.lock())
                .await
                .map_err(|_| PublishError::Timeout(timeout))?;
            let client = self.client.read().clone().ok_or(PublishError::NotConnected)?;

            let (tx, rx) = oneshot::channel();
            let guard = (self.qos == QoS::AtLeastOnce).then(|| TicketGuard {
                pending: &self.pending,
                ticket: Some(self.pending.lock().enqueue(tx)),
            });

            match timeout_at(deadline, client.publish(topic, self.qos, false, payload.as_bytes().to_vec())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(publish_failure(topic, e)),
                Err(_) => return Err(PublishError::Timeout(timeout)),
            }
            match guard {
                Some(guard) => {
                    guard.disarm();
                    rx
                }
                None => return Ok(()),
            }
        };

        match timeout_at(deadline, ack).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PublishError::NotConnected),
            Err(_) => Err(PublishError::Timeout(timeout)),
        }
    }

    fn link_status(&self) -> LinkStatus {
        self.status.lock().clone()
    }

    fn trigger_reconnect(&self) {
        let state = self.status.lock().state;
        if matches!(state, LinkState::Backoff | LinkState::Disconnected) {
            self.wake.notify_one();
        } else {
            debug!(?state, "reconnect trigger ignored");
        }
    }
}
