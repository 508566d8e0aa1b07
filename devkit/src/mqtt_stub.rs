/*!
Mock du lien broker pour développer sans broker

Remplace le lien MQTT du bridge : enregistre chaque publish de contrôle et
laisse les tests choisir l'état du lien et l'issue des publish.
*/

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telebridge_kernel::mqtt::{ControlPublisher, LinkState, LinkStatus, PublishError};

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug)]
struct MockState {
    status: LinkStatus,
    fail_with: Option<PublishError>,
    delay: Duration,
    published: Vec<PublishedMessage>,
    reconnect_triggers: usize,
}

/// Implémentation mock du `ControlPublisher` du bridge
#[derive(Clone)]
pub struct MockUpstream {
    inner: Arc<Mutex<MockState>>,
}

impl MockUpstream {
    /// Démarre connecté.
    pub fn new() -> Self {
        let mock = Self {
            inner: Arc::new(Mutex::new(MockState {
                status: LinkStatus::new(),
                fail_with: None,
                delay: Duration::ZERO,
                published: Vec::new(),
                reconnect_triggers: 0,
            })),
        };
        mock.set_connected(true);
        mock
    }

    pub fn disconnected() -> Self {
        let mock = Self::new();
        mock.set_connected(false);
        mock
    }

    pub fn set_connected(&self, connected: bool) {
        let mut state = self.inner.lock().unwrap();
        if connected {
            state.status.record_connected();
        } else {
            state.status.record_failure("connection lost");
            state.status.record_disconnected();
        }
        log::info!("[MOCK] upstream link {}", if connected { "up" } else { "down" });
    }

    /// Chaque publish suivant échoue avec `err` (`None` rétablit le succès).
    pub fn fail_publishes_with(&self, err: Option<PublishError>) {
        self.inner.lock().unwrap().fail_with = err;
    }

    /// Aller-retour broker simulé avant chaque publish.
    pub fn set_publish_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().delay = delay;
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.lock().unwrap().published.clone()
    }

    pub fn find_by_topic(&self, topic: &str) -> Vec<PublishedMessage> {
        self.inner
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Dernier payload sur `topic` parsé en JSON, s'il existe.
    pub fn last_json(&self, topic: &str) -> anyhow::Result<Option<Value>> {
        match self.find_by_topic(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_str(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn reconnect_triggers(&self) -> usize {
        self.inner.lock().unwrap().reconnect_triggers
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().published.clear();
    }
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlPublisher for MockUpstream {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), PublishError> {
        let delay = {
            let mut state = self.inner.lock().unwrap();
            if state.status.state != LinkState::Connected {
                return Err(PublishError::NotConnected);
            }
            state.published.push(PublishedMessage { topic: topic.into(), payload: payload.into() });
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        log::info!("[MOCK] published to {}: {}", topic, payload);

        match self.inner.lock().unwrap().fail_with.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn link_status(&self) -> LinkStatus {
        self.inner.lock().unwrap().status.clone()
    }

    fn trigger_reconnect(&self) {
        let mut state = self.inner.lock().unwrap();
        state.reconnect_triggers += 1;
        if state.status.state != LinkState::Connected {
            state.status.record_connected();
        }
    }
}
