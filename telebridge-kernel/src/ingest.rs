use crate::contracts::{InboundKind, TopicRegistry};
use crate::models::{status_from_value, SnapshotPatch, StatusMap, Telemetry, TelemetrySnapshot};
use crate::state::SnapshotStore;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("payload is not UTF-8")]
    NotUtf8,
    #[error("payload is empty")]
    Empty,
    #[error("invalid telemetry JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn parse_telemetry(payload: &[u8]) -> Result<Telemetry, ParseError> {
    let txt = std::str::from_utf8(payload).map_err(|_| ParseError::NotUtf8)?;
    if txt.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(serde_json::from_str(txt)?)
}

/// Un statut est en général un objet JSON ; le reste (`online` brut,
/// `"offline"`, `1`) atterrit sous la clé `state`.
pub fn parse_status(payload: &[u8]) -> Result<StatusMap, ParseError> {
    let txt = std::str::from_utf8(payload).map_err(|_| ParseError::NotUtf8)?;
    let txt = txt.trim();
    if txt.is_empty() {
        return Err(ParseError::Empty);
    }

    match serde_json::from_str::<Value>(txt) {
        Ok(value) => status_from_value(value).ok_or(ParseError::Empty),
        Err(_) => Ok(StatusMap::from([("state".to_string(), Value::String(txt.to_string()))])),
    }
}

/// Route les payloads entrants vers le store. Partagé par le lien MQTT et le
/// fallback HTTP ; les erreurs de parsing sont loggées ici, jamais propagées.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<SnapshotStore>,
    topics: Arc<TopicRegistry>,
}

impl Ingestor {
    pub fn new(store: Arc<SnapshotStore>, topics: Arc<TopicRegistry>) -> Self {
        Self { store, topics }
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.topics
    }

    /// Renvoie le snapshot publié, ou `None` si le message est ignoré
    /// (topic inconnu, payload invalide ou vide).
    pub fn handle(&self, topic: &str, payload: &[u8]) -> Option<Arc<TelemetrySnapshot>> {
        match self.topics.classify(topic) {
            Some(InboundKind::Telemetry) => self.ingest_telemetry(payload),
            Some(InboundKind::Status) => match parse_status(payload) {
                Ok(status) => Some(self.store.update(SnapshotPatch::Status(status))),
                Err(e) => {
                    warn!(%topic, error = %e, "discarding status payload");
                    None
                }
            },
            None => {
                debug!(%topic, "ignoring message on unsubscribed topic");
                None
            }
        }
    }

    pub fn ingest_telemetry(&self, payload: &[u8]) -> Option<Arc<TelemetrySnapshot>> {
        match parse_telemetry(payload) {
            Ok(t) if t.is_empty() => {
                debug!("telemetry payload carried no fields");
                None
            }
            Ok(t) => Some(self.store.update(SnapshotPatch::Telemetry(t))),
            Err(e) => {
                warn!(error = %e, payload = %String::from_utf8_lossy(payload), "discarding telemetry payload");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicsConf;
    use serde_json::json;

    fn ingestor() -> (Ingestor, Arc<SnapshotStore>) {
        let store = Arc::new(SnapshotStore::new());
        let topics = Arc::new(TopicRegistry::new(&TopicsConf::default()));
        (Ingestor::new(store.clone(), topics), store)
    }

    #[test]
    fn telemetry_updates_store() {
        let (ingest, store) = ingestor();
        let snap = ingest
            .handle("incubator/data/telemetry", br#"{"temperature": 32.5, "relay_status":"ON"}"#)
            .unwrap();

        assert_eq!(snap.telemetry.temperature, Some(32.5));
        assert_eq!(store.read().unwrap().telemetry.relay_status.as_deref(), Some("ON"));
    }

    #[test]
    fn malformed_telemetry_is_discarded() {
        let (ingest, store) = ingestor();
        ingest.handle("incubator/data/telemetry", br#"{"temperature": 20.0}"#);

        assert!(ingest.handle("incubator/data/telemetry", b"{not json").is_none());
        assert!(ingest.handle("incubator/data/telemetry", br#"{"temperature": "hot"}"#).is_none());
        assert!(ingest.handle("incubator/data/telemetry", &[0xff, 0xfe]).is_none());
        assert!(ingest.handle("incubator/data/telemetry", b"   ").is_none());

        let snap = store.read().unwrap();
        assert_eq!(snap.revision, 1);
        assert_eq!(snap.telemetry.temperature, Some(20.0));
    }

    #[test]
    fn status_goes_to_its_namespace() {
        let (ingest, store) = ingestor();
        ingest.handle("incubator/data/telemetry", br#"{"mode": "auto"}"#);
        ingest.handle("incubator/status", br#"{"mode": "ota", "uptime": 42}"#);

        let snap = store.read().unwrap();
        assert_eq!(snap.telemetry.mode.as_deref(), Some("auto"));
        assert_eq!(snap.status.get("mode"), Some(&json!("ota")));
        assert_eq!(snap.status.get("uptime"), Some(&json!(42)));
    }

    #[test]
    fn plain_text_status_becomes_state() {
        assert_eq!(parse_status(b"online").unwrap().get("state"), Some(&json!("online")));
        assert_eq!(parse_status(b"\"offline\"").unwrap().get("state"), Some(&json!("offline")));
        assert!(matches!(parse_status(b"null"), Err(ParseError::Empty)));
    }

    #[test]
    fn status_inside_telemetry_is_kept() {
        let (ingest, store) = ingestor();
        let snap = ingest
            .ingest_telemetry(br#"{"device":"esp32","temp":25,"status":"heating"}"#)
            .unwrap();

        assert_eq!(snap.telemetry.device_id.as_deref(), Some("esp32"));
        assert_eq!(snap.telemetry.temperature, Some(25.0));
        assert_eq!(snap.status.get("state"), Some(&json!("heating")));

        let v = serde_json::to_value(store.read().unwrap().as_ref()).unwrap();
        assert_eq!(v["status"]["state"], "heating");
    }

    #[test]
    fn other_topics_are_ignored() {
        let (ingest, store) = ingestor();
        assert!(ingest.handle("incubator/control/relay", b"ON").is_none());
        assert!(store.read().is_none());
    }

    #[test]
    fn empty_object_does_not_bump_revision() {
        let (ingest, store) = ingestor();
        assert!(ingest.ingest_telemetry(b"{}").is_none());
        assert_eq!(store.revision(), 0);
    }
}
