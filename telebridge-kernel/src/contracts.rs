//! Contrats de transport : topics côté broker et messages WebSocket côté dashboards.

use crate::config::TopicsConf;
use crate::models::TelemetrySnapshot;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Namespace du store alimenté par un message entrant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Telemetry,
    Status,
}

/// Topics figés d'un appareil : deux abonnements plus l'allow-list de contrôle.
#[derive(Debug, Clone)]
pub struct TopicRegistry {
    telemetry: String,
    status: String,
    base: String,
    control: BTreeSet<String>, // noms relatifs, tels qu'envoyés par les dashboards
}

impl TopicRegistry {
    pub fn new(conf: &TopicsConf) -> Self {
        Self {
            telemetry: join_topic(&conf.base, &conf.telemetry),
            status: join_topic(&conf.base, &conf.status),
            base: conf.base.trim_matches('/').to_string(),
            control: conf
                .control
                .iter()
                .map(|t| t.trim_matches('/').to_string())
                .collect(),
        }
    }

    pub fn telemetry_topic(&self) -> &str {
        &self.telemetry
    }

    pub fn status_topic(&self) -> &str {
        &self.status
    }

    /// Topics à souscrire, dans l'ordre d'abonnement.
    pub fn subscriptions(&self) -> [&str; 2] {
        [self.telemetry.as_str(), self.status.as_str()]
    }

    pub fn classify(&self, topic: &str) -> Option<InboundKind> {
        if topic == self.telemetry {
            Some(InboundKind::Telemetry)
        } else if topic == self.status {
            Some(InboundKind::Status)
        } else {
            None
        }
    }

    pub fn is_allowed(&self, topic: &str) -> bool {
        self.control.contains(topic)
    }

    /// Topic broker complet d'un topic de contrôle autorisé.
    pub fn upstream_topic(&self, topic: &str) -> String {
        join_topic(&self.base, topic)
    }

    pub fn list_control(&self) -> Vec<String> {
        self.control.iter().cloned().collect()
    }
}

/// Joint une base et un topic relatif sans slash doublé ni pendant.
/// Ex: ("incubator/", "/control/relay") -> "incubator/control/relay"
pub fn join_topic(base: &str, topic: &str) -> String {
    let base = base.trim_matches('/');
    let topic = topic.trim_matches('/');
    if base.is_empty() {
        topic.to_string()
    } else {
        format!("{base}/{topic}")
    }
}

/// Demande de contrôle envoyée par un dashboard.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControlCommand {
    pub topic: String,
    #[serde(deserialize_with = "value_as_string")]
    pub value: String,
}

/// Messages client -> bridge.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Control(ControlCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownTopic,
    NotConnected,
    PublishRejected,
    Timeout,
    InvalidMessage,
}

/// Messages bridge -> client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Data(Arc<TelemetrySnapshot>),
    Success {
        topic: String,
        value: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>, topic: Option<String>) -> Self {
        ServerMessage::Error { kind, message: message.into(), topic }
    }
}

/// Les dashboards envoient nombres et booléens en JSON ; le broker reçoit du texte.
fn value_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(de::Error::custom(format!("unsupported control value: {other}"))),
    }
}
