use crate::backoff::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::Path, time::Duration};
use tokio::fs;
use tracing::{info, warn};

/// Filtre tracing quand `RUST_LOG` est absent.
pub const DEFAULT_LOG_FILTER: &str = "telebridge_kernel=info";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub mqtt: MqttConf,
    pub topics: TopicsConf,
    pub reconnect: ReconnectConf,
    pub clients: ClientsConf,
    pub http: HttpConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// 0 = publish sans accusé, 1 = attente du PUBACK
    pub qos: u8,
    pub publish_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TopicsConf {
    pub base: String,
    pub telemetry: String,
    pub status: String,
    /// Topics relatifs autorisés aux dashboards, ex: `control/relay`.
    pub control: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReconnectConf {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Absent = retry sans fin.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ClientsConf {
    pub send_timeout_ms: u64,
    pub queue_capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
    pub shutdown_grace_secs: u64,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "telebridge".into(),
            keep_alive_secs: 15,
            qos: 1,
            publish_timeout_ms: 5000,
        }
    }
}

impl Default for TopicsConf {
    fn default() -> Self {
        Self {
            base: "incubator".into(),
            telemetry: "data/telemetry".into(),
            status: "status".into(),
            control: [
                "control/relay",
                "control/max_temp",
                "control/min_temp",
                "control/total_days",
                "control/sensor1",
                "control/sensor2",
                "control/weekly_reduce",
                "control/reduce_now",
                "control/mode",
                "control/start_date",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl Default for ReconnectConf {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            max_attempts: policy.max_attempts,
        }
    }
}

impl Default for ClientsConf {
    fn default() -> Self {
        Self { send_timeout_ms: 2000, queue_capacity: 32 }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into(), shutdown_grace_secs: 5 }
    }
}

impl ReconnectConf {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

impl ClientsConf {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl MqttConf {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl BridgeConfig {
    /// Vérifie ce que serde ne peut pas rejeter seul. Une valeur invalide fait
    /// échouer le démarrage ; un fichier illisible retombe sur les défauts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid { field, reason: reason.into() }
        }

        if self.mqtt.host.trim().is_empty() {
            return Err(invalid("mqtt.host", "must not be empty"));
        }
        if self.mqtt.client_id.trim().is_empty() {
            return Err(invalid("mqtt.client_id", "must not be empty"));
        }
        if self.mqtt.qos > 1 {
            return Err(invalid("mqtt.qos", format!("{} is not supported (use 0 or 1)", self.mqtt.qos)));
        }
        if self.mqtt.publish_timeout_ms == 0 {
            return Err(invalid("mqtt.publish_timeout_ms", "must be > 0"));
        }
        if self.topics.telemetry.trim_matches('/').is_empty() {
            return Err(invalid("topics.telemetry", "must not be empty"));
        }
        if self.topics.status.trim_matches('/').is_empty() {
            return Err(invalid("topics.status", "must not be empty"));
        }
        if let Some(bad) = self.topics.control.iter().find(|t| {
            let t = t.trim_matches('/');
            t.is_empty() || t.contains('#') || t.contains('+')
        }) {
            return Err(invalid("topics.control", format!("'{bad}' is not a publishable topic")));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(invalid("reconnect.base_delay_ms", "must be > 0"));
        }
        if !(self.reconnect.multiplier >= 1.0 && self.reconnect.multiplier.is_finite()) {
            return Err(invalid("reconnect.multiplier", "must be a finite number >= 1"));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(invalid("reconnect.max_delay_ms", "must be >= base_delay_ms"));
        }
        if self.clients.send_timeout_ms == 0 {
            return Err(invalid("clients.send_timeout_ms", "must be > 0"));
        }
        if self.clients.queue_capacity == 0 {
            return Err(invalid("clients.queue_capacity", "must be > 0"));
        }
        if self.http.bind.parse::<SocketAddr>().is_err() {
            return Err(invalid("http.bind", format!("'{}' is not a socket address", self.http.bind)));
        }
        Ok(())
    }

    /// Surcharges par variables d'environnement, appliquées après le fichier.
    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("TELEBRIDGE_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Ok(port) = std::env::var("TELEBRIDGE_MQTT_PORT") {
            match port.parse() {
                Ok(p) => self.mqtt.port = p,
                Err(_) => warn!(value = %port, "ignoring invalid TELEBRIDGE_MQTT_PORT"),
            }
        }
        if let Ok(bind) = std::env::var("TELEBRIDGE_BIND") {
            self.http.bind = bind;
        }
    }
}

pub fn parse_config(txt: &str) -> Result<BridgeConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(BridgeConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> BridgeConfig {
    let path = std::env::var("TELEBRIDGE_CONFIG").unwrap_or_else(|_| "bridge.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!(%path, error = %e, "invalid config, using defaults");
            BridgeConfig::default()
        })
    } else {
        info!(%path, "no config file, using defaults");
        BridgeConfig::default()
    };
    cfg.apply_env();
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(BridgeConfig::default().validate(), Ok(()));
    }

    #[test]
    fn default_log_filter_targets_workspace_crates() {
        for directive in DEFAULT_LOG_FILTER.split(',') {
            let target = directive.split('=').next().unwrap_or_default();
            assert!(
                ["telebridge_kernel", "telebridge_devkit"].contains(&target),
                "{target} is not a crate of this workspace"
            );
        }
        assert!(tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = parse_config(
            "mqtt:\n  host: broker.lan\ntopics:\n  base: coop\nreconnect:\n  max_attempts: 10\n",
        )
        .unwrap();

        assert_eq!(cfg.mqtt.host, "broker.lan");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.topics.base, "coop");
        assert_eq!(cfg.topics.telemetry, "data/telemetry");
        assert_eq!(cfg.reconnect.max_attempts, Some(10));
        assert_eq!(cfg.reconnect.base_delay_ms, 3000);
    }

    #[test]
    fn empty_file_is_default() {
        assert_eq!(parse_config("  \n").unwrap(), BridgeConfig::default());
    }

    #[test]
    fn policy_from_conf() {
        let policy = ReconnectConf { max_attempts: Some(5), ..Default::default() }.policy();
        assert_eq!(policy.base_delay, Duration::from_millis(3000));
        assert_eq!(policy.max_attempts, Some(5));
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = BridgeConfig::default();
        cfg.reconnect.multiplier = 0.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { field: "reconnect.multiplier", .. })));

        let mut cfg = BridgeConfig::default();
        cfg.topics.control.push("control/#".into());
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { field: "topics.control", .. })));

        let mut cfg = BridgeConfig::default();
        cfg.http.bind = "not-an-addr".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { field: "http.bind", .. })));

        let mut cfg = BridgeConfig::default();
        cfg.mqtt.qos = 2;
        assert!(cfg.validate().is_err());
    }
}
