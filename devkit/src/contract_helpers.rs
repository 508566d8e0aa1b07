/*!
Builders de payloads au format du firmware de l'incubateur

Produit le JSON publié par l'appareil sur ses topics télémétrie et statut,
et les frames de contrôle envoyées par un dashboard sur le WebSocket.
*/

use serde_json::{json, Map, Value};

/// Construit un payload de télémétrie champ par champ. Seuls les champs posés
/// sont émis, comme un firmware qui envoie des mises à jour partielles.
#[derive(Debug, Clone, Default)]
pub struct TelemetryBuilder {
    fields: Map<String, Value>,
}

impl TelemetryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message complet tel que le firmware l'envoie à chaque cycle.
    pub fn full_cycle(device_id: &str) -> Self {
        Self::new()
            .device(device_id)
            .timestamp_now()
            .temperature(37.6)
            .sensor("sensor1", 37.5, true, true)
            .sensor("sensor2", 37.7, true, true)
            .relay("ON", "auto")
            .days(4, 21)
            .setpoints(37.2, 37.9)
            .field("weekly_reduce", true)
            .field("mode", "auto")
            .field("start_date", "2026-10-01")
            .field("rssi", -61)
    }

    pub fn device(self, device_id: &str) -> Self {
        self.field("device_id", device_id)
    }

    pub fn timestamp_now(self) -> Self {
        self.field("timestamp", chrono::Utc::now().to_rfc3339())
    }

    pub fn temperature(self, celsius: f64) -> Self {
        self.field("temperature", celsius)
    }

    pub fn sensor(mut self, channel: &str, celsius: f64, valid: bool, active: bool) -> Self {
        let sensors = self
            .fields
            .entry("sensors")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = sensors {
            map.insert(
                channel.to_string(),
                json!({ "temperature": celsius, "valid": valid, "active": active }),
            );
        }
        self
    }

    pub fn relay(self, status: &str, mode: &str) -> Self {
        self.field("relay_status", status).field("relay_mode", mode)
    }

    pub fn days(self, current: u32, total: u32) -> Self {
        self.field("current_day", current).field("total_days", total)
    }

    pub fn setpoints(self, min: f64, max: f64) -> Self {
        self.field("min_temperature", min).field("max_temperature", max)
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.fields).unwrap_or_default()
    }
}

/// Frame `{"type":"control", ...}` telle qu'un dashboard l'envoie.
pub fn control_frame(topic: &str, value: impl Into<Value>) -> Value {
    json!({ "type": "control", "topic": topic, "value": value.into() })
}

/// Payload de statut tel que publié sur le topic status.
pub fn status_payload(state: &str, uptime_secs: u64) -> Value {
    json!({ "state": state, "uptime": uptime_secs })
}
