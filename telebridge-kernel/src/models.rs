use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Clés propres au snapshot sur le fil, jamais acceptées comme télémétrie libre.
const RESERVED_KEYS: [&str; 4] = ["type", "revision", "received_at", "status"];

macro_rules! merge_fields {
    ($dst:expr, $src:expr, $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field;
            }
        )+
    };
}

pub type StatusMap = BTreeMap<String, Value>;

/// Convertit une valeur de statut en entrées du namespace `status` : un objet
/// est fusionné clé par clé, un scalaire atterrit sous `state`, `null` ne
/// produit rien.
pub fn status_from_value(value: Value) -> Option<StatusMap> {
    match value {
        Value::Null => None,
        Value::Object(map) => Some(map.into_iter().collect()),
        other => Some(StatusMap::from([("state".to_string(), other)])),
    }
}

/// Une sonde de température telle que remontée par l'appareil.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorChannel {
    #[serde(default, alias = "temp", skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// false si la sonde est hors plage ou débranchée
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
    /// on/off basculé depuis un dashboard (`control/sensorN`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

impl SensorChannel {
    fn merge_from(&mut self, patch: SensorChannel) {
        merge_fields!(self, patch, temperature, valid, active);
    }
}

/// Télémétrie de l'appareil. Tous les champs sont optionnels : la même forme
/// sert à l'état fusionné et aux payloads partiels fusionnés dessus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    #[serde(default, alias = "device", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Horloge de l'appareil, transmise telle quelle (epoch ou chaîne).
    #[serde(default, alias = "ts", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    #[serde(default, alias = "temp", skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sensors: BTreeMap<String, SensorChannel>,
    #[serde(default, alias = "relay", skip_serializing_if = "Option::is_none")]
    pub relay_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_mode: Option<String>,
    #[serde(default, alias = "day", skip_serializing_if = "Option::is_none")]
    pub current_day: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_days: Option<u32>,
    #[serde(default, alias = "max_temp", skip_serializing_if = "Option::is_none")]
    pub max_temperature: Option<f64>,
    #[serde(default, alias = "min_temp", skip_serializing_if = "Option::is_none")]
    pub min_temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly_reduce: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    /// Qualité du lien Wi-Fi en dBm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    /// Clés inconnues du bridge, gardées telles quelles pour les dashboards.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Telemetry {
    /// Fusionne un payload partiel : les champs présents dans `patch` gagnent,
    /// les absents gardent leur valeur. Les sondes fusionnent champ par champ.
    pub fn merge_from(&mut self, patch: Telemetry) {
        merge_fields!(
            self,
            patch,
            device_id,
            timestamp,
            temperature,
            relay_status,
            relay_mode,
            current_day,
            total_days,
            max_temperature,
            min_temperature,
            weekly_reduce,
            mode,
            start_date,
            rssi,
        );

        for (name, channel) in patch.sensors {
            self.sensors.entry(name).or_default().merge_from(channel);
        }

        for (key, value) in patch.extra {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            self.extra.insert(key, value);
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Telemetry::default()
    }
}

/// Mise à jour partielle routée vers le store, une variante par namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotPatch {
    Telemetry(Telemetry),
    Status(StatusMap),
}

/// Dernière vue fusionnée de l'appareil. Jamais modifiée une fois publiée :
/// le store installe une nouvelle instance à chaque update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub revision: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(flatten)]
    pub telemetry: Telemetry,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status: StatusMap,
}

impl TelemetrySnapshot {
    /// Construit le successeur de `previous` (ou le premier snapshot) avec `patch` appliqué.
    pub fn next(
        previous: Option<&TelemetrySnapshot>,
        patch: SnapshotPatch,
        received_at: OffsetDateTime,
    ) -> TelemetrySnapshot {
        let mut next = match previous {
            Some(prev) => prev.clone(),
            None => TelemetrySnapshot {
                revision: 0,
                received_at,
                telemetry: Telemetry::default(),
                status: StatusMap::new(),
            },
        };

        match patch {
            SnapshotPatch::Telemetry(mut t) => {
                // `status` dans la télémétrie rejoint le namespace status
                if let Some(status) = t.extra.remove("status").and_then(status_from_value) {
                    next.status.extend(status);
                }
                next.telemetry.merge_from(t);
            }
            SnapshotPatch::Status(s) => next.status.extend(s),
        }

        next.revision += 1;
        next.received_at = received_at;
        next
    }
}
