use crate::bridge::Bridge;
use crate::mqtt::LinkStatus;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Serialize)]
pub struct BridgeHealth {
    pub uptime_seconds: u64,
    pub upstream: LinkStatus,
    pub clients_connected: usize,
    pub snapshot_revision: u64,
    pub last_update: Option<String>,
    pub memory_usage_mb: f32,
}

impl BridgeHealth {
    pub fn collect(bridge: &Bridge) -> Self {
        let snapshot = bridge.latest_snapshot();
        BridgeHealth {
            uptime_seconds: bridge.uptime().as_secs(),
            upstream: bridge.link_status(),
            clients_connected: bridge.client_count(),
            snapshot_revision: snapshot.as_ref().map(|s| s.revision).unwrap_or(0),
            last_update: snapshot.and_then(|s| s.received_at.format(&Rfc3339).ok()),
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let kb = status
                .lines()
                .find(|l| l.starts_with("VmRSS:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse::<u64>().ok());
            if let Some(kb) = kb {
                return kb as f32 / 1024.0;
            }
        }
    }

    // plateforme inconnue
    0.0
}
