use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Calendrier de reconnexion du lien broker.
///
/// `attempt` compte les échecs consécutifs déjà enregistrés : le premier
/// retry attend `base_delay`, le suivant `base_delay * multiplier`, jusqu'à
/// `max_delay`. Avec `max_attempts = None` le lien réessaie indéfiniment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(3000),
            multiplier: 1.5,
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Délai avant le retry après `attempt` échecs consécutifs, ou `None`
    /// une fois le plafond de tentatives atteint.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return None;
            }
        }

        // powi sature à inf pour les grands exposants, min() plafonne
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }
}
