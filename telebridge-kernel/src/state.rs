use crate::models::{SnapshotPatch, TelemetrySnapshot};
use parking_lot::Mutex;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Détient le dernier snapshot, et lui seul.
///
/// Les écrivains fusionnent dans une section critique courte et publient un
/// nouvel `Arc` ; les lecteurs clonent l'`Arc` et ne voient jamais une fusion
/// à moitié appliquée. Chaque révision publiée passe par un canal watch pour
/// réveiller le broadcaster une fois par changement (les rafales sont fusionnées).
pub struct SnapshotStore {
    current: Mutex<Option<Arc<TelemetrySnapshot>>>,
    revisions: watch::Sender<u64>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        let (revisions, _) = watch::channel(0);
        Self {
            current: Mutex::new(None),
            revisions,
        }
    }

    /// `None` tant que l'appareil n'a rien envoyé.
    pub fn read(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.current.lock().clone()
    }

    pub fn update(&self, patch: SnapshotPatch) -> Arc<TelemetrySnapshot> {
        let mut current = self.current.lock();
        let next = Arc::new(TelemetrySnapshot::next(
            current.as_deref(),
            patch,
            OffsetDateTime::now_utc(),
        ));
        *current = Some(next.clone());
        // publié sous le verrou : la révision du watch ne recule jamais
        self.revisions.send_replace(next.revision);
        next
    }

    pub fn revision(&self) -> u64 {
        *self.revisions.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revisions.subscribe()
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Telemetry;
    use serde_json::json;

    fn patch(value: serde_json::Value) -> SnapshotPatch {
        SnapshotPatch::Telemetry(serde_json::from_value::<Telemetry>(value).unwrap())
    }

    #[test]
    fn empty_store_has_no_data() {
        let store = SnapshotStore::new();
        assert!(store.read().is_none());
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn update_publishes_new_instance() {
        let store = SnapshotStore::new();
        let first = store.update(patch(json!({"temperature": 20.0})));
        let second = store.update(patch(json!({"relay_status": "ON"})));

        assert_eq!(first.telemetry.relay_status, None);
        assert_eq!(second.telemetry.temperature, Some(20.0));
        assert_eq!(second.telemetry.relay_status.as_deref(), Some("ON"));
        assert_eq!(store.read().unwrap().revision, 2);
        assert_eq!(store.revision(), 2);
    }

    #[tokio::test]
    async fn subscribers_see_latest_revision() {
        let store = SnapshotStore::new();
        let mut rx = store.subscribe();
        store.update(patch(json!({"temperature": 1.0})));
        store.update(patch(json!({"temperature": 2.0})));

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 2);
    }

    #[test]
    fn concurrent_reads_never_observe_torn_updates() {
        // Chaque écrivain pose temperature et current_day à la même valeur en
        // un seul update ; un lecteur doit toujours les voir égaux.
        let store = Arc::new(SnapshotStore::new());
        store.update(patch(json!({"temperature": 0.0, "current_day": 0})));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        let v = w * 1000 + i;
                        store.update(patch(json!({"temperature": v as f64, "current_day": v})));
                    }
                })
            })
            .collect();

        let reader = {
            let store = store.clone();
            std::thread::spawn(move || {
                let mut last_revision = 0;
                let mut last_watched = 0;
                for _ in 0..5000 {
                    let snap = store.read().unwrap();
                    assert_eq!(snap.telemetry.temperature, snap.telemetry.current_day.map(f64::from));
                    assert!(snap.revision >= last_revision);
                    let watched = store.revision();
                    assert!(watched >= snap.revision);
                    assert!(watched >= last_watched);
                    last_revision = snap.revision;
                    last_watched = watched;
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(store.read().unwrap().revision, 2001);
        assert_eq!(store.revision(), 2001);
    }
}
