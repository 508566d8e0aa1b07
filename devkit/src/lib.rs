/*!
# Telebridge DevKit - Mocks et harness pour développer le bridge

Bibliothèque pour développer et tester le bridge sans broker :
- `MockUpstream` : enregistre les publish de contrôle, état du lien réglé à la main
- `TelemetryBuilder` : payloads de télémétrie au format de l'appareil
- `TestHarness` : un vrai bridge sur port éphémère plus des dashboards WebSocket
*/

pub mod mqtt_stub;
pub mod contract_helpers;
pub mod test_utils;

pub use mqtt_stub::{MockUpstream, PublishedMessage};
pub use contract_helpers::TelemetryBuilder;
pub use test_utils::{DashboardClient, TestHarness};
