//! Bridge de télémétrie entre un appareil MQTT et plusieurs dashboards WebSocket.

pub mod backoff;
pub mod bridge;
pub mod clients;
pub mod commands;
pub mod config;
pub mod contracts;
pub mod health;
pub mod http;
pub mod ingest;
pub mod models;
pub mod mqtt;
pub mod state;
pub mod ws;

pub use bridge::Bridge;
pub use config::BridgeConfig;
