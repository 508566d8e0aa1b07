/*!
Harness de test avec un vrai bridge

Démarre le routeur HTTP/WebSocket du kernel sur 127.0.0.1:0 avec un
`MockUpstream` à la place du lien broker, et connecte des dashboards
via tokio-tungstenite.
*/

use crate::contract_helpers::control_frame;
use crate::mqtt_stub::MockUpstream;
use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use telebridge_kernel::contracts::join_topic;
use telebridge_kernel::http::{build_router, AppState};
use telebridge_kernel::{Bridge, BridgeConfig};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub struct TestHarness {
    pub bridge: Arc<Bridge>,
    pub upstream: MockUpstream,
    pub addr: SocketAddr,
    server: JoinHandle<()>,
}

impl TestHarness {
    pub async fn start() -> Result<Self> {
        Self::start_with(BridgeConfig::default(), MockUpstream::new()).await
    }

    pub async fn start_with(config: BridgeConfig, upstream: MockUpstream) -> Result<Self> {
        env_logger::try_init().ok();

        let bridge = Bridge::with_upstream(config, Arc::new(upstream.clone()));
        let app = build_router(AppState { bridge: bridge.clone() });
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let signal_bridge = bridge.clone();
        let server = tokio::spawn(async move {
            let stopped = async move {
                while !signal_bridge.is_shutting_down() {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stopped).await {
                log::warn!("harness server stopped: {e}");
            }
        });
        log::info!("harness bridge listening on {addr}");

        Ok(Self { bridge, upstream, addr, server })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn connect_client(&self) -> Result<DashboardClient> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.ws_url())
            .await
            .context("websocket handshake failed")?;
        Ok(DashboardClient { ws })
    }

    /// Télémétrie comme si l'appareil la publiait sur `{base}/{telemetry}`.
    pub fn publish_telemetry(&self, payload: &Value) -> Result<u64> {
        let topics = &self.bridge.config().topics;
        let topic = join_topic(&topics.base, &topics.telemetry);
        let bytes = serde_json::to_vec(payload)?;
        self.bridge
            .ingest(&topic, &bytes)
            .map(|s| s.revision)
            .ok_or_else(|| anyhow!("payload was not accepted: {payload}"))
    }

    pub fn publish_status(&self, payload: &[u8]) -> Result<u64> {
        let topics = &self.bridge.config().topics;
        let topic = join_topic(&topics.base, &topics.status);
        self.bridge
            .ingest(&topic, payload)
            .map(|s| s.revision)
            .ok_or_else(|| anyhow!("status payload was not accepted"))
    }

    /// Attend que le registre contienne `count` clients.
    pub async fn wait_for_clients(&self, count: usize) -> Result<()> {
        let waited = timeout(RECV_TIMEOUT, async {
            while self.bridge.client_count() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if waited.is_err() {
            bail!("expected {count} clients, have {}", self.bridge.client_count());
        }
        Ok(())
    }

    pub async fn shutdown(self) -> Result<()> {
        self.bridge.shutdown().await;
        timeout(RECV_TIMEOUT, self.server)
            .await
            .context("http server did not stop")??;
        Ok(())
    }
}

/// Dashboard connecté en WebSocket.
pub struct DashboardClient {
    ws: WsStream,
}

impl DashboardClient {
    /// Prochain message JSON, ping/pong ignorés. Erreur sur fermeture ou timeout.
    pub async fn next_message(&mut self) -> Result<Value> {
        loop {
            let frame = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .map_err(|_| anyhow!("no message within {RECV_TIMEOUT:?}"))?;
            match frame {
                Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(text.as_str())?),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => bail!("closed by bridge: {frame:?}"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => bail!("stream ended"),
            }
        }
    }

    /// Prochain message du `type` donné, les autres sont jetés.
    pub async fn next_of_type(&mut self, kind: &str) -> Result<Value> {
        loop {
            let msg = self.next_message().await?;
            if msg["type"] == kind {
                return Ok(msg);
            }
        }
    }

    /// Vérifie que rien n'arrive pendant `window`.
    pub async fn expect_silence(&mut self, window: Duration) -> Result<()> {
        match timeout(window, self.ws.next()).await {
            Err(_) => Ok(()),
            Ok(Some(Ok(Message::Text(text)))) => bail!("unexpected message: {}", text.as_str()),
            Ok(other) => bail!("unexpected frame: {other:?}"),
        }
    }

    pub async fn send_json(&mut self, value: &Value) -> Result<()> {
        self.ws.send(Message::Text(value.to_string().into())).await?;
        Ok(())
    }

    pub async fn send_raw(&mut self, text: &str) -> Result<()> {
        self.ws.send(Message::Text(text.to_string().into())).await?;
        Ok(())
    }

    pub async fn send_control(&mut self, topic: &str, value: impl Into<Value>) -> Result<()> {
        self.send_json(&control_frame(topic, value)).await
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}
