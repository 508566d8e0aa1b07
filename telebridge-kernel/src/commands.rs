use crate::clients::{ClientHandle, ClientSendError};
use crate::contracts::{ControlCommand, ErrorKind, ServerMessage, TopicRegistry};
use crate::mqtt::ControlPublisher;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Valide les commandes des dashboards contre l'allow-list et les relaie
/// vers le broker. Le résultat ne revient qu'à l'émetteur.
#[derive(Clone)]
pub struct CommandRouter {
    topics: Arc<TopicRegistry>,
    upstream: Arc<dyn ControlPublisher>,
}

impl CommandRouter {
    pub fn new(topics: Arc<TopicRegistry>, upstream: Arc<dyn ControlPublisher>) -> Self {
        Self { topics, upstream }
    }

    pub async fn dispatch(&self, cmd: ControlCommand) -> ServerMessage {
        if !self.topics.is_allowed(&cmd.topic) {
            warn!(topic = %cmd.topic, "rejected control command on unknown topic");
            return ServerMessage::error(
                ErrorKind::UnknownTopic,
                format!("topic '{}' is not controllable", cmd.topic),
                Some(cmd.topic),
            );
        }
        if !self.upstream.is_connected() {
            return ServerMessage::error(ErrorKind::NotConnected, "upstream link is down", Some(cmd.topic));
        }

        let full = self.topics.upstream_topic(&cmd.topic);
        match self.upstream.publish(&full, &cmd.value).await {
            Ok(()) => {
                info!(topic = %full, value = %cmd.value, "control command relayed");
                ServerMessage::Success { topic: cmd.topic, value: cmd.value }
            }
            Err(e) => {
                warn!(topic = %full, error = %e, "control command failed");
                ServerMessage::error(e.kind(), e.to_string(), Some(cmd.topic))
            }
        }
    }

    pub async fn handle(&self, client: &ClientHandle, cmd: ControlCommand) -> Result<(), ClientSendError> {
        debug!(client = %client.id, topic = %cmd.topic, "control command received");
        let outcome = self.dispatch(cmd).await;
        client.reply(outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicsConf;
    use crate::mqtt::{LinkState, LinkStatus, PublishError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        connected: bool,
        fail_with: Option<PublishError>,
        published: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ControlPublisher for Recorder {
        async fn publish(&self, topic: &str, payload: &str) -> Result<(), PublishError> {
            self.published.lock().push((topic.into(), payload.into()));
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        fn link_status(&self) -> LinkStatus {
            let mut status = LinkStatus::new();
            if self.connected {
                status.record_connected();
            }
            status
        }
    }

    fn router(upstream: Arc<Recorder>) -> CommandRouter {
        CommandRouter::new(Arc::new(TopicRegistry::new(&TopicsConf::default())), upstream)
    }

    fn cmd(topic: &str, value: &str) -> ControlCommand {
        ControlCommand { topic: topic.into(), value: value.into() }
    }

    fn kind_of(msg: &ServerMessage) -> Option<ErrorKind> {
        match msg {
            ServerMessage::Error { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    #[tokio::test]
    async fn allowed_topic_is_published_once() {
        let upstream = Arc::new(Recorder { connected: true, ..Default::default() });
        let out = router(upstream.clone()).dispatch(cmd("control/max_temp", "25")).await;

        assert!(matches!(out, ServerMessage::Success { ref topic, ref value } if topic == "control/max_temp" && value == "25"));
        assert_eq!(
            *upstream.published.lock(),
            vec![("incubator/control/max_temp".to_string(), "25".to_string())]
        );
    }

    #[tokio::test]
    async fn unknown_topic_never_reaches_upstream() {
        let upstream = Arc::new(Recorder { connected: true, ..Default::default() });
        let out = router(upstream.clone()).dispatch(cmd("not/allowed", "1")).await;

        assert_eq!(kind_of(&out), Some(ErrorKind::UnknownTopic));
        assert!(upstream.published.lock().is_empty());
    }

    #[tokio::test]
    async fn disconnected_link_skips_publish() {
        let upstream = Arc::new(Recorder::default());
        assert_eq!(upstream.link_status().state, LinkState::Disconnected);

        let r = router(upstream.clone());
        for topic in TopicsConf::default().control {
            let out = r.dispatch(cmd(&topic, "1")).await;
            assert_eq!(kind_of(&out), Some(ErrorKind::NotConnected));
        }
        assert!(upstream.published.lock().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_kind_is_reported() {
        let upstream = Arc::new(Recorder {
            connected: true,
            fail_with: Some(PublishError::Timeout(Duration::from_secs(5))),
            ..Default::default()
        });
        let out = router(upstream).dispatch(cmd("control/relay", "ON")).await;
        assert_eq!(kind_of(&out), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn outcome_goes_to_the_sender() {
        let upstream = Arc::new(Recorder { connected: true, ..Default::default() });
        let (tx, mut rx) = mpsc::channel(4);
        let client = ClientHandle::new(tx, Duration::from_millis(100));

        router(upstream).handle(&client, cmd("control/relay", "OFF")).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Success { .. }));
    }
}
