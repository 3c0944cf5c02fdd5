use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::engine::{Configured, RelayStatus, TemperatureAlertRelay};
use super::error::RelayError;
use crate::mqtt::LinkEvent;

/// Runs the relay in a tokio task and stops it on request
#[derive(Debug)]
pub struct RelayHandle {
    task_handle: Option<JoinHandle<RelayStatus>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl RelayHandle {
    /// Activates the relay and spawns its event loop on `events`
    pub fn start(relay: TemperatureAlertRelay<Configured>, events: mpsc::Receiver<LinkEvent>) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let topic = relay.settings().actuator_topic.clone();
        let running = relay.activate();

        let task_handle = tokio::spawn(async move {
            let stopping = running.run_until_shutdown(events, shutdown_rx).await;
            stopping.shutdown().into_status()
        });

        info!("Relay task started, classifications go to {}", topic);
        Self {
            task_handle: Some(task_handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(true)
    }

    /// Signals shutdown and waits for the relay to disconnect its actuator
    pub async fn shutdown(&mut self) -> Result<RelayStatus, RelayError> {
        debug!("Sending shutdown signal to relay");

        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                warn!("Relay task already terminated");
            }
        }

        match self.task_handle.take() {
            Some(handle) => handle.await.map_err(|e| {
                error!("Relay task panicked: {}", e);
                RelayError::Task(format!("Relay task panicked: {}", e))
            }),
            None => {
                debug!("Relay already shut down");
                Err(RelayError::Task("relay already shut down".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{DecisionContext, DecisionError};
    use crate::mqtt::MQTTMessage;
    use crate::relay::engine::RelaySettings;
    use crate::relay::testing::RecordingSink;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn always_alert(_: &DecisionContext) -> Result<DecisionContext, DecisionError> {
        Ok(DecisionContext::from([(
            "warningState".to_string(),
            json!("ALERT"),
        )]))
    }

    #[tokio::test]
    async fn shutdown_returns_status_and_disconnects_once() {
        let sink = Arc::new(RecordingSink::connected());
        let relay = TemperatureAlertRelay::configure(
            Arc::new(always_alert),
            sink.clone(),
            RelaySettings::default(),
        );
        let (events_tx, events_rx) = mpsc::channel(4);
        let mut handle = RelayHandle::start(relay, events_rx);

        events_tx
            .send(LinkEvent::Message(MQTTMessage::from_topic(
                "tunnelofen/data".to_string(),
                r#"{"currentTemp": 85}"#,
            )))
            .await
            .unwrap();

        // let the relay drain the channel before stopping it
        for _ in 0..100 {
            if !sink.published().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let status = handle.shutdown().await.unwrap();
        assert_eq!(status.messages_published, 1);
        assert_eq!(sink.disconnects(), 1);
        assert!(handle.is_finished());
        assert!(handle.shutdown().await.is_err());
        assert_eq!(sink.disconnects(), 1);
    }

    #[tokio::test]
    async fn closed_ingest_channel_stops_the_relay() {
        let sink = Arc::new(RecordingSink::connected());
        let relay = TemperatureAlertRelay::configure(
            Arc::new(always_alert),
            sink.clone(),
            RelaySettings::default(),
        );
        let (events_tx, events_rx) = mpsc::channel(1);
        let mut handle = RelayHandle::start(relay, events_rx);
        drop(events_tx);

        let status = handle.shutdown().await.unwrap();
        assert_eq!(status.messages_received, 0);
        assert_eq!(sink.disconnects(), 1);
    }
}
