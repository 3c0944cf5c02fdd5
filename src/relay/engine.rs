//! Temperature alert relay with a statum lifecycle
//!
//! ```text
//! Configured ──► Running ──► Stopping ──► Stopped
//!                   │            │
//!              LinkEvents    disconnect actuator
//! ```
//!
//! ```text
//! payload ──► SensorReading ──► [DecisionEvaluator] ──► Classification ──► [ActuatorSink]
//! ```

use std::sync::Arc;

use chrono::{DateTime, Local};
use serde_json::Value;
use statum::{machine, state};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::error::RelayError;
use super::reading::{Classification, SensorReading};
use crate::decision::{DecisionContext, DecisionEvaluator};
use crate::mqtt::{payload_preview, ActuatorSink, LinkEvent};

#[state]
#[derive(Debug, Clone)]
pub enum RelayState {
    Configured, // collaborators wired, not yet consuming
    Running,    // handling link events
    Stopping,   // event loop left, actuator still connected
    Stopped,    // actuator disconnected
}

/// Names the relay needs to route one reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub input_name: String,
    pub output_name: String,
    pub actuator_topic: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            input_name: "currentTemp".to_string(),
            output_name: "warningState".to_string(),
            actuator_topic: "m5stick/vibration".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayStatus {
    pub messages_received: usize,
    pub messages_published: usize,
    pub decode_errors: usize,
    pub evaluation_errors: usize,
    pub publish_errors: usize,
    pub connection_losses: usize,
    pub last_classification: Option<String>,
    pub last_activity: Option<DateTime<Local>>,
}

#[machine]
pub struct TemperatureAlertRelay<S: RelayState> {
    evaluator: Arc<dyn DecisionEvaluator>,
    actuator: Arc<dyn ActuatorSink>,
    settings: RelaySettings,
    status: RelayStatus,
}

impl<S: RelayState> TemperatureAlertRelay<S> {
    pub fn status(&self) -> &RelayStatus {
        &self.status
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }
}

impl TemperatureAlertRelay<Configured> {
    pub fn configure(
        evaluator: Arc<dyn DecisionEvaluator>,
        actuator: Arc<dyn ActuatorSink>,
        settings: RelaySettings,
    ) -> Self {
        info!(
            "Configuring relay: {} -> '{}' via {}",
            settings.input_name,
            settings.output_name,
            evaluator.describe()
        );
        Self::new(evaluator, actuator, settings, RelayStatus::default())
    }

    pub fn activate(self) -> TemperatureAlertRelay<Running> {
        info!("Relay publishing to {}", self.settings.actuator_topic);
        self.transition()
    }
}

impl TemperatureAlertRelay<Running> {
    /// Decode, evaluate and publish one payload, returning what was published.
    pub fn process_message(&self, payload: &[u8]) -> Result<Classification, RelayError> {
        let classification = self.classify(payload)?;
        self.actuator
            .publish(&self.settings.actuator_topic, classification.clone().into_payload())?;
        Ok(classification)
    }

    /// Decode and evaluate without publishing
    pub fn classify(&self, payload: &[u8]) -> Result<Classification, RelayError> {
        let reading = SensorReading::decode(payload)?;

        let inputs = DecisionContext::from([(
            self.settings.input_name.clone(),
            Value::from(reading.current_temp),
        )]);
        let result = self.evaluator.evaluate(&inputs)?;
        let classification =
            Classification::from_output(&self.settings.output_name, result.get(&self.settings.output_name))?;

        debug!("{} = {} -> {}", self.settings.input_name, reading.current_temp, classification);
        Ok(classification)
    }

    /// Entry point for every message on the ingest topic. Never fails.
    pub fn on_message(&mut self, payload: &[u8]) {
        self.status.messages_received += 1;
        self.status.last_activity = Some(Local::now());
        info!("Message received: {}", payload_preview(payload));

        let classification = match self.classify(payload) {
            Ok(classification) => classification,
            Err(e) => {
                self.record_failure(&e, payload);
                return;
            }
        };

        info!("Decision: {}", classification);
        self.status.last_classification = Some(classification.to_string());

        match self
            .actuator
            .publish(&self.settings.actuator_topic, classification.clone().into_payload())
        {
            Ok(()) => {
                self.status.messages_published += 1;
                info!(
                    "Sent '{}' to {}",
                    classification, self.settings.actuator_topic
                );
            }
            Err(e) => self.record_failure(&RelayError::from(e), payload),
        }
    }

    pub fn on_connection_lost(&mut self, client_id: &str, cause: &str) {
        self.status.connection_losses += 1;
        let e = RelayError::ConnectionLost {
            client_id: client_id.to_string(),
            cause: cause.to_string(),
        };
        warn!("{}", e);
    }

    fn record_failure(&mut self, e: &RelayError, payload: &[u8]) {
        let payload = payload_preview(payload);
        match e {
            RelayError::Decode(_) => {
                self.status.decode_errors += 1;
                warn!("Discarding payload '{}': {}", payload, e);
            }
            RelayError::Evaluation(_) => {
                self.status.evaluation_errors += 1;
                error!("Discarding payload '{}': {}", payload, e);
            }
            RelayError::Publish(_) => {
                self.status.publish_errors += 1;
                error!("Classification for '{}' not delivered: {}", payload, e);
            }
            RelayError::ConnectionLost { .. } | RelayError::Task(_) => {
                error!("Unexpected relay error for '{}': {}", payload, e);
            }
        }
    }

    /// Handles link events one at a time until shutdown or until the ingest
    /// link closes its channel.
    pub async fn run_until_shutdown(
        mut self,
        mut events: mpsc::Receiver<LinkEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> TemperatureAlertRelay<Stopping> {
        info!("Relay event loop started");

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => {
                    info!("Shutdown signal received");
                    break;
                }

                event = events.recv() => match event {
                    Some(LinkEvent::Message(message)) => {
                        debug!(
                            "Handling message from {} received at {}",
                            message.topic(),
                            message.timestamp()
                        );
                        self.on_message(message.payload());
                    }
                    Some(LinkEvent::ConnectionLost { client_id, cause }) => {
                        self.on_connection_lost(&client_id, &cause);
                    }
                    None => {
                        warn!("Ingest channel closed");
                        break;
                    }
                },
            }
        }

        self.deactivate()
    }

    pub fn deactivate(self) -> TemperatureAlertRelay<Stopping> {
        self.transition()
    }
}

impl TemperatureAlertRelay<Stopping> {
    /// Disconnects the actuator link. Consumes the relay, so it runs once.
    pub fn shutdown(self) -> TemperatureAlertRelay<Stopped> {
        if let Err(e) = self.actuator.disconnect() {
            warn!("Actuator disconnect failed: {}", e);
        }
        info!(
            "Relay stopped: {} received, {} published",
            self.status.messages_received, self.status.messages_published
        );
        self.transition()
    }
}

impl TemperatureAlertRelay<Stopped> {
    pub fn into_status(self) -> RelayStatus {
        self.status
    }
}
