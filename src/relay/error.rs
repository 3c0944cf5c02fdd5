//! Error definitions for the relay pipeline

use crate::decision::DecisionError;
use crate::mqtt::MqttError;
use thiserror::Error;

/// Failures of a single relay step. None of them stop the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Payload is not JSON or has no numeric `currentTemp`
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The decision backend failed or produced no usable classification
    #[error("Evaluation error: {0}")]
    Evaluation(#[from] DecisionError),

    /// The classification could not be handed to the actuator link
    #[error("Publish error: {0}")]
    Publish(#[from] MqttError),

    /// A link reported the loss of its broker session
    #[error("Connection lost on '{client_id}': {cause}")]
    ConnectionLost { client_id: String, cause: String },

    /// The relay task ended abnormally
    #[error("Relay task error: {0}")]
    Task(String),
}
