use thiserror::Error;

/// Errors of the MQTT links
#[derive(Debug, Error)]
pub enum MqttError {
    /// Broker url could not be split into host and port
    #[error("Invalid broker url '{url}': {reason}")]
    InvalidBrokerUrl { url: String, reason: String },

    /// QoS outside 0..=2
    #[error("Invalid QoS value: {0}")]
    InvalidQos(u8),

    /// Publish attempted while the link has no broker session
    #[error("Client '{0}' is not connected")]
    NotConnected(String),

    /// The link never reached the broker
    #[error("Client '{client_id}' failed to connect: {cause}")]
    ConnectFailed { client_id: String, cause: String },

    /// No CONNACK within the configured timeout
    #[error("Client '{client_id}' did not connect within {timeout_ms}ms")]
    ConnectTimeout { client_id: String, timeout_ms: u64 },

    /// The request queue of the rumqttc client rejected the request
    #[error("Client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
}
