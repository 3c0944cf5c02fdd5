//! # MQTT Integration Module
//!
//! The relay talks to the broker through two independent client sessions:
//! an ingest link subscribed to the sensor topic and an actuator link that
//! publishes classifications. Both are built from the same [`MqttConfig`].
//!
//! ```text
//! mqtt/
//! ├── config.rs           - broker settings, QoS, reconnect policy
//! ├── message_manager.rs  - received messages and link events
//! ├── mqtt_handler.rs     - event loop driver and the caller-side link
//! └── error.rs
//! ```
//!
//! Each link's rumqttc event loop runs in its own tokio task. Only the ingest
//! link has a consumer; it forwards [`LinkEvent`]s over a bounded channel so
//! the relay handles one message at a time.

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;

pub use config::{MqttConfig, ReconnectPolicy};
pub use error::MqttError;
pub use message_manager::{payload_preview, LinkEvent, MQTTMessage};
pub use mqtt_handler::{ActuatorSink, ConnectionState, MQTTStatus, MqttHandler, MqttLink};
