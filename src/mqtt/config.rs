use super::error::MqttError;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_PORT: u16 = 1883;

/// Broker connection settings shared by the ingest and actuator links
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MqttConfig {
    /// `tcp://host:port`, `mqtt://host:port` or plain `host:port`
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pw: Option<String>,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    pub qos: u8,
    /// Capacity of the rumqttc request queue and of the inbound event channel
    pub channel_capacity: usize,
    pub connect_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: "tcp://localhost:1883".to_string(),
            user: None,
            pw: None,
            keep_alive_secs: 30,
            clean_session: true,
            qos: 1,
            channel_capacity: 100,
            connect_timeout_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl MqttConfig {
    /// Splits the broker url into host and port
    pub fn broker_address(&self) -> Result<(String, u16), MqttError> {
        let invalid = |reason: &str| MqttError::InvalidBrokerUrl {
            url: self.url.clone(),
            reason: reason.to_string(),
        };

        let address = match self.url.split_once("://") {
            Some(("tcp", rest)) | Some(("mqtt", rest)) => rest,
            Some((scheme, _)) => return Err(invalid(&format!("unsupported scheme '{}'", scheme))),
            None => self.url.as_str(),
        };
        let address = address.trim_end_matches('/');

        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| invalid(&format!("invalid port '{}'", port)))?;
                (host, port)
            }
            None => (address, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        Ok((host.to_string(), port))
    }

    pub fn qos(&self) -> Result<QoS, MqttError> {
        match self.qos {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MqttError::InvalidQos(other)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Reconnection behaviour after an established session drops
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// `false` ends the link on the first loss
    pub enabled: bool,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based): doubles, capped at max
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}
