use chrono::NaiveDateTime;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const PREVIEW_CHARS: usize = 64;

/// A message received on a subscribed topic
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct MQTTMessage {
    topic: String,
    payload: Vec<u8>,
    timestamp: NaiveDateTime,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} - {}: {}", self.timestamp, self.topic, self.preview())
    }
}

impl MQTTMessage {
    pub fn from_topic(topic: String, payload: impl Into<Vec<u8>>) -> Self {
        MQTTMessage {
            topic,
            payload: payload.into(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    /// Shortened content for log lines
    pub fn preview(&self) -> String {
        payload_preview(&self.payload)
    }
}

/// Lossy, length-limited text of a payload for log lines
pub fn payload_preview(payload: &[u8]) -> String {
    let content = String::from_utf8_lossy(payload);
    let mut preview: String = content.chars().take(PREVIEW_CHARS).collect();
    if content.chars().count() > PREVIEW_CHARS {
        preview.push('…');
    }
    preview
}

/// What a link reports to its consumer
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Message(MQTTMessage),
    ConnectionLost { client_id: String, cause: String },
}

/// Forwards link events to the consumer, if the link has one
pub struct MsgManager {
    pub client_id: String,
    pub received_msg: Option<mpsc::Sender<LinkEvent>>,
}

impl MsgManager {
    /// Returns `false` once the consumer has gone away
    pub async fn forward(&self, event: LinkEvent) -> bool {
        let Some(sender) = &self.received_msg else {
            debug!("[{}] No consumer for {:?}", self.client_id, event);
            return true;
        };
        if sender.send(event).await.is_err() {
            warn!("[{}] Event consumer closed", self.client_id);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_long_payloads() {
        let short = MQTTMessage::from_topic("t".to_string(), r#"{"currentTemp": 85}"#);
        assert_eq!(short.preview(), r#"{"currentTemp": 85}"#);

        let long = MQTTMessage::from_topic("t".to_string(), "x".repeat(100));
        assert_eq!(long.preview().chars().count(), PREVIEW_CHARS + 1);
        assert!(long.to_string().contains("t: xxx"));
    }

    #[test]
    fn raw_payload_preview_is_bounded() {
        let payload = format!(r#"{{"currentTemp": 85, "trace": "{}"}}"#, "y".repeat(4096));
        let preview = payload_preview(payload.as_bytes());
        assert_eq!(preview.chars().count(), PREVIEW_CHARS + 1);
        assert!(preview.starts_with(r#"{"currentTemp": 85"#));
        assert!(preview.ends_with('…'));

        assert_eq!(payload_preview(&[0xff]), "\u{fffd}");
        assert_eq!(payload_preview(b""), "");
    }

    #[test]
    fn preview_replaces_invalid_utf8() {
        let msg = MQTTMessage::from_topic("t".to_string(), vec![0xff, b'a']);
        assert_eq!(msg.preview(), "\u{fffd}a");
        assert_eq!(msg.payload(), &[0xff, b'a']);
    }

    #[tokio::test]
    async fn forward_reports_closed_consumer() {
        let (tx, rx) = mpsc::channel(1);
        let manager = MsgManager {
            client_id: "ingest".to_string(),
            received_msg: Some(tx),
        };
        assert!(manager.forward(LinkEvent::Message(MQTTMessage::default())).await);
        drop(rx);
        assert!(!manager.forward(LinkEvent::Message(MQTTMessage::default())).await);
    }
}
