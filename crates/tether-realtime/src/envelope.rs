use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_proto::{LocationSample, StoredSample};

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_CHANGES: &str = "postgres_changes";
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// The topic+event+payload+ref message shape used by the realtime gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

/// Inbound messages after classification. Unknown events land in `Ignored`
/// so new server-side event types never break dispatch.
#[derive(Debug)]
pub enum Inbound {
    Insert(LocationSample),
    SubscribeAck { ok: bool },
    BadRow,
    Ignored,
}

impl Envelope {
    pub fn join(topic: &str, reference: u64) -> Self {
        Self {
            topic: topic.to_string(),
            event: EVENT_JOIN.to_string(),
            payload: Value::Object(Default::default()),
            reference: Some(reference.to_string()),
        }
    }

    pub fn heartbeat(reference: u64) -> Self {
        Self {
            topic: HEARTBEAT_TOPIC.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: Value::Object(Default::default()),
            reference: Some(reference.to_string()),
        }
    }

    pub fn classify(self) -> Inbound {
        match self.event.as_str() {
            EVENT_CHANGES => {
                let kind = self.payload.get("eventType").and_then(Value::as_str);
                if kind != Some("INSERT") {
                    return Inbound::Ignored;
                }
                let Some(record) = self.payload.get("new").cloned() else {
                    return Inbound::BadRow;
                };
                match serde_json::from_value::<StoredSample>(record) {
                    Ok(row) if row.sample.validate().is_ok() => Inbound::Insert(row.sample),
                    _ => Inbound::BadRow,
                }
            }
            EVENT_REPLY => {
                let ok = self.payload.get("status").and_then(Value::as_str) == Some("ok");
                Inbound::SubscribeAck { ok }
            }
            _ => Inbound::Ignored,
        }
    }
}
