//! Channel-level envelopes: multiplexing frames and request correlation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One message for the logical channel `(tag, id)` on a shared transport.
///
/// Wire format: `{"tag":"root","id":0,"data":...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFrame {
    pub tag: String,
    pub id: u32,
    pub data: Value,
}

impl ChannelFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ChannelFrame serialization should not fail")
    }

    pub fn from_json(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "lowercase")]
enum Correlation {
    Req {
        index: u64,
        data: Value,
    },
    Rep {
        index: u64,
        #[serde(rename = "isOk")]
        is_ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<String>,
    },
}

/// Classified inbound channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request { index: u64, data: Value },
    Reply { index: u64, result: Result<Value, String> },
    /// Anything that isn't request/response traffic, unchanged
    Message(Value),
    /// Claims to be `req`/`rep` but doesn't have the shape
    Malformed(String),
}

impl Inbound {
    pub fn classify(value: Value) -> Self {
        match value.get("id").and_then(Value::as_str) {
            Some("req") | Some("rep") => {}
            _ => return Self::Message(value),
        }
        match serde_json::from_value::<Correlation>(value) {
            Ok(Correlation::Req { index, data }) => Self::Request { index, data },
            Ok(Correlation::Rep {
                index,
                is_ok: true,
                data,
                ..
            }) => Self::Reply {
                index,
                result: Ok(data.unwrap_or(Value::Null)),
            },
            Ok(Correlation::Rep { index, msg, .. }) => Self::Reply {
                index,
                result: Err(msg.unwrap_or_else(|| "request failed".to_string())),
            },
            Err(e) => Self::Malformed(e.to_string()),
        }
    }
}

pub fn request(index: u64, data: Value) -> Value {
    to_value(&Correlation::Req { index, data })
}

pub fn reply(index: u64, result: Result<Value, String>) -> Value {
    let envelope = match result {
        Ok(data) => Correlation::Rep {
            index,
            is_ok: true,
            data: Some(data),
            msg: None,
        },
        Err(msg) => Correlation::Rep {
            index,
            is_ok: false,
            data: None,
            msg: Some(msg),
        },
    };
    to_value(&envelope)
}

fn to_value(envelope: &Correlation) -> Value {
    serde_json::to_value(envelope).expect("Correlation serialization should not fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_shape() {
        assert_eq!(
            request(3, json!("ping")),
            json!({"id": "req", "index": 3, "data": "ping"})
        );
    }

    #[test]
    fn test_reply_shapes() {
        assert_eq!(
            reply(1, Ok(json!(5))),
            json!({"id": "rep", "index": 1, "isOk": true, "data": 5})
        );
        assert_eq!(
            reply(2, Err("nope".into())),
            json!({"id": "rep", "index": 2, "isOk": false, "msg": "nope"})
        );
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            Inbound::classify(request(7, json!({"a": 1}))),
            Inbound::Request {
                index: 7,
                data: json!({"a": 1})
            }
        );
        assert_eq!(
            Inbound::classify(reply(7, Err("boom".into()))),
            Inbound::Reply {
                index: 7,
                result: Err("boom".into())
            }
        );
        // Other traffic passes through untouched
        let other = json!({"id": "set", "rClock": 0, "lClock": 1, "value": "x"});
        assert_eq!(Inbound::classify(other.clone()), Inbound::Message(other));
        assert_eq!(Inbound::classify(json!(42)), Inbound::Message(json!(42)));
        assert!(matches!(
            Inbound::classify(json!({"id": "rep"})),
            Inbound::Malformed(_)
        ));
    }

    #[test]
    fn test_frame_json() {
        let frame = ChannelFrame {
            tag: "root".into(),
            id: 0,
            data: json!({"k": "v"}),
        };
        assert_eq!(ChannelFrame::from_json(&frame.to_json()), Some(frame));
        assert_eq!(ChannelFrame::from_json("[]"), None);
    }
}
