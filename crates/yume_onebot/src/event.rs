//! OneBot v11 envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "post_type")]
pub enum OneBotEvent {
    #[serde(rename = "message")]
    Message(MessageEvent),
    #[serde(rename = "meta_event")]
    Meta(MetaEvent),
    #[serde(rename = "notice")]
    Notice(Value),
    #[serde(rename = "request")]
    Request(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    /// "private" or "group"
    pub message_type: String,
    #[serde(default)]
    pub sub_type: Option<String>,
    #[serde(default)]
    pub message_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub raw_message: String,
    #[serde(default)]
    pub font: i32,
    #[serde(default)]
    pub sender: Sender,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub self_id: i64,
}

impl MessageEvent {
    pub fn is_private(&self) -> bool {
        self.message_type == "private"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sender {
    pub user_id: Option<i64>,
    pub nickname: Option<String>,
    pub card: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "meta_event_type")]
pub enum MetaEvent {
    #[serde(rename = "heartbeat")]
    Heartbeat {
        #[serde(default)]
        time: i64,
        #[serde(default)]
        status: Value,
        #[serde(default)]
        interval: i64,
    },
    #[serde(rename = "lifecycle")]
    Lifecycle {
        #[serde(default)]
        time: i64,
        #[serde(default)]
        sub_type: String,
    },
}

/// Outgoing action frame.
#[derive(Debug, Serialize)]
pub struct SendMessageAction {
    pub action: String,
    pub params: SendMessageParams,
    pub echo: String,
}

#[derive(Debug, Serialize)]
pub struct SendMessageParams {
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    pub message: String,
}

impl SendMessageAction {
    pub fn private(user_id: i64, message: &str, echo: String) -> Self {
        Self {
            action: "send_private_msg".to_string(),
            params: SendMessageParams {
                message_type: "private".to_string(),
                user_id: Some(user_id),
                group_id: None,
                message: message.to_string(),
            },
            echo,
        }
    }
}

/// Reply to an action, matched by `echo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneBotResponse {
    pub status: String,
    pub retcode: i32,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub wording: String,
    #[serde(default)]
    pub echo: Option<String>,
}

/// Anything the connection can deliver.
#[derive(Debug, Clone)]
pub enum Inbound {
    Event(OneBotEvent),
    Response(OneBotResponse),
    Unknown(Value),
}

impl Inbound {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("post_type").is_some() {
            if let Ok(event) = serde_json::from_value::<OneBotEvent>(value.clone()) {
                return Ok(Inbound::Event(event));
            }
        } else if value.get("retcode").is_some() {
            if let Ok(resp) = serde_json::from_value::<OneBotResponse>(value.clone()) {
                return Ok(Inbound::Response(resp));
            }
        }
        Ok(Inbound::Unknown(value))
    }

    /// The private message event, if this is one.
    pub fn private_message(&self) -> Option<&MessageEvent> {
        match self {
            Inbound::Event(OneBotEvent::Message(m)) if m.is_private() => Some(m),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_private_message() {
        let raw = r#"{"post_type":"message","message_type":"private","sub_type":"friend",
            "message_id":12,"user_id":10086,"raw_message":"在吗","font":0,
            "sender":{"user_id":10086,"nickname":"x"},"time":1700000000,"self_id":1}"#;
        let inbound = Inbound::parse(raw).unwrap();
        let msg = inbound.private_message().unwrap();
        assert_eq!(msg.user_id, 10086);
        assert_eq!(msg.raw_message, "在吗");
    }

    #[test]
    fn test_group_message_is_not_private() {
        let raw = r#"{"post_type":"message","message_type":"group","user_id":1,"group_id":2,"raw_message":"hi"}"#;
        let inbound = Inbound::parse(raw).unwrap();
        assert!(inbound.private_message().is_none());
    }

    #[test]
    fn test_parse_heartbeat_and_response() {
        let hb = r#"{"post_type":"meta_event","meta_event_type":"heartbeat","time":1,"interval":5000,"status":{}}"#;
        assert!(matches!(
            Inbound::parse(hb).unwrap(),
            Inbound::Event(OneBotEvent::Meta(MetaEvent::Heartbeat { .. }))
        ));

        let resp = r#"{"status":"ok","retcode":0,"data":{"message_id":1},"echo":"abc"}"#;
        match Inbound::parse(resp).unwrap() {
            Inbound::Response(r) => assert_eq!(r.echo.as_deref(), Some("abc")),
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(Inbound::parse(r#"{"foo":1}"#).unwrap(), Inbound::Unknown(_)));
        assert!(Inbound::parse("not json").is_err());
    }

    #[test]
    fn test_private_action_shape() {
        let action = SendMessageAction::private(42, "你好", "e1".into());
        let v = serde_json::to_value(&action).unwrap();
        assert_eq!(v["action"], "send_private_msg");
        assert_eq!(v["params"]["user_id"], 42);
        assert_eq!(v["params"]["message"], "你好");
        assert!(v["params"].get("group_id").is_none());
        assert_eq!(v["echo"], "e1");
    }
}
