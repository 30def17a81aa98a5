//! Message envelopes exchanged with the server
//!
//! Outbound messages are JSON objects `{"type", "parameters", ...}`. Inbound
//! messages use the same object form, a single-key `{"<type>": <parameters>}`
//! object, or the compact `type,parameters` line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ParseError;

/// Wire representation used by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// `{"type": ..., "parameters": ...}`
    #[default]
    Json,
    /// `type,parameters` with string parameters bare and anything else as JSON
    Compact,
    /// Single-key object `{"<type>": parameters}`; channel and folder are not written
    Keyed,
}

/// A typed message with JSON parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type, e.g. `update_sequence`
    #[serde(rename = "type")]
    pub message_type: String,

    /// Type-specific parameters
    #[serde(default)]
    pub parameters: Value,

    /// Request/response correlation id chosen by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Target folder on the server; `None` means this controller's own folder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
}

impl Envelope {
    /// Message for this controller's own folder
    pub fn new(message_type: impl Into<String>, parameters: Value) -> Self {
        Self {
            message_type: message_type.into(),
            parameters,
            channel: None,
            folder: None,
        }
    }

    /// Reply on `channel`
    pub fn with_channel(mut self, channel: Option<String>) -> Self {
        self.channel = channel;
        self
    }

    /// Address another folder
    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    /// Serialize for the given wire format (no line terminator)
    pub fn encode(&self, format: WireFormat) -> String {
        match format {
            WireFormat::Json => {
                serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
            }
            WireFormat::Compact => match &self.parameters {
                Value::String(text) => format!("{},{}", self.message_type, text),
                other => format!("{},{}", self.message_type, other),
            },
            WireFormat::Keyed => {
                let mut map = Map::new();
                map.insert(self.message_type.clone(), self.parameters.clone());
                Value::Object(map).to_string()
            }
        }
    }

    /// Parse an inbound message in any of the accepted forms
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ParseError::Empty);
        }

        if text.starts_with('{') {
            let value: Value =
                serde_json::from_str(text).map_err(|e| ParseError::Json(e.to_string()))?;
            return match value {
                Value::Object(map) => Self::from_object(map),
                _ => Err(ParseError::MissingType),
            };
        }

        // compact form: the type ends at the first comma
        let (message_type, rest) = match text.find(',') {
            Some(pos) => (text[..pos].trim(), text[pos + 1..].trim()),
            None => (text, ""),
        };
        if message_type.is_empty() {
            return Err(ParseError::MissingType);
        }
        let parameters = if rest.is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(rest).unwrap_or_else(|_| Value::String(rest.to_string()))
        };
        Ok(Self::new(message_type, parameters))
    }

    fn from_object(mut map: Map<String, Value>) -> Result<Self, ParseError> {
        if let Some(Value::String(message_type)) = map.remove("type") {
            let parameters = map
                .remove("parameters")
                .unwrap_or_else(|| Value::Object(Map::new()));
            let channel = map.remove("channel").and_then(channel_id);
            let folder = map
                .remove("folder")
                .and_then(|f| f.as_str().map(str::to_string));
            return Ok(Self {
                message_type,
                parameters,
                channel,
                folder,
            });
        }

        if map.len() == 1 {
            if let Some((message_type, parameters)) = map.into_iter().next() {
                return Ok(Self::new(message_type, parameters));
            }
        }
        Err(ParseError::MissingType)
    }
}

fn channel_id(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// An envelope waiting in the outbound queue
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Queue-assigned identity, unique for the life of the queue
    pub id: u64,
    /// When the message was enqueued
    pub timestamp: DateTime<Utc>,
    /// The message itself
    pub envelope: Envelope,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_encode_json() {
        let env = Envelope::new("update_sequence", json!({"sequence": "log", "value": "hi"}));
        let text = env.encode(WireFormat::Json);
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            back,
            json!({"type": "update_sequence", "parameters": {"sequence": "log", "value": "hi"}})
        );
    }

    #[test]
    fn test_encode_with_channel_and_folder() {
        let env = Envelope::new("config", json!({"a": 1}))
            .with_channel(Some("7".into()))
            .with_folder("/system");
        let back: Value = serde_json::from_str(&env.encode(WireFormat::Json)).unwrap();
        assert_eq!(back["channel"], json!("7"));
        assert_eq!(back["folder"], json!("/system"));
    }

    #[test]
    fn test_encode_compact() {
        let env = Envelope::new("ping", json!({}));
        assert_eq!(env.encode(WireFormat::Compact), "ping,{}");
    }

    #[test]
    fn test_compact_string_parameters_stay_bare() {
        let env = Envelope::parse("note,plain text").unwrap();
        assert_eq!(env.encode(WireFormat::Compact), "note,plain text");

        let env = Envelope::new("serial", json!("a:q|1f2e"));
        assert_eq!(env.encode(WireFormat::Compact), "serial,a:q|1f2e");
        assert_eq!(Envelope::parse(&env.encode(WireFormat::Compact)).unwrap(), env);
    }

    #[test]
    fn test_encode_keyed() {
        let env = Envelope::new("update_sequence", json!({"sequence": "t", "value": 3}))
            .with_folder("/farm/barn");
        let text = env.encode(WireFormat::Keyed);
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, json!({"update_sequence": {"sequence": "t", "value": 3}}));
        assert_eq!(Envelope::parse(&text).unwrap().message_type, "update_sequence");
    }

    #[test]
    fn test_parse_typed_object() {
        let env = Envelope::parse(
            r#"{"type": "get_config", "parameters": {"names": "a,b"}, "channel": 12}"#,
        )
        .unwrap();
        assert_eq!(env.message_type, "get_config");
        assert_eq!(env.parameters, json!({"names": "a,b"}));
        assert_eq!(env.channel.as_deref(), Some("12"));
    }

    #[test]
    fn test_parse_single_key_object() {
        let env = Envelope::parse(r#"{"serial_command": {"command": "a:q"}}"#).unwrap();
        assert_eq!(env.message_type, "serial_command");
        assert_eq!(env.parameters, json!({"command": "a:q"}));
    }

    #[test]
    fn test_parse_compact() {
        let env = Envelope::parse("set_config,{\"x\": 1}").unwrap();
        assert_eq!(env.message_type, "set_config");
        assert_eq!(env.parameters, json!({"x": 1}));

        let env = Envelope::parse("note,plain text, with comma").unwrap();
        assert_eq!(env.parameters, json!("plain text, with comma"));

        let env = Envelope::parse("shutdown").unwrap();
        assert_eq!(env.message_type, "shutdown");
        assert_eq!(env.parameters, json!({}));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Envelope::parse("  "), Err(ParseError::Empty));
        assert!(matches!(Envelope::parse("{bad"), Err(ParseError::Json(_))));
        assert_eq!(
            Envelope::parse(r#"{"a": 1, "b": 2}"#),
            Err(ParseError::MissingType)
        );
        assert_eq!(Envelope::parse(",{}"), Err(ParseError::MissingType));
    }
}
