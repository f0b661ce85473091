//! Serde model of the branching conversation export.
//!
//! Every field is optional or defaulted: exports in the wild carry nulls in
//! most places, and a missing field must not sink the whole file.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::ParseError;

const FINISHED_STATUS: &str = "finished_successfully";
const PART_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConversation {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub create_time: Option<f64>,
    #[serde(default)]
    pub update_time: Option<f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub mapping: BTreeMap<String, ExportNode>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportNode {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub message: Option<ExportMessage>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub children: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub author: ExportAuthor,
    #[serde(default)]
    pub create_time: Option<f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: ExportContent,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportAuthor {
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportContent {
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub parts: Vec<Value>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl ExportConversation {
    /// Decodes the conversation at position `index` of an export file.
    pub fn from_value(index: usize, value: Value) -> Result<Self, ParseError> {
        serde_json::from_value(value)
            .map_err(|source| ParseError::MalformedConversation { index, source })
    }

    pub fn title(&self) -> &str {
        match self.title.as_deref() {
            Some(title) if !title.trim().is_empty() => title,
            _ => "Untitled",
        }
    }

    /// The export's own identifier for this conversation, if it carries one.
    pub fn declared_id(&self) -> Option<&str> {
        [&self.conversation_id, &self.id]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|id| !id.is_empty())
    }

    /// The export's own identifier for this conversation, else the root node id.
    pub fn external_id(&self, root_id: &str) -> String {
        self.declared_id().unwrap_or(root_id).to_string()
    }
}

impl ExportMessage {
    pub fn is_finished(&self) -> bool {
        self.status.as_deref() == Some(FINISHED_STATUS)
    }

    pub fn role(&self) -> Role {
        Role::from_author(self.author.role.as_deref().unwrap_or_default())
    }

    /// String parts and the `text` of object parts, separated by a blank line.
    pub fn text(&self) -> String {
        self.content
            .parts
            .iter()
            .filter_map(|part| match part {
                Value::String(s) => Some(s.as_str()),
                Value::Object(obj) => obj.get("text").and_then(Value::as_str),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(PART_SEPARATOR)
    }

    /// The authored instant, if the export carries a usable one.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.create_time
            .and_then(epoch_to_utc)
            .or_else(|| self.metadata.get("create_time").and_then(value_to_utc))
    }
}

fn value_to_utc(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(epoch_to_utc),
        Value::String(s) => s.trim().parse::<f64>().ok().and_then(epoch_to_utc),
        _ => None,
    }
}

/// Converts fractional epoch seconds, keeping millisecond precision.
pub fn epoch_to_utc(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let millis = (seconds * 1000.0).round();
    if millis.abs() > i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_millis(millis as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    /// Every other author, tools and plugins included.
    Tool,
}

#[derive(Error, Debug)]
#[error("Unknown role '{0}'")]
pub struct UnknownRole(pub String);

impl Role {
    pub fn from_author(role: &str) -> Self {
        match role {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::Tool,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(value: Value) -> ExportMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_conversation_tolerates_nulls() {
        let conv = ExportConversation::from_value(
            0,
            json!({
                "title": null,
                "create_time": 1705312800.5,
                "update_time": null,
                "mapping": {
                    "root": {"id": "root", "message": null, "parent": null, "children": null}
                }
            }),
        )
        .unwrap();
        assert_eq!(conv.title(), "Untitled");
        assert!(conv.mapping["root"].children.is_empty());
        assert!(conv.mapping["root"].message.is_none());
    }

    #[test]
    fn test_malformed_conversation_reports_index() {
        let err = ExportConversation::from_value(3, json!({"mapping": "nope"})).unwrap_err();
        assert!(matches!(err, ParseError::MalformedConversation { index: 3, .. }));
    }

    #[test]
    fn test_external_id_preference() {
        let mut conv = ExportConversation::from_value(0, json!({})).unwrap();
        assert_eq!(conv.external_id("root-1"), "root-1");
        conv.id = Some("id-1".to_string());
        assert_eq!(conv.external_id("root-1"), "id-1");
        conv.conversation_id = Some("conv-1".to_string());
        assert_eq!(conv.external_id("root-1"), "conv-1");
        conv.conversation_id = Some(String::new());
        assert_eq!(conv.external_id("root-1"), "id-1");
    }

    #[test]
    fn test_text_joins_parts_with_blank_line() {
        let msg = message(json!({
            "content": {"content_type": "multimodal_text", "parts": [
                "first",
                {"content_type": "image_asset_pointer", "asset_pointer": "file-1"},
                {"text": "second"},
                42
            ]}
        }));
        assert_eq!(msg.text(), "first\n\nsecond");
    }

    #[test]
    fn test_timestamp_sources() {
        let direct = message(json!({"create_time": 1705312800.25}));
        assert_eq!(
            direct.timestamp().unwrap().to_rfc3339(),
            "2024-01-15T10:00:00.250+00:00"
        );

        let from_metadata = message(json!({"metadata": {"create_time": 1705312800}}));
        assert_eq!(from_metadata.timestamp().unwrap().timestamp(), 1705312800);

        let from_string = message(json!({"metadata": {"create_time": "1705312800"}}));
        assert_eq!(from_string.timestamp().unwrap().timestamp(), 1705312800);

        let missing = message(json!({"create_time": null, "metadata": {}}));
        assert!(missing.timestamp().is_none());
    }

    #[test]
    fn test_finished_status() {
        assert!(message(json!({"status": "finished_successfully"})).is_finished());
        assert!(!message(json!({"status": "in_progress"})).is_finished());
        assert!(!message(json!({})).is_finished());
    }

    #[test]
    fn test_roles() {
        assert_eq!(Role::from_author("user"), Role::User);
        assert_eq!(Role::from_author("assistant"), Role::Assistant);
        assert_eq!(Role::from_author("system"), Role::System);
        assert_eq!(Role::from_author("tool"), Role::Tool);
        assert_eq!(Role::from_author("plugin"), Role::Tool);
        assert_eq!(message(json!({"author": null})).role(), Role::Tool);
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!("robot".parse::<Role>().is_err());
    }

    #[test]
    fn test_epoch_rejects_non_finite() {
        assert!(epoch_to_utc(f64::NAN).is_none());
        assert!(epoch_to_utc(f64::INFINITY).is_none());
        assert!(epoch_to_utc(1e300).is_none());
    }
}
