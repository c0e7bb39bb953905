//! Line-level decoding of session log records.
//!
//! Producers have written several shapes over time: message fields nested under
//! a `message` object or flat on the record, tool invocations under a handful of
//! type names, usage with or without a precomputed total. Everything is folded
//! into one canonical [`Event`] here so the reducers never see raw JSON.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

const TEXT_TYPES: &[&str] = &["text", "input_text", "output_text"];
const TOOL_CALL_TYPES: &[&str] = &["toolCall", "tool_call", "tool_use", "toolUse", "function_call"];
const TOOL_RESULT_TYPES: &[&str] = &["toolResult", "tool_result", "function_call_output"];
const THINKING_TYPES: &[&str] = &["thinking", "reasoning"];

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SessionStart {
        id: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    },
    ModelChange {
        model: Option<String>,
        provider: Option<String>,
    },
    Message(MessageEvent),
    Other {
        kind: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" | "toolResult" | "tool_result" => Some(Self::Tool),
            "system" | "developer" => Some(Self::System),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub role: Role,
    pub content: MessageContent,
    pub usage: Option<Usage>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl MessageEvent {
    pub fn has_tool_call(&self) -> bool {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .any(|block| matches!(block, ContentBlock::ToolCall { .. })),
            MessageContent::Text(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolCall {
        name: String,
        arguments: ToolArguments,
    },
    ToolResult {
        content: String,
    },
    Thinking(String),
    Other {
        kind: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolArguments {
    Text(String),
    Structured(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub total_tokens: u64,
    pub cost: f64,
}

pub fn is_tool_call_type(kind: &str) -> bool {
    TOOL_CALL_TYPES.contains(&kind)
}

pub fn decode_line(line: &str) -> Result<Event, DecodeError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Blank);
    }
    let record: Value =
        serde_json::from_str(trimmed).map_err(|err| DecodeError::Json(err.to_string()))?;
    if !record.is_object() {
        return Err(DecodeError::NotAnObject);
    }

    match str_at(&record, &["type"]).as_deref() {
        Some("session" | "session_start" | "session-start") => Ok(Event::SessionStart {
            id: str_at(&record, &["id"]).or_else(|| str_at(&record, &["sessionId"])),
            timestamp: record.get("timestamp").and_then(parse_timestamp),
        }),
        Some("model_change" | "model-change") => Ok(Event::ModelChange {
            model: str_at(&record, &["modelId"]).or_else(|| str_at(&record, &["model"])),
            provider: str_at(&record, &["provider"]),
        }),
        Some("message") => decode_message(&record).map(Event::Message),
        None if message_field(&record, "role").is_some() => {
            decode_message(&record).map(Event::Message)
        }
        Some(kind) => Ok(Event::Other {
            kind: kind.to_string(),
        }),
        None => Ok(Event::Other {
            kind: "unknown".to_string(),
        }),
    }
}

// Nested `message.<key>` wins over the flat `<key>` on the record.
fn message_field<'a>(record: &'a Value, key: &str) -> Option<&'a Value> {
    record
        .get("message")
        .and_then(|nested| nested.get(key))
        .or_else(|| record.get(key))
        .filter(|value| !value.is_null())
}

fn message_str(record: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        message_field(record, key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(ToString::to_string)
    })
}

fn decode_message(record: &Value) -> Result<MessageEvent, DecodeError> {
    let role = message_field(record, "role")
        .and_then(Value::as_str)
        .and_then(Role::parse)
        .ok_or(DecodeError::MissingRole)?;

    Ok(MessageEvent {
        role,
        content: decode_content(message_field(record, "content")),
        usage: message_field(record, "usage").and_then(decode_usage),
        model: message_str(record, &["model", "modelId"]),
        provider: message_str(record, &["provider"]),
        timestamp: record
            .get("message")
            .and_then(|nested| nested.get("timestamp"))
            .and_then(parse_timestamp)
            .or_else(|| record.get("timestamp").and_then(parse_timestamp)),
    })
}

fn decode_content(value: Option<&Value>) -> MessageContent {
    match value {
        Some(Value::String(text)) => MessageContent::Text(text.clone()),
        Some(Value::Array(items)) => {
            MessageContent::Blocks(items.iter().filter_map(decode_block).collect())
        }
        _ => MessageContent::Blocks(Vec::new()),
    }
}

fn decode_block(block: &Value) -> Option<ContentBlock> {
    if let Some(text) = block.as_str() {
        return Some(ContentBlock::Text(text.to_string()));
    }
    if !block.is_object() {
        return None;
    }
    let kind = str_at(block, &["type"]).unwrap_or_default();
    let kind = kind.as_str();

    if TEXT_TYPES.contains(&kind) {
        return Some(ContentBlock::Text(
            str_at(block, &["text"]).unwrap_or_default(),
        ));
    }
    if is_tool_call_type(kind) {
        let arguments = match ["arguments", "input", "args"]
            .iter()
            .find_map(|key| block.get(*key).filter(|value| !value.is_null()))
        {
            Some(Value::String(raw)) => ToolArguments::Text(raw.clone()),
            Some(structured) => ToolArguments::Structured(structured.clone()),
            None => ToolArguments::Text(String::new()),
        };
        return Some(ContentBlock::ToolCall {
            name: str_at(block, &["name"]).unwrap_or_else(|| "unknown".to_string()),
            arguments,
        });
    }
    if TOOL_RESULT_TYPES.contains(&kind) {
        let content = ["content", "output", "text"]
            .iter()
            .find_map(|key| block.get(*key))
            .map(flatten_text)
            .unwrap_or_default();
        return Some(ContentBlock::ToolResult { content });
    }
    if THINKING_TYPES.contains(&kind) {
        let text = str_at(block, &["thinking"])
            .or_else(|| str_at(block, &["text"]))
            .or_else(|| block.get("summary").map(flatten_text))
            .unwrap_or_default();
        return Some(ContentBlock::Thinking(text));
    }
    Some(ContentBlock::Other {
        kind: kind.to_string(),
    })
}

fn flatten_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(ToString::to_string)
                    .or_else(|| str_at(item, &["text"]))
                    .unwrap_or_default()
            })
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(_) => str_at(value, &["text"]).unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

fn decode_usage(value: &Value) -> Option<Usage> {
    if !value.is_object() {
        return None;
    }
    let total_tokens = uint_at(value, &["totalTokens"])
        .or_else(|| uint_at(value, &["total_tokens"]))
        .unwrap_or_else(|| {
            [
                "input",
                "output",
                "cacheRead",
                "cacheWrite",
                "input_tokens",
                "output_tokens",
            ]
            .iter()
            .filter_map(|key| uint_at(value, &[*key]))
            .sum()
        });
    let cost = value.get("cost").map(cost_value).unwrap_or(0.0);
    Some(Usage { total_tokens, cost })
}

fn cost_value(value: &Value) -> f64 {
    let raw = value
        .as_f64()
        .or_else(|| float_at(value, &["total"]))
        .unwrap_or(0.0);
    if raw.is_finite() && raw > 0.0 { raw } else { 0.0 }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Value::Number(number) => {
            let raw = number.as_i64()?;
            // Values this small cannot be millisecond timestamps after 1970-04.
            if raw.abs() < 10_000_000_000 {
                Utc.timestamp_opt(raw, 0).single()
            } else {
                Utc.timestamp_millis_opt(raw).single()
            }
        }
        _ => None,
    }
}

fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get(*key)?;
    }
    cursor.as_str().map(|s| s.to_string())
}

fn uint_at(value: &Value, path: &[&str]) -> Option<u64> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get(*key)?;
    }
    cursor
        .as_u64()
        .or_else(|| cursor.as_i64().and_then(|n| (n >= 0).then_some(n as u64)))
        .or_else(|| {
            cursor
                .as_f64()
                .and_then(|n| (n.is_finite() && n >= 0.0).then_some(n as u64))
        })
}

fn float_at(value: &Value, path: &[&str]) -> Option<f64> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get(*key)?;
    }
    cursor
        .as_f64()
        .or_else(|| cursor.as_u64().map(|n| n as f64))
}
