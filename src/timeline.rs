use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{ContentBlock, Event, MessageContent, MessageEvent, Role, ToolArguments, Usage};
use crate::util::clip_chars;

pub const TEXT_MAX_CHARS: usize = 4_000;
pub const TOOL_ARGUMENTS_MAX_CHARS: usize = 1_000;
pub const THINKING_MAX_CHARS: usize = 2_000;
pub const TOOL_RESULT_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItem {
    pub timestamp: Option<DateTime<Utc>>,
    pub role: Role,
    pub text: String,
    pub tool_calls: Vec<ToolCallSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallSummary {
    pub name: String,
    pub arguments: String,
}

/// One item per message event, in file order.
pub fn build_timeline(events: &[Event]) -> Vec<TimelineItem> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Message(message) => Some(timeline_item(message)),
            _ => None,
        })
        .collect()
}

fn timeline_item(message: &MessageEvent) -> TimelineItem {
    let mut text_parts: Vec<String> = Vec::new();
    let mut thinking_parts: Vec<&str> = Vec::new();
    let mut tool_calls = Vec::new();

    match &message.content {
        MessageContent::Text(text) => text_parts.push(text.clone()),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text(text) => {
                        if !text.is_empty() {
                            text_parts.push(text.clone());
                        }
                    }
                    ContentBlock::ToolCall { name, arguments } => {
                        tool_calls.push(ToolCallSummary {
                            name: name.clone(),
                            arguments: render_arguments(arguments),
                        });
                    }
                    ContentBlock::ToolResult { content } => {
                        text_parts.push(format!(
                            "[Tool Result: {}]",
                            clip_chars(content, TOOL_RESULT_MAX_CHARS)
                        ));
                    }
                    ContentBlock::Thinking(text) => {
                        if !text.is_empty() {
                            thinking_parts.push(text.as_str());
                        }
                    }
                    ContentBlock::Other { .. } => {}
                }
            }
        }
    }

    let thinking = (!thinking_parts.is_empty())
        .then(|| clip_chars(&thinking_parts.join("\n"), THINKING_MAX_CHARS));

    TimelineItem {
        timestamp: message.timestamp,
        role: message.role,
        text: clip_chars(&text_parts.join("\n"), TEXT_MAX_CHARS),
        tool_calls,
        thinking,
        usage: message.usage,
        model: message.model.clone(),
    }
}

fn render_arguments(arguments: &ToolArguments) -> String {
    match arguments {
        ToolArguments::Text(raw) => clip_chars(raw, TOOL_ARGUMENTS_MAX_CHARS),
        ToolArguments::Structured(value) => clip_chars(&value.to_string(), TOOL_ARGUMENTS_MAX_CHARS),
    }
}
