use md5::{Digest, Md5};
use serde_json::{Value, json};

use aigate_protocol::{ContentBlock, Message, MessageContent, MessagesRequest, SystemPrompt};

/// How tool results participate in per-message content hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolResultStrategy {
    /// Hash the full result content.
    #[default]
    Strict,
    /// Tool results do not contribute to the hash at all.
    Ignore,
    /// Only the block type contributes.
    NameOnly,
}

pub(crate) fn md5_hex(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Normalise text before hashing: exotic arrow glyphs map to ASCII, control
/// characters and private-use codepoints are dropped. Clients re-render these
/// inconsistently between turns, which would break prefix matching.
pub(crate) fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '→' | '⟶' | '➔' | '➜' | '⇉' => out.push_str("->"),
            '⇒' | '⟹' => out.push_str("=>"),
            '←' | '⟵' => out.push_str("<-"),
            '⇐' | '⟸' => out.push_str("<="),
            '↔' | '⇔' => out.push_str("<->"),
            '\n' | '\t' => out.push(c),
            c if c.is_control() => {}
            '\u{e000}'..='\u{f8ff}' | '\u{f0000}'..='\u{ffffd}' | '\u{100000}'..='\u{10fffd}' => {}
            c => out.push(c),
        }
    }
    out
}

/// The cache identity: a hash over everything stable across conversation
/// turns (model, system, tools, tool_choice, thinking config). Volatile
/// per-turn fields never participate.
pub(crate) fn stable_prefix_hash(request: &MessagesRequest) -> String {
    let stable_system = match &request.system {
        None => Value::Null,
        Some(SystemPrompt::Text(text)) => json!(text),
        Some(SystemPrompt::Blocks(blocks)) => Value::Array(
            blocks
                .iter()
                .map(|block| {
                    json!({
                        "type": block.kind,
                        "text": block.text,
                        "cache_control": block.cache_control,
                    })
                })
                .collect(),
        ),
    };
    let stable_tools: Vec<Value> = request
        .tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.input_schema,
            })
        })
        .collect();
    let thinking = request.thinking.as_ref().map(|thinking| {
        json!({ "type": thinking.kind, "budget_tokens": thinking.budget_tokens })
    });

    let stable = json!({
        "model": request.model,
        "system": stable_system,
        "tools": stable_tools,
        "tool_choice": request.tool_choice,
        "thinking": thinking,
    });
    md5_hex(&stable.to_string())
}

/// Text projection of the static prefix, used for token accounting.
pub(crate) fn static_prefix_projection(request: &MessagesRequest) -> String {
    let mut out = String::new();
    if let Some(system) = &request.system {
        out.push_str(&normalize_text(&system.joined_text()));
    }
    for tool in &request.tools {
        out.push('\n');
        out.push_str(&tool.name);
        if let Some(description) = &tool.description {
            out.push(':');
            out.push_str(&normalize_text(description));
        }
        if let Some(schema) = &tool.input_schema {
            out.push(':');
            out.push_str(&schema.to_string());
        }
    }
    out
}

/// Role-prefixed stable projection of one message. Volatile fields
/// (`cache_control`, `tool_use_id`, `id`, `input`) are excluded; images
/// contribute a compact fingerprint instead of raw base64.
pub(crate) fn message_projection(message: &Message, strategy: ToolResultStrategy) -> String {
    let mut parts: Vec<String> = vec![format!("role:{}", message.role.as_str())];
    match &message.content {
        MessageContent::Text(text) => parts.push(format!("text:{}", normalize_text(text))),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text, .. } => {
                        parts.push(format!("text:{}", normalize_text(text)));
                    }
                    ContentBlock::Thinking { thinking, .. } => {
                        parts.push(format!("thinking:{}", normalize_text(thinking)));
                    }
                    ContentBlock::Image { source, .. } => {
                        parts.push(image_fingerprint(&source.data));
                    }
                    ContentBlock::ToolUse { name, .. } => {
                        parts.push(format!("tool_use:{name}"));
                    }
                    ContentBlock::ToolResult { content, .. } => match strategy {
                        ToolResultStrategy::Ignore => {}
                        ToolResultStrategy::NameOnly => parts.push("tool_result".to_string()),
                        ToolResultStrategy::Strict => {
                            let text = match content {
                                None => String::new(),
                                Some(Value::String(text)) => text.clone(),
                                Some(other) => other.to_string(),
                            };
                            parts.push(format!("tool_result:{}", normalize_text(&text)));
                        }
                    },
                }
            }
        }
    }
    parts.join("|")
}

pub(crate) fn message_content_hash(message: &Message, strategy: ToolResultStrategy) -> String {
    md5_hex(&message_projection(message, strategy))
}

fn image_fingerprint(data: &str) -> String {
    let head: String = data.chars().take(32).collect();
    let tail: String = if data.chars().count() > 32 {
        data.chars().rev().take(32).collect::<Vec<_>>().into_iter().rev().collect()
    } else {
        String::new()
    };
    format!("img:{}:{}:{}", data.len(), head, tail)
}
