use std::collections::HashSet;

use serde_json::{Value, json};

use aigate_protocol::{ContentBlock, Message, MessageContent, MessagesRequest, Role};

const MAX_TOOL_DESCRIPTION_CHARS: usize = 9216;
/// Only this many trailing messages keep their images; older ones get a
/// textual placeholder to cap payload size on long conversations.
const IMAGE_HISTORY_WINDOW: usize = 5;
const CONTINUATION_TEXT: &str = "Continue";

#[derive(Debug, Default, Clone)]
struct Turn {
    role: Option<Role>,
    text: String,
    images: Vec<Value>,
    tool_uses: Vec<Value>,
    tool_results: Vec<Value>,
}

impl Turn {
    fn user(text: impl Into<String>) -> Self {
        Self {
            role: Some(Role::User),
            text: text.into(),
            ..Default::default()
        }
    }

    fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Some(Role::Assistant),
            text: text.into(),
            ..Default::default()
        }
    }

    fn is_assistant(&self) -> bool {
        self.role == Some(Role::Assistant)
    }

    fn push_text(&mut self, text: &str) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(text);
    }
}

/// Translate an Anthropic-shaped request into the Kiro conversation payload.
pub(crate) fn build_request_body(
    request: &MessagesRequest,
    profile_arn: Option<&str>,
    conversation_id: &str,
) -> Value {
    let mut messages: Vec<Message> = request.messages.clone();
    drop_noop_continuation(&mut messages);
    let messages = merge_adjacent_same_role(messages);

    let mut turns: Vec<Turn> = messages.iter().map(message_to_turn).collect();
    apply_system_prompt(request, &mut turns);
    elide_old_images(&mut turns);

    // The upstream requires the terminal message to be user-role.
    let last_is_assistant = turns.last().map(Turn::is_assistant).unwrap_or(false);
    let current = if turns.is_empty() || last_is_assistant {
        Turn::user(CONTINUATION_TEXT)
    } else {
        turns.pop().expect("checked non-empty")
    };
    // History must end on an assistant turn before the final user message.
    let needs_assistant_tail = turns.last().map(|turn| !turn.is_assistant()).unwrap_or(false);
    if needs_assistant_tail {
        turns.push(Turn::assistant(CONTINUATION_TEXT));
    }

    let tools = render_tools(request);
    let history: Vec<Value> = turns
        .iter()
        .map(|turn| render_history_entry(turn, &request.model))
        .collect();

    let mut body = json!({
        "conversationState": {
            "chatTriggerType": "MANUAL",
            "conversationId": conversation_id,
            "currentMessage": {
                "userInputMessage": render_user_message(&current, &request.model, &tools),
            },
            "history": history,
        }
    });
    if let Some(profile_arn) = profile_arn {
        body["profileArn"] = Value::String(profile_arn.to_string());
    }
    body
}

/// Some clients send a trailing assistant turn whose whole content is the
/// literal `"{"`; it is a no-op continuation marker.
fn drop_noop_continuation(messages: &mut Vec<Message>) {
    let is_noop = messages
        .last()
        .map(|message| {
            message.role == Role::Assistant && message_plain_text(message).trim() == "{"
        })
        .unwrap_or(false);
    if is_noop {
        messages.pop();
    }
}

fn message_plain_text(message: &Message) -> String {
    match &message.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn merge_adjacent_same_role(messages: Vec<Message>) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match merged.last_mut() {
            Some(previous) if previous.role == message.role => {
                merge_content(&mut previous.content, message.content);
            }
            _ => merged.push(message),
        }
    }
    merged
}

fn merge_content(target: &mut MessageContent, incoming: MessageContent) {
    let current = std::mem::replace(target, MessageContent::Text(String::new()));
    *target = match (current, incoming) {
        (MessageContent::Text(mut existing), MessageContent::Text(more)) => {
            existing.push('\n');
            existing.push_str(&more);
            MessageContent::Text(existing)
        }
        (MessageContent::Blocks(mut existing), MessageContent::Blocks(more)) => {
            existing.extend(more);
            MessageContent::Blocks(existing)
        }
        (MessageContent::Text(text), MessageContent::Blocks(more)) => {
            let mut blocks = Vec::with_capacity(more.len() + 1);
            blocks.push(ContentBlock::text(text));
            blocks.extend(more);
            MessageContent::Blocks(blocks)
        }
        (MessageContent::Blocks(mut existing), MessageContent::Text(more)) => {
            existing.push(ContentBlock::text(more));
            MessageContent::Blocks(existing)
        }
    };
}

fn message_to_turn(message: &Message) -> Turn {
    let mut turn = Turn {
        role: Some(message.role),
        ..Default::default()
    };
    match &message.content {
        MessageContent::Text(text) => {
            if !text.is_empty() {
                turn.push_text(text);
            }
        }
        MessageContent::Blocks(blocks) => {
            // The upstream rejects duplicated tool results inside one message.
            let mut seen_tool_results: HashSet<String> = HashSet::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text, .. } => {
                        if !text.is_empty() {
                            turn.push_text(text);
                        }
                    }
                    ContentBlock::Thinking { thinking, .. } => {
                        turn.push_text(&format!("<thinking>{thinking}</thinking>"));
                    }
                    ContentBlock::Image { source, .. } => {
                        turn.images.push(json!({
                            "format": image_format(source.media_type.as_deref()),
                            "source": { "bytes": source.data },
                        }));
                    }
                    ContentBlock::ToolUse {
                        id, name, input, ..
                    } => {
                        turn.tool_uses.push(json!({
                            "toolUseId": id,
                            "name": name,
                            "input": input,
                        }));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                        ..
                    } => {
                        if !seen_tool_results.insert(tool_use_id.clone()) {
                            continue;
                        }
                        turn.tool_results.push(json!({
                            "toolUseId": tool_use_id,
                            "content": [{ "text": tool_result_text(content.as_ref()) }],
                            "status": if is_error.unwrap_or(false) { "error" } else { "success" },
                        }));
                    }
                }
            }
        }
    }
    turn
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|text| text.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}

fn image_format(media_type: Option<&str>) -> String {
    media_type
        .and_then(|value| value.split('/').nth(1))
        .unwrap_or("png")
        .to_string()
}

fn apply_system_prompt(request: &MessagesRequest, turns: &mut Vec<Turn>) {
    let Some(system) = &request.system else {
        return;
    };
    let system_text = system.joined_text();
    if system_text.trim().is_empty() {
        return;
    }
    match turns.first_mut() {
        Some(first) if first.role == Some(Role::User) => {
            let existing = std::mem::take(&mut first.text);
            first.text = if existing.is_empty() {
                system_text
            } else {
                format!("{system_text}\n\n{existing}")
            };
        }
        _ => turns.insert(0, Turn::user(system_text)),
    }
}

fn elide_old_images(turns: &mut [Turn]) {
    let keep_from = turns.len().saturating_sub(IMAGE_HISTORY_WINDOW);
    for turn in turns.iter_mut().take(keep_from) {
        if turn.images.is_empty() {
            continue;
        }
        let count = turn.images.len();
        turn.images.clear();
        turn.push_text(&format!("[此消息包含 {count} 张图片，已在历史记录中省略]"));
    }
}

fn render_tools(request: &MessagesRequest) -> Vec<Value> {
    request
        .tools
        .iter()
        .filter(|tool| {
            let lowered = tool.name.to_ascii_lowercase();
            lowered != "web_search" && lowered != "websearch"
        })
        .map(|tool| {
            let description = tool.description.clone().unwrap_or_default();
            let description = if description.chars().count() > MAX_TOOL_DESCRIPTION_CHARS {
                let truncated: String =
                    description.chars().take(MAX_TOOL_DESCRIPTION_CHARS).collect();
                format!("{truncated}...")
            } else {
                description
            };
            json!({
                "toolSpecification": {
                    "name": tool.name,
                    "description": description,
                    "inputSchema": { "json": tool.input_schema.clone().unwrap_or(json!({})) },
                }
            })
        })
        .collect()
}

fn render_user_message(turn: &Turn, model: &str, tools: &[Value]) -> Value {
    let mut message = json!({
        "content": turn.text,
        "modelId": model,
        "origin": "AI_EDITOR",
    });
    if !turn.images.is_empty() {
        message["images"] = Value::Array(turn.images.clone());
    }
    let mut context = serde_json::Map::new();
    if !turn.tool_results.is_empty() {
        context.insert(
            "toolResults".to_string(),
            Value::Array(turn.tool_results.clone()),
        );
    }
    if !tools.is_empty() {
        context.insert("tools".to_string(), Value::Array(tools.to_vec()));
    }
    if !context.is_empty() {
        message["userInputMessageContext"] = Value::Object(context);
    }
    message
}

fn render_history_entry(turn: &Turn, model: &str) -> Value {
    if turn.is_assistant() {
        let mut message = json!({ "content": turn.text });
        if !turn.tool_uses.is_empty() {
            message["toolUses"] = Value::Array(turn.tool_uses.clone());
        }
        json!({ "assistantResponseMessage": message })
    } else {
        json!({ "userInputMessage": render_user_message(turn, model, &[]) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigate_protocol::{ImageSource, SystemPrompt, ToolDefinition};

    fn request_with(messages: Vec<Message>) -> MessagesRequest {
        MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            system: None,
            messages,
            tools: Vec::new(),
            tool_choice: None,
            thinking: None,
            max_tokens: None,
            stream: Some(true),
        }
    }

    fn current_content(body: &Value) -> &str {
        body["conversationState"]["currentMessage"]["userInputMessage"]["content"]
            .as_str()
            .unwrap()
    }

    fn history(body: &Value) -> &Vec<Value> {
        body["conversationState"]["history"].as_array().unwrap()
    }

    #[test]
    fn trailing_brace_assistant_is_dropped() {
        let request = request_with(vec![Message::user("hello"), Message::assistant("{")]);
        let body = build_request_body(&request, None, "c1");
        assert_eq!(current_content(&body), "hello");
        assert!(history(&body).is_empty());
    }

    #[test]
    fn adjacent_same_role_messages_merge_with_newline() {
        let request = request_with(vec![
            Message::user("first"),
            Message::user("second"),
            Message::assistant("answer"),
            Message::user("third"),
        ]);
        let body = build_request_body(&request, None, "c1");
        let history = history(&body);
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[0]["userInputMessage"]["content"].as_str().unwrap(),
            "first\nsecond"
        );
        assert_eq!(
            history[1]["assistantResponseMessage"]["content"]
                .as_str()
                .unwrap(),
            "answer"
        );
        assert_eq!(current_content(&body), "third");
    }

    #[test]
    fn system_becomes_prefix_when_first_message_is_user() {
        let mut request = request_with(vec![Message::user("question")]);
        request.system = Some(SystemPrompt::Text("be brief".to_string()));
        let body = build_request_body(&request, None, "c1");
        assert_eq!(current_content(&body), "be brief\n\nquestion");
    }

    #[test]
    fn system_becomes_leading_user_turn_otherwise() {
        let mut request = request_with(vec![
            Message::assistant("earlier answer"),
            Message::user("question"),
        ]);
        request.system = Some(SystemPrompt::Text("be brief".to_string()));
        let body = build_request_body(&request, None, "c1");
        let history = history(&body);
        assert_eq!(
            history[0]["userInputMessage"]["content"].as_str().unwrap(),
            "be brief"
        );
        assert_eq!(
            history[1]["assistantResponseMessage"]["content"]
                .as_str()
                .unwrap(),
            "earlier answer"
        );
        assert_eq!(current_content(&body), "question");
    }

    #[test]
    fn thinking_blocks_collapse_into_wrappers() {
        let assistant = Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![
                ContentBlock::Thinking {
                    thinking: "pondering".to_string(),
                    signature: None,
                },
                ContentBlock::text("the answer"),
            ]),
            cache_control: None,
        };
        let request = request_with(vec![Message::user("q"), assistant, Message::user("next")]);
        let body = build_request_body(&request, None, "c1");
        assert_eq!(
            history(&body)[1]["assistantResponseMessage"]["content"]
                .as_str()
                .unwrap(),
            "<thinking>pondering</thinking>\nthe answer"
        );
    }

    #[test]
    fn trailing_assistant_moves_to_history_with_continue_current() {
        let request = request_with(vec![Message::user("q"), Message::assistant("partial")]);
        let body = build_request_body(&request, None, "c1");
        assert_eq!(current_content(&body), "Continue");
        let history = history(&body);
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[1]["assistantResponseMessage"]["content"]
                .as_str()
                .unwrap(),
            "partial"
        );
    }

    #[test]
    fn tool_reply_merges_and_history_stays_alternating() {
        let assistant = Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                id: "tu_1".to_string(),
                name: "lookup".to_string(),
                input: json!({"q": 1}),
                cache_control: None,
            }]),
            cache_control: None,
        };
        let tool_reply = Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "tu_1".to_string(),
                content: Some(json!("42")),
                is_error: None,
                cache_control: None,
            }]),
            cache_control: None,
        };
        let request = request_with(vec![
            Message::user("q"),
            assistant,
            tool_reply,
            Message::user("follow-up"),
        ]);
        // user-role tool_reply merges with the following user message, so the
        // remaining history is [user, assistant] and stays alternating.
        let body = build_request_body(&request, None, "c1");
        let history = history(&body);
        assert!(history.last().unwrap()["assistantResponseMessage"].is_object());
    }

    #[test]
    fn old_images_are_elided_with_placeholder() {
        let image = |name: &str| Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![
                ContentBlock::text(name),
                ContentBlock::Image {
                    source: ImageSource {
                        kind: "base64".to_string(),
                        media_type: Some("image/png".to_string()),
                        data: "aGVsbG8=".to_string(),
                    },
                    cache_control: None,
                },
            ]),
            cache_control: None,
        };
        let mut messages = Vec::new();
        for i in 0..4 {
            messages.push(image(&format!("m{i}")));
            messages.push(Message::assistant(format!("a{i}")));
        }
        let request = request_with(messages);
        let body = build_request_body(&request, None, "c1");
        let history = history(&body);
        // 8 turns total; only the final 5 keep images.
        let first = history[0]["userInputMessage"].clone();
        assert!(first.get("images").is_none());
        assert!(
            first["content"]
                .as_str()
                .unwrap()
                .contains("[此消息包含 1 张图片，已在历史记录中省略]")
        );
        let recent = history[6]["userInputMessage"].clone();
        assert!(recent.get("images").is_some());
    }

    #[test]
    fn duplicate_tool_results_collapse_per_message() {
        let tool_reply = Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![
                ContentBlock::ToolResult {
                    tool_use_id: "tu_1".to_string(),
                    content: Some(json!("first")),
                    is_error: None,
                    cache_control: None,
                },
                ContentBlock::ToolResult {
                    tool_use_id: "tu_1".to_string(),
                    content: Some(json!("second copy")),
                    is_error: None,
                    cache_control: None,
                },
            ]),
            cache_control: None,
        };
        let request = request_with(vec![tool_reply]);
        let body = build_request_body(&request, None, "c1");
        let results = body["conversationState"]["currentMessage"]["userInputMessage"]
            ["userInputMessageContext"]["toolResults"]
            .as_array()
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["toolUseId"], "tu_1");
    }

    #[test]
    fn web_search_tools_filtered_and_long_descriptions_truncated() {
        let mut request = request_with(vec![Message::user("q")]);
        request.tools = vec![
            ToolDefinition {
                name: "WebSearch".to_string(),
                description: Some("search".to_string()),
                input_schema: None,
                cache_control: None,
            },
            ToolDefinition {
                name: "lookup".to_string(),
                description: Some("d".repeat(MAX_TOOL_DESCRIPTION_CHARS + 100)),
                input_schema: Some(json!({"type": "object"})),
                cache_control: None,
            },
        ];
        let body = build_request_body(&request, None, "c1");
        let tools = body["conversationState"]["currentMessage"]["userInputMessage"]
            ["userInputMessageContext"]["tools"]
            .as_array()
            .unwrap();
        assert_eq!(tools.len(), 1);
        let description = tools[0]["toolSpecification"]["description"].as_str().unwrap();
        assert_eq!(
            description.chars().count(),
            MAX_TOOL_DESCRIPTION_CHARS + 3
        );
        assert!(description.ends_with("..."));
    }

    #[test]
    fn profile_arn_is_carried_when_present() {
        let request = request_with(vec![Message::user("q")]);
        let body = build_request_body(&request, Some("arn:aws:codewhisperer:p"), "c1");
        assert_eq!(body["profileArn"], "arn:aws:codewhisperer:p");
        assert_eq!(body["conversationState"]["conversationId"], "c1");
    }
}
