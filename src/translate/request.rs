//! Request conversion between the two formats.

use serde_json::{json, Value};

use super::{tool_choice_to_anthropic, tool_choice_to_openai, DEFAULT_MAX_TOKENS};
use crate::error::GatewayError;
use crate::wire::{
    ChatContent, ChatMessage, ChatRequest, ChatRole, ChatTool, ContentBlock, FunctionDef,
    MessagesRequest, StopSpec, SystemPrompt, ToolSpec, Turn, TurnContent, TurnRole,
};

/// Convert an inbound OpenAI chat request into an Anthropic messages request
/// addressed at `upstream_model`.
///
/// System messages are lifted into the top-level `system` field, adjacent
/// same-role messages are merged, `tool` role messages become `tool_result`
/// blocks inside a user turn, and assistant `tool_calls` become `tool_use`
/// blocks.
pub fn chat_to_messages(
    req: ChatRequest,
    upstream_model: &str,
) -> Result<MessagesRequest, GatewayError> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut turns: Vec<Turn> = Vec::new();

    for msg in req.messages {
        match msg.role {
            ChatRole::System => system_parts.push(msg.text_content()),
            ChatRole::User => {
                push_merged(
                    &mut turns,
                    TurnRole::User,
                    vec![ContentBlock::Text {
                        text: msg.text_content(),
                    }],
                );
            }
            ChatRole::Assistant => {
                let mut blocks = Vec::new();
                let text = msg.text_content();
                if !text.is_empty() {
                    blocks.push(ContentBlock::Text { text });
                }
                for call in msg.tool_calls.unwrap_or_default() {
                    let input: Value =
                        serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id,
                        name: call.function.name,
                        input,
                    });
                }
                if blocks.is_empty() {
                    blocks.push(ContentBlock::Text { text: String::new() });
                }
                push_merged(&mut turns, TurnRole::Assistant, blocks);
            }
            ChatRole::Tool => {
                let tool_use_id = msg.tool_call_id.clone().ok_or_else(|| {
                    GatewayError::Translation("tool message missing tool_call_id".into())
                })?;
                let block = ContentBlock::ToolResult {
                    tool_use_id,
                    content: Some(Value::String(msg.text_content())),
                    is_error: None,
                };
                push_merged(&mut turns, TurnRole::User, vec![block]);
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(SystemPrompt::Text(system_parts.join("\n\n")))
    };

    let tools = req.tools.map(|tools| {
        tools
            .into_iter()
            .map(|t| ToolSpec {
                name: t.function.name,
                description: t.function.description,
                input_schema: t
                    .function
                    .parameters
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            })
            .collect()
    });

    let tool_choice = req.tool_choice.map(tool_choice_to_anthropic).transpose()?;

    // The caller tag crosses formats as metadata.user_id.
    let metadata = req.user.map(|user| json!({"user_id": user}));

    Ok(MessagesRequest {
        model: upstream_model.to_string(),
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages: turns,
        system,
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: req.stop.map(StopSpec::into_list),
        stream: req.stream,
        tools,
        tool_choice,
        metadata,
    })
}

/// Convert an inbound Anthropic messages request into an OpenAI chat request
/// addressed at `upstream_model`.
pub fn messages_to_chat(
    req: MessagesRequest,
    upstream_model: &str,
) -> Result<ChatRequest, GatewayError> {
    let mut messages: Vec<ChatMessage> = Vec::new();

    if let Some(system) = req.system {
        messages.push(ChatMessage::text(ChatRole::System, system.into_text()));
    }

    for turn in req.messages {
        match turn.role {
            TurnRole::User => {
                // tool_result blocks surface as `tool` role messages, text
                // accumulates into user messages, block order preserved.
                let mut text_acc = String::new();
                for block in turn.content.into_blocks() {
                    match block {
                        ContentBlock::Text { text } => text_acc.push_str(&text),
                        ContentBlock::Thinking { thinking, .. } => text_acc.push_str(&thinking),
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => {
                            if !text_acc.is_empty() {
                                messages.push(ChatMessage::text(
                                    ChatRole::User,
                                    std::mem::take(&mut text_acc),
                                ));
                            }
                            messages.push(ChatMessage {
                                role: ChatRole::Tool,
                                content: Some(ChatContent::Text(tool_result_text(content))),
                                tool_calls: None,
                                tool_call_id: Some(tool_use_id),
                                name: None,
                            });
                        }
                        ContentBlock::ToolUse { .. } => {
                            return Err(GatewayError::Translation(
                                "tool_use block in a user turn".into(),
                            ));
                        }
                    }
                }
                if !text_acc.is_empty() {
                    messages.push(ChatMessage::text(ChatRole::User, text_acc));
                }
            }
            TurnRole::Assistant => {
                let mut text_acc = String::new();
                let mut tool_calls = Vec::new();
                for block in turn.content.into_blocks() {
                    match block {
                        ContentBlock::Text { text } => text_acc.push_str(&text),
                        ContentBlock::Thinking { thinking, .. } => text_acc.push_str(&thinking),
                        ContentBlock::ToolUse { id, name, input } => {
                            tool_calls.push(crate::wire::ToolCall {
                                id,
                                kind: "function".to_string(),
                                function: crate::wire::FunctionCall {
                                    name,
                                    arguments: input.to_string(),
                                },
                            });
                        }
                        ContentBlock::ToolResult { .. } => {
                            return Err(GatewayError::Translation(
                                "tool_result block in an assistant turn".into(),
                            ));
                        }
                    }
                }
                messages.push(ChatMessage {
                    role: ChatRole::Assistant,
                    content: if text_acc.is_empty() && !tool_calls.is_empty() {
                        None
                    } else {
                        Some(ChatContent::Text(text_acc))
                    },
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                    tool_call_id: None,
                    name: None,
                });
            }
        }
    }

    let tools = req.tools.map(|tools| {
        tools
            .into_iter()
            .map(|t| ChatTool {
                kind: "function".to_string(),
                function: FunctionDef {
                    name: t.name,
                    description: t.description,
                    parameters: Some(t.input_schema),
                },
            })
            .collect()
    });

    let tool_choice = req.tool_choice.map(tool_choice_to_openai).transpose()?;

    let user = req
        .metadata
        .as_ref()
        .and_then(|m| m.get("user_id"))
        .and_then(|u| u.as_str())
        .map(str::to_string);

    Ok(ChatRequest {
        model: upstream_model.to_string(),
        messages,
        max_tokens: Some(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop_sequences.map(StopSpec::Many),
        stream: req.stream,
        tools,
        tool_choice,
        user,
    })
}

fn tool_result_text(content: Option<Value>) -> String {
    match content {
        Some(Value::String(s)) => s,
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn push_merged(turns: &mut Vec<Turn>, role: TurnRole, blocks: Vec<ContentBlock>) {
    if let Some(last) = turns.last_mut() {
        if last.role == role {
            let mut merged =
                std::mem::replace(&mut last.content, TurnContent::Text(String::new())).into_blocks();
            merged.extend(blocks);
            last.content = TurnContent::Blocks(merged);
            return;
        }
    }
    turns.push(Turn {
        role,
        content: TurnContent::Blocks(blocks),
    });
}
