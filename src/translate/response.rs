//! Non-streaming response conversion.

use chrono::Utc;
use serde_json::{json, Value};

use super::{finish_to_stop_reason, stop_to_finish_reason};
use crate::error::GatewayError;
use crate::wire::{
    AnthropicUsage, ChatChoice, ChatContent, ChatMessage, ChatResponse, ChatRole, ContentBlock,
    MessagesResponse, OpenAiUsage, ToolCall,
};

/// Convert an upstream Anthropic response into the OpenAI shape the client
/// expects. Text blocks concatenate into the message content; `tool_use`
/// blocks become `tool_calls` in block order.
pub fn messages_response_to_chat(resp: MessagesResponse) -> ChatResponse {
    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in resp.content {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::Thinking { thinking, .. } => text.push_str(&thinking),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                kind: "function".to_string(),
                function: crate::wire::FunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            ContentBlock::ToolResult { .. } => {}
        }
    }

    let finish_reason = resp
        .stop_reason
        .as_deref()
        .map(stop_to_finish_reason)
        .unwrap_or("stop")
        .to_string();

    ChatResponse {
        id: resp.id,
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: resp.model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: ChatRole::Assistant,
                content: if text.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(ChatContent::Text(text))
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
                name: None,
            },
            finish_reason: Some(finish_reason),
        }],
        usage: Some(OpenAiUsage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
            total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
        }),
    }
}

/// Convert an upstream OpenAI response into the Anthropic shape the client
/// expects. Only the first choice is considered.
pub fn chat_response_to_messages(resp: ChatResponse) -> Result<MessagesResponse, GatewayError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::Translation("upstream response has no choices".into()))?;

    let mut content: Vec<ContentBlock> = Vec::new();
    let text = choice.message.text_content();
    if !text.is_empty() {
        content.push(ContentBlock::Text { text });
    }
    for call in choice.message.tool_calls.unwrap_or_default() {
        let input: Value =
            serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
        content.push(ContentBlock::ToolUse {
            id: call.id,
            name: call.function.name,
            input,
        });
    }

    let stop_reason = choice
        .finish_reason
        .as_deref()
        .map(finish_to_stop_reason)
        .unwrap_or("end_turn")
        .to_string();

    let usage = resp.usage.unwrap_or_default();

    Ok(MessagesResponse {
        id: resp.id,
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: resp.model,
        content,
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage: AnthropicUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_response_to_chat() {
        let resp: MessagesResponse = serde_json::from_str(
            r#"{"id":"msg_1","type":"message","role":"assistant","model":"claude-x",
                "content":[{"type":"text","text":"hello"}],
                "stop_reason":"end_turn","usage":{"input_tokens":3,"output_tokens":5}}"#,
        )
        .unwrap();

        let out = messages_response_to_chat(resp);
        assert_eq!(out.choices[0].message.text_content(), "hello");
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("stop"));
        let usage = out.usage.unwrap();
        assert_eq!((usage.prompt_tokens, usage.completion_tokens, usage.total_tokens), (3, 5, 8));
    }

    #[test]
    fn test_tool_use_to_tool_calls_preserves_order() {
        let resp: MessagesResponse = serde_json::from_str(
            r#"{"id":"msg_1","type":"message","role":"assistant","model":"claude-x",
                "content":[
                    {"type":"tool_use","id":"toolu_a","name":"first","input":{"n":1}},
                    {"type":"tool_use","id":"toolu_b","name":"second","input":{"n":2}}
                ],
                "stop_reason":"tool_use","usage":{"input_tokens":1,"output_tokens":1}}"#,
        )
        .unwrap();

        let out = messages_response_to_chat(resp);
        let message = &out.choices[0].message;
        assert!(message.content.is_none());
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "first");
        assert_eq!(calls[1].function.name, "second");
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn test_chat_response_to_messages() {
        let resp: ChatResponse = serde_json::from_str(
            r#"{"id":"chatcmpl-1","object":"chat.completion","created":1,"model":"gpt-4o",
                "choices":[{"index":0,"message":{"role":"assistant","content":"hi"},"finish_reason":"length"}],
                "usage":{"prompt_tokens":10,"completion_tokens":2,"total_tokens":12}}"#,
        )
        .unwrap();

        let out = chat_response_to_messages(resp).unwrap();
        assert_eq!(out.kind, "message");
        assert!(matches!(&out.content[0], ContentBlock::Text { text } if text == "hi"));
        assert_eq!(out.stop_reason.as_deref(), Some("max_tokens"));
        assert_eq!(out.usage.input_tokens, 10);
        assert_eq!(out.usage.output_tokens, 2);
    }

    #[test]
    fn test_missing_usage_defaults_to_zero() {
        let resp: ChatResponse = serde_json::from_str(
            r#"{"id":"chatcmpl-1","object":"chat.completion","created":1,"model":"gpt-4o",
                "choices":[{"index":0,"message":{"role":"assistant","content":"x"},"finish_reason":"stop"}]}"#,
        )
        .unwrap();

        let out = chat_response_to_messages(resp).unwrap();
        assert_eq!(out.usage.input_tokens, 0);
        assert_eq!(out.usage.output_tokens, 0);
    }

    #[test]
    fn test_empty_choices_is_translation_error() {
        let resp: ChatResponse = serde_json::from_str(
            r#"{"id":"c","object":"chat.completion","created":1,"model":"m","choices":[]}"#,
        )
        .unwrap();
        assert!(matches!(
            chat_response_to_messages(resp),
            Err(GatewayError::Translation(_))
        ));
    }

    #[test]
    fn test_openai_response_round_trip_preserves_text_and_usage() {
        let original: ChatResponse = serde_json::from_str(
            r#"{"id":"chatcmpl-9","object":"chat.completion","created":7,"model":"gpt-4o",
                "choices":[{"index":0,"message":{"role":"assistant","content":"the answer"},"finish_reason":"stop"}],
                "usage":{"prompt_tokens":11,"completion_tokens":4,"total_tokens":15}}"#,
        )
        .unwrap();

        let bridged = chat_response_to_messages(original.clone()).unwrap();
        let back = messages_response_to_chat(bridged);

        assert_eq!(
            back.choices[0].message.text_content(),
            original.choices[0].message.text_content()
        );
        let (a, b) = (back.usage.unwrap(), original.usage.unwrap());
        assert_eq!(a.prompt_tokens, b.prompt_tokens);
        assert_eq!(a.completion_tokens, b.completion_tokens);
    }
}
