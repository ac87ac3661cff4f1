//! Bidirectional conversion between the OpenAI and Anthropic wire formats.
//!
//! The dispatcher knows two axes: the client's request format (from the URL
//! path it hit) and the provider's wire format (from the registry). When they
//! match, translation is a no-op that only rewrites the `model` field;
//! otherwise requests and responses cross through the converters here.

mod request;
mod response;
mod stream;

pub use request::{chat_to_messages, messages_to_chat};
pub use response::{chat_response_to_messages, messages_response_to_chat};
pub use stream::{AnthropicToOpenAi, OpenAiToAnthropic, SseBuffer};

use serde_json::{json, Value};

use crate::error::GatewayError;

/// Default `max_tokens` injected when an inbound OpenAI request omits it;
/// the Anthropic side requires the field.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Map an OpenAI finish reason onto an Anthropic stop reason.
pub fn finish_to_stop_reason(finish: &str) -> &'static str {
    match finish {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        "content_filter" => "stop_sequence",
        _ => "end_turn",
    }
}

/// Map an Anthropic stop reason onto an OpenAI finish reason.
pub fn stop_to_finish_reason(stop: &str) -> &'static str {
    match stop {
        "end_turn" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "stop_sequence" => "content_filter",
        _ => "stop",
    }
}

/// Map an OpenAI `tool_choice` onto the Anthropic equivalent.
pub(crate) fn tool_choice_to_anthropic(choice: Value) -> Result<Value, GatewayError> {
    match &choice {
        Value::String(s) => match s.as_str() {
            "auto" => Ok(json!({"type": "auto"})),
            "none" => Ok(json!({"type": "none"})),
            "required" => Ok(json!({"type": "any"})),
            other => Err(GatewayError::Translation(format!(
                "unsupported tool_choice '{}'",
                other
            ))),
        },
        Value::Object(obj) => {
            let name = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
                .ok_or_else(|| {
                    GatewayError::Translation("tool_choice object missing function.name".into())
                })?;
            Ok(json!({"type": "tool", "name": name}))
        }
        _ => Err(GatewayError::Translation(
            "tool_choice must be a string or object".into(),
        )),
    }
}

/// Map an Anthropic `tool_choice` onto the OpenAI equivalent.
pub(crate) fn tool_choice_to_openai(choice: Value) -> Result<Value, GatewayError> {
    let kind = choice
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| GatewayError::Translation("tool_choice missing type".into()))?;
    match kind {
        "auto" => Ok(json!("auto")),
        "none" => Ok(json!("none")),
        "any" => Ok(json!("required")),
        "tool" => {
            let name = choice
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| GatewayError::Translation("tool_choice missing name".into()))?;
            Ok(json!({"type": "function", "function": {"name": name}}))
        }
        other => Err(GatewayError::Translation(format!(
            "unsupported tool_choice type '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_mapping_is_involutive() {
        for finish in ["stop", "length", "tool_calls", "content_filter"] {
            assert_eq!(stop_to_finish_reason(finish_to_stop_reason(finish)), finish);
        }
    }

    #[test]
    fn test_tool_choice_named_function() {
        let anthropic =
            tool_choice_to_anthropic(json!({"type": "function", "function": {"name": "lookup"}}))
                .unwrap();
        assert_eq!(anthropic, json!({"type": "tool", "name": "lookup"}));

        let back = tool_choice_to_openai(anthropic).unwrap();
        assert_eq!(back["function"]["name"], "lookup");
    }

    #[test]
    fn test_tool_choice_keywords() {
        assert_eq!(
            tool_choice_to_anthropic(json!("auto")).unwrap(),
            json!({"type": "auto"})
        );
        assert_eq!(tool_choice_to_openai(json!({"type": "none"})).unwrap(), json!("none"));
        assert_eq!(
            tool_choice_to_openai(json!({"type": "any"})).unwrap(),
            json!("required")
        );
    }
}
