//! Typed request and response shapes for the two wire formats.
//!
//! Both APIs are loosely specified with many optional fields, so the shapes
//! here model the fields the gateway inspects or rewrites as tagged structs
//! with optionals, and carry pass-through extras (`user`, `metadata`)
//! explicitly. Unknown inbound fields are dropped on translation and kept
//! verbatim on same-format passthrough, where only `model` is rewritten.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── OpenAI chat-completions ────────────────────────────────────────────────

/// `POST /chat/completions` request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ChatTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    /// Pass-through caller tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// `stop` accepts a single sequence or a list.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSpec {
    One(String),
    Many(Vec<String>),
}

impl StopSpec {
    pub fn into_list(self) -> Vec<String> {
        match self {
            StopSpec::One(s) => vec![s],
            StopSpec::Many(v) => v,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<ChatContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Set on `tool` role messages: the call this result answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(ChatContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    /// Concatenated text of the message, flattening content parts.
    pub fn text_content(&self) -> String {
        match &self.content {
            Some(ChatContent::Text(s)) => s.clone(),
            Some(ChatContent::Parts(parts)) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(""),
            None => String::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Message content: plain string or multi-part array.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<Value>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments object.
    pub arguments: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDef,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Non-streaming `chat/completions` response. Boilerplate fields default so
/// loosely compatible upstreams do not read as malformed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<OpenAiUsage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OpenAiUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

// ─── Anthropic messages ─────────────────────────────────────────────────────

/// `POST /v1/messages` request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<Turn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    /// Pass-through request metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// The top-level system prompt: a string or an array of blocks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl SystemPrompt {
    pub fn into_text(self) -> String {
        match self {
            SystemPrompt::Text(s) => s,
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .filter_map(ContentBlock::text)
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

/// One conversation turn: `user` or `assistant` only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: TurnContent,
}

impl Turn {
    pub fn text(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: TurnContent::Text(content.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl TurnContent {
    pub fn into_blocks(self) -> Vec<ContentBlock> {
        match self {
            TurnContent::Text(text) => vec![ContentBlock::Text { text }],
            TurnContent::Blocks(blocks) => blocks,
        }
    }
}

/// Anthropic content block.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    /// Extended reasoning; translated as plain text.
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

impl ContentBlock {
    /// Readable text carried by the block, if any.
    pub fn text(&self) -> Option<String> {
        match self {
            ContentBlock::Text { text } => Some(text.clone()),
            ContentBlock::Thinking { thinking, .. } => Some(thinking.clone()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Non-streaming `v1/messages` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub model: String,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    #[serde(default)]
    pub usage: AnthropicUsage,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_minimal_roundtrip() {
        let json = r#"{"model":"sonnet","messages":[{"role":"user","content":"hi"}]}"#;
        let req: ChatRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.model, "sonnet");
        assert_eq!(req.messages[0].role, ChatRole::User);
        assert_eq!(req.messages[0].text_content(), "hi");

        // Optional fields stay absent when serialised back.
        let out = serde_json::to_value(&req).unwrap();
        assert!(out.get("temperature").is_none());
        assert!(out.get("stop").is_none());
    }

    #[test]
    fn test_stop_spec_scalar_and_list() {
        let req: ChatRequest = serde_json::from_str(
            r#"{"model":"m","messages":[],"stop":"END"}"#,
        )
        .unwrap();
        assert_eq!(req.stop.unwrap().into_list(), vec!["END"]);

        let req: ChatRequest = serde_json::from_str(
            r#"{"model":"m","messages":[],"stop":["a","b"]}"#,
        )
        .unwrap();
        assert_eq!(req.stop.unwrap().into_list(), vec!["a", "b"]);
    }

    #[test]
    fn test_multipart_content_text_flattening() {
        let json = r#"{"role":"user","content":[{"type":"text","text":"one "},{"type":"text","text":"two"}]}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.text_content(), "one two");
    }

    #[test]
    fn test_content_block_tagging() {
        let block: ContentBlock = serde_json::from_str(
            r#"{"type":"tool_use","id":"toolu_1","name":"get_weather","input":{"city":"Oslo"}}"#,
        )
        .unwrap();
        match &block {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "toolu_1");
                assert_eq!(name, "get_weather");
                assert_eq!(input["city"], "Oslo");
            }
            other => panic!("unexpected block {:?}", other),
        }

        let out = serde_json::to_value(&block).unwrap();
        assert_eq!(out["type"], "tool_use");
    }

    #[test]
    fn test_thinking_block_reads_as_text() {
        let block: ContentBlock =
            serde_json::from_str(r#"{"type":"thinking","thinking":"step one"}"#).unwrap();
        assert_eq!(block.text().as_deref(), Some("step one"));
    }

    #[test]
    fn test_system_prompt_forms() {
        let req: MessagesRequest = serde_json::from_str(
            r#"{"model":"m","max_tokens":16,"messages":[],"system":"be terse"}"#,
        )
        .unwrap();
        assert_eq!(req.system.unwrap().into_text(), "be terse");

        let req: MessagesRequest = serde_json::from_str(
            r#"{"model":"m","max_tokens":16,"messages":[],"system":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}"#,
        )
        .unwrap();
        assert_eq!(req.system.unwrap().into_text(), "a\n\nb");
    }

    #[test]
    fn test_usage_defaults_to_zero() {
        let usage: AnthropicUsage = serde_json::from_str(r#"{"input_tokens":12}"#).unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 0);

        let usage: OpenAiUsage = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(usage.prompt_tokens, 0);
    }
}
