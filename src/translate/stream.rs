//! Streaming event conversion.
//!
//! Both formats deliver newline-delimited `data: <json>` chunks; Anthropic
//! emits typed events, OpenAI emits partial `choices[].delta` objects and
//! closes with `data: [DONE]`. Each direction is an explicit state machine
//! fed one data payload at a time, returning the SSE frames to forward to
//! the client. Tool-call ordering and text completeness are preserved.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{json, Value};

use super::{finish_to_stop_reason, stop_to_finish_reason};

/// Incremental splitter for `text/event-stream` bodies.
///
/// Network chunks land on arbitrary boundaries; `push` buffers partial lines
/// and returns the completed `data:` payloads.
#[derive(Default)]
pub struct SseBuffer {
    buf: String,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line = self.buf[..pos].trim().to_string();
            self.buf.drain(..=pos);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim().to_string());
            }
        }
        payloads
    }
}

fn data_frame(value: &Value) -> String {
    format!("data: {}\n\n", value)
}

fn event_frame(kind: &str, value: &Value) -> String {
    format!("event: {}\ndata: {}\n\n", kind, value)
}

// ─── Anthropic upstream → OpenAI client ─────────────────────────────────────

/// Collapses typed Anthropic events into OpenAI `chat.completion.chunk`
/// frames sharing one chunk id, closed with `data: [DONE]`.
pub struct AnthropicToOpenAi {
    chunk_id: String,
    model: String,
    created: i64,

    /// Anthropic block index → OpenAI tool_calls index.
    tool_indices: HashMap<u64, u64>,
    next_tool_index: u64,
    input_tokens: u64,

    /// A chunk carrying `finish_reason` has been emitted.
    finish_sent: bool,
    finished: bool,
}

impl AnthropicToOpenAi {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            chunk_id: format!("chatcmpl-{:016x}", rand::random::<u64>()),
            model: model.into(),
            created: Utc::now().timestamp(),
            tool_indices: HashMap::new(),
            next_tool_index: 0,
            input_tokens: 0,
            finish_sent: false,
            finished: false,
        }
    }

    /// Feed one upstream data payload; returns the client frames to send.
    /// An upstream `error` event returns `Err` with its message.
    pub fn on_payload(&mut self, payload: &str) -> Result<Vec<String>, String> {
        let Ok(event) = serde_json::from_str::<Value>(payload) else {
            return Ok(Vec::new());
        };

        match event["type"].as_str().unwrap_or("") {
            "message_start" => {
                if let Some(id) = event["message"]["id"].as_str() {
                    self.chunk_id = format!("chatcmpl-{}", id.trim_start_matches("msg_"));
                }
                self.input_tokens = event["message"]["usage"]["input_tokens"]
                    .as_u64()
                    .unwrap_or(0);
                Ok(vec![self.chunk(json!({"role": "assistant", "content": ""}), None, None)])
            }
            "content_block_start" => {
                let block_index = event["index"].as_u64().unwrap_or(0);
                let block = &event["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_indices.insert(block_index, tool_index);
                    Ok(vec![self.chunk(
                        json!({"tool_calls": [{
                            "index": tool_index,
                            "id": block["id"],
                            "type": "function",
                            "function": {"name": block["name"], "arguments": ""},
                        }]}),
                        None,
                        None,
                    )])
                } else {
                    Ok(Vec::new())
                }
            }
            "content_block_delta" => {
                let block_index = event["index"].as_u64().unwrap_or(0);
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or("");
                        Ok(vec![self.chunk(json!({"content": text}), None, None)])
                    }
                    // Extended reasoning streams as plain text.
                    "thinking_delta" => {
                        let text = delta["thinking"].as_str().unwrap_or("");
                        Ok(vec![self.chunk(json!({"content": text}), None, None)])
                    }
                    "input_json_delta" => {
                        let tool_index =
                            self.tool_indices.get(&block_index).copied().unwrap_or(0);
                        let partial = delta["partial_json"].as_str().unwrap_or("");
                        Ok(vec![self.chunk(
                            json!({"tool_calls": [{
                                "index": tool_index,
                                "function": {"arguments": partial},
                            }]}),
                            None,
                            None,
                        )])
                    }
                    _ => Ok(Vec::new()),
                }
            }
            "message_delta" => {
                let finish = event["delta"]["stop_reason"]
                    .as_str()
                    .map(stop_to_finish_reason)
                    .unwrap_or("stop");
                let output = event["usage"]["output_tokens"].as_u64().unwrap_or(0);
                let usage = json!({
                    "prompt_tokens": self.input_tokens,
                    "completion_tokens": output,
                    "total_tokens": self.input_tokens + output,
                });
                self.finish_sent = true;
                Ok(vec![self.chunk(json!({}), Some(finish), Some(usage))])
            }
            "message_stop" => {
                self.finished = true;
                Ok(vec!["data: [DONE]\n\n".to_string()])
            }
            "error" => Err(event["error"]["message"]
                .as_str()
                .unwrap_or("upstream stream error")
                .to_string()),
            // ping, content_block_stop, unknown
            _ => Ok(Vec::new()),
        }
    }

    /// Close out a stream the upstream ended without a terminal event.
    /// Mirrors the other direction's synthesized close: a final chunk with
    /// a fallback finish reason and usage, then the `[DONE]` marker, so the
    /// client always sees a non-null `finish_reason`.
    pub fn eof(&mut self) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut frames = Vec::new();
        if !self.finish_sent {
            self.finish_sent = true;
            let usage = json!({
                "prompt_tokens": self.input_tokens,
                "completion_tokens": 0,
                "total_tokens": self.input_tokens,
            });
            frames.push(self.chunk(json!({}), Some("stop"), Some(usage)));
        }
        frames.push("data: [DONE]\n\n".to_string());
        frames
    }

    fn chunk(&self, delta: Value, finish: Option<&str>, usage: Option<Value>) -> String {
        let mut obj = json!({
            "id": self.chunk_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
        });
        if let Some(usage) = usage {
            obj["usage"] = usage;
        }
        data_frame(&obj)
    }
}

// ─── OpenAI upstream → Anthropic client ─────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text,
    Tool { openai_index: u64 },
}

/// Expands OpenAI delta chunks into the typed Anthropic event sequence:
/// `message_start`, per-block `content_block_start`/`delta`/`stop`, then
/// `message_delta` and `message_stop` on finish.
pub struct OpenAiToAnthropic {
    message_id: String,
    model: String,
    started: bool,
    finished: bool,

    /// Currently open block: (anthropic block index, kind).
    open_block: Option<(u64, OpenBlock)>,
    next_block_index: u64,

    /// OpenAI tool_calls index → Anthropic block index.
    tool_blocks: HashMap<u64, u64>,
    input_tokens: u64,
    output_tokens: u64,
}

impl OpenAiToAnthropic {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            message_id: format!("msg_{:016x}", rand::random::<u64>()),
            model: model.into(),
            started: false,
            finished: false,
            open_block: None,
            next_block_index: 0,
            tool_blocks: HashMap::new(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Feed one upstream data payload; returns the client frames to send.
    pub fn on_payload(&mut self, payload: &str) -> Result<Vec<String>, String> {
        if payload == "[DONE]" {
            return Ok(self.close("end_turn"));
        }
        let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
            return Ok(Vec::new());
        };
        if let Some(error) = chunk.get("error") {
            return Err(error["message"]
                .as_str()
                .unwrap_or("upstream stream error")
                .to_string());
        }

        let mut frames = Vec::new();
        self.ensure_started(&mut frames);

        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            self.input_tokens = usage["prompt_tokens"].as_u64().unwrap_or(self.input_tokens);
            self.output_tokens = usage["completion_tokens"]
                .as_u64()
                .unwrap_or(self.output_tokens);
        }

        let choice = &chunk["choices"][0];
        let delta = &choice["delta"];

        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                self.ensure_text_block(&mut frames);
                let index = self.open_block.map(|(i, _)| i).unwrap_or(0);
                frames.push(event_frame(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "text_delta", "text": text},
                    }),
                ));
            }
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for call in tool_calls {
                self.on_tool_delta(call, &mut frames);
            }
        }

        if let Some(finish) = choice["finish_reason"].as_str() {
            frames.extend(self.close(finish_to_stop_reason(finish)));
        }

        Ok(frames)
    }

    /// Close out a stream the upstream ended without a finish chunk.
    pub fn eof(&mut self) -> Vec<String> {
        self.close("end_turn")
    }

    fn on_tool_delta(&mut self, call: &Value, frames: &mut Vec<String>) {
        let openai_index = call["index"].as_u64().unwrap_or(0);

        if !self.tool_blocks.contains_key(&openai_index) {
            self.close_open_block(frames);
            let block_index = self.next_block_index;
            self.next_block_index += 1;
            self.tool_blocks.insert(openai_index, block_index);
            self.open_block = Some((block_index, OpenBlock::Tool { openai_index }));

            let id = call["id"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("toolu_{:012x}", rand::random::<u64>()));
            let name = call["function"]["name"].as_str().unwrap_or("");
            frames.push(event_frame(
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": block_index,
                    "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}},
                }),
            ));
        }

        if let Some(args) = call["function"]["arguments"].as_str() {
            if !args.is_empty() {
                let block_index = self.tool_blocks[&openai_index];
                frames.push(event_frame(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": block_index,
                        "delta": {"type": "input_json_delta", "partial_json": args},
                    }),
                ));
            }
        }
    }

    fn ensure_started(&mut self, frames: &mut Vec<String>) {
        if self.started {
            return;
        }
        self.started = true;
        frames.push(event_frame(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": self.input_tokens, "output_tokens": 0},
                },
            }),
        ));
    }

    fn ensure_text_block(&mut self, frames: &mut Vec<String>) {
        if matches!(self.open_block, Some((_, OpenBlock::Text))) {
            return;
        }
        self.close_open_block(frames);
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.open_block = Some((index, OpenBlock::Text));
        frames.push(event_frame(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {"type": "text", "text": ""},
            }),
        ));
    }

    fn close_open_block(&mut self, frames: &mut Vec<String>) {
        if let Some((index, _)) = self.open_block.take() {
            frames.push(event_frame(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": index}),
            ));
        }
    }

    fn close(&mut self, stop_reason: &str) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut frames = Vec::new();
        self.ensure_started(&mut frames);
        self.close_open_block(&mut frames);
        frames.push(event_frame(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {"output_tokens": self.output_tokens},
            }),
        ));
        frames.push(event_frame(
            "message_stop",
            &json!({"type": "message_stop"}),
        ));
        frames
    }
}
