use crate::decoder;
use crate::types::{HoldlineError, Result};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::json;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// One entry of the model-facing conversation history.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelMessage {
    System(String),
    User(String),
    Assistant(String),
    ToolResult {
        tool_name: String,
        output: serde_json::Value,
    },
}

/// Incremental output of one model reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    TextDelta(String),
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    /// Final accumulated text for the reply; empty when the model produced
    /// only tool calls.
    End { full_text: String },
}

/// The seam behind which the actual language model lives. The reservation
/// semantics never depend on what implements this.
pub trait ChatModel: Send + Sync + 'static {
    fn ready(&self) -> bool {
        true
    }

    fn stream_reply(&self, history: Vec<ModelMessage>) -> BoxStream<'static, Result<ModelChunk>>;
}

/// --- OPENAI-COMPATIBLE ADAPTER ---

#[derive(Clone)]
pub struct OpenAiModel {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiModel {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

impl ChatModel for OpenAiModel {
    fn ready(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn stream_reply(&self, history: Vec<ModelMessage>) -> BoxStream<'static, Result<ModelChunk>> {
        let this = self.clone();
        let (tx, rx) = mpsc::channel::<Result<ModelChunk>>(32);
        tokio::spawn(async move {
            if let Err(e) = run_completion_stream(this, history, tx.clone()).await {
                tracing::error!("[model] completion stream failed: {}", e.inner);
                let _ = tx.send(Err(e)).await;
            }
        });
        ReceiverStream::new(rx).boxed()
    }
}

#[derive(Default)]
struct ToolCallBuffer {
    name: String,
    arguments: String,
}

async fn run_completion_stream(
    model: OpenAiModel,
    history: Vec<ModelMessage>,
    tx: mpsc::Sender<Result<ModelChunk>>,
) -> Result<()> {
    let body = json!({
        "model": model.model,
        "stream": true,
        "temperature": 0.4,
        "messages": project_messages(&history),
        "tools": tool_schemas(),
    });

    let response = model
        .http
        .post(format!("{}/chat/completions", model.base_url))
        .bearer_auth(&model.api_key)
        .json(&body)
        .send()
        .await
        .map_err(HoldlineError::Network)?;

    if !response.status().is_success() {
        let status = axum::http::StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        let err_body = match response.text().await {
            Ok(t) => t,
            Err(_) => "Unknown error (failed to read response text)".to_string(),
        };
        return Err(HoldlineError::Upstream(status, err_body).into());
    }

    let mut lines = decoder::ndjson_lines(decoder::response_chunks(response));
    let mut text = String::new();
    // Providers omit the tool call id on follow-up chunks; deltas stay
    // associated through the per-choice index.
    let mut calls = BTreeMap::<u64, ToolCallBuffer>::new();

    while let Some(line_result) = lines.next().await {
        let line = line_result.map_err(|e| HoldlineError::Protocol(e.to_string()))?;
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data == "[DONE]" {
            break;
        }
        let value = match serde_json::from_str::<serde_json::Value>(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("[model] skipping unparseable chunk ({})", e);
                continue;
            }
        };
        let delta = &value["choices"][0]["delta"];
        if let Some(content) = delta["content"].as_str() {
            if !content.is_empty() {
                text.push_str(content);
                if tx
                    .send(Ok(ModelChunk::TextDelta(content.to_string())))
                    .await
                    .is_err()
                {
                    return Ok(());
                }
            }
        }
        if let Some(tool_deltas) = delta["tool_calls"].as_array() {
            for td in tool_deltas {
                let index = td["index"].as_u64().unwrap_or(0);
                let entry = calls.entry(index).or_default();
                if let Some(name) = td["function"]["name"].as_str() {
                    entry.name = name.to_string();
                }
                if let Some(args) = td["function"]["arguments"].as_str() {
                    entry.arguments.push_str(args);
                }
            }
        }
    }

    for (index, call) in calls {
        let arguments = match serde_json::from_str::<serde_json::Value>(&call.arguments) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    "[model] tool call '{}' (index {}) has invalid arguments: {}",
                    call.name,
                    index,
                    e
                );
                json!({})
            }
        };
        if tx
            .send(Ok(ModelChunk::ToolCall {
                name: call.name,
                arguments,
            }))
            .await
            .is_err()
        {
            return Ok(());
        }
    }

    let _ = tx.send(Ok(ModelChunk::End { full_text: text })).await;
    Ok(())
}

fn project_messages(history: &[ModelMessage]) -> Vec<serde_json::Value> {
    history
        .iter()
        .map(|m| match m {
            ModelMessage::System(content) => json!({"role": "system", "content": content}),
            ModelMessage::User(content) => json!({"role": "user", "content": content}),
            ModelMessage::Assistant(content) => json!({"role": "assistant", "content": content}),
            // Tool results go back as user-visible context rather than the
            // provider's tool role; we do not track provider call ids.
            ModelMessage::ToolResult { tool_name, output } => json!({
                "role": "user",
                "content": json!({"tool_result": tool_name, "output": output}).to_string(),
            }),
        })
        .collect()
}

fn tool_schemas() -> serde_json::Value {
    json!([
        {
            "type": "function",
            "function": {
                "name": crate::protocol::CHECK_AVAILABILITY_TOOL,
                "description": "Check whether the device is available at the requested ISO 8601 start time.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "start_time": { "type": "string", "description": "ISO 8601 start of the slot" }
                    },
                    "required": ["start_time"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": crate::protocol::UPDATE_RESERVATION_TOOL,
                "description": "Confirm or cancel a reservation.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "action": { "type": "string", "enum": ["confirm", "cancel"] },
                        "start_time": { "type": "string" },
                        "reservation_id": { "type": "string" }
                    },
                    "required": ["action"]
                }
            }
        }
    ])
}

/// --- SCRIPTED MODEL (tests and demos) ---

/// Replays canned chunk sequences, one script per reply, in order.
#[derive(Clone, Default)]
pub struct ScriptedModel {
    scripts: Arc<Mutex<VecDeque<Vec<ModelChunk>>>>,
}

impl ScriptedModel {
    pub fn new(scripts: Vec<Vec<ModelChunk>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into_iter().collect())),
        }
    }
}

impl ChatModel for ScriptedModel {
    fn stream_reply(&self, _history: Vec<ModelMessage>) -> BoxStream<'static, Result<ModelChunk>> {
        let script = {
            let mut scripts = self.scripts.lock().expect("script lock poisoned");
            match scripts.pop_front() {
                Some(s) => s,
                None => vec![ModelChunk::End {
                    full_text: String::new(),
                }],
            }
        };
        futures_util::stream::iter(script.into_iter().map(Ok)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_model_replays_in_order() {
        let model = ScriptedModel::new(vec![
            vec![
                ModelChunk::TextDelta("a".into()),
                ModelChunk::End {
                    full_text: "a".into(),
                },
            ],
            vec![ModelChunk::End {
                full_text: "b".into(),
            }],
        ]);

        let first: Vec<_> = model.stream_reply(Vec::new()).collect().await;
        assert_eq!(first.len(), 2);

        let second: Vec<_> = model.stream_reply(Vec::new()).collect().await;
        match second.into_iter().next().unwrap().unwrap() {
            ModelChunk::End { full_text } => assert_eq!(full_text, "b"),
            other => panic!("Expected end chunk, got {:?}", other),
        }
    }

    #[test]
    fn openai_model_readiness_follows_key() {
        let http = reqwest::Client::new();
        let without_key = OpenAiModel::new(http.clone(), "http://localhost", "", "test-model");
        assert!(!without_key.ready());
        let with_key = OpenAiModel::new(http, "http://localhost", "sk-test", "test-model");
        assert!(with_key.ready());
    }
}
