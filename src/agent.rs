use crate::model::{ChatModel, ModelChunk, ModelMessage};
use crate::protocol::{
    DecisionResponse, SchedulerOutcome, StreamEvent, CHECK_AVAILABILITY_TOOL,
    UPDATE_RESERVATION_TOOL,
};
use crate::scheduler::MockScheduler;
use crate::types::{DecisionAction, HoldlineError, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Upper bound on model round-trips within a single turn. A turn that is
/// still calling tools after this gives up and ends with whatever text it
/// produced.
const MAX_TOOL_ROUNDS: usize = 4;

const SYSTEM_PROMPT: &str = "You are a scheduling assistant for a shared lab device. \
Help the user find and book one-hour timeslots. \
When the user asks about a specific time, call check_device_availability with that \
start time in ISO 8601 format before answering. \
Never claim a reservation is confirmed or cancelled yourself; the user confirms or \
cancels through the interface, and you will be told the result. \
Keep replies short and concrete.";

/// A decision forwarded from the UI, already validated at the HTTP surface.
#[derive(Debug, Clone)]
pub struct DecisionCall {
    pub session_id: String,
    pub action: DecisionAction,
    pub start_time: Option<String>,
    pub reservation_id: Option<String>,
}

/// What the HTTP layer talks to. One implementation drives a real model;
/// tests swap in whatever they need.
pub trait AgentBackend: Send + Sync {
    fn ready(&self) -> bool;

    /// Run one conversational turn. The stream carries events only; a
    /// failed turn ends early (the client treats stream end as turn end).
    fn stream_turn(&self, session_id: String, message: String) -> BoxStream<'static, StreamEvent>;

    fn apply_decision(&self, call: DecisionCall) -> BoxFuture<'static, Result<DecisionResponse>>;
}

/// Drives the chat model in a tool loop against the scheduler, keeping
/// per-session history in memory.
pub struct ToolLoopAgent<M: ChatModel> {
    model: Arc<M>,
    scheduler: Arc<MockScheduler>,
    histories: Arc<Mutex<HashMap<String, Vec<ModelMessage>>>>,
}

impl<M: ChatModel> ToolLoopAgent<M> {
    pub fn new(model: M, scheduler: Arc<MockScheduler>) -> Self {
        Self {
            model: Arc::new(model),
            scheduler,
            histories: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn history_for(&self, session_id: &str) -> Vec<ModelMessage> {
        let mut histories = self.histories.lock().unwrap_or_else(|p| p.into_inner());
        histories
            .entry(session_id.to_string())
            .or_insert_with(|| vec![ModelMessage::System(SYSTEM_PROMPT.to_string())])
            .clone()
    }

    fn store_history(&self, session_id: &str, history: Vec<ModelMessage>) {
        let mut histories = self.histories.lock().unwrap_or_else(|p| p.into_inner());
        histories.insert(session_id.to_string(), history);
    }
}

impl<M: ChatModel> AgentBackend for ToolLoopAgent<M> {
    fn ready(&self) -> bool {
        self.model.ready()
    }

    fn stream_turn(&self, session_id: String, message: String) -> BoxStream<'static, StreamEvent> {
        let model = Arc::clone(&self.model);
        let scheduler = Arc::clone(&self.scheduler);
        let histories = Arc::clone(&self.histories);
        let (tx, rx) = mpsc::channel::<StreamEvent>(32);

        tokio::spawn(async move {
            let mut history = {
                let mut map = histories.lock().unwrap_or_else(|p| p.into_inner());
                let entry = map
                    .entry(session_id.clone())
                    .or_insert_with(|| vec![ModelMessage::System(SYSTEM_PROMPT.to_string())]);
                entry.push(ModelMessage::User(message));
                entry.clone()
            };

            run_turn(&*model, &scheduler, &session_id, &mut history, &tx).await;

            let _ = tx.send(StreamEvent::Done).await;
            let mut map = histories.lock().unwrap_or_else(|p| p.into_inner());
            map.insert(session_id, history);
        });

        ReceiverStream::new(rx).boxed()
    }

    fn apply_decision(&self, call: DecisionCall) -> BoxFuture<'static, Result<DecisionResponse>> {
        let model = Arc::clone(&self.model);
        let scheduler = Arc::clone(&self.scheduler);
        let histories = Arc::clone(&self.histories);
        let prior = self.history_for(&call.session_id);

        Box::pin(async move {
            let raw_outcome = match call.action {
                DecisionAction::Confirm => {
                    let start_time = call.start_time.as_deref().ok_or_else(|| {
                        HoldlineError::InvalidRequest(
                            "start_time is required to confirm a reservation".to_string(),
                        )
                    })?;
                    let start = parse_start_time(start_time)
                        .map_err(HoldlineError::InvalidRequest)?;
                    scheduler.book_reservation(&call.session_id, start)
                }
                DecisionAction::Cancel => {
                    let reservation_id = call.reservation_id.as_deref().ok_or_else(|| {
                        HoldlineError::InvalidRequest(
                            "reservation_id is required to cancel a reservation".to_string(),
                        )
                    })?;
                    scheduler.cancel_reservation(reservation_id, &call.session_id)
                }
            };

            let instruction = match call.action {
                DecisionAction::Confirm => {
                    "The user clicked confirm. Acknowledge the booking result above in one or two sentences."
                }
                DecisionAction::Cancel => {
                    "The user cancelled. Acknowledge the cancellation result above and ask whether they want a different slot."
                }
            };

            let mut history = prior;
            history.push(ModelMessage::User(
                json!({
                    "action": call.action.to_string(),
                    "start_time": call.start_time,
                    "reservation_id": call.reservation_id,
                    "result": raw_outcome,
                })
                .to_string(),
            ));
            history.push(ModelMessage::User(instruction.to_string()));

            let assistant_message = collect_reply(&*model, history.clone()).await;
            if let Some(text) = &assistant_message {
                history.push(ModelMessage::Assistant(text.clone()));
            }
            {
                let mut map = histories.lock().unwrap_or_else(|p| p.into_inner());
                map.insert(call.session_id.clone(), history);
            }

            let scheduler_outcome: SchedulerOutcome = serde_json::from_value(raw_outcome)
                .map_err(HoldlineError::Serialization)?;

            Ok(DecisionResponse {
                scheduler: scheduler_outcome,
                assistant_message,
            })
        })
    }
}

async fn run_turn<M: ChatModel>(
    model: &M,
    scheduler: &MockScheduler,
    session_id: &str,
    history: &mut Vec<ModelMessage>,
    tx: &mpsc::Sender<StreamEvent>,
) {
    for round in 0..MAX_TOOL_ROUNDS {
        let mut chunks = model.stream_reply(history.clone());
        let mut text = String::new();
        let mut tool_calls = Vec::new();

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(ModelChunk::TextDelta(delta)) => {
                    text.push_str(&delta);
                    let event = StreamEvent::Token { content: delta };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                Ok(ModelChunk::ToolCall { name, arguments }) => {
                    tool_calls.push((name, arguments));
                }
                Ok(ModelChunk::End { full_text }) => {
                    if !full_text.is_empty() {
                        text = full_text;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "[agent] model stream failed in round {}: {}",
                        round,
                        e.inner
                    );
                    return;
                }
            }
        }

        if !text.is_empty() {
            history.push(ModelMessage::Assistant(text.clone()));
            let event = StreamEvent::Message { content: text };
            if tx.send(event).await.is_err() {
                return;
            }
        }

        if tool_calls.is_empty() {
            return;
        }

        for (name, arguments) in tool_calls {
            let output = execute_tool(scheduler, session_id, &name, &arguments);
            tracing::debug!("[agent] tool '{}' returned {}", name, output);
            history.push(ModelMessage::ToolResult {
                tool_name: name.clone(),
                output: output.clone(),
            });
            let event = StreamEvent::Tool {
                tool_name: name,
                output,
            };
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }

    tracing::warn!(
        "[agent] turn for session {} hit the tool round limit",
        session_id
    );
}

async fn collect_reply<M: ChatModel>(model: &M, history: Vec<ModelMessage>) -> Option<String> {
    let mut chunks = model.stream_reply(history);
    let mut text = String::new();
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(ModelChunk::TextDelta(delta)) => text.push_str(&delta),
            Ok(ModelChunk::End { full_text }) => {
                if !full_text.is_empty() {
                    text = full_text;
                }
            }
            Ok(ModelChunk::ToolCall { name, .. }) => {
                tracing::debug!("[agent] ignoring tool call '{}' in decision reply", name);
            }
            Err(e) => {
                tracing::error!("[agent] decision reply stream failed: {}", e.inner);
                break;
            }
        }
    }
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn execute_tool(
    scheduler: &MockScheduler,
    session_id: &str,
    name: &str,
    arguments: &serde_json::Value,
) -> serde_json::Value {
    match name {
        CHECK_AVAILABILITY_TOOL => {
            let start_time = arguments["start_time"].as_str().unwrap_or_default();
            match parse_start_time(start_time) {
                Ok(start) => scheduler.check_availability(session_id, start),
                Err(reason) => json!({ "available": false, "reason": reason }),
            }
        }
        UPDATE_RESERVATION_TOOL => {
            let action = arguments["action"].as_str().unwrap_or_default();
            match action {
                "confirm" => {
                    let start_time = arguments["start_time"].as_str().unwrap_or_default();
                    match parse_start_time(start_time) {
                        Ok(start) => scheduler.book_reservation(session_id, start),
                        Err(reason) => json!({ "success": false, "reason": reason }),
                    }
                }
                "cancel" => match arguments["reservation_id"].as_str() {
                    Some(id) if !id.is_empty() => scheduler.cancel_reservation(id, session_id),
                    _ => json!({
                        "success": false,
                        "reason": "reservation_id is required to cancel."
                    }),
                },
                other => json!({
                    "success": false,
                    "reason": format!("Unknown reservation action '{other}'.")
                }),
            }
        }
        other => {
            tracing::warn!("[agent] model requested unknown tool '{}'", other);
            json!({ "error": format!("Unknown tool '{other}'.") })
        }
    }
}

/// Accepts full RFC 3339 or a bare `YYYY-MM-DDTHH:MM:SS`, which is read
/// as UTC.
pub fn parse_start_time(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    if raw.trim().is_empty() {
        return Err("start_time is required and must be ISO 8601 formatted.".to_string());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    Err(format!("Could not parse start_time '{raw}' as ISO 8601."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScriptedModel;
    use crate::scheduler::{ManualClock, MockScheduler, RESOURCE_ID};
    use std::sync::Arc;

    fn scheduler_at(iso: &str) -> Arc<MockScheduler> {
        let clock = Arc::new(ManualClock::new(
            DateTime::parse_from_rfc3339(iso)
                .expect("test clock time")
                .with_timezone(&Utc),
        ));
        Arc::new(MockScheduler::new(clock, 10))
    }

    #[test]
    fn start_time_parsing_accepts_naive_and_offset_forms() {
        let offset = parse_start_time("2026-09-25T02:00:00+02:00").unwrap();
        assert_eq!(offset.to_rfc3339(), "2026-09-25T00:00:00+00:00");
        let naive = parse_start_time("2026-09-25T02:00:00").unwrap();
        assert_eq!(naive.to_rfc3339(), "2026-09-25T02:00:00+00:00");
        assert!(parse_start_time("next tuesday").is_err());
        assert!(parse_start_time("  ").is_err());
    }

    #[tokio::test]
    async fn turn_streams_tokens_then_tool_then_done() {
        let model = ScriptedModel::new(vec![
            // Round one: the model asks for an availability check.
            vec![
                ModelChunk::ToolCall {
                    name: CHECK_AVAILABILITY_TOOL.to_string(),
                    arguments: json!({ "start_time": "2026-09-25T02:00:00+00:00" }),
                },
                ModelChunk::End {
                    full_text: String::new(),
                },
            ],
            // Round two: it reports the result.
            vec![
                ModelChunk::TextDelta("That slot is free.".to_string()),
                ModelChunk::End {
                    full_text: "That slot is free.".to_string(),
                },
            ],
        ]);
        let agent = ToolLoopAgent::new(model, scheduler_at("2026-09-25T01:00:00+00:00"));

        let events: Vec<_> = agent
            .stream_turn("session-a".to_string(), "Is 2am free?".to_string())
            .collect()
            .await;

        match &events[0] {
            StreamEvent::Tool { tool_name, output } => {
                assert_eq!(tool_name, CHECK_AVAILABILITY_TOOL);
                assert_eq!(output["available"], json!(true));
                assert_eq!(output["proposal"]["resource_id"], json!(RESOURCE_ID));
            }
            other => panic!("Expected tool event first, got {:?}", other),
        }
        assert!(matches!(&events[1], StreamEvent::Token { content } if content == "That slot is free."));
        assert!(
            matches!(&events[2], StreamEvent::Message { content } if content == "That slot is free.")
        );
        assert!(matches!(events.last(), Some(StreamEvent::Done)));
    }

    #[tokio::test]
    async fn decision_confirm_promotes_hold_and_collects_reply() {
        let scheduler = scheduler_at("2026-09-25T01:00:00+00:00");
        let start = parse_start_time("2026-09-25T02:00:00+00:00").unwrap();
        scheduler.check_availability("session-a", start);

        let model = ScriptedModel::new(vec![vec![
            ModelChunk::TextDelta("Booked!".to_string()),
            ModelChunk::End {
                full_text: "Booked!".to_string(),
            },
        ]]);
        let agent = ToolLoopAgent::new(model, Arc::clone(&scheduler));

        let response = agent
            .apply_decision(DecisionCall {
                session_id: "session-a".to_string(),
                action: DecisionAction::Confirm,
                start_time: Some("2026-09-25T02:00:00+00:00".to_string()),
                reservation_id: None,
            })
            .await
            .unwrap();

        assert!(response.scheduler.success);
        assert_eq!(response.assistant_message.as_deref(), Some("Booked!"));
        let record = response.scheduler.reservation.expect("reservation in outcome");
        assert_eq!(record["status"], json!("confirmed"));
    }

    #[tokio::test]
    async fn decision_confirm_without_start_time_is_invalid() {
        let agent = ToolLoopAgent::new(
            ScriptedModel::default(),
            scheduler_at("2026-09-25T01:00:00+00:00"),
        );
        let err = agent
            .apply_decision(DecisionCall {
                session_id: "session-a".to_string(),
                action: DecisionAction::Confirm,
                start_time: None,
                reservation_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err.inner, HoldlineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn tool_error_degrades_to_unavailable_output() {
        let model = ScriptedModel::new(vec![
            vec![
                ModelChunk::ToolCall {
                    name: CHECK_AVAILABILITY_TOOL.to_string(),
                    arguments: json!({ "start_time": "sometime soon" }),
                },
                ModelChunk::End {
                    full_text: String::new(),
                },
            ],
            vec![ModelChunk::End {
                full_text: "Sorry, I need an exact time.".to_string(),
            }],
        ]);
        let agent = ToolLoopAgent::new(model, scheduler_at("2026-09-25T01:00:00+00:00"));

        let events: Vec<_> = agent
            .stream_turn("session-a".to_string(), "anytime works".to_string())
            .collect()
            .await;

        match &events[0] {
            StreamEvent::Tool { output, .. } => {
                assert_eq!(output["available"], json!(false));
                assert!(output["reason"].as_str().unwrap().contains("ISO 8601"));
            }
            other => panic!("Expected tool event, got {:?}", other),
        }
    }
}
