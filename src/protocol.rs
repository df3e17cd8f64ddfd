use crate::types::ReservationProposal;
use serde::{Deserialize, Serialize};

pub const CHECK_AVAILABILITY_TOOL: &str = "check_device_availability";
pub const UPDATE_RESERVATION_TOOL: &str = "update_reservation_status";

/// One NDJSON record on the conversation stream, discriminated by `type`.
///
/// `Message` is authoritative: it supersedes whatever `Token` fragments were
/// assembled for the turn so far. Exactly one `Done` terminates a turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Token {
        content: String,
    },
    Message {
        content: String,
    },
    Tool {
        tool_name: String,
        output: serde_json::Value,
    },
    Done,
}

/// Per-line parse result. Malformed lines become `Unknown` and are skipped by
/// the dispatcher; they never abort the stream.
#[derive(Debug)]
pub enum RecordEvent {
    Event(StreamEvent),
    Unknown(String),
}

pub fn parse_stream_line(line: &str) -> RecordEvent {
    match serde_json::from_str::<StreamEvent>(line) {
        Ok(event) => RecordEvent::Event(event),
        Err(e) => {
            let snippet = if line.len() > 200 {
                format!("{}...", line.chars().take(200).collect::<String>())
            } else {
                line.to_string()
            };
            tracing::debug!("[stream] skipping unparseable line ({}): {}", e, snippet);
            RecordEvent::Unknown(line.to_string())
        }
    }
}

/// --- REQUEST / RESPONSE SHAPES ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOpenRequest {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub session_id: String,
    pub action: crate::types::DecisionAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerOutcome {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub scheduler: SchedulerOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_message: Option<String>,
}

/// --- TOOL OUTPUT SHAPES ---

/// `check_device_availability` output. The proposal may arrive nested under
/// `proposal` or with its fields flattened directly on the output object.
#[derive(Debug, Clone, Deserialize)]
pub struct AvailabilityOutput {
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub proposal: Option<ReservationProposal>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AvailabilityOutput {
    /// Extract a well-formed proposal, preferring the nested shape.
    pub fn well_formed_proposal(&self) -> Option<ReservationProposal> {
        if let Some(p) = &self.proposal {
            if p.is_well_formed() {
                return Some(p.clone());
            }
            return None;
        }
        let flattened = serde_json::Value::Object(self.extra.clone());
        match serde_json::from_value::<ReservationProposal>(flattened) {
            Ok(p) if p.is_well_formed() => Some(p),
            _ => None,
        }
    }
}

/// `update_reservation_status` output.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusOutput {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// A tool event classified by name into a validated variant. Unknown tool
/// names are explicit rather than silently dropped.
#[derive(Debug)]
pub enum ToolEvent {
    Availability(AvailabilityOutput),
    ReservationStatus(StatusOutput),
    Ignored(String),
}

pub fn classify_tool(tool_name: &str, output: serde_json::Value) -> ToolEvent {
    match tool_name {
        CHECK_AVAILABILITY_TOOL => match serde_json::from_value::<AvailabilityOutput>(output) {
            Ok(parsed) => ToolEvent::Availability(parsed),
            Err(e) => {
                tracing::warn!("[stream] malformed availability output: {}", e);
                ToolEvent::Availability(AvailabilityOutput {
                    available: false,
                    proposal: None,
                    reason: None,
                    extra: serde_json::Map::new(),
                })
            }
        },
        UPDATE_RESERVATION_TOOL => match serde_json::from_value::<StatusOutput>(output) {
            Ok(parsed) => ToolEvent::ReservationStatus(parsed),
            Err(e) => {
                tracing::warn!("[stream] malformed reservation status output: {}", e);
                ToolEvent::ReservationStatus(StatusOutput {
                    success: false,
                    reason: None,
                })
            }
        },
        other => {
            tracing::debug!("[stream] ignoring unknown tool result: {}", other);
            ToolEvent::Ignored(other.to_string())
        }
    }
}

#[cfg(test)]
mod parsing_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_each_record_kind() {
        match parse_stream_line(r#"{"type":"token","content":"Hel"}"#) {
            RecordEvent::Event(StreamEvent::Token { content }) => assert_eq!(content, "Hel"),
            other => panic!("Expected token, got {:?}", other),
        }
        match parse_stream_line(r#"{"type":"message","content":"Hello"}"#) {
            RecordEvent::Event(StreamEvent::Message { content }) => assert_eq!(content, "Hello"),
            other => panic!("Expected message, got {:?}", other),
        }
        match parse_stream_line(r#"{"type":"done"}"#) {
            RecordEvent::Event(StreamEvent::Done) => {}
            other => panic!("Expected done, got {:?}", other),
        }
    }

    #[test]
    fn malformed_line_becomes_unknown() {
        match parse_stream_line(r#"{"type":"token":"message","content":"x"}"#) {
            RecordEvent::Unknown(_) => {}
            other => panic!("Expected unknown, got {:?}", other),
        }
    }

    #[test]
    fn nested_proposal_extracted() {
        let output = json!({
            "available": true,
            "proposal": {
                "resource_id": "device-001",
                "start_time": "2025-09-25T02:00:00+00:00",
                "end_time": "2025-09-25T03:00:00+00:00"
            }
        });
        match classify_tool(CHECK_AVAILABILITY_TOOL, output) {
            ToolEvent::Availability(av) => {
                let p = av.well_formed_proposal().expect("proposal");
                assert_eq!(p.resource_id, "device-001");
            }
            other => panic!("Expected availability, got {:?}", other),
        }
    }

    #[test]
    fn flattened_proposal_extracted() {
        let output = json!({
            "available": true,
            "resource_id": "device-001",
            "start_time": "2025-09-25T02:00:00+00:00"
        });
        match classify_tool(CHECK_AVAILABILITY_TOOL, output) {
            ToolEvent::Availability(av) => {
                assert!(av.well_formed_proposal().is_some());
            }
            other => panic!("Expected availability, got {:?}", other),
        }
    }

    #[test]
    fn incomplete_proposal_rejected() {
        let output = json!({
            "available": true,
            "proposal": { "resource_id": "", "start_time": "2025-09-25T02:00:00+00:00" }
        });
        match classify_tool(CHECK_AVAILABILITY_TOOL, output) {
            ToolEvent::Availability(av) => assert!(av.well_formed_proposal().is_none()),
            other => panic!("Expected availability, got {:?}", other),
        }
    }

    #[test]
    fn unknown_tool_is_explicitly_ignored() {
        match classify_tool("fetch_weather", json!({"temp": 21})) {
            ToolEvent::Ignored(name) => assert_eq!(name, "fetch_weather"),
            other => panic!("Expected ignored, got {:?}", other),
        }
    }
}
