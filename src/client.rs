use crate::decoder;
use crate::proposal::{ProposalCoordinator, ProposalState, ToolDisposition};
use crate::protocol::{
    classify_tool, parse_stream_line, DecisionRequest, DecisionResponse, RecordEvent,
    StreamEvent, StreamOpenRequest,
};
use crate::session::{IdProvider, SessionContext};
use crate::timeline::{Timeline, TurnBuilder};
use crate::types::{DecisionAction, Result};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

/// How one streamed turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    /// Explicit abort; not a user-visible failure.
    Cancelled,
    /// Transport failure; surfaced as one status turn plus a degraded
    /// assistant message, no automatic retry.
    Failed,
}

/// How a decision submission resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOutcome {
    /// Nothing pending; no-op.
    NoPending,
    /// Another submission is already in flight; rejected, not retried.
    InFlight,
    /// Cancel without a reservation id: discarded locally without a request.
    Discarded,
    /// Confirm without a start time: rejected locally without a request.
    Invalid,
    /// One request was issued and reconciled into the timeline.
    Resolved { success: bool },
}

/// Client core for one conversation: owns the session identity, the chat
/// timeline, the proposal state machine, and at most one open stream.
pub struct ConversationClient {
    http: reqwest::Client,
    base_url: String,
    session: SessionContext,
    timeline: Timeline,
    proposals: ProposalCoordinator,
    builder: TurnBuilder,
    cancel: CancellationToken,
}

impl ConversationClient {
    /// `base_url` includes the API prefix, e.g. `http://127.0.0.1:8000/api`.
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, ids: &dyn IdProvider) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            session: SessionContext::new(ids),
            timeline: Timeline::new(),
            proposals: ProposalCoordinator::new(),
            builder: TurnBuilder::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session.id().0
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn proposal_state(&self) -> &ProposalState {
        self.proposals.state()
    }

    /// Handle for aborting the currently open stream from outside the read
    /// loop (e.g. the UI opening a new turn).
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Send one user message and process the event stream to completion.
    ///
    /// Any previously open stream is cancelled first, so at most one stream
    /// is ever open per conversation. Events are applied strictly in arrival
    /// order; a cancelled stream returns quietly without the failure path.
    pub async fn send_message(&mut self, text: &str) -> Result<TurnOutcome> {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        let cancel = self.cancel.clone();

        self.timeline.push_user(text);

        let request = StreamOpenRequest {
            session_id: self.session_id().to_string(),
            message: text.to_string(),
        };
        let response = self
            .http
            .post(format!("{}/agent/chat/stream", self.base_url))
            .json(&request)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("[client] stream open failed: {}", e);
                self.degrade("Could not reach the scheduling agent.");
                return Ok(TurnOutcome::Failed);
            }
        };
        if !response.status().is_success() {
            tracing::error!("[client] stream open rejected: HTTP {}", response.status());
            self.degrade(&format!(
                "The scheduling agent rejected the request (HTTP {}).",
                response.status().as_u16()
            ));
            return Ok(TurnOutcome::Failed);
        }

        let mut lines = decoder::ndjson_lines(decoder::response_chunks(response));
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("[client] stream cancelled for {}", self.session.id().short());
                    self.builder.finish();
                    return Ok(TurnOutcome::Cancelled);
                }
                next = lines.next() => next,
            };
            match next {
                None => break,
                Some(Err(e)) => {
                    tracing::error!("[client] stream read failed: {}", e);
                    self.degrade("The connection to the scheduling agent was interrupted.");
                    return Ok(TurnOutcome::Failed);
                }
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_stream_line(&line) {
                        RecordEvent::Unknown(_) => continue,
                        RecordEvent::Event(event) => {
                            if self.apply_event(event) {
                                return Ok(TurnOutcome::Completed);
                            }
                        }
                    }
                }
            }
        }

        // Stream ended without an explicit `done`: run the same terminal
        // handling so a queued proposal is still flushed to pending.
        self.finish_turn();
        Ok(TurnOutcome::Completed)
    }

    /// Dispatch one decoded event. Returns true when the turn is complete.
    fn apply_event(&mut self, event: StreamEvent) -> bool {
        match event {
            StreamEvent::Token { content } => {
                self.builder.append_token(&mut self.timeline, &content);
                false
            }
            StreamEvent::Message { content } => {
                self.builder.replace_text(&mut self.timeline, &content);
                self.proposals.promote();
                false
            }
            StreamEvent::Tool { tool_name, output } => {
                let classified = classify_tool(&tool_name, output);
                match self.proposals.observe_tool(classified) {
                    ToolDisposition::Notice(text) => self.timeline.push_status(text),
                    ToolDisposition::Queued | ToolDisposition::Ignored => {}
                }
                false
            }
            StreamEvent::Done => {
                self.finish_turn();
                true
            }
        }
    }

    fn finish_turn(&mut self) {
        self.builder.finish();
        self.proposals.promote();
    }

    fn degrade(&mut self, notice: &str) {
        self.builder.finish();
        self.timeline.push_status(notice);
        self.timeline
            .push_assistant("Sorry, something went wrong on my end. Please try again.");
    }

    /// Submit the user's decision on the pending proposal.
    ///
    /// Guard clauses run before any network call: a cancel with no
    /// reservation id discards the suggestion locally (nothing was booked),
    /// and a confirm with no start time is rejected locally. At most one
    /// decision request is in flight at a time.
    pub async fn submit_decision(&mut self, action: DecisionAction) -> Result<DecisionOutcome> {
        if self.proposals.is_submitting() {
            tracing::debug!("[client] decision already in flight; ignoring {}", action);
            return Ok(DecisionOutcome::InFlight);
        }
        let Some(proposal) = self.proposals.pending().cloned() else {
            return Ok(DecisionOutcome::NoPending);
        };

        match action {
            DecisionAction::Cancel if proposal.reservation_id.is_none() => {
                self.proposals.clear();
                self.timeline
                    .push_status("Suggestion discarded; nothing had been booked.");
                return Ok(DecisionOutcome::Discarded);
            }
            DecisionAction::Confirm if proposal.start_time.trim().is_empty() => {
                self.proposals.clear();
                self.timeline
                    .push_status("Cannot confirm: the proposal is missing a start time.");
                return Ok(DecisionOutcome::Invalid);
            }
            _ => {}
        }

        self.proposals.begin_submit(action);
        let request = DecisionRequest {
            session_id: self.session_id().to_string(),
            action,
            start_time: match action {
                DecisionAction::Confirm => Some(proposal.start_time.clone()),
                DecisionAction::Cancel => None,
            },
            reservation_id: match action {
                DecisionAction::Cancel => proposal.reservation_id.clone(),
                DecisionAction::Confirm => None,
            },
        };

        let response = self
            .http
            .post(format!("{}/agent/reservations/decision", self.base_url))
            .json(&request)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("[client] decision request failed: {}", e);
                self.proposals.clear();
                self.timeline
                    .push_status("The decision could not be sent; please try again.");
                return Ok(DecisionOutcome::Resolved { success: false });
            }
        };
        if !response.status().is_success() {
            tracing::error!("[client] decision rejected: HTTP {}", response.status());
            // Cleared for cancel and confirm alike: a stale confirm retry is
            // worse than asking the agent for a fresh slot.
            self.proposals.clear();
            self.timeline.push_status(format!(
                "The scheduler request failed (HTTP {}).",
                response.status().as_u16()
            ));
            return Ok(DecisionOutcome::Resolved { success: false });
        }

        let body = match response.json::<DecisionResponse>().await {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("[client] decision response unreadable: {}", e);
                self.proposals.clear();
                self.timeline
                    .push_status("The scheduler sent an unreadable response.");
                return Ok(DecisionOutcome::Resolved { success: false });
            }
        };

        if let Some(message) = &body.assistant_message {
            if !message.is_empty() {
                self.timeline.push_assistant(message.clone());
            }
        }
        if !body.scheduler.success {
            let reason = match &body.scheduler.reason {
                Some(r) if !r.is_empty() => r.clone(),
                _ => "The scheduler could not complete the request.".to_string(),
            };
            self.timeline.push_status(reason);
        }
        self.proposals.clear();
        Ok(DecisionOutcome::Resolved {
            success: body.scheduler.success,
        })
    }
}
