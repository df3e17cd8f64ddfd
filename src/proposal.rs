use crate::protocol::ToolEvent;
use crate::types::{DecisionAction, ReservationProposal};

/// Lifecycle of the single live reservation proposal.
///
/// A qualifying availability result queues a proposal but never shows it
/// mid-stream; promotion to `Pending` happens only at a `message` or `done`
/// boundary so the confirmation card cannot flicker against further tool
/// calls in the same turn.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProposalState {
    #[default]
    None,
    Queued(ReservationProposal),
    Pending(ReservationProposal),
    Submitting(DecisionAction),
}

/// What the caller should do after a tool event was absorbed.
#[derive(Debug, PartialEq, Eq)]
pub enum ToolDisposition {
    /// A proposal was queued (replacing any earlier queued value); nothing to
    /// render yet.
    Queued,
    /// Append this status notice to the timeline.
    Notice(String),
    /// Unknown tool; state untouched.
    Ignored,
}

#[derive(Debug, Default)]
pub struct ProposalCoordinator {
    state: ProposalState,
}

impl ProposalCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ProposalState {
        &self.state
    }

    pub fn pending(&self) -> Option<&ReservationProposal> {
        match &self.state {
            ProposalState::Pending(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_submitting(&self) -> bool {
        matches!(self.state, ProposalState::Submitting(_))
    }

    /// Absorb one classified tool event into the state machine.
    pub fn observe_tool(&mut self, event: ToolEvent) -> ToolDisposition {
        match event {
            ToolEvent::Availability(av) => {
                if !av.available {
                    self.state = ProposalState::None;
                    let reason = match av.reason {
                        Some(r) if !r.is_empty() => r,
                        _ => "The requested timeslot is not available.".to_string(),
                    };
                    return ToolDisposition::Notice(reason);
                }
                match av.well_formed_proposal() {
                    Some(proposal) => {
                        // Last tool call wins: any earlier queued (or shown)
                        // proposal for this turn is silently replaced.
                        tracing::debug!(
                            "[proposal] queued {} @ {}",
                            proposal.resource_id,
                            proposal.start_time
                        );
                        self.state = ProposalState::Queued(proposal);
                        ToolDisposition::Queued
                    }
                    None => {
                        self.state = ProposalState::None;
                        ToolDisposition::Notice(
                            "The agent reported availability in an unexpected format; \
                             no proposal could be offered."
                                .to_string(),
                        )
                    }
                }
            }
            ToolEvent::ReservationStatus(status) => {
                self.state = ProposalState::None;
                if status.success {
                    ToolDisposition::Notice("Reservation updated successfully.".to_string())
                } else {
                    let reason = match status.reason {
                        Some(r) if !r.is_empty() => r,
                        _ => "The reservation update failed; please try again.".to_string(),
                    };
                    ToolDisposition::Notice(reason)
                }
            }
            ToolEvent::Ignored(_) => ToolDisposition::Ignored,
        }
    }

    /// Promote a queued proposal to pending at a safe point (`message` or
    /// `done`). Returns the now-pending proposal if a promotion happened.
    pub fn promote(&mut self) -> Option<&ReservationProposal> {
        if let ProposalState::Queued(p) = &self.state {
            let p = p.clone();
            tracing::debug!("[proposal] pending {} @ {}", p.resource_id, p.start_time);
            self.state = ProposalState::Pending(p);
        }
        match &self.state {
            ProposalState::Pending(p) => Some(p),
            _ => None,
        }
    }

    /// Move `Pending` into `Submitting(action)`, handing the proposal to the
    /// submitter. `None` when there is nothing pending.
    pub fn begin_submit(&mut self, action: DecisionAction) -> Option<ReservationProposal> {
        match std::mem::take(&mut self.state) {
            ProposalState::Pending(p) => {
                self.state = ProposalState::Submitting(action);
                Some(p)
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Resolve to `None` from any state (submission finished, discard, or a
    /// tool reported the booking already happened).
    pub fn clear(&mut self) {
        self.state = ProposalState::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{classify_tool, CHECK_AVAILABILITY_TOOL, UPDATE_RESERVATION_TOOL};
    use serde_json::json;

    fn availability(resource: &str, start: &str) -> ToolEvent {
        classify_tool(
            CHECK_AVAILABILITY_TOOL,
            json!({
                "available": true,
                "proposal": { "resource_id": resource, "start_time": start }
            }),
        )
    }

    #[test]
    fn queued_promotes_only_at_safe_point() {
        let mut coordinator = ProposalCoordinator::new();
        let disposition =
            coordinator.observe_tool(availability("device-001", "2025-09-25T02:00:00+00:00"));
        assert_eq!(disposition, ToolDisposition::Queued);
        assert!(coordinator.pending().is_none());

        let pending = coordinator.promote().expect("promoted");
        assert_eq!(pending.resource_id, "device-001");
    }

    #[test]
    fn second_qualifying_result_replaces_queued_value() {
        let mut coordinator = ProposalCoordinator::new();
        coordinator.observe_tool(availability("device-001", "2025-09-25T02:00:00+00:00"));
        coordinator.observe_tool(availability("device-002", "2025-09-25T04:00:00+00:00"));

        let pending = coordinator.promote().expect("promoted");
        assert_eq!(pending.resource_id, "device-002");
    }

    #[test]
    fn unavailable_clears_state_with_reason() {
        let mut coordinator = ProposalCoordinator::new();
        coordinator.observe_tool(availability("device-001", "2025-09-25T02:00:00+00:00"));

        let disposition = coordinator.observe_tool(classify_tool(
            CHECK_AVAILABILITY_TOOL,
            json!({ "available": false, "reason": "Requested timeslot is already reserved." }),
        ));
        assert_eq!(
            disposition,
            ToolDisposition::Notice("Requested timeslot is already reserved.".to_string())
        );
        assert_eq!(coordinator.state(), &ProposalState::None);
        assert!(coordinator.promote().is_none());
    }

    #[test]
    fn malformed_available_output_yields_format_notice() {
        let mut coordinator = ProposalCoordinator::new();
        let disposition = coordinator.observe_tool(classify_tool(
            CHECK_AVAILABILITY_TOOL,
            json!({ "available": true, "proposal": { "resource_id": "", "start_time": "" } }),
        ));
        assert!(matches!(disposition, ToolDisposition::Notice(_)));
        assert_eq!(coordinator.state(), &ProposalState::None);
    }

    #[test]
    fn reservation_status_always_resolves_state() {
        let mut coordinator = ProposalCoordinator::new();
        coordinator.observe_tool(availability("device-001", "2025-09-25T02:00:00+00:00"));
        coordinator.promote();

        let disposition = coordinator.observe_tool(classify_tool(
            UPDATE_RESERVATION_TOOL,
            json!({ "success": true }),
        ));
        assert_eq!(
            disposition,
            ToolDisposition::Notice("Reservation updated successfully.".to_string())
        );
        assert_eq!(coordinator.state(), &ProposalState::None);
    }

    #[test]
    fn unknown_tool_leaves_state_untouched() {
        let mut coordinator = ProposalCoordinator::new();
        coordinator.observe_tool(availability("device-001", "2025-09-25T02:00:00+00:00"));

        let disposition =
            coordinator.observe_tool(classify_tool("fetch_weather", json!({ "temp": 21 })));
        assert_eq!(disposition, ToolDisposition::Ignored);
        assert!(matches!(coordinator.state(), ProposalState::Queued(_)));
    }

    #[test]
    fn begin_submit_requires_pending() {
        let mut coordinator = ProposalCoordinator::new();
        assert!(coordinator.begin_submit(DecisionAction::Confirm).is_none());

        coordinator.observe_tool(availability("device-001", "2025-09-25T02:00:00+00:00"));
        assert!(coordinator.begin_submit(DecisionAction::Confirm).is_none());

        coordinator.promote();
        let proposal = coordinator
            .begin_submit(DecisionAction::Confirm)
            .expect("pending proposal");
        assert_eq!(proposal.resource_id, "device-001");
        assert!(coordinator.is_submitting());
    }
}
