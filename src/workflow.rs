// 🔁 Workflow State Machine
// Pure transition rules over an enum, independent of persistence.
//
// transition(profile, current, event) -> next state | error
//
// The engine (engine.rs) reads the current state from the store, asks this
// module whether the requested event is legal, and only then writes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// STATES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowState {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "APPROVED")]
    Approved,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "PRINTED")]
    Printed,
    #[serde(rename = "SCANNED")]
    Scanned,
    #[serde(rename = "PEND-APPROVAL")]
    PendApproval,
    #[serde(rename = "COMPLETED")]
    Completed,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 7] = [
        WorkflowState::Pending,
        WorkflowState::Approved,
        WorkflowState::Rejected,
        WorkflowState::Printed,
        WorkflowState::Scanned,
        WorkflowState::PendApproval,
        WorkflowState::Completed,
    ];

    /// Stored / displayed form
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Pending => "PENDING",
            WorkflowState::Approved => "APPROVED",
            WorkflowState::Rejected => "REJECTED",
            WorkflowState::Printed => "PRINTED",
            WorkflowState::Scanned => "SCANNED",
            WorkflowState::PendApproval => "PEND-APPROVAL",
            WorkflowState::Completed => "COMPLETED",
        }
    }

    /// Every entity starts here, in the same transaction that inserts it
    pub fn initial() -> Self {
        WorkflowState::Pending
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown workflow state '{0}'")]
pub struct UnknownState(pub String);

impl FromStr for WorkflowState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEvent {
    Approve,
    Reject,
    MarkPrinted,
    MarkScanned,
    Complete,
}

impl WorkflowEvent {
    pub const ALL: [WorkflowEvent; 5] = [
        WorkflowEvent::Approve,
        WorkflowEvent::Reject,
        WorkflowEvent::MarkPrinted,
        WorkflowEvent::MarkScanned,
        WorkflowEvent::Complete,
    ];

    /// Stored form in the transition log
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowEvent::Approve => "approve",
            WorkflowEvent::Reject => "reject",
            WorkflowEvent::MarkPrinted => "mark_printed",
            WorkflowEvent::MarkScanned => "mark_scanned",
            WorkflowEvent::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        WorkflowEvent::ALL.iter().copied().find(|e| e.as_str() == s)
    }

    /// Verb used in user-facing messages ("cannot approve: ...")
    pub fn verb(&self) -> &'static str {
        match self {
            WorkflowEvent::Approve => "approve",
            WorkflowEvent::Reject => "reject",
            WorkflowEvent::MarkPrinted => "mark as printed",
            WorkflowEvent::MarkScanned => "mark as scanned",
            WorkflowEvent::Complete => "complete",
        }
    }

    pub fn past_tense(&self) -> &'static str {
        match self {
            WorkflowEvent::Approve => "approved",
            WorkflowEvent::Reject => "rejected",
            WorkflowEvent::MarkPrinted => "marked as printed",
            WorkflowEvent::MarkScanned => "marked as scanned",
            WorkflowEvent::Complete => "completed",
        }
    }

    /// Audit column stem written by this event (`<stem>_by`, `<stem>_at`)
    pub fn audit_column(&self) -> &'static str {
        match self {
            WorkflowEvent::Approve => "approved",
            WorkflowEvent::Reject => "rejected",
            WorkflowEvent::MarkPrinted => "printed",
            WorkflowEvent::MarkScanned => "scanned",
            WorkflowEvent::Complete => "completed",
        }
    }
}

impl fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

// ============================================================================
// PROFILES
// ============================================================================

/// Entity-specific shape of the state machine.
///
/// Every (profile, event) pair has at most one legal preceding state, so a
/// rejected request can always say which state it needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowProfile {
    /// PENDING → {APPROVED, REJECTED}; APPROVED → PRINTED → SCANNED → COMPLETED
    ApprovalFirst,
    /// PENDING → PRINTED → PEND-APPROVAL → {APPROVED, REJECTED}
    PrintFirst,
}

type Edge = (WorkflowState, WorkflowEvent, WorkflowState);

const APPROVAL_FIRST: &[Edge] = &[
    (WorkflowState::Pending, WorkflowEvent::Approve, WorkflowState::Approved),
    (WorkflowState::Pending, WorkflowEvent::Reject, WorkflowState::Rejected),
    (WorkflowState::Approved, WorkflowEvent::MarkPrinted, WorkflowState::Printed),
    (WorkflowState::Printed, WorkflowEvent::MarkScanned, WorkflowState::Scanned),
    (WorkflowState::Scanned, WorkflowEvent::Complete, WorkflowState::Completed),
];

const PRINT_FIRST: &[Edge] = &[
    (WorkflowState::Pending, WorkflowEvent::MarkPrinted, WorkflowState::Printed),
    (WorkflowState::Printed, WorkflowEvent::MarkScanned, WorkflowState::PendApproval),
    (WorkflowState::PendApproval, WorkflowEvent::Approve, WorkflowState::Approved),
    (WorkflowState::PendApproval, WorkflowEvent::Reject, WorkflowState::Rejected),
];

impl WorkflowProfile {
    pub fn edges(&self) -> &'static [Edge] {
        match self {
            WorkflowProfile::ApprovalFirst => APPROVAL_FIRST,
            WorkflowProfile::PrintFirst => PRINT_FIRST,
        }
    }

    /// The single state an event must start from, if the profile allows it at all
    pub fn required_state(&self, event: WorkflowEvent) -> Option<WorkflowState> {
        self.edges()
            .iter()
            .find(|(_, e, _)| *e == event)
            .map(|(from, _, _)| *from)
    }

    pub fn is_terminal(&self, state: WorkflowState) -> bool {
        !self.edges().iter().any(|(from, _, _)| *from == state)
    }

    /// Events accepted from `state`
    pub fn available_events(&self, state: WorkflowState) -> Vec<WorkflowEvent> {
        self.edges()
            .iter()
            .filter(|(from, _, _)| *from == state)
            .map(|(_, event, _)| *event)
            .collect()
    }

    /// The unique chain of states leading from PENDING to `state`, inclusive.
    /// None when the state is unreachable in this profile.
    pub fn path_to(&self, state: WorkflowState) -> Option<Vec<WorkflowState>> {
        let mut chain = vec![state];
        let mut current = state;
        while current != WorkflowState::initial() {
            let (from, _, _) = self.edges().iter().find(|(_, _, to)| *to == current)?;
            current = *from;
            chain.push(current);
        }
        chain.reverse();
        Some(chain)
    }
}

// ============================================================================
// TRANSITION FUNCTION
// ============================================================================

/// Why a transition was refused. `expected` is None when the profile has no
/// edge for the event at all (e.g. `complete` on a print-first record).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionDenied {
    pub event: WorkflowEvent,
    pub expected: Option<WorkflowState>,
    pub actual: WorkflowState,
}

pub fn transition(
    profile: WorkflowProfile,
    current: WorkflowState,
    event: WorkflowEvent,
) -> Result<WorkflowState, TransitionDenied> {
    profile
        .edges()
        .iter()
        .find(|(from, e, _)| *from == current && *e == event)
        .map(|(_, _, to)| *to)
        .ok_or(TransitionDenied {
            event,
            expected: profile.required_state(event),
            actual: current,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_approval_first_happy_path() {
        let p = WorkflowProfile::ApprovalFirst;
        let mut state = WorkflowState::initial();
        for event in [
            WorkflowEvent::Approve,
            WorkflowEvent::MarkPrinted,
            WorkflowEvent::MarkScanned,
            WorkflowEvent::Complete,
        ] {
            state = transition(p, state, event).unwrap();
        }
        assert_eq!(state, WorkflowState::Completed);
        assert!(p.is_terminal(state));
    }

    #[test]
    fn test_print_first_happy_path() {
        let p = WorkflowProfile::PrintFirst;
        let printed = transition(p, WorkflowState::Pending, WorkflowEvent::MarkPrinted).unwrap();
        let scanned = transition(p, printed, WorkflowEvent::MarkScanned).unwrap();
        assert_eq!(scanned, WorkflowState::PendApproval);
        let approved = transition(p, scanned, WorkflowEvent::Approve).unwrap();
        assert_eq!(approved, WorkflowState::Approved);
        assert!(p.is_terminal(approved));
    }

    #[test]
    fn test_print_before_approval_is_denied() {
        let denied = transition(
            WorkflowProfile::ApprovalFirst,
            WorkflowState::Pending,
            WorkflowEvent::MarkPrinted,
        )
        .unwrap_err();

        assert_eq!(denied.expected, Some(WorkflowState::Approved));
        assert_eq!(denied.actual, WorkflowState::Pending);
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for profile in [WorkflowProfile::ApprovalFirst, WorkflowProfile::PrintFirst] {
            for event in WorkflowEvent::ALL {
                assert!(transition(profile, WorkflowState::Rejected, event).is_err());
            }
        }
        for event in WorkflowEvent::ALL {
            assert!(transition(WorkflowProfile::ApprovalFirst, WorkflowState::Completed, event).is_err());
        }
    }

    #[test]
    fn test_event_without_edge_reports_no_expected_state() {
        let denied = transition(
            WorkflowProfile::PrintFirst,
            WorkflowState::PendApproval,
            WorkflowEvent::Complete,
        )
        .unwrap_err();
        assert_eq!(denied.expected, None);
    }

    #[test]
    fn test_reject_twice_fails_second_time() {
        let p = WorkflowProfile::ApprovalFirst;
        let rejected = transition(p, WorkflowState::Pending, WorkflowEvent::Reject).unwrap();
        let again = transition(p, rejected, WorkflowEvent::Reject).unwrap_err();
        assert_eq!(again.actual, WorkflowState::Rejected);
        assert_eq!(again.expected, Some(WorkflowState::Pending));
    }

    #[test]
    fn test_state_round_trips_through_text() {
        for state in WorkflowState::ALL {
            assert_eq!(state.as_str().parse::<WorkflowState>().unwrap(), state);
        }
        assert_eq!(" pend-approval ".parse::<WorkflowState>().unwrap(), WorkflowState::PendApproval);
        assert!("ARCHIVED".parse::<WorkflowState>().is_err());
    }

    #[test]
    fn test_unknown_state_message() {
        let err = "ARCHIVED".parse::<WorkflowState>().unwrap_err();
        assert_eq!(err, UnknownState("ARCHIVED".to_string()));
        assert_eq!(err.to_string(), "unknown workflow state 'ARCHIVED'");

        let wrapped = anyhow::Error::new(err);
        assert_eq!(format!("{:#}", wrapped), "unknown workflow state 'ARCHIVED'");
    }

    #[test]
    fn test_available_events_follow_the_profile() {
        assert_eq!(
            WorkflowProfile::ApprovalFirst.available_events(WorkflowState::Pending),
            vec![WorkflowEvent::Approve, WorkflowEvent::Reject]
        );
        assert_eq!(
            WorkflowProfile::PrintFirst.available_events(WorkflowState::Pending),
            vec![WorkflowEvent::MarkPrinted]
        );
        assert!(WorkflowProfile::ApprovalFirst.available_events(WorkflowState::Rejected).is_empty());
    }

    #[test]
    fn test_path_to_scanned_passes_through_printed() {
        let path = WorkflowProfile::ApprovalFirst.path_to(WorkflowState::Scanned).unwrap();
        assert_eq!(
            path,
            vec![
                WorkflowState::Pending,
                WorkflowState::Approved,
                WorkflowState::Printed,
                WorkflowState::Scanned,
            ]
        );
        assert!(WorkflowProfile::PrintFirst.path_to(WorkflowState::Completed).is_none());
    }

    fn any_profile() -> impl Strategy<Value = WorkflowProfile> {
        prop_oneof![
            Just(WorkflowProfile::ApprovalFirst),
            Just(WorkflowProfile::PrintFirst),
        ]
    }

    fn any_event() -> impl Strategy<Value = WorkflowEvent> {
        (0..WorkflowEvent::ALL.len()).prop_map(|i| WorkflowEvent::ALL[i])
    }

    proptest! {
        // Whatever sequence of requests arrives, the visited states are
        // exactly the legal chain from PENDING to wherever we ended up.
        #[test]
        fn prop_visited_states_follow_the_legal_chain(
            profile in any_profile(),
            events in proptest::collection::vec(any_event(), 0..32),
        ) {
            let mut state = WorkflowState::initial();
            let mut visited = vec![state];

            for event in events {
                match transition(profile, state, event) {
                    Ok(next) => {
                        state = next;
                        visited.push(next);
                    }
                    Err(denied) => {
                        prop_assert_eq!(denied.actual, state);
                        prop_assert_ne!(denied.expected, Some(state));
                    }
                }
            }

            let chain = profile.path_to(state);
            prop_assert_eq!(chain, Some(visited));
        }
    }
}
