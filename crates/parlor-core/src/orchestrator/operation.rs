use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::{AsRefStr, Display};
use tracing::{debug, warn};

use crate::directive::{self, Directive, Scan};
use crate::store::UsageStatus;

/// Lifecycle of one operation.
///
/// `Queued -> Streaming -> Finalizing -> {Completed, Cancelled, Failed}`;
/// `Queued` may skip straight to `Finalizing` when the upstream call never
/// opens.  Terminal phases accept no further transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    Queued,
    Streaming,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Cancelled | Phase::Failed)
    }

    pub fn can_advance_to(self, next: Phase) -> bool {
        match (self, next) {
            (Phase::Queued, Phase::Streaming | Phase::Finalizing) => true,
            (Phase::Streaming, Phase::Finalizing) => true,
            (Phase::Finalizing, next) => next.is_terminal(),
            _ => false,
        }
    }
}

/// Why the read loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ending {
    Completed,
    Cancelled,
    Failed(String),
}

impl Ending {
    pub fn phase(&self) -> Phase {
        match self {
            Ending::Completed => Phase::Completed,
            Ending::Cancelled => Phase::Cancelled,
            Ending::Failed(_) => Phase::Failed,
        }
    }

    pub fn usage_status(&self) -> UsageStatus {
        match self {
            Ending::Completed => UsageStatus::Completed,
            Ending::Cancelled => UsageStatus::Cancelled,
            Ending::Failed(_) => UsageStatus::Failed,
        }
    }
}

/// What finalize produced for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub operation_id: String,
    pub phase: Phase,
    /// Id of the persisted assistant message, if any text survived.
    pub saved_message_id: Option<String>,
    /// Effective assistant name at finalize.
    pub assistant_name: String,
    pub tokens_consumed: u32,
}

/// In-memory state of one live operation.  Owned by its driving task.
#[derive(Debug)]
pub struct GenerationOperation {
    pub operation_id: String,
    pub user_id: String,
    pub room_id: String,
    pub prompt: String,
    pub assistant_name: String,
    pub accumulated: String,
    /// Fragments received so far.
    pub tokens_consumed: u32,
    /// Completion tokens reported by the provider at end of stream.
    pub reported_usage: Option<u32>,
    pub created_at: DateTime<Utc>,
    directive_applied: bool,
    phase: Phase,
}

impl GenerationOperation {
    pub fn new(
        operation_id: String,
        user_id: &str,
        room_id: String,
        prompt: &str,
        assistant_name: String,
    ) -> Self {
        Self {
            operation_id,
            user_id: user_id.to_owned(),
            room_id,
            prompt: prompt.to_owned(),
            assistant_name,
            accumulated: String::new(),
            tokens_consumed: 0,
            reported_usage: None,
            created_at: Utc::now(),
            directive_applied: false,
            phase: Phase::Queued,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move to `next`.  Returns `false` (and stays put) on an illegal move.
    pub fn advance(&mut self, next: Phase) -> bool {
        if !self.phase.can_advance_to(next) {
            warn!(
                operation_id = %self.operation_id,
                from = %self.phase,
                to = %next,
                "refused phase transition"
            );
            return false;
        }
        debug!(operation_id = %self.operation_id, from = %self.phase, to = %next, "phase");
        self.phase = next;
        true
    }

    pub fn push_fragment(&mut self, fragment: &str) {
        self.accumulated.push_str(fragment);
        self.tokens_consumed = self.tokens_consumed.saturating_add(1);
    }

    /// The first complete directive, the first time it becomes visible.
    /// Later calls return `None` even if marker text reappears.
    pub fn take_directive(&mut self) -> Option<Directive> {
        if self.directive_applied {
            return None;
        }
        match directive::scan(&self.accumulated) {
            Scan::Complete { directive, .. } => {
                self.directive_applied = true;
                Some(directive)
            }
            Scan::Incomplete { .. } | Scan::Absent => None,
        }
    }

    /// Accumulated text with the applied marker removed.
    pub fn clean_text(&self) -> String {
        if self.directive_applied {
            directive::parse(&self.accumulated).clean_text
        } else {
            self.accumulated.clone()
        }
    }

    /// Provider-reported usage when present, else the fragment count.
    pub fn tokens_used(&self) -> u32 {
        self.reported_usage.unwrap_or(self.tokens_consumed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn op() -> GenerationOperation {
        GenerationOperation::new("op-1".into(), "alice", "room".into(), "hi", "Assistant".into())
    }

    #[test]
    fn phases_only_move_forward() {
        let mut op = op();
        assert!(op.advance(Phase::Streaming));
        assert!(!op.advance(Phase::Queued));
        assert!(!op.advance(Phase::Completed));
        assert!(op.advance(Phase::Finalizing));
        assert!(op.advance(Phase::Cancelled));
        assert_eq!(op.phase(), Phase::Cancelled);
    }

    #[test]
    fn terminal_phase_has_no_reentry() {
        for terminal in [Phase::Completed, Phase::Cancelled, Phase::Failed] {
            for next in [
                Phase::Queued,
                Phase::Streaming,
                Phase::Finalizing,
                Phase::Completed,
                Phase::Cancelled,
                Phase::Failed,
            ] {
                assert!(!terminal.can_advance_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn queued_may_skip_streaming() {
        assert!(Phase::Queued.can_advance_to(Phase::Finalizing));
        assert!(!Phase::Queued.can_advance_to(Phase::Failed));
    }

    #[test]
    fn directive_is_taken_once() {
        let mut op = op();
        op.push_fragment("<<NAME_CHANGE:Jar");
        assert_eq!(op.take_directive(), None);
        op.push_fragment("vis>>Hello");
        assert_eq!(
            op.take_directive(),
            Some(Directive::Rename {
                name: "Jarvis".into()
            })
        );
        op.push_fragment("<<NAME_CHANGE:Other>>");
        assert_eq!(op.take_directive(), None);
        assert_eq!(op.clean_text(), "Hello<<NAME_CHANGE:Other>>");
    }

    #[test]
    fn usage_falls_back_to_fragment_count() {
        let mut op = op();
        op.push_fragment("a");
        op.push_fragment("b");
        assert_eq!(op.tokens_used(), 2);
        op.reported_usage = Some(9);
        assert_eq!(op.tokens_used(), 9);
    }
}
