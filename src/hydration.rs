//! Hydration trigger: when to re-read the full log buffer.
//!
//! ## State machine
//!
//! ```text
//! IDLE      → start(reason)          → FETCHING(ticket)
//! FETCHING  → start(reason)          → cancel ticket, FETCHING(new ticket)
//! FETCHING  → complete(ticket)       → IDLE, hand result to the reconciler
//! FETCHING  → complete(other ticket) → unchanged, result ignored
//! any       → cancel()               → IDLE
//! ```
//!
//! At most one fetch is outstanding per open execution. Every fetch gets a
//! fresh ticket; a result is accepted only if its ticket is the one currently
//! held, so a response that lands after being superseded or cancelled is
//! dropped no matter when it arrives.

use std::fmt;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::FetchResult;
use crate::execution::ExecutionId;
use crate::source::CancelToken;

/// Identity of one historical fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TicketId(Uuid);

impl TicketId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a hydration was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HydrationReason {
    /// The drawer was opened for this execution.
    Opened,
    /// The drawer was opened again for the execution it already shows.
    Reopened,
    /// The host regained foreground visibility.
    Foregrounded,
    /// The execution just left `RUNNING`/`ANALYZING`; pick up the tail.
    Settled,
}

/// Everything a worker needs to run one historical fetch.
#[derive(Debug, Clone)]
pub struct FetchTicket {
    pub id: TicketId,
    pub execution_id: ExecutionId,
    pub reason: HydrationReason,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone)]
pub enum HydrationState {
    Idle,
    Fetching { ticket: TicketId, cancel: CancelToken },
}

/// Result of `start`.
#[derive(Debug)]
pub struct Started {
    pub ticket: FetchTicket,
    /// The in-flight fetch that was cancelled to make room, if any.
    pub superseded: Option<TicketId>,
}

/// Result of `complete`.
#[derive(Debug, PartialEq)]
pub enum Completion {
    /// The fetch is the one currently held; its result should be applied.
    Current(FetchResult<String>),
    /// Superseded, cancelled, or unknown ticket. Ignore.
    Stale,
}

/// Hydration state for one open execution.
#[derive(Debug)]
pub struct HydrationTrigger {
    execution_id: ExecutionId,
    state: HydrationState,
}

impl HydrationTrigger {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            state: HydrationState::Idle,
        }
    }

    pub fn state(&self) -> &HydrationState {
        &self.state
    }

    pub fn is_fetching(&self) -> bool {
        matches!(self.state, HydrationState::Fetching { .. })
    }

    /// Begin a new fetch, cancelling any fetch already in flight first.
    pub fn start(&mut self, reason: HydrationReason) -> Started {
        let superseded = self.cancel();
        let ticket = FetchTicket {
            id: TicketId::new(),
            execution_id: self.execution_id.clone(),
            reason,
            cancel: CancelToken::new(),
        };
        self.state = HydrationState::Fetching {
            ticket: ticket.id,
            cancel: ticket.cancel.clone(),
        };
        debug!(
            execution_id = %self.execution_id,
            ticket = %ticket.id,
            reason = ?reason,
            "hydration started"
        );
        Started { ticket, superseded }
    }

    /// Cancel the in-flight fetch, if any, and go idle.
    pub fn cancel(&mut self) -> Option<TicketId> {
        match std::mem::replace(&mut self.state, HydrationState::Idle) {
            HydrationState::Idle => None,
            HydrationState::Fetching { ticket, cancel } => {
                cancel.cancel();
                debug!(execution_id = %self.execution_id, ticket = %ticket, "hydration cancelled");
                Some(ticket)
            }
        }
    }

    /// Accept a finished fetch. Only the held ticket moves the machine.
    pub fn complete(&mut self, ticket: TicketId, result: FetchResult<String>) -> Completion {
        match &self.state {
            HydrationState::Fetching { ticket: held, .. } if *held == ticket => {
                self.state = HydrationState::Idle;
                Completion::Current(result)
            }
            _ => {
                debug!(
                    execution_id = %self.execution_id,
                    ticket = %ticket,
                    "ignoring stale hydration result"
                );
                Completion::Stale
            }
        }
    }
}

impl Drop for HydrationTrigger {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::reconcile::LogReconciler;

    fn trigger() -> HydrationTrigger {
        HydrationTrigger::new(ExecutionId::new("e1"))
    }

    #[test]
    fn starts_idle() {
        let trigger = trigger();
        assert!(!trigger.is_fetching());
        assert!(matches!(trigger.state(), HydrationState::Idle));
    }

    #[test]
    fn start_moves_to_fetching() {
        let mut trigger = trigger();
        let started = trigger.start(HydrationReason::Opened);
        assert!(trigger.is_fetching());
        assert!(started.superseded.is_none());
        assert_eq!(started.ticket.execution_id.as_str(), "e1");
        assert!(!started.ticket.cancel.is_cancelled());
    }

    #[test]
    fn completion_returns_to_idle() {
        let mut trigger = trigger();
        let ticket = trigger.start(HydrationReason::Opened).ticket;
        let completion = trigger.complete(ticket.id, Ok("line1\n".to_string()));
        assert_eq!(completion, Completion::Current(Ok("line1\n".to_string())));
        assert!(!trigger.is_fetching());
    }

    #[test]
    fn failure_also_returns_to_idle() {
        let mut trigger = trigger();
        let ticket = trigger.start(HydrationReason::Opened).ticket;
        let err = FetchError::Network("HTTP 502".to_string());
        let completion = trigger.complete(ticket.id, Err(err.clone()));
        assert_eq!(completion, Completion::Current(Err(err)));
        assert!(!trigger.is_fetching());
    }

    #[test]
    fn restart_cancels_previous_fetch() {
        let mut trigger = trigger();
        let first = trigger.start(HydrationReason::Opened).ticket;
        let second = trigger.start(HydrationReason::Foregrounded);

        assert_eq!(second.superseded, Some(first.id));
        assert!(first.cancel.is_cancelled());
        assert!(!second.ticket.cancel.is_cancelled());
        assert_ne!(first.id, second.ticket.id);
    }

    #[test]
    fn only_the_latest_of_two_overlapping_fetches_is_applied() {
        let mut trigger = trigger();
        let mut reconciler = LogReconciler::new();
        let first = trigger.start(HydrationReason::Opened).ticket;
        let second = trigger.start(HydrationReason::Foregrounded).ticket;

        // Second resolves first, then the superseded one lands late.
        let mut applied = 0;
        for (ticket, body) in [(second.id, "a\nb\n"), (first.id, "a\nb\nSTALE\n")] {
            if let Completion::Current(Ok(snapshot)) = trigger.complete(ticket, Ok(body.into())) {
                reconciler.apply_historical(&snapshot);
                applied += 1;
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(reconciler.text(), "a\nb\n");
    }

    #[test]
    fn superseded_result_arriving_first_is_ignored_and_keeps_fetching() {
        let mut trigger = trigger();
        let first = trigger.start(HydrationReason::Opened).ticket;
        let second = trigger.start(HydrationReason::Foregrounded).ticket;

        assert_eq!(trigger.complete(first.id, Ok("old".into())), Completion::Stale);
        assert!(trigger.is_fetching());
        assert!(matches!(
            trigger.complete(second.id, Ok("new".into())),
            Completion::Current(Ok(_))
        ));
    }

    #[test]
    fn cancel_goes_idle_and_rejects_late_result() {
        let mut trigger = trigger();
        let ticket = trigger.start(HydrationReason::Opened).ticket;
        assert_eq!(trigger.cancel(), Some(ticket.id));
        assert!(ticket.cancel.is_cancelled());
        assert_eq!(trigger.cancel(), None);
        assert_eq!(trigger.complete(ticket.id, Ok("late".into())), Completion::Stale);
    }

    #[test]
    fn dropping_trigger_cancels_in_flight_fetch() {
        let mut trigger = trigger();
        let ticket = trigger.start(HydrationReason::Opened).ticket;
        drop(trigger);
        assert!(ticket.cancel.is_cancelled());
    }
}
