//! Drawer: view state for one execution's detail panel.
//!
//! [`DrawerState`] is a deterministic state machine: it consumes
//! [`DrawerEvent`]s and answers with a [`Step`] of side effects to run and
//! notes to record. It never performs I/O itself, which keeps every ordering
//! question testable without threads. [`runtime::DrawerRuntime`] executes the
//! effects and feeds results back in as events.
//!
//! Correlation keys:
//! - a [`SessionId`] per "drawer open for X" lifetime; stream chunks and
//!   probe results carry it and are dropped once it is no longer current;
//! - a [`TicketId`] per historical fetch (see [`crate::hydration`]).

pub mod runtime;

pub use runtime::{DrawerObserver, DrawerRuntime, NullObserver, RunOutcome};

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FetchError, FetchResult};
use crate::execution::{Artifact, ExecutionId, ExecutionRecord, ExecutionStatus};
use crate::hydration::{Completion, FetchTicket, HydrationReason, HydrationTrigger, TicketId};
use crate::probes::ArtifactProbe;
use crate::reconcile::{LogReconciler, SnapshotOutcome};
use crate::source::CancelToken;
use crate::tabs::{self, TabId, TabOwnership, VisibleTabSet};

/// Identity of one drawer-open lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// When to re-read the full log buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HydratePolicy {
    /// On every open and every foreground regain, whatever the status.
    #[default]
    Always,
    /// Only while the execution is `RUNNING` or `ANALYZING`.
    LiveOnly,
}

/// Host page visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Foreground,
    Background,
}

#[derive(Debug, Clone)]
pub struct DrawerSettings {
    pub default_tab: TabId,
    pub hydrate: HydratePolicy,
    pub artifact_poll: Duration,
    pub status_poll: Duration,
}

impl Default for DrawerSettings {
    fn default() -> Self {
        Self {
            default_tab: TabId::Terminal,
            hydrate: HydratePolicy::Always,
            artifact_poll: Duration::from_secs(5),
            status_poll: Duration::from_secs(5),
        }
    }
}

/// Inputs to the drawer.
#[derive(Debug)]
pub enum DrawerEvent {
    /// Open the drawer for an execution (or re-open the one already shown).
    Open(ExecutionRecord),
    Close,
    /// The user clicked a tab.
    SelectTab(TabId),
    Visibility(Visibility),
    StreamChunk {
        session: SessionId,
        chunk: String,
    },
    StreamFailed {
        session: SessionId,
        error: FetchError,
    },
    HistoricalLoaded {
        ticket: TicketId,
        result: FetchResult<String>,
    },
    ArtifactsListed {
        session: SessionId,
        result: FetchResult<Vec<Artifact>>,
    },
    ExecutionLoaded {
        session: SessionId,
        result: FetchResult<ExecutionRecord>,
    },
    /// Close and stop the runtime.
    Shutdown,
}

/// Side effects the runtime must perform.
#[derive(Debug)]
pub enum Effect {
    FetchHistorical(FetchTicket),
    Subscribe {
        session: SessionId,
        execution_id: ExecutionId,
    },
    Unsubscribe {
        session: SessionId,
    },
    ListArtifacts {
        session: SessionId,
        execution_id: ExecutionId,
        after: Duration,
        cancel: CancelToken,
    },
    RefreshExecution {
        session: SessionId,
        execution_id: ExecutionId,
        after: Duration,
        cancel: CancelToken,
    },
}

/// Things worth recording about a transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum DrawerNote {
    Opened {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        session: SessionId,
    },
    Closed {
        execution_id: ExecutionId,
    },
    HydrationStarted {
        ticket: TicketId,
        reason: HydrationReason,
    },
    HydrationSuperseded {
        ticket: TicketId,
    },
    HydrationSkipped {
        reason: HydrationReason,
        status: ExecutionStatus,
    },
    SnapshotApplied {
        ticket: TicketId,
        previous_len: usize,
        new_len: usize,
    },
    SnapshotDiscarded {
        ticket: TicketId,
        known_len: usize,
        snapshot_len: usize,
    },
    HydrationFailed {
        ticket: TicketId,
        error: String,
    },
    StaleResultIgnored {
        ticket: TicketId,
    },
    StreamUnavailable {
        error: String,
    },
    TabSelected {
        execution_id: Option<ExecutionId>,
        tab: TabId,
    },
    /// The rendered tab or the legal set changed. Recorded by the runtime.
    EffectiveTabChanged {
        tab: TabId,
        visible: Vec<TabId>,
    },
    VisibilityChanged {
        visibility: Visibility,
    },
    ArtifactsProbed {
        count: usize,
    },
    StatusChanged {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    AuthExpired,
}

/// Output of one transition.
#[derive(Debug, Default)]
pub struct Step {
    pub effects: Vec<Effect>,
    pub notes: Vec<DrawerNote>,
}

impl Step {
    fn effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    fn note(&mut self, note: DrawerNote) {
        self.notes.push(note);
    }
}

/// Everything scoped to "the drawer is open for execution X".
#[derive(Debug)]
struct OpenExecution {
    session: SessionId,
    record: ExecutionRecord,
    reconciler: LogReconciler,
    hydration: HydrationTrigger,
    artifacts: ArtifactProbe,
    /// Cancels delayed probes once this session ends.
    probes_cancel: CancelToken,
}

impl Drop for OpenExecution {
    fn drop(&mut self) {
        self.probes_cancel.cancel();
    }
}

/// Drawer view state.
#[derive(Debug)]
pub struct DrawerState {
    settings: DrawerSettings,
    open: Option<OpenExecution>,
    ownership: Option<TabOwnership>,
    visibility: Visibility,
}

impl DrawerState {
    pub fn new(settings: DrawerSettings) -> Self {
        Self {
            settings,
            open: None,
            ownership: None,
            visibility: Visibility::Foreground,
        }
    }

    pub fn settings(&self) -> &DrawerSettings {
        &self.settings
    }

    pub fn current_execution(&self) -> Option<&ExecutionId> {
        self.open.as_ref().map(|open| &open.record.id)
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.open.as_ref().map(|open| open.session)
    }

    pub fn record(&self) -> Option<&ExecutionRecord> {
        self.open.as_ref().map(|open| &open.record)
    }

    /// Reconciled log text for the terminal view. Empty while closed.
    pub fn log_text(&self) -> &str {
        self.open
            .as_ref()
            .map(|open| open.reconciler.text())
            .unwrap_or("")
    }

    pub fn artifacts(&self) -> &[Artifact] {
        self.open
            .as_ref()
            .map(|open| open.artifacts.artifacts())
            .unwrap_or(&[])
    }

    pub fn ownership(&self) -> Option<&TabOwnership> {
        self.ownership.as_ref()
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn is_hydrating(&self) -> bool {
        self.open
            .as_ref()
            .is_some_and(|open| open.hydration.is_fetching())
    }

    /// Open on an execution that no longer produces output and has nothing
    /// left to catch up on.
    pub fn is_settled(&self) -> bool {
        self.open
            .as_ref()
            .is_some_and(|open| !open.record.status.is_live() && !open.hydration.is_fetching())
    }

    pub fn visible_tabs(&self) -> VisibleTabSet {
        match &self.open {
            Some(open) => tabs::visible_tabs(
                &open.record.status,
                open.artifacts.has_artifacts_or_loading(),
                open.record.has_analysis,
            ),
            None => VisibleTabSet::terminal_only(),
        }
    }

    /// The tab to render, derived from current inputs on every call.
    pub fn effective_tab(&self) -> TabId {
        tabs::effective_tab(
            self.ownership.as_ref(),
            self.current_execution(),
            self.settings.default_tab,
            &self.visible_tabs(),
        )
    }

    /// Record an explicit tab click for the execution currently open.
    pub fn set_active_tab(&mut self, tab: TabId) -> Step {
        let mut step = Step::default();
        let owner = self.current_execution().cloned();
        debug!(execution_id = ?owner, tab = %tab, "tab selected");
        step.note(DrawerNote::TabSelected {
            execution_id: owner.clone(),
            tab,
        });
        self.ownership = Some(TabOwnership::new(owner, tab));
        step
    }

    pub fn handle(&mut self, event: DrawerEvent) -> Step {
        match event {
            DrawerEvent::Open(record) => self.open(record),
            DrawerEvent::Close | DrawerEvent::Shutdown => self.close(),
            DrawerEvent::SelectTab(tab) => self.set_active_tab(tab),
            DrawerEvent::Visibility(visibility) => self.set_visibility(visibility),
            DrawerEvent::StreamChunk { session, chunk } => self.stream_chunk(session, &chunk),
            DrawerEvent::StreamFailed { session, error } => self.stream_failed(session, error),
            DrawerEvent::HistoricalLoaded { ticket, result } => {
                self.historical_loaded(ticket, result)
            }
            DrawerEvent::ArtifactsListed { session, result } => {
                self.artifacts_listed(session, result)
            }
            DrawerEvent::ExecutionLoaded { session, result } => {
                self.execution_loaded(session, result)
            }
        }
    }

    fn hydration_allowed(&self, status: &ExecutionStatus) -> bool {
        match self.settings.hydrate {
            HydratePolicy::Always => true,
            HydratePolicy::LiveOnly => status.is_live(),
        }
    }

    /// Start a historical fetch for the open execution, subject to policy.
    /// The catch-up after a run settles is exempt from the policy.
    fn hydrate(&mut self, reason: HydrationReason, step: &mut Step) {
        let allowed = match self.record() {
            Some(record) => {
                reason == HydrationReason::Settled || self.hydration_allowed(&record.status)
            }
            None => return,
        };
        let Some(open) = self.open.as_mut() else {
            return;
        };
        if !allowed {
            debug!(
                execution_id = %open.record.id,
                reason = ?reason,
                "hydration skipped by policy"
            );
            step.note(DrawerNote::HydrationSkipped {
                reason,
                status: open.record.status.clone(),
            });
            return;
        }
        let started = open.hydration.start(reason);
        if let Some(superseded) = started.superseded {
            step.note(DrawerNote::HydrationSuperseded { ticket: superseded });
        }
        step.note(DrawerNote::HydrationStarted {
            ticket: started.ticket.id,
            reason,
        });
        step.effect(Effect::FetchHistorical(started.ticket));
    }

    fn open(&mut self, record: ExecutionRecord) -> Step {
        let mut step = Step::default();

        if self.current_execution() == Some(&record.id) {
            debug!(execution_id = %record.id, "drawer re-opened for same execution");
            let status_poll = self.settings.status_poll;
            if let Some(open) = self.open.as_mut() {
                let revived = !open.record.status.is_live() && record.status.is_live();
                open.record = record;
                if revived {
                    // Polling stopped when the old record settled.
                    open.artifacts.begin();
                    step.effect(Effect::ListArtifacts {
                        session: open.session,
                        execution_id: open.record.id.clone(),
                        after: Duration::ZERO,
                        cancel: open.probes_cancel.clone(),
                    });
                    step.effect(Effect::RefreshExecution {
                        session: open.session,
                        execution_id: open.record.id.clone(),
                        after: status_poll,
                        cancel: open.probes_cancel.clone(),
                    });
                }
            }
            self.hydrate(HydrationReason::Reopened, &mut step);
            return step;
        }

        let previous = self.close();
        step.effects.extend(previous.effects);
        step.notes.extend(previous.notes);

        let session = SessionId::new();
        let execution_id = record.id.clone();
        let live = record.status.is_live();
        info!(
            execution_id = %execution_id,
            status = %record.status,
            session = %session,
            "drawer opened"
        );
        step.note(DrawerNote::Opened {
            execution_id: execution_id.clone(),
            status: record.status.clone(),
            session,
        });

        let mut artifacts = ArtifactProbe::new();
        artifacts.begin();
        let probes_cancel = CancelToken::new();
        self.open = Some(OpenExecution {
            session,
            record,
            reconciler: LogReconciler::new(),
            hydration: HydrationTrigger::new(execution_id.clone()),
            artifacts,
            probes_cancel: probes_cancel.clone(),
        });

        step.effect(Effect::Subscribe {
            session,
            execution_id: execution_id.clone(),
        });
        self.hydrate(HydrationReason::Opened, &mut step);
        step.effect(Effect::ListArtifacts {
            session,
            execution_id: execution_id.clone(),
            after: Duration::ZERO,
            cancel: probes_cancel.clone(),
        });
        if live {
            step.effect(Effect::RefreshExecution {
                session,
                execution_id,
                after: self.settings.status_poll,
                cancel: probes_cancel,
            });
        }
        step
    }

    fn close(&mut self) -> Step {
        let mut step = Step::default();
        if let Some(mut open) = self.open.take() {
            if let Some(ticket) = open.hydration.cancel() {
                step.note(DrawerNote::HydrationSuperseded { ticket });
            }
            info!(execution_id = %open.record.id, "drawer closed");
            step.effect(Effect::Unsubscribe {
                session: open.session,
            });
            step.note(DrawerNote::Closed {
                execution_id: open.record.id.clone(),
            });
        }
        step
    }

    fn set_visibility(&mut self, visibility: Visibility) -> Step {
        let mut step = Step::default();
        if visibility == self.visibility {
            return step;
        }
        let regained = visibility == Visibility::Foreground;
        self.visibility = visibility;
        debug!(visibility = ?visibility, "visibility changed");
        step.note(DrawerNote::VisibilityChanged { visibility });
        if regained {
            self.hydrate(HydrationReason::Foregrounded, &mut step);
        }
        step
    }

    fn session_matches(&self, session: SessionId) -> bool {
        self.open.as_ref().is_some_and(|open| open.session == session)
    }

    fn stream_chunk(&mut self, session: SessionId, chunk: &str) -> Step {
        match self.open.as_mut() {
            Some(open) if open.session == session => open.reconciler.apply_increment(chunk),
            _ => debug!(session = %session, "dropping chunk from closed session"),
        }
        Step::default()
    }

    fn stream_failed(&mut self, session: SessionId, error: FetchError) -> Step {
        let mut step = Step::default();
        if !self.session_matches(session) {
            return step;
        }
        warn!(error = %error, "log stream unavailable; relying on historical fetches");
        if error.is_auth() {
            step.note(DrawerNote::AuthExpired);
        }
        step.note(DrawerNote::StreamUnavailable {
            error: error.to_string(),
        });
        step
    }

    fn historical_loaded(&mut self, ticket: TicketId, result: FetchResult<String>) -> Step {
        let mut step = Step::default();
        let Some(open) = self.open.as_mut() else {
            debug!(ticket = %ticket, "historical result with drawer closed");
            return step;
        };

        match open.hydration.complete(ticket, result) {
            Completion::Stale => step.note(DrawerNote::StaleResultIgnored { ticket }),
            Completion::Current(Ok(snapshot)) => match open.reconciler.apply_historical(&snapshot)
            {
                SnapshotOutcome::Applied {
                    previous_len,
                    new_len,
                } => {
                    debug!(
                        execution_id = %open.record.id,
                        previous_len,
                        new_len,
                        "historical snapshot applied"
                    );
                    step.note(DrawerNote::SnapshotApplied {
                        ticket,
                        previous_len,
                        new_len,
                    });
                }
                SnapshotOutcome::Discarded {
                    known_len,
                    snapshot_len,
                } => {
                    debug!(
                        execution_id = %open.record.id,
                        known_len,
                        snapshot_len,
                        "historical snapshot older than streamed text"
                    );
                    step.note(DrawerNote::SnapshotDiscarded {
                        ticket,
                        known_len,
                        snapshot_len,
                    });
                }
            },
            Completion::Current(Err(FetchError::Cancelled)) => {
                debug!(ticket = %ticket, "historical fetch cancelled by transport");
            }
            Completion::Current(Err(error)) => {
                warn!(
                    execution_id = %open.record.id,
                    error = %error,
                    "historical log fetch failed; keeping streamed text"
                );
                if error.is_auth() {
                    step.note(DrawerNote::AuthExpired);
                }
                step.note(DrawerNote::HydrationFailed {
                    ticket,
                    error: error.to_string(),
                });
            }
        }
        step
    }

    fn artifacts_listed(
        &mut self,
        session: SessionId,
        result: FetchResult<Vec<Artifact>>,
    ) -> Step {
        let mut step = Step::default();
        let poll = self.settings.artifact_poll;
        let Some(open) = self.open.as_mut().filter(|open| open.session == session) else {
            return step;
        };

        if matches!(&result, Err(error) if error.is_auth()) {
            step.note(DrawerNote::AuthExpired);
        }
        if open.artifacts.finish(result) {
            step.note(DrawerNote::ArtifactsProbed {
                count: open.artifacts.artifacts().len(),
            });
        }
        if open.record.status.is_live() {
            open.artifacts.begin();
            step.effect(Effect::ListArtifacts {
                session,
                execution_id: open.record.id.clone(),
                after: poll,
                cancel: open.probes_cancel.clone(),
            });
        }
        step
    }

    fn execution_loaded(
        &mut self,
        session: SessionId,
        result: FetchResult<ExecutionRecord>,
    ) -> Step {
        let mut step = Step::default();
        let poll = self.settings.status_poll;
        let Some(open) = self.open.as_mut().filter(|open| open.session == session) else {
            return step;
        };

        let mut settled = false;
        match result {
            Ok(record) if record.id == open.record.id => {
                let was_live = open.record.status.is_live();
                if record.status != open.record.status {
                    info!(
                        execution_id = %record.id,
                        from = %open.record.status,
                        to = %record.status,
                        "execution status changed"
                    );
                    step.note(DrawerNote::StatusChanged {
                        from: open.record.status.clone(),
                        to: record.status.clone(),
                    });
                }
                settled = was_live && !record.status.is_live();
                open.record = record;
            }
            Ok(record) => {
                warn!(
                    expected = %open.record.id,
                    got = %record.id,
                    "execution refresh returned another record"
                );
            }
            Err(error) => {
                warn!(execution_id = %open.record.id, error = %error, "execution refresh failed");
                if error.is_auth() {
                    step.note(DrawerNote::AuthExpired);
                }
            }
        }

        if open.record.status.is_live() {
            step.effect(Effect::RefreshExecution {
                session,
                execution_id: open.record.id.clone(),
                after: poll,
                cancel: open.probes_cancel.clone(),
            });
        } else if settled {
            // Last artifacts are usually uploaded as the run finishes.
            open.artifacts.begin();
            step.effect(Effect::ListArtifacts {
                session,
                execution_id: open.record.id.clone(),
                after: Duration::ZERO,
                cancel: open.probes_cancel.clone(),
            });
            self.hydrate(HydrationReason::Settled, &mut step);
        }
        step
    }
}
