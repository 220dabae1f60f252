//! Drawer runtime: single-owner event loop around [`DrawerState`].
//!
//! All state lives on the thread that calls [`DrawerRuntime::pump`] or
//! [`DrawerRuntime::run`]. Fetches, probes and stream deliveries run on
//! worker threads and only ever send [`DrawerEvent`]s back over the channel,
//! so the reconciled log text has exactly one writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{DrawerEvent, DrawerNote, DrawerSettings, DrawerState, Effect, SessionId, Step};
use crate::execution::ExecutionRecord;
use crate::journal::Journal;
use crate::source::{CancelToken, LogSource, LogStream, Subscription};
use crate::tabs::{TabId, VisibleTabSet};

const POLL_SLICE: Duration = Duration::from_millis(100);

/// Receives what the drawer shell should render.
pub trait DrawerObserver: Send {
    /// The reconciled log text changed. Only ever grows while one execution
    /// stays open.
    fn on_log_text(&mut self, text: &str);
    /// The effective tab or the legal tab set changed.
    fn on_tab(&mut self, tab: TabId, visible: &VisibleTabSet);
    /// The API rejected our credentials; hand off to the session layer.
    fn on_auth_expired(&mut self);
    fn on_note(&mut self, _note: &DrawerNote) {}
    /// The loop is about to return; flush anything held back.
    fn on_finish(&mut self) {}
}

/// Observer that ignores everything.
pub struct NullObserver;

impl DrawerObserver for NullObserver {
    fn on_log_text(&mut self, _text: &str) {}
    fn on_tab(&mut self, _tab: TabId, _visible: &VisibleTabSet) {}
    fn on_auth_expired(&mut self) {}
}

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A `Shutdown` event was received.
    Shutdown,
    /// The stop flag was raised.
    Stopped,
    /// The execution finished and its final log was fetched.
    Settled,
    /// Credentials were rejected.
    AuthExpired,
}

#[derive(Debug, Clone, PartialEq)]
struct Rendered {
    log_len: usize,
    tab: TabId,
    visible: VisibleTabSet,
}

pub struct DrawerRuntime {
    state: DrawerState,
    source: Arc<dyn LogSource>,
    stream: Arc<dyn LogStream>,
    tx: Sender<DrawerEvent>,
    rx: Receiver<DrawerEvent>,
    subscriptions: HashMap<SessionId, Subscription>,
    observer: Box<dyn DrawerObserver>,
    journal: Option<Journal>,
    rendered: Option<Rendered>,
    auth_expired: bool,
}

impl DrawerRuntime {
    pub fn new(
        settings: DrawerSettings,
        source: Arc<dyn LogSource>,
        stream: Arc<dyn LogStream>,
        observer: Box<dyn DrawerObserver>,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            state: DrawerState::new(settings),
            source,
            stream,
            tx,
            rx,
            subscriptions: HashMap::new(),
            observer,
            journal: None,
            rendered: None,
            auth_expired: false,
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Handle for feeding events from other threads (visibility, tab clicks,
    /// shutdown).
    pub fn sender(&self) -> Sender<DrawerEvent> {
        self.tx.clone()
    }

    pub fn state(&self) -> &DrawerState {
        &self.state
    }

    /// Number of stream subscriptions currently held.
    pub fn live_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn open(&mut self, record: ExecutionRecord) {
        self.dispatch(DrawerEvent::Open(record));
    }

    pub fn close(&mut self) {
        self.dispatch(DrawerEvent::Close);
    }

    pub fn set_active_tab(&mut self, tab: TabId) {
        self.dispatch(DrawerEvent::SelectTab(tab));
    }

    /// Apply one event and run its effects. Returns false on shutdown.
    pub fn dispatch(&mut self, event: DrawerEvent) -> bool {
        let shutdown = matches!(event, DrawerEvent::Shutdown);
        let step = self.state.handle(event);
        self.apply(step);
        !shutdown
    }

    /// Wait up to `timeout` for one event and handle it. Returns false if no
    /// event arrived or the event was a shutdown.
    pub fn pump(&mut self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => self.dispatch(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Pump events until `done` holds or `timeout` elapses. Returns whether
    /// `done` was reached.
    pub fn pump_until(
        &mut self,
        timeout: Duration,
        mut done: impl FnMut(&DrawerState) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while !done(&self.state) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.pump((deadline - now).min(POLL_SLICE));
        }
        true
    }

    /// Drive the loop until shutdown, `stop`, auth expiry, or (when
    /// `exit_when_settled`) the open execution has settled.
    pub fn run(&mut self, stop: &AtomicBool, exit_when_settled: bool) -> RunOutcome {
        info!("drawer loop starting");
        let outcome = loop {
            if stop.load(Ordering::Relaxed) {
                break RunOutcome::Stopped;
            }
            if self.auth_expired {
                break RunOutcome::AuthExpired;
            }
            if exit_when_settled && self.state.is_settled() {
                break RunOutcome::Settled;
            }
            match self.rx.recv_timeout(POLL_SLICE) {
                Ok(event) => {
                    if !self.dispatch(event) {
                        break RunOutcome::Shutdown;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break RunOutcome::Shutdown,
            }
        };
        self.observer.on_finish();
        info!(outcome = ?outcome, "drawer loop finished");
        outcome
    }

    fn apply(&mut self, step: Step) {
        for effect in step.effects {
            self.execute(effect);
        }
        for note in &step.notes {
            self.record(note);
            if *note == DrawerNote::AuthExpired && !self.auth_expired {
                self.auth_expired = true;
                self.observer.on_auth_expired();
            }
        }
        self.render();
    }

    fn record(&mut self, note: &DrawerNote) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record(note) {
                warn!(error = %e, "failed to write drawer journal");
            }
        }
        self.observer.on_note(note);
    }

    fn render(&mut self) {
        let now = Rendered {
            log_len: self.state.log_text().len(),
            tab: self.state.effective_tab(),
            visible: self.state.visible_tabs(),
        };
        let previous = self.rendered.replace(now.clone());
        let (log_changed, tab_changed) = match &previous {
            Some(previous) => (
                previous.log_len != now.log_len,
                previous.tab != now.tab || previous.visible != now.visible,
            ),
            None => (now.log_len > 0, true),
        };
        if log_changed {
            self.observer.on_log_text(self.state.log_text());
        }
        if tab_changed {
            self.record(&DrawerNote::EffectiveTabChanged {
                tab: now.tab,
                visible: now.visible.iter().collect(),
            });
            self.observer.on_tab(now.tab, &now.visible);
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::FetchHistorical(ticket) => {
                let source = Arc::clone(&self.source);
                let tx = self.tx.clone();
                spawn_worker("hydrate", move || {
                    let result = source.fetch_historical(&ticket.execution_id, &ticket.cancel);
                    if ticket.cancel.is_cancelled() {
                        debug!(ticket = %ticket.id, "dropping cancelled historical response");
                        return;
                    }
                    let _ = tx.send(DrawerEvent::HistoricalLoaded {
                        ticket: ticket.id,
                        result,
                    });
                });
            }
            Effect::Subscribe {
                session,
                execution_id,
            } => {
                let tx = self.tx.clone();
                let handler = Box::new(move |chunk: String| {
                    let _ = tx.send(DrawerEvent::StreamChunk { session, chunk });
                });
                match self.stream.subscribe(&execution_id, handler) {
                    Ok(subscription) => {
                        debug!(execution_id = %execution_id, session = %session, "subscribed");
                        if let Some(previous) = self.subscriptions.insert(session, subscription) {
                            previous.unsubscribe();
                        }
                    }
                    Err(error) => {
                        let _ = self.tx.send(DrawerEvent::StreamFailed { session, error });
                    }
                }
            }
            Effect::Unsubscribe { session } => {
                if let Some(subscription) = self.subscriptions.remove(&session) {
                    debug!(execution_id = %subscription.execution_id(), "unsubscribed");
                    subscription.unsubscribe();
                }
            }
            Effect::ListArtifacts {
                session,
                execution_id,
                after,
                cancel,
            } => {
                let source = Arc::clone(&self.source);
                let tx = self.tx.clone();
                spawn_worker("artifacts", move || {
                    if !sleep_unless_cancelled(after, &cancel) {
                        return;
                    }
                    let result = source.list_artifacts(&execution_id);
                    if !cancel.is_cancelled() {
                        let _ = tx.send(DrawerEvent::ArtifactsListed { session, result });
                    }
                });
            }
            Effect::RefreshExecution {
                session,
                execution_id,
                after,
                cancel,
            } => {
                let source = Arc::clone(&self.source);
                let tx = self.tx.clone();
                spawn_worker("refresh", move || {
                    if !sleep_unless_cancelled(after, &cancel) {
                        return;
                    }
                    let result = source.fetch_execution(&execution_id);
                    if !cancel.is_cancelled() {
                        let _ = tx.send(DrawerEvent::ExecutionLoaded { session, result });
                    }
                });
            }
        }
    }
}

fn spawn_worker(name: &str, work: impl FnOnce() + Send + 'static) {
    if let Err(e) = thread::Builder::new()
        .name(format!("drawer-{name}"))
        .spawn(work)
    {
        warn!(worker = name, error = %e, "failed to spawn drawer worker");
    }
}

/// Sleep for `duration` in short slices. Returns false if cancelled first.
fn sleep_unless_cancelled(duration: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(POLL_SLICE));
    }
}
