//! Log source adapter: the two channels that deliver log text.
//!
//! - [`LogSource`] answers point-in-time reads: the full log buffer so far,
//!   the artifact listing, the execution record.
//! - [`LogStream`] pushes incremental chunks as the execution produces them.
//!
//! Both are blocking interfaces; the drawer runtime calls them from worker
//! threads and feeds their results back into its event loop.

pub mod http;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::FetchResult;
use crate::execution::{Artifact, ExecutionId, ExecutionRecord};

/// Shared cancellation flag for one in-flight operation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Point-in-time reads against the execution API.
pub trait LogSource: Send + Sync {
    /// The whole log buffer accumulated so far.
    ///
    /// Implementations return `FetchError::Cancelled` instead of a body when
    /// `cancel` fires before the response is handed back.
    fn fetch_historical(&self, execution_id: &ExecutionId, cancel: &CancelToken)
    -> FetchResult<String>;

    fn list_artifacts(&self, execution_id: &ExecutionId) -> FetchResult<Vec<Artifact>>;

    fn fetch_execution(&self, execution_id: &ExecutionId) -> FetchResult<ExecutionRecord>;
}

/// Callback invoked with each pushed chunk, in emission order.
pub type IncrementHandler = Box<dyn FnMut(String) + Send>;

/// Push channel of incremental log chunks.
pub trait LogStream: Send + Sync {
    /// Start delivering chunks for `execution_id` to `on_increment`.
    ///
    /// Delivery stops when the returned handle is unsubscribed or dropped.
    fn subscribe(
        &self,
        execution_id: &ExecutionId,
        on_increment: IncrementHandler,
    ) -> FetchResult<Subscription>;
}

/// Live stream registration. Unsubscribes on drop.
pub struct Subscription {
    execution_id: ExecutionId,
    cancel: CancelToken,
}

impl Subscription {
    pub fn new(execution_id: ExecutionId, cancel: CancelToken) -> Self {
        Self {
            execution_id,
            cancel,
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("execution_id", &self.execution_id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Wrap a handler so it goes quiet once `cancel` fires.
///
/// Transports that cannot interrupt a blocking read use this to guarantee no
/// chunk is delivered after unsubscribe.
pub fn gated(cancel: CancelToken, mut on_increment: IncrementHandler) -> IncrementHandler {
    Box::new(move |chunk| {
        if !cancel.is_cancelled() {
            on_increment(chunk);
        }
    })
}
