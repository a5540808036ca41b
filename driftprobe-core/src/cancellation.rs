//! Cancellation scopes.
//!
//! A run uses a three-level token hierarchy:
//!
//! ```text
//! caller token            (owned by the caller)
//! └── run token           (cancelled when one environment fails)
//!     └── table token     (cancelled when one table's deadline passes)
//! ```
//!
//! Cancelling a level cancels everything beneath it, so each scope also
//! remembers its parent in order to report which level actually fired.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Which level of the hierarchy requested cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSource {
    /// The caller cancelled the whole run
    Caller,
    /// A sibling environment failed
    SiblingFailure,
    /// The per-table deadline passed
    TableDeadline,
}

/// Run-level scope linking the caller's token to sibling-failure cancellation.
#[derive(Debug, Clone)]
pub struct RunScope {
    caller: CancellationToken,
    linked: CancellationToken,
}

impl RunScope {
    /// Derives a run scope from the caller's token.
    pub fn new(caller: &CancellationToken) -> Self {
        Self {
            caller: caller.clone(),
            linked: caller.child_token(),
        }
    }

    /// Token handed to every environment capture.
    pub fn token(&self) -> &CancellationToken {
        &self.linked
    }

    /// Cancels every capture of the run without touching the caller's token.
    pub fn cancel_siblings(&self) {
        self.linked.cancel();
    }

    /// Which level cancelled the run, if any.
    pub fn source(&self) -> Option<CancelSource> {
        if self.caller.is_cancelled() {
            Some(CancelSource::Caller)
        } else if self.linked.is_cancelled() {
            Some(CancelSource::SiblingFailure)
        } else {
            None
        }
    }
}

/// Per-table deadline nested inside the run scope.
///
/// The deadline timer is aborted when the scope is dropped.
#[derive(Debug)]
pub struct TableScope {
    upstream: CancellationToken,
    token: CancellationToken,
    timer: JoinHandle<()>,
}

impl TableScope {
    /// Starts a deadline of `deadline` under `upstream`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(upstream: &CancellationToken, deadline: Duration) -> Self {
        let token = upstream.child_token();
        let timer_token = token.clone();
        let timer = tokio::spawn(async move {
            tokio::select! {
                () = timer_token.cancelled() => {}
                () = tokio::time::sleep(deadline) => timer_token.cancel(),
            }
        });
        Self {
            upstream: upstream.clone(),
            token,
            timer,
        }
    }

    /// Token that fires on the deadline or on any upstream cancellation.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Token of the enclosing scope.
    pub fn upstream(&self) -> &CancellationToken {
        &self.upstream
    }

    /// Which level cancelled this table, if any. Upstream cancellation is
    /// reported as [`CancelSource::Caller`]; only the run scope can tell a
    /// caller cancellation from a sibling failure.
    pub fn source(&self) -> Option<CancelSource> {
        if self.upstream.is_cancelled() {
            Some(CancelSource::Caller)
        } else if self.token.is_cancelled() {
            Some(CancelSource::TableDeadline)
        } else {
            None
        }
    }

    /// True when the deadline, and not an upstream request, fired.
    pub fn deadline_fired(&self) -> bool {
        self.source() == Some(CancelSource::TableDeadline)
    }
}

impl Drop for TableScope {
    fn drop(&mut self) {
        self.timer.abort();
    }
}
