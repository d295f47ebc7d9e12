//! Cancellable one-shot timers keyed to the session state that armed them.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chess_core::NodeId;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Opponent moves first because the opening ends on its turn
    OpponentOpening,
    OpponentReply,
    Completion,
}

/// Identity of the state a timer was armed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerKey {
    pub kind: TimerKind,
    pub epoch: u64,
    pub game_id: String,
    /// Cursor the timer is tied to; `None` for timers that survive moves.
    pub node: Option<NodeId>,
}

impl TimerKey {
    pub fn matches(&self, epoch: u64, game_id: &str, cursor: NodeId) -> bool {
        self.epoch == epoch && self.game_id == game_id && self.node.map_or(true, |node| node == cursor)
    }
}

/// At most one pending timer per kind.
pub struct Timers {
    pending: HashMap<TimerKind, (TimerKey, AbortHandle)>,
    runtime: Handle,
}

impl Timers {
    pub fn new(runtime: Handle) -> Self {
        Self {
            pending: HashMap::new(),
            runtime,
        }
    }

    /// Run `fire` after `delay` unless cancelled first.
    ///
    /// Re-arming an identical key keeps the original deadline; a different key
    /// of the same kind replaces (and aborts) the old timer.
    pub fn schedule<F>(&mut self, key: TimerKey, delay: Duration, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_pending(&key) {
            return;
        }
        debug!(kind = ?key.kind, game_id = %key.game_id, delay_ms = delay.as_millis() as u64, "Timer armed");

        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            fire.await;
        });
        if let Some((_, old)) = self.pending.insert(key.kind, (key, task.abort_handle())) {
            old.abort();
        }
    }

    pub fn is_pending(&self, key: &TimerKey) -> bool {
        self.pending.get(&key.kind).is_some_and(|(pending, _)| pending == key)
    }

    pub fn has_pending(&self, kind: TimerKind) -> bool {
        self.pending.contains_key(&kind)
    }

    /// Claim a firing timer. Returns `false` if it was cancelled or replaced.
    ///
    /// A claimed timer is no longer tracked, so later cancellation cannot
    /// abort the work it goes on to do.
    pub fn claim(&mut self, key: &TimerKey) -> bool {
        if self.is_pending(key) {
            self.pending.remove(&key.kind);
            true
        } else {
            false
        }
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some((key, handle)) = self.pending.remove(&kind) {
            debug!(kind = ?key.kind, "Timer cancelled");
            handle.abort();
        }
    }

    /// Abort every timer whose key fails `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&TimerKey) -> bool) {
        self.pending.retain(|_, (key, handle)| {
            let keep = keep(key);
            if !keep {
                debug!(kind = ?key.kind, "Stale timer cancelled");
                handle.abort();
            }
            keep
        });
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.pending.drain() {
            handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
