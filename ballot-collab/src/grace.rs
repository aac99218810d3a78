//! Disconnect grace scheduler.
//!
//! When an identity's last socket closes, eviction is deferred for a fixed
//! window so page reloads and short network drops do not kick the user out of
//! their rooms. A reconnect inside the window cancels the timer.
//!
//! Each armed timer carries a generation number. The expiry callback must
//! [`claim`](GraceScheduler::claim) its generation under the same lock that
//! guards room and presence state before evicting anything, so a reconnect
//! racing the expiry instant resolves to exactly one outcome: either the
//! cancel removed the entry first (claim fails, nothing happens) or the claim
//! won (the reconnect arrives after a complete eviction).
//!
//! The scheduler only holds timers keyed by identity. It never owns room or
//! presence state.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Reference grace window.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraceError {
    /// A removal is already pending; cancel it before arming another.
    #[error("removal already armed for {0}")]
    AlreadyArmed(String),
}

#[derive(Debug)]
struct ArmedRemoval {
    generation: u64,
    handle: JoinHandle<()>,
}

/// One-shot removal timers keyed by identity.
#[derive(Debug, Default)]
pub struct GraceScheduler {
    armed: HashMap<String, ArmedRemoval>,
    next_generation: u64,
}

impl GraceScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a removal timer for `identity`.
    ///
    /// `on_expire` receives the timer's generation and builds the future run
    /// once `after` elapses. Panics inside that future are logged and do not
    /// affect other timers. Must be called inside a tokio runtime.
    pub fn schedule<F, Fut>(
        &mut self,
        identity: &str,
        after: Duration,
        on_expire: F,
    ) -> Result<u64, GraceError>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.armed.contains_key(identity) {
            return Err(GraceError::AlreadyArmed(identity.to_string()));
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let expiry = on_expire(generation);
        let who = identity.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if AssertUnwindSafe(expiry).catch_unwind().await.is_err() {
                log::error!("Grace expiry for {who} panicked; state left as-is");
            }
        });

        self.armed
            .insert(identity.to_string(), ArmedRemoval { generation, handle });
        log::debug!("Armed removal #{generation} for {identity} in {after:?}");
        Ok(generation)
    }

    /// Disarm the pending removal, if any.
    pub fn cancel(&mut self, identity: &str) -> bool {
        match self.armed.remove(identity) {
            Some(armed) => {
                armed.handle.abort();
                log::debug!("Cancelled removal #{} for {identity}", armed.generation);
                true
            }
            None => false,
        }
    }

    /// Called by a firing timer. Disarms and returns `true` only if
    /// `generation` is still the armed timer for `identity`.
    pub fn claim(&mut self, identity: &str, generation: u64) -> bool {
        match self.armed.get(identity) {
            Some(armed) if armed.generation == generation => {
                self.armed.remove(identity);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, identity: &str) -> bool {
        self.armed.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}
