//! Process-wide backfill pause.
//!
//! One [`PauseGate`] is shared by every collection's backfill. While closed,
//! backfills stop pulling rows at the next row boundary; the change feeds
//! keep running. `pause` and `resume` are idempotent.
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use index_replicator::pause::PauseGate;
//!
//! let gate = PauseGate::new();
//! assert!(gate.pause());
//! assert!(!gate.pause()); // already paused
//! assert!(gate.resume());
//! gate.wait_until_open().await; // returns immediately
//! # }
//! ```

use tokio::sync::watch;
use tracing::info;

/// Shared pause flag for all backfills.
#[derive(Debug)]
pub struct PauseGate {
    paused: watch::Sender<bool>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    /// Create an open (not paused) gate.
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { paused }
    }

    /// Close the gate. Returns `false` if it was already closed.
    pub fn pause(&self) -> bool {
        let changed = self.paused.send_if_modified(|paused| !std::mem::replace(paused, true));
        if changed {
            info!("Backfill paused");
            crate::metrics::set_backfill_paused(true);
        }
        changed
    }

    /// Open the gate, waking every waiting backfill. Returns `false` if it
    /// was already open.
    pub fn resume(&self) -> bool {
        let changed = self.paused.send_if_modified(|paused| std::mem::replace(paused, false));
        if changed {
            info!("Backfill resumed");
            crate::metrics::set_backfill_paused(false);
        }
        changed
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Wait until the gate is open. Returns immediately if it already is.
    pub async fn wait_until_open(&self) {
        let mut rx = self.paused.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}
