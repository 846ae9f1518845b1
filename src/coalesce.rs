//! Invalidate-and-coalesce re-entrancy guard.
//! At most one pass runs at a time. Invalidating while a pass runs marks the
//! guard dirty so the running owner does exactly one more pass afterwards;
//! repeated invalidations collapse into that single extra pass.

use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Debug, Default)]
struct GuardState {
    running: bool,
    dirty: bool,
}

pub struct Coalescer {
    state: Mutex<GuardState>,
    running_tx: watch::Sender<bool>,
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::new()
    }
}

impl Coalescer {
    pub fn new() -> Self {
        let (running_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(GuardState::default()),
            running_tx,
        }
    }

    /// Request a pass. Returns true if the caller now owns the pass loop and
    /// must call `complete` after each pass.
    pub fn begin(&self) -> bool {
        let mut st = self.state.lock();
        if st.running {
            st.dirty = true;
            return false;
        }
        st.running = true;
        st.dirty = false;
        self.running_tx.send_replace(true);
        true
    }

    /// Finish a pass. Returns true if another pass was requested meanwhile.
    pub fn complete(&self) -> bool {
        let mut st = self.state.lock();
        if st.dirty {
            st.dirty = false;
            return true;
        }
        st.running = false;
        self.running_tx.send_replace(false);
        false
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Wait until no pass is running.
    pub async fn idle(&self) {
        let mut rx = self.running_tx.subscribe();
        let _ = rx.wait_for(|running| !running).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_marks_dirty_and_coalesces() {
        let c = Coalescer::new();
        assert!(c.begin());
        assert!(!c.begin());
        assert!(!c.begin());
        // two invalidations collapse into exactly one extra pass
        assert!(c.complete());
        assert!(!c.complete());
        assert!(!c.is_running());
    }

    #[tokio::test]
    async fn idle_resolves_when_not_running() {
        let c = Coalescer::new();
        c.idle().await;
        assert!(c.begin());
        assert!(!c.complete());
        c.idle().await;
    }
}
