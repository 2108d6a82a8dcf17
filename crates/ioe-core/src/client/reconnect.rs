use tokio::task::AbortHandle;

/// Single-slot reconnect timer with a permanent off switch.
///
/// At most one reconnect is ever pending. Once `close()` has been called
/// nothing can be scheduled again.
#[derive(Debug, Default)]
pub struct ReconnectTimer {
    closing: bool,
    pending: Option<AbortHandle>,
}

impl ReconnectTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a timer task via `spawn` unless one is already pending or the
    /// connection is closing. Returns whether a timer was started.
    pub fn schedule(&mut self, spawn: impl FnOnce() -> AbortHandle) -> bool {
        if self.closing || self.pending.is_some() {
            return false;
        }
        self.pending = Some(spawn());
        true
    }

    /// Called by the timer task when its delay elapsed. Returns whether the
    /// reconnect should actually happen.
    pub fn fired(&mut self) -> bool {
        self.pending.take().is_some() && !self.closing
    }

    /// Cancel any pending timer and refuse all future ones.
    pub fn close(&mut self) {
        self.closing = true;
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }
}
