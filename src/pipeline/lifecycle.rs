use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Initializing,
    Ready { streaming: bool },
    Shutdown,
}

/// Lock-protected streaming gate shared between the pipeline and its callers.
///
/// Toggling streaming never touches the inference worker; it only decides
/// whether `process_frame` composites or passes frames through.
#[derive(Clone, Debug)]
pub struct StreamingController {
    state: Arc<Mutex<LifecycleState>>,
}

impl Default for StreamingController {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingController {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LifecycleState::Idle)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LifecycleState {
        *self.lock()
    }

    /// `Idle -> Initializing`. Returns `false` from any other state.
    pub fn begin_initialize(&self) -> bool {
        let mut state = self.lock();
        if *state != LifecycleState::Idle {
            return false;
        }
        *state = LifecycleState::Initializing;
        true
    }

    /// `Initializing -> Ready(streaming = false)`.
    pub fn mark_ready(&self) -> bool {
        let mut state = self.lock();
        if *state != LifecycleState::Initializing {
            return false;
        }
        *state = LifecycleState::Ready { streaming: false };
        true
    }

    /// Returns `true` if the gate changed.
    pub fn start_streaming(&self) -> bool {
        self.set_streaming(true)
    }

    /// Returns `true` if the gate changed.
    pub fn stop_streaming(&self) -> bool {
        self.set_streaming(false)
    }

    fn set_streaming(&self, on: bool) -> bool {
        let mut state = self.lock();
        match *state {
            LifecycleState::Ready { streaming } if streaming != on => {
                *state = LifecycleState::Ready { streaming: on };
                log::info!("streaming {}", if on { "started" } else { "stopped" });
                true
            }
            LifecycleState::Ready { .. } => false,
            other => {
                log::debug!("ignoring streaming toggle in state {other:?}");
                false
            }
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state(), LifecycleState::Ready { streaming: true })
    }

    pub fn is_shutdown(&self) -> bool {
        self.state() == LifecycleState::Shutdown
    }

    /// Moves to the terminal state. Returns `false` if already shut down.
    pub fn shutdown(&self) -> bool {
        let mut state = self.lock();
        if *state == LifecycleState::Shutdown {
            return false;
        }
        *state = LifecycleState::Shutdown;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_needs_ready_state() {
        let ctl = StreamingController::new();
        assert!(!ctl.start_streaming());
        assert!(ctl.begin_initialize());
        assert!(!ctl.begin_initialize());
        assert!(!ctl.start_streaming());
        assert!(ctl.mark_ready());
        assert_eq!(ctl.state(), LifecycleState::Ready { streaming: false });
    }

    #[test]
    fn toggles_are_idempotent() {
        let ctl = StreamingController::new();
        ctl.begin_initialize();
        ctl.mark_ready();
        assert!(ctl.start_streaming());
        assert!(!ctl.start_streaming());
        assert!(ctl.is_streaming());
        assert!(ctl.stop_streaming());
        assert!(!ctl.stop_streaming());
        assert!(!ctl.is_streaming());
    }

    #[test]
    fn shutdown_is_terminal() {
        let ctl = StreamingController::new();
        ctl.begin_initialize();
        ctl.mark_ready();
        ctl.start_streaming();
        let shared = ctl.clone();
        assert!(shared.shutdown());
        assert!(!ctl.shutdown());
        assert!(!ctl.is_streaming());
        assert!(!ctl.start_streaming());
        assert!(!ctl.begin_initialize());
    }
}
