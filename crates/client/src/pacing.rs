//! Pause/resume of fetch dispatch while a list scrolls.
//!
//! While paused, submissions are buffered instead of dispatched. Resuming
//! hands the buffer back in submission order. A slot that submits again while
//! buffered replaces its earlier submission, so the buffer never holds more
//! than one request per consumer slot.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::request::Cancellable;

/// Outcome of [`ScrollPacer::submit`].
#[derive(Debug)]
pub enum Submission<R> {
    /// Not paused: the caller dispatches the request now.
    Dispatch(R),
    /// Paused: the request waits for [`ScrollPacer::resume`].
    Buffered,
}

/// Scroll state reported by the list widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollState {
    Idle,
    /// The user is dragging the list.
    Dragging,
    /// The list keeps moving after a fling.
    Settling,
}

/// Which scroll states pause dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseOnScroll {
    pub pause_on_scroll: bool,
    pub pause_on_fling: bool,
}

impl Default for PauseOnScroll {
    fn default() -> Self {
        Self { pause_on_scroll: false, pause_on_fling: true }
    }
}

impl PauseOnScroll {
    pub fn from_config(config: &lumen_core::AppConfig) -> Self {
        Self { pause_on_scroll: config.pause_on_scroll, pause_on_fling: config.pause_on_fling }
    }

    /// `Some(true)` to pause, `Some(false)` to resume, `None` to ignore.
    pub fn decide(&self, state: ScrollState) -> Option<bool> {
        if !self.pause_on_scroll && !self.pause_on_fling {
            return None;
        }
        Some(match state {
            ScrollState::Idle => false,
            ScrollState::Dragging => self.pause_on_scroll,
            ScrollState::Settling => self.pause_on_fling,
        })
    }
}

#[derive(Debug)]
struct PacerState<S, R> {
    paused: bool,
    buffer: Vec<(S, R)>,
}

/// Two-state dispatch gate: active or paused.
#[derive(Debug)]
pub struct ScrollPacer<S, R> {
    state: Mutex<PacerState<S, R>>,
    policy: PauseOnScroll,
}

impl<S: PartialEq, R: Cancellable> ScrollPacer<S, R> {
    pub fn new(policy: PauseOnScroll) -> Self {
        Self { state: Mutex::new(PacerState { paused: false, buffer: Vec::new() }), policy }
    }

    pub fn policy(&self) -> PauseOnScroll {
        self.policy
    }

    pub fn submit(&self, slot: S, request: R) -> Submission<R> {
        let superseded = {
            let mut state = self.state.lock();
            if !state.paused {
                return Submission::Dispatch(request);
            }
            let superseded = state
                .buffer
                .iter()
                .position(|(buffered, _)| *buffered == slot)
                .map(|index| state.buffer.remove(index));
            state.buffer.push((slot, request));
            superseded
        };

        if let Some((_, superseded)) = superseded {
            superseded.cancel();
        }
        Submission::Buffered
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        if !state.paused {
            tracing::debug!("pausing dispatch");
            state.paused = true;
        }
    }

    /// Become active and return the buffered requests in submission order.
    ///
    /// A no-op returning nothing when not paused or when nothing is buffered;
    /// in the latter case the pacer stays paused.
    pub fn resume(&self) -> Vec<(S, R)> {
        let mut state = self.state.lock();
        if !state.paused || state.buffer.is_empty() {
            return Vec::new();
        }
        state.paused = false;
        let buffered = std::mem::take(&mut state.buffer);
        tracing::debug!(buffered = buffered.len(), "resuming dispatch");
        buffered
    }

    /// Apply the pause policy to a scroll state change.
    ///
    /// Returns the requests released by a resume, if any.
    pub fn on_scroll_state_changed(&self, scroll: ScrollState) -> Vec<(S, R)> {
        match self.policy.decide(scroll) {
            Some(true) => {
                self.pause();
                Vec::new()
            }
            Some(false) => self.resume(),
            None => Vec::new(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Number of buffered requests.
    pub fn pending(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Cancel and drop every buffered request without changing the paused state.
    pub fn cancel_all(&self) -> usize {
        let drained = std::mem::take(&mut self.state.lock().buffer);
        for (_, request) in &drained {
            request.cancel();
        }
        drained.len()
    }
}
