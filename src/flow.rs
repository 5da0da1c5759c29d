//! Pause/resume flow control against a queued-byte watermark.

use std::sync::{Arc, Mutex};

/// Downstream producer hooks invoked when the combined pause condition
/// transitions.
pub trait FlowControl: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}

/// Manages pause-resume behavior for a producer feeding the record layer.
///
/// Takes two sets of inputs: explicit `pause`/`resume` calls from the
/// consumer of this engine's output, and a counter of bytes queued downstream
/// awaiting consumption. The producer is paused while either condition holds
/// and resumed only when both have cleared.
///
/// Thread-safe: `increment_queue_length` is typically called from I/O-adapter
/// threads while `pause`/`resume` arrive from the script thread.
pub struct PauseHelper {
    control: Arc<dyn FlowControl>,
    watermark: isize,
    state: Mutex<FlowState>,
}

#[derive(Default)]
struct FlowState {
    pause_requested: bool,
    queue_size: isize,
    paused: bool,
}

impl PauseHelper {
    pub fn new(control: Arc<dyn FlowControl>, watermark: isize) -> Self {
        PauseHelper {
            control,
            watermark,
            state: Mutex::new(FlowState::default()),
        }
    }

    /// Handles an explicit pause request from the consumer.
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        state.pause_requested = true;

        if !state.paused {
            state.paused = true;
            self.control.pause();
        }
    }

    /// Clears the explicit pause request. Resumes the producer only if the
    /// downstream queue has also drained to the watermark.
    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        state.pause_requested = false;

        if state.paused && state.queue_size <= self.watermark {
            state.paused = false;
            self.control.resume();
        }
    }

    /// Adjusts the queued-byte counter. This is the only path by which
    /// queue-size changes can toggle flow state.
    pub fn increment_queue_length(&self, delta: isize) {
        let mut state = self.state.lock().unwrap();
        state.queue_size += delta;

        if state.paused && state.queue_size <= self.watermark && !state.pause_requested {
            state.paused = false;
            self.control.resume();
        } else if !state.paused && state.queue_size > self.watermark {
            state.paused = true;
            self.control.pause();
        }
    }

    pub fn queue_length(&self) -> isize {
        self.state.lock().unwrap().queue_size
    }
}
