//! Maps terminal signals to cancel/detach decisions.
//!
//! Signal delivery itself lives in the binary; everything here is plain state
//! so the debounce window can be driven by a fake clock.

use crate::constants::INTERRUPT_WINDOW;

use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A signal forwarded by the binary while a job is being watched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ctrl-C.
    Interrupt,
    /// Ctrl-Z: stop watching, leave the job running.
    Detach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// First press in a window: warn, do nothing else.
    Warn,
    /// Second press within the window: terminate the job.
    Cancel,
    /// Termination was already requested; keep waiting for the final state.
    AlreadyCancelling,
    /// The job is already finished, there is nothing to cancel.
    Exit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptState {
    pub count: u32,
    pub first_at: Option<Instant>,
}

#[derive(Debug)]
pub struct InterruptCoordinator<C = SystemClock> {
    clock: C,
    window: Duration,
    state: InterruptState,
    cancelling: bool,
}

impl Default for InterruptCoordinator<SystemClock> {
    fn default() -> Self {
        Self::new(SystemClock)
    }
}

impl<C: Clock> InterruptCoordinator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            window: INTERRUPT_WINDOW,
            state: InterruptState::default(),
            cancelling: false,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn state(&self) -> InterruptState {
        self.state
    }

    pub fn is_cancelling(&self) -> bool {
        self.cancelling
    }

    /// Records a termination request made without a double press (e.g. `--cancel`).
    pub fn mark_cancelling(&mut self) {
        self.cancelling = true;
    }

    /// Call once per interrupt signal.
    pub fn on_interrupt(&mut self, job_terminal: bool) -> InterruptAction {
        if job_terminal {
            return InterruptAction::Exit;
        }
        if self.cancelling {
            return InterruptAction::AlreadyCancelling;
        }

        let now = self.clock.now();
        self.expire_at(now);

        match self.state.first_at {
            None => {
                self.state = InterruptState {
                    count: 1,
                    first_at: Some(now),
                };
                InterruptAction::Warn
            }
            Some(_) => {
                self.state = InterruptState::default();
                self.cancelling = true;
                InterruptAction::Cancel
            }
        }
    }

    /// Forgets a first press whose window has run out.
    pub fn expire(&mut self) {
        let now = self.clock.now();
        self.expire_at(now);
    }

    fn expire_at(&mut self, now: Instant) {
        let expired = self
            .state
            .first_at
            .is_some_and(|first| now.saturating_duration_since(first) > self.window);
        if expired {
            self.state = InterruptState::default();
        }
    }
}
