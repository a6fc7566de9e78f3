use tokio::sync::watch;

use crate::grid::{FlipEvent, Grid};

/// Whether the turn loop may start another turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// Held at the next turn boundary until resumed.
    Paused,
    /// The loop exits at the next turn boundary.
    Stopped,
}

/// The broker's in-memory run state. It lives for as long as the broker
/// process does and is never written anywhere.
#[derive(Default)]
pub struct Session {
    current: Grid,
    /// What the live view was last told about. Always an independent copy,
    /// never the grid the turn loop writes to.
    last_observed: Grid,
    turn: u32,
    /// A checkpointed session is picked up by the next run request.
    resumable: bool,
    turn_completed: bool,
}

impl Session {
    /// Adopts the caller's grid unless a checkpointed session is waiting,
    /// in which case the frozen grid and turn are kept.
    pub fn begin(&mut self, grid: Grid) -> bool {
        let resumed = self.resumable;
        if !resumed {
            self.current = grid;
            self.turn = 0;
        }
        self.last_observed = self.current.clone();
        self.turn_completed = false;
        resumed
    }

    /// Installs the grid of the turn that just finished.
    pub fn complete_turn(&mut self, next: Grid) {
        self.current = next;
        self.turn += 1;
        self.turn_completed = true;
    }

    /// Marks the run as complete; there is nothing left to resume.
    pub fn finish(&mut self) {
        self.resumable = false;
    }

    /// Freezes the current grid and turn for a later run to pick up.
    pub fn checkpoint(&mut self) {
        self.resumable = true;
        self.last_observed = self.current.clone();
    }

    /// Reports every cell that differs from what was last observed, then
    /// makes the current grid the observed one.
    pub fn flipped_since(&mut self) -> Vec<FlipEvent> {
        let turn = self.turn;
        let events = self
            .current
            .flipped_cells(&self.last_observed)
            .into_iter()
            .map(|cell| FlipEvent { turn, cell })
            .collect();
        self.last_observed = self.current.clone();
        events
    }

    /// Returns and clears the turn-completed edge.
    pub fn take_turn_completed(&mut self) -> (bool, u32) {
        (std::mem::take(&mut self.turn_completed), self.turn)
    }

    pub fn current(&self) -> &Grid {
        &self.current
    }

    pub fn turn(&self) -> u32 {
        self.turn
    }

    pub fn resumable(&self) -> bool {
        self.resumable
    }
}

/// The run control published to the turn loop. Pausing and resuming only
/// flip the state; nothing is held across calls.
pub struct RunControl {
    state: watch::Sender<RunState>,
}

impl RunControl {
    pub fn new() -> Self {
        let (state, _) = watch::channel(RunState::Stopped);
        Self { state }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn start(&self) {
        self.state.send_replace(RunState::Running);
    }

    pub fn stop(&self) {
        self.state.send_replace(RunState::Stopped);
    }

    /// Moves `Running` to `Paused`. Returns whether anything changed.
    pub fn pause(&self) -> bool {
        self.transition(RunState::Running, RunState::Paused)
    }

    /// Moves `Paused` to `Running`. Returns whether anything changed.
    pub fn resume(&self) -> bool {
        self.transition(RunState::Paused, RunState::Running)
    }

    fn transition(&self, from: RunState, to: RunState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Waits out a pause. Returns `false` once the run has been stopped.
    pub async fn proceed(&self) -> bool {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                RunState::Running => return true,
                RunState::Stopped => return false,
                RunState::Paused => {
                    if rx.changed().await.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}
