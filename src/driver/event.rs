use std::fmt;

use hashbrown::HashSet;

use crate::grid::{Cell, Grid};

/// The state of a run as presented to whoever watches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Paused,
    Executing,
    Quitting,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Paused => write!(f, "Paused"),
            State::Executing => write!(f, "Executing"),
            State::Quitting => write!(f, "Quitting"),
        }
    }
}

/// Everything the run driver tells the presentation side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A cell changed state in the given turn.
    CellFlipped { turn: u32, cell: Cell },
    /// Every flip belonging to `turn` has been sent.
    TurnComplete { turn: u32 },
    AliveCellsCount { turn: u32, count: u32 },
    StateChange { turn: u32, state: State },
    /// A snapshot was handed to the I/O collaborator.
    ImageOutputComplete { turn: u32, filename: String },
    /// The run finished; carries every live cell of the final grid.
    FinalTurnComplete { turn: u32, alive: Vec<Cell> },
}

impl Event {
    pub fn turn(&self) -> u32 {
        match self {
            Event::CellFlipped { turn, .. }
            | Event::TurnComplete { turn }
            | Event::AliveCellsCount { turn, .. }
            | Event::StateChange { turn, .. }
            | Event::ImageOutputComplete { turn, .. }
            | Event::FinalTurnComplete { turn, .. } => *turn,
        }
    }
}

/// Interactive commands relayed to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Pause the run; pausing a paused run resumes it.
    Pause,
    Resume,
    /// Save a snapshot of the current grid.
    Save,
    /// Checkpoint the run on the broker and stop driving it.
    Quit,
    /// Shut down the broker and every compute node.
    Kill,
}

impl Command {
    /// Maps a key to a command: `p`, `r`, `s`, `q`, `k`.
    pub fn from_key(key: char) -> Option<Self> {
        match key {
            'p' => Some(Command::Pause),
            'r' => Some(Command::Resume),
            's' => Some(Command::Save),
            'q' => Some(Command::Quit),
            'k' => Some(Command::Kill),
            _ => None,
        }
    }
}

/// The alive set as seen by a viewer, rebuilt from nothing but flip events.
#[derive(Debug, Default)]
pub struct LiveView {
    alive: HashSet<Cell>,
    turn: u32,
}

impl LiveView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one event. Flips toggle the cell.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::CellFlipped { cell, .. } => {
                if !self.alive.remove(cell) {
                    self.alive.insert(*cell);
                }
            }
            Event::TurnComplete { turn } => self.turn = *turn,
            Event::FinalTurnComplete { turn, alive } => {
                self.turn = *turn;
                self.alive = alive.iter().copied().collect();
            }
            _ => {}
        }
    }

    pub fn turn(&self) -> u32 {
        self.turn
    }

    pub fn alive_count(&self) -> usize {
        self.alive.len()
    }

    pub fn is_alive(&self, cell: &Cell) -> bool {
        self.alive.contains(cell)
    }

    /// Whether the view holds exactly the live cells of `grid`.
    pub fn matches(&self, grid: &Grid) -> bool {
        let alive = grid.alive_cells();
        alive.len() == self.alive.len()
            && alive.iter().all(|cell| self.alive.contains(cell))
    }
}
