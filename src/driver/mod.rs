//! The run driver. It seeds a grid, submits the run to the broker and, while
//! that call is outstanding, keeps polling the broker for flips and alive
//! counts and relays interactive commands.

mod event;
mod io;

use std::time::Duration;

use tokio::{
    sync::{mpsc, watch},
    time::{interval, interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, info_span, warn, Instrument};
use typed_builder::TypedBuilder;

pub use self::{
    event::{Command, Event, LiveView, State},
    io::{decode_pgm, encode_pgm, Io},
};
use crate::{broker::BrokerClient, error::Error, grid::Grid};

/// Share of cells seeded alive by a random start.
pub const RANDOM_DENSITY: f64 = 0.1;

#[derive(Debug, Clone, TypedBuilder)]
pub struct Params {
    pub turns: u32,
    pub threads: u32,
    pub width: u32,
    pub height: u32,
    /// Seed randomly instead of reading `<width>x<height>.pgm`.
    #[builder(default)]
    pub random: bool,
    /// How often flips are polled.
    #[builder(default = Duration::from_millis(5))]
    pub live_view: Duration,
    #[builder(default = Duration::from_secs(2))]
    pub alive_count: Duration,
}

impl Params {
    pub fn input_key(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    pub fn output_key(&self, turn: u32) -> String {
        format!("{}x{}x{}", self.width, self.height, turn)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The broker reached the requested turn.
    Completed { turn: u32 },
    /// The run was checkpointed on the broker and can be resumed.
    Quit { turn: u32 },
    /// The broker and its compute nodes were shut down.
    Killed { turn: u32 },
}

#[derive(Clone)]
pub struct Distributor {
    params: Params,
    broker: BrokerClient,
    io: Io,
    events: mpsc::Sender<Event>,
}

impl Distributor {
    pub fn new(
        params: Params,
        broker: BrokerClient,
        io: Io,
        events: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            params,
            broker,
            io,
            events,
        }
    }

    /// Drives one run to its end. The event stream closes when this returns.
    pub async fn run(
        self,
        commands: mpsc::Receiver<Command>,
    ) -> Result<Outcome, Error> {
        let span = info_span!(
            "run",
            turns = self.params.turns,
            threads = self.params.threads
        );
        self.drive(commands).instrument(span).await
    }

    async fn drive(
        self,
        commands: mpsc::Receiver<Command>,
    ) -> Result<Outcome, Error> {
        let seed = self.seed().await?;
        let resumable = self.broker.resumable_state().await?;
        let (grid, turn) = if resumable.resumable {
            info!(turn = resumable.turn, "continuing a checkpointed run");
            (resumable.grid, resumable.turn)
        } else {
            (seed, 0)
        };

        for cell in grid.alive_cells() {
            self.emit(Event::CellFlipped { turn, cell }).await;
        }
        self.emit(Event::StateChange {
            turn,
            state: State::Executing,
        })
        .await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let control = tokio::spawn(
            self.clone()
                .control(turn, commands, stop_rx)
                .in_current_span(),
        );
        let reached = self
            .broker
            .advance_run(grid, self.params.turns, self.params.threads)
            .await;
        stop_tx.send_replace(true);

        // Quit and kill make the broker answer early, or not at all. Their
        // outcome wins over whatever the run call returned.
        let (grid, turn) = match (control.await?, reached) {
            (Ok(Some(outcome)), _) => return Ok(outcome),
            (Err(e), _) | (Ok(None), Err(e)) => return Err(e),
            (Ok(None), Ok(reached)) => reached,
        };

        // One last poll so a live view ends on the final grid.
        self.poll_flips(turn).await?;
        let alive = self.broker.list_alive_cells().await?;
        info!(
            turn,
            alive = alive.len(),
            digest = %grid.digest(),
            "run complete"
        );
        self.emit(Event::FinalTurnComplete { turn, alive }).await;
        self.save(grid, turn).await?;
        self.emit(Event::StateChange {
            turn,
            state: State::Quitting,
        })
        .await;
        Ok(Outcome::Completed { turn })
    }

    async fn seed(&self) -> Result<Grid, Error> {
        let Params { width, height, .. } = self.params;
        if self.params.random {
            let mut rng = rand::thread_rng();
            return Ok(Grid::random(width, height, RANDOM_DENSITY, &mut rng));
        }
        let grid = self.io.read(&self.params.input_key()).await?;
        if grid.width() != width || grid.height() != height {
            return Err(Error::GridShape {
                width,
                height,
                len: grid.cells().len(),
            });
        }
        Ok(grid)
    }

    /// Polls the broker until told to stop or until a quit or kill command
    /// ends the run. Only the latter yields an outcome.
    async fn control(
        self,
        mut turn: u32,
        mut commands: mpsc::Receiver<Command>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<Option<Outcome>, Error> {
        let mut live_view = interval(self.params.live_view);
        live_view.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let period = self.params.alive_count;
        let mut alive_count = interval_at(Instant::now() + period, period);
        alive_count.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut paused = false;
        let mut listening = true;
        loop {
            tokio::select! {
                _ = stop.changed() => return Ok(None),
                _ = live_view.tick() => {
                    turn = self.poll_flips(turn).await?;
                }
                _ = alive_count.tick() => {
                    let (count, reached) =
                        self.broker.count_alive_cells().await?;
                    turn = reached;
                    self.emit(Event::AliveCellsCount { turn, count }).await;
                }
                command = commands.recv(), if listening => match command {
                    Some(command) => {
                        let outcome =
                            self.command(command, &mut paused, &mut turn);
                        if let Some(outcome) = outcome.await? {
                            return Ok(Some(outcome));
                        }
                    }
                    None => listening = false,
                },
            }
        }
    }

    async fn command(
        &self,
        command: Command,
        paused: &mut bool,
        turn: &mut u32,
    ) -> Result<Option<Outcome>, Error> {
        info!(?command, "command received");
        match command {
            Command::Pause if !*paused => match self.broker.pause().await {
                Ok(()) => {
                    *paused = true;
                    info!(turn = *turn, "paused");
                    self.emit(Event::StateChange {
                        turn: *turn,
                        state: State::Paused,
                    })
                    .await;
                }
                // nothing is executing yet, or any more
                Err(Error::Remote(reason)) => {
                    warn!(%reason, "broker did not pause")
                }
                Err(e) => return Err(e),
            },
            Command::Pause | Command::Resume if *paused => {
                match self.broker.resume().await {
                    Ok(()) => {
                        *paused = false;
                        self.emit(Event::StateChange {
                            turn: *turn,
                            state: State::Executing,
                        })
                        .await;
                    }
                    Err(Error::Remote(reason)) => {
                        warn!(%reason, "broker did not resume")
                    }
                    Err(e) => return Err(e),
                }
            }
            Command::Pause | Command::Resume => debug!("not paused"),
            Command::Save => {
                let (grid, reached) = self.broker.world_snapshot().await?;
                *turn = reached;
                self.save(grid, reached).await?;
            }
            Command::Quit => {
                self.broker.checkpoint().await?;
                let (grid, reached) = self.broker.world_snapshot().await?;
                info!(
                    turn = reached,
                    digest = %grid.digest(),
                    "run checkpointed"
                );
                self.finish_early(grid, reached).await?;
                return Ok(Some(Outcome::Quit { turn: reached }));
            }
            Command::Kill => {
                // The broker is gone once it acknowledges, so snapshot first.
                let (grid, reached) = self.broker.world_snapshot().await?;
                self.broker.terminate().await?;
                info!(turn = reached, "broker terminated");
                self.finish_early(grid, reached).await?;
                return Ok(Some(Outcome::Killed { turn: reached }));
            }
        }
        Ok(None)
    }

    async fn finish_early(&self, grid: Grid, turn: u32) -> Result<(), Error> {
        self.save(grid, turn).await?;
        self.emit(Event::StateChange {
            turn,
            state: State::Quitting,
        })
        .await;
        Ok(())
    }

    /// Relays every flip since the last poll and marks the turn boundary.
    /// Returns the latest turn seen.
    async fn poll_flips(&self, turn: u32) -> Result<u32, Error> {
        let flips = self.broker.flipped_since().await?;
        let mut latest = turn;
        let flipped = !flips.is_empty();
        for flip in flips {
            latest = flip.turn;
            self.emit(Event::CellFlipped {
                turn: flip.turn,
                cell: flip.cell,
            })
            .await;
        }
        let (completed, reached) = self.broker.turn_completion_flag().await?;
        if !flipped {
            latest = latest.max(reached);
        }
        if flipped || completed {
            self.emit(Event::TurnComplete { turn: latest }).await;
        }
        Ok(latest)
    }

    async fn save(&self, grid: Grid, turn: u32) -> Result<(), Error> {
        let filename = self.params.output_key(turn);
        self.io.write(filename.clone(), grid)?;
        self.io.idle().await?;
        self.emit(Event::ImageOutputComplete { turn, filename }).await;
        Ok(())
    }

    /// A viewer that has gone away does not stop the run.
    async fn emit(&self, event: Event) {
        let _ = self.events.send(event).await;
    }
}
