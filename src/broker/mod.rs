// The broker owns the authoritative grid and turn counter for as long as its
// process lives. One run request at a time drives the turn loop; every other
// request (live-view polling, counts, pause, checkpoint) is answered
// concurrently from the same session, which sits behind a single lock.
//
// A turn is a full barrier: the grid is cut into bands, every band is sent
// to a compute node together with a copy of the whole grid (so nodes can
// read the rows around their band, wrap-around rows included), and the next
// grid is only installed once every band has come back. Bands are stitched
// together in band order no matter which node answers first.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    error::Error,
    grid::{Cell, FlipEvent, Grid},
    life,
    net::{Endpoint, Request, Response, Service},
    node::Compute,
};

mod client;
pub mod discovery;
mod session;

pub use client::{BrokerClient, ResumableState};
pub use session::{RunControl, RunState, Session};

pub struct Broker {
    session: Mutex<Session>,
    control: RunControl,
    /// Held for the whole of a run request so only one turn loop exists.
    run_guard: Mutex<()>,
    nodes: Vec<Arc<dyn Compute>>,
}

impl Broker {
    /// Creates a broker over a fixed set of compute nodes.
    pub fn new(nodes: Vec<Arc<dyn Compute>>) -> Self {
        Self {
            session: Mutex::new(Session::default()),
            control: RunControl::new(),
            run_guard: Mutex::new(()),
            nodes,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn run_state(&self) -> RunState {
        self.control.state()
    }

    /// Runs the simulation until `turns` is reached or the run is stopped,
    /// and returns the grid and turn reached.
    ///
    /// The caller's grid is ignored when a checkpointed session is waiting.
    /// Stop requests take effect at the next turn boundary. A checkpoint
    /// waits for the turn in flight, and no turn starts after it.
    pub async fn advance_run(
        &self,
        grid: Grid,
        turns: u32,
        threads: u32,
    ) -> Result<(Grid, u32), Error> {
        grid.validate()?;
        if threads == 0 {
            Err(Error::InvalidThreads)?
        }
        if self.nodes.is_empty() {
            Err(Error::NoComputeNodes)?
        }

        let _run = self.run_guard.lock().await;
        {
            // started under the session lock so a checkpoint either comes
            // before the run or stops it
            let mut session = self.session.lock().await;
            if session.begin(grid) {
                info!(turn = session.turn(), "resuming checkpointed session");
            }
            self.control.start();
        }

        let span = info_span!("run", turns, threads, nodes = self.nodes.len());
        let result = self.turn_loop(turns, threads).instrument(span).await;
        self.control.stop();
        result?;

        let session = self.session.lock().await;
        info!(turn = session.turn(), "run returned");
        Ok((session.current().clone(), session.turn()))
    }

    /// Advances turns until `turns` is reached or the run is stopped. The
    /// session lock is held for the whole of each fan-out/fan-in cycle.
    async fn turn_loop(&self, turns: u32, threads: u32) -> Result<(), Error> {
        while self.control.proceed().await {
            let mut session = self.session.lock().await;
            // a checkpoint stops the run under this lock; no turn follows it
            if self.control.state() == RunState::Stopped {
                break;
            }
            if session.turn() >= turns {
                session.finish();
                return Ok(());
            }
            let next = self.fan_out(session.current(), threads).await?;
            session.complete_turn(next);
        }
        debug!("run stopped");
        Ok(())
    }

    /// Computes one turn across every compute node. Band `i` goes to node
    /// `i mod nodes`; empty bands are not sent anywhere.
    async fn fan_out(&self, grid: &Grid, threads: u32) -> Result<Grid, Error> {
        let nodes = self.nodes.len();
        let calls = life::partition(grid.height(), threads)
            .into_iter()
            .enumerate()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(i, rows)| self.nodes[i % nodes].evolve(grid, rows));
        let bands = try_join_all(calls).await?;
        Grid::from_parts(grid.width(), grid.height(), bands)
    }

    pub async fn world_snapshot(&self) -> (Grid, u32) {
        let session = self.session.lock().await;
        (session.current().clone(), session.turn())
    }

    pub async fn count_alive_cells(&self) -> (u32, u32) {
        let session = self.session.lock().await;
        (session.current().alive_count() as u32, session.turn())
    }

    pub async fn list_alive_cells(&self) -> Vec<Cell> {
        self.session.lock().await.current().alive_cells()
    }

    pub async fn flipped_since(&self) -> Vec<FlipEvent> {
        self.session.lock().await.flipped_since()
    }

    pub async fn turn_completion_flag(&self) -> (bool, u32) {
        self.session.lock().await.take_turn_completed()
    }

    pub async fn resumable_state(&self) -> (bool, Grid, u32) {
        let session = self.session.lock().await;
        (session.resumable(), session.current().clone(), session.turn())
    }

    /// Holds a running run at its next turn boundary. Fails when no run is
    /// executing.
    pub fn pause(&self) -> Result<(), Error> {
        if !self.control.pause() {
            Err(Error::RunState {
                action: "pause",
                state: self.control.state(),
            })?
        }
        info!("run paused");
        Ok(())
    }

    /// Fails unless the run is paused.
    pub fn resume(&self) -> Result<(), Error> {
        if !self.control.resume() {
            Err(Error::RunState {
                action: "resume",
                state: self.control.state(),
            })?
        }
        info!("run resumed");
        Ok(())
    }

    /// Freezes the session and stops the run at its next turn boundary. The
    /// broker and its compute nodes stay up.
    pub async fn checkpoint(&self) {
        let mut session = self.session.lock().await;
        self.control.stop();
        session.checkpoint();
        info!(
            turn = session.turn(),
            digest = %session.current().digest(),
            "session checkpointed"
        );
    }

    /// Tells every compute node to shut down and drops the links to them.
    /// A node that fails to answer is logged and skipped.
    pub async fn terminate(&self) {
        self.control.stop();
        for node in &self.nodes {
            match node.shutdown().await {
                Ok(()) => debug!(node = %node.name(), "compute node shut down"),
                Err(e) => warn!(
                    node = %node.name(),
                    "compute node did not shut down: {e}"
                ),
            }
            node.close();
        }
        info!("all compute nodes released");
    }
}

#[async_trait]
impl Service for Broker {
    async fn handle(&self, request: Request) -> Result<Response, Error> {
        Ok(match request {
            Request::AdvanceRun {
                grid,
                turns,
                threads,
            } => {
                let (grid, turn) =
                    self.advance_run(grid, turns, threads).await?;
                Response::World { grid, turn }
            }
            Request::ListAliveCells => {
                Response::AliveCells(self.list_alive_cells().await)
            }
            Request::CountAliveCells => {
                let (count, turn) = self.count_alive_cells().await;
                Response::AliveCount { count, turn }
            }
            Request::GetWorldSnapshot => {
                let (grid, turn) = self.world_snapshot().await;
                Response::World { grid, turn }
            }
            Request::Pause => {
                self.pause()?;
                Response::Ack
            }
            Request::Resume => {
                self.resume()?;
                Response::Ack
            }
            Request::Checkpoint => {
                self.checkpoint().await;
                Response::Ack
            }
            Request::Terminate => {
                self.terminate().await;
                Response::Ack
            }
            Request::GetTurnCompletionFlag => {
                let (completed, turn) = self.turn_completion_flag().await;
                Response::TurnCompletion { completed, turn }
            }
            Request::GetResumableState => {
                let (resumable, grid, turn) = self.resumable_state().await;
                Response::Resumable {
                    resumable,
                    grid,
                    turn,
                }
            }
            Request::GetFlippedSince => {
                Response::Flipped(self.flipped_since().await)
            }
            other => Response::Failed(format!(
                "the broker does not serve {}",
                other.name()
            )),
        })
    }
}

/// Serves a broker on `endpoint` until it is terminated.
pub async fn run(
    endpoint: Endpoint,
    nodes: Vec<Arc<dyn Compute>>,
) -> Result<(), Error> {
    let local: SocketAddr = endpoint.local_addr()?;
    info!(addr = %local, nodes = nodes.len(), "broker listening");
    if nodes.is_empty() {
        warn!("no compute nodes found; run requests will fail");
    }
    endpoint.serve(Arc::new(Broker::new(nodes))).await;
    Ok(())
}
