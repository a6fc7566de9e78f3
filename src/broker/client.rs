use std::net::SocketAddr;

use crate::{
    error::Error,
    grid::{Cell, FlipEvent, Grid},
    net::{Endpoint, Link, Request, Response},
};

/// What a broker reports about a checkpointed session.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumableState {
    pub resumable: bool,
    pub grid: Grid,
    pub turn: u32,
}

/// A typed handle on a remote broker. Clones share one link, and calls made
/// through different clones run concurrently.
#[derive(Clone)]
pub struct BrokerClient {
    link: Link,
}

impl BrokerClient {
    pub fn new(link: Link) -> Self {
        Self { link }
    }

    /// Dials the broker at `addr` from `endpoint`.
    pub async fn connect(
        endpoint: &Endpoint,
        addr: SocketAddr,
    ) -> Result<Self, Error> {
        Ok(Self::new(endpoint.connect(addr).await?))
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub async fn advance_run(
        &self,
        grid: Grid,
        turns: u32,
        threads: u32,
    ) -> Result<(Grid, u32), Error> {
        let request = Request::AdvanceRun {
            grid,
            turns,
            threads,
        };
        match self.link.call(&request).await? {
            Response::World { grid, turn } => Ok((grid, turn)),
            _ => Err(Error::UnexpectedResponse("AdvanceRun")),
        }
    }

    pub async fn list_alive_cells(&self) -> Result<Vec<Cell>, Error> {
        match self.link.call(&Request::ListAliveCells).await? {
            Response::AliveCells(cells) => Ok(cells),
            _ => Err(Error::UnexpectedResponse("ListAliveCells")),
        }
    }

    /// Returns the number of live cells and the turn they belong to.
    pub async fn count_alive_cells(&self) -> Result<(u32, u32), Error> {
        match self.link.call(&Request::CountAliveCells).await? {
            Response::AliveCount { count, turn } => Ok((count, turn)),
            _ => Err(Error::UnexpectedResponse("CountAliveCells")),
        }
    }

    pub async fn world_snapshot(&self) -> Result<(Grid, u32), Error> {
        match self.link.call(&Request::GetWorldSnapshot).await? {
            Response::World { grid, turn } => Ok((grid, turn)),
            _ => Err(Error::UnexpectedResponse("GetWorldSnapshot")),
        }
    }

    pub async fn pause(&self) -> Result<(), Error> {
        self.ack(Request::Pause).await
    }

    pub async fn resume(&self) -> Result<(), Error> {
        self.ack(Request::Resume).await
    }

    pub async fn checkpoint(&self) -> Result<(), Error> {
        self.ack(Request::Checkpoint).await
    }

    pub async fn terminate(&self) -> Result<(), Error> {
        self.ack(Request::Terminate).await
    }

    /// Returns and clears the broker's turn-completed edge.
    pub async fn turn_completion_flag(&self) -> Result<(bool, u32), Error> {
        match self.link.call(&Request::GetTurnCompletionFlag).await? {
            Response::TurnCompletion { completed, turn } => {
                Ok((completed, turn))
            }
            _ => Err(Error::UnexpectedResponse("GetTurnCompletionFlag")),
        }
    }

    pub async fn resumable_state(&self) -> Result<ResumableState, Error> {
        match self.link.call(&Request::GetResumableState).await? {
            Response::Resumable {
                resumable,
                grid,
                turn,
            } => Ok(ResumableState {
                resumable,
                grid,
                turn,
            }),
            _ => Err(Error::UnexpectedResponse("GetResumableState")),
        }
    }

    pub async fn flipped_since(&self) -> Result<Vec<FlipEvent>, Error> {
        match self.link.call(&Request::GetFlippedSince).await? {
            Response::Flipped(events) => Ok(events),
            _ => Err(Error::UnexpectedResponse("GetFlippedSince")),
        }
    }

    async fn ack(&self, request: Request) -> Result<(), Error> {
        match self.link.call(&request).await? {
            Response::Ack => Ok(()),
            _ => Err(Error::UnexpectedResponse(request.name())),
        }
    }
}
