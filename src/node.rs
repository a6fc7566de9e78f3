//! Compute nodes: stateless services that advance one band of rows of a
//! grid they are handed, and the broker-side handle used to reach them.

use std::{net::SocketAddr, ops::Range, sync::Arc, thread};

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{debug, info};

use crate::{
    error::Error,
    grid::Grid,
    life,
    net::{Endpoint, Link, Request, Response, Service},
};

/// Whatever the broker fans a turn out to.
#[async_trait]
pub trait Compute: Send + Sync {
    /// Returns the next generation of `rows`, row-major.
    async fn evolve(
        &self,
        grid: &Grid,
        rows: Range<u32>,
    ) -> Result<Vec<u8>, Error>;

    /// Asks the node to stop.
    async fn shutdown(&self) -> Result<(), Error>;

    /// Drops the connection to the node, if there is one.
    fn close(&self) {}

    fn name(&self) -> String;
}

/// Serves `Evolve` and `Shutdown`. Holds no state between calls.
#[derive(Default)]
pub struct NodeService;

impl NodeService {
    /// Computes a band on the blocking pool, split into one chunk per core.
    /// The chunks all read the same shared grid.
    pub async fn evolve(
        grid: Grid,
        start_row: u32,
        end_row: u32,
    ) -> Result<Vec<u8>, Error> {
        let cores =
            thread::available_parallelism().map_or(1, |n| n.get()) as u32;
        let rows = end_row.saturating_sub(start_row);
        let chunks = life::partition(rows, cores.min(rows.max(1)));
        let grid = Arc::new(grid);
        let tasks = chunks.into_iter().map(|chunk| {
            let grid = grid.clone();
            tokio::task::spawn_blocking(move || {
                life::next_row_range(
                    &grid,
                    start_row + chunk.start,
                    start_row + chunk.end,
                )
            })
        });
        let bands = try_join_all(tasks).await?;
        Ok(bands.concat())
    }
}

#[async_trait]
impl Service for NodeService {
    async fn handle(&self, request: Request) -> Result<Response, Error> {
        match request {
            Request::Evolve {
                grid,
                start_row,
                end_row,
            } => {
                grid.validate()?;
                if start_row > end_row || end_row > grid.height() {
                    return Ok(Response::Failed(format!(
                        "rows {start_row}..{end_row} are outside a grid of \
                         height {}",
                        grid.height()
                    )));
                }
                debug!(start_row, end_row, "evolving band");
                let rows = Self::evolve(grid, start_row, end_row).await?;
                Ok(Response::Rows(rows))
            }
            Request::Shutdown => {
                info!("shutdown requested");
                Ok(Response::Ack)
            }
            other => Ok(Response::Failed(format!(
                "compute nodes do not serve {}",
                other.name()
            ))),
        }
    }
}

/// Serves a compute node on `socket_addr` until it is told to shut down.
pub async fn run(socket_addr: SocketAddr) -> Result<(), Error> {
    let endpoint = Endpoint::server(socket_addr)?;
    info!(addr = %endpoint.local_addr()?, "compute node listening");
    endpoint.serve(Arc::new(NodeService)).await;
    Ok(())
}

/// The broker's handle on a remote compute node.
#[derive(Clone)]
pub struct NodeClient {
    link: Link,
}

impl NodeClient {
    pub fn new(link: Link) -> Self {
        Self { link }
    }
}

#[async_trait]
impl Compute for NodeClient {
    async fn evolve(
        &self,
        grid: &Grid,
        rows: Range<u32>,
    ) -> Result<Vec<u8>, Error> {
        let request = Request::Evolve {
            grid: grid.clone(),
            start_row: rows.start,
            end_row: rows.end,
        };
        match self.link.call(&request).await? {
            Response::Rows(rows) => Ok(rows),
            _ => Err(Error::UnexpectedResponse("Evolve")),
        }
    }

    async fn shutdown(&self) -> Result<(), Error> {
        match self.link.call(&Request::Shutdown).await? {
            Response::Ack => Ok(()),
            _ => Err(Error::UnexpectedResponse("Shutdown")),
        }
    }

    fn close(&self) {
        self.link.close(b"broker terminated");
    }

    fn name(&self) -> String {
        self.link.remote_addr().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{Cell, ALIVE};

    #[tokio::test]
    async fn chunked_band_matches_single_pass() {
        let mut rng = rand::thread_rng();
        let grid = Grid::random(37, 29, 0.3, &mut rng);
        let band = NodeService::evolve(grid.clone(), 3, 27).await.unwrap();
        assert_eq!(band, life::next_row_range(&grid, 3, 27));
    }

    #[tokio::test]
    async fn empty_band_is_empty() {
        let grid = Grid::with_alive(4, 4, &[Cell::new(1, 1)]);
        assert!(NodeService::evolve(grid, 2, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_rows_outside_the_grid() {
        let request = Request::Evolve {
            grid: Grid::new(4, 4),
            start_row: 2,
            end_row: 9,
        };
        let response = NodeService.handle(request).await.unwrap();
        assert!(matches!(response, Response::Failed(_)));
    }

    #[tokio::test]
    async fn rejects_a_grid_shorter_than_its_shape() {
        let request = Request::Evolve {
            grid: Grid::unchecked(4, 4, vec![ALIVE; 5]),
            start_row: 0,
            end_row: 4,
        };
        assert!(matches!(
            NodeService.handle(request).await,
            Err(Error::GridShape { len: 5, .. })
        ));
    }

    #[tokio::test]
    async fn refuses_broker_operations() {
        let response = NodeService.handle(Request::Pause).await.unwrap();
        assert!(matches!(
            response,
            Response::Failed(reason) if reason.contains("Pause")
        ));
    }
}
