// golnet runs Conway's Game of Life across a set of stateless compute nodes
// steered by a single coordinator (the broker). A run driver on the client
// side seeds the grid, submits the run, and keeps a live view in sync by
// polling the broker for cell flips while the run is in progress.
//
// Every remote operation travels over QUIC. Each call gets its own
// bidirectional stream on a long-lived connection, so the blocking run
// request, the live-view poller and interactive commands never queue
// behind one another.

pub mod broker;
pub mod driver;
pub mod error;
pub mod grid;
pub mod life;
pub mod net;
pub mod node;

pub use error::Error;
pub use grid::{Cell, FlipEvent, Grid};
