use std::io;

use quinn::{ReadExactError, WriteError};
use quinn_proto::{ConnectError, ConnectionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not start connecting: {0}")]
    ConnectError(#[from] ConnectError),
    #[error("connection failed: {0}")]
    ConnectionError(#[from] ConnectionError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("stream write failed: {0}")]
    WriteError(#[from] WriteError),
    #[error("stream read failed: {0}")]
    ReadExactError(#[from] ReadExactError),
    #[error("tls configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::RcgenError),
    #[error("timed out waiting for peer")]
    TimedOut(#[from] tokio::time::error::Elapsed),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("could not encode message")]
    CouldNotEncodeMessage,
    #[error("could not decode message: {0}")]
    CouldNotDecodeMessage(&'static str),
    #[error("frame of {0} bytes exceeds the frame limit")]
    MessageLengthOverflowed(u32),
    #[error("peer answered {0} with an unexpected response")]
    UnexpectedResponse(&'static str),
    #[error("remote call failed: {0}")]
    Remote(String),
    #[error("a {width}x{height} grid cannot hold {len} cells")]
    GridShape { width: u32, height: u32, len: usize },
    #[error("a run needs at least one thread")]
    InvalidThreads,
    #[error("no compute nodes are registered with the broker")]
    NoComputeNodes,
    #[error("cannot {action} a run that is {state:?}")]
    RunState {
        action: &'static str,
        state: crate::broker::RunState,
    },
    #[error("the io collaborator has stopped")]
    IoStopped,
    #[error("invalid image {0}: {1}")]
    Image(String, String),
}
