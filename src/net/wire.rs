use arrayref::array_ref;
use async_compression::tokio::{bufread::ZstdDecoder, write::ZstdEncoder};
use byteorder::{ByteOrder, LittleEndian};
use chrono::Utc;
use rkyv::{from_bytes, to_bytes, AlignedVec, Archive, Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    error::Error,
    grid::{Cell, FlipEvent, Grid},
};

/// Every frame starts with `sent_at | len`, followed by `len` bytes of
/// zstd-compressed archive.
pub const HEADER_LEN: usize = 8 + 4;

/// Operations understood by brokers and compute nodes. Each request travels
/// on its own stream and is answered by exactly one [`Response`].
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum Request {
    // BROKER OPERATIONS
    /// Run the simulation until `turns` is reached or the run is stopped.
    /// The grid is only adopted when there is no checkpointed session.
    AdvanceRun { grid: Grid, turns: u32, threads: u32 },
    /// Coordinates of every live cell.
    ListAliveCells,
    /// Number of live cells and the turn they belong to.
    CountAliveCells,
    /// The current grid and turn.
    GetWorldSnapshot,
    /// Hold the run at the next turn boundary.
    Pause,
    /// Let a paused run continue.
    Resume,
    /// Freeze the run so a later `AdvanceRun` picks it up again.
    Checkpoint,
    /// Shut down every compute node, then the broker itself.
    Terminate,
    /// Whether a turn completed since the last time anyone asked.
    GetTurnCompletionFlag,
    /// Whether a checkpointed session is waiting to be resumed.
    GetResumableState,
    /// Cells that flipped since the last time anyone asked.
    GetFlippedSince,

    // COMPUTE NODE OPERATIONS
    /// Compute the next generation of rows `start_row..end_row`.
    Evolve {
        grid: Grid,
        start_row: u32,
        end_row: u32,
    },
    /// Stop the compute node.
    Shutdown,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::AdvanceRun { .. } => "AdvanceRun",
            Request::ListAliveCells => "ListAliveCells",
            Request::CountAliveCells => "CountAliveCells",
            Request::GetWorldSnapshot => "GetWorldSnapshot",
            Request::Pause => "Pause",
            Request::Resume => "Resume",
            Request::Checkpoint => "Checkpoint",
            Request::Terminate => "Terminate",
            Request::GetTurnCompletionFlag => "GetTurnCompletionFlag",
            Request::GetResumableState => "GetResumableState",
            Request::GetFlippedSince => "GetFlippedSince",
            Request::Evolve { .. } => "Evolve",
            Request::Shutdown => "Shutdown",
        }
    }

    /// Whether the serving endpoint should close once this request has been
    /// answered.
    pub fn ends_service(&self) -> bool {
        matches!(self, Request::Shutdown | Request::Terminate)
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum Response {
    /// Answer to `AdvanceRun` and `GetWorldSnapshot`.
    World { grid: Grid, turn: u32 },
    AliveCells(Vec<Cell>),
    AliveCount { count: u32, turn: u32 },
    TurnCompletion { completed: bool, turn: u32 },
    Resumable { resumable: bool, grid: Grid, turn: u32 },
    Flipped(Vec<FlipEvent>),
    /// A band of next-generation rows, row-major.
    Rows(Vec<u8>),
    Ack,
    /// The handler failed; the reason is for humans.
    Failed(String),
}

macro_rules! archived_message {
    ($message:ty, $name:literal) => {
        impl $message {
            /// Archives and compresses the message into a frame payload.
            pub async fn encode(&self) -> Result<Vec<u8>, Error> {
                let archived = to_bytes::<_, 1024>(self)
                    .map_err(|_| Error::CouldNotEncodeMessage)?;
                compress(&archived).await
            }

            /// Decompresses and validates a frame payload.
            pub async fn decode(payload: &[u8]) -> Result<Self, Error> {
                let archived = decompress(payload).await?;
                from_bytes::<Self>(&archived)
                    .map_err(|_| Error::CouldNotDecodeMessage($name))
            }
        }
    };
}

archived_message!(Request, "request");
archived_message!(Response, "response");

/// The fixed-size frame prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Microseconds since the unix epoch when the frame was written.
    pub sent_at: i64,
    /// Length of the payload that follows.
    pub len: u32,
}

impl FrameHeader {
    pub fn now(len: u32) -> Self {
        Self {
            sent_at: Utc::now().timestamp_micros(),
            len,
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        LittleEndian::write_i64(&mut buf[0..8], self.sent_at);
        LittleEndian::write_u32(&mut buf[8..], self.len);
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            sent_at: i64::from_le_bytes(*array_ref![buf, 0, 8]),
            len: LittleEndian::read_u32(&buf[8..]),
        }
    }

    /// Time between writing and reading this frame, as far as the two
    /// clocks agree.
    pub fn age_micros(&self) -> i64 {
        Utc::now().timestamp_micros() - self.sent_at
    }
}

async fn compress(bytes: &[u8]) -> Result<Vec<u8>, Error> {
    let capacity = bytes.len() / 4 + 64;
    let mut encoder = ZstdEncoder::new(Vec::with_capacity(capacity));
    encoder.write_all(bytes).await?;
    encoder.shutdown().await?;
    Ok(encoder.into_inner())
}

async fn decompress(bytes: &[u8]) -> Result<AlignedVec, Error> {
    let mut decoder = ZstdDecoder::new(bytes);
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf).await?;
    // archives must be read from an aligned buffer
    let mut archived = AlignedVec::with_capacity(buf.len());
    archived.extend_from_slice(&buf);
    Ok(archived)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn evolve_request_survives_the_wire() {
        let alive = [Cell::new(3, 4), Cell::new(63, 31)];
        let grid = Grid::with_alive(64, 32, &alive);
        let request = Request::Evolve {
            grid: grid.clone(),
            start_row: 2,
            end_row: 6,
        };
        let payload = request.encode().await.unwrap();
        // a mostly dead grid compresses well
        assert!(payload.len() < grid.cells().len());
        assert_eq!(Request::decode(&payload).await.unwrap(), request);
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        let payload = compress(&[0xffu8; 40]).await.unwrap();
        assert!(matches!(
            Response::decode(&payload).await,
            Err(Error::CouldNotDecodeMessage("response"))
        ));
        assert!(Response::decode(b"not zstd at all").await.is_err());
    }

    #[test]
    fn header_layout() {
        let header = FrameHeader {
            sent_at: 1_700_000_000_123_456,
            len: 0x0102_0304,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[8..], &[4, 3, 2, 1]);
        assert_eq!(FrameHeader::from_bytes(&bytes), header);
    }
}
