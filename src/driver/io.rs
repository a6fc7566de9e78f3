//! The I/O collaborator: a task that owns the image directories and reads or
//! writes binary PGM files in the order it is asked to.

use std::path::{Path, PathBuf};

use tokio::{
    fs,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn, Instrument};

use crate::{error::Error, grid::Grid};

enum IoCommand {
    Read {
        key: String,
        reply: oneshot::Sender<Result<Grid, Error>>,
    },
    Write {
        key: String,
        grid: Grid,
    },
    Idle(oneshot::Sender<Result<(), Error>>),
}

/// A handle on the I/O task. Clones queue onto the same task.
#[derive(Clone)]
pub struct Io {
    tx: mpsc::UnboundedSender<IoCommand>,
}

impl Io {
    /// Spawns the task. Images are read from `input` and written to `output`.
    pub fn spawn(input: PathBuf, output: PathBuf) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let span = tracing::debug_span!("io", input = %input.display());
        let handle = tokio::spawn(run(input, output, rx).instrument(span));
        (Self { tx }, handle)
    }

    /// Loads `<input>/<key>.pgm`.
    pub async fn read(&self, key: &str) -> Result<Grid, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(IoCommand::Read {
            key: key.to_owned(),
            reply,
        })?;
        rx.await.map_err(|_| Error::IoStopped)?
    }

    /// Queues `grid` to be written as `<output>/<key>.pgm`. Failures are
    /// reported by the next [`Io::idle`].
    pub fn write(
        &self,
        key: impl Into<String>,
        grid: Grid,
    ) -> Result<(), Error> {
        self.send(IoCommand::Write {
            key: key.into(),
            grid,
        })
    }

    /// Resolves once every command queued before it has been carried out.
    pub async fn idle(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.send(IoCommand::Idle(reply))?;
        rx.await.map_err(|_| Error::IoStopped)?
    }

    fn send(&self, command: IoCommand) -> Result<(), Error> {
        self.tx.send(command).map_err(|_| Error::IoStopped)
    }
}

async fn run(
    input: PathBuf,
    output: PathBuf,
    mut rx: mpsc::UnboundedReceiver<IoCommand>,
) {
    let mut failed = None;
    while let Some(command) = rx.recv().await {
        match command {
            IoCommand::Read { key, reply } => {
                let path = input.join(format!("{key}.pgm"));
                let _ = reply.send(read_pgm(&path, &key).await);
            }
            IoCommand::Write { key, grid } => {
                let path = output.join(format!("{key}.pgm"));
                match write_pgm(&path, &grid).await {
                    Ok(()) => info!(
                        path = %path.display(),
                        digest = %grid.digest(),
                        "image written"
                    ),
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            "could not write image: {e}"
                        );
                        failed.get_or_insert(e);
                    }
                }
            }
            IoCommand::Idle(reply) => {
                let _ = reply.send(failed.take().map_or(Ok(()), Err));
            }
        }
    }
    debug!("io task stopped");
}

async fn read_pgm(path: &Path, key: &str) -> Result<Grid, Error> {
    let bytes = fs::read(path).await?;
    decode_pgm(&bytes).map_err(|reason| Error::Image(key.to_owned(), reason))
}

async fn write_pgm(path: &Path, grid: &Grid) -> Result<(), Error> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }
    fs::write(path, encode_pgm(grid)).await?;
    Ok(())
}

/// Binary greymap: `P5`, width, height and a max value of 255, followed by
/// one byte per cell.
pub fn encode_pgm(grid: &Grid) -> Vec<u8> {
    let header = format!("P5\n{} {}\n255\n", grid.width(), grid.height());
    let mut out = header.into_bytes();
    out.extend_from_slice(grid.cells());
    out
}

pub fn decode_pgm(bytes: &[u8]) -> Result<Grid, String> {
    let mut pos = 0;
    let mut header = [0u32; 3];
    if next_token(bytes, &mut pos) != Some(&b"P5"[..]) {
        return Err("not a binary greymap".into());
    }
    for field in header.iter_mut() {
        let token = next_token(bytes, &mut pos).ok_or("truncated header")?;
        *field = std::str::from_utf8(token)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or("malformed header")?;
    }
    let [width, height, max] = header;
    if max != 255 {
        return Err(format!("max value {max} is not 255"));
    }
    // Exactly one whitespace byte separates the header from the raster.
    let raster = bytes.get(pos + 1..).ok_or("missing raster")?;
    let len = width as usize * height as usize;
    if raster.len() < len {
        return Err(format!("raster holds {} of {len} cells", raster.len()));
    }
    Grid::from_cells(width, height, raster[..len].to_vec())
        .map_err(|e| e.to_string())
}

fn next_token<'a>(bytes: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    loop {
        while bytes.get(*pos)?.is_ascii_whitespace() {
            *pos += 1;
        }
        if bytes[*pos] != b'#' {
            break;
        }
        while *bytes.get(*pos)? != b'\n' {
            *pos += 1;
        }
    }
    let start = *pos;
    while bytes.get(*pos).map_or(false, |b| !b.is_ascii_whitespace()) {
        *pos += 1;
    }
    Some(&bytes[start..*pos])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Cell;

    fn scratch(name: &str) -> PathBuf {
        let dir = format!("golnet-{name}-{}", std::process::id());
        std::env::temp_dir().join(dir)
    }

    #[test]
    fn header_comments_are_skipped() {
        let mut bytes = b"P5\n# made by hand\n3 2\n255\n".to_vec();
        bytes.extend_from_slice(&[255, 0, 0, 0, 0, 255]);
        let grid = decode_pgm(&bytes).unwrap();
        assert_eq!(grid.alive_cells(), vec![Cell::new(0, 0), Cell::new(2, 1)]);
    }

    #[test]
    fn short_raster_is_rejected() {
        let mut bytes = b"P5 4 4 255\n".to_vec();
        bytes.extend_from_slice(&[0; 10]);
        assert!(decode_pgm(&bytes).unwrap_err().contains("10 of 16"));
        assert!(decode_pgm(b"P2 1 1 255\n0").is_err());
    }

    #[tokio::test]
    async fn writes_are_read_back_after_idle() {
        let dir = scratch("io");
        let (io, handle) = Io::spawn(dir.clone(), dir.clone());
        let grid = Grid::with_alive(5, 3, &[Cell::new(4, 0), Cell::new(1, 2)]);

        io.write("5x3", grid.clone()).unwrap();
        io.idle().await.unwrap();
        assert_eq!(io.read("5x3").await.unwrap(), grid);

        assert!(matches!(io.read("missing").await, Err(Error::Io(_))));
        drop(io);
        handle.await.unwrap();
        std::fs::remove_dir_all(dir).unwrap();
    }
}
