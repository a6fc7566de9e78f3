use std::fmt;

use rand::Rng;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::Error;

/// Intensity byte of a live cell. The encoding doubles as a grayscale
/// raster sample, so a grid can be written out as an image unchanged.
pub const ALIVE: u8 = 255;
/// Intensity byte of a dead cell.
pub const DEAD: u8 = 0;

/// A cell coordinate, `0 <= x < width` and `0 <= y < height`.
#[derive(
    Archive,
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
#[archive(check_bytes)]
pub struct Cell {
    pub x: u32,
    pub y: u32,
}

impl Cell {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A cell whose state differs between two compared snapshots, stamped with
/// the turn the later snapshot belongs to.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct FlipEvent {
    pub turn: u32,
    pub cell: Cell,
}

/// A rectangular, row-major grid of cell intensities with toroidal
/// topology. An empty grid (`0x0`) stands for "not set yet".
#[derive(Archive, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[archive(check_bytes)]
pub struct Grid {
    width: u32,
    height: u32,
    cells: Vec<u8>,
}

impl Grid {
    /// Creates an all-dead grid.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cells: vec![DEAD; width as usize * height as usize],
        }
    }

    /// Wraps a row-major byte buffer, checking that it matches the shape.
    pub fn from_cells(
        width: u32,
        height: u32,
        cells: Vec<u8>,
    ) -> Result<Self, Error> {
        let grid = Self {
            width,
            height,
            cells,
        };
        grid.validate()?;
        Ok(grid)
    }

    /// Checks that the buffer holds exactly `width * height` cells. Grids
    /// decoded off the wire must pass this before anything indexes them.
    pub fn validate(&self) -> Result<(), Error> {
        if self.cells.len() != self.width as usize * self.height as usize {
            Err(Error::GridShape {
                width: self.width,
                height: self.height,
                len: self.cells.len(),
            })?
        }
        Ok(())
    }

    /// Stitches row bands back together in the order given.
    pub fn from_parts<I>(
        width: u32,
        height: u32,
        parts: I,
    ) -> Result<Self, Error>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut cells = Vec::with_capacity(width as usize * height as usize);
        for part in parts {
            cells.extend_from_slice(&part);
        }
        Self::from_cells(width, height, cells)
    }

    /// Creates a grid from live coordinates. Coordinates outside the grid
    /// are wrapped onto it.
    pub fn with_alive(width: u32, height: u32, alive: &[Cell]) -> Self {
        let mut grid = Self::new(width, height);
        for cell in alive {
            grid.set(cell.x % width, cell.y % height, ALIVE);
        }
        grid
    }

    /// Creates a grid where each cell is alive with probability `density`.
    pub fn random<R: Rng>(
        width: u32,
        height: u32,
        density: f64,
        rng: &mut R,
    ) -> Self {
        let cells = (0..width as usize * height as usize)
            .map(|_| if rng.gen_bool(density) { ALIVE } else { DEAD })
            .collect();
        Self {
            width,
            height,
            cells,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[u8] {
        &self.cells
    }

    pub fn into_cells(self) -> Vec<u8> {
        self.cells
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.cells[self.index(x, y)]
    }

    pub fn set(&mut self, x: u32, y: u32, value: u8) {
        let index = self.index(x, y);
        self.cells[index] = value;
    }

    pub fn is_alive(&self, x: u32, y: u32) -> bool {
        self.get(x, y) == ALIVE
    }

    /// Returns one row as a slice.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.width as usize;
        &self.cells[start..start + self.width as usize]
    }

    /// Coordinates of every live cell in row-major order.
    pub fn alive_cells(&self) -> Vec<Cell> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, value)| **value == ALIVE)
            .map(|(i, _)| self.cell_at(i))
            .collect()
    }

    pub fn alive_count(&self) -> usize {
        self.cells.iter().filter(|&&value| value == ALIVE).count()
    }

    /// Cells whose value differs between `self` and `other`, row-major.
    /// Nothing is reported when either grid is unset or the shapes differ.
    pub fn flipped_cells(&self, other: &Grid) -> Vec<Cell> {
        if self.is_empty()
            || other.is_empty()
            || self.width != other.width
            || self.height != other.height
        {
            return Vec::new();
        }
        self.cells
            .iter()
            .zip(other.cells.iter())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| self.cell_at(i))
            .collect()
    }

    /// Content digest, used to tell snapshots apart in logs.
    pub fn digest(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.width.to_le_bytes());
        hasher.update(&self.height.to_le_bytes());
        hasher.update(&self.cells);
        hasher.finalize()
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    fn cell_at(&self, index: usize) -> Cell {
        let width = self.width as usize;
        Cell::new((index % width) as u32, (index / width) as u32)
    }
}

impl fmt::Debug for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Grid {}x{}", self.width, self.height)?;
        for y in 0..self.height {
            for &value in self.row(y) {
                f.write_str(if value == ALIVE { "#" } else { "." })?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
impl Grid {
    /// Builds a grid without the shape check, as a hostile peer could.
    pub(crate) fn unchecked(width: u32, height: u32, cells: Vec<u8>) -> Self {
        Self {
            width,
            height,
            cells,
        }
    }
}
