//! The transition rule and the row partitioning used to spread one turn
//! over many compute nodes.
//!
//! Both functions are pure. Every band of a turn must be computed from the
//! same unmodified input grid, which is why nodes receive a full copy of the
//! grid rather than a view that siblings could be writing to.

use std::ops::Range;

use crate::grid::{Grid, ALIVE, DEAD};

/// Computes the next generation for rows `start_row..end_row` and returns
/// just that band, row-major, `(end_row - start_row) * width` bytes long.
///
/// Neighbour lookups wrap around both edges. A neighbour contributes its
/// intensity divided by 255, so only fully alive cells count.
pub fn next_row_range(grid: &Grid, start_row: u32, end_row: u32) -> Vec<u8> {
    let (width, height) = (grid.width() as usize, grid.height() as usize);
    let cells = grid.cells();
    let rows = end_row.saturating_sub(start_row) as usize;
    let mut next = Vec::with_capacity(rows * width);

    for y in start_row as usize..end_row as usize {
        let up = (y + height - 1) % height;
        let down = (y + 1) % height;
        for x in 0..width {
            let left = (x + width - 1) % width;
            let right = (x + 1) % width;
            let sum = [
                (up, left),
                (up, x),
                (up, right),
                (y, left),
                (y, right),
                (down, left),
                (down, x),
                (down, right),
            ]
            .iter()
            .map(|&(ny, nx)| u32::from(cells[ny * width + nx]))
            .sum::<u32>()
                / u32::from(ALIVE);

            let alive = cells[y * width + x] == ALIVE;
            next.push(match (alive, sum) {
                (true, 2) | (true, 3) => ALIVE,
                (false, 3) => ALIVE,
                _ => DEAD,
            });
        }
    }
    next
}

/// Advances a whole grid by one generation in a single call.
pub fn step(grid: &Grid) -> Grid {
    let cells = next_row_range(grid, 0, grid.height());
    // the band covers every row, so the shape always matches
    Grid::from_cells(grid.width(), grid.height(), cells).unwrap_or_default()
}

/// Splits `0..height` into `threads` contiguous bands of near-equal size.
/// Band `i` is `i*height/threads .. (i+1)*height/threads`; when there are
/// more threads than rows some bands are empty.
pub fn partition(height: u32, threads: u32) -> Vec<Range<u32>> {
    let (height, threads) = (u64::from(height), u64::from(threads.max(1)));
    (0..threads)
        .map(|i| {
            let start = i * height / threads;
            let end = ((i + 1) * height / threads).min(height);
            start as u32..end as u32
        })
        .collect()
}
