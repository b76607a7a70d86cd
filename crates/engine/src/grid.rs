use serde::{Deserialize, Serialize};

pub const GRID_COLS: usize = 40;
pub const GRID_ROWS: usize = 30;
pub const GRID_CELLS: usize = GRID_COLS * GRID_ROWS;

/// Flat index of `(row, col)`, or `None` when the cell lies outside the grid.
pub fn cell_index(row: i32, col: i32) -> Option<usize> {
    let row = usize::try_from(row).ok()?;
    let col = usize::try_from(col).ok()?;
    if row >= GRID_ROWS || col >= GRID_COLS {
        return None;
    }
    Some(row * GRID_COLS + col)
}

pub fn cell_coords(index: usize) -> (usize, usize) {
    (index / GRID_COLS, index % GRID_COLS)
}

/// Boolean occupancy bitmap over the whole grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Occupancy {
    cells: Vec<bool>,
}

impl Default for Occupancy {
    fn default() -> Self {
        Self::new()
    }
}

impl Occupancy {
    pub fn new() -> Self {
        Self {
            cells: vec![false; GRID_CELLS],
        }
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.cells.get(index).copied().unwrap_or(false)
    }

    pub fn set(&mut self, index: usize) {
        if let Some(cell) = self.cells.get_mut(index) {
            *cell = true;
        }
    }

    pub fn unset(&mut self, index: usize) {
        if let Some(cell) = self.cells.get_mut(index) {
            *cell = false;
        }
    }

    pub fn reset(&mut self) {
        self.cells.fill(false);
    }

    pub fn count(&self) -> usize {
        self.cells.iter().filter(|c| **c).count()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.cells
    }

    /// Indices of every occupied cell, ascending.
    pub fn occupied(&self) -> impl Iterator<Item = usize> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.then_some(i))
    }
}
