use serde::{Deserialize, Serialize};

/// A cell offset within a footprint. Offsets are 1-indexed from the logical top-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(i32, i32)", into = "(i32, i32)")]
pub struct Offset {
    pub col: i32,
    pub row: i32,
}

impl Offset {
    pub const fn new(col: i32, row: i32) -> Self {
        Self { col, row }
    }
}

impl From<(i32, i32)> for Offset {
    fn from((col, row): (i32, i32)) -> Self {
        Self { col, row }
    }
}

impl From<Offset> for (i32, i32) {
    fn from(o: Offset) -> Self {
        (o.col, o.row)
    }
}

/// Polyomino footprint, serialized as `[[col, row], ...]`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape(pub Vec<Offset>);

impl Shape {
    pub fn new(cells: impl IntoIterator<Item = (i32, i32)>) -> Self {
        Self(cells.into_iter().map(Offset::from).collect())
    }

    /// Full `w x h` rectangle, row-major.
    pub fn rect(w: u32, h: u32) -> Self {
        let (w, h) = (w as i32, h as i32);
        let mut cells = Vec::with_capacity((w * h).max(0) as usize);
        for row in 1..=h {
            for col in 1..=w {
                cells.push(Offset::new(col, row));
            }
        }
        Self(cells)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn cells(&self) -> &[Offset] {
        &self.0
    }

    /// Bounding `(width, height)` measured from the origin, i.e. the largest column and
    /// row offsets. An empty shape has no extent.
    pub fn extent(&self) -> (i32, i32) {
        let w = self.0.iter().map(|o| o.col).max().unwrap_or(0).max(0);
        let h = self.0.iter().map(|o| o.row).max().unwrap_or(0).max(0);
        (w, h)
    }

    /// Translate so the smallest column and row offsets are both 1. Duplicate cells
    /// are dropped; order of first appearance is kept.
    pub fn normalized(&self) -> Self {
        let Some(min_col) = self.0.iter().map(|o| o.col).min() else {
            return self.clone();
        };
        let min_row = self.0.iter().map(|o| o.row).min().unwrap_or(1);
        let mut out: Vec<Offset> = Vec::with_capacity(self.0.len());
        for o in &self.0 {
            let moved = Offset::new(o.col - min_col + 1, o.row - min_row + 1);
            if !out.contains(&moved) {
                out.push(moved);
            }
        }
        Self(out)
    }
}

/// Quarter turns clockwise, always in `0..=3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub struct Rotation(u8);

impl Rotation {
    pub const NONE: Self = Self(0);

    pub fn from_turns(turns: u32) -> Self {
        Self((turns % 4) as u8)
    }

    pub fn turns(self) -> u8 {
        self.0
    }

    pub fn next(self) -> Self {
        Self((self.0 + 1) % 4)
    }
}

impl From<u8> for Rotation {
    fn from(turns: u8) -> Self {
        Self::from_turns(u32::from(turns))
    }
}

impl From<Rotation> for u8 {
    fn from(r: Rotation) -> Self {
        r.0
    }
}

/// Rotate `shape` clockwise by `turns` quarter turns.
///
/// Each quarter turn maps `(c, r)` to `(H - r + 1, c)` where `H` is the current largest
/// row offset, which pivots the shape inside its bounding box and keeps it 1-indexed.
pub fn rotate(shape: &Shape, turns: u32) -> Shape {
    let turns = turns % 4;
    if turns == 0 || shape.is_empty() {
        return shape.clone();
    }
    let mut cells = shape.0.clone();
    for _ in 0..turns {
        let height = cells.iter().map(|o| o.row).max().unwrap_or(0).max(0);
        for o in cells.iter_mut() {
            *o = Offset::new(height - o.row + 1, o.col);
        }
    }
    Shape(cells)
}
