//! Grid occupancy and placement engine for the building planner.
//!
//! The grid is a fixed 40x30 field. [`Planner`] owns the placed buildings and the
//! occupancy bitmap; the catalog, shape rotation and occupancy helpers feed it, and
//! [`LayoutDb`] mirrors the layout to a local SQLite file.

pub mod catalog;
pub mod grid;
pub mod ids;
pub mod placement;
pub mod shape;
pub mod storage;

pub use basegrid_protocol::{LayoutRecord, Rejection, Verdict};
pub use catalog::{Catalog, CatalogError, Cost, Definition, Footprint};
pub use grid::{cell_coords, cell_index, Occupancy, GRID_CELLS, GRID_COLS, GRID_ROWS};
pub use ids::InstanceId;
pub use placement::{
    footprint_cells, occupied_cells, PlacedInstance, Planner, RestoreReport, SkippedRecord,
};
pub use shape::{rotate, Offset, Rotation, Shape};
pub use storage::LayoutDb;
