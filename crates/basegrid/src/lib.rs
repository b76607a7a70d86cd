//! Umbrella crate for the basegrid building planner.
//!
//! Re-exports the engine and protocol crates so downstream code can depend on a
//! single crate name (`basegrid`).

pub use basegrid_engine as engine;
pub use basegrid_protocol as protocol;
