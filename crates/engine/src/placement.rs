//! Occupancy index, placement validation and the placement store.
//!
//! [`Planner`] is the single owner of the placed instances and of the occupancy bitmap.
//! Both are only ever changed together, by a validated [`Planner::place`], by
//! [`Planner::remove`] or by [`Planner::clear`], so a cell is set exactly when one
//! instance covers it.

use serde::{Serialize, Serializer};
use std::sync::Arc;

use basegrid_protocol::{LayoutRecord, Rejection, Verdict};

use crate::catalog::{Catalog, Definition};
use crate::grid::{cell_index, Occupancy, GRID_COLS, GRID_ROWS};
use crate::ids::InstanceId;
use crate::shape::{rotate, Rotation};

/// Grid coordinates `(row, col)` covered by `definition` anchored at `(row, col)`.
/// Nothing is clamped; coordinates may fall outside the grid.
pub fn footprint_cells(
    row: i32,
    col: i32,
    definition: &Definition,
    rotation: Rotation,
) -> Vec<(i32, i32)> {
    rotate(&definition.shape, u32::from(rotation.turns()))
        .cells()
        .iter()
        .map(|o| (row + o.row - 1, col + o.col - 1))
        .collect()
}

/// Flat indices (`row * 40 + col`) covered by `definition` anchored at `(row, col)`.
///
/// Like [`footprint_cells`] this does no bounds checking: an anchor that pushes the
/// footprint off the grid yields indices that are negative, too large, or wrapped onto
/// the next row. Check with [`Planner::can_place`] before trusting them.
pub fn occupied_cells(
    row: i32,
    col: i32,
    definition: &Definition,
    rotation: Rotation,
) -> Vec<i32> {
    footprint_cells(row, col, definition, rotation)
        .into_iter()
        .map(|(r, c)| r * GRID_COLS as i32 + c)
        .collect()
}

/// In-grid flat indices of a footprint; `None` if any cell is off the grid.
fn grid_cells(
    row: i32,
    col: i32,
    definition: &Definition,
    rotation: Rotation,
) -> Option<Vec<usize>> {
    footprint_cells(row, col, definition, rotation)
        .into_iter()
        .map(|(r, c)| cell_index(r, c))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacedInstance {
    pub id: InstanceId,
    #[serde(rename = "name", serialize_with = "serialize_definition_name")]
    pub definition: Arc<Definition>,
    pub row: i32,
    pub col: i32,
    pub rotation: Rotation,
}

fn serialize_definition_name<S: Serializer>(
    def: &Arc<Definition>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&def.name)
}

impl PlacedInstance {
    /// Cells this instance covers. Instances are only stored after validation, so
    /// every cell is inside the grid.
    pub fn cells(&self) -> Vec<usize> {
        footprint_cells(self.row, self.col, &self.definition, self.rotation)
            .into_iter()
            .filter_map(|(r, c)| cell_index(r, c))
            .collect()
    }

    pub fn record(&self) -> LayoutRecord {
        LayoutRecord {
            name: self.definition.name.clone(),
            row: self.row,
            col: self.col,
            rotation: self.rotation.turns(),
        }
    }
}

/// A persisted record that could not be placed on restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    pub record: LayoutRecord,
    pub reason: Rejection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub placed: Vec<InstanceId>,
    pub skipped: Vec<SkippedRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct Planner {
    instances: Vec<PlacedInstance>,
    occupancy: Occupancy,
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instances(&self) -> &[PlacedInstance] {
        &self.instances
    }

    pub fn occupancy(&self) -> &Occupancy {
        &self.occupancy
    }

    pub fn instance(&self, id: InstanceId) -> Option<&PlacedInstance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Number of placed instances of the definition called `name`.
    pub fn count_of(&self, name: &str) -> usize {
        self.instances
            .iter()
            .filter(|i| i.definition.name == name)
            .count()
    }

    /// Check whether `definition` may be placed at `(row, col)` with `rotation`.
    ///
    /// Checks run in order and stop at the first failure: placement limit, bounds,
    /// collisions. When `moving` names a placed instance, that instance does not count
    /// against its own limit and its current cells do not count as collisions.
    pub fn can_place(
        &self,
        row: i32,
        col: i32,
        definition: &Definition,
        rotation: Rotation,
        moving: Option<InstanceId>,
    ) -> Verdict {
        match self.check(row, col, definition, rotation, moving) {
            Ok(_) => Verdict::ALLOWED,
            Err(reason) => Verdict::rejected(reason),
        }
    }

    fn check(
        &self,
        row: i32,
        col: i32,
        definition: &Definition,
        rotation: Rotation,
        moving: Option<InstanceId>,
    ) -> Result<Vec<usize>, Rejection> {
        let moving = moving.and_then(|id| self.instance(id));

        if let Some(max) = definition.max_placeable {
            let mut count = self.count_of(&definition.name);
            if moving.is_some_and(|m| m.definition.name == definition.name) {
                count -= 1;
            }
            if count >= max as usize {
                return Err(Rejection::LimitReached);
            }
        }

        let (width, height) = rotate(&definition.shape, u32::from(rotation.turns())).extent();
        if row < 0
            || col < 0
            || col + width > GRID_COLS as i32
            || row + height > GRID_ROWS as i32
        {
            return Err(Rejection::OutOfBounds);
        }
        let cells =
            grid_cells(row, col, definition, rotation).ok_or(Rejection::OutOfBounds)?;

        let own = moving.map(PlacedInstance::cells).unwrap_or_default();
        if cells
            .iter()
            .any(|&idx| self.occupancy.is_set(idx) && !own.contains(&idx))
        {
            return Err(Rejection::Occupied);
        }
        Ok(cells)
    }

    /// Validate and commit a placement.
    ///
    /// If `moving` names a placed instance it is relocated in place (keeping its id);
    /// otherwise a new instance is created. On rejection nothing changes.
    pub fn place(
        &mut self,
        row: i32,
        col: i32,
        definition: Arc<Definition>,
        rotation: Rotation,
        moving: Option<InstanceId>,
    ) -> Result<InstanceId, Rejection> {
        let cells = match self.check(row, col, &definition, rotation, moving) {
            Ok(cells) => cells,
            Err(reason) => {
                tracing::debug!(
                    name = %definition.name,
                    row,
                    col,
                    reason = reason.as_str(),
                    "placement rejected"
                );
                return Err(reason);
            }
        };

        let existing = moving.and_then(|id| self.instances.iter().position(|i| i.id == id));
        let id = match existing {
            Some(pos) => {
                for idx in self.instances[pos].cells() {
                    self.occupancy.unset(idx);
                }
                let inst = &mut self.instances[pos];
                inst.definition = definition;
                inst.row = row;
                inst.col = col;
                inst.rotation = rotation;
                tracing::debug!(id = %inst.id, name = %inst.definition.name, row, col, "instance moved");
                inst.id
            }
            None => {
                let id = InstanceId::next();
                tracing::debug!(%id, name = %definition.name, row, col, "instance placed");
                self.instances.push(PlacedInstance {
                    id,
                    definition,
                    row,
                    col,
                    rotation,
                });
                id
            }
        };
        for idx in cells {
            self.occupancy.set(idx);
        }
        debug_assert!(self.check_consistency());
        Ok(id)
    }

    /// Remove an instance and free its cells. Unknown ids are ignored.
    pub fn remove(&mut self, id: InstanceId) -> Option<PlacedInstance> {
        let pos = self.instances.iter().position(|i| i.id == id)?;
        let inst = self.instances.remove(pos);
        for idx in inst.cells() {
            self.occupancy.unset(idx);
        }
        tracing::debug!(%id, name = %inst.definition.name, "instance removed");
        Some(inst)
    }

    pub fn clear(&mut self) {
        self.instances.clear();
        self.occupancy.reset();
    }

    /// Persisted form of the current layout, in placement order.
    pub fn records(&self) -> Vec<LayoutRecord> {
        self.instances.iter().map(PlacedInstance::record).collect()
    }

    /// Replace the layout with `records`. Names are resolved against `catalog` (unknown
    /// names get a placeholder) and every record goes through the normal validated
    /// placement, in order; records that do not fit are reported and skipped.
    pub fn restore(&mut self, records: &[LayoutRecord], catalog: &Catalog) -> RestoreReport {
        self.clear();
        let mut report = RestoreReport::default();
        for record in records {
            let definition = catalog.resolve_or_placeholder(&record.name);
            let rotation = Rotation::from(record.rotation);
            match self.place(record.row, record.col, definition, rotation, None) {
                Ok(id) => report.placed.push(id),
                Err(reason) => {
                    tracing::warn!(
                        name = %record.name,
                        row = record.row,
                        col = record.col,
                        reason = reason.as_str(),
                        "skipping saved record"
                    );
                    report.skipped.push(SkippedRecord {
                        record: record.clone(),
                        reason,
                    });
                }
            }
        }
        report
    }

    /// Recompute the bitmap from the instance list and compare: every cell must be
    /// claimed by at most one instance and set exactly when claimed.
    pub fn check_consistency(&self) -> bool {
        let mut claimed = Occupancy::new();
        for inst in &self.instances {
            for idx in inst.cells() {
                if claimed.is_set(idx) {
                    return false;
                }
                claimed.set(idx);
            }
        }
        claimed == self.occupancy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Footprint;
    use crate::grid::GRID_CELLS;
    use crate::shape::Shape;

    fn rect(name: &str, w: u32, h: u32) -> Arc<Definition> {
        Arc::new(Definition::new(name, Footprint::Rect { w, h }))
    }

    fn l_tromino() -> Arc<Definition> {
        Arc::new(Definition::new(
            "Ell",
            Footprint::Shape(Shape::new([(1, 1), (1, 2), (2, 2)])),
        ))
    }

    fn set_cells(p: &Planner) -> Vec<usize> {
        p.occupancy().occupied().collect()
    }

    const R0: Rotation = Rotation::NONE;

    #[test]
    fn occupied_cells_translate_shape_to_anchor() {
        let def = rect("Farm", 2, 2);
        assert_eq!(occupied_cells(0, 0, &def, R0), vec![0, 1, 40, 41]);
        assert_eq!(occupied_cells(1, 2, &def, R0), vec![42, 43, 82, 83]);
        // No clamping: the right edge wraps onto the next row.
        assert_eq!(occupied_cells(0, 39, &def, R0), vec![39, 40, 79, 80]);
    }

    #[test]
    fn occupied_cells_follow_rotation() {
        let bar = rect("Wall", 3, 1);
        assert_eq!(occupied_cells(0, 0, &bar, R0), vec![0, 1, 2]);
        assert_eq!(
            occupied_cells(0, 0, &bar, Rotation::from(1)),
            vec![0, 40, 80]
        );
    }

    #[test]
    fn small_then_large_collides_until_removed() {
        let mut p = Planner::new();
        let small = rect("Boulder", 1, 1);
        let big = rect("Farm", 2, 2);

        let first = p.place(0, 0, small, R0, None).unwrap();
        assert_eq!(
            p.can_place(0, 0, &big, R0, None),
            Verdict::rejected(Rejection::Occupied)
        );
        assert_eq!(p.place(0, 0, big.clone(), R0, None), Err(Rejection::Occupied));
        assert_eq!(p.len(), 1);

        assert!(p.remove(first).is_some());
        assert!(p.place(0, 0, big, R0, None).is_ok());
        assert_eq!(set_cells(&p), vec![0, 1, 40, 41]);
        assert!(p.check_consistency());
    }

    #[test]
    fn verdict_agrees_with_place() {
        let mut p = Planner::new();
        let farm = rect("Farm", 2, 2);
        assert_eq!(p.can_place(3, 3, &farm, R0, None), Verdict::ALLOWED);
        let id = p.place(3, 3, farm.clone(), R0, None).unwrap();

        let verdict = p.can_place(4, 4, &farm, R0, None);
        assert_eq!(verdict, Verdict::rejected(Rejection::Occupied));
        assert_eq!(
            p.place(4, 4, farm.clone(), R0, None).err(),
            verdict.reason
        );
        assert_eq!(p.can_place(4, 4, &farm, R0, Some(id)), Verdict::ALLOWED);
    }

    #[test]
    fn bounds_at_bottom_right_corner() {
        let p = Planner::new();
        let def = rect("Farm", 2, 2);
        assert_eq!(
            p.can_place(29, 39, &def, R0, None),
            Verdict::rejected(Rejection::OutOfBounds)
        );
        assert_eq!(p.can_place(28, 38, &def, R0, None), Verdict::ALLOWED);
        assert_eq!(
            p.can_place(-1, 0, &def, R0, None),
            Verdict::rejected(Rejection::OutOfBounds)
        );
        assert_eq!(
            p.can_place(0, -1, &def, R0, None),
            Verdict::rejected(Rejection::OutOfBounds)
        );
    }

    #[test]
    fn bounds_use_rotated_extent() {
        let p = Planner::new();
        let bar = rect("Wall", 3, 1);
        assert_eq!(p.can_place(29, 37, &bar, R0, None), Verdict::ALLOWED);
        assert_eq!(
            p.can_place(29, 37, &bar, Rotation::from(1), None),
            Verdict::rejected(Rejection::OutOfBounds)
        );
        assert_eq!(
            p.can_place(27, 39, &bar, Rotation::from(1), None),
            Verdict::ALLOWED
        );
    }

    #[test]
    fn limit_counts_everything_but_the_mover() {
        let mut p = Planner::new();
        let market = Arc::new(Definition::new("Market", Footprint::default()).with_max_placeable(1));

        let id = p.place(0, 0, market.clone(), R0, None).unwrap();
        assert_eq!(
            p.place(10, 10, market.clone(), R0, None),
            Err(Rejection::LimitReached)
        );
        assert_eq!(p.place(10, 10, market.clone(), R0, Some(id)), Ok(id));
        assert_eq!(p.len(), 1);
        assert_eq!(set_cells(&p), vec![410, 411, 450, 451]);

        // A different instance moving doesn't lift the limit.
        let farm = p.place(0, 0, rect("Farm", 2, 2), R0, None).unwrap();
        assert_eq!(
            p.can_place(20, 20, &market, R0, Some(farm)),
            Verdict::rejected(Rejection::LimitReached)
        );
    }

    #[test]
    fn limit_is_checked_before_bounds() {
        let mut p = Planner::new();
        let market = Arc::new(Definition::new("Market", Footprint::default()).with_max_placeable(1));
        p.place(0, 0, market.clone(), R0, None).unwrap();
        assert_eq!(
            p.can_place(29, 39, &market, R0, None),
            Verdict::rejected(Rejection::LimitReached)
        );
    }

    #[test]
    fn moving_onto_own_footprint_is_allowed() {
        let mut p = Planner::new();
        let def = rect("Farm", 2, 2);
        let id = p.place(5, 5, def.clone(), R0, None).unwrap();

        assert_eq!(p.can_place(5, 5, &def, R0, Some(id)), Verdict::ALLOWED);
        assert_eq!(p.can_place(5, 6, &def, R0, Some(id)), Verdict::ALLOWED);
        assert_eq!(
            p.can_place(5, 6, &def, R0, None),
            Verdict::rejected(Rejection::Occupied)
        );

        assert_eq!(p.place(5, 6, def, R0, Some(id)), Ok(id));
        assert_eq!(set_cells(&p), vec![206, 207, 246, 247]);
        assert!(p.check_consistency());
    }

    #[test]
    fn moving_exemption_is_only_for_own_cells() {
        let mut p = Planner::new();
        let def = rect("Farm", 2, 2);
        let a = p.place(0, 0, def.clone(), R0, None).unwrap();
        p.place(0, 2, def.clone(), R0, None).unwrap();
        assert_eq!(
            p.can_place(0, 1, &def, R0, Some(a)),
            Verdict::rejected(Rejection::Occupied)
        );
    }

    #[test]
    fn rotating_in_place_moves_cells() {
        let mut p = Planner::new();
        let ell = l_tromino();
        let id = p.place(5, 5, ell.clone(), R0, None).unwrap();
        // (5,5) (6,5) (6,6)
        assert_eq!(set_cells(&p), vec![205, 245, 246]);

        assert_eq!(p.place(5, 5, ell, Rotation::from(1), Some(id)), Ok(id));
        // (5,6) (5,5) (6,5)
        assert_eq!(set_cells(&p), vec![205, 206, 245]);
        assert!(!p.occupancy().is_set(246));
        assert_eq!(p.instance(id).unwrap().rotation, Rotation::from(1));
        assert!(p.check_consistency());
    }

    #[test]
    fn unknown_mover_places_new_instance() {
        let mut p = Planner::new();
        let ghost = InstanceId::from_raw(u64::MAX);
        let id = p.place(0, 0, rect("Farm", 2, 2), R0, Some(ghost)).unwrap();
        assert_ne!(id, ghost);
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn moving_with_other_definition_swaps_it() {
        let mut p = Planner::new();
        let id = p.place(0, 0, rect("Farm", 2, 2), R0, None).unwrap();
        p.place(0, 0, rect("Boulder", 1, 1), R0, Some(id)).unwrap();
        assert_eq!(p.instance(id).unwrap().definition.name, "Boulder");
        assert_eq!(set_cells(&p), vec![0]);
    }

    #[test]
    fn validation_is_repeatable() {
        let mut p = Planner::new();
        let def = rect("Farm", 2, 2);
        p.place(3, 3, def.clone(), R0, None).unwrap();
        let first = p.can_place(3, 4, &def, R0, None);
        for _ in 0..5 {
            assert_eq!(p.can_place(3, 4, &def, R0, None), first);
        }
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn remove_unknown_and_clear() {
        let mut p = Planner::new();
        p.place(0, 0, rect("Farm", 2, 2), R0, None).unwrap();
        assert!(p.remove(InstanceId::from_raw(u64::MAX)).is_none());
        assert_eq!(p.occupancy().count(), 4);
        p.clear();
        assert!(p.is_empty());
        assert_eq!(p.occupancy().count(), 0);
        assert_eq!(p.occupancy().as_slice().len(), GRID_CELLS);
    }

    #[test]
    fn restore_assigns_fresh_ids_and_skips_conflicts() {
        let catalog = Catalog::builtin().unwrap();
        let rec = |name: &str, row, col, rotation| LayoutRecord {
            name: name.to_string(),
            row,
            col,
            rotation,
        };
        let records = vec![
            rec("Market", 0, 0, 0),
            rec("Market", 4, 4, 0),
            rec("Farm", 0, 1, 0),
            rec("Moon Base", 28, 38, 5),
        ];
        let mut p = Planner::new();
        p.place(10, 10, rect("Old", 1, 1), R0, None).unwrap();

        let report = p.restore(&records, &catalog);
        assert_eq!(report.placed.len(), 2);
        assert_eq!(
            report
                .skipped
                .iter()
                .map(|s| (s.record.row, s.reason))
                .collect::<Vec<_>>(),
            vec![(4, Rejection::LimitReached), (0, Rejection::Occupied)]
        );
        assert_eq!(p.count_of("Old"), 0);
        let moon = p.instance(report.placed[1]).unwrap();
        assert_eq!(moon.definition.category, "Unknown");
        assert_eq!(moon.rotation, Rotation::from(1));
        assert!(p.check_consistency());

        let saved = p.records();
        assert_eq!(saved[0].name, "Market");
        assert_eq!(saved[1].rotation, 1);
    }

    #[test]
    fn instance_serializes_by_name() {
        let mut p = Planner::new();
        let id = p.place(2, 3, rect("Farm", 2, 2), Rotation::from(2), None).unwrap();
        let json = serde_json::to_value(p.instance(id).unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "id": id.get(), "name": "Farm", "row": 2, "col": 3, "rotation": 2 })
        );
    }
}
