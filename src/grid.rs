//! Binding of output dimensions to a shared grid.
//!
//! A grid that does not exist yet is created from the output datacube's instances. An existing
//! grid is only reused when every output axis matches one of its instances exactly: dimension
//! name and type, size, concept level and stored labels.

use crate::catalog::Catalog;
use crate::dimension_store::{DimensionStore, DimensionTable};
use crate::error::CubeError;
use crate::models::{Datacube, DimensionInstance, Grid};
use crate::relation::{PlannedAxis, ReductionPlan};

use tracing::debug;

/// How the output dimensions relate to the requested grid.
#[derive(Clone, Debug, PartialEq)]
pub enum GridBinding {
    /// No grid was requested
    Unbound,
    /// The grid does not exist and is created with the output instances
    Create { name: String },
    /// Every axis reuses the grid instance at the same position
    Bind { grid: Grid, instance_ids: Vec<u64> },
}

impl GridBinding {
    /// Returns, for each of `axes` axes, the grid instance it reuses.
    pub fn bound_instances(&self, axes: usize) -> Vec<Option<u64>> {
        match self {
            Self::Bind { instance_ids, .. } => instance_ids.iter().copied().map(Some).collect(),
            _ => vec![None; axes],
        }
    }
}

fn mismatch(grid: &str, reason: String) -> CubeError {
    CubeError::GridMismatch {
        grid: grid.to_string(),
        reason,
    }
}

/// Returns the labels an output axis will hold, as raw bytes.
fn candidate_labels(
    store: &DimensionStore,
    datacube: &Datacube,
    plan: &ReductionPlan,
    axis: &PlannedAxis,
) -> Result<Vec<u8>, CubeError> {
    if axis.reduced {
        return Ok(plan
            .reduction
            .labels
            .as_ref()
            .map(|labels| labels.to_bytes())
            .unwrap_or_default());
    }
    Ok(store
        .read(
            datacube.container_id,
            DimensionTable::Label,
            axis.source.label_row_id,
            axis.source.compressed,
        )?
        .to_vec())
}

/// Checks one output axis against a grid instance.
fn check_axis(
    catalog: &dyn Catalog,
    store: &DimensionStore,
    datacube: &Datacube,
    plan: &ReductionPlan,
    axis: &PlannedAxis,
    grid: &Grid,
    instance: &DimensionInstance,
) -> Result<(), CubeError> {
    let name = &axis.dimension.name;
    let dimension = catalog.retrieve_dimension(instance.dimension_id)?;
    if dimension.dtype != axis.dimension.dtype {
        return Err(mismatch(&grid.name, format!("type of {} differs", name)));
    }
    if instance.size != axis.size {
        return Err(mismatch(&grid.name, format!("size of {} differs", name)));
    }
    if instance.concept_level != axis.concept_level {
        return Err(mismatch(
            &grid.name,
            format!("concept level of {} differs", name),
        ));
    }
    // A collapsed axis has no labels left to compare.
    if axis.size == 0 {
        return Ok(());
    }
    let labels = candidate_labels(store, datacube, plan, axis)?;
    let same = store.compare(
        datacube.container_id,
        DimensionTable::Label,
        axis.dimension.dtype,
        axis.size,
        &labels,
        instance.label_row_id,
        instance.compressed,
    )?;
    if !same {
        return Err(mismatch(&grid.name, format!("labels of {} differ", name)));
    }
    Ok(())
}

/// Decides how the output of `plan` binds to grid `name`. Nothing is written.
#[tracing::instrument(level = "DEBUG", skip(catalog, store, datacube, plan))]
pub fn check_grid(
    catalog: &dyn Catalog,
    store: &DimensionStore,
    datacube: &Datacube,
    plan: &ReductionPlan,
    name: Option<&str>,
) -> Result<GridBinding, CubeError> {
    let name = match name {
        Some(name) => name,
        None => return Ok(GridBinding::Unbound),
    };
    let grid = match catalog.retrieve_grid(datacube.container_id, name)? {
        Some(grid) => grid,
        None => {
            return Ok(GridBinding::Create {
                name: name.to_string(),
            })
        }
    };
    if grid.instance_ids.len() != plan.axes.len() {
        return Err(mismatch(
            name,
            format!(
                "grid has {} dimensions, datacube has {}",
                grid.instance_ids.len(),
                plan.axes.len()
            ),
        ));
    }
    let mut candidates = vec![];
    for id in &grid.instance_ids {
        let instance = catalog.retrieve_dimension_instance(*id)?;
        let dimension = catalog.retrieve_dimension(instance.dimension_id)?;
        candidates.push((dimension.name, instance));
    }
    let mut instance_ids = vec![];
    for axis in &plan.axes {
        let (_, instance) = candidates
            .iter()
            .find(|(dimension, _)| *dimension == axis.dimension.name)
            .ok_or_else(|| {
                mismatch(
                    name,
                    format!("dimension {} is not part of the grid", axis.dimension.name),
                )
            })?;
        check_axis(catalog, store, datacube, plan, axis, &grid, instance)?;
        instance_ids.push(instance.id);
    }
    debug!(grid = %name, "output bound to existing grid");
    Ok(GridBinding::Bind { grid, instance_ids })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::hierarchy;
    use crate::models::{BlockOperation, DType, Dimension, MidnightPolicy, ReduceRequest};
    use crate::relation::{self, persist_axes, Created};
    use crate::synthetic::{self, SyntheticConfig};

    struct Fixture {
        catalog: MemoryCatalog,
        store: DimensionStore,
        datacube: Datacube,
    }

    fn fixture() -> Fixture {
        let catalog = MemoryCatalog::new();
        let store = DimensionStore::temporary().unwrap();
        let seeded = synthetic::seed(&catalog, &store, &SyntheticConfig::default()).unwrap();
        let datacube = catalog.retrieve_datacube(seeded.datacube_id).unwrap();
        Fixture {
            catalog,
            store,
            datacube,
        }
    }

    fn plan(fixture: &Fixture, level: char) -> ReductionPlan {
        let request = ReduceRequest {
            dimension: Some("time".to_string()),
            concept_level: level,
            midnight: MidnightPolicy::FoldForward,
            ..ReduceRequest::new(fixture.datacube.id, BlockOperation::Avg)
        };
        let dimensions = relation::load_dimensions(&fixture.catalog, fixture.datacube.id).unwrap();
        let hierarchy = fixture.catalog.retrieve_hierarchy(synthetic::TIME_HIERARCHY).unwrap();
        relation::plan_reduction(
            &fixture.store,
            &fixture.datacube,
            &dimensions,
            &hierarchy,
            &request,
        )
        .unwrap()
    }

    /// Persists `plan` for an output of `datacube` into a new grid called `name`.
    fn create_grid_from(
        fixture: &Fixture,
        datacube: &Datacube,
        plan: &ReductionPlan,
        name: &str,
    ) {
        let grid_id = fixture
            .catalog
            .insert_grid(datacube.container_id, name)
            .unwrap();
        let output = fixture.catalog.insert_datacube(datacube).unwrap();
        persist_axes(
            &fixture.catalog,
            &fixture.store,
            datacube,
            output,
            plan,
            &vec![None; plan.axes.len()],
            Some(grid_id),
            &mut Created::default(),
        )
        .unwrap();
    }

    fn create_grid(fixture: &Fixture, plan: &ReductionPlan, name: &str) {
        create_grid_from(fixture, &fixture.datacube, plan, name);
    }

    /// Records a copy of the dimension of `plan`'s axis `axis` with `change` applied, and points
    /// that axis's source instance at it.
    fn swap_dimension(
        fixture: &Fixture,
        plan: &mut ReductionPlan,
        axis: &str,
        change: impl FnOnce(&mut Dimension),
    ) {
        let axis = plan
            .axes
            .iter_mut()
            .find(|a| a.dimension.name == axis)
            .unwrap();
        let mut dimension = axis.dimension.clone();
        change(&mut dimension);
        axis.source.dimension_id = fixture.catalog.insert_dimension(&dimension).unwrap();
    }

    /// Counts of the records `check_grid` must never write.
    fn counts(fixture: &Fixture) -> [usize; 4] {
        [
            fixture.catalog.datacube_count().unwrap(),
            fixture.catalog.instance_count().unwrap(),
            fixture.catalog.grid_count().unwrap(),
            fixture.catalog.relation_count().unwrap(),
        ]
    }

    #[test]
    fn no_grid() {
        let fixture = fixture();
        let plan = plan(&fixture, hierarchy::DAY);
        let binding = check_grid(
            &fixture.catalog,
            &fixture.store,
            &fixture.datacube,
            &plan,
            None,
        )
        .unwrap();
        assert_eq!(GridBinding::Unbound, binding);
        assert_eq!(vec![None, None, None], binding.bound_instances(3));
    }

    #[test]
    fn absent_grid_is_created() {
        let fixture = fixture();
        let plan = plan(&fixture, hierarchy::DAY);
        let binding = check_grid(
            &fixture.catalog,
            &fixture.store,
            &fixture.datacube,
            &plan,
            Some("daily"),
        )
        .unwrap();
        assert_eq!(
            GridBinding::Create {
                name: "daily".to_string()
            },
            binding
        );
    }

    #[test]
    fn matching_grid_is_bound() {
        let fixture = fixture();
        let plan = plan(&fixture, hierarchy::DAY);
        create_grid(&fixture, &plan, "daily");
        let binding = check_grid(
            &fixture.catalog,
            &fixture.store,
            &fixture.datacube,
            &plan,
            Some("daily"),
        )
        .unwrap();
        let grid = fixture
            .catalog
            .retrieve_grid(fixture.datacube.container_id, "daily")
            .unwrap()
            .unwrap();
        match binding {
            GridBinding::Bind { instance_ids, .. } => {
                let mut sorted = instance_ids.clone();
                sorted.sort_unstable();
                assert_eq!(grid.instance_ids, sorted);
            }
            other => panic!("unexpected binding {:?}", other),
        }
    }

    #[test]
    fn mismatching_grid_is_rejected_without_writes() {
        let fixture = fixture();
        create_grid(&fixture, &plan(&fixture, hierarchy::DAY), "g");
        let instances = fixture.catalog.instance_count().unwrap();
        let datacubes = fixture.catalog.datacube_count().unwrap();

        // Six-hourly output has a different size and concept level for time.
        let plan = plan(&fixture, hierarchy::SIX_HOURS);
        let error = check_grid(
            &fixture.catalog,
            &fixture.store,
            &fixture.datacube,
            &plan,
            Some("g"),
        )
        .unwrap_err();
        assert_eq!(
            "grid g cannot be used in this context: size of time differs",
            error.to_string()
        );
        assert_eq!(instances, fixture.catalog.instance_count().unwrap());
        assert_eq!(datacubes, fixture.catalog.datacube_count().unwrap());
    }

    #[test]
    fn mismatching_labels_rejected() {
        let fixture = fixture();
        let mut plan = plan(&fixture, hierarchy::DAY);
        create_grid(&fixture, &plan, "g");
        if let Some(labels) = plan.reduction.labels.as_mut() {
            labels.update_value(0, 1).unwrap();
        }
        let error = check_grid(
            &fixture.catalog,
            &fixture.store,
            &fixture.datacube,
            &plan,
            Some("g"),
        )
        .unwrap_err();
        assert_eq!(
            "grid g cannot be used in this context: labels of time differ",
            error.to_string()
        );
    }

    #[test]
    fn mismatching_type_rejected() {
        let fixture = fixture();
        let plan = plan(&fixture, hierarchy::DAY);
        let mut grid_plan = plan.clone();
        swap_dimension(&fixture, &mut grid_plan, "time", |d| d.dtype = DType::Float);
        create_grid(&fixture, &grid_plan, "g");
        let before = counts(&fixture);

        let error = check_grid(
            &fixture.catalog,
            &fixture.store,
            &fixture.datacube,
            &plan,
            Some("g"),
        )
        .unwrap_err();
        assert_eq!(
            "grid g cannot be used in this context: type of time differs",
            error.to_string()
        );
        assert_eq!(before, counts(&fixture));
    }

    #[test]
    fn mismatching_dimension_name_rejected() {
        let fixture = fixture();
        let plan = plan(&fixture, hierarchy::DAY);
        let mut grid_plan = plan.clone();
        swap_dimension(&fixture, &mut grid_plan, "lat", |d| d.name = "height".to_string());
        create_grid(&fixture, &grid_plan, "g");
        let before = counts(&fixture);

        let error = check_grid(
            &fixture.catalog,
            &fixture.store,
            &fixture.datacube,
            &plan,
            Some("g"),
        )
        .unwrap_err();
        assert_eq!(
            "grid g cannot be used in this context: dimension lat is not part of the grid",
            error.to_string()
        );
        assert_eq!(before, counts(&fixture));
    }

    #[test]
    fn grid_written_compressed_is_bound() {
        let fixture = fixture();
        let plan = plan(&fixture, hierarchy::DAY);
        let compressed = Datacube {
            compressed: true,
            ..fixture.datacube.clone()
        };
        create_grid_from(&fixture, &compressed, &plan, "daily");
        let grid = fixture
            .catalog
            .retrieve_grid(fixture.datacube.container_id, "daily")
            .unwrap()
            .unwrap();
        let compressed_instances = grid
            .instance_ids
            .iter()
            .filter(|id| {
                fixture
                    .catalog
                    .retrieve_dimension_instance(**id)
                    .unwrap()
                    .compressed
            })
            .count();
        // Only the reduced axis got new rows.
        assert_eq!(1, compressed_instances);

        let binding = check_grid(
            &fixture.catalog,
            &fixture.store,
            &fixture.datacube,
            &plan,
            Some("daily"),
        )
        .unwrap();
        assert!(matches!(binding, GridBinding::Bind { .. }));
    }
}
