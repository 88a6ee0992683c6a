//! Planning of the output dimensions of a reduction.
//!
//! A reduction acts on one explicit dimension of a datacube. Planning locates that dimension,
//! groups its elements, checks that the fragments can be aggregated block by block, and derives
//! the relation list of the output datacube. Nothing is written until [persist_axes] runs.

use crate::array::DimensionArray;
use crate::catalog::Catalog;
use crate::dimension_store::{DimensionStore, DimensionTable};
use crate::error::CubeError;
use crate::hierarchy::Hierarchy;
use crate::models::{CubeHasDim, Datacube, Dimension, DimensionInstance, DType, ReduceRequest};
use crate::reducer::{self, Reduction};

use tracing::debug;

/// A relation of a datacube with its instance and dimension.
#[derive(Clone, Debug, PartialEq)]
pub struct CubeDimension {
    pub relation: CubeHasDim,
    pub instance: DimensionInstance,
    pub dimension: Dimension,
}

/// Reads the relations of a datacube with their instances and dimensions.
pub fn load_dimensions(
    catalog: &dyn Catalog,
    datacube_id: u64,
) -> Result<Vec<CubeDimension>, CubeError> {
    catalog
        .retrieve_cubehasdim_list(datacube_id)?
        .into_iter()
        .map(|relation| {
            let instance = catalog.retrieve_dimension_instance(relation.instance_id)?;
            let dimension = catalog.retrieve_dimension(instance.dimension_id)?;
            Ok(CubeDimension {
                relation,
                instance,
                dimension,
            })
        })
        .collect()
}

/// Returns the position in `dimensions` of the dimension to reduce.
///
/// Without a name, the innermost explicit dimension that still has elements is chosen.
pub fn select_target(dimensions: &[CubeDimension], name: Option<&str>) -> Result<usize, CubeError> {
    let sized_explicit = |d: &CubeDimension| d.relation.explicit && d.relation.size > 0;
    match name {
        Some(name) => {
            let position = dimensions
                .iter()
                .position(|d| d.dimension.name == name)
                .ok_or_else(|| CubeError::DimensionNotFound {
                    name: name.to_string(),
                })?;
            let target = &dimensions[position];
            if !target.relation.explicit {
                return Err(CubeError::DimensionNotReducible {
                    name: name.to_string(),
                    reason: "dimension is implicit".to_string(),
                });
            }
            if target.relation.size == 0 {
                return Err(CubeError::DimensionNotReducible {
                    name: name.to_string(),
                    reason: "dimension is already collapsed".to_string(),
                });
            }
            Ok(position)
        }
        None => dimensions
            .iter()
            .enumerate()
            .filter(|(_, d)| sized_explicit(d))
            .max_by_key(|(_, d)| d.relation.level)
            .map(|(position, _)| position)
            .ok_or_else(|| CubeError::DimensionNotReducible {
                name: String::new(),
                reason: "datacube has no explicit dimension left".to_string(),
            }),
    }
}

/// Returns the number of rows nested inside each element of the explicit dimension `target`.
///
/// Rows are keyed row-major with level 1 outermost, so this is the product of the sizes of the
/// explicit dimensions at a higher level.
pub fn block_size(dimensions: &[CubeDimension], target: usize) -> u64 {
    let level = dimensions[target].relation.level;
    dimensions
        .iter()
        .filter(|d| d.relation.explicit && d.relation.size > 0 && d.relation.level > level)
        .map(|d| d.relation.size)
        .product()
}

/// Checks that every fragment holds whole input and output slabs.
pub fn check_divisible(
    tuplexfragment: u64,
    old_size: u64,
    new_size: u64,
    block_size: u64,
) -> Result<(), CubeError> {
    for divisor in [old_size * block_size, new_size.max(1) * block_size] {
        if divisor == 0 || tuplexfragment % divisor != 0 {
            return Err(CubeError::NotDivisible {
                tuplexfragment,
                divisor,
            });
        }
    }
    Ok(())
}

/// One axis of the output datacube.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedAxis {
    pub dimension: Dimension,
    /// Instance of the input datacube
    pub source: DimensionInstance,
    pub explicit: bool,
    pub level: u32,
    pub size: u64,
    pub concept_level: char,
    pub reduced: bool,
}

/// Output of the planning phase.
#[derive(Clone, Debug, PartialEq)]
pub struct ReductionPlan {
    pub axes: Vec<PlannedAxis>,
    /// Position of the reduced axis in `axes`
    pub target: usize,
    pub reduction: Reduction,
    pub block_size: u64,
    /// Rows per fragment of the output datacube
    pub tuplexfragment: u64,
}

impl ReductionPlan {
    pub fn reduced_axis(&self) -> &PlannedAxis {
        &self.axes[self.target]
    }
}

/// Assigns contiguous levels starting at 1 to explicit and implicit axes separately.
///
/// Collapsed axes get level 0. Relative order is preserved.
fn renumber_levels(axes: &mut [PlannedAxis]) {
    for explicit in [true, false] {
        let mut order: Vec<usize> = (0..axes.len())
            .filter(|i| axes[*i].explicit == explicit)
            .collect();
        order.sort_by_key(|i| axes[*i].level);
        let mut next = 1;
        for i in order {
            if axes[i].size == 0 {
                axes[i].level = 0;
            } else {
                axes[i].level = next;
                next += 1;
            }
        }
    }
}

/// Groups the elements of the target dimension.
fn group_target(
    store: &DimensionStore,
    datacube: &Datacube,
    target: &CubeDimension,
    hierarchy: &Hierarchy,
    request: &ReduceRequest,
) -> Result<Reduction, CubeError> {
    let old_size = target.relation.size;
    if request.is_full_collapse() {
        return Ok(Reduction::collapse(old_size));
    }
    let labels = store.read_array(
        datacube.container_id,
        DimensionTable::Label,
        target.instance.label_row_id,
        target.instance.compressed,
        target.dimension.dtype,
        old_size,
    )?;
    match (request.group_size, &target.dimension.calendar) {
        (Some(group_size), _) => {
            let indices = store.read_array(
                datacube.container_id,
                DimensionTable::Index,
                target.instance.index_row_id,
                target.instance.compressed,
                DType::Long,
                old_size,
            )?;
            reducer::reduce_by_size(&labels, &indices, group_size)
        }
        (None, Some(calendar)) if hierarchy.is_temporal() => {
            reducer::reduce_time(&labels, calendar, request.concept_level, request.midnight)
        }
        (None, _) => Err(CubeError::DimensionNotReducible {
            name: target.dimension.name.clone(),
            reason: "a group size is required for a dimension without calendar".to_string(),
        }),
    }
}

/// Plans the reduction of a datacube. Nothing is written.
#[tracing::instrument(level = "DEBUG", skip_all, fields(datacube = datacube.id))]
pub fn plan_reduction(
    store: &DimensionStore,
    datacube: &Datacube,
    dimensions: &[CubeDimension],
    hierarchy: &Hierarchy,
    request: &ReduceRequest,
) -> Result<ReductionPlan, CubeError> {
    let target = select_target(dimensions, request.dimension.as_deref())?;
    let source = &dimensions[target];
    hierarchy.check_reduction(
        source.instance.concept_level,
        request.concept_level,
        request.operation,
    )?;
    let block_size = block_size(dimensions, target);
    let old_size = source.relation.size;
    // Checking the old size first avoids reading labels of a datacube that cannot be aggregated.
    check_divisible(datacube.tuplexfragment, old_size, 1, block_size)?;

    let reduction = group_target(store, datacube, source, hierarchy, request)?;
    check_divisible(
        datacube.tuplexfragment,
        old_size,
        reduction.new_size,
        block_size,
    )?;

    let mut axes: Vec<PlannedAxis> = dimensions
        .iter()
        .enumerate()
        .map(|(i, d)| PlannedAxis {
            dimension: d.dimension.clone(),
            source: d.instance.clone(),
            explicit: d.relation.explicit,
            level: d.relation.level,
            size: if i == target {
                reduction.new_size
            } else {
                d.relation.size
            },
            concept_level: if i == target {
                request.concept_level
            } else {
                d.instance.concept_level
            },
            reduced: i == target,
        })
        .collect();
    renumber_levels(&mut axes);

    let tuplexfragment = datacube.tuplexfragment / old_size * reduction.new_size.max(1);
    debug!(
        dimension = %source.dimension.name,
        old_size,
        new_size = reduction.new_size,
        block_size,
        tuplexfragment,
        "planned reduction"
    );
    Ok(ReductionPlan {
        axes,
        target,
        reduction,
        block_size,
        tuplexfragment,
    })
}

/// A dimension row written while persisting, removed on rollback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreatedRow {
    pub container_id: u64,
    pub table: DimensionTable,
    pub id: u64,
}

/// Everything [persist_axes] wrote, in write order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Created {
    pub rows: Vec<CreatedRow>,
    pub instances: Vec<u64>,
}

impl Created {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.instances.is_empty()
    }
}

/// Writes the dimension rows, instances and relations of the output datacube.
///
/// `bound` holds, for each axis, the grid instance it reuses; `grid_id` is attached to the new
/// instances. Every dimension row and instance written is pushed to `created` before the next
/// step runs, so a failure leaves `created` complete.
#[allow(clippy::too_many_arguments)]
pub fn persist_axes(
    catalog: &dyn Catalog,
    store: &DimensionStore,
    datacube: &Datacube,
    output_id: u64,
    plan: &ReductionPlan,
    bound: &[Option<u64>],
    grid_id: Option<u64>,
    created: &mut Created,
) -> Result<(), CubeError> {
    let container_id = datacube.container_id;
    for (i, axis) in plan.axes.iter().enumerate() {
        let instance_id = match bound.get(i).copied().flatten() {
            Some(instance_id) => instance_id,
            None => {
                let mut instance = DimensionInstance {
                    id: 0,
                    size: axis.size,
                    concept_level: axis.concept_level,
                    grid_id,
                    ..axis.source.clone()
                };
                // Rows of a kept axis are shared with the source instance, with its compression.
                if axis.reduced {
                    instance.compressed = datacube.compressed;
                    let indices = DimensionArray::positions(axis.size);
                    instance.index_row_id = store.insert_array(
                        container_id,
                        DimensionTable::Index,
                        &indices,
                        datacube.compressed,
                    )?;
                    created.rows.push(CreatedRow {
                        container_id,
                        table: DimensionTable::Index,
                        id: instance.index_row_id,
                    });
                    if let Some(labels) = &plan.reduction.labels {
                        instance.label_row_id = store.insert_array(
                            container_id,
                            DimensionTable::Label,
                            labels,
                            datacube.compressed,
                        )?;
                        created.rows.push(CreatedRow {
                            container_id,
                            table: DimensionTable::Label,
                            id: instance.label_row_id,
                        });
                    }
                }
                let instance_id = catalog.insert_dimension_instance(&instance)?;
                created.instances.push(instance_id);
                instance_id
            }
        };
        catalog.insert_cubehasdim(&CubeHasDim {
            datacube_id: output_id,
            instance_id,
            explicit: axis.explicit,
            level: axis.level,
            size: axis.size,
        })?;
    }
    Ok(())
}
