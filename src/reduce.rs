//! Reduction of a datacube along one dimension by a group of workers.
//!
//! Worker 0 is the decider. It validates the request, plans the output dimensions and performs
//! every catalog mutation, then broadcasts the aggregation parameters. Every worker aggregates its
//! share of the fragments and the outcomes are reduced to the worst one. If any worker failed,
//! every worker deletes the output fragments it owns and the decider deletes the output datacube
//! with its dimension rows, so the output either exists completely or not at all.

use crate::aggregation;
use crate::catalog::Catalog;
use crate::comm::{Communicator, LocalGroup, ReduceOp};
use crate::dimension_store::DimensionStore;
use crate::error::{CubeError, ErrorClass, SUCCESS};
use crate::fragment_store::FragmentStore;
use crate::grid::{self, GridBinding};
use crate::models::{Datacube, ReduceRequest};
use crate::payload::{self, AggregationHeader};
use crate::relation::{self, Created};

use bytes::Bytes;
use tracing::{info, warn};
use validator::Validate;

/// Rank of the worker performing catalog mutations.
pub const DECIDER: u64 = 0;

/// Services shared by the workers of a reduction.
#[derive(Clone, Copy)]
pub struct ReduceContext<'a> {
    pub catalog: &'a dyn Catalog,
    pub store: &'a DimensionStore,
    pub fragments: &'a dyn FragmentStore,
    /// Threads used by each worker to aggregate its fragments
    pub threads: usize,
}

/// What the decider created.
#[derive(Debug, Default)]
struct Cleanup {
    container_id: u64,
    datacube_id: Option<u64>,
    /// Grid created for this reduction; an existing grid it binds to is never recorded
    grid_id: Option<u64>,
    created: Created,
}

impl Cleanup {
    fn is_empty(&self) -> bool {
        self.datacube_id.is_none() && self.grid_id.is_none() && self.created.is_empty()
    }

    /// Deletes everything created so far. Every step is attempted.
    ///
    /// Relations go with the datacube, before the instances they refer to; instances go before
    /// the grid they belong to.
    fn run(&self, ctx: &ReduceContext) -> Result<(), CubeError> {
        let mut first_error = None;
        for row in self.created.rows.iter().rev() {
            if let Err(err) = ctx.store.delete(row.container_id, row.table, row.id) {
                warn!(table = %row.table, id = row.id, "failed to delete dimension row: {}", err);
                first_error.get_or_insert(err);
            }
        }
        if let Some(datacube_id) = self.datacube_id {
            if let Err(err) = ctx
                .catalog
                .delete_datacube_and_relations(datacube_id, self.container_id)
            {
                warn!(datacube_id, "failed to delete datacube: {}", err);
                first_error.get_or_insert(err);
            }
        }
        for instance_id in self.created.instances.iter().rev() {
            if let Err(err) = ctx.catalog.delete_dimension_instance(*instance_id) {
                warn!(instance_id, "failed to delete dimension instance: {}", err);
                first_error.get_or_insert(err);
            }
        }
        if let Some(grid_id) = self.grid_id {
            if let Err(err) = ctx.catalog.delete_grid(self.container_id, grid_id) {
                warn!(grid_id, "failed to delete grid: {}", err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Validates the request, plans the reduction and writes the output metadata.
///
/// Every check runs before the first mutation. Mutations are recorded in `cleanup` as they
/// happen.
fn decide(
    ctx: &ReduceContext,
    request: &ReduceRequest,
    cleanup: &mut Cleanup,
) -> Result<(AggregationHeader, Vec<u64>), CubeError> {
    request.validate()?;
    let input = ctx.catalog.retrieve_datacube(request.datacube_id)?;
    if let Some(missing) = &request.missing {
        missing.validate(input.measure_type)?;
    }
    let dimensions = relation::load_dimensions(ctx.catalog, input.id)?;
    let target = relation::select_target(&dimensions, request.dimension.as_deref())?;
    let hierarchy = ctx
        .catalog
        .retrieve_hierarchy(dimensions[target].dimension.hierarchy_id)?;
    let plan = relation::plan_reduction(ctx.store, &input, &dimensions, &hierarchy, request)?;
    let binding = grid::check_grid(
        ctx.catalog,
        ctx.store,
        &input,
        &plan,
        request.grid.as_deref(),
    )?;

    cleanup.container_id = input.container_id;
    let output_id = ctx.catalog.insert_datacube(&Datacube {
        id: 0,
        measure_type: request.operation.output_type(input.measure_type),
        level: input.level + 1,
        source_id: Some(input.id),
        description: request.description.clone(),
        ..input.clone()
    })?;
    cleanup.datacube_id = Some(output_id);

    let grid_id = match &binding {
        GridBinding::Unbound => None,
        GridBinding::Create { name } => {
            let grid_id = ctx.catalog.insert_grid(input.container_id, name)?;
            cleanup.grid_id = Some(grid_id);
            Some(grid_id)
        }
        GridBinding::Bind { grid, .. } => Some(grid.id),
    };
    relation::persist_axes(
        ctx.catalog,
        ctx.store,
        &input,
        output_id,
        &plan,
        &binding.bound_instances(plan.axes.len()),
        grid_id,
        &mut cleanup.created,
    )?;
    ctx.catalog
        .update_tuplexfragment(output_id, plan.tuplexfragment)?;

    let header = AggregationHeader {
        code: SUCCESS,
        container_id: input.container_id,
        input_datacube_id: input.id,
        output_datacube_id: output_id,
        frag_ids: input.frag_ids.clone(),
        compressed: input.compressed,
        operation: request.operation,
        measure_type: input.measure_type,
        missing: request.missing.clone(),
        explicit_axis_size: plan.reduced_axis().size,
        group_count_len: plan.reduction.group_counts.len() as u64,
        block_size: plan.block_size,
        array_length: input.array_length,
        input_tuplexfragment: input.tuplexfragment,
        output_tuplexfragment: plan.tuplexfragment,
    };
    Ok((header, plan.reduction.group_counts))
}

/// Returns the header the decider broadcasts for `decided`.
fn announcement(decided: &Result<(AggregationHeader, Vec<u64>), CubeError>) -> Option<Bytes> {
    let encoded = match decided {
        Ok((header, _)) => header.encode(),
        Err(err) => AggregationHeader::failed(err.code()).encode(),
    };
    encoded
        .or_else(|err| AggregationHeader::failed(err.code()).encode())
        .ok()
}

/// Runs the part of a reduction owned by one worker and returns the output datacube id.
///
/// Only the decider reads `request`. Every worker must call this function, even one with no
/// fragment to aggregate, because it takes part in the collectives.
#[tracing::instrument(level = "INFO", skip_all, fields(rank = comm.rank()))]
pub fn run_worker(
    ctx: &ReduceContext,
    comm: &dyn Communicator,
    request: &ReduceRequest,
) -> Result<u64, CubeError> {
    let rank = comm.rank();
    let workers = comm.size();
    let mut cleanup = Cleanup::default();

    let decided = (rank == DECIDER).then(|| {
        info!(datacube = request.datacube_id, operation = %request.operation, "reducing datacube");
        decide(ctx, request, &mut cleanup)
    });
    let header = AggregationHeader::decode(
        comm.broadcast(DECIDER, decided.as_ref().and_then(announcement))?,
    )?;
    if !header.is_success() {
        if let Some(Err(err)) = &decided {
            err.log();
        }
        if !cleanup.is_empty() {
            if let Err(rollback) = cleanup.run(ctx) {
                rollback.log();
            }
        }
        return match decided {
            Some(Err(err)) => Err(err),
            _ => Err(CubeError::Aborted { code: header.code }),
        };
    }
    let counts = match &decided {
        Some(Ok((_, counts))) => Some(payload::encode_group_counts(counts)),
        _ => None,
    };
    // From here on a local failure goes through the outcome reduction, so that the peers
    // are not left waiting and the decider rolls back.
    let aggregated = comm
        .broadcast(DECIDER, counts)
        .and_then(|data| payload::decode_group_counts(data, header.group_count_len))
        .and_then(|counts| {
            aggregation::aggregate_fragments(
                ctx.catalog,
                ctx.fragments,
                &header,
                &header.block_task(counts),
                rank,
                workers,
                ctx.threads,
            )
        });
    let code = match &aggregated {
        Ok(_) => SUCCESS,
        Err(err) => {
            err.log();
            err.code()
        }
    };
    let worst = comm.all_reduce(i64::from(code), ReduceOp::Min)?;
    if worst == i64::from(SUCCESS) {
        if rank == DECIDER {
            info!(
                datacube = header.output_datacube_id,
                "reduction committed"
            );
        }
        return Ok(header.output_datacube_id);
    }

    let mut rolled_back =
        aggregation::delete_output_fragments(ctx.catalog, ctx.fragments, &header, rank, workers);
    if rank == DECIDER && !cleanup.is_empty() {
        rolled_back = rolled_back.and(cleanup.run(ctx));
    }
    let incomplete = match &rolled_back {
        Ok(()) => 0,
        Err(err) => {
            err.log();
            1
        }
    };
    if comm.all_reduce(incomplete, ReduceOp::Max)? > 0 && rank == DECIDER {
        warn!(
            datacube = header.output_datacube_id,
            "rollback incomplete, manual cleanup may be needed"
        );
    }
    match aggregated {
        Err(err) => Err(err),
        Ok(_) => Err(CubeError::Aborted {
            code: i32::try_from(worst)?,
        }),
    }
}

/// Reduces the outcomes of a group of workers to one.
///
/// The output id when every worker succeeded, otherwise the error with the lowest code. An
/// empty group counts as a system failure.
pub fn worst_outcome(
    outcomes: impl IntoIterator<Item = Result<u64, CubeError>>,
) -> Result<u64, CubeError> {
    let mut worst: Option<Result<u64, CubeError>> = None;
    for outcome in outcomes {
        worst = match (worst, outcome) {
            (None, outcome) => Some(outcome),
            (Some(Ok(_)), Err(err)) => Some(Err(err)),
            (Some(Err(current)), Err(err)) if err.code() < current.code() => Some(Err(err)),
            (current, _) => current,
        };
    }
    worst.unwrap_or_else(|| {
        Err(CubeError::Aborted {
            code: ErrorClass::SystemError.code(),
        })
    })
}

/// Runs a reduction with `workers` workers on threads of this process.
///
/// Returns the outcome of every worker, by rank.
pub fn run_local(
    ctx: &ReduceContext,
    workers: u64,
    request: &ReduceRequest,
) -> Vec<Result<u64, CubeError>> {
    let comms = LocalGroup::new(workers.max(1));
    std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .iter()
            .map(|comm| scope.spawn(move || run_worker(ctx, comm, request)))
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(CubeError::Collective {
                        operation: "join",
                        message: "worker panicked".to_string(),
                    })
                })
            })
            .collect()
    })
}
