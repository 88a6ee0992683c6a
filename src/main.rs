//! This file defines the cubereduce binary entry point.
//!
//! The binary seeds a synthetic datacube, reduces it with a group of in-process workers and
//! reports the outcome. The process exit code is the worst worker outcome.

use std::process::ExitCode;

use cubereduce::array::DimensionArray;
use cubereduce::catalog::{Catalog, MemoryCatalog};
use cubereduce::cli;
use cubereduce::dimension_store::{DimensionStore, DimensionTable};
use cubereduce::error::CubeError;
use cubereduce::fragment_store::MemoryFragmentStore;
use cubereduce::hierarchy;
use cubereduce::models::{BlockOperation, MidnightPolicy, ReduceRequest};
use cubereduce::reduce::{self, ReduceContext};
use cubereduce::relation;
use cubereduce::subset::Subset;
use cubereduce::synthetic::{self, SyntheticConfig};
use cubereduce::tracing;

use ::tracing::info;

/// Reads the request at `path`, or builds the hourly-to-daily sum of `datacube_id`.
fn load_request(args: &cli::CommandLineArgs, datacube_id: u64) -> Result<ReduceRequest, CubeError> {
    match args.request_path() {
        Some(path) => {
            let data = std::fs::read(&path).map_err(|err| CubeError::BadParameter {
                message: format!("cannot read {}: {}", path.display(), err),
            })?;
            Ok(serde_json::from_slice(&data)?)
        }
        None => Ok(ReduceRequest {
            dimension: Some("time".to_string()),
            concept_level: hierarchy::DAY,
            midnight: MidnightPolicy::FoldForward,
            description: Some("daily sum".to_string()),
            ..ReduceRequest::new(datacube_id, BlockOperation::Sum)
        }),
    }
}

/// Logs the first labels of every dimension of the output datacube.
fn preview(catalog: &dyn Catalog, store: &DimensionStore, datacube_id: u64) -> Result<(), CubeError> {
    let datacube = catalog.retrieve_datacube(datacube_id)?;
    for dimension in relation::load_dimensions(catalog, datacube_id)? {
        let size = dimension.instance.size;
        if size == 0 {
            info!(dimension = %dimension.dimension.name, "collapsed");
            continue;
        }
        let subset: Subset = format!("1:{}", size.min(2)).parse()?;
        let labels = store.read_filtered(
            datacube.container_id,
            DimensionTable::Label,
            dimension.instance.label_row_id,
            &subset,
            dimension.instance.compressed,
            dimension.dimension.dtype,
            size,
        )?;
        info!(
            dimension = %dimension.dimension.name,
            size,
            level = %dimension.instance.concept_level,
            first_labels = ?DimensionArray::from_bytes(dimension.dimension.dtype, &labels)?,
            "output dimension"
        );
    }
    Ok(())
}

fn run(args: &cli::CommandLineArgs) -> Result<u64, CubeError> {
    let store = match args.store_path() {
        Some(path) => DimensionStore::open(&path)?,
        None => DimensionStore::temporary()?,
    };
    let catalog = MemoryCatalog::new();
    let fragments = MemoryFragmentStore::new();
    let config = SyntheticConfig {
        fragments: args.fragments,
        lat: args.lat,
        time_steps: args.time_steps,
        array_length: args.array_length,
        compressed: args.compressed,
        ..SyntheticConfig::default()
    };
    let seeded = synthetic::seed(&catalog, &store, &config)?;
    synthetic::seed_fragments(&fragments, &seeded, &config)?;
    let request = load_request(args, seeded.datacube_id)?;

    let ctx = ReduceContext {
        catalog: &catalog,
        store: &store,
        fragments: &fragments,
        threads: args.threads,
    };
    let output = reduce::worst_outcome(reduce::run_local(&ctx, args.workers, &request))?;
    preview(&catalog, &store, output)?;
    Ok(output)
}

/// Application entry point
fn main() -> ExitCode {
    let args = cli::parse();
    tracing::init_tracing();
    info!(?args, "starting");
    match run(&args) {
        Ok(output) => {
            info!(datacube = output, "reduction succeeded");
            ExitCode::SUCCESS
        }
        Err(err) => {
            err.log();
            ExitCode::from(err.code().unsigned_abs().min(255) as u8)
        }
    }
}
