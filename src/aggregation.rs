//! Aggregation of the fragments owned by one worker.
//!
//! The fragments of the input datacube are split evenly across workers, and the share of a worker
//! is split again across a pool of threads. Each thread walks its contiguous range of fragments,
//! keeping one store connection open while consecutive fragments live on the same server, and
//! pushes the block aggregation of every fragment down to its store.

use crate::catalog::Catalog;
use crate::error::CubeError;
use crate::fragment_store::{FragmentStore, StoreConnection};
use crate::models::{BlockTask, Fragment, FragmentIds};
use crate::partition::split_evenly;
use crate::payload::AggregationHeader;

use rayon::prelude::*;
use tracing::{debug, warn};

/// Returns the input fragments owned by worker `rank` of `workers`.
pub fn worker_fragments(frag_ids: &FragmentIds, rank: u64, workers: u64) -> FragmentIds {
    let (offset, count) = split_evenly(frag_ids.len(), workers, rank);
    frag_ids.slice(offset, count)
}

/// Maps the first key of an input fragment to the first key of its output fragment.
fn output_key_start(key_start: u64, input_tuplexfragment: u64, output_tuplexfragment: u64) -> u64 {
    (key_start - 1) / input_tuplexfragment * output_tuplexfragment + 1
}

/// Describes the output fragment written for `source`.
fn output_fragment(
    store: &dyn FragmentStore,
    header: &AggregationHeader,
    task: &BlockTask,
    rank: u64,
    source: &Fragment,
) -> Result<Fragment, CubeError> {
    if header.input_tuplexfragment == 0 || source.key_start == 0 || source.key_end < source.key_start
    {
        return Err(CubeError::Catalog {
            message: format!(
                "fragment {} has invalid key range {}-{}",
                source.name, source.key_start, source.key_end
            ),
        });
    }
    let rows = task.output_rows(source.key_end - source.key_start + 1);
    let key_start = output_key_start(
        source.key_start,
        header.input_tuplexfragment,
        header.output_tuplexfragment,
    );
    Ok(Fragment {
        datacube_id: header.output_datacube_id,
        relative_index: source.relative_index,
        name: store.generate_fragment_name(header.output_datacube_id, rank, source.relative_index),
        key_start,
        key_end: key_start + rows.max(1) - 1,
        db: source.db.clone(),
    })
}

/// An open connection and the server and database it points to.
struct Session<'a> {
    server: String,
    database: Option<String>,
    connection: Box<dyn StoreConnection + 'a>,
}

impl Session<'_> {
    fn close(self) {
        if let Err(err) = self.connection.disconnect() {
            warn!(server = %self.server, "failed to disconnect: {}", err);
        }
    }
}

/// Returns a session on the database holding `fragment`, reusing `current` when possible.
fn switch_session<'a>(
    store: &'a dyn FragmentStore,
    current: Option<Session<'a>>,
    fragment: &Fragment,
) -> Result<Session<'a>, CubeError> {
    let mut session = match current {
        Some(session) if session.server == fragment.db.server => session,
        other => {
            if let Some(session) = other {
                session.close();
            }
            Session {
                server: fragment.db.server.clone(),
                database: None,
                connection: store.connect(&fragment.db.server)?,
            }
        }
    };
    if session.database.as_deref() != Some(fragment.db.database.as_str()) {
        session.connection.select_database(&fragment.db.database)?;
        session.database = Some(fragment.db.database.clone());
    }
    Ok(session)
}

/// Aggregates a contiguous range of fragments on the calling thread.
fn aggregate_range(
    store: &dyn FragmentStore,
    header: &AggregationHeader,
    task: &BlockTask,
    rank: u64,
    fragments: &[Fragment],
) -> Result<Vec<Fragment>, CubeError> {
    let mut outputs = Vec::with_capacity(fragments.len());
    let mut session: Option<Session> = None;
    let mut result = Ok(());
    for source in fragments {
        let step = switch_session(store, session.take(), source).and_then(|mut current| {
            let target = output_fragment(store, header, task, rank, source);
            let written = target.and_then(|target| {
                current
                    .connection
                    .aggregate_block(&source.name, &target.name, task)
                    .map(|rows| (target, rows))
            });
            session = Some(current);
            written
        });
        match step {
            Ok((target, rows)) => {
                debug!(source = %source.name, target = %target.name, rows, "aggregated fragment");
                outputs.push(target);
            }
            Err(err) => {
                result = Err(err);
                break;
            }
        }
    }
    if let Some(session) = session {
        session.close();
    }
    result.map(|_| outputs)
}

/// Aggregates the fragments owned by worker `rank` and records the output fragments.
///
/// The output fragments of the worker are inserted in the catalog in one batch, only when every
/// thread succeeded. Returns the relative indices handled by the worker.
#[tracing::instrument(level = "DEBUG", skip(catalog, store, header, task))]
pub fn aggregate_fragments(
    catalog: &dyn Catalog,
    store: &dyn FragmentStore,
    header: &AggregationHeader,
    task: &BlockTask,
    rank: u64,
    workers: u64,
    threads: usize,
) -> Result<FragmentIds, CubeError> {
    let local = worker_fragments(&header.frag_ids, rank, workers);
    if local.is_empty() {
        debug!("no fragments assigned");
        return Ok(local);
    }
    let fragments = catalog.retrieve_fragment_connection_info(header.input_datacube_id, &local)?;
    let total = fragments.len() as u64;
    let threads = threads.clamp(1, fragments.len());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()?;
    let results: Vec<Result<Vec<Fragment>, CubeError>> = pool.install(|| {
        (0..threads)
            .into_par_iter()
            .map(|thread| {
                let (offset, count) = split_evenly(total, threads as u64, thread as u64);
                let range = &fragments[offset as usize..(offset + count) as usize];
                aggregate_range(store, header, task, rank, range)
            })
            .collect()
    });

    let mut outputs = Vec::with_capacity(fragments.len());
    for result in results {
        outputs.extend(result?);
    }
    catalog.insert_fragment_rows(&outputs)?;
    debug!(fragments = outputs.len(), threads, "worker aggregation complete");
    Ok(local)
}

/// Removes the output fragments of worker `rank` from their stores and from the catalog.
///
/// Every fragment is attempted; the first failure is returned once all have been tried.
#[tracing::instrument(level = "DEBUG", skip(catalog, store, header))]
pub fn delete_output_fragments(
    catalog: &dyn Catalog,
    store: &dyn FragmentStore,
    header: &AggregationHeader,
    rank: u64,
    workers: u64,
) -> Result<(), CubeError> {
    let local = worker_fragments(&header.frag_ids, rank, workers);
    if local.is_empty() {
        return Ok(());
    }
    let mut first_error = None;
    let sources = catalog.retrieve_fragment_connection_info(header.input_datacube_id, &local)?;
    let mut session: Option<Session> = None;
    for source in &sources {
        let name =
            store.generate_fragment_name(header.output_datacube_id, rank, source.relative_index);
        let deleted = switch_session(store, session.take(), source).and_then(|mut current| {
            let deleted = current.connection.delete_fragment(&name);
            session = Some(current);
            deleted
        });
        if let Err(err) = deleted {
            warn!(fragment = %name, "failed to delete output fragment: {}", err);
            first_error.get_or_insert(err);
        }
    }
    if let Some(session) = session {
        session.close();
    }
    if let Err(err) = catalog.delete_fragments(
        header.output_datacube_id,
        header.container_id,
        &local,
    ) {
        first_error.get_or_insert(err);
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
