//! Synthetic datacubes.
//!
//! Seeds a catalog, a dimension store and optionally a fragment store with a small datacube of
//! hourly values on a latitude by time grid, with longitude as the implicit dimension. Used by the
//! binary's demonstration run, tests and benchmarks.

use crate::array::DimensionArray;
use crate::calendar::{CalendarDescriptor, TimeUnits};
use crate::catalog::{Catalog, MemoryCatalog};
use crate::compression;
use crate::dimension_store::{DimensionStore, DimensionTable};
use crate::error::CubeError;
use crate::fragment_store::MemoryFragmentStore;
use crate::hierarchy::{self, Hierarchy};
use crate::models::{
    CubeHasDim, Datacube, DbInstance, Dimension, DimensionInstance, DType, Fragment, FragmentIds,
};

use bytes::Bytes;
use tracing::info;
use zerocopy::AsBytes;

/// Hierarchy id of time dimensions.
pub const TIME_HIERARCHY: u64 = 1;
/// Hierarchy id of dimensions without concept levels.
pub const BASE_HIERARCHY: u64 = 2;
/// Container holding every synthetic datacube.
pub const CONTAINER: u64 = 1;
/// Epoch of the time labels.
pub const BASE_TIME: &str = "2000-01-01 00:00:00";

/// Shape of a synthetic datacube.
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticConfig {
    /// Number of fragments; must divide `lat * time_steps`
    pub fragments: u64,
    pub lat: u64,
    pub time_steps: u64,
    /// Minutes between consecutive time steps
    pub step_minutes: u64,
    /// Longitudes held by each row
    pub array_length: u64,
    pub compressed: bool,
    /// Number of fragment store servers the fragments are spread over
    pub servers: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            fragments: 4,
            lat: 4,
            time_steps: 48,
            step_minutes: 60,
            array_length: 8,
            compressed: false,
            servers: 2,
        }
    }
}

/// What [seed] created.
#[derive(Clone, Debug)]
pub struct SeededCube {
    pub datacube_id: u64,
    pub container_id: u64,
    pub fragments: Vec<Fragment>,
}

/// Writes the labels of one dimension and returns its instance id.
fn seed_instance(
    catalog: &MemoryCatalog,
    store: &DimensionStore,
    dimension_id: u64,
    concept_level: char,
    labels: &DimensionArray,
    compressed: bool,
) -> Result<u64, CubeError> {
    let size = labels.len() as u64;
    let index_row_id = store.insert_array(
        CONTAINER,
        DimensionTable::Index,
        &DimensionArray::positions(size),
        compressed,
    )?;
    let label_row_id = store.insert_array(CONTAINER, DimensionTable::Label, labels, compressed)?;
    catalog.insert_dimension_instance(&DimensionInstance {
        id: 0,
        dimension_id,
        size,
        concept_level,
        index_row_id,
        label_row_id,
        compressed,
        grid_id: None,
    })
}

fn dimension(name: &str, hierarchy_id: u64, calendar: Option<CalendarDescriptor>) -> Dimension {
    Dimension {
        id: 0,
        container_id: CONTAINER,
        name: name.to_string(),
        dtype: DType::Double,
        hierarchy_id,
        calendar,
    }
}

/// Records a synthetic datacube, its dimensions and its fragments in `catalog` and `store`.
///
/// Fragment rows are not written; see [seed_fragments].
pub fn seed(
    catalog: &MemoryCatalog,
    store: &DimensionStore,
    config: &SyntheticConfig,
) -> Result<SeededCube, CubeError> {
    let rows = config.lat * config.time_steps;
    if config.fragments == 0 || rows % config.fragments != 0 || config.servers == 0 {
        return Err(CubeError::BadParameter {
            message: format!(
                "{} rows cannot be split into {} fragments over {} servers",
                rows, config.fragments, config.servers
            ),
        });
    }
    catalog.insert_hierarchy(&Hierarchy::time(TIME_HIERARCHY))?;
    catalog.insert_hierarchy(&Hierarchy::base(BASE_HIERARCHY))?;

    let time_level = if config.step_minutes < 60 {
        hierarchy::MINUTE
    } else {
        hierarchy::HOUR
    };
    let calendar = CalendarDescriptor::standard(BASE_TIME, TimeUnits::Minutes);
    let time_labels: Vec<f64> = (0..config.time_steps)
        .map(|i| (i * config.step_minutes) as f64)
        .collect();
    let lat_step = 180.0 / config.lat as f64;
    let lat_labels: Vec<f64> = (0..config.lat)
        .map(|i| -90.0 + (i as f64 + 0.5) * lat_step)
        .collect();
    let lon_step = 360.0 / config.array_length.max(1) as f64;
    let lon_labels: Vec<f64> = (0..config.array_length)
        .map(|i| i as f64 * lon_step)
        .collect();

    // (dimension, hierarchy, calendar, concept level, labels, explicit, level)
    let axes = [
        ("lat", BASE_HIERARCHY, None, hierarchy::NOT_APPLICABLE, lat_labels, true, 1),
        ("time", TIME_HIERARCHY, Some(calendar), time_level, time_labels, true, 2),
        ("lon", BASE_HIERARCHY, None, hierarchy::NOT_APPLICABLE, lon_labels, false, 1),
    ];
    let datacube_id = catalog.insert_datacube(&Datacube {
        id: 0,
        container_id: CONTAINER,
        measure: "tas".to_string(),
        measure_type: DType::Float,
        compressed: config.compressed,
        tuplexfragment: rows / config.fragments,
        array_length: config.array_length,
        frag_ids: FragmentIds::range(1, config.fragments),
        level: 0,
        source_id: None,
        description: Some("synthetic".to_string()),
    })?;
    for (name, hierarchy_id, calendar, concept_level, labels, explicit, level) in axes {
        let dimension_id = catalog.insert_dimension(&dimension(name, hierarchy_id, calendar))?;
        let labels = DimensionArray::from_f64(DType::Double, &labels)?;
        let instance_id = seed_instance(
            catalog,
            store,
            dimension_id,
            concept_level,
            &labels,
            config.compressed,
        )?;
        catalog.insert_cubehasdim(&CubeHasDim {
            datacube_id,
            instance_id,
            explicit,
            level,
            size: labels.len() as u64,
        })?;
    }

    let tuplexfragment = rows / config.fragments;
    let fragments: Vec<Fragment> = (1..=config.fragments)
        .map(|index| Fragment {
            datacube_id,
            relative_index: index,
            name: format!("tas_{}_{}", datacube_id, index),
            key_start: (index - 1) * tuplexfragment + 1,
            key_end: index * tuplexfragment,
            db: DbInstance {
                server: format!("s{}", 1 + (index - 1) * config.servers / config.fragments),
                database: format!("db{}", 1 + (index - 1) % 2),
            },
        })
        .collect();
    catalog.insert_fragment_rows(&fragments)?;
    info!(
        datacube_id,
        rows,
        fragments = config.fragments,
        "seeded synthetic datacube"
    );
    Ok(SeededCube {
        datacube_id,
        container_id: CONTAINER,
        fragments,
    })
}

/// Writes the rows of every fragment of `seeded` to `fragments`.
///
/// Every element of a row holds the position of its time step, so a daily sum of hourly data
/// yields `sum(24d..24d+24)` for day `d`.
pub fn seed_fragments(
    fragments: &MemoryFragmentStore,
    seeded: &SeededCube,
    config: &SyntheticConfig,
) -> Result<(), CubeError> {
    for fragment in &seeded.fragments {
        let rows = (fragment.key_start..=fragment.key_end)
            .map(|key| {
                let step = ((key - 1) % config.time_steps) as f32;
                let values = vec![step; config.array_length as usize];
                compression::encode(values.as_bytes(), config.compressed)
            })
            .collect::<Result<Vec<Bytes>, CubeError>>()?;
        fragments.insert_fragment(
            &fragment.db.server,
            &fragment.db.database,
            &fragment.name,
            rows,
        )?;
    }
    Ok(())
}
