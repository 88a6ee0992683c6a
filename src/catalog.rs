//! Metadata catalog.
//!
//! The catalog records containers' dimensions and hierarchies, datacubes, their dimension
//! instances and relations, grids and fragments. [Catalog] is the interface used by the
//! reduction; [MemoryCatalog] keeps everything in memory.

use std::sync::{Mutex, MutexGuard};

use crate::error::CubeError;
use crate::hierarchy::Hierarchy;
use crate::models::{
    CubeHasDim, Datacube, Dimension, DimensionInstance, Fragment, FragmentIds, Grid,
};

use hashbrown::HashMap;
use tracing::debug;

/// Metadata catalog interface.
///
/// Implementations are shared by every worker of a reduction.
pub trait Catalog: Send + Sync {
    fn retrieve_datacube(&self, id: u64) -> Result<Datacube, CubeError>;

    /// Returns the relations of a datacube, ordered by explicit flag (explicit first) then level.
    fn retrieve_cubehasdim_list(&self, datacube_id: u64) -> Result<Vec<CubeHasDim>, CubeError>;

    fn retrieve_dimension_instance(&self, id: u64) -> Result<DimensionInstance, CubeError>;

    fn retrieve_dimension(&self, id: u64) -> Result<Dimension, CubeError>;

    fn retrieve_hierarchy(&self, id: u64) -> Result<Hierarchy, CubeError>;

    /// Returns the grid called `name` in a container, if any.
    fn retrieve_grid(&self, container_id: u64, name: &str) -> Result<Option<Grid>, CubeError>;

    /// Creates an empty grid and returns its id.
    fn insert_grid(&self, container_id: u64, name: &str) -> Result<u64, CubeError>;

    /// Inserts a datacube and returns its id. The id of `datacube` is ignored.
    fn insert_datacube(&self, datacube: &Datacube) -> Result<u64, CubeError>;

    fn insert_cubehasdim(&self, relation: &CubeHasDim) -> Result<(), CubeError>;

    /// Inserts a dimension instance and returns its id. The id of `instance` is ignored.
    fn insert_dimension_instance(&self, instance: &DimensionInstance) -> Result<u64, CubeError>;

    fn update_tuplexfragment(&self, datacube_id: u64, value: u64) -> Result<(), CubeError>;

    /// Returns the fragments of `frag_ids`, ordered by relative index, with their databases.
    fn retrieve_fragment_connection_info(
        &self,
        datacube_id: u64,
        frag_ids: &FragmentIds,
    ) -> Result<Vec<Fragment>, CubeError>;

    /// Inserts a batch of fragments; either all of them or none are recorded.
    fn insert_fragment_rows(&self, fragments: &[Fragment]) -> Result<(), CubeError>;

    /// Removes the fragments of `frag_ids`. Fragments that do not exist are ignored.
    fn delete_fragments(
        &self,
        datacube_id: u64,
        container_id: u64,
        frag_ids: &FragmentIds,
    ) -> Result<(), CubeError>;

    /// Removes a datacube, its relations and fragments, and the dimension instances no longer
    /// used by any datacube. Grids are left alone.
    fn delete_datacube_and_relations(
        &self,
        datacube_id: u64,
        container_id: u64,
    ) -> Result<(), CubeError>;

    /// Removes a dimension instance that no relation refers to. A missing instance is ignored.
    fn delete_dimension_instance(&self, id: u64) -> Result<(), CubeError>;

    /// Removes a grid that no dimension instance belongs to. A missing grid is ignored.
    fn delete_grid(&self, container_id: u64, grid_id: u64) -> Result<(), CubeError>;
}

#[derive(Default)]
struct CatalogState {
    next_id: u64,
    dimensions: HashMap<u64, Dimension>,
    hierarchies: HashMap<u64, Hierarchy>,
    datacubes: HashMap<u64, Datacube>,
    relations: Vec<CubeHasDim>,
    instances: HashMap<u64, DimensionInstance>,
    grids: HashMap<u64, Grid>,
    fragments: HashMap<(u64, u64), Fragment>,
}

impl CatalogState {
    fn generate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

fn not_found(kind: &str, id: u64) -> CubeError {
    CubeError::Catalog {
        message: format!("{} {} not found", kind, id),
    }
}

/// In-memory catalog.
#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, CatalogState>, CubeError> {
        self.state.lock().map_err(|_| CubeError::Catalog {
            message: "catalog lock poisoned".to_string(),
        })
    }

    /// Records a dimension and returns its id. The id of `dimension` is ignored.
    pub fn insert_dimension(&self, dimension: &Dimension) -> Result<u64, CubeError> {
        let mut state = self.lock()?;
        let id = state.generate_id();
        state.dimensions.insert(
            id,
            Dimension {
                id,
                ..dimension.clone()
            },
        );
        Ok(id)
    }

    /// Records a hierarchy under its own id.
    pub fn insert_hierarchy(&self, hierarchy: &Hierarchy) -> Result<(), CubeError> {
        self.lock()?
            .hierarchies
            .insert(hierarchy.id, hierarchy.clone());
        Ok(())
    }

    /// Returns the number of datacubes.
    pub fn datacube_count(&self) -> Result<usize, CubeError> {
        Ok(self.lock()?.datacubes.len())
    }

    /// Returns the number of dimension instances.
    pub fn instance_count(&self) -> Result<usize, CubeError> {
        Ok(self.lock()?.instances.len())
    }

    /// Returns the number of grids.
    pub fn grid_count(&self) -> Result<usize, CubeError> {
        Ok(self.lock()?.grids.len())
    }

    /// Returns the number of relations.
    pub fn relation_count(&self) -> Result<usize, CubeError> {
        Ok(self.lock()?.relations.len())
    }

    /// Returns the number of fragments of a datacube.
    pub fn fragment_count(&self, datacube_id: u64) -> Result<usize, CubeError> {
        Ok(self
            .lock()?
            .fragments
            .keys()
            .filter(|(cube, _)| *cube == datacube_id)
            .count())
    }
}

impl Catalog for MemoryCatalog {
    fn retrieve_datacube(&self, id: u64) -> Result<Datacube, CubeError> {
        self.lock()?
            .datacubes
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("datacube", id))
    }

    fn retrieve_cubehasdim_list(&self, datacube_id: u64) -> Result<Vec<CubeHasDim>, CubeError> {
        let state = self.lock()?;
        if !state.datacubes.contains_key(&datacube_id) {
            return Err(not_found("datacube", datacube_id));
        }
        let mut relations: Vec<CubeHasDim> = state
            .relations
            .iter()
            .filter(|r| r.datacube_id == datacube_id)
            .cloned()
            .collect();
        relations.sort_by_key(|r| (!r.explicit, r.level));
        Ok(relations)
    }

    fn retrieve_dimension_instance(&self, id: u64) -> Result<DimensionInstance, CubeError> {
        self.lock()?
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("dimension instance", id))
    }

    fn retrieve_dimension(&self, id: u64) -> Result<Dimension, CubeError> {
        self.lock()?
            .dimensions
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("dimension", id))
    }

    fn retrieve_hierarchy(&self, id: u64) -> Result<Hierarchy, CubeError> {
        self.lock()?
            .hierarchies
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("hierarchy", id))
    }

    fn retrieve_grid(&self, container_id: u64, name: &str) -> Result<Option<Grid>, CubeError> {
        let state = self.lock()?;
        let grid = state
            .grids
            .values()
            .find(|g| g.container_id == container_id && g.name == name)
            .cloned();
        Ok(grid.map(|grid| {
            let mut instance_ids: Vec<u64> = state
                .instances
                .values()
                .filter(|i| i.grid_id == Some(grid.id))
                .map(|i| i.id)
                .collect();
            instance_ids.sort_unstable();
            Grid {
                instance_ids,
                ..grid
            }
        }))
    }

    fn insert_grid(&self, container_id: u64, name: &str) -> Result<u64, CubeError> {
        let mut state = self.lock()?;
        if state
            .grids
            .values()
            .any(|g| g.container_id == container_id && g.name == name)
        {
            return Err(CubeError::Catalog {
                message: format!("grid {} already exists", name),
            });
        }
        let id = state.generate_id();
        state.grids.insert(
            id,
            Grid {
                id,
                container_id,
                name: name.to_string(),
                instance_ids: vec![],
            },
        );
        Ok(id)
    }

    fn insert_datacube(&self, datacube: &Datacube) -> Result<u64, CubeError> {
        let mut state = self.lock()?;
        let id = state.generate_id();
        state.datacubes.insert(
            id,
            Datacube {
                id,
                ..datacube.clone()
            },
        );
        debug!(id, "inserted datacube");
        Ok(id)
    }

    fn insert_cubehasdim(&self, relation: &CubeHasDim) -> Result<(), CubeError> {
        let mut state = self.lock()?;
        if !state.datacubes.contains_key(&relation.datacube_id) {
            return Err(not_found("datacube", relation.datacube_id));
        }
        if !state.instances.contains_key(&relation.instance_id) {
            return Err(not_found("dimension instance", relation.instance_id));
        }
        state.relations.push(relation.clone());
        Ok(())
    }

    fn insert_dimension_instance(&self, instance: &DimensionInstance) -> Result<u64, CubeError> {
        let mut state = self.lock()?;
        if let Some(grid_id) = instance.grid_id {
            if !state.grids.contains_key(&grid_id) {
                return Err(not_found("grid", grid_id));
            }
        }
        let id = state.generate_id();
        state.instances.insert(
            id,
            DimensionInstance {
                id,
                ..instance.clone()
            },
        );
        Ok(id)
    }

    fn update_tuplexfragment(&self, datacube_id: u64, value: u64) -> Result<(), CubeError> {
        let mut state = self.lock()?;
        let datacube = state
            .datacubes
            .get_mut(&datacube_id)
            .ok_or_else(|| not_found("datacube", datacube_id))?;
        datacube.tuplexfragment = value;
        Ok(())
    }

    fn retrieve_fragment_connection_info(
        &self,
        datacube_id: u64,
        frag_ids: &FragmentIds,
    ) -> Result<Vec<Fragment>, CubeError> {
        let state = self.lock()?;
        frag_ids
            .iter()
            .map(|index| {
                state
                    .fragments
                    .get(&(datacube_id, index))
                    .cloned()
                    .ok_or_else(|| CubeError::Catalog {
                        message: format!(
                            "fragment {} of datacube {} not found",
                            index, datacube_id
                        ),
                    })
            })
            .collect()
    }

    fn insert_fragment_rows(&self, fragments: &[Fragment]) -> Result<(), CubeError> {
        let mut state = self.lock()?;
        if let Some(duplicate) = fragments.iter().find(|f| {
            state
                .fragments
                .contains_key(&(f.datacube_id, f.relative_index))
        }) {
            return Err(CubeError::Catalog {
                message: format!("fragment {} already exists", duplicate.name),
            });
        }
        for fragment in fragments {
            state.fragments.insert(
                (fragment.datacube_id, fragment.relative_index),
                fragment.clone(),
            );
        }
        debug!(count = fragments.len(), "inserted fragment rows");
        Ok(())
    }

    fn delete_fragments(
        &self,
        datacube_id: u64,
        container_id: u64,
        frag_ids: &FragmentIds,
    ) -> Result<(), CubeError> {
        let mut state = self.lock()?;
        if let Some(datacube) = state.datacubes.get(&datacube_id) {
            if datacube.container_id != container_id {
                return Err(CubeError::Catalog {
                    message: format!(
                        "datacube {} is not in container {}",
                        datacube_id, container_id
                    ),
                });
            }
        }
        for index in frag_ids.iter() {
            state.fragments.remove(&(datacube_id, index));
        }
        Ok(())
    }

    fn delete_datacube_and_relations(
        &self,
        datacube_id: u64,
        container_id: u64,
    ) -> Result<(), CubeError> {
        let mut state = self.lock()?;
        match state.datacubes.get(&datacube_id) {
            Some(datacube) if datacube.container_id != container_id => {
                return Err(CubeError::Catalog {
                    message: format!(
                        "datacube {} is not in container {}",
                        datacube_id, container_id
                    ),
                })
            }
            _ => {}
        }
        state.datacubes.remove(&datacube_id);
        state.fragments.retain(|(cube, _), _| *cube != datacube_id);
        let removed: Vec<u64> = state
            .relations
            .iter()
            .filter(|r| r.datacube_id == datacube_id)
            .map(|r| r.instance_id)
            .collect();
        state.relations.retain(|r| r.datacube_id != datacube_id);
        for instance_id in removed {
            if !state.relations.iter().any(|r| r.instance_id == instance_id) {
                state.instances.remove(&instance_id);
            }
        }
        debug!(datacube_id, "deleted datacube and relations");
        Ok(())
    }

    fn delete_dimension_instance(&self, id: u64) -> Result<(), CubeError> {
        let mut state = self.lock()?;
        if state.relations.iter().any(|r| r.instance_id == id) {
            return Err(CubeError::Catalog {
                message: format!("dimension instance {} is still in use", id),
            });
        }
        state.instances.remove(&id);
        Ok(())
    }

    fn delete_grid(&self, container_id: u64, grid_id: u64) -> Result<(), CubeError> {
        let mut state = self.lock()?;
        match state.grids.get(&grid_id) {
            None => return Ok(()),
            Some(grid) if grid.container_id != container_id => {
                return Err(CubeError::Catalog {
                    message: format!("grid {} is not in container {}", grid_id, container_id),
                })
            }
            Some(_) => {}
        }
        if state.instances.values().any(|i| i.grid_id == Some(grid_id)) {
            return Err(CubeError::Catalog {
                message: format!("grid {} is still in use", grid_id),
            });
        }
        state.grids.remove(&grid_id);
        debug!(grid_id, "deleted grid");
        Ok(())
    }
}
