//! Fragment stores.
//!
//! The rows of a fragment live in a database of a fragment store server. Block aggregation is
//! pushed down to the store: the store reads the source fragment, aggregates it and writes the
//! output fragment without the rows leaving the server.

use std::sync::{Mutex, MutexGuard};

use crate::error::CubeError;
use crate::models::BlockTask;
use crate::operations;

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use tracing::debug;

/// Fragment store trait.
///
/// Defines the interface used to reach the servers holding fragments.
///
/// # Methods
/// * `connect`: Open a connection to a server.
/// * `generate_fragment_name`: Name of an output fragment.
pub trait FragmentStore: Send + Sync {
    /// Opens a connection to `server`.
    fn connect(&self, server: &str) -> Result<Box<dyn StoreConnection + '_>, CubeError>;

    /// Returns the name of the fragment written by worker `rank` as its `ordinal`th output of
    /// datacube `datacube_id`.
    fn generate_fragment_name(&self, datacube_id: u64, rank: u64, ordinal: u64) -> String {
        format!("fact_{}_{}_{}", datacube_id, rank, ordinal)
    }
}

/// A connection to one fragment store server.
pub trait StoreConnection {
    /// Selects the database used by the following calls.
    fn select_database(&mut self, database: &str) -> Result<(), CubeError>;

    /// Aggregates fragment `source` into a new fragment `target` and returns its row count.
    ///
    /// # Arguments
    ///
    /// * `source`: Name of the input fragment
    /// * `target`: Name of the output fragment; it must not exist
    /// * `task`: Operation, missing data and block sizing
    fn aggregate_block(
        &mut self,
        source: &str,
        target: &str,
        task: &BlockTask,
    ) -> Result<u64, CubeError>;

    /// Removes fragment `name` from the selected database. Missing fragments are ignored.
    fn delete_fragment(&mut self, name: &str) -> Result<(), CubeError>;

    /// Closes the connection.
    fn disconnect(self: Box<Self>) -> Result<(), CubeError>;
}

/// Location of a fragment: server, database and name.
type FragmentKey = (String, String, String);

#[derive(Default)]
struct MemoryState {
    fragments: HashMap<FragmentKey, Vec<Bytes>>,
    failing_servers: HashSet<String>,
    failing_fragments: HashSet<String>,
}

/// In-memory fragment store.
///
/// Failures can be injected per server or per source fragment.
#[derive(Default)]
pub struct MemoryFragmentStore {
    state: Mutex<MemoryState>,
}

impl MemoryFragmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, CubeError> {
        self.state.lock().map_err(|_| CubeError::FragmentStore {
            server: "*".to_string(),
            message: "fragment store lock poisoned".to_string(),
        })
    }

    /// Stores the rows of a fragment, replacing any previous content.
    pub fn insert_fragment(
        &self,
        server: &str,
        database: &str,
        name: &str,
        rows: Vec<Bytes>,
    ) -> Result<(), CubeError> {
        self.lock()?.fragments.insert(
            (server.to_string(), database.to_string(), name.to_string()),
            rows,
        );
        Ok(())
    }

    /// Returns the rows of a fragment, if it exists.
    pub fn fragment_rows(
        &self,
        server: &str,
        database: &str,
        name: &str,
    ) -> Result<Option<Vec<Bytes>>, CubeError> {
        Ok(self
            .lock()?
            .fragments
            .get(&(server.to_string(), database.to_string(), name.to_string()))
            .cloned())
    }

    /// Returns the number of fragments held by every server.
    pub fn fragment_count(&self) -> Result<usize, CubeError> {
        Ok(self.lock()?.fragments.len())
    }

    /// Makes connections to `server` fail.
    pub fn fail_server(&self, server: &str) -> Result<(), CubeError> {
        self.lock()?.failing_servers.insert(server.to_string());
        Ok(())
    }

    /// Makes the aggregation of source fragment `name` fail.
    pub fn fail_fragment(&self, name: &str) -> Result<(), CubeError> {
        self.lock()?.failing_fragments.insert(name.to_string());
        Ok(())
    }
}

impl FragmentStore for MemoryFragmentStore {
    fn connect(&self, server: &str) -> Result<Box<dyn StoreConnection + '_>, CubeError> {
        if self.lock()?.failing_servers.contains(server) {
            return Err(CubeError::FragmentStore {
                server: server.to_string(),
                message: "connection refused".to_string(),
            });
        }
        debug!(server, "connected to fragment store");
        Ok(Box::new(MemoryConnection {
            store: self,
            server: server.to_string(),
            database: None,
        }))
    }
}

struct MemoryConnection<'a> {
    store: &'a MemoryFragmentStore,
    server: String,
    database: Option<String>,
}

impl MemoryConnection<'_> {
    fn database(&self, step: &'static str) -> Result<&str, CubeError> {
        self.database.as_deref().ok_or(CubeError::NullHandle {
            step,
            prerequisite: "select_database",
        })
    }

    fn key(&self, database: &str, name: &str) -> FragmentKey {
        (self.server.clone(), database.to_string(), name.to_string())
    }

    fn error(&self, message: String) -> CubeError {
        CubeError::FragmentStore {
            server: self.server.clone(),
            message,
        }
    }
}

impl StoreConnection for MemoryConnection<'_> {
    fn select_database(&mut self, database: &str) -> Result<(), CubeError> {
        self.database = Some(database.to_string());
        Ok(())
    }

    #[tracing::instrument(level = "DEBUG", skip(self, task), fields(server = %self.server))]
    fn aggregate_block(
        &mut self,
        source: &str,
        target: &str,
        task: &BlockTask,
    ) -> Result<u64, CubeError> {
        let database = self.database("aggregate_block")?.to_string();
        let rows = {
            let state = self.store.lock()?;
            if state.failing_fragments.contains(source) {
                return Err(self.error(format!("aggregation of {} failed", source)));
            }
            if state.fragments.contains_key(&self.key(&database, target)) {
                return Err(self.error(format!("fragment {} already exists", target)));
            }
            state
                .fragments
                .get(&self.key(&database, source))
                .cloned()
                .ok_or_else(|| self.error(format!("fragment {} not found", source)))?
        };
        // Aggregate without holding the lock so that threads work in parallel.
        let output = operations::execute(task, &rows)?;
        let count = output.len() as u64;
        self.store
            .lock()?
            .fragments
            .insert(self.key(&database, target), output);
        Ok(count)
    }

    fn delete_fragment(&mut self, name: &str) -> Result<(), CubeError> {
        let database = self.database("delete_fragment")?.to_string();
        self.store
            .lock()?
            .fragments
            .remove(&self.key(&database, name));
        Ok(())
    }

    fn disconnect(self: Box<Self>) -> Result<(), CubeError> {
        debug!(server = %self.server, "disconnected from fragment store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{self, int_rows};

    #[test]
    fn fragment_names() {
        let store = MemoryFragmentStore::new();
        assert_eq!("fact_7_2_11", store.generate_fragment_name(7, 2, 11));
    }

    #[test]
    fn aggregate_block() {
        let store = MemoryFragmentStore::new();
        store
            .insert_fragment("s1", "db1", "src", int_rows(&[[1, 2], [3, 4], [5, 6], [7, 8]]))
            .unwrap();
        let mut connection = store.connect("s1").unwrap();
        connection.select_database("db1").unwrap();
        let task = test_utils::get_test_block_task();
        assert_eq!(2, connection.aggregate_block("src", "dst", &task).unwrap());
        connection.disconnect().unwrap();
        assert_eq!(
            Some(int_rows(&[[4, 6], [12, 14]])),
            store.fragment_rows("s1", "db1", "dst").unwrap()
        );
    }

    #[test]
    fn aggregate_without_database() {
        let store = MemoryFragmentStore::new();
        let mut connection = store.connect("s1").unwrap();
        let err = connection
            .aggregate_block("src", "dst", &test_utils::get_test_block_task())
            .unwrap_err();
        assert_eq!(err.to_string(), "aggregate_block invoked before select_database");
    }

    #[test]
    fn existing_target_rejected() {
        let store = MemoryFragmentStore::new();
        let rows = int_rows(&[[1, 2], [3, 4], [5, 6], [7, 8]]);
        store.insert_fragment("s1", "db1", "src", rows.clone()).unwrap();
        store.insert_fragment("s1", "db1", "dst", rows).unwrap();
        let mut connection = store.connect("s1").unwrap();
        connection.select_database("db1").unwrap();
        let error = connection
            .aggregate_block("src", "dst", &test_utils::get_test_block_task())
            .unwrap_err();
        assert_eq!(
            "fragment store error on s1: fragment dst already exists",
            error.to_string()
        );
    }

    #[test]
    fn missing_source() {
        let store = MemoryFragmentStore::new();
        let mut connection = store.connect("s1").unwrap();
        connection.select_database("db1").unwrap();
        let error = connection
            .aggregate_block("src", "dst", &test_utils::get_test_block_task())
            .unwrap_err();
        assert_eq!(
            "fragment store error on s1: fragment src not found",
            error.to_string()
        );
    }

    #[test]
    fn injected_failures() {
        let store = MemoryFragmentStore::new();
        store
            .insert_fragment("s1", "db1", "src", int_rows(&[[1, 2], [3, 4], [5, 6], [7, 8]]))
            .unwrap();
        store.fail_fragment("src").unwrap();
        store.fail_server("s2").unwrap();
        assert!(store.connect("s2").is_err());
        let mut connection = store.connect("s1").unwrap();
        connection.select_database("db1").unwrap();
        assert!(connection
            .aggregate_block("src", "dst", &test_utils::get_test_block_task())
            .is_err());
        assert_eq!(None, store.fragment_rows("s1", "db1", "dst").unwrap());
    }

    #[test]
    fn delete_fragment() {
        let store = MemoryFragmentStore::new();
        store.insert_fragment("s1", "db1", "f", vec![]).unwrap();
        let mut connection = store.connect("s1").unwrap();
        connection.select_database("db1").unwrap();
        connection.delete_fragment("f").unwrap();
        connection.delete_fragment("f").unwrap();
        assert_eq!(0, store.fragment_count().unwrap());
    }
}
