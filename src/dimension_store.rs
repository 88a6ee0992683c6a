//! Storage of dimension arrays.
//!
//! Each container owns two tables: `container_<id>` holds index arrays (1-based positions) and
//! `container_<id>_label` holds label arrays (coordinate values). A row is one opaque blob keyed by
//! an auto-incrementing id; its element type and count are supplied by the catalog. Rows are
//! written once and never modified.

use std::fmt;
use std::path::Path;

use crate::array::DimensionArray;
use crate::compression;
use crate::error::CubeError;
use crate::models::DType;
use crate::subset::Subset;

use bytes::Bytes;
use tracing::debug;

/// The two tables of a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DimensionTable {
    /// Index arrays
    Index,
    /// Label arrays
    Label,
}

impl DimensionTable {
    /// Returns the name of the table for `container_id`.
    pub fn name(self, container_id: u64) -> String {
        match self {
            Self::Index => format!("container_{}", container_id),
            Self::Label => format!("container_{}_label", container_id),
        }
    }
}

impl fmt::Display for DimensionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index => write!(f, "index"),
            Self::Label => write!(f, "label"),
        }
    }
}

/// Dimension array store backed by sled.
///
/// Cloning is cheap; clones share the underlying database.
#[derive(Clone)]
pub struct DimensionStore {
    db: sled::Db,
}

/// Checks that `data` holds exactly `count` elements of `dtype`.
fn check_length(dtype: DType, count: u64, data: &[u8]) -> Result<(), CubeError> {
    let expected = usize::try_from(count)? * dtype.size_of();
    if data.len() != expected {
        return Err(CubeError::RowLength {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

impl DimensionStore {
    /// Opens or creates a store at `path`.
    pub fn open(path: &Path) -> Result<Self, CubeError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Creates a store that is removed when dropped.
    pub fn temporary() -> Result<Self, CubeError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn tree(&self, container_id: u64, table: DimensionTable) -> Result<sled::Tree, CubeError> {
        Ok(self.db.open_tree(table.name(container_id))?)
    }

    /// Appends a row of `count` elements of `dtype` and returns its id.
    ///
    /// The row is compressed when `compressed` is set.
    #[tracing::instrument(level = "DEBUG", skip(self, data))]
    pub fn insert(
        &self,
        container_id: u64,
        table: DimensionTable,
        dtype: DType,
        count: u64,
        data: &[u8],
        compressed: bool,
    ) -> Result<u64, CubeError> {
        check_length(dtype, count, data)?;
        let row = compression::encode(data, compressed)?;
        let insert_error = |source| CubeError::DimensionInsert {
            table: table.name(container_id),
            source,
        };
        let tree = self.tree(container_id, table).map_err(|err| match err {
            CubeError::Sled(source) => insert_error(source),
            err => err,
        })?;
        let id = self.db.generate_id().map_err(insert_error)? + 1;
        tree.insert(id.to_be_bytes(), row.as_ref())
            .map_err(insert_error)?;
        debug!(id, bytes = row.len(), "inserted dimension row");
        Ok(id)
    }

    /// Appends `array` as a new row and returns its id.
    pub fn insert_array(
        &self,
        container_id: u64,
        table: DimensionTable,
        array: &DimensionArray,
        compressed: bool,
    ) -> Result<u64, CubeError> {
        self.insert(
            container_id,
            table,
            array.dtype(),
            array.len() as u64,
            &array.to_bytes(),
            compressed,
        )
    }

    /// Returns the raw, decompressed bytes of row `id`.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    pub fn read(
        &self,
        container_id: u64,
        table: DimensionTable,
        id: u64,
        compressed: bool,
    ) -> Result<Bytes, CubeError> {
        let row = self
            .tree(container_id, table)?
            .get(id.to_be_bytes())?
            .ok_or_else(|| CubeError::RowNotFound {
                table: table.name(container_id),
                id,
            })?;
        compression::decode(&row, compressed)
    }

    /// Returns row `id` as a typed array of `count` elements.
    pub fn read_array(
        &self,
        container_id: u64,
        table: DimensionTable,
        id: u64,
        compressed: bool,
        dtype: DType,
        count: u64,
    ) -> Result<DimensionArray, CubeError> {
        let data = self.read(container_id, table, id, compressed)?;
        check_length(dtype, count, &data)?;
        DimensionArray::from_bytes(dtype, &data)
    }

    /// Returns the elements of row `id` selected by `subset`.
    ///
    /// `subset` is checked against the declared element count of the row.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    #[allow(clippy::too_many_arguments)]
    pub fn read_filtered(
        &self,
        container_id: u64,
        table: DimensionTable,
        id: u64,
        subset: &Subset,
        compressed: bool,
        dtype: DType,
        declared_count: u64,
    ) -> Result<Bytes, CubeError> {
        let array = self.read_array(container_id, table, id, compressed, dtype, declared_count)?;
        let positions = subset.positions(array.len())?;
        Ok(array.gather(&positions)?.to_bytes().into())
    }

    /// Whether `candidate` holds the same `count` elements of `dtype` as row `other_id`.
    ///
    /// Both sides are compared byte for byte after decompression, so the comparison is reflexive
    /// even for NaN labels.
    #[tracing::instrument(level = "DEBUG", skip(self, candidate))]
    #[allow(clippy::too_many_arguments)]
    pub fn compare(
        &self,
        container_id: u64,
        table: DimensionTable,
        dtype: DType,
        count: u64,
        candidate: &[u8],
        other_id: u64,
        compressed: bool,
    ) -> Result<bool, CubeError> {
        check_length(dtype, count, candidate)?;
        let stored = self.read(container_id, table, other_id, compressed)?;
        if check_length(dtype, count, &stored).is_err() {
            return Ok(false);
        }
        Ok(stored.as_ref() == candidate)
    }

    /// Removes row `id`. Removing a row that does not exist is not an error.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    pub fn delete(
        &self,
        container_id: u64,
        table: DimensionTable,
        id: u64,
    ) -> Result<(), CubeError> {
        self.tree(container_id, table)?.remove(id.to_be_bytes())?;
        Ok(())
    }

    /// Returns the number of rows in a table.
    pub fn row_count(&self, container_id: u64, table: DimensionTable) -> Result<usize, CubeError> {
        Ok(self.tree(container_id, table)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn table_names() {
        assert_eq!("container_3", DimensionTable::Index.name(3));
        assert_eq!("container_3_label", DimensionTable::Label.name(3));
    }

    #[test]
    fn insert_read() {
        let store = DimensionStore::temporary().unwrap();
        let array = DimensionArray::Double(vec![0.5, 1.5, 2.5]);
        let id = store
            .insert_array(1, DimensionTable::Label, &array, false)
            .unwrap();
        let data = store.read(1, DimensionTable::Label, id, false).unwrap();
        assert_eq!(array.to_bytes(), data.as_ref());
        let read = store
            .read_array(1, DimensionTable::Label, id, false, DType::Double, 3)
            .unwrap();
        assert_eq!(array, read);
    }

    #[test]
    fn insert_ids_increase() {
        let store = DimensionStore::temporary().unwrap();
        let array = DimensionArray::positions(4);
        let first = store
            .insert_array(1, DimensionTable::Index, &array, false)
            .unwrap();
        let second = store
            .insert_array(1, DimensionTable::Index, &array, false)
            .unwrap();
        assert!(first >= 1);
        assert!(second > first);
        assert_eq!(2, store.row_count(1, DimensionTable::Index).unwrap());
    }

    #[test]
    fn insert_read_compressed() {
        let store = DimensionStore::temporary().unwrap();
        let array = DimensionArray::Int((0..100).collect());
        let id = store
            .insert_array(2, DimensionTable::Label, &array, true)
            .unwrap();
        let data = store.read(2, DimensionTable::Label, id, true).unwrap();
        assert_eq!(array.to_bytes(), data.as_ref());
    }

    #[test]
    fn insert_wrong_length() {
        let store = DimensionStore::temporary().unwrap();
        let err = store
            .insert(1, DimensionTable::Label, DType::Int, 2, &[0; 7], false)
            .unwrap_err();
        assert_eq!(err.to_string(), "row holds 7 bytes, expected 8");
    }

    #[test]
    fn read_missing_row() {
        let store = DimensionStore::temporary().unwrap();
        let err = store.read(1, DimensionTable::Label, 42, false).unwrap_err();
        assert_eq!(err.to_string(), "row 42 not found in container_1_label");
    }

    #[test]
    fn tables_are_separate() {
        let store = DimensionStore::temporary().unwrap();
        let id = store
            .insert_array(1, DimensionTable::Index, &DimensionArray::positions(2), false)
            .unwrap();
        assert!(store.read(1, DimensionTable::Label, id, false).is_err());
        assert!(store.read(2, DimensionTable::Index, id, false).is_err());
    }

    #[test]
    fn read_filtered_subset() {
        let store = DimensionStore::temporary().unwrap();
        let array = DimensionArray::Short(vec![10, 20, 30, 40, 50, 60]);
        let id = store
            .insert_array(1, DimensionTable::Label, &array, false)
            .unwrap();
        let subset: Subset = "1,3:2:5".parse().unwrap();
        let data = store
            .read_filtered(1, DimensionTable::Label, id, &subset, false, DType::Short, 6)
            .unwrap();
        assert_eq!(
            DimensionArray::Short(vec![10, 30, 50]),
            DimensionArray::from_bytes(DType::Short, &data).unwrap()
        );
    }

    #[test]
    fn read_filtered_index_array() {
        let store = DimensionStore::temporary().unwrap();
        let array = DimensionArray::Float(vec![1.0, 2.0, 3.0, 4.0]);
        let id = store
            .insert_array(1, DimensionTable::Label, &array, true)
            .unwrap();
        let subset = Subset::from_index_array(&DimensionArray::Long(vec![1, 4])).unwrap();
        let data = store
            .read_filtered(1, DimensionTable::Label, id, &subset, true, DType::Float, 4)
            .unwrap();
        assert_eq!(
            DimensionArray::Float(vec![1.0, 4.0]),
            DimensionArray::from_bytes(DType::Float, &data).unwrap()
        );
    }

    #[test]
    fn read_filtered_out_of_domain() {
        let store = DimensionStore::temporary().unwrap();
        let id = store
            .insert_array(1, DimensionTable::Index, &DimensionArray::positions(4), false)
            .unwrap();
        let subset: Subset = "2:5".parse().unwrap();
        let err = store
            .read_filtered(1, DimensionTable::Index, id, &subset, false, DType::Long, 4)
            .unwrap_err();
        assert_eq!(err.to_string(), "subset 2:5 is out of the index domain 1..=4");
    }

    #[test]
    fn read_filtered_wrong_declared_count() {
        let store = DimensionStore::temporary().unwrap();
        let id = store
            .insert_array(1, DimensionTable::Index, &DimensionArray::positions(4), false)
            .unwrap();
        let subset: Subset = "1".parse().unwrap();
        let err = store
            .read_filtered(1, DimensionTable::Index, id, &subset, false, DType::Long, 5)
            .unwrap_err();
        assert_eq!(err.to_string(), "row holds 32 bytes, expected 40");
    }

    #[test]
    fn compare_is_reflexive_for_every_type() {
        let store = DimensionStore::temporary().unwrap();
        for compressed in [false, true] {
            for dtype in test_utils::ALL_DTYPES {
                let array = DimensionArray::from_f64(dtype, &[1.0, -2.0, 3.0]).unwrap();
                let id = store
                    .insert_array(1, DimensionTable::Label, &array, compressed)
                    .unwrap();
                let stored = store
                    .read(1, DimensionTable::Label, id, compressed)
                    .unwrap();
                assert!(store
                    .compare(1, DimensionTable::Label, dtype, 3, &stored, id, compressed)
                    .unwrap());
            }
        }
    }

    #[test]
    fn compare_nan_labels() {
        let store = DimensionStore::temporary().unwrap();
        let array = DimensionArray::Double(vec![f64::NAN, 1.0]);
        let id = store
            .insert_array(1, DimensionTable::Label, &array, false)
            .unwrap();
        assert!(store
            .compare(1, DimensionTable::Label, DType::Double, 2, &array.to_bytes(), id, false)
            .unwrap());
    }

    #[test]
    fn compare_mismatch() {
        let store = DimensionStore::temporary().unwrap();
        let id = store
            .insert_array(1, DimensionTable::Label, &DimensionArray::Int(vec![1, 2, 3]), false)
            .unwrap();
        let other = DimensionArray::Int(vec![1, 2, 4]);
        assert!(!store
            .compare(1, DimensionTable::Label, DType::Int, 3, &other.to_bytes(), id, false)
            .unwrap());
        let shorter = DimensionArray::Int(vec![1, 2]);
        assert!(!store
            .compare(1, DimensionTable::Label, DType::Int, 2, &shorter.to_bytes(), id, false)
            .unwrap());
    }

    #[test]
    fn delete_row() {
        let store = DimensionStore::temporary().unwrap();
        let id = store
            .insert_array(1, DimensionTable::Index, &DimensionArray::positions(2), false)
            .unwrap();
        store.delete(1, DimensionTable::Index, id).unwrap();
        assert_eq!(0, store.row_count(1, DimensionTable::Index).unwrap());
        store.delete(1, DimensionTable::Index, id).unwrap();
    }
}
