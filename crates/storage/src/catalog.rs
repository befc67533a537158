use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, RwLock};

use arrow::array::Int64Array;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use fq_common::{FqError, Result};
use serde::{Deserialize, Serialize};

use crate::memory::MemoryStorage;
use crate::storage::Storage;

/// Name of the one-row table read by queries without FROM.
pub const SYSTEM_ONE: &str = "system.one";

/// Column declaration of a catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub nullable: bool,
}

/// Table declaration of a catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Makes the table managed, at this schema version.
    #[serde(default)]
    pub schema_version: Option<i64>,
}

/// Registry of tables by name; shared by every query of a context.
#[derive(Default)]
pub struct Catalog {
    tables: RwLock<HashMap<String, Arc<dyn Storage>>>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read().expect("catalog lock poisoned");
        let mut names = tables.keys().collect::<Vec<_>>();
        names.sort();
        f.debug_struct("Catalog").field("tables", &names).finish()
    }
}

impl Catalog {
    /// Catalog holding only [`SYSTEM_ONE`].
    pub fn new() -> Self {
        let cat = Self::default();
        cat.register(SYSTEM_ONE, Arc::new(system_one()));
        cat
    }

    /// Adds or replaces a table.
    pub fn register(&self, name: impl Into<String>, storage: Arc<dyn Storage>) {
        self.tables
            .write()
            .expect("catalog lock poisoned")
            .insert(name.into(), storage);
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Storage>> {
        self.tables.write().expect("catalog lock poisoned").remove(name)
    }

    pub fn try_get(&self, name: &str) -> Option<Arc<dyn Storage>> {
        self.tables
            .read()
            .expect("catalog lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Storage>> {
        self.try_get(name)
            .ok_or_else(|| FqError::Planning(format!("unknown table: {name}")))
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names = self
            .tables
            .read()
            .expect("catalog lock poisoned")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Loads empty in-memory tables declared in a JSON array of [`TableDef`].
    pub fn load_from_json(path: &str) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_json_str(&s)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let tables: Vec<TableDef> =
            serde_json::from_str(s).map_err(|e| FqError::InvalidConfig(e.to_string()))?;
        let cat = Catalog::new();
        for t in tables {
            let fields = t
                .columns
                .iter()
                .map(|c| Field::new(&c.name, c.data_type.clone(), c.nullable))
                .collect::<Vec<_>>();
            let mut storage = MemoryStorage::new(t.name.clone(), Arc::new(Schema::new(fields)));
            if let Some(version) = t.schema_version {
                storage = storage.with_schema_version(version);
            }
            cat.register(t.name, Arc::new(storage));
        }
        Ok(cat)
    }
}

fn system_one() -> MemoryStorage {
    let schema = Arc::new(Schema::new(vec![Field::new("dummy", DataType::Int64, false)]));
    let one = MemoryStorage::new(SYSTEM_ONE, schema.clone());
    if let Ok(batch) = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![0]))]) {
        // The batch matches the schema built above.
        let _ = one.insert(batch);
    }
    one
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_one_has_a_single_row() {
        let cat = Catalog::new();
        let one = cat.get(SYSTEM_ONE).expect("system.one");
        assert_eq!(one.column_names(), vec!["dummy".to_string()]);
        assert!(cat.try_get("nope").is_none());
        assert!(matches!(cat.get("nope"), Err(FqError::Planning(_))));
    }

    #[test]
    fn tables_load_from_json() {
        let cat = Catalog::from_json_str(
            r#"[
                {"name": "hits", "columns": [
                    {"name": "id", "data_type": "Int64"},
                    {"name": "url", "data_type": "Utf8", "nullable": true}
                ], "schema_version": 3}
            ]"#,
        )
        .expect("catalog");
        let hits = cat.get("hits").expect("hits");
        assert_eq!(hits.column_names(), vec!["id".to_string(), "url".to_string()]);
        assert_eq!(hits.managed_schema_version(), Some(3));
        assert_eq!(cat.table_names(), vec!["hits".to_string(), SYSTEM_ONE.to_string()]);
    }

    #[test]
    fn bad_json_is_a_config_error() {
        assert!(matches!(
            Catalog::from_json_str("{"),
            Err(FqError::InvalidConfig(_))
        ));
    }
}
