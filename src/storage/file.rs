//! Heap-file storage engine
//!
//! Tables live in memory as ordered slot vectors and are persisted to
//! `<table>.tbl` files in the block format of `codec`, plus a JSON catalog
//! (`catalog.json`) mapping table name to file path, row size, and column
//! layout. Internal row ids are slot ordinals (1-based) and survive
//! restarts because tombstoned slots keep their position until
//! `defragment` compacts the file.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use log::{debug, info, warn};
use serde_json::json;

use super::codec::{self, Slot};
use super::{RowPatch, TableStats, TableStore};
use crate::error::{BasaltError, Result};
use crate::types::{ColumnDef, DataType, Row, Rows, TableSchema, Value};

const CATALOG_FILE: &str = "catalog.json";

struct TableData {
    schema: TableSchema,
    slots: Vec<Slot>,
    dirty: bool,
}

impl TableData {
    fn live_rows(&self) -> impl Iterator<Item = (u64, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.deleted)
            .map(|(i, s)| ((i + 1) as u64, s))
    }

    fn coerce(&self, values: Vec<Value>) -> Result<Vec<Value>> {
        if values.len() != self.schema.columns.len() {
            return Err(BasaltError::column_count_mismatch(
                self.schema.columns.len(),
                values.len(),
            ));
        }
        self.schema
            .columns
            .iter()
            .zip(values)
            .map(|(col, v)| {
                col.data_type.coerce(v).map_err(|e| {
                    BasaltError::Type(format!("column '{}': {}", col.name, e))
                })
            })
            .collect()
    }
}

/// File-backed implementation of the storage facade.
pub struct FileStore {
    data_dir: PathBuf,
    tables: Mutex<HashMap<String, TableData>>,
}

impl FileStore {
    /// Open the store, loading the catalog and every table file.
    pub fn open(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir)?;
        let store = Self {
            data_dir,
            tables: Mutex::new(HashMap::new()),
        };
        store.load_catalog()?;
        Ok(store)
    }

    fn catalog_path(&self) -> PathBuf {
        self.data_dir.join(CATALOG_FILE)
    }

    fn table_file(&self, table: &str) -> PathBuf {
        self.data_dir.join(format!("{}.tbl", table))
    }

    fn load_catalog(&self) -> Result<()> {
        let path = self.catalog_path();
        if !path.exists() {
            return Ok(());
        }

        let raw = fs::read_to_string(&path)?;
        let catalog: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| BasaltError::Storage(format!("catalog parse failed: {}", e)))?;
        let entries = catalog
            .as_object()
            .ok_or_else(|| BasaltError::Storage("catalog is not an object".to_string()))?;

        let mut tables = self.tables.lock().expect("storage mutex poisoned");
        for (name, entry) in entries {
            let schema = catalog_entry_to_schema(name, entry)?;
            let file = self.table_file(name);
            let slots = if file.exists() {
                codec::decode_table(&schema, &fs::read(&file)?)?
            } else {
                Vec::new()
            };
            debug!("loaded table '{}' ({} slots)", name, slots.len());
            tables.insert(
                name.clone(),
                TableData {
                    schema,
                    slots,
                    dirty: false,
                },
            );
        }
        info!("catalog loaded: {} table(s)", tables.len());
        Ok(())
    }

    fn save_catalog(&self, tables: &HashMap<String, TableData>) -> Result<()> {
        let mut catalog = serde_json::Map::new();
        for (name, data) in tables {
            catalog.insert(name.clone(), schema_to_catalog_entry(name, &data.schema));
        }
        let rendered = serde_json::to_string_pretty(&serde_json::Value::Object(catalog))?;

        let tmp = self.catalog_path().with_extension("json.tmp");
        fs::write(&tmp, rendered)?;
        fs::rename(&tmp, self.catalog_path())?;
        Ok(())
    }

    fn with_table<T>(&self, table: &str, f: impl FnOnce(&TableData) -> Result<T>) -> Result<T> {
        let tables = self.tables.lock().expect("storage mutex poisoned");
        let data = tables
            .get(&table.to_ascii_lowercase())
            .ok_or_else(|| BasaltError::table_not_found(table))?;
        f(data)
    }

    fn with_table_mut<T>(
        &self,
        table: &str,
        f: impl FnOnce(&mut TableData) -> Result<T>,
    ) -> Result<T> {
        let mut tables = self.tables.lock().expect("storage mutex poisoned");
        let data = tables
            .get_mut(&table.to_ascii_lowercase())
            .ok_or_else(|| BasaltError::table_not_found(table))?;
        f(data)
    }
}

fn schema_to_catalog_entry(name: &str, schema: &TableSchema) -> serde_json::Value {
    let columns: Vec<serde_json::Value> = schema
        .columns
        .iter()
        .map(|c| {
            let (ty, length) = match c.data_type {
                DataType::Int => ("int", 4),
                DataType::Float => ("float", 4),
                DataType::Char(n) => ("char", n as i64),
                DataType::Varchar(n) => ("varchar", n as i64),
            };
            json!({ "name": c.name, "type": ty, "length": length })
        })
        .collect();
    json!({
        "file_path": format!("{}.tbl", name),
        "row_size": codec::max_row_size(schema),
        "columns": columns,
    })
}

fn catalog_entry_to_schema(name: &str, entry: &serde_json::Value) -> Result<TableSchema> {
    let columns = entry
        .get("columns")
        .and_then(|c| c.as_array())
        .ok_or_else(|| BasaltError::Storage(format!("catalog entry for '{}' has no columns", name)))?;

    let mut defs = Vec::with_capacity(columns.len());
    for col in columns {
        let col_name = col
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| BasaltError::Storage("catalog column missing name".to_string()))?;
        let ty = col
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| BasaltError::Storage("catalog column missing type".to_string()))?;
        let length = col.get("length").and_then(|l| l.as_u64()).unwrap_or(0) as u16;

        let data_type = match ty {
            "int" => DataType::Int,
            "float" => DataType::Float,
            "char" => DataType::Char(length),
            "varchar" => DataType::Varchar(length),
            other => {
                return Err(BasaltError::Storage(format!(
                    "unknown catalog type '{}' for column '{}'",
                    other, col_name
                )))
            }
        };
        defs.push(ColumnDef {
            name: col_name.to_string(),
            data_type,
        });
    }

    Ok(TableSchema {
        name: name.to_string(),
        columns: defs,
    })
}

impl TableStore for FileStore {
    fn read_table(&self, table: &str) -> Result<Rows> {
        self.with_table(table, |data| {
            Ok(Rows::new(
                data.schema.column_names(),
                data.live_rows().map(|(_, s)| s.values.clone()).collect(),
            ))
        })
    }

    fn scan(&self, table: &str) -> Result<Vec<Row>> {
        self.with_table(table, |data| {
            Ok(data
                .live_rows()
                .map(|(id, s)| Row::new(id, s.values.clone()))
                .collect())
        })
    }

    fn insert_rows(&self, table: &str, values: Vec<Vec<Value>>) -> Result<Vec<Row>> {
        self.with_table_mut(table, |data| {
            let mut inserted = Vec::with_capacity(values.len());
            for row in values {
                let coerced = data.coerce(row)?;
                data.slots.push(Slot {
                    values: coerced.clone(),
                    deleted: false,
                });
                inserted.push(Row::new(data.slots.len() as u64, coerced));
            }
            data.dirty = true;
            Ok(inserted)
        })
    }

    fn update_rows(&self, table: &str, patches: Vec<RowPatch>) -> Result<Vec<(u64, Row)>> {
        self.with_table_mut(table, |data| {
            let mut replaced = Vec::with_capacity(patches.len());
            for patch in patches {
                let idx = patch.row_id as usize;
                if idx == 0 || idx > data.slots.len() || data.slots[idx - 1].deleted {
                    return Err(BasaltError::Storage(format!(
                        "row {} not found in table '{}'",
                        patch.row_id, table
                    )));
                }
                let coerced = data.coerce(patch.values)?;
                data.slots[idx - 1].deleted = true;
                data.slots.push(Slot {
                    values: coerced.clone(),
                    deleted: false,
                });
                replaced.push((patch.row_id, Row::new(data.slots.len() as u64, coerced)));
            }
            data.dirty = true;
            Ok(replaced)
        })
    }

    fn delete_rows(&self, table: &str, row_ids: &[u64]) -> Result<u64> {
        self.with_table_mut(table, |data| {
            let mut deleted = 0;
            for &row_id in row_ids {
                let idx = row_id as usize;
                if idx == 0 || idx > data.slots.len() {
                    continue;
                }
                if !data.slots[idx - 1].deleted {
                    data.slots[idx - 1].deleted = true;
                    deleted += 1;
                }
            }
            if deleted > 0 {
                data.dirty = true;
            }
            Ok(deleted)
        })
    }

    fn create_table(&self, schema: TableSchema) -> Result<()> {
        let key = schema.name.to_ascii_lowercase();
        let mut tables = self.tables.lock().expect("storage mutex poisoned");
        if tables.contains_key(&key) {
            return Err(BasaltError::table_already_exists(&schema.name));
        }
        info!("creating table '{}'", schema.name);
        tables.insert(
            key,
            TableData {
                schema,
                slots: Vec::new(),
                dirty: true,
            },
        );
        self.save_catalog(&tables)
    }

    fn drop_table(&self, table: &str) -> Result<bool> {
        let key = table.to_ascii_lowercase();
        let mut tables = self.tables.lock().expect("storage mutex poisoned");
        if tables.remove(&key).is_none() {
            return Ok(false);
        }
        info!("dropping table '{}'", table);
        let file = self.table_file(&key);
        if file.exists() {
            if let Err(e) = fs::remove_file(&file) {
                warn!("failed to remove data file for '{}': {}", table, e);
            }
        }
        self.save_catalog(&tables)?;
        Ok(true)
    }

    fn get_row(&self, table: &str, row_id: u64) -> Result<Option<Row>> {
        self.with_table(table, |data| {
            let idx = row_id as usize;
            if idx == 0 || idx > data.slots.len() || data.slots[idx - 1].deleted {
                return Ok(None);
            }
            Ok(Some(Row::new(row_id, data.slots[idx - 1].values.clone())))
        })
    }

    fn restore_row(&self, table: &str, row: Row) -> Result<()> {
        self.with_table_mut(table, |data| {
            let idx = row.id as usize;
            if idx == 0 {
                return Err(BasaltError::Storage("row id 0 is invalid".to_string()));
            }
            // Pad missing slots as tombstones so the restored id keeps its
            // ordinal position.
            while data.slots.len() < idx - 1 {
                data.slots.push(Slot {
                    values: Vec::new(),
                    deleted: true,
                });
            }
            let coerced = data.coerce(row.values)?;
            if data.slots.len() < idx {
                data.slots.push(Slot {
                    values: coerced,
                    deleted: false,
                });
            } else {
                data.slots[idx - 1] = Slot {
                    values: coerced,
                    deleted: false,
                };
            }
            data.dirty = true;
            Ok(())
        })
    }

    fn schema(&self, table: &str) -> Result<TableSchema> {
        self.with_table(table, |data| Ok(data.schema.clone()))
    }

    fn has_table(&self, table: &str) -> bool {
        self.tables
            .lock()
            .expect("storage mutex poisoned")
            .contains_key(&table.to_ascii_lowercase())
    }

    fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .lock()
            .expect("storage mutex poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn flush_all(&self) -> Result<()> {
        let mut tables = self.tables.lock().expect("storage mutex poisoned");
        for (name, data) in tables.iter_mut() {
            if !data.dirty {
                continue;
            }
            let encoded = codec::encode_table(&data.schema, &data.slots)?;
            let path = self.table_file(name);
            let tmp = path.with_extension("tbl.tmp");
            fs::write(&tmp, &encoded)?;
            fs::rename(&tmp, &path)?;
            data.dirty = false;
            debug!("flushed table '{}' ({} bytes)", name, encoded.len());
        }
        self.save_catalog(&tables)
    }

    fn analyze(&self, table: &str) -> Result<TableStats> {
        self.with_table(table, |data| {
            let live = data.slots.iter().filter(|s| !s.deleted).count() as u64;
            let tombstones = data.slots.len() as u64 - live;
            let bytes = codec::encode_table(&data.schema, &data.slots)?.len();
            Ok(TableStats {
                table: data.schema.name.clone(),
                live_rows: live,
                tombstones,
                blocks: (bytes as u64).div_ceil(codec::BLOCK_SIZE as u64),
                row_size: codec::max_row_size(&data.schema) as u64,
            })
        })
    }

    fn defragment(&self, table: &str) -> Result<u64> {
        let reclaimed = self.with_table_mut(table, |data| {
            let before = data.slots.len();
            data.slots.retain(|s| !s.deleted);
            let reclaimed = (before - data.slots.len()) as u64;
            if reclaimed > 0 {
                data.dirty = true;
            }
            Ok(reclaimed)
        })?;
        if reclaimed > 0 {
            info!("defragmented '{}': {} slot(s) reclaimed", table, reclaimed);
            self.flush_all()?;
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn users_schema() -> TableSchema {
        TableSchema {
            name: "users".into(),
            columns: vec![
                ColumnDef {
                    name: "id".into(),
                    data_type: DataType::Int,
                },
                ColumnDef {
                    name: "name".into(),
                    data_type: DataType::Varchar(50),
                },
            ],
        }
    }

    #[test]
    fn test_create_insert_read() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).unwrap();
        store.create_table(users_schema()).unwrap();

        let inserted = store
            .insert_rows(
                "users",
                vec![vec![Value::Int(1), Value::Text("Alice".into())]],
            )
            .unwrap();
        assert_eq!(inserted[0].id, 1);

        let rows = store.read_table("users").unwrap();
        assert_eq!(rows.columns, vec!["id", "name"]);
        assert_eq!(rows.data, vec![vec![Value::Int(1), Value::Text("Alice".into())]]);
    }

    #[test]
    fn test_duplicate_create_fails() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).unwrap();
        store.create_table(users_schema()).unwrap();
        assert!(store.create_table(users_schema()).is_err());
    }

    #[test]
    fn test_update_makes_new_version() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).unwrap();
        store.create_table(users_schema()).unwrap();
        store
            .insert_rows(
                "users",
                vec![vec![Value::Int(1), Value::Text("Alice".into())]],
            )
            .unwrap();

        let replaced = store
            .update_rows(
                "users",
                vec![RowPatch {
                    row_id: 1,
                    values: vec![Value::Int(1), Value::Text("Alicia".into())],
                }],
            )
            .unwrap();
        let (old_id, new_row) = &replaced[0];
        assert_eq!(*old_id, 1);
        assert_eq!(new_row.id, 2);

        // The old version is tombstoned; one live row remains.
        assert!(store.get_row("users", 1).unwrap().is_none());
        let rows = store.read_table("users").unwrap();
        assert_eq!(rows.data.len(), 1);
        assert_eq!(rows.data[0][1], Value::Text("Alicia".into()));
    }

    #[test]
    fn test_delete_tombstones() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).unwrap();
        store.create_table(users_schema()).unwrap();
        store
            .insert_rows(
                "users",
                vec![
                    vec![Value::Int(1), Value::Text("Alice".into())],
                    vec![Value::Int(2), Value::Text("Bob".into())],
                ],
            )
            .unwrap();

        assert_eq!(store.delete_rows("users", &[1, 99]).unwrap(), 1);
        // Second delete of the same row is a no-op.
        assert_eq!(store.delete_rows("users", &[1]).unwrap(), 0);
        assert_eq!(store.read_table("users").unwrap().data.len(), 1);
    }

    #[test]
    fn test_flush_and_reload_keeps_row_ids() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path().to_path_buf()).unwrap();
            store.create_table(users_schema()).unwrap();
            store
                .insert_rows(
                    "users",
                    vec![
                        vec![Value::Int(1), Value::Text("Alice".into())],
                        vec![Value::Int(2), Value::Text("Bob".into())],
                        vec![Value::Int(3), Value::Text("Carol".into())],
                    ],
                )
                .unwrap();
            store.delete_rows("users", &[2]).unwrap();
            store.flush_all().unwrap();
        }

        let store = FileStore::open(dir.path().to_path_buf()).unwrap();
        // The tombstoned slot keeps its position: Carol is still row 3.
        assert!(store.get_row("users", 2).unwrap().is_none());
        let carol = store.get_row("users", 3).unwrap().unwrap();
        assert_eq!(carol.values[1], Value::Text("Carol".into()));
        // New inserts continue after the highest slot.
        let inserted = store
            .insert_rows("users", vec![vec![Value::Int(4), Value::Text("Dan".into())]])
            .unwrap();
        assert_eq!(inserted[0].id, 4);
    }

    #[test]
    fn test_defragment_reclaims_tombstones() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).unwrap();
        store.create_table(users_schema()).unwrap();
        store
            .insert_rows(
                "users",
                vec![
                    vec![Value::Int(1), Value::Text("Alice".into())],
                    vec![Value::Int(2), Value::Text("Bob".into())],
                ],
            )
            .unwrap();
        store.delete_rows("users", &[1]).unwrap();

        let stats = store.analyze("users").unwrap();
        assert_eq!(stats.live_rows, 1);
        assert_eq!(stats.tombstones, 1);

        assert_eq!(store.defragment("users").unwrap(), 1);
        let stats = store.analyze("users").unwrap();
        assert_eq!(stats.tombstones, 0);
        // Ids were reassigned by compaction.
        assert_eq!(store.get_row("users", 1).unwrap().unwrap().values[0], Value::Int(2));
    }

    #[test]
    fn test_restore_row_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).unwrap();
        store.create_table(users_schema()).unwrap();

        let row = Row::new(1, vec![Value::Int(1), Value::Text("Alice".into())]);
        store.restore_row("users", row.clone()).unwrap();
        store.restore_row("users", row).unwrap();

        assert_eq!(store.read_table("users").unwrap().data.len(), 1);
    }

    #[test]
    fn test_type_validation_on_insert() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).unwrap();
        store.create_table(users_schema()).unwrap();

        // Wrong arity
        assert!(store
            .insert_rows("users", vec![vec![Value::Int(1)]])
            .is_err());
        // Wrong type
        assert!(store
            .insert_rows(
                "users",
                vec![vec![Value::Text("x".into()), Value::Text("y".into())]]
            )
            .is_err());
        // NULL not storable
        assert!(store
            .insert_rows("users", vec![vec![Value::Int(1), Value::Null]])
            .is_err());
    }

    #[test]
    fn test_drop_table_removes_file() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).unwrap();
        store.create_table(users_schema()).unwrap();
        store.flush_all().unwrap();
        assert!(dir.path().join("users.tbl").exists());

        assert!(store.drop_table("users").unwrap());
        assert!(!dir.path().join("users.tbl").exists());
        assert!(!store.drop_table("users").unwrap());
    }
}
