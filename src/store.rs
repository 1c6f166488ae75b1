// 💾 Table Store - generated FBA/FBS tables keyed by (name, year, format version)
//
// Tables are written whole. Each save records a SHA-256 fingerprint of the
// rows, the run that produced them and when.

use crate::aggregation::AggregatedFlow;
use crate::error::{FlowsaError, Result};
use crate::flow::{fingerprint, FlowRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

// ============================================================================
// KEYS + METADATA
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableKind {
    FlowByActivity,
    FlowBySector,
}

impl TableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableKind::FlowByActivity => "FBA",
            TableKind::FlowBySector => "FBS",
        }
    }

    fn parse(s: &str) -> Option<TableKind> {
        match s {
            "FBA" => Some(TableKind::FlowByActivity),
            "FBS" => Some(TableKind::FlowBySector),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreKey {
    /// Dataset name for FBA tables, method name for FBS tables
    pub name: String,
    pub year: i32,
    pub format_version: String,
}

impl StoreKey {
    pub fn new(name: &str, year: i32, format_version: &str) -> Self {
        StoreKey {
            name: name.to_string(),
            year,
            format_version: format_version.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub kind: TableKind,
    pub key: StoreKey,
    pub fingerprint: String,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub row_count: usize,
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Persistence for generated tables. Implementations serialise their own
/// writes so parallel units can share one store.
pub trait FlowStore: Send + Sync {
    /// Stored rows as a JSON array, if present
    fn load_json(&self, kind: TableKind, key: &StoreKey) -> Result<Option<String>>;

    /// Replace the table stored under `meta.kind` / `meta.key`
    fn save_json(&self, meta: &TableMeta, rows_json: &str) -> Result<()>;

    fn list_tables(&self) -> Result<Vec<TableMeta>>;

    fn load_fba(&self, key: &StoreKey) -> Result<Option<Vec<FlowRecord>>> {
        load_typed(self, TableKind::FlowByActivity, key)
    }

    fn save_fba(&self, key: &StoreKey, rows: &[FlowRecord], run_id: Uuid) -> Result<TableMeta> {
        save_typed(self, TableKind::FlowByActivity, key, rows, run_id)
    }

    fn load_fbs(&self, key: &StoreKey) -> Result<Option<Vec<AggregatedFlow>>> {
        load_typed(self, TableKind::FlowBySector, key)
    }

    fn save_fbs(&self, key: &StoreKey, rows: &[AggregatedFlow], run_id: Uuid) -> Result<TableMeta> {
        save_typed(self, TableKind::FlowBySector, key, rows, run_id)
    }
}

fn load_typed<S, T>(store: &S, kind: TableKind, key: &StoreKey) -> Result<Option<Vec<T>>>
where
    S: FlowStore + ?Sized,
    T: DeserializeOwned,
{
    match store.load_json(kind, key)? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

fn save_typed<S, T>(store: &S, kind: TableKind, key: &StoreKey, rows: &[T], run_id: Uuid) -> Result<TableMeta>
where
    S: FlowStore + ?Sized,
    T: Serialize,
{
    let meta = TableMeta {
        kind,
        key: key.clone(),
        fingerprint: fingerprint(rows)?,
        run_id,
        created_at: Utc::now(),
        row_count: rows.len(),
    };
    let json = serde_json::to_string(rows)?;
    store.save_json(&meta, &json)?;
    debug!(
        kind = kind.as_str(),
        name = %key.name,
        year = key.year,
        rows = rows.len(),
        "stored table"
    );
    Ok(meta)
}

fn poisoned<E>(_: E) -> FlowsaError {
    FlowsaError::Store("store lock poisoned".to_string())
}

// ============================================================================
// SQLITE STORE
// ============================================================================

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS flow_tables (
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            year INTEGER NOT NULL,
            format_version TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            run_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            row_count INTEGER NOT NULL,
            rows TEXT NOT NULL,
            PRIMARY KEY (kind, name, year, format_version)
        )",
        [],
    )?;

    Ok(())
}

impl FlowStore for SqliteStore {
    fn load_json(&self, kind: TableKind, key: &StoreKey) -> Result<Option<String>> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let rows = conn
            .query_row(
                "SELECT rows FROM flow_tables
                 WHERE kind = ?1 AND name = ?2 AND year = ?3 AND format_version = ?4",
                params![kind.as_str(), key.name, key.year, key.format_version],
                |row| row.get(0),
            )
            .optional()?;
        Ok(rows)
    }

    fn save_json(&self, meta: &TableMeta, rows_json: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute(
            "INSERT OR REPLACE INTO flow_tables
                (kind, name, year, format_version, fingerprint, run_id, created_at, row_count, rows)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                meta.kind.as_str(),
                meta.key.name,
                meta.key.year,
                meta.key.format_version,
                meta.fingerprint,
                meta.run_id.to_string(),
                meta.created_at.to_rfc3339(),
                meta.row_count as i64,
                rows_json,
            ],
        )?;
        Ok(())
    }

    fn list_tables(&self) -> Result<Vec<TableMeta>> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT kind, name, year, format_version, fingerprint, run_id, created_at, row_count
             FROM flow_tables
             ORDER BY kind, name, year",
        )?;

        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    StoreKey {
                        name: row.get(1)?,
                        year: row.get(2)?,
                        format_version: row.get(3)?,
                    },
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(kind, key, fingerprint, run_id, created_at, row_count)| {
                let kind = TableKind::parse(&kind)
                    .ok_or_else(|| FlowsaError::Store(format!("unknown table kind {:?}", kind)))?;
                let run_id = Uuid::parse_str(&run_id)
                    .map_err(|e| FlowsaError::Store(format!("bad run id {:?}: {}", run_id, e)))?;
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| FlowsaError::Store(format!("bad timestamp {:?}: {}", created_at, e)))?
                    .with_timezone(&Utc);
                Ok(TableMeta {
                    kind,
                    key,
                    fingerprint,
                    run_id,
                    created_at,
                    row_count: row_count as usize,
                })
            })
            .collect()
    }
}

// ============================================================================
// MEMORY STORE
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<(TableKind, StoreKey), (TableMeta, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlowStore for MemoryStore {
    fn load_json(&self, kind: TableKind, key: &StoreKey) -> Result<Option<String>> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables.get(&(kind, key.clone())).map(|(_, json)| json.clone()))
    }

    fn save_json(&self, meta: &TableMeta, rows_json: &str) -> Result<()> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        tables.insert((meta.kind, meta.key.clone()), (meta.clone(), rows_json.to_string()));
        Ok(())
    }

    fn list_tables(&self) -> Result<Vec<TableMeta>> {
        let tables = self.tables.read().map_err(poisoned)?;
        let mut metas: Vec<TableMeta> = tables.values().map(|(meta, _)| meta.clone()).collect();
        metas.sort_by(|a, b| {
            (a.kind.as_str(), &a.key.name, a.key.year).cmp(&(b.kind.as_str(), &b.key.name, b.key.year))
        });
        Ok(metas)
    }
}

// ============================================================================
// CSV EXPORT
// ============================================================================

/// Write rows as a flat CSV table with FBA/FBS column names
pub fn write_csv<T: Serialize, P: AsRef<Path>>(path: P, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path.as_ref())?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a Flow-By-Activity CSV written by `write_csv`
pub fn read_fba_csv<P: AsRef<Path>>(path: P) -> Result<Vec<FlowRecord>> {
    let mut reader = csv::Reader::from_path(path.as_ref())?;
    let rows = reader
        .deserialize::<FlowRecord>()
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowAmount;
    use tempfile::tempdir;

    fn rows() -> Vec<FlowRecord> {
        vec![
            FlowRecord::new("Land", "USDA_ERS_MLU", "Land Use", 120.5, "Acres", "00000", 2012)
                .with_produced_by("Cropland used for crops"),
            FlowRecord::new("Land", "USDA_ERS_MLU", "Land Use", 0.0, "Acres", "06000", 2012)
                .with_produced_by("Forest-use land")
                .withdrawn(),
        ]
    }

    fn exercise(store: &dyn FlowStore) {
        let key = StoreKey::new("USDA_ERS_MLU", 2012, "1.0.0");
        assert!(store.load_fba(&key).unwrap().is_none());

        let run_id = Uuid::new_v4();
        let meta = store.save_fba(&key, &rows(), run_id).unwrap();
        assert_eq!(meta.row_count, 2);
        assert_eq!(meta.fingerprint, fingerprint(&rows()).unwrap());

        let back = store.load_fba(&key).unwrap().unwrap();
        assert_eq!(back, rows());
        assert!(back[1].flow_amount.is_withdrawn());

        // other format versions are separate tables
        assert!(store.load_fba(&StoreKey::new("USDA_ERS_MLU", 2012, "2.0.0")).unwrap().is_none());
        // and FBS tables live apart from FBA tables
        assert!(store.load_fbs(&key).unwrap().is_none());

        let listed = store.list_tables().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].run_id, run_id);
        assert_eq!(listed[0].kind, TableKind::FlowByActivity);
    }

    #[test]
    fn test_sqlite_store() {
        let store = SqliteStore::open_in_memory().unwrap();
        exercise(&store);
        println!("✅ SQLite store round trip PASSED");
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_sqlite_store_on_disk_replaces_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("output/flowsa.db");
        let key = StoreKey::new("USDA_ERS_MLU", 2012, "1.0.0");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_fba(&key, &rows(), Uuid::new_v4()).unwrap();
            store.save_fba(&key, &rows()[..1], Uuid::new_v4()).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load_fba(&key).unwrap().unwrap().len(), 1);
        assert_eq!(store.list_tables().unwrap().len(), 1);
    }

    #[test]
    fn test_csv_export() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fba.csv");
        write_csv(&path, &rows()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Class,SourceName,FlowName,FlowAmount,Unit"));
        assert!(text.contains(",W,"));

        let back = read_fba_csv(&path).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].flow_amount, FlowAmount::Value(120.5));
        assert!(back[1].flow_amount.is_withdrawn());
        assert_eq!(back[1].location, "06000");
        assert_eq!(back[0].description, None);
    }
}
