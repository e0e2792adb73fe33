//! In-process destination with the same upsert semantics as the PostgreSQL
//! store. Backs `--dry-run` and the loader tests.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use sffire_core::CanonicalRow;

use crate::{IncidentStore, StoreConnector, TableRef};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredIncident {
    pub row: CanonicalRow,
    /// Mirrors the `_loaded_at` column.
    pub loaded_at: NaiveDateTime,
    pub writes: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    schemas: BTreeSet<String>,
    tables: BTreeMap<String, BTreeMap<String, StoredIncident>>,
    indexes: BTreeSet<String>,
    events: Vec<String>,
    connections: usize,
    open_stores: usize,
}

/// Hands out [`MemoryStore`]s that all share one set of tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rows of `target` ordered by id.
    pub fn rows(&self, target: &TableRef) -> Vec<StoredIncident> {
        self.state()
            .tables
            .get(&target.to_string())
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, target: &TableRef, id: &str) -> Option<StoredIncident> {
        self.state()
            .tables
            .get(&target.to_string())
            .and_then(|rows| rows.get(id).cloned())
    }

    pub fn indexes(&self) -> Vec<String> {
        self.state().indexes.iter().cloned().collect()
    }

    /// Every store operation in the order it happened.
    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    pub fn connections(&self) -> usize {
        self.state().connections
    }

    /// Stores handed out and not yet closed.
    pub fn open_stores(&self) -> usize {
        self.state().open_stores
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    type Store = MemoryStore;

    async fn connect(&self) -> Result<MemoryStore, sqlx::Error> {
        let mut state = self.state();
        state.connections += 1;
        state.open_stores += 1;
        Ok(MemoryStore {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn describe(&self) -> String {
        "in-memory destination".to_string()
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    closed: AtomicBool,
}

impl MemoryStore {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn missing_table(target: &TableRef) -> sqlx::Error {
    sqlx::Error::Protocol(format!("relation {target} does not exist"))
}

#[async_trait]
impl IncidentStore for MemoryStore {
    async fn prepare_schema(&self, schema: &str) -> Result<(), sqlx::Error> {
        let mut state = self.state();
        state.schemas.insert(schema.to_string());
        state.events.push(format!("schema {schema}"));
        Ok(())
    }

    async fn ensure_table(&self, target: &TableRef) -> Result<(), sqlx::Error> {
        let mut state = self.state();
        if !state.schemas.contains(target.schema()) {
            return Err(sqlx::Error::Protocol(format!(
                "schema {} does not exist",
                target.schema()
            )));
        }
        state.tables.entry(target.to_string()).or_default();
        state.events.push(format!("table {target}"));
        Ok(())
    }

    async fn upsert_batch(
        &self,
        target: &TableRef,
        rows: &[CanonicalRow],
    ) -> Result<u64, sqlx::Error> {
        let mut seen = HashSet::new();
        if let Some(dup) = rows.iter().find(|row| !seen.insert(row.id.as_str())) {
            return Err(sqlx::Error::Protocol(format!(
                "ON CONFLICT DO UPDATE command cannot affect row a second time (id {})",
                dup.id
            )));
        }

        let mut state = self.state();
        let now = Utc::now().naive_utc();
        let table = state
            .tables
            .get_mut(&target.to_string())
            .ok_or_else(|| missing_table(target))?;
        for row in rows {
            let writes = table.get(&row.id).map_or(0, |existing| existing.writes) + 1;
            table.insert(
                row.id.clone(),
                StoredIncident {
                    row: row.clone(),
                    loaded_at: now,
                    writes,
                },
            );
        }
        state.events.push(format!("upsert {}", rows.len()));
        Ok(rows.len() as u64)
    }

    async fn create_index(&self, target: &TableRef, column: &str) -> Result<(), sqlx::Error> {
        let mut state = self.state();
        if !state.tables.contains_key(&target.to_string()) {
            return Err(missing_table(target));
        }
        let name = target.index_name(column);
        state.indexes.insert(name.clone());
        state.events.push(format!("index {name}"));
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state().open_stores -= 1;
        }
    }
}
