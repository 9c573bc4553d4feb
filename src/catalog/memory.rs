use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use super::{
    Catalog, CatalogApiError, CatalogResult, Lease, PartitionEntry, TableRecord, next_version,
};

type TableKey = (String, String);

#[derive(Debug, Default)]
struct MemoryState {
    databases: BTreeSet<String>,
    tables: BTreeMap<TableKey, TableRecord>,
    leases: HashMap<TableKey, Lease>,
}

/// In-process catalog guarded by a single mutex.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<MemoryState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> CatalogResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| CatalogApiError::Unavailable("catalog state poisoned".to_string()))
    }
}

fn key(database: &str, table: &str) -> TableKey {
    (database.to_string(), table.to_string())
}

fn check_version(current: &TableRecord, expected: u64) -> CatalogResult<()> {
    if current.version != expected {
        return Err(CatalogApiError::VersionMismatch {
            table: current.qualified_name(),
            expected,
            actual: current.version,
        });
    }
    Ok(())
}

impl Catalog for MemoryCatalog {
    fn create_database(&self, name: &str) -> CatalogResult<bool> {
        Ok(self.state()?.databases.insert(name.to_string()))
    }

    fn get_table(&self, database: &str, table: &str) -> CatalogResult<Option<TableRecord>> {
        Ok(self.state()?.tables.get(&key(database, table)).cloned())
    }

    fn create_table(&self, record: TableRecord) -> CatalogResult<TableRecord> {
        let mut state = self.state()?;
        if !state.databases.contains(&record.database) {
            return Err(CatalogApiError::NotFound {
                what: format!("database {}", record.database),
            });
        }
        let table_key = key(&record.database, &record.name);
        if state.tables.contains_key(&table_key) {
            return Err(CatalogApiError::AlreadyExists {
                what: format!("table {}", record.qualified_name()),
            });
        }
        let record = next_version(record, 1);
        state.tables.insert(table_key, record.clone());
        Ok(record)
    }

    fn replace_table(
        &self,
        record: TableRecord,
        expected_version: u64,
    ) -> CatalogResult<TableRecord> {
        let mut state = self.state()?;
        let current = state
            .tables
            .get_mut(&key(&record.database, &record.name))
            .ok_or_else(|| CatalogApiError::NotFound {
                what: format!("table {}", record.qualified_name()),
            })?;
        check_version(current, expected_version)?;
        *current = next_version(record, expected_version + 1);
        Ok(current.clone())
    }

    fn add_partition(
        &self,
        database: &str,
        table: &str,
        partition: PartitionEntry,
        expected_version: u64,
    ) -> CatalogResult<TableRecord> {
        let mut state = self.state()?;
        let current = state
            .tables
            .get_mut(&key(database, table))
            .ok_or_else(|| CatalogApiError::NotFound {
                what: format!("table {database}.{table}"),
            })?;
        if current.partition(&partition.values).is_some() {
            return Ok(current.clone());
        }
        check_version(current, expected_version)?;
        let mut updated = current.clone();
        updated.partitions.push(partition);
        *current = next_version(updated, expected_version + 1);
        Ok(current.clone())
    }

    fn list_tables(&self, database: &str) -> CatalogResult<Vec<String>> {
        Ok(self
            .state()?
            .tables
            .keys()
            .filter(|(db, _)| db == database)
            .map(|(_, table)| table.clone())
            .collect())
    }

    fn try_acquire_lease(
        &self,
        database: &str,
        table: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> CatalogResult<Lease> {
        let mut state = self.state()?;
        let table_key = key(database, table);
        if let Some(existing) = state.leases.get(&table_key)
            && !existing.is_expired()
        {
            return Err(CatalogApiError::LeaseHeld {
                table: format!("{database}.{table}"),
                holder: existing.holder_id.clone(),
                expires_at: existing.expires_at,
            });
        }
        let lease = Lease::new(holder_id, format!("{database}.{table}"), ttl);
        state.leases.insert(table_key, lease.clone());
        Ok(lease)
    }

    fn release_lease(&self, database: &str, table: &str, holder_id: &str) -> CatalogResult<()> {
        let mut state = self.state()?;
        let table_key = key(database, table);
        if state
            .leases
            .get(&table_key)
            .is_some_and(|lease| lease.holder_id == holder_id)
        {
            state.leases.remove(&table_key);
        }
        Ok(())
    }
}
