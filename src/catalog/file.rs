//! Catalog persisted as JSON documents on the local filesystem.
//!
//! Layout:
//!   <root>/<database>/                       database marker directory
//!   <root>/<database>/<table>/0000000001.json one full TableRecord per version
//!   <root>/_leases/<database>/<table>/0000000001.json lease generations
//!
//! Version files are created with create-new semantics, so two writers racing
//! from the same expected version cannot both commit: the loser sees the
//! file already present and gets `VersionMismatch`. The latest version file
//! is the table's current state.
//!
//! Leases follow the same scheme. Acquiring, taking over an expired lease and
//! releasing each create the next generation, so of two racing callers that
//! read the same generation only one can act on it. A release is recorded as
//! an already-expired lease. Lease directories live outside the database
//! directories and never create a database as a side effect.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use log::debug;

use super::{
    Catalog, CatalogApiError, CatalogResult, Lease, PartitionEntry, TableRecord, next_version,
};
use crate::naming::is_catalog_identifier;

const VERSION_DIGITS: usize = 10;
/// Not a valid catalog identifier, so it cannot collide with a database.
const LEASE_ROOT: &str = "_leases";

#[derive(Debug, Clone)]
pub struct FileCatalog {
    root: PathBuf,
}

fn io_error(path: &Path, source: io::Error) -> CatalogApiError {
    CatalogApiError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn checked(name: &str) -> CatalogResult<&str> {
    if is_catalog_identifier(name) {
        Ok(name)
    } else {
        Err(CatalogApiError::InvalidName(name.to_string()))
    }
}

impl FileCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileCatalog { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn database_dir(&self, database: &str) -> CatalogResult<PathBuf> {
        Ok(self.root.join(checked(database)?))
    }

    fn table_dir(&self, database: &str, table: &str) -> CatalogResult<PathBuf> {
        Ok(self.database_dir(database)?.join(checked(table)?))
    }

    fn version_path(dir: &Path, version: u64) -> PathBuf {
        dir.join(format!("{:0width$}.json", version, width = VERSION_DIGITS))
    }

    fn latest_version(dir: &Path) -> CatalogResult<Option<u64>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(dir, err)),
        };
        let mut latest = None;
        for entry in entries {
            let entry = entry.map_err(|err| io_error(dir, err))?;
            let name = entry.file_name();
            let Some(version) = name
                .to_str()
                .and_then(|name| name.strip_suffix(".json"))
                .filter(|stem| stem.len() == VERSION_DIGITS)
                .and_then(|stem| stem.parse::<u64>().ok())
            else {
                continue;
            };
            latest = latest.max(Some(version));
        }
        Ok(latest)
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> CatalogResult<Option<T>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| CatalogApiError::Corrupt {
                path: path.display().to_string(),
                message: err.to_string(),
            })
    }

    fn read_record(dir: &Path) -> CatalogResult<Option<TableRecord>> {
        match Self::latest_version(dir)? {
            Some(version) => Self::read_json(&Self::version_path(dir, version)),
            None => Ok(None),
        }
    }

    /// Writes `contents` to `target` only if it does not exist yet.
    ///
    /// The payload is fully written to a temporary file first and then
    /// hard-linked into place, so the target never appears half-written.
    fn create_new(target: &Path, contents: &[u8]) -> io::Result<()> {
        let tmp = target.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let result = File::create(&tmp)
            .and_then(|mut file| {
                file.write_all(contents)?;
                file.sync_all()
            })
            .and_then(|_| fs::hard_link(&tmp, target));
        let _ = fs::remove_file(&tmp);
        result
    }

    fn commit(&self, record: TableRecord, version: u64) -> CatalogResult<TableRecord> {
        let dir = self.table_dir(&record.database, &record.name)?;
        fs::create_dir_all(&dir).map_err(|err| io_error(&dir, err))?;
        let record = next_version(record, version);
        let payload = serde_json::to_vec_pretty(&record).map_err(|err| CatalogApiError::Corrupt {
            path: dir.display().to_string(),
            message: err.to_string(),
        })?;
        let path = Self::version_path(&dir, version);
        match Self::create_new(&path, &payload) {
            Ok(()) => {
                debug!("Committed {} at version {version}", record.qualified_name());
                Ok(record)
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let actual = Self::latest_version(&dir)?.unwrap_or(version);
                Err(CatalogApiError::VersionMismatch {
                    table: record.qualified_name(),
                    expected: version - 1,
                    actual,
                })
            }
            Err(err) => Err(io_error(&path, err)),
        }
    }

    fn current(&self, database: &str, table: &str) -> CatalogResult<TableRecord> {
        let dir = self.table_dir(database, table)?;
        Self::read_record(&dir)?.ok_or_else(|| CatalogApiError::NotFound {
            what: format!("table {database}.{table}"),
        })
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

    fn lease_dir(&self, database: &str, table: &str) -> CatalogResult<PathBuf> {
        Ok(self
            .root
            .join(LEASE_ROOT)
            .join(checked(database)?)
            .join(checked(table)?))
    }

    /// Latest lease generation (`0` when none) and its lease. A generation
    /// pruned while being read yields `None`, which makes the caller's next
    /// create fail.
    fn current_lease(dir: &Path) -> CatalogResult<(u64, Option<Lease>)> {
        match Self::latest_version(dir)? {
            Some(generation) => Ok((
                generation,
                Self::read_json(&Self::version_path(dir, generation))?,
            )),
            None => Ok((0, None)),
        }
    }

    /// Writes `lease` as `generation`; `false` when another caller got there
    /// first.
    fn write_lease(dir: &Path, generation: u64, lease: &Lease) -> CatalogResult<bool> {
        let path = Self::version_path(dir, generation);
        let payload = serde_json::to_vec(lease).map_err(|err| CatalogApiError::Corrupt {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        match Self::create_new(&path, &payload) {
            Ok(()) => {
                if generation > 1 {
                    let _ = fs::remove_file(Self::version_path(dir, generation - 1));
                }
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(io_error(&path, err)),
        }
    }
}

impl Catalog for FileCatalog {
    fn create_database(&self, name: &str) -> CatalogResult<bool> {
        let dir = self.database_dir(name)?;
        fs::create_dir_all(&self.root).map_err(|err| io_error(&self.root, err))?;
        match fs::create_dir(&dir) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(io_error(&dir, err)),
        }
    }

    fn get_table(&self, database: &str, table: &str) -> CatalogResult<Option<TableRecord>> {
        Self::read_record(&self.table_dir(database, table)?)
    }

    fn create_table(&self, record: TableRecord) -> CatalogResult<TableRecord> {
        let db_dir = self.database_dir(&record.database)?;
        if !db_dir.is_dir() {
            return Err(CatalogApiError::NotFound {
                what: format!("database {}", record.database),
            });
        }
        let qualified = record.qualified_name();
        match self.commit(record, 1) {
            Err(CatalogApiError::VersionMismatch { .. }) => Err(CatalogApiError::AlreadyExists {
                what: format!("table {qualified}"),
            }),
            other => other,
        }
    }

    fn replace_table(
        &self,
        record: TableRecord,
        expected_version: u64,
    ) -> CatalogResult<TableRecord> {
        let current = self.current(&record.database, &record.name)?;
        Self::check_version(&current, expected_version)?;
        self.commit(record, expected_version + 1)
    }

    fn add_partition(
        &self,
        database: &str,
        table: &str,
        partition: PartitionEntry,
        expected_version: u64,
    ) -> CatalogResult<TableRecord> {
        let current = self.current(database, table)?;
        if current.partition(&partition.values).is_some() {
            return Ok(current);
        }
        Self::check_version(&current, expected_version)?;
        let mut updated = current;
        updated.partitions.push(partition);
        self.commit(updated, expected_version + 1)
    }

    fn list_tables(&self, database: &str) -> CatalogResult<Vec<String>> {
        let dir = self.database_dir(database)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&dir, err)),
        };
        let mut tables = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_error(&dir, err))?;
            if let Some(name) = entry.file_name().to_str()
                && Self::latest_version(&entry.path())?.is_some()
            {
                tables.push(name.to_string());
            }
        }
        tables.sort();
        Ok(tables)
    }

    fn try_acquire_lease(
        &self,
        database: &str,
        table: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> CatalogResult<Lease> {
        let dir = self.lease_dir(database, table)?;
        fs::create_dir_all(&dir).map_err(|err| io_error(&dir, err))?;
        let (generation, current) = Self::current_lease(&dir)?;
        let lease = Lease::new(holder_id, format!("{database}.{table}"), ttl);
        if let Some(existing) = &current {
            if !existing.is_expired() {
                return Err(CatalogApiError::LeaseHeld {
                    table: lease.table,
                    holder: existing.holder_id.clone(),
                    expires_at: existing.expires_at,
                });
            }
            // Released leases expire the moment they are written.
            if existing.expires_at > existing.acquired_at {
                debug!(
                    "Taking over expired lease on {database}.{table} from {}",
                    existing.holder_id
                );
            }
        }
        if Self::write_lease(&dir, generation + 1, &lease)? {
            return Ok(lease);
        }
        Err(CatalogApiError::LeaseHeld {
            table: lease.table,
            holder: "unknown".to_string(),
            expires_at: lease.acquired_at,
        })
    }

    fn release_lease(&self, database: &str, table: &str, holder_id: &str) -> CatalogResult<()> {
        let dir = self.lease_dir(database, table)?;
        match Self::current_lease(&dir)? {
            (generation, Some(existing)) if existing.holder_id == holder_id => {
                let released = Lease::new(holder_id, existing.table, Duration::ZERO);
                // Losing the race means the lease was already taken over.
                Self::write_lease(&dir, generation + 1, &released)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support;
    use std::{sync::Arc, thread};
    use tempfile::TempDir;

    #[test]
    fn file_catalog_satisfies_the_catalog_contract() {
        let dir = TempDir::new().unwrap();
        test_support::exercise_catalog(&FileCatalog::new(dir.path()));
    }

    #[test]
    fn every_commit_is_kept_as_a_version_file() {
        let dir = TempDir::new().unwrap();
        let catalog = FileCatalog::new(dir.path());
        catalog.create_database("sales").unwrap();
        let created = catalog
            .create_table(test_support::record("sales", "orders", "s3://lake/a/"))
            .unwrap();
        catalog.replace_table(created, 1).unwrap();
        let table_dir = dir.path().join("sales").join("orders");
        assert!(table_dir.join("0000000001.json").is_file());
        assert!(table_dir.join("0000000002.json").is_file());

        let reopened = FileCatalog::new(dir.path());
        let record = reopened.get_table("sales", "orders").unwrap().unwrap();
        assert_eq!(record.version, 2);
    }

    #[test]
    fn racing_commits_from_the_same_version_conflict() {
        let dir = TempDir::new().unwrap();
        let catalog = FileCatalog::new(dir.path());
        catalog.create_database("sales").unwrap();
        let created = catalog
            .create_table(test_support::record("sales", "orders", "s3://lake/a/"))
            .unwrap();
        // Both writers read version 1; the second commit must not land.
        catalog.commit(created.clone(), 2).unwrap();
        let err = catalog.commit(created, 2).unwrap_err();
        assert!(matches!(err, CatalogApiError::VersionMismatch { actual: 2, .. }));
    }

    #[test]
    fn illegal_names_never_touch_the_filesystem() {
        let dir = TempDir::new().unwrap();
        let catalog = FileCatalog::new(dir.path());
        assert!(matches!(
            catalog.create_database("../escape"),
            Err(CatalogApiError::InvalidName(_))
        ));
        assert!(catalog.get_table("sales", "a/b").is_err());
    }

    #[test]
    fn corrupt_documents_are_reported() {
        let dir = TempDir::new().unwrap();
        let catalog = FileCatalog::new(dir.path());
        catalog.create_database("sales").unwrap();
        let table_dir = dir.path().join("sales").join("orders");
        fs::create_dir_all(&table_dir).unwrap();
        fs::write(table_dir.join("0000000001.json"), b"{not json").unwrap();
        assert!(matches!(
            catalog.get_table("sales", "orders"),
            Err(CatalogApiError::Corrupt { .. })
        ));
    }

    #[test]
    fn leases_do_not_create_the_database() {
        let dir = TempDir::new().unwrap();
        let catalog = FileCatalog::new(dir.path());
        catalog
            .try_acquire_lease("sales", "orders", "holder", Duration::from_secs(60))
            .unwrap();
        assert!(!dir.path().join("sales").exists());
        assert!(catalog.create_database("sales").unwrap());
        assert!(catalog.list_tables("sales").unwrap().is_empty());
    }

    #[test]
    fn an_expired_lease_is_taken_over_once() {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(FileCatalog::new(dir.path()));
        catalog
            .try_acquire_lease("sales", "orders", "crashed", Duration::ZERO)
            .unwrap();
        let winners: Vec<_> = (0..8)
            .map(|i| {
                let catalog = Arc::clone(&catalog);
                thread::spawn(move || {
                    catalog
                        .try_acquire_lease("sales", "orders", &format!("worker-{i}"), Duration::from_secs(60))
                        .is_ok()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .collect();
        assert_eq!(winners.len(), 1);
    }

    #[test]
    fn a_stale_generation_cannot_displace_the_new_holder() {
        let dir = TempDir::new().unwrap();
        let catalog = FileCatalog::new(dir.path());
        catalog
            .try_acquire_lease("sales", "orders", "crashed", Duration::ZERO)
            .unwrap();
        let lease_dir = catalog.lease_dir("sales", "orders").unwrap();
        let (seen, _) = FileCatalog::current_lease(&lease_dir).unwrap();
        catalog
            .try_acquire_lease("sales", "orders", "fresh", Duration::from_secs(60))
            .unwrap();

        // A second taker that read the same generation loses.
        let late = Lease::new("late", "sales.orders", Duration::from_secs(60));
        assert!(!FileCatalog::write_lease(&lease_dir, seen + 1, &late).unwrap());
        // The crashed holder releasing late leaves the new lease alone.
        catalog.release_lease("sales", "orders", "crashed").unwrap();
        let (_, current) = FileCatalog::current_lease(&lease_dir).unwrap();
        assert_eq!(current.unwrap().holder_id, "fresh");

        catalog.release_lease("sales", "orders", "fresh").unwrap();
        catalog
            .try_acquire_lease("sales", "orders", "next", Duration::from_secs(60))
            .expect("released leases are free");
    }
}
