//! Per-table mutual exclusion on top of catalog leases.
//!
//! Acquisition creates a lease record through the catalog's conditional
//! create. While another holder's lease is live the caller backs off
//! exponentially (100 ms doubling, capped at 2 s, plus jitter) until the
//! bounded wait or the job deadline runs out. Leases carry a TTL so a crashed
//! holder cannot block a table forever. The guard releases on drop.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use log::{debug, warn};

use super::{Catalog, CatalogApiError, Lease};
use crate::{
    error::{LoaderError, LoaderResult},
    job::Deadline,
};

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Hands out table locks for one catalog.
#[derive(Clone)]
pub struct TableLocks {
    catalog: Arc<dyn Catalog>,
    wait: Duration,
    ttl: Duration,
}

impl TableLocks {
    pub fn new(catalog: Arc<dyn Catalog>, wait: Duration, ttl: Duration) -> Self {
        TableLocks { catalog, wait, ttl }
    }

    /// Blocks until the lock on `database.table` is held, the bounded wait
    /// elapses (`CatalogLockTimeout`) or `deadline` passes (`DeadlineExceeded`).
    pub fn acquire(
        &self,
        database: &str,
        table: &str,
        deadline: Deadline,
    ) -> LoaderResult<TableLockGuard> {
        let holder_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut backoff = BACKOFF_BASE;
        let mut attempts = 0u32;

        loop {
            deadline.check("catalog lock")?;
            attempts += 1;
            match self
                .catalog
                .try_acquire_lease(database, table, &holder_id, self.ttl)
            {
                Ok(lease) => {
                    debug!(
                        "Acquired lock on {database}.{table} after {attempts} attempt(s) ({} ms)",
                        started.elapsed().as_millis()
                    );
                    return Ok(TableLockGuard {
                        catalog: Arc::clone(&self.catalog),
                        database: database.to_string(),
                        table: table.to_string(),
                        lease,
                        released: false,
                    });
                }
                Err(CatalogApiError::LeaseHeld {
                    holder, expires_at, ..
                }) => {
                    let waited = started.elapsed();
                    if waited >= self.wait {
                        return Err(LoaderError::CatalogLockTimeout {
                            table: format!("{database}.{table}"),
                            waited_ms: waited.as_millis(),
                        });
                    }
                    let mut delay = backoff.min(BACKOFF_MAX) + jitter();
                    delay = delay.min(self.wait - waited);
                    if let Some(remaining) = deadline.remaining() {
                        delay = delay.min(remaining);
                    }
                    debug!(
                        "{database}.{table} is locked by {holder} until {expires_at}; retrying in {} ms",
                        delay.as_millis()
                    );
                    thread::sleep(delay);
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Held table lock; released when dropped.
pub struct TableLockGuard {
    catalog: Arc<dyn Catalog>,
    database: String,
    table: String,
    lease: Lease,
    released: bool,
}

impl TableLockGuard {
    pub fn holder_id(&self) -> &str {
        &self.lease.holder_id
    }

    /// Fails once the lease TTL has run out, since another job may have
    /// taken the table over.
    pub fn ensure_live(&self) -> LoaderResult<()> {
        if self.lease.is_expired() {
            return Err(LoaderError::CatalogLockTimeout {
                table: format!("{}.{}", self.database, self.table),
                waited_ms: 0,
            });
        }
        Ok(())
    }

    pub fn release(mut self) -> LoaderResult<()> {
        self.do_release().map_err(LoaderError::from)
    }

    fn do_release(&mut self) -> Result<(), CatalogApiError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.catalog
            .release_lease(&self.database, &self.table, &self.lease.holder_id)
    }
}

impl Drop for TableLockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.do_release() {
            warn!(
                "Failed to release lock on {}.{}: {err}; it expires at {}",
                self.database, self.table, self.lease.expires_at
            );
        }
    }
}

/// Jitter for backoff (0-49 ms).
fn jitter() -> Duration {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    Duration::from_millis(u64::from(nanos % 50))
}
