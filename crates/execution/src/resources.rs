//! Scoped handles that streams keep for as long as they may read.
//!
//! Both handles release on drop, so cancellation, exhaustion and destruction of
//! the owning stream all end the registration.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use fq_common::{FqError, Result};

/// Shared lock of one table's structure. Readers only count; the table cannot
/// be altered while `readers() > 0`.
#[derive(Debug, Default)]
pub struct TableLock {
    name: String,
    readers: AtomicUsize,
}

impl TableLock {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            readers: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Takes a shared lock for reading.
    pub fn lock_for_share(self: &Arc<Self>) -> TableLockHolder {
        self.readers.fetch_add(1, Ordering::AcqRel);
        TableLockHolder { lock: self.clone() }
    }
}

/// One shared registration on a [`TableLock`].
#[derive(Debug)]
pub struct TableLockHolder {
    lock: Arc<TableLock>,
}

impl TableLockHolder {
    pub fn table(&self) -> &str {
        self.lock.name()
    }
}

impl Clone for TableLockHolder {
    fn clone(&self) -> Self {
        self.lock.lock_for_share()
    }
}

impl Drop for TableLockHolder {
    fn drop(&mut self) {
        self.lock.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Per-user budget of rows and bytes read by complete queries.
#[derive(Debug, Default)]
pub struct Quota {
    max_rows: u64,
    max_bytes: u64,
    rows: AtomicU64,
    bytes: AtomicU64,
    active: AtomicUsize,
}

impl Quota {
    pub fn new(max_rows: u64, max_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            max_rows,
            max_bytes,
            ..Self::default()
        })
    }

    pub fn unlimited() -> Arc<Self> {
        Self::new(0, 0)
    }

    /// Streams currently holding a registration.
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn used(&self) -> (u64, u64) {
        (
            self.rows.load(Ordering::Acquire),
            self.bytes.load(Ordering::Acquire),
        )
    }

    pub fn register(self: &Arc<Self>) -> QuotaGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        QuotaGuard {
            quota: self.clone(),
        }
    }
}

/// A stream's registration on a [`Quota`].
#[derive(Debug)]
pub struct QuotaGuard {
    quota: Arc<Quota>,
}

impl QuotaGuard {
    /// Accounts a read batch.
    ///
    /// # Errors
    /// [`FqError::LimitExceeded`] once the quota's totals are crossed.
    pub fn check_and_add(&self, rows: u64, bytes: u64) -> Result<()> {
        let q = &self.quota;
        let total_rows = q.rows.fetch_add(rows, Ordering::AcqRel) + rows;
        let total_bytes = q.bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if q.max_rows != 0 && total_rows > q.max_rows {
            return Err(FqError::LimitExceeded(format!(
                "quota exceeded: read rows = {total_rows}/{}",
                q.max_rows
            )));
        }
        if q.max_bytes != 0 && total_bytes > q.max_bytes {
            return Err(FqError::LimitExceeded(format!(
                "quota exceeded: read bytes = {total_bytes}/{}",
                q.max_bytes
            )));
        }
        Ok(())
    }
}

impl Drop for QuotaGuard {
    fn drop(&mut self) {
        self.quota.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_holders_release_on_drop() {
        let lock = TableLock::new("db.t");
        let a = lock.lock_for_share();
        let b = a.clone();
        assert_eq!(lock.readers(), 2);
        drop(a);
        assert_eq!(lock.readers(), 1);
        drop(b);
        assert_eq!(lock.readers(), 0);
    }

    #[test]
    fn quota_counts_across_guards() {
        let quota = Quota::new(10, 0);
        let g1 = quota.register();
        let g2 = quota.register();
        assert_eq!(quota.active_streams(), 2);
        g1.check_and_add(6, 0).expect("first");
        assert!(g2.check_and_add(6, 0).is_err());
        drop(g1);
        drop(g2);
        assert_eq!(quota.active_streams(), 0);
        assert_eq!(quota.used().0, 12);
    }
}
