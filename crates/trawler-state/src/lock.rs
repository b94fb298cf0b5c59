//! Per-source mutual exclusion.
//!
//! One CAS statement per acquisition attempt, never blocking. A contended
//! acquire is a normal skip. Expiry is the sole backstop for crashed
//! holders; the sweep is hygiene only.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use trawler_types::ids::{HolderId, SourceKey};
use uuid::Uuid;

use crate::backend::StateBackend;
use crate::error;

/// Default lease lifetime.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30 * 60);

/// A lock row as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLock {
    pub source: SourceKey,
    pub holder: HolderId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A granted lease. Release explicitly through [`LockManager::release`];
/// if the process dies first, the TTL lets the next holder steal.
#[derive(Debug, Clone)]
pub struct LockLease {
    pub source: SourceKey,
    pub holder: HolderId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Hands out per-source leases with a fixed TTL.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn StateBackend>,
    ttl: TimeDelta,
}

impl LockManager {
    pub fn new(backend: Arc<dyn StateBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl: TimeDelta::from_std(ttl).unwrap_or_else(|_| TimeDelta::minutes(30)),
        }
    }

    pub fn with_default_ttl(backend: Arc<dyn StateBackend>) -> Self {
        Self::new(backend, DEFAULT_LOCK_TTL)
    }

    /// Try to take the lease for `source` with a fresh holder id.
    /// `Ok(None)` means another holder has it and the caller skips.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    pub fn acquire(&self, source: &SourceKey) -> error::Result<Option<LockLease>> {
        let holder = HolderId::new(Uuid::new_v4().to_string());
        let now = Utc::now();
        let expires_at = now + self.ttl;

        if self
            .backend
            .try_acquire_lock(source, &holder, now, expires_at)?
        {
            tracing::debug!(source = %source, holder = %holder, "acquired source lock");
            Ok(Some(LockLease {
                source: source.clone(),
                holder,
                acquired_at: now,
                expires_at,
            }))
        } else {
            tracing::info!(source = %source, "source lock held elsewhere; skipping");
            Ok(None)
        }
    }

    /// Idempotent release. `false` when the lease was already gone or was
    /// stolen after expiring; a stale holder never disturbs the current
    /// one.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    pub fn release(&self, lease: &LockLease) -> error::Result<bool> {
        let released = self.backend.release_lock(&lease.source, &lease.holder)?;
        if released {
            tracing::debug!(source = %lease.source, "released source lock");
        } else {
            tracing::warn!(
                source = %lease.source,
                holder = %lease.holder,
                "lock release was a no-op; lease expired or was stolen"
            );
        }
        Ok(released)
    }

    /// Delete expired lock rows. Hygiene only; acquisition steals expired
    /// rows with or without this.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    pub fn sweep_expired(&self) -> error::Result<u64> {
        let removed = self.backend.delete_expired_locks(Utc::now())?;
        if removed > 0 {
            tracing::info!(removed, "swept expired source locks");
        }
        Ok(removed)
    }
}
