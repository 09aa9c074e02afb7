//! Short-lived leases for already-authorized client certificates
//!
//! A lease records that a certificate was approved by the authorization
//! service. While it is valid, further handshakes with the same certificate
//! are admitted without another remote call. Leases are keyed by the SHA-256
//! digest of the certificate's DER encoding and are never extended: an
//! expired lease is dropped on the lookup that finds it, and a fresh one is
//! only recorded after a new approval. There is no background sweep.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// How long an approval is honoured before the service is consulted again.
pub const LEASE_DURATION: Duration = Duration::from_secs(10);

/// SHA-256 digest of a DER-encoded certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint the DER encoding of a certificate.
    #[must_use]
    pub fn of(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    started: Instant,
}

impl Lease {
    fn is_expired(&self, now: Instant, duration: Duration) -> bool {
        now.saturating_duration_since(self.started) >= duration
    }
}

/// Lease counters tracked atomically
#[derive(Debug, Default)]
struct LeaseStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    grants: AtomicU64,
}

/// In-memory lease table shared by every handshake.
///
/// Each operation runs under one exclusive lock, so a lookup that finds an
/// expired lease and removes it cannot interleave with an insert for the
/// same certificate.
#[derive(Debug)]
pub struct LeaseCache {
    leases: Mutex<HashMap<Fingerprint, Lease>>,
    duration: Duration,
    stats: LeaseStats,
}

impl LeaseCache {
    /// Create an empty cache using [`LEASE_DURATION`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_duration(LEASE_DURATION)
    }

    /// Create an empty cache with a custom lease duration.
    #[must_use]
    pub fn with_duration(duration: Duration) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            duration,
            stats: LeaseStats::default(),
        }
    }

    /// Lease duration in effect.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Whether `cert` (DER) holds an unexpired lease.
    ///
    /// An expired lease is removed and reported as not valid.
    pub fn check_valid(&self, cert: &[u8]) -> bool {
        self.check_valid_at(Fingerprint::of(cert), Instant::now())
    }

    /// Record a fresh lease for `cert` (DER), replacing any previous one.
    pub fn insert(&self, cert: &[u8]) {
        self.insert_at(Fingerprint::of(cert), Instant::now());
    }

    fn check_valid_at(&self, key: Fingerprint, now: Instant) -> bool {
        let mut leases = self.leases.lock();
        match leases.get(&key) {
            Some(lease) if !lease.is_expired(now, self.duration) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(_) => {
                leases.remove(&key);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn insert_at(&self, key: Fingerprint, now: Instant) {
        self.leases.lock().insert(key, Lease { started: now });
        self.stats.grants.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of leases currently stored (expired ones included until looked up).
    #[must_use]
    pub fn len(&self) -> usize {
        self.leases.lock().len()
    }

    /// Whether no leases are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leases.lock().is_empty()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> LeaseStatsSnapshot {
        LeaseStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
            grants: self.stats.grants.load(Ordering::Relaxed),
            size: self.len(),
        }
    }
}

impl Default for LeaseCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of lease statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseStatsSnapshot {
    /// Lookups answered by a valid lease
    pub hits: u64,
    /// Lookups that found no valid lease
    pub misses: u64,
    /// Expired leases removed during lookup
    pub expirations: u64,
    /// Leases recorded after approval
    pub grants: u64,
    /// Current number of stored leases
    pub size: usize,
}
