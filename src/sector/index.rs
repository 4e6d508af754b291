// Sector Index - Per-sector aggregate checksums over current content hashes
//
// Each key contributes H(key, contentHash) to its sector's checksum; the
// checksum is the XOR of all contributions. XOR is commutative and its own
// inverse, so replacing a key's version is "xor out old, xor in new" without
// rescanning the sector. Independent sectors are guarded by independent locks.

use crate::ledger::{ChangeLedger, EntityChange, EntityKey, LedgerError, SECTOR_COUNT};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Errors from sector index operations
#[derive(Error, Debug)]
pub enum SectorError {
    #[error("Ledger corruption detected in sectors {sectors:?} ({broken_keys} broken keys)")]
    Corruption {
        sectors: Vec<u8>,
        broken_keys: usize,
    },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

// ============================================================================
// CHECKSUM
// ============================================================================

/// XOR-combined 256-bit checksum
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Contribution of one key's current version
    pub fn contribution(change: &EntityChange) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"sector-entry:");
        hasher.update(change.key().to_bytes());
        hasher.update(change.content_hash().as_bytes());
        let result = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    /// Toggle a contribution in or out
    pub fn toggle(&mut self, other: &Checksum) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a ^= b;
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

// ============================================================================
// DIGESTS
// ============================================================================

/// Aggregate checksum and entity count of one sector
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorDigest {
    sector: u8,
    checksum: Checksum,
    count: u64,
}

impl SectorDigest {
    pub fn empty(sector: u8) -> Self {
        Self {
            sector,
            checksum: Checksum::default(),
            count: 0,
        }
    }

    pub fn new(sector: u8, checksum: Checksum, count: u64) -> Self {
        Self {
            sector,
            checksum,
            count,
        }
    }

    pub fn sector(&self) -> u8 {
        self.sector
    }

    pub fn checksum(&self) -> Checksum {
        self.checksum
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Same content, ignoring which sector slot it came from
    pub fn matches(&self, other: &SectorDigest) -> bool {
        self.checksum == other.checksum && self.count == other.count
    }
}

/// Digest over every sector, compared in a single round trip
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalDigest {
    checksum: [u8; 32],
    count: u64,
}

impl GlobalDigest {
    fn from_sectors(digests: &[SectorDigest]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"global:");
        let mut count = 0u64;
        for digest in digests {
            hasher.update(digest.checksum.as_bytes());
            hasher.update(digest.count.to_le_bytes());
            count += digest.count;
        }
        let result = hasher.finalize();
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&result);
        Self { checksum, count }
    }

    pub fn checksum(&self) -> &[u8; 32] {
        &self.checksum
    }

    /// Number of keys with a current record
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl fmt::Display for GlobalDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", hex::encode(&self.checksum[..8]), self.count)
    }
}

// ============================================================================
// SECTOR INDEX
// ============================================================================

/// Derived, rebuildable cache of sector digests
pub struct SectorIndex {
    sectors: Vec<Mutex<SectorDigest>>,
}

impl Default for SectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SectorIndex {
    /// Create an index with every sector empty
    pub fn new() -> Self {
        Self {
            sectors: (0..SECTOR_COUNT)
                .map(|s| Mutex::new(SectorDigest::empty(s as u8)))
                .collect(),
        }
    }

    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    fn slot(&self, sector: u8) -> MutexGuard<'_, SectorDigest> {
        self.sectors[sector as usize]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Replace a key's contribution: remove `previous` (if any), add `change`.
    ///
    /// Touches exactly one sector.
    pub fn update(&self, previous: Option<&EntityChange>, change: &EntityChange) {
        let sector = change.key().sector();
        let mut slot = self.slot(sector);

        match previous {
            Some(previous) => {
                if previous.content_hash() == change.content_hash() {
                    return;
                }
                slot.checksum.toggle(&Checksum::contribution(previous));
            }
            None => slot.count += 1,
        }
        slot.checksum.toggle(&Checksum::contribution(change));
    }

    /// Digest of one sector
    pub fn digest_of(&self, sector: u8) -> SectorDigest {
        *self.slot(sector)
    }

    /// Every sector digest in sector order
    pub fn digests(&self) -> Vec<SectorDigest> {
        (0..self.sectors.len())
            .map(|s| self.digest_of(s as u8))
            .collect()
    }

    /// A bounded page of digests starting at `start`
    pub fn page(&self, start: usize, limit: usize) -> Vec<SectorDigest> {
        let end = start.saturating_add(limit).min(self.sectors.len());
        (start.min(end)..end).map(|s| self.digest_of(s as u8)).collect()
    }

    /// Combination of all sector digests
    pub fn global_digest(&self) -> GlobalDigest {
        GlobalDigest::from_sectors(&self.digests())
    }

    /// Entity count per sector
    pub fn per_sector_counts(&self) -> Vec<u64> {
        self.digests().iter().map(|d| d.count()).collect()
    }

    // ========================================================================
    // REBUILD & VERIFY
    // ========================================================================

    /// Independently recompute every digest from the ledger's current view
    pub fn scan(ledger: &ChangeLedger) -> Result<Vec<SectorDigest>, LedgerError> {
        let mut digests: Vec<SectorDigest> = (0..SECTOR_COUNT)
            .map(|s| SectorDigest::empty(s as u8))
            .collect();

        for change in ledger.current_view() {
            let change = change?;
            let slot = &mut digests[change.key().sector() as usize];
            slot.checksum.toggle(&Checksum::contribution(&change));
            slot.count += 1;
        }

        Ok(digests)
    }

    /// Discard every digest and recompute from the ledger.
    ///
    /// Callers must keep writers out for the duration;
    /// [`ChangeLedger::rebuild_index`] does.
    pub fn full_rebuild(&self, ledger: &ChangeLedger) -> Result<(), LedgerError> {
        let scanned = Self::scan(ledger)?;
        for digest in scanned {
            *self.slot(digest.sector()) = digest;
        }
        Ok(())
    }

    /// Compare the incrementally maintained digests with a fresh scan and
    /// check every current record against the log.
    pub fn verify(&self, ledger: &ChangeLedger) -> Result<(), SectorError> {
        let broken_keys: Vec<EntityKey> = ledger.verify_pointers()?;
        let scanned = Self::scan(ledger)?;

        let mut sectors: Vec<u8> = scanned
            .iter()
            .filter(|fresh| !fresh.matches(&self.digest_of(fresh.sector())))
            .map(|fresh| fresh.sector())
            .collect();
        sectors.extend(broken_keys.iter().map(|k| k.sector()));
        sectors.sort_unstable();
        sectors.dedup();

        if sectors.is_empty() {
            Ok(())
        } else {
            Err(SectorError::Corruption {
                sectors,
                broken_keys: broken_keys.len(),
            })
        }
    }
}
