// Sector module - CHEAP DIVERGENCE DETECTION
// Order-independent per-sector digests derived from the ledger's current view

mod index;

pub use index::{Checksum, GlobalDigest, SectorDigest, SectorError, SectorIndex};
