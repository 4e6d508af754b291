// Conflict Resolution - Decides which version of an entity wins
//
// Last-writer-wins register per entity key:
// - identical content hashes never conflict (convergent states do not thrash)
// - otherwise the later `utcChangedAt` wins
// - equal timestamps fall back to the greater origin instance id, then the
//   greater content hash, so every replica picks the same winner
//
// Erasures carry their own timestamp and are ordered by the same rule; a
// later re-creation beats an earlier erasure.

use crate::ledger::change::EntityChange;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// What to do with an incoming remote version
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// Remote version wins: write it to entity storage and make it current
    AdoptRemote,
    /// Local version wins: remote is kept only as history
    KeepLocal,
    /// Both sides already hold the same content
    NoOp,
}

/// Stateless last-writer-wins resolver
#[derive(Clone, Copy, Debug, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a remote version against the local current version (if any)
    pub fn resolve(&self, local: Option<&EntityChange>, remote: &EntityChange) -> Resolution {
        let local = match local {
            Some(local) => local,
            None => return Resolution::AdoptRemote,
        };

        if local.content_hash() == remote.content_hash() {
            return Resolution::NoOp;
        }

        match Self::compare_versions(remote, local) {
            Ordering::Greater => Resolution::AdoptRemote,
            Ordering::Less | Ordering::Equal => Resolution::KeepLocal,
        }
    }

    /// Total order over versions of the same key.
    ///
    /// `(utcChangedAt, originInstanceId, contentHash)`, compared lexicographically.
    pub fn compare_versions(a: &EntityChange, b: &EntityChange) -> Ordering {
        a.utc_changed_at()
            .cmp(&b.utc_changed_at())
            .then_with(|| a.origin_instance_id().cmp(b.origin_instance_id()))
            .then_with(|| a.content_hash().cmp(&b.content_hash()))
    }

    /// The winning version of two, independent of argument order
    pub fn winner<'a>(&self, a: &'a EntityChange, b: &'a EntityChange) -> &'a EntityChange {
        if Self::compare_versions(a, b) == Ordering::Less {
            b
        } else {
            a
        }
    }
}
