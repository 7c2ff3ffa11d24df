//! Per-entry lock candidate set.
//!
//! Each entry carries an ordered list of lock candidates: transactions (local
//! or remote) that requested or hold the entry lock. The head of the queue is
//! the current owner; removing the head promotes the next candidate. Most
//! entries have zero or one candidate, so the list inlines a single slot.

use smallvec::SmallVec;

use crate::version::Version;

/// A pending or granted lock holder recorded on an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MvccCandidate {
    ver: Version,
    node_order: u32,
    thread_id: u64,
    local: bool,
}

impl MvccCandidate {
    /// Lock version (the transaction's xid version).
    #[inline]
    pub fn version(&self) -> Version {
        self.ver
    }

    /// Node the candidate originates from.
    #[inline]
    pub fn node_order(&self) -> u32 {
        self.node_order
    }

    /// Requesting thread id; meaningful for local candidates only.
    #[inline]
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// Whether the candidate was added by the local node.
    #[inline]
    pub fn is_local(&self) -> bool {
        self.local
    }
}

/// Ordered lock candidates for one entry.
#[derive(Debug, Clone, Default)]
pub struct MvccCandidateSet {
    cands: SmallVec<[MvccCandidate; 1]>,
}

impl MvccCandidateSet {
    /// Create an empty candidate set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of candidates.
    #[inline]
    pub fn len(&self) -> usize {
        self.cands.len()
    }

    /// Whether there are no candidates at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cands.is_empty()
    }

    /// Whether there are no candidates besides the excluded versions.
    pub fn is_empty_excluding(&self, exclude: &[Version]) -> bool {
        self.cands.iter().all(|c| exclude.contains(&c.ver))
    }

    /// Add a candidate for a local transaction. Re-adding the same lock
    /// version is a no-op.
    pub fn add_local(&mut self, ver: Version, node_order: u32, thread_id: u64) {
        self.add(MvccCandidate {
            ver,
            node_order,
            thread_id,
            local: true,
        });
    }

    /// Add a candidate for a remote transaction.
    pub fn add_remote(&mut self, ver: Version, node_order: u32, thread_id: u64) {
        self.add(MvccCandidate {
            ver,
            node_order,
            thread_id,
            local: false,
        });
    }

    fn add(&mut self, cand: MvccCandidate) {
        if !self.has_candidate(cand.ver) {
            self.cands.push(cand);
        }
    }

    /// Remove the candidate with the given lock version. Removing the head
    /// promotes the next candidate to owner. Returns whether the removed
    /// candidate was the owner.
    pub fn remove(&mut self, ver: Version) -> bool {
        match self.cands.iter().position(|c| c.ver == ver) {
            Some(pos) => {
                self.cands.remove(pos);
                pos == 0
            }
            None => false,
        }
    }

    /// The current owner: the head of the queue.
    pub fn owner(&self) -> Option<&MvccCandidate> {
        self.cands.first()
    }

    /// Owner snapshot for event emission.
    pub fn any_owner(&self) -> Option<MvccCandidate> {
        self.owner().cloned()
    }

    /// Whether a candidate with this lock version exists (owner or pending).
    pub fn has_candidate(&self, ver: Version) -> bool {
        self.cands.iter().any(|c| c.ver == ver)
    }

    /// The candidate with this lock version.
    pub fn candidate(&self, ver: Version) -> Option<&MvccCandidate> {
        self.cands.iter().find(|c| c.ver == ver)
    }

    /// The local candidate added by this thread.
    pub fn local_candidate(&self, thread_id: u64) -> Option<&MvccCandidate> {
        self.cands
            .iter()
            .find(|c| c.local && c.thread_id == thread_id)
    }

    /// The candidate added by the given node and thread.
    pub fn candidate_for(&self, node_order: u32, thread_id: u64) -> Option<&MvccCandidate> {
        self.cands
            .iter()
            .find(|c| c.node_order == node_order && c.thread_id == thread_id)
    }

    /// Whether the lock is owned by this version.
    pub fn owned_by(&self, ver: Version) -> bool {
        self.owner().map(|c| c.ver == ver).unwrap_or(false)
    }

    /// Whether the lock is owned locally by this thread.
    pub fn owned_by_thread(&self, thread_id: u64) -> bool {
        self.owner()
            .map(|c| c.local && c.thread_id == thread_id)
            .unwrap_or(false)
    }

    /// Local candidates, skipping the excluded versions.
    pub fn local_candidates(&self, exclude: &[Version]) -> Vec<MvccCandidate> {
        self.cands
            .iter()
            .filter(|c| c.local && !exclude.contains(&c.ver))
            .cloned()
            .collect()
    }

    /// Remote candidates, skipping the excluded versions.
    pub fn remote_candidates(&self, exclude: &[Version]) -> Vec<MvccCandidate> {
        self.cands
            .iter()
            .filter(|c| !c.local && !exclude.contains(&c.ver))
            .cloned()
            .collect()
    }
}
