//! Compact optional entry metadata.
//!
//! Most live entries carry no TTL, no lock candidates, and no obsolete
//! marker, so the entry stores its extras as `Option<Box<EntryExtras>>`: one
//! machine word in the common case. The enum has one variant per observed
//! combination of fields; setters rebuild the smallest variant that still
//! holds the non-default fields and return `None` once everything is back to
//! defaults. Callers must reassign the returned value.

use crate::mvcc::MvccCandidateSet;
use crate::version::Version;

/// Optional per-entry metadata: TTL + expire time, MVCC candidates, and the
/// obsolete version marker, in every populated combination.
#[derive(Debug, Clone)]
pub enum EntryExtras {
    /// TTL and expire time only.
    Ttl {
        /// Time-to-live in milliseconds.
        ttl: u64,
        /// Absolute expire time in milliseconds.
        expire_time: u64,
    },
    /// Lock candidates only.
    Mvcc {
        /// Candidate set.
        mvcc: MvccCandidateSet,
    },
    /// Obsolete marker only.
    Obsolete {
        /// Version the entry was obsoleted with.
        obsolete_ver: Version,
    },
    /// TTL and lock candidates.
    TtlMvcc {
        /// Time-to-live in milliseconds.
        ttl: u64,
        /// Absolute expire time in milliseconds.
        expire_time: u64,
        /// Candidate set.
        mvcc: MvccCandidateSet,
    },
    /// TTL and obsolete marker.
    TtlObsolete {
        /// Time-to-live in milliseconds.
        ttl: u64,
        /// Absolute expire time in milliseconds.
        expire_time: u64,
        /// Version the entry was obsoleted with.
        obsolete_ver: Version,
    },
    /// Lock candidates and obsolete marker.
    MvccObsolete {
        /// Candidate set.
        mvcc: MvccCandidateSet,
        /// Version the entry was obsoleted with.
        obsolete_ver: Version,
    },
    /// All fields populated.
    TtlMvccObsolete {
        /// Time-to-live in milliseconds.
        ttl: u64,
        /// Absolute expire time in milliseconds.
        expire_time: u64,
        /// Candidate set.
        mvcc: MvccCandidateSet,
        /// Version the entry was obsoleted with.
        obsolete_ver: Version,
    },
}

/// The entry-side handle: absent when every field is at its default.
pub type Extras = Option<Box<EntryExtras>>;

impl EntryExtras {
    /// TTL in milliseconds; zero when not set.
    pub fn ttl(&self) -> u64 {
        match self {
            Self::Ttl { ttl, .. }
            | Self::TtlMvcc { ttl, .. }
            | Self::TtlObsolete { ttl, .. }
            | Self::TtlMvccObsolete { ttl, .. } => *ttl,
            _ => 0,
        }
    }

    /// Absolute expire time in milliseconds; zero when eternal.
    pub fn expire_time(&self) -> u64 {
        match self {
            Self::Ttl { expire_time, .. }
            | Self::TtlMvcc { expire_time, .. }
            | Self::TtlObsolete { expire_time, .. }
            | Self::TtlMvccObsolete { expire_time, .. } => *expire_time,
            _ => 0,
        }
    }

    /// The candidate set, if any.
    pub fn mvcc(&self) -> Option<&MvccCandidateSet> {
        match self {
            Self::Mvcc { mvcc }
            | Self::TtlMvcc { mvcc, .. }
            | Self::MvccObsolete { mvcc, .. }
            | Self::TtlMvccObsolete { mvcc, .. } => Some(mvcc),
            _ => None,
        }
    }

    /// Mutable access to the candidate set, if any.
    pub fn mvcc_mut(&mut self) -> Option<&mut MvccCandidateSet> {
        match self {
            Self::Mvcc { mvcc }
            | Self::TtlMvcc { mvcc, .. }
            | Self::MvccObsolete { mvcc, .. }
            | Self::TtlMvccObsolete { mvcc, .. } => Some(mvcc),
            _ => None,
        }
    }

    /// The obsolete marker, if any. Non-`None` means the entry is terminal.
    pub fn obsolete_version(&self) -> Option<Version> {
        match self {
            Self::Obsolete { obsolete_ver }
            | Self::TtlObsolete { obsolete_ver, .. }
            | Self::MvccObsolete { obsolete_ver, .. }
            | Self::TtlMvccObsolete { obsolete_ver, .. } => Some(*obsolete_ver),
            _ => None,
        }
    }

    /// Replace the TTL dimension, returning the new extras handle.
    pub fn with_ttl(cur: Extras, ttl: u64, expire_time: u64) -> Extras {
        let (_, _, mvcc, obsolete) = Self::decompose(cur);
        Self::compose(ttl, expire_time, mvcc, obsolete)
    }

    /// Replace the MVCC dimension, returning the new extras handle.
    pub fn with_mvcc(cur: Extras, mvcc: Option<MvccCandidateSet>) -> Extras {
        let (ttl, expire_time, _, obsolete) = Self::decompose(cur);
        Self::compose(ttl, expire_time, mvcc, obsolete)
    }

    /// Replace the obsolete dimension, returning the new extras handle.
    pub fn with_obsolete(cur: Extras, obsolete_ver: Option<Version>) -> Extras {
        let (ttl, expire_time, mvcc, _) = Self::decompose(cur);
        Self::compose(ttl, expire_time, mvcc, obsolete_ver)
    }

    fn decompose(cur: Extras) -> (u64, u64, Option<MvccCandidateSet>, Option<Version>) {
        match cur.map(|b| *b) {
            None => (0, 0, None, None),
            Some(Self::Ttl { ttl, expire_time }) => (ttl, expire_time, None, None),
            Some(Self::Mvcc { mvcc }) => (0, 0, Some(mvcc), None),
            Some(Self::Obsolete { obsolete_ver }) => (0, 0, None, Some(obsolete_ver)),
            Some(Self::TtlMvcc {
                ttl,
                expire_time,
                mvcc,
            }) => (ttl, expire_time, Some(mvcc), None),
            Some(Self::TtlObsolete {
                ttl,
                expire_time,
                obsolete_ver,
            }) => (ttl, expire_time, None, Some(obsolete_ver)),
            Some(Self::MvccObsolete { mvcc, obsolete_ver }) => {
                (0, 0, Some(mvcc), Some(obsolete_ver))
            }
            Some(Self::TtlMvccObsolete {
                ttl,
                expire_time,
                mvcc,
                obsolete_ver,
            }) => (ttl, expire_time, Some(mvcc), Some(obsolete_ver)),
        }
    }

    fn compose(
        ttl: u64,
        expire_time: u64,
        mvcc: Option<MvccCandidateSet>,
        obsolete_ver: Option<Version>,
    ) -> Extras {
        let has_ttl = ttl != 0 || expire_time != 0;

        let extras = match (has_ttl, mvcc, obsolete_ver) {
            (false, None, None) => return None,
            (true, None, None) => Self::Ttl { ttl, expire_time },
            (false, Some(mvcc), None) => Self::Mvcc { mvcc },
            (false, None, Some(obsolete_ver)) => Self::Obsolete { obsolete_ver },
            (true, Some(mvcc), None) => Self::TtlMvcc {
                ttl,
                expire_time,
                mvcc,
            },
            (true, None, Some(obsolete_ver)) => Self::TtlObsolete {
                ttl,
                expire_time,
                obsolete_ver,
            },
            (false, Some(mvcc), Some(obsolete_ver)) => Self::MvccObsolete { mvcc, obsolete_ver },
            (true, Some(mvcc), Some(obsolete_ver)) => Self::TtlMvccObsolete {
                ttl,
                expire_time,
                mvcc,
                obsolete_ver,
            },
        };

        Some(Box::new(extras))
    }
}
