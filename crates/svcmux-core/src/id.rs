//! Service identifier type and id generation

use core::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::constants::{MIN_SPAWNED_ID, REMOTE_ID_BIT};

/// Unique identifier for a service.
///
/// Id 0 is reserved for the master. The high bit marks a remote
/// destination and is never produced by the generator. Everything
/// between 1 and [`MIN_SPAWNED_ID`] is available for explicitly-named
/// services; generated ids start at [`MIN_SPAWNED_ID`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ServiceId(u32);

impl ServiceId {
    /// The master's reserved id
    pub const MASTER: ServiceId = ServiceId(0);

    /// Create an id from a raw value
    #[inline]
    pub const fn new(id: u32) -> Self {
        ServiceId(id)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check whether this id addresses the master
    #[inline]
    pub const fn is_master(self) -> bool {
        self.0 == 0
    }

    /// Check whether the remote-destination bit is set
    #[inline]
    pub const fn is_remote(self) -> bool {
        self.0 & REMOTE_ID_BIT != 0
    }
}

impl From<u32> for ServiceId {
    #[inline]
    fn from(id: u32) -> Self {
        ServiceId(id)
    }
}

impl From<ServiceId> for u32 {
    #[inline]
    fn from(id: ServiceId) -> Self {
        id.0
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_master() {
            write!(f, "ServiceId(MASTER)")
        } else {
            write!(f, "ServiceId({})", self.0)
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_master() {
            write!(f, "master")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Atomic id generator shared by every thread that spawns services.
///
/// Ids wrap back to [`MIN_SPAWNED_ID`] before they would reach the
/// remote bit, so a generated id is never 0 and never remote-flagged.
pub struct IdSeed(AtomicU32);

/// Last id before the generator wraps (the remote bit must stay clear).
const ID_WRAP_LIMIT: u32 = REMOTE_ID_BIT - 1;

impl IdSeed {
    pub const fn new() -> Self {
        IdSeed(AtomicU32::new(MIN_SPAWNED_ID))
    }

    /// Hand out the next service id.
    pub fn next(&self) -> ServiceId {
        let prev = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(if v >= ID_WRAP_LIMIT { MIN_SPAWNED_ID } else { v + 1 })
            })
            .unwrap_or(MIN_SPAWNED_ID);
        let id = if prev >= ID_WRAP_LIMIT {
            MIN_SPAWNED_ID
        } else {
            prev + 1
        };
        ServiceId(id)
    }
}

impl Default for IdSeed {
    fn default() -> Self {
        IdSeed::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_basics() {
        let id = ServiceId::new(42);
        assert_eq!(id.as_u32(), 42);
        assert!(!id.is_master());
        assert!(!id.is_remote());

        assert!(ServiceId::MASTER.is_master());
        assert!(ServiceId::new(REMOTE_ID_BIT | 7).is_remote());
    }

    #[test]
    fn test_id_conversions() {
        let id: ServiceId = 100u32.into();
        let raw: u32 = id.into();
        assert_eq!(raw, 100);
    }

    #[test]
    fn test_seed_starts_above_reserved_range() {
        let seed = IdSeed::new();
        let first = seed.next();
        assert!(first.as_u32() > MIN_SPAWNED_ID);
        assert!(!first.is_master());
        assert!(!first.is_remote());
    }

    #[test]
    fn test_seed_ids_are_distinct() {
        let seed = IdSeed::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(seed.next().as_u32()));
        }
    }

    #[test]
    fn test_seed_wraps_below_remote_bit() {
        let seed = IdSeed(AtomicU32::new(ID_WRAP_LIMIT - 1));
        assert_eq!(seed.next().as_u32(), ID_WRAP_LIMIT);
        // next allocation wraps back to the reserved minimum
        let wrapped = seed.next();
        assert_eq!(wrapped.as_u32(), MIN_SPAWNED_ID);
        assert!(!wrapped.is_remote());
    }
}
