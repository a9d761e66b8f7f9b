//! The master's service table.
//!
//! A power-of-two bucket array mapping id -> table entry, scanned
//! linearly within a bucket. The table lives on the master thread and
//! is touched by the master only; cross-thread id generation goes
//! through the atomic seed instead of a table lock. There is no
//! rehashing: when the element count exceeds the bucket count a
//! warning is logged and lookups degrade to longer scans, nothing
//! more.

use std::os::fd::RawFd;
use std::sync::Arc;

use svcmux_core::svc_warn;
use svcmux_core::{IoKind, Service, ServiceGate, ServiceId};

/// Master-side copy of a service's registration, for event dispatch.
#[derive(Clone, Copy)]
pub(crate) struct IoSlot {
    pub fd: RawFd,
    pub kind: IoKind,
}

/// Where the record currently lives.
pub(crate) enum Slot {
    /// Master holds the record; no worker assigned yet.
    Parked(Box<Service>),
    /// Record is owned by the worker with this index.
    Attached(usize),
}

/// One live service as the master sees it.
pub(crate) struct TableEntry {
    pub svid: ServiceId,
    pub gate: Arc<ServiceGate>,
    pub slot: Slot,
    pub io: Option<IoSlot>,
}

pub(crate) struct ServiceTable {
    buckets: Vec<Vec<TableEntry>>,
    mask: u32,
    len: usize,
}

impl ServiceTable {
    /// `size_bits` is the bucket-count exponent (2^bits buckets).
    pub fn new(size_bits: u8) -> Self {
        let n = 1usize << size_bits;
        let mut buckets = Vec::with_capacity(n);
        buckets.resize_with(n, Vec::new);
        ServiceTable {
            buckets,
            mask: (n - 1) as u32,
            len: 0,
        }
    }

    #[inline]
    fn bucket(&self, svid: ServiceId) -> usize {
        (svid.as_u32() & self.mask) as usize
    }

    /// Insert unconditionally; duplicate ids shadow older entries.
    pub fn add(&mut self, entry: TableEntry) {
        let b = self.bucket(entry.svid);
        self.buckets[b].push(entry);
        self.len += 1;
        if self.len > self.buckets.len() {
            svc_warn!(
                "service table overloaded: {} entries in {} buckets",
                self.len,
                self.buckets.len()
            );
        }
    }

    pub fn find(&self, svid: ServiceId) -> Option<&TableEntry> {
        let b = self.bucket(svid);
        self.buckets[b].iter().find(|e| e.svid == svid)
    }

    pub fn find_mut(&mut self, svid: ServiceId) -> Option<&mut TableEntry> {
        let b = self.bucket(svid);
        self.buckets[b].iter_mut().find(|e| e.svid == svid)
    }

    pub fn remove(&mut self, svid: ServiceId) -> Option<TableEntry> {
        let b = self.bucket(svid);
        let i = self.buckets[b].iter().position(|e| e.svid == svid)?;
        self.len -= 1;
        Some(self.buckets[b].swap_remove(i))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop every entry (shutdown bulk free). Returns how many.
    pub fn clear(&mut self) -> usize {
        let n = self.len;
        for b in &mut self.buckets {
            b.clear();
        }
        self.len = 0;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svcmux_core::{Control, IdSeed};

    fn entry(svid: u32) -> TableEntry {
        let ids = IdSeed::new();
        let svc = Service::func(|_, _| Control::Done)
            .id(ServiceId::new(svid))
            .build(&ids, None);
        TableEntry {
            svid: svc.svid,
            gate: svc.gate.clone(),
            io: None,
            slot: Slot::Parked(svc),
        }
    }

    #[test]
    fn test_add_find_remove() {
        let mut t = ServiceTable::new(4);
        t.add(entry(100));
        t.add(entry(200));
        assert_eq!(t.len(), 2);
        assert!(t.find(ServiceId::new(100)).is_some());
        assert!(t.find(ServiceId::new(300)).is_none());

        let removed = t.remove(ServiceId::new(100)).unwrap();
        assert_eq!(removed.svid.as_u32(), 100);
        assert!(t.find(ServiceId::new(100)).is_none());
        assert_eq!(t.len(), 1);
        assert!(t.remove(ServiceId::new(100)).is_none());
    }

    #[test]
    fn test_colliding_ids_share_a_bucket() {
        // 16 buckets: 5 and 21 collide
        let mut t = ServiceTable::new(4);
        t.add(entry(5));
        t.add(entry(21));
        assert!(t.find(ServiceId::new(5)).is_some());
        assert!(t.find(ServiceId::new(21)).is_some());
        t.remove(ServiceId::new(5)).unwrap();
        assert!(t.find(ServiceId::new(21)).is_some());
    }

    #[test]
    fn test_generated_ids_never_collide_while_live() {
        let ids = IdSeed::new();
        let mut t = ServiceTable::new(4);
        for _ in 0..64 {
            let svc = Service::func(|_, _| Control::Done).build(&ids, None);
            // a freshly generated id is never already reachable
            assert!(t.find(svc.svid).is_none());
            t.add(TableEntry {
                svid: svc.svid,
                gate: svc.gate.clone(),
                io: None,
                slot: Slot::Parked(svc),
            });
        }
        assert_eq!(t.len(), 64);
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut t = ServiceTable::new(4);
        for i in 0..10 {
            t.add(entry(1000 + i));
        }
        assert_eq!(t.clear(), 10);
        assert!(t.is_empty());
        assert!(t.find(ServiceId::new(1000)).is_none());
    }

    #[test]
    fn test_find_mut_allows_io_update() {
        let mut t = ServiceTable::new(4);
        t.add(entry(7));
        let e = t.find_mut(ServiceId::new(7)).unwrap();
        e.io = Some(IoSlot {
            fd: 3,
            kind: IoKind::Stream,
        });
        assert_eq!(t.find(ServiceId::new(7)).unwrap().io.unwrap().fd, 3);
    }
}
