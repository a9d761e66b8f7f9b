//! The master loop: event bridging, message routing, service reaping.
//!
//! The master owns the poller, the service table and the load heap.
//! Each turn it waits for I/O readiness (or a wakeup), turns events
//! into messages, splices the global inbound queue out under its lock,
//! handles master-destined control messages, routes the rest into
//! per-worker batches, and flushes each batch under that worker's
//! inbox lock.
//!
//! Attachment happens here and only here: the first message for a
//! parked service pulls the least-loaded worker off the heap and hands
//! the record over together with the message. A message that races
//! with completion is detected through the service's done gate and
//! discarded rather than re-attaching a dying service.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use svcmux_core::{svc_debug, svc_error, svc_info, svc_warn};
use svcmux_core::{Body, EventMask, Fifo, IoKind, Message, Service, ServiceId};

use crate::config::Config;
use crate::poller::{PollEvent, Poller};
use crate::pool::LoadHeap;
use crate::runtime::RuntimeShared;
use crate::socket;
use crate::table::{IoSlot, ServiceTable, Slot, TableEntry};
use crate::worker::{lock, Delivery, WorkerHandle};

pub(crate) struct Master {
    poller: Poller,
    rt: Arc<RuntimeShared>,
    workers: Vec<WorkerHandle>,
    table: ServiceTable,
    pool: LoadHeap,
    /// Messages the master itself emits while bridging events.
    routeq: Fifo<Message>,
    /// Per-worker delivery batches, reused across turns.
    pending: Vec<Fifo<Delivery>>,
    /// Reused poll-event buffer.
    events: Vec<PollEvent>,
    running: bool,
}

impl Master {
    pub fn new(
        cfg: &Config,
        poller: Poller,
        rt: Arc<RuntimeShared>,
        workers: Vec<WorkerHandle>,
    ) -> Master {
        let n = workers.len();
        let mut pending = Vec::with_capacity(n);
        pending.resize_with(n, Fifo::new);
        Master {
            poller,
            rt,
            workers,
            table: ServiceTable::new(cfg.table_size_bits),
            pool: LoadHeap::new(n),
            routeq: Fifo::new(),
            pending,
            events: Vec::with_capacity(128),
            running: true,
        }
    }

    /// Run until a shutdown message arrives.
    pub fn run(&mut self) {
        svc_info!("master running with {} workers", self.workers.len());
        while self.running {
            self.events.clear();
            if let Err(e) = self.poller.wait(&mut self.events) {
                svc_error!("event wait failed: {}", e);
                break;
            }
            self.turn();
        }
    }

    /// One dispatch cycle: bridge events, drain, route, flush.
    fn turn(&mut self) {
        let events = std::mem::take(&mut self.events);
        for ev in &events {
            self.dispatch_io(*ev);
        }
        self.events = events;

        let mut q = std::mem::take(&mut *lock(&self.rt.inbox));
        q.push_all(&mut self.routeq);

        while let Some(msg) = q.pop() {
            if msg.to.is_master() {
                self.handle_control(msg);
            } else {
                self.route(msg);
            }
        }

        self.flush_workers();
    }

    fn handle_control(&mut self, msg: Message) {
        match msg.body {
            Body::Start(svc) => self.start_service(svc),
            Body::Done(svc) => self.reap(svc),
            Body::WatchEvent {
                svid,
                fd,
                masks,
                kind,
            } => self.watch_event(svid, fd, masks, kind),
            Body::DropEvent { svid, fd } => {
                if let Some(entry) = self.table.find_mut(svid) {
                    entry.io = None;
                }
                if let Err(e) = self.poller.delete(fd.as_raw_fd()) {
                    svc_debug!("service {}: event deregister failed: {}", svid, e);
                }
                // fd closes when dropped here
            }
            Body::Shutdown => {
                svc_info!("shutdown requested by {}", msg.from);
                self.running = false;
            }
            _ => svc_error!(
                "master: unhandled {} message from {}",
                msg.kind_name(),
                msg.from
            ),
        }
    }

    /// Bring a new service online: register its event (if any) and
    /// park the record in the table until its first message.
    fn start_service(&mut self, svc: Box<Service>) {
        if let Some(reg) = &svc.io {
            svc.gate.take_masks(); // fresh registration starts with a clean slate
            if let Err(e) = self.poller.add(reg.raw_fd(), svc.svid, reg.masks) {
                svc_error!("service {}: event register failed: {}", svc.svid, e);
            }
        }
        let io = svc.io.as_ref().map(|r| IoSlot {
            fd: r.raw_fd(),
            kind: r.kind,
        });
        svc_debug!("service {} online", svc.svid);
        self.table.add(TableEntry {
            svid: svc.svid,
            gate: svc.gate.clone(),
            io,
            slot: Slot::Parked(svc),
        });
    }

    /// Mid-life event registration requested by the service itself.
    fn watch_event(&mut self, svid: ServiceId, fd: RawFd, masks: EventMask, kind: IoKind) {
        let Some(entry) = self.table.find_mut(svid) else {
            svc_debug!("watch-event for unknown service {}", svid);
            return;
        };
        entry.gate.take_masks();
        entry.io = Some(IoSlot { fd, kind });
        if let Err(e) = self.poller.add(fd, svid, masks) {
            svc_error!("service {}: event register failed: {}", svid, e);
            entry.io = None;
        }
    }

    /// Route one service-destined message to its owning worker,
    /// attaching the service first when it has none.
    fn route(&mut self, msg: Message) {
        if msg.to.is_remote() {
            svc_warn!(
                "remote destinations not supported; {} message dropped",
                msg.kind_name()
            );
            return;
        }
        let Some(entry) = self.table.find_mut(msg.to) else {
            svc_debug!(
                "no service {} for {} message from {}; dropped",
                msg.to,
                msg.kind_name(),
                msg.from
            );
            return;
        };
        if entry.gate.is_done() {
            // completed but not yet reaped; never re-attach
            svc_debug!(
                "service {} already done; {} message dropped",
                msg.to,
                msg.kind_name()
            );
            return;
        }

        let attached = match &entry.slot {
            Slot::Attached(w) => Some(*w),
            Slot::Parked(_) => None,
        };
        match attached {
            Some(w) => self.pending[w].push(Delivery::Msg(msg)),
            None => {
                let w = self.pool.acquire();
                if let Slot::Parked(mut svc) =
                    std::mem::replace(&mut entry.slot, Slot::Attached(w))
                {
                    svc.mailbox.push(msg);
                    svc_debug!("service {} attached to worker {}", svc.svid, w);
                    self.pending[w].push(Delivery::Attach(svc));
                }
            }
        }
    }

    /// Handle a completion report: the one place a service dies.
    fn reap(&mut self, mut svc: Box<Service>) {
        let svid = svc.svid;
        let Some(entry) = self.table.remove(svid) else {
            svc_error!("completion report for untracked service {}", svid);
            return;
        };
        match entry.slot {
            Slot::Attached(w) => self.pool.release(w),
            Slot::Parked(_) => svc_error!("service {} reported done while parked", svid),
        }

        let mut dropped = 0usize;
        while svc.mailbox.pop().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            svc_debug!("service {}: {} undelivered messages dropped", svid, dropped);
        }

        if let Some(reg) = svc.io.take() {
            if let Err(e) = self.poller.delete(reg.raw_fd()) {
                svc_debug!("service {}: event deregister failed: {}", svid, e);
            }
            // descriptor closes as the registration drops
        }

        svc_debug!("service {} reaped", svid);
        self.rt.recycle(svc);
    }

    /// Turn one readiness event into messages, per registration kind.
    fn dispatch_io(&mut self, ev: PollEvent) {
        if ev.masks.is_empty() {
            return;
        }
        let (fd, kind, gate) = match self.table.find(ev.svid) {
            Some(entry) => match &entry.io {
                Some(io) => (io.fd, io.kind, entry.gate.clone()),
                None => return,
            },
            None => return,
        };

        match kind {
            IoKind::Listener => {
                let routeq = &mut self.routeq;
                let svid = ev.svid;
                socket::accept_all(fd, |conn, remote| {
                    routeq.push(Message {
                        from: ServiceId::MASTER,
                        to: svid,
                        body: Body::ConnInd { conn, remote },
                    });
                });
            }
            IoKind::Connecting => {
                if let Some(entry) = self.table.find_mut(ev.svid) {
                    if let Some(io) = &mut entry.io {
                        io.kind = IoKind::Stream;
                    }
                }
                self.routeq.push(Message {
                    from: ServiceId::MASTER,
                    to: ev.svid,
                    body: Body::ConnRsp {
                        fd,
                        masks: ev.masks,
                    },
                });
            }
            IoKind::Stream => {
                // accumulate; notify only on the empty -> pending edge
                let prev = gate.merge_masks(ev.masks);
                if prev.is_empty() {
                    self.routeq.push(Message {
                        from: ServiceId::MASTER,
                        to: ev.svid,
                        body: Body::Io {
                            fd,
                            masks: EventMask::NONE,
                        },
                    });
                }
            }
        }
    }

    fn flush_workers(&mut self) {
        for (i, w) in self.workers.iter().enumerate() {
            w.deliver(&mut self.pending[i]);
        }
    }

    /// Stop workers, join them, and free whatever is still queued.
    pub fn finish(&mut self) {
        let mut stop = Fifo::new();
        for w in &self.workers {
            stop.push(Delivery::Stop);
            w.deliver(&mut stop);
        }
        for w in &mut self.workers {
            if let Some(join) = w.join.take() {
                let _ = join.join();
            }
        }

        let mut q = std::mem::take(&mut *lock(&self.rt.inbox));
        let leftover = q.len();
        q.clear();
        let parked = self.table.clear();
        if leftover > 0 || parked > 0 {
            svc_debug!(
                "teardown dropped {} messages and {} services",
                leftover,
                parked
            );
        }
        svc_info!("master stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerShared;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use svcmux_core::{Control, Payload};

    fn test_master(nworkers: usize) -> (Master, Arc<RuntimeShared>) {
        let poller = Poller::new().unwrap();
        let rt = Arc::new(RuntimeShared::new(poller.waker()));
        let workers = (0..nworkers)
            .map(|_| WorkerHandle {
                shared: WorkerShared::new(),
                join: None,
            })
            .collect();
        let m = Master::new(&Config::new().workers(nworkers), poller, rt.clone(), workers);
        (m, rt)
    }

    fn noop_service(rt: &Arc<RuntimeShared>) -> Box<Service> {
        rt.build(Service::func(|_, _| Control::Done))
    }

    fn user_msg(to: ServiceId) -> Message {
        Message::user(ServiceId::MASTER, to, 1, Payload::Empty)
    }

    #[test]
    fn test_first_message_attaches_to_idle_worker() {
        let (mut m, rt) = test_master(2);
        let svc = noop_service(&rt);
        let svid = svc.svid;

        m.handle_control(Message::start(ServiceId::MASTER, svc));
        assert!(m.table.find(svid).is_some());
        assert_eq!(m.pool.weight(0), 0);

        m.route(user_msg(svid));
        // attached to the zero-weight worker, message in its mailbox
        assert_eq!(m.pool.weight(0), 1);
        assert_eq!(m.pending[0].len(), 1);
        match m.pending[0].pop().unwrap() {
            Delivery::Attach(svc) => {
                assert_eq!(svc.svid, svid);
                assert_eq!(svc.mailbox.len(), 1);
            }
            _ => panic!("expected attach delivery"),
        }

        // further messages ride as plain deliveries
        m.route(user_msg(svid));
        assert!(matches!(
            m.pending[0].pop().unwrap(),
            Delivery::Msg(_)
        ));
        assert_eq!(m.pool.weight(0), 1);
    }

    #[test]
    fn test_unknown_destination_discarded() {
        let (mut m, _rt) = test_master(1);
        m.route(user_msg(ServiceId::new(999_999)));
        assert!(m.pending[0].is_empty());
    }

    #[test]
    fn test_done_gate_blocks_reattach() {
        let (mut m, rt) = test_master(2);
        let svc = noop_service(&rt);
        let svid = svc.svid;
        let gate = svc.gate.clone();
        m.handle_control(Message::start(ServiceId::MASTER, svc));
        m.route(user_msg(svid));
        let Delivery::Attach(svc) = m.pending[0].pop().unwrap() else {
            panic!("expected attach");
        };

        // worker side completes the service
        gate.mark_done();

        // a message racing the completion report is discarded
        m.route(user_msg(svid));
        assert!(m.pending[0].is_empty());
        assert_eq!(m.pool.weight(0), 1);

        // the report itself reaps and releases the weight
        m.handle_control(Message {
            from: svid,
            to: ServiceId::MASTER,
            body: Body::Done(svc),
        });
        assert!(m.table.find(svid).is_none());
        assert_eq!(m.pool.weight(0), 0);
    }

    #[test]
    fn test_duplicate_report_is_harmless() {
        let (mut m, rt) = test_master(1);
        let svc = noop_service(&rt);
        let svid = svc.svid;
        m.handle_control(Message::start(ServiceId::MASTER, svc));
        m.route(user_msg(svid));
        let Delivery::Attach(svc) = m.pending[0].pop().unwrap() else {
            panic!("expected attach");
        };

        m.handle_control(Message {
            from: svid,
            to: ServiceId::MASTER,
            body: Body::Done(svc),
        });
        assert!(m.table.is_empty());

        // a stray second report only logs
        let stray = noop_service(&rt);
        m.handle_control(Message {
            from: stray.svid,
            to: ServiceId::MASTER,
            body: Body::Done(stray),
        });
        assert!(m.table.is_empty());
    }

    #[test]
    fn test_reap_drains_leftover_mailbox() {
        let (mut m, rt) = test_master(1);
        let svc = noop_service(&rt);
        let svid = svc.svid;
        m.handle_control(Message::start(ServiceId::MASTER, svc));
        m.route(user_msg(svid));
        let Delivery::Attach(mut svc) = m.pending[0].pop().unwrap() else {
            panic!("expected attach");
        };
        svc.mailbox.push(user_msg(svid));
        svc.mailbox.push(user_msg(svid));

        m.handle_control(Message {
            from: svid,
            to: ServiceId::MASTER,
            body: Body::Done(svc),
        });
        assert!(m.table.is_empty());
    }

    #[test]
    fn test_event_masks_accumulate_single_notification() {
        let (mut m, rt) = test_master(1);
        let svc = noop_service(&rt);
        let svid = svc.svid;
        let gate = svc.gate.clone();
        // table entry with a stream registration; fd never dereferenced here
        m.table.add(TableEntry {
            svid,
            gate: gate.clone(),
            io: Some(IoSlot {
                fd: 0,
                kind: IoKind::Stream,
            }),
            slot: Slot::Parked(svc),
        });

        m.dispatch_io(PollEvent {
            svid,
            masks: EventMask::READ,
        });
        m.dispatch_io(PollEvent {
            svid,
            masks: EventMask::WRITE,
        });

        // both masks pending, exactly one notification emitted
        assert_eq!(gate.pending_masks(), EventMask::READ | EventMask::WRITE);
        assert_eq!(m.routeq.len(), 1);
        match m.routeq.pop().unwrap().body {
            Body::Io { masks, .. } => assert!(masks.is_empty()),
            _ => panic!("expected io notification"),
        }
    }

    #[test]
    fn test_listener_readiness_accepts_and_forwards() {
        let (mut m, rt) = test_master(1);

        let lfd = socket::listen(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 16).unwrap();
        let port = match socket::local_addr(lfd.as_raw_fd()).unwrap() {
            std::net::SocketAddr::V4(a) => a.port(),
            other => panic!("unexpected addr {:?}", other),
        };

        let svc = rt.build(
            Service::func(|_, _| Control::Continue).listener(lfd, EventMask::READ),
        );
        let svid = svc.svid;
        m.handle_control(Message::start(ServiceId::MASTER, svc));

        // a real connection sits on the backlog before the event fires
        let client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();

        m.dispatch_io(PollEvent {
            svid,
            masks: EventMask::READ,
        });

        assert_eq!(m.routeq.len(), 1);
        let msg = m.routeq.pop().unwrap();
        assert_eq!(msg.to, svid);
        // a connection indication, not a readiness notification
        assert!(matches!(msg.body, Body::ConnInd { .. }));
        drop(client);
    }

    #[test]
    fn test_connecting_becomes_stream_after_response() {
        let (mut m, rt) = test_master(1);
        let svc = noop_service(&rt);
        let svid = svc.svid;
        m.table.add(TableEntry {
            svid,
            gate: svc.gate.clone(),
            io: Some(IoSlot {
                fd: 0,
                kind: IoKind::Connecting,
            }),
            slot: Slot::Parked(svc),
        });

        m.dispatch_io(PollEvent {
            svid,
            masks: EventMask::WRITE,
        });
        assert!(matches!(
            m.routeq.pop().unwrap().body,
            Body::ConnRsp { .. }
        ));
        assert_eq!(
            m.table.find(svid).unwrap().io.unwrap().kind,
            IoKind::Stream
        );

        // the next readiness is an ordinary notification
        m.dispatch_io(PollEvent {
            svid,
            masks: EventMask::READ,
        });
        assert!(matches!(m.routeq.pop().unwrap().body, Body::Io { .. }));
    }

    #[test]
    fn test_recycled_record_reused_for_next_spawn() {
        let (mut m, rt) = test_master(1);
        let svc = noop_service(&rt);
        let svid = svc.svid;
        m.handle_control(Message::start(ServiceId::MASTER, svc));
        m.route(user_msg(svid));
        let Delivery::Attach(svc) = m.pending[0].pop().unwrap() else {
            panic!("expected attach");
        };
        let old_ptr = &*svc as *const Service;
        m.handle_control(Message {
            from: svid,
            to: ServiceId::MASTER,
            body: Body::Done(svc),
        });

        // the reaped record comes back out of the free-list
        let reused = rt.build(Service::func(|_, _| Control::Done));
        assert_eq!(&*reused as *const Service, old_ptr);
        assert_ne!(reused.svid, svid);
        assert!(!reused.gate.is_done());
    }

    #[test]
    fn test_remote_destination_dropped() {
        let (mut m, _rt) = test_master(1);
        let remote = ServiceId::new(svcmux_core::constants::REMOTE_ID_BIT | 5);
        m.route(user_msg(remote));
        assert!(m.pending[0].is_empty());
    }
}
