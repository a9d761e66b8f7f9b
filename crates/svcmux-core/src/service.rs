//! Service records, builder and the service-side context.
//!
//! A service is a unit of actor-style work: an id, a mailbox, and an
//! entry point. Ownership of the record moves with the lifecycle:
//! the master holds it while parked, the owning worker while attached,
//! and the completion report carries it back to the master for reaping.

use std::any::Any;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use crate::buffer::{Buffer, BufferPool};
use crate::event::{EventMask, IoKind};
use crate::frame::Frame;
use crate::id::{IdSeed, ServiceId};
use crate::message::{Body, Message, Payload};
use crate::queue::Fifo;

/// What the entry point tells the scheduler after handling a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Keep the service alive and wait for more messages. For a
    /// coroutine entry this is the yield: the frame is retained.
    Continue,
    /// The service is finished; the worker detaches it and reports
    /// completion to the master.
    Done,
}

/// Plain resumable entry: invoked once per message.
pub type FuncEntry = Box<dyn FnMut(&mut ServiceCx<'_>, &Message) -> Control + Send>;

/// Coroutine entry: resumed with its frame once per message; may carry
/// state across resumes in the frame.
pub type CoroEntry = fn(&mut Frame, &mut ServiceCx<'_>, &Message) -> Control;

/// A service's entry point.
pub enum Entry {
    Func(FuncEntry),
    Coro(CoroEntry),
}

/// State shared between the master and the owning worker.
///
/// `done` is set by the worker when the entry returns [`Control::Done`]
/// and checked by the master before routing; a message that races with
/// completion is discarded instead of re-attaching a dying service.
/// `pending` accumulates readiness masks between dispatch cycles.
pub struct ServiceGate {
    done: AtomicBool,
    pending: AtomicU16,
}

impl ServiceGate {
    fn new() -> Arc<Self> {
        Arc::new(ServiceGate {
            done: AtomicBool::new(false),
            pending: AtomicU16::new(0),
        })
    }

    #[inline]
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Or `masks` into the pending set; returns the previous set so the
    /// caller can detect the 0 -> nonzero transition.
    #[inline]
    pub fn merge_masks(&self, masks: EventMask) -> EventMask {
        EventMask::from_bits(self.pending.fetch_or(masks.bits(), Ordering::AcqRel))
    }

    /// Drain the pending set.
    #[inline]
    pub fn take_masks(&self) -> EventMask {
        EventMask::from_bits(self.pending.swap(0, Ordering::AcqRel))
    }

    /// Snapshot of the pending set without draining it.
    #[inline]
    pub fn pending_masks(&self) -> EventMask {
        EventMask::from_bits(self.pending.load(Ordering::Acquire))
    }
}

/// A descriptor the service watches through the master's poller.
///
/// The service owns the descriptor; the master keeps only a raw copy
/// for dispatch, so the fd stays valid for as long as the record lives.
pub struct IoRegistration {
    pub fd: OwnedFd,
    pub masks: EventMask,
    pub kind: IoKind,
}

impl IoRegistration {
    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A unit of actor-style concurrent work.
///
/// Fields are public for the runtime crate; user code goes through
/// [`ServiceBuilder`] and [`ServiceCx`] instead.
pub struct Service {
    /// Unique id, assigned at build time. Never zero.
    pub svid: ServiceId,
    pub entry: Entry,
    /// Undelivered messages. Only the owning worker pops.
    pub mailbox: Fifo<Message>,
    pub gate: Arc<ServiceGate>,
    /// Watched descriptor, if any.
    pub io: Option<IoRegistration>,
    /// Opaque user data.
    pub data: Option<Box<dyn Any + Send>>,
    /// Coroutine frame while suspended; `None` for function services.
    pub frame: Option<Box<Frame>>,
}

fn vacant_entry(_: &mut Frame, _: &mut ServiceCx<'_>, _: &Message) -> Control {
    Control::Done
}

impl Service {
    /// Start describing a function-based service.
    pub fn func<F>(f: F) -> ServiceBuilder
    where
        F: FnMut(&mut ServiceCx<'_>, &Message) -> Control + Send + 'static,
    {
        ServiceBuilder::new(Entry::Func(Box::new(f)))
    }

    /// Start describing a coroutine-based service.
    pub fn coroutine(f: CoroEntry) -> ServiceBuilder {
        ServiceBuilder::new(Entry::Coro(f))
    }

    /// An empty record for the recycling free-list.
    pub fn vacant() -> Service {
        Service {
            svid: ServiceId::MASTER,
            entry: Entry::Coro(vacant_entry),
            mailbox: Fifo::new(),
            gate: ServiceGate::new(),
            io: None,
            data: None,
            frame: None,
        }
    }

    /// Reinitialize a recycled record for a new lifetime. The gate is
    /// replaced: in-flight references to the old lifetime's gate must
    /// keep seeing `done`.
    pub fn reset(
        &mut self,
        svid: ServiceId,
        entry: Entry,
        data: Option<Box<dyn Any + Send>>,
        io: Option<IoRegistration>,
    ) {
        self.svid = svid;
        self.entry = entry;
        self.mailbox.clear();
        self.gate = ServiceGate::new();
        self.io = io;
        self.data = data;
        self.frame = None;
    }
}

/// Describes a service before it is started.
pub struct ServiceBuilder {
    entry: Entry,
    data: Option<Box<dyn Any + Send>>,
    io: Option<IoRegistration>,
    svid: Option<ServiceId>,
}

impl ServiceBuilder {
    fn new(entry: Entry) -> Self {
        ServiceBuilder {
            entry,
            data: None,
            io: None,
            svid: None,
        }
    }

    /// Attach opaque user data, readable via [`ServiceCx::data_mut`].
    pub fn data<T: Any + Send>(mut self, value: T) -> Self {
        self.data = Some(Box::new(value));
        self
    }

    /// Watch an established stream descriptor.
    pub fn watch(mut self, fd: OwnedFd, masks: EventMask) -> Self {
        self.io = Some(IoRegistration {
            fd,
            masks,
            kind: IoKind::Stream,
        });
        self
    }

    /// Watch a listening socket; readiness becomes accepted connections.
    pub fn listener(mut self, fd: OwnedFd, masks: EventMask) -> Self {
        self.io = Some(IoRegistration {
            fd,
            masks,
            kind: IoKind::Listener,
        });
        self
    }

    /// Watch a non-blocking connect in flight.
    pub fn connecting(mut self, fd: OwnedFd, masks: EventMask) -> Self {
        self.io = Some(IoRegistration {
            fd,
            masks,
            kind: IoKind::Connecting,
        });
        self
    }

    /// Use an explicit id from the reserved range instead of a
    /// generated one. Uniqueness is the caller's responsibility.
    pub fn id(mut self, svid: ServiceId) -> Self {
        self.svid = Some(svid);
        self
    }

    /// Materialize the record, reusing `recycled` when provided.
    pub fn build(self, ids: &IdSeed, recycled: Option<Box<Service>>) -> Box<Service> {
        let svid = self.svid.unwrap_or_else(|| ids.next());
        match recycled {
            Some(mut svc) => {
                svc.reset(svid, self.entry, self.data, self.io);
                svc
            }
            None => Box::new(Service {
                svid,
                entry: self.entry,
                mailbox: Fifo::new(),
                gate: ServiceGate::new(),
                io: self.io,
                data: self.data,
                frame: None,
            }),
        }
    }
}

/// What a running service sees while its entry handles a message.
///
/// Borrowed pieces of the record plus the owning worker's outbound
/// queue, buffer pool and the shared id seed. Everything a service
/// sends leaves through `out` and is flushed with the worker's batch,
/// which is what keeps the completion report ordered after the
/// service's own messages.
pub struct ServiceCx<'a> {
    svid: ServiceId,
    out: &'a mut Fifo<Message>,
    buffers: &'a mut BufferPool,
    ids: &'a IdSeed,
    data: &'a mut Option<Box<dyn Any + Send>>,
    io: &'a mut Option<IoRegistration>,
}

impl<'a> ServiceCx<'a> {
    /// Assemble a context from its borrowed parts. Runtime-internal.
    pub fn assemble(
        svid: ServiceId,
        out: &'a mut Fifo<Message>,
        buffers: &'a mut BufferPool,
        ids: &'a IdSeed,
        data: &'a mut Option<Box<dyn Any + Send>>,
        io: &'a mut Option<IoRegistration>,
    ) -> Self {
        ServiceCx {
            svid,
            out,
            buffers,
            ids,
            data,
            io,
        }
    }

    /// This service's id.
    #[inline]
    pub fn id(&self) -> ServiceId {
        self.svid
    }

    /// Send a user message to another service.
    pub fn send(&mut self, to: ServiceId, code: u32, payload: Payload) {
        self.out.push(Message::user(self.svid, to, code, payload));
    }

    /// Queue a fully-formed message.
    pub fn post(&mut self, msg: Message) {
        self.out.push(msg);
    }

    /// Create and start a new service; returns its id.
    pub fn spawn(&mut self, builder: ServiceBuilder) -> ServiceId {
        let svc = builder.build(self.ids, None);
        let svid = svc.svid;
        self.out.push(Message::start(self.svid, svc));
        svid
    }

    /// Ask the master to stop the runtime.
    pub fn shutdown(&mut self) {
        self.out.push(Message::shutdown(self.svid));
    }

    /// Raw descriptor of the watched registration, if any.
    pub fn event_fd(&self) -> Option<RawFd> {
        self.io.as_ref().map(|r| r.raw_fd())
    }

    /// Start watching a descriptor mid-life. The service owns the fd;
    /// the master registers it with the poller.
    pub fn watch_event(&mut self, fd: OwnedFd, masks: EventMask, kind: IoKind) {
        let raw = fd.as_raw_fd();
        *self.io = Some(IoRegistration { fd, masks, kind });
        self.out.push(Message {
            from: self.svid,
            to: ServiceId::MASTER,
            body: Body::WatchEvent {
                svid: self.svid,
                fd: raw,
                masks,
                kind,
            },
        });
    }

    /// Stop watching and close the registered descriptor.
    pub fn remove_event(&mut self) {
        if let Some(reg) = self.io.take() {
            self.out.push(Message {
                from: self.svid,
                to: ServiceId::MASTER,
                body: Body::DropEvent {
                    svid: self.svid,
                    fd: reg.fd,
                },
            });
        }
    }

    /// Replace the service's user data.
    pub fn set_data<T: Any + Send>(&mut self, value: T) {
        *self.data = Some(Box::new(value));
    }

    /// Borrow the service's user data.
    pub fn data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.data.as_mut().and_then(|b| b.downcast_mut::<T>())
    }

    /// Get a buffer from the worker's pool.
    pub fn acquire_buffer(&mut self, min_size: usize) -> Buffer {
        self.buffers.acquire(min_size)
    }

    /// Return a buffer to the worker's pool.
    pub fn release_buffer(&mut self, buf: Buffer) {
        self.buffers.release(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cx_parts() -> (Fifo<Message>, BufferPool, IdSeed) {
        (Fifo::new(), BufferPool::new(1 << 20), IdSeed::new())
    }

    #[test]
    fn test_builder_assigns_generated_id() {
        let ids = IdSeed::new();
        let svc = Service::func(|_, _| Control::Done).build(&ids, None);
        assert!(svc.svid.as_u32() >= crate::constants::MIN_SPAWNED_ID);
        assert!(!svc.gate.is_done());
        assert!(svc.mailbox.is_empty());
    }

    #[test]
    fn test_builder_honors_explicit_id() {
        let ids = IdSeed::new();
        let svc = Service::func(|_, _| Control::Done)
            .id(ServiceId::new(77))
            .build(&ids, None);
        assert_eq!(svc.svid.as_u32(), 77);
    }

    #[test]
    fn test_builder_reuses_recycled_record() {
        let ids = IdSeed::new();
        let mut old = Service::func(|_, _| Control::Done).build(&ids, None);
        old.gate.mark_done();
        let old_gate = old.gate.clone();

        let svc = Service::func(|_, _| Control::Continue).build(&ids, Some(old));
        // fresh lifetime: new gate, stale references still see done
        assert!(!svc.gate.is_done());
        assert!(old_gate.is_done());
        assert!(svc.data.is_none());
    }

    #[test]
    fn test_gate_mask_accumulation() {
        let gate = ServiceGate::new();
        let old = gate.merge_masks(EventMask::READ);
        assert!(old.is_empty());
        let old = gate.merge_masks(EventMask::WRITE);
        assert_eq!(old, EventMask::READ);
        assert_eq!(gate.take_masks(), EventMask::READ | EventMask::WRITE);
        assert!(gate.take_masks().is_empty());
    }

    #[test]
    fn test_cx_send_and_spawn() {
        let (mut out, mut buffers, ids) = cx_parts();
        let mut data = None;
        let mut io = None;
        let mut cx = ServiceCx::assemble(
            ServiceId::new(9),
            &mut out,
            &mut buffers,
            &ids,
            &mut data,
            &mut io,
        );

        cx.send(ServiceId::new(10), 1, Payload::Word(5));
        let spawned = cx.spawn(Service::func(|_, _| Control::Done));
        cx.shutdown();

        assert_eq!(out.len(), 3);
        let m = out.pop().unwrap();
        assert_eq!(m.to.as_u32(), 10);
        let m = out.pop().unwrap();
        assert!(m.to.is_master());
        match m.body {
            Body::Start(svc) => assert_eq!(svc.svid, spawned),
            _ => panic!("expected start"),
        }
        assert!(matches!(out.pop().unwrap().body, Body::Shutdown));
    }

    #[test]
    fn test_cx_data_roundtrip() {
        let (mut out, mut buffers, ids) = cx_parts();
        let mut data = None;
        let mut io = None;
        let mut cx = ServiceCx::assemble(
            ServiceId::new(9),
            &mut out,
            &mut buffers,
            &ids,
            &mut data,
            &mut io,
        );
        cx.set_data(41u32);
        *cx.data_mut::<u32>().unwrap() += 1;
        assert_eq!(*cx.data_mut::<u32>().unwrap(), 42);
        assert!(cx.data_mut::<String>().is_none());
    }
}
