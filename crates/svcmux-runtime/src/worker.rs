//! Worker threads: the run loop that drives attached services.
//!
//! A worker blocks on its condition variable until the master delivers
//! a batch, splices the batch out under the inbox lock, integrates it
//! (attach records, fill mailboxes), runs every service with queued
//! messages, and flushes its outbound queue into the global inbound
//! queue in one splice. The completion report for a service is pushed
//! onto the same outbound queue as the service's own sends, so it can
//! never overtake them.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use svcmux_core::{svc_debug, svc_error};
use svcmux_core::{
    Body, BufferPool, Control, Entry, Fifo, FramePool, Message, Service, ServiceCx, ServiceId,
};

use crate::runtime::RuntimeShared;

/// Lock helper that survives a poisoned mutex; a panicking peer must
/// not take the whole runtime down with it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// What the master hands a worker.
pub(crate) enum Delivery {
    /// A service record changing owner; its mailbox already holds the
    /// message that triggered the attach.
    Attach(Box<Service>),
    /// A message for a service this worker already owns.
    Msg(Message),
    /// Leave the run loop.
    Stop,
}

pub(crate) struct Inbox {
    pub q: Fifo<Delivery>,
    /// True while the worker is parked on the condvar.
    pub waiting: bool,
}

/// The lock-and-signal pair the master uses to feed a worker.
pub(crate) struct WorkerShared {
    pub inbox: Mutex<Inbox>,
    pub available: Condvar,
}

impl WorkerShared {
    pub fn new() -> Arc<WorkerShared> {
        Arc::new(WorkerShared {
            inbox: Mutex::new(Inbox {
                q: Fifo::new(),
                waiting: false,
            }),
            available: Condvar::new(),
        })
    }
}

pub(crate) struct WorkerHandle {
    pub shared: Arc<WorkerShared>,
    pub join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Splice a batch into the worker's inbox, signaling only if it is
    /// parked.
    pub fn deliver(&self, batch: &mut Fifo<Delivery>) {
        if batch.is_empty() {
            return;
        }
        let was_waiting = {
            let mut g = lock(&self.shared.inbox);
            g.q.push_all(batch);
            let w = g.waiting;
            g.waiting = false;
            w
        };
        if was_waiting {
            self.shared.available.notify_one();
        }
    }
}

/// Thread entry point for a worker.
pub(crate) fn worker_main(
    index: usize,
    shared: Arc<WorkerShared>,
    rt: Arc<RuntimeShared>,
    idle_buffer_limit: usize,
) {
    svc_debug!("worker {} started", index);
    let mut state = WorkerState::new(index, shared, rt, idle_buffer_limit);
    state.run();
    svc_debug!("worker {} stopped", index);
}

/// Everything a worker thread owns. Nothing in here is shared: the
/// buffer pool, frame pool and service slab belong to this thread
/// alone.
pub(crate) struct WorkerState {
    index: usize,
    shared: Arc<WorkerShared>,
    rt: Arc<RuntimeShared>,
    /// Attached services, slab-style; vacant slots are recycled.
    services: Vec<Option<Box<Service>>>,
    free_slots: Vec<usize>,
    /// id -> slot for message delivery.
    by_id: HashMap<u32, usize>,
    /// Slots with a live service, scanned each cycle.
    runq: Vec<usize>,
    /// Outbound messages, flushed once per cycle.
    outbox: Fifo<Message>,
    buffers: BufferPool,
    frames: FramePool,
    running: bool,
}

impl WorkerState {
    pub fn new(
        index: usize,
        shared: Arc<WorkerShared>,
        rt: Arc<RuntimeShared>,
        idle_buffer_limit: usize,
    ) -> WorkerState {
        WorkerState {
            index,
            shared,
            rt,
            services: Vec::new(),
            free_slots: Vec::new(),
            by_id: HashMap::new(),
            runq: Vec::new(),
            outbox: Fifo::new(),
            buffers: BufferPool::new(idle_buffer_limit),
            frames: FramePool::new(index as u32),
            running: true,
        }
    }

    pub fn run(&mut self) {
        while self.running {
            let mut batch = self.wait_for_batch();
            while let Some(d) = batch.pop() {
                self.integrate(d);
            }
            self.run_services();
            self.flush();
        }
    }

    /// Park until the master delivers something, then take the batch.
    fn wait_for_batch(&mut self) -> Fifo<Delivery> {
        let mut g = lock(&self.shared.inbox);
        while g.q.is_empty() {
            g.waiting = true;
            g = match self.shared.available.wait(g) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        std::mem::take(&mut g.q)
    }

    fn integrate(&mut self, d: Delivery) {
        match d {
            Delivery::Attach(svc) => {
                let slot = match self.free_slots.pop() {
                    Some(s) => s,
                    None => {
                        self.services.push(None);
                        self.services.len() - 1
                    }
                };
                self.by_id.insert(svc.svid.as_u32(), slot);
                svc_debug!("worker {}: service {} attached", self.index, svc.svid);
                self.services[slot] = Some(svc);
                self.runq.push(slot);
            }
            Delivery::Msg(msg) => match self.by_id.get(&msg.to.as_u32()) {
                Some(&slot) => match self.services[slot].as_mut() {
                    Some(svc) => svc.mailbox.push(msg),
                    None => svc_error!("worker {}: slot {} empty for {}", self.index, slot, msg.to),
                },
                None => {
                    svc_debug!(
                        "worker {}: {} message for vanished service {} dropped",
                        self.index,
                        msg.kind_name(),
                        msg.to
                    );
                }
            },
            Delivery::Stop => {
                self.running = false;
            }
        }
    }

    /// Run every service with queued messages; completed ones leave
    /// the run queue immediately.
    fn run_services(&mut self) {
        let mut i = 0;
        while i < self.runq.len() {
            let slot = self.runq[i];
            if self.run_one(slot) {
                self.runq.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Drain one service's mailbox. Returns true when the service
    /// completed and must not be scheduled again.
    fn run_one(&mut self, slot: usize) -> bool {
        let Some(mut svc) = self.services[slot].take() else {
            // stale run-queue entry
            return true;
        };

        let mut done = false;
        while let Some(mut msg) = svc.mailbox.pop() {
            if !self.resolve(&mut svc, &mut msg) {
                continue;
            }
            if matches!(self.invoke(&mut svc, &msg), Control::Done) {
                done = true;
                break;
            }
        }

        if done {
            self.complete(slot, svc);
            true
        } else {
            self.services[slot] = Some(svc);
            false
        }
    }

    /// Fill in gate-held readiness and filter messages that no longer
    /// apply. Returns false to discard the message.
    fn resolve(&mut self, svc: &mut Service, msg: &mut Message) -> bool {
        match &mut msg.body {
            Body::Io { masks, .. } => {
                if svc.io.is_none() {
                    svc_debug!(
                        "worker {}: io notification for service {} without registration",
                        self.index,
                        svc.svid
                    );
                    return false;
                }
                *masks = svc.gate.take_masks();
                // readiness already consumed by an earlier notification
                !masks.is_empty()
            }
            Body::ConnRsp { .. } if svc.io.is_none() => {
                svc_debug!(
                    "worker {}: connect response for service {} without registration",
                    self.index,
                    svc.svid
                );
                false
            }
            _ => true,
        }
    }

    fn invoke(&mut self, svc: &mut Service, msg: &Message) -> Control {
        let Service {
            svid,
            entry,
            data,
            io,
            frame,
            ..
        } = svc;
        match entry {
            Entry::Func(f) => {
                let mut cx = ServiceCx::assemble(
                    *svid,
                    &mut self.outbox,
                    &mut self.buffers,
                    &self.rt.ids,
                    data,
                    io,
                );
                f(&mut cx, msg)
            }
            Entry::Coro(f) => {
                let fr = frame.get_or_insert_with(|| self.frames.acquire());
                if fr.home() != self.index as u32 {
                    svc_error!(
                        "worker {}: service {} frame belongs to worker {}; message dropped",
                        self.index,
                        svid,
                        fr.home()
                    );
                    return Control::Continue;
                }
                let mut cx = ServiceCx::assemble(
                    *svid,
                    &mut self.outbox,
                    &mut self.buffers,
                    &self.rt.ids,
                    data,
                    io,
                );
                f(fr, &mut cx, msg)
            }
        }
    }

    /// Detach a finished service and report completion. The record
    /// itself travels inside the report; the master reaps it there.
    fn complete(&mut self, slot: usize, mut svc: Box<Service>) {
        if let Some(frame) = svc.frame.take() {
            self.frames.release(frame);
        }
        self.by_id.remove(&svc.svid.as_u32());
        self.free_slots.push(slot);
        svc.gate.mark_done();
        svc_debug!("worker {}: service {} done", self.index, svc.svid);
        let svid = svc.svid;
        self.outbox.push(Message {
            from: svid,
            to: ServiceId::MASTER,
            body: Body::Done(svc),
        });
    }

    /// Push everything sent this cycle into the global inbound queue
    /// in one splice, then wake the master.
    fn flush(&mut self) {
        if self.outbox.is_empty() {
            return;
        }
        {
            let mut q = lock(&self.rt.inbox);
            q.push_all(&mut self.outbox);
        }
        self.rt.waker.wake();
    }
}
