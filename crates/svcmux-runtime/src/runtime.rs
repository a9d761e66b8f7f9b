//! Runtime construction and the process-facing entry points.
//!
//! All runtime state lives in an explicit context: the shared half
//! ([`RuntimeShared`]: global inbound queue, waker, id seed, record
//! free-list) and the master ([`crate::master::Master`]), built once
//! at startup and torn down once at shutdown. There are no ambient
//! globals beyond the log sink.
//!
//! The usual shape of a program:
//!
//! ```ignore
//! use svcmux_runtime::start_main_thread;
//! use svcmux_core::{Control, Service};
//!
//! fn main() {
//!     let code = start_main_thread(|handle| {
//!         handle.spawn(Service::func(|cx, _msg| {
//!             cx.shutdown();
//!             Control::Done
//!         }));
//!         0
//!     });
//!     std::process::exit(code);
//! }
//! ```

use std::sync::{Arc, Mutex};
use std::thread;

use svcmux_core::constants::FREE_SERVICE_LIMIT;
use svcmux_core::{log, svc_error, svc_info};
use svcmux_core::{Fifo, IdSeed, Message, Payload, Service, ServiceBuilder, ServiceId};

use crate::config::Config;
use crate::error::{RtError, RtResult};
use crate::master::Master;
use crate::poller::{Poller, Waker};
use crate::worker::{lock, worker_main, Delivery, WorkerHandle, WorkerShared};

/// State shared by the master, the workers and every [`Handle`].
pub(crate) struct RuntimeShared {
    /// Global inbound queue: everything the master has not routed yet.
    pub inbox: Mutex<Fifo<Message>>,
    /// Interrupts the master's poll wait after a send.
    pub waker: Waker,
    /// Id generator for spawned services.
    pub ids: IdSeed,
    /// Recycled service records.
    free: Mutex<Vec<Box<Service>>>,
}

impl RuntimeShared {
    pub fn new(waker: Waker) -> RuntimeShared {
        RuntimeShared {
            inbox: Mutex::new(Fifo::new()),
            waker,
            ids: IdSeed::new(),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Queue a message for the master and wake it.
    pub fn post(&self, msg: Message) {
        lock(&self.inbox).push(msg);
        self.waker.wake();
    }

    /// Materialize a builder, preferring a recycled record.
    pub fn build(&self, builder: ServiceBuilder) -> Box<Service> {
        let recycled = lock(&self.free).pop();
        builder.build(&self.ids, recycled)
    }

    /// Keep a reaped record for reuse, up to the free-list cap.
    pub fn recycle(&self, svc: Box<Service>) {
        let mut free = lock(&self.free);
        if free.len() < FREE_SERVICE_LIMIT {
            free.push(svc);
        }
    }
}

/// Cloneable front door to a running (or starting) runtime.
///
/// Available to the bootstrap function and any thread that is not a
/// worker; services themselves use their [`svcmux_core::ServiceCx`].
#[derive(Clone)]
pub struct Handle {
    shared: Arc<RuntimeShared>,
}

impl Handle {
    /// Create and start a service; returns its id.
    pub fn spawn(&self, builder: ServiceBuilder) -> ServiceId {
        let svc = self.shared.build(builder);
        let svid = svc.svid;
        self.shared.post(Message::start(ServiceId::MASTER, svc));
        svid
    }

    /// Send a user message.
    pub fn send(&self, to: ServiceId, code: u32, payload: Payload) {
        self.shared.post(Message::user(ServiceId::MASTER, to, code, payload));
    }

    /// Queue a fully-formed message.
    pub fn post(&self, msg: Message) {
        self.shared.post(msg);
    }

    /// Ask the master to stop.
    pub fn shutdown(&self) {
        self.shared.post(Message::shutdown(ServiceId::MASTER));
    }
}

struct Boot {
    poller: Poller,
    rt: Arc<RuntimeShared>,
    workers: Vec<WorkerHandle>,
}

/// A configured, not-yet-running runtime.
pub struct Runtime {
    cfg: Config,
}

impl Runtime {
    pub fn new(cfg: Config) -> Runtime {
        Runtime {
            cfg: cfg.sanitize(),
        }
    }

    /// Spawn workers, run `start` on the master thread, then run the
    /// master loop until shutdown. Returns `start`'s exit code.
    pub fn run<F>(self, start: F) -> i32
    where
        F: FnOnce(&Handle) -> i32,
    {
        log::init_sink(&self.cfg.log_file, self.cfg.log_buffer_size);

        let boot = match self.boot() {
            Ok(b) => b,
            Err(e) => {
                svc_error!("runtime startup failed: {}", e);
                return 1;
            }
        };
        let Boot {
            poller,
            rt,
            workers,
        } = boot;

        let handle = Handle { shared: rt.clone() };
        let code = start(&handle);

        let mut master = Master::new(&self.cfg, poller, rt, workers);
        master.run();
        master.finish();
        log::flush();
        code
    }

    fn boot(&self) -> RtResult<Boot> {
        let poller = Poller::new()?;
        let rt = Arc::new(RuntimeShared::new(poller.waker()));
        svc_info!(
            "svcmux starting: {} workers, {} table buckets",
            self.cfg.workers,
            1usize << self.cfg.table_size_bits
        );

        let mut workers: Vec<WorkerHandle> = Vec::with_capacity(self.cfg.workers);
        for i in 0..self.cfg.workers {
            let shared = WorkerShared::new();
            let worker_shared = shared.clone();
            let worker_rt = rt.clone();
            let idle_limit = self.cfg.idle_buffer_limit;
            let spawned = thread::Builder::new()
                .name(format!("svcmux-worker-{}", i))
                .spawn(move || worker_main(i, worker_shared, worker_rt, idle_limit));
            match spawned {
                Ok(join) => workers.push(WorkerHandle {
                    shared,
                    join: Some(join),
                }),
                Err(e) => {
                    stop_workers(&mut workers);
                    return Err(RtError::WorkerSpawn(e));
                }
            }
        }
        Ok(Boot {
            poller,
            rt,
            workers,
        })
    }
}

fn stop_workers(workers: &mut Vec<WorkerHandle>) {
    let mut stop = Fifo::new();
    for w in workers.iter() {
        stop.push(Delivery::Stop);
        w.deliver(&mut stop);
    }
    for w in workers.iter_mut() {
        if let Some(join) = w.join.take() {
            let _ = join.join();
        }
    }
}

/// Initialize the runtime from the environment, run `start` on the
/// master thread, and drive the loop until shutdown.
pub fn start_main_thread<F>(start: F) -> i32
where
    F: FnOnce(&Handle) -> i32,
{
    Runtime::new(Config::from_env()).run(start)
}

/// Same as [`start_main_thread`], with command-line flags applied on
/// top of the environment configuration.
pub fn start_main_thread_with_args<F>(start: F, args: &[String]) -> i32
where
    F: FnOnce(&Handle) -> i32,
{
    Runtime::new(Config::from_env().apply_args(args)).run(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use svcmux_core::{Body, Control, EventMask, Frame, ServiceCx};

    #[test]
    fn test_service_lifecycle_end_to_end() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        let code = Runtime::new(Config::new().workers(2)).run(|handle| {
            let svid = handle.spawn(Service::func(move |cx, _msg| {
                hits2.fetch_add(1, Ordering::SeqCst);
                cx.shutdown();
                Control::Done
            }));
            handle.send(svid, 1, Payload::Empty);
            7
        });

        assert_eq!(code, 7);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_message_to_unknown_service_is_harmless() {
        let code = Runtime::new(Config::new().workers(1)).run(|handle| {
            handle.send(ServiceId::new(987_654), 1, Payload::Empty);
            let svid = handle.spawn(Service::func(|cx, _| {
                cx.shutdown();
                Control::Done
            }));
            handle.send(svid, 2, Payload::Empty);
            0
        });
        assert_eq!(code, 0);
    }

    const PING: u32 = 1;
    const PONG: u32 = 2;
    const KICK: u32 = 3;
    const ROUNDS: u64 = 3;

    struct PingState {
        pong: ServiceId,
        replies: Arc<AtomicUsize>,
    }

    fn ping_coro(frame: &mut Frame, cx: &mut ServiceCx<'_>, msg: &Message) -> Control {
        let (pong, replies) = match cx.data_mut::<PingState>() {
            Some(s) => (s.pong, s.replies.clone()),
            None => return Control::Done,
        };
        match &msg.body {
            Body::User { code: KICK, .. } => {
                cx.send(pong, PING, Payload::Word(frame.step() as u64));
                Control::Continue
            }
            Body::User { code: PONG, .. } => {
                replies.fetch_add(1, Ordering::SeqCst);
                frame.advance();
                if (frame.step() as u64) < ROUNDS {
                    cx.send(pong, PING, Payload::Word(frame.step() as u64));
                    Control::Continue
                } else {
                    cx.shutdown();
                    Control::Done
                }
            }
            _ => Control::Continue,
        }
    }

    #[test]
    fn test_ping_pong_across_workers() {
        let replies = Arc::new(AtomicUsize::new(0));
        let replies2 = replies.clone();

        let code = Runtime::new(Config::new().workers(2)).run(move |handle| {
            let pong = handle.spawn(Service::func(|cx, msg| {
                if let Body::User { code: PING, payload } = &msg.body {
                    let n = payload.word().unwrap_or(0);
                    cx.send(msg.from, PONG, Payload::Word(n));
                }
                Control::Continue
            }));

            let ping = handle.spawn(Service::coroutine(ping_coro).data(PingState {
                pong,
                replies: replies2,
            }));
            handle.send(ping, KICK, Payload::Empty);
            0
        });

        assert_eq!(code, 0);
        assert_eq!(replies.load(Ordering::SeqCst), ROUNDS as usize);
    }

    #[test]
    fn test_listener_accepts_real_connection() {
        let lfd = socket::listen(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 16).unwrap();
        let port = match socket::local_addr(lfd.as_raw_fd()).unwrap() {
            SocketAddr::V4(a) => a.port(),
            other => panic!("unexpected addr {:?}", other),
        };

        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted2 = accepted.clone();

        let connector = std::thread::spawn(move || {
            let stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
            // hold the connection until the runtime saw it
            std::thread::sleep(std::time::Duration::from_millis(200));
            drop(stream);
        });

        let code = Runtime::new(Config::new().workers(2)).run(move |handle| {
            handle.spawn(
                Service::func(move |cx, msg| match &msg.body {
                    Body::ConnInd { .. } => {
                        accepted2.fetch_add(1, Ordering::SeqCst);
                        cx.shutdown();
                        Control::Done
                    }
                    _ => Control::Continue,
                })
                .listener(lfd, EventMask::READ),
            );
            0
        });

        connector.join().unwrap();
        assert_eq!(code, 0);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }
}

