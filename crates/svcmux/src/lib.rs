//! # svcmux - actor-style service runtime
//!
//! A master thread multiplexes I/O events and routes messages across a
//! pool of worker threads, each running lightweight services that
//! process messages to completion or yield.
//!
//! ## Quick Start
//!
//! ```ignore
//! use svcmux::{start_main_thread, Control, Payload, Service};
//!
//! fn main() {
//!     let code = start_main_thread(|handle| {
//!         // an actor that answers once and stops the runtime
//!         let svid = handle.spawn(Service::func(|cx, msg| {
//!             println!("got message from {}", msg.from);
//!             cx.shutdown();
//!             Control::Done
//!         }));
//!         handle.send(svid, 1, Payload::Empty);
//!         0
//!     });
//!     std::process::exit(code);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        User Code                         │
//! │        Service::func / Service::coroutine, Handle        │
//! └──────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  Master: poller + event bridge + service table + router  │
//! └──────────────────────────────────────────────────────────┘
//!              │ least-loaded assignment, per-worker batches
//!              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  Workers: mailbox drain, entry invocation, done reports  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Services communicate only through messages; a service signals
//! completion by returning [`Control::Done`] from its entry.

pub use svcmux_core::{
    constants, env, log, Body, Buffer, BufferPool, Control, EventMask, Fifo, Frame, IoKind,
    LogLevel, Message, Payload, Service, ServiceBuilder, ServiceCx, ServiceId,
};
pub use svcmux_core::{set_log_level, svc_debug, svc_error, svc_info, svc_trace, svc_warn};

pub use svcmux_runtime::{
    socket, start_main_thread, start_main_thread_with_args, Config, Handle, RtError, RtResult,
    Runtime,
};
