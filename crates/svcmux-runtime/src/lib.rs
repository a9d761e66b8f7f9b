//! # svcmux-runtime
//!
//! The scheduling engine of the svcmux service runtime: one master
//! thread owning the poller, the service table and the load heap, plus
//! N worker threads running attached services.
//!
//! ## Modules
//!
//! - `config` - runtime configuration (env overrides, silent clamping)
//! - `error` - startup error types
//! - `pool` - least-loaded worker selection
//! - `table` - the master's service table
//! - `poller` - epoll + eventfd wakeup behind wait/add/del
//! - `socket` - thin non-blocking socket layer
//! - `master` - the dispatch loop and event bridge
//! - `worker` - the worker run loop
//! - `runtime` - construction and process-facing entry points
//!
//! ## Control flow
//!
//! ```text
//! poller events ──► master ──► global inbound queue drained
//!                     │
//!                     ├─ control messages (start/done/watch/shutdown)
//!                     └─ routed messages ──► per-worker batches
//!                                               │ (inbox lock + condvar)
//!                                               ▼
//!                                worker drains mailboxes, runs entries,
//!                                flushes outbound batch, reports done
//! ```

#![allow(dead_code)]

pub mod config;
pub mod error;
pub(crate) mod pool;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub(crate) mod table;
        pub(crate) mod poller;
        pub mod socket;
        pub(crate) mod worker;
        pub(crate) mod master;
        pub mod runtime;

        pub use runtime::{start_main_thread, start_main_thread_with_args, Handle, Runtime};
    }
}

pub use config::Config;
pub use error::{RtError, RtResult};
