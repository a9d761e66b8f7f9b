//! # svcmux-core
//!
//! Core types for the svcmux service runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The scheduler, the poller and the socket layer live in `svcmux-runtime`.
//!
//! ## Modules
//!
//! - `id` - service identifier type and id generation
//! - `queue` - FIFO message queue with O(1) batch splicing
//! - `event` - I/O readiness masks and registration kinds
//! - `message` - message envelope, body variants and payloads
//! - `buffer` - per-thread reusable buffer pool
//! - `frame` - coroutine frames and the per-worker frame pool
//! - `service` - service records, builder and the service-side context
//! - `log` - leveled print macros with a configurable sink
//! - `env` - environment variable helpers

#![allow(dead_code)]

pub mod id;
pub mod queue;
pub mod event;
pub mod message;
pub mod buffer;
pub mod frame;
pub mod service;
pub mod log;
pub mod env;

// Re-exports for convenience
pub use id::{IdSeed, ServiceId};
pub use queue::Fifo;
pub use event::{EventMask, IoKind};
pub use message::{Body, Message, Payload};
pub use buffer::{Buffer, BufferPool};
pub use frame::{Frame, FramePool};
pub use service::{
    Control, Entry, IoRegistration, Service, ServiceBuilder, ServiceCx, ServiceGate,
};
pub use log::{set_log_level, LogLevel};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};

/// Constants shared by the whole runtime
pub mod constants {
    /// Maximum worker threads
    pub const MAX_WORKERS: usize = 64;

    /// First id handed out by the id generator. Ids below this value are
    /// reserved for explicitly-named services.
    pub const MIN_SPAWNED_ID: u32 = 1 << 20;

    /// High bit of a destination id marks a remote destination.
    pub const REMOTE_ID_BIT: u32 = 0x8000_0000;

    /// Largest single buffer the buffer pool will hand out.
    pub const MAX_BUFFER_SIZE: usize = 1 << 31;

    /// Recycled service records kept around before falling back to the
    /// allocator.
    pub const FREE_SERVICE_LIMIT: usize = 256;
}
