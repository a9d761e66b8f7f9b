//! Message envelope, body variants and payloads.
//!
//! A message belongs to exactly one queue at a time; ownership moves
//! with the value when it is pushed or popped. Dropping a message frees
//! whatever it carries: an `Owned` payload's bytes, or the accepted
//! socket inside a `ConnInd`.

use std::net::SocketAddr;
use std::os::fd::{OwnedFd, RawFd};

use crate::event::{EventMask, IoKind};
use crate::id::ServiceId;
use crate::service::Service;

/// Data attached to a `User` message.
///
/// `Owned` bytes are freed when the message is dropped; `Static` bytes
/// are borrowed for the program's lifetime and never freed.
pub enum Payload {
    Empty,
    Word(u64),
    Owned(Box<[u8]>),
    Static(&'static [u8]),
}

impl Payload {
    /// View the payload bytes, if it carries any.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Owned(b) => Some(b),
            Payload::Static(b) => Some(b),
            _ => None,
        }
    }

    /// Inline scalar value, if present.
    pub fn word(&self) -> Option<u64> {
        match self {
            Payload::Word(w) => Some(*w),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

/// What a message carries. Control variants are master-destined; the
/// rest are delivered to service mailboxes.
pub enum Body {
    /// Bring a new service online (record travels inside).
    Start(Box<Service>),
    /// Completion report: the worker hands the finished record back to
    /// the master for table removal and recycling. Sent exactly once
    /// per service lifetime.
    Done(Box<Service>),
    /// Register a descriptor with the poller for the named service.
    WatchEvent {
        svid: ServiceId,
        fd: RawFd,
        masks: EventMask,
        kind: IoKind,
    },
    /// Deregister and close a descriptor. The fd travels owned so a
    /// dropped message still closes it.
    DropEvent { svid: ServiceId, fd: OwnedFd },
    /// Stop the master loop.
    Shutdown,

    /// Readiness notification. Masks are resolved from the service's
    /// pending gate when the worker processes the message.
    Io { fd: RawFd, masks: EventMask },
    /// A connection accepted on the service's listener.
    ConnInd { conn: OwnedFd, remote: SocketAddr },
    /// A non-blocking connect completed.
    ConnRsp { fd: RawFd, masks: EventMask },
    /// Application-defined message.
    User { code: u32, payload: Payload },
}

/// Fixed-size message envelope.
pub struct Message {
    pub from: ServiceId,
    pub to: ServiceId,
    pub body: Body,
}

impl Message {
    pub fn user(from: ServiceId, to: ServiceId, code: u32, payload: Payload) -> Self {
        Message {
            from,
            to,
            body: Body::User { code, payload },
        }
    }

    pub fn start(from: ServiceId, service: Box<Service>) -> Self {
        Message {
            from,
            to: ServiceId::MASTER,
            body: Body::Start(service),
        }
    }

    pub fn shutdown(from: ServiceId) -> Self {
        Message {
            from,
            to: ServiceId::MASTER,
            body: Body::Shutdown,
        }
    }

    /// Short name of the body variant, for log lines.
    pub fn kind_name(&self) -> &'static str {
        match &self.body {
            Body::Start(_) => "start",
            Body::Done(_) => "done",
            Body::WatchEvent { .. } => "watch-event",
            Body::DropEvent { .. } => "drop-event",
            Body::Shutdown => "shutdown",
            Body::Io { .. } => "io",
            Body::ConnInd { .. } => "conn-ind",
            Body::ConnRsp { .. } => "conn-rsp",
            Body::User { .. } => "user",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_accessors() {
        assert!(Payload::Empty.is_empty());
        assert_eq!(Payload::Word(9).word(), Some(9));
        assert_eq!(Payload::Word(9).as_bytes(), None);

        let owned = Payload::Owned(vec![1u8, 2].into_boxed_slice());
        assert_eq!(owned.as_bytes(), Some(&[1u8, 2][..]));

        let fixed = Payload::Static(b"abc");
        assert_eq!(fixed.as_bytes(), Some(&b"abc"[..]));
        assert_eq!(fixed.word(), None);
    }

    #[test]
    fn test_user_message_shape() {
        let m = Message::user(ServiceId::new(5), ServiceId::new(6), 42, Payload::Empty);
        assert_eq!(m.from.as_u32(), 5);
        assert_eq!(m.to.as_u32(), 6);
        assert_eq!(m.kind_name(), "user");
        match m.body {
            Body::User { code, .. } => assert_eq!(code, 42),
            _ => panic!("wrong body"),
        }
    }

    #[test]
    fn test_shutdown_targets_master() {
        let m = Message::shutdown(ServiceId::new(5));
        assert!(m.to.is_master());
        assert_eq!(m.kind_name(), "shutdown");
    }
}
