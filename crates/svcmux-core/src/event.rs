//! I/O readiness masks and registration kinds

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign};

/// Bitmask of ready operations on a descriptor.
///
/// Masks accumulate (bitwise-or) in the service's pending gate between
/// dispatch cycles when the owning service has not drained the previous
/// notification yet.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct EventMask(u16);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const READ: EventMask = EventMask(0x01);
    pub const WRITE: EventMask = EventMask(0x02);
    pub const PRI: EventMask = EventMask(0x04);
    pub const RDH: EventMask = EventMask(0x08);
    pub const HUP: EventMask = EventMask(0x10);
    pub const ERR: EventMask = EventMask(0x20);

    #[inline]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u16) -> Self {
        EventMask(bits)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;
    #[inline]
    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    #[inline]
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventMask {
    type Output = EventMask;
    #[inline]
    fn bitand(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 & rhs.0)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names = [
            (EventMask::READ, "READ"),
            (EventMask::WRITE, "WRITE"),
            (EventMask::PRI, "PRI"),
            (EventMask::RDH, "RDH"),
            (EventMask::HUP, "HUP"),
            (EventMask::ERR, "ERR"),
        ];
        let mut first = true;
        for (mask, name) in names {
            if self.intersects(mask) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What kind of socket a registration watches.
///
/// The master's event bridge dispatches by kind: listeners are accepted
/// synchronously, connecting sockets get a connect-response, plain
/// streams get readiness notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    /// An established stream; readiness is forwarded as an `Io` message.
    Stream,
    /// A listening socket; readiness triggers accept + `ConnInd`.
    Listener,
    /// A non-blocking connect in flight; first readiness becomes `ConnRsp`
    /// and the registration downgrades to `Stream`.
    Connecting,
}
