//! Peer identity: the `(address, scope id, port)` triple that is a connection's primary key.

use std::fmt;
use std::net::Ipv6Addr;

/// Identifies a peer endpoint. Two identities are equal iff all three fields match; distinct
/// scope ids or ports at the same address are distinct peers (link-local addresses may repeat
/// across scopes, and one address may host several connections on different ports).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionId {
    pub addr: Ipv6Addr,
    pub scope_id: u32,
    pub port: u16,
}

impl ConnectionId {
    #[inline]
    pub fn new(addr: Ipv6Addr, scope_id: u32, port: u16) -> ConnectionId {
        ConnectionId { addr, scope_id, port }
    }

    /// Builds an identity for connecting to `addr:port` with no scope (the common case for
    /// global addresses and loopback).
    #[inline]
    pub fn from_socket(addr: Ipv6Addr, port: u16) -> ConnectionId {
        ConnectionId::new(addr, 0, port)
    }
}

/// Owned, caller-formatted text rendering. Replaces the reference implementation's ring buffer of
/// short-lived C strings: every call allocates its own `String` with no shared lifetime to manage.
impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scope_id != 0 {
            write!(f, "[{}%{}]:{}", self.addr, self.scope_id, self.port)
        } else {
            write!(f, "[{}]:{}", self.addr, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_requires_all_three_fields() {
        let a = ConnectionId::new(Ipv6Addr::LOCALHOST, 0, 4000);
        let b = ConnectionId::new(Ipv6Addr::LOCALHOST, 0, 4000);
        let different_port = ConnectionId::new(Ipv6Addr::LOCALHOST, 0, 4001);
        let different_scope = ConnectionId::new(Ipv6Addr::LOCALHOST, 1, 4000);

        assert_eq!(a, b);
        assert_ne!(a, different_port);
        assert_ne!(a, different_scope);
    }

    #[test]
    fn display_includes_scope_only_when_nonzero() {
        let plain = ConnectionId::new(Ipv6Addr::LOCALHOST, 0, 4000);
        let scoped = ConnectionId::new(Ipv6Addr::LOCALHOST, 3, 4000);

        assert_eq!(plain.to_string(), "[::1]:4000");
        assert_eq!(scoped.to_string(), "[::1%3]:4000");
    }
}
