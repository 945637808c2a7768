//! The three coordinated maps a [`Context`](crate::context::Context) keeps about its live peers,
//! plus the random connection-id draw and the end-of-tick deletion staging that keeps iteration
//! safe while connections are being torn down.
//!
//! Matches this lineage's `hashbrown`-backed map usage in the networking layer rather than
//! reaching for `std::collections::HashMap`.

use hashbrown::{HashMap, HashSet};
use rand::RngCore;

use crate::connection::ConnectionState;
use crate::identity::ConnectionId;

const MAX_CONNECTION_ID_DRAWS: u32 = 1_000_000;

/// Address key used for the "all identities sharing this endpoint address" back-reference.
/// Port is deliberately excluded: several connections may share an address on different ports
/// or scopes, and `drop_connection(.., dropAllWithAddr)` needs exactly that grouping.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
struct AddressKey {
    addr: std::net::Ipv6Addr,
    scope_id: u32,
}

impl From<ConnectionId> for AddressKey {
    fn from(id: ConnectionId) -> AddressKey {
        AddressKey { addr: id.addr, scope_id: id.scope_id }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    by_identity: HashMap<ConnectionId, ConnectionState>,
    by_address: HashMap<AddressKey, HashSet<ConnectionId>>,
    by_connection_id: HashMap<u32, ConnectionId>,
    pending_deletion: HashSet<ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry::default()
    }

    pub fn insert(&mut self, identity: ConnectionId, state: ConnectionState) {
        self.by_address.entry(identity.into()).or_default().insert(identity);
        self.by_identity.insert(identity, state);
    }

    /// Records that `identity` has been assigned `connection_id`, completing the id-set
    /// invariant (every id-set connection appears in the id map).
    pub fn bind_connection_id(&mut self, identity: ConnectionId, connection_id: u32) {
        self.by_connection_id.insert(connection_id, identity);
    }

    pub fn get(&self, identity: &ConnectionId) -> Option<&ConnectionState> {
        self.by_identity.get(identity)
    }

    pub fn get_mut(&mut self, identity: &ConnectionId) -> Option<&mut ConnectionState> {
        self.by_identity.get_mut(identity)
    }

    pub fn get_by_connection_id(&self, connection_id: u32) -> Option<&ConnectionId> {
        self.by_connection_id.get(&connection_id)
    }

    #[inline]
    pub fn contains(&self, identity: &ConnectionId) -> bool {
        self.by_identity.contains_key(identity)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }

    pub fn identities(&self) -> impl Iterator<Item = &ConnectionId> {
        self.by_identity.keys()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ConnectionId, &mut ConnectionState)> {
        self.by_identity.iter_mut()
    }

    /// Draws a connection id uniformly from `[0, 2^28)` that is not already bound to an
    /// identity. Bounded so a (pathologically) saturated id space fails loudly instead of
    /// spinning forever.
    pub fn draw_unique_connection_id(&self, rng: &mut impl RngCore) -> Option<u32> {
        for _ in 0..MAX_CONNECTION_ID_DRAWS {
            let candidate = rng.next_u32() & crate::packet::MAX_CONNECTION_ID;
            if !self.by_connection_id.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Stages a single identity for removal at the end of the current tick.
    pub fn stage_deletion(&mut self, identity: ConnectionId) {
        self.pending_deletion.insert(identity);
    }

    /// Stages every identity sharing `identity`'s address for removal.
    pub fn stage_deletion_by_address(&mut self, identity: ConnectionId) {
        if let Some(siblings) = self.by_address.get(&AddressKey::from(identity)) {
            for sibling in siblings {
                self.pending_deletion.insert(*sibling);
            }
        }
    }

    pub fn is_staged_for_deletion(&self, identity: &ConnectionId) -> bool {
        self.pending_deletion.contains(identity)
    }

    /// Removes every staged identity from all three maps and returns them, draining the
    /// deletion set. Called once at the end of a tick so mid-tick iteration never has to cope
    /// with a connection vanishing underneath it.
    pub fn process_deletions(&mut self) -> Vec<(ConnectionId, ConnectionState)> {
        let staged: Vec<ConnectionId> = self.pending_deletion.drain().collect();
        let mut removed = Vec::with_capacity(staged.len());

        for identity in staged {
            if let Some(state) = self.by_identity.remove(&identity) {
                if let Some(connection_id) = state.connection_id() {
                    self.by_connection_id.remove(&connection_id);
                }
                if let Some(siblings) = self.by_address.get_mut(&AddressKey::from(identity)) {
                    siblings.remove(&identity);
                    if siblings.is_empty() {
                        self.by_address.remove(&AddressKey::from(identity));
                    }
                }
                removed.push((identity, state));
            }
        }

        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use std::net::Ipv6Addr;

    fn id(port: u16) -> ConnectionId {
        ConnectionId::from_socket(Ipv6Addr::LOCALHOST, port)
    }

    #[test]
    fn insert_populates_identity_and_address_maps() {
        let mut registry = ConnectionRegistry::new();
        let identity = id(4000);
        registry.insert(identity, ConnectionState::new_initiating(identity));

        assert!(registry.contains(&identity));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn deletion_is_staged_until_process_deletions_runs() {
        let mut registry = ConnectionRegistry::new();
        let identity = id(4000);
        registry.insert(identity, ConnectionState::new_initiating(identity));

        registry.stage_deletion(identity);
        assert!(registry.contains(&identity));
        assert!(registry.is_staged_for_deletion(&identity));

        let removed = registry.process_deletions();
        assert_eq!(removed.len(), 1);
        assert!(!registry.contains(&identity));
    }

    #[test]
    fn stage_deletion_by_address_covers_every_port_sharing_it() {
        let mut registry = ConnectionRegistry::new();
        let a = id(4000);
        let b = id(4001);
        registry.insert(a, ConnectionState::new_initiating(a));
        registry.insert(b, ConnectionState::new_initiating(b));

        registry.stage_deletion_by_address(a);
        let removed = registry.process_deletions();

        assert_eq!(removed.len(), 2);
        assert!(!registry.contains(&a));
        assert!(!registry.contains(&b));
    }

    #[test]
    fn draw_unique_connection_id_avoids_bound_ids() {
        let mut registry = ConnectionRegistry::new();
        let identity = id(4000);
        registry.insert(identity, ConnectionState::new_initiating(identity));
        registry.bind_connection_id(identity, 7);

        let mut rng = FixedRng { next: [7, 7, 42].into_iter() };
        let drawn = registry.draw_unique_connection_id(&mut rng).unwrap();
        assert_eq!(drawn, 42);
    }

    struct FixedRng {
        next: std::array::IntoIter<u32, 3>,
    }

    impl RngCore for FixedRng {
        fn next_u32(&mut self) -> u32 {
            self.next.next().unwrap_or(0)
        }
        fn next_u64(&mut self) -> u64 {
            self.next_u32() as u64
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for byte in dest {
                *byte = self.next_u32() as u8;
            }
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }
}
