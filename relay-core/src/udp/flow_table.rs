use crate::flow::{SlotId, UdpFlowKey};
use hashbrown::HashMap;
use std::net::Ipv4Addr;

/// The addressing a UDP flow's reply packets are built with: the
/// destination the device originally targeted (used as the reply's
/// source) and the device-side port the device originated from (used as
/// the reply's destination).
#[derive(Debug, Copy, Clone)]
pub struct UdpFlowEntry {
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
    pub local_port: u16,
    pub slot: SlotId,
}

/// Owned by the UDP send loop: maps a flow key to the socket used to write
/// outbound payload for that flow. Private to the send loop — the receive
/// loop keeps its own slab of sockets registered with the selector,
/// populated via the registration queue.
///
/// Slot ids are minted from a free-list the same way `tcp/table.rs` does:
/// evicting a flow returns its slot to the pool so a long-running relay
/// churning short-lived flows (repeated DNS lookups and the like) doesn't
/// grow `next_slot` — and therefore the receive loop's slot vector —
/// without bound.
#[derive(Default)]
pub struct UdpFlowTable {
    flows: HashMap<UdpFlowKey, (std::net::UdpSocket, UdpFlowEntry)>,
    free: Vec<SlotId>,
    next_slot: SlotId,
}

impl UdpFlowTable {
    pub fn new() -> UdpFlowTable {
        UdpFlowTable {
            flows: HashMap::new(),
            free: Vec::new(),
            next_slot: 0,
        }
    }

    pub fn get(&self, key: &UdpFlowKey) -> Option<&std::net::UdpSocket> {
        self.flows.get(key).map(|(socket, _)| socket)
    }

    /// Inserts a freshly connected socket for `key`, reusing a freed slot
    /// id if one is available and minting a new one only otherwise.
    pub fn insert(
        &mut self,
        key: UdpFlowKey,
        socket: std::net::UdpSocket,
        remote_addr: Ipv4Addr,
        remote_port: u16,
    ) -> (SlotId, UdpFlowEntry) {
        let slot = self.free.pop().unwrap_or_else(|| {
            let slot = self.next_slot;
            self.next_slot += 1;
            slot
        });

        let entry = UdpFlowEntry {
            remote_addr,
            remote_port,
            local_port: key.src_port,
            slot,
        };

        self.flows.insert(key, (socket, entry));
        (slot, entry)
    }

    /// Removes the flow for `key`, if any, returning its slot id to the
    /// free list for reuse by the next `insert`.
    pub fn remove(&mut self, key: &UdpFlowKey) {
        if let Some((_, entry)) = self.flows.remove(key) {
            self.free.push(entry.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{SocketAddr, UdpSocket};

    fn make_socket() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr: SocketAddr = socket.local_addr().unwrap();
        socket.connect(addr).unwrap();
        socket
    }

    #[test]
    fn reuses_freed_slots() {
        let mut table = UdpFlowTable::new();
        let key_a = UdpFlowKey::new(Ipv4Addr::new(8, 8, 8, 8), 53, 1);
        let (slot_a, _) = table.insert(key_a, make_socket(), Ipv4Addr::new(8, 8, 8, 8), 53);

        table.remove(&key_a);

        let key_b = UdpFlowKey::new(Ipv4Addr::new(8, 8, 4, 4), 53, 2);
        let (slot_b, _) = table.insert(key_b, make_socket(), Ipv4Addr::new(8, 8, 4, 4), 53);

        assert_eq!(slot_a, slot_b);
    }

    #[test]
    fn distinct_live_flows_get_distinct_slots() {
        let mut table = UdpFlowTable::new();
        let key_a = UdpFlowKey::new(Ipv4Addr::new(8, 8, 8, 8), 53, 1);
        let key_b = UdpFlowKey::new(Ipv4Addr::new(8, 8, 4, 4), 53, 2);

        let (slot_a, _) = table.insert(key_a, make_socket(), Ipv4Addr::new(8, 8, 8, 8), 53);
        let (slot_b, _) = table.insert(key_b, make_socket(), Ipv4Addr::new(8, 8, 4, 4), 53);

        assert_ne!(slot_a, slot_b);
    }
}
