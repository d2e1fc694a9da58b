use super::pipe::TcpPipe;
use crate::flow::{SlotId, TcpFlowKey};
use hashbrown::HashMap;

/// Slab of live pipes plus the flow-key index, in the shape of the
/// `channels`/`free` slab pattern: a slot's identity is stable for its
/// lifetime, so the selector attachment (`mio::Token(slot)`) never goes
/// stale while the table is mutated.
#[derive(Default)]
pub struct TcpPipeTable {
    slots: Vec<Option<TcpPipe>>,
    free: Vec<SlotId>,
    index: HashMap<TcpFlowKey, SlotId>,
}

impl TcpPipeTable {
    pub fn new() -> TcpPipeTable {
        TcpPipeTable {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn get(&self, key: &TcpFlowKey) -> Option<SlotId> {
        self.index.get(key).copied()
    }

    pub fn pipe(&self, slot: SlotId) -> Option<&TcpPipe> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    pub fn pipe_mut(&mut self, slot: SlotId) -> Option<&mut TcpPipe> {
        self.slots.get_mut(slot).and_then(|s| s.as_mut())
    }

    /// Allocates a slot for `pipe`, reusing a freed slot if one is
    /// available, and indexes it by flow key.
    pub fn insert(&mut self, key: TcpFlowKey, pipe: TcpPipe) -> SlotId {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(pipe);
                slot
            }
            None => {
                let slot = self.slots.len();
                self.slots.push(Some(pipe));
                slot
            }
        };

        self.index.insert(key, slot);
        slot
    }

    /// Removes the pipe for `key`, if any, returning it so the caller can
    /// finish tearing it down (deregister from the selector, shut down the
    /// socket). The slot becomes available for reuse immediately.
    pub fn remove(&mut self, key: &TcpFlowKey) -> Option<TcpPipe> {
        let slot = self.index.remove(key)?;
        let pipe = self.slots[slot].take();
        self.free.push(slot);
        pipe
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::noop_protect;
    use crate::socket;
    use std::net::{Ipv4Addr, SocketAddr, TcpListener};

    fn make_pipe(listener_addr: SocketAddr, port: u16) -> (TcpFlowKey, TcpPipe) {
        let key = TcpFlowKey::new(Ipv4Addr::new(93, 184, 216, 34), 80, port);
        let stream = socket::connect_tcp(&noop_protect(), listener_addr).unwrap();
        (key, TcpPipe::new(key, stream, port as u64))
    }

    #[test]
    fn reuses_freed_slots() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut table = TcpPipeTable::new();
        let (key_a, pipe_a) = make_pipe(addr, 1);
        let slot_a = table.insert(key_a, pipe_a);

        table.remove(&key_a);

        let (key_b, pipe_b) = make_pipe(addr, 2);
        let slot_b = table.insert(key_b, pipe_b);

        assert_eq!(slot_a, slot_b);
        assert!(table.get(&key_a).is_none());
        assert_eq!(table.get(&key_b), Some(slot_b));
    }

    #[test]
    fn len_tracks_live_pipes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut table = TcpPipeTable::new();
        assert!(table.is_empty());

        let (key, pipe) = make_pipe(addr, 1);
        table.insert(key, pipe);
        assert_eq!(table.len(), 1);

        table.remove(&key);
        assert_eq!(table.len(), 0);
    }
}
