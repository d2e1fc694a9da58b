/// An owned IPv4 datagram read from, or destined for, the virtual
/// interface. Queues move `Packet` values rather than borrowed slices, so a
/// packet's lifetime is never tied to the worker that read it.
#[derive(Debug, Clone)]
pub struct Packet {
    data: Vec<u8>,
}

impl Packet {
    #[inline]
    pub fn new(data: Vec<u8>) -> Packet {
        Packet { data }
    }

    #[inline]
    pub fn from_slice(data: &[u8]) -> Packet {
        Packet {
            data: data.to_vec(),
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}
