use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::message::NO_BUFFER;

/// A packet held by the switch while the controller decides what to do with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferedPacket {
    pub data: Vec<u8>,
    pub in_port: u16,
    pub inserted_at: Duration,
}

/// Outcome of `PacketBuffer::insert`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Buffered {
    pub buffer_id: u32,
    /// Id of the packet dropped to make room, if the pool was full.
    pub evicted: Option<u32>,
}

/// Bounded pool of buffered packets. When full, the oldest packet is evicted.
#[derive(Debug)]
pub struct PacketBuffer {
    capacity: usize,
    packets: HashMap<u32, BufferedPacket>,
    order: VecDeque<u32>,
    next_id: u32,
}

impl PacketBuffer {
    pub fn new(capacity: usize) -> PacketBuffer {
        PacketBuffer {
            capacity,
            packets: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, buffer_id: u32) -> bool {
        self.packets.contains_key(&buffer_id)
    }

    pub fn get(&self, buffer_id: u32) -> Option<&BufferedPacket> {
        self.packets.get(&buffer_id)
    }

    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != NO_BUFFER && !self.packets.contains_key(&id) {
                return id;
            }
        }
    }

    /// Store `data` and return its buffer id. A pool without capacity buffers nothing.
    pub fn insert(&mut self, data: Vec<u8>, in_port: u16, now: Duration) -> Option<Buffered> {
        if self.capacity == 0 {
            return None;
        }

        let mut evicted = None;
        if self.packets.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.packets.remove(&oldest);
                debug!("Packet buffer full, evicting buffer {}", oldest);
                evicted = Some(oldest);
            }
        }

        let buffer_id = self.allocate_id();
        self.packets.insert(
            buffer_id,
            BufferedPacket {
                data,
                in_port,
                inserted_at: now,
            },
        );
        self.order.push_back(buffer_id);
        Some(Buffered { buffer_id, evicted })
    }

    /// Release the packet stored under `buffer_id`. Each id can be taken once.
    pub fn take(&mut self, buffer_id: u32) -> Option<BufferedPacket> {
        let packet = self.packets.remove(&buffer_id)?;
        self.order.retain(|id| *id != buffer_id);
        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_take() {
        let mut buffer = PacketBuffer::new(3);
        let first = buffer.insert(vec![1, 2, 3], 1, Duration::from_secs(1)).unwrap();
        assert_eq!(first.evicted, None);
        assert!(buffer.contains(first.buffer_id));
        assert_eq!(buffer.len(), 1);

        let packet = buffer.take(first.buffer_id).unwrap();
        assert_eq!(packet.data, vec![1, 2, 3]);
        assert_eq!(packet.in_port, 1);
        assert_eq!(packet.inserted_at, Duration::from_secs(1));

        assert!(buffer.take(first.buffer_id).is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_oldest_packet_is_evicted() {
        let mut buffer = PacketBuffer::new(2);
        let a = buffer.insert(vec![1], 1, Duration::from_secs(0)).unwrap();
        let b = buffer.insert(vec![2], 1, Duration::from_secs(0)).unwrap();
        let c = buffer.insert(vec![3], 2, Duration::from_secs(0)).unwrap();

        assert_eq!(c.evicted, Some(a.buffer_id));
        assert!(!buffer.contains(a.buffer_id));
        assert!(buffer.contains(b.buffer_id));
        assert!(buffer.contains(c.buffer_id));
        assert_eq!(buffer.len(), buffer.capacity());

        // taking b leaves c as the oldest
        buffer.take(b.buffer_id);
        buffer.insert(vec![4], 1, Duration::from_secs(0)).unwrap();
        let e = buffer.insert(vec![5], 1, Duration::from_secs(0)).unwrap();
        assert_eq!(e.evicted, Some(c.buffer_id));
    }

    #[test]
    fn test_ids_skip_no_buffer() {
        let mut buffer = PacketBuffer::new(4);
        buffer.next_id = NO_BUFFER - 1;
        let a = buffer.insert(vec![], 1, Duration::default()).unwrap();
        let b = buffer.insert(vec![], 1, Duration::default()).unwrap();
        assert_eq!(a.buffer_id, NO_BUFFER - 1);
        assert_eq!(b.buffer_id, 0);
    }

    #[test]
    fn test_ids_skip_live_entries_after_wrap() {
        let mut buffer = PacketBuffer::new(4);
        let a = buffer.insert(vec![], 1, Duration::default()).unwrap();
        buffer.next_id = a.buffer_id;
        let b = buffer.insert(vec![], 1, Duration::default()).unwrap();
        assert_ne!(a.buffer_id, b.buffer_id);
    }

    #[test]
    fn test_zero_capacity() {
        let mut buffer = PacketBuffer::new(0);
        assert!(buffer.insert(vec![1], 1, Duration::default()).is_none());
        assert!(buffer.is_empty());
    }
}
