//! Bounded in-memory ring of the most recent records per partition, for
//! zero-disk tailing (spec.md §3, §4.2). Backed by the `ringbuffer` crate the
//! original streaming crate already depended on for exactly this purpose.

use bytes::Bytes;
use ringbuffer::{AllocRingBuffer, RingBuffer};

/// `(offset, key, value, ts)` as spec.md §3 defines it.
#[derive(Debug, Clone)]
pub struct HotTailEntry {
    pub offset: u64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub timestamp_micros: u64,
}

/// Eviction is strictly by age: oldest first, once the ring is full.
pub struct HotTail {
    ring: AllocRingBuffer<HotTailEntry>,
}

impl HotTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: AllocRingBuffer::new(capacity.max(1)),
        }
    }

    pub fn push(&mut self, entry: HotTailEntry) {
        self.ring.push(entry);
    }

    /// Returns a contiguous run of entries from `offset` onward if the ring
    /// currently covers it, oldest to newest, otherwise `None`.
    pub fn get_from(&self, offset: u64) -> Option<Vec<HotTailEntry>> {
        if self.ring.is_empty() {
            return None;
        }
        let oldest = self.ring.iter().next()?.offset;
        if offset < oldest {
            return None;
        }
        let newest = self.ring.iter().last()?.offset;
        if offset > newest {
            return None;
        }
        Some(
            self.ring
                .iter()
                .filter(|e| e.offset >= offset)
                .cloned()
                .collect(),
        )
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.ring
            .iter()
            .next()
            .map(|first| offset >= first.offset)
            .unwrap_or(false)
            && self
                .ring
                .iter()
                .last()
                .map(|last| offset <= last.offset)
                .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(offset: u64) -> HotTailEntry {
        HotTailEntry {
            offset,
            key: None,
            value: Bytes::from_static(b"v"),
            timestamp_micros: 0,
        }
    }

    #[test]
    fn evicts_oldest_first_once_full() {
        let mut tail = HotTail::new(3);
        for i in 0..5 {
            tail.push(entry(i));
        }
        assert_eq!(tail.len(), 3);
        assert!(!tail.contains(0));
        assert!(!tail.contains(1));
        assert!(tail.contains(4));
    }

    #[test]
    fn get_from_returns_contiguous_suffix() {
        let mut tail = HotTail::new(5);
        for i in 0..5 {
            tail.push(entry(i));
        }
        let got = tail.get_from(2).unwrap();
        let offsets: Vec<u64> = got.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![2, 3, 4]);
    }

    #[test]
    fn get_from_below_retained_range_is_none() {
        let mut tail = HotTail::new(2);
        for i in 0..5 {
            tail.push(entry(i));
        }
        assert!(tail.get_from(0).is_none());
    }
}
