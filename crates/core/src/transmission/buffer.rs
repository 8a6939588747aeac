use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use super::Transmission;
use crate::config::DEFAULT_TRANSMISSION_BUFFER_CAPACITY;

#[derive(Default)]
struct Queue {
    transmissions: VecDeque<Transmission>,
    size: usize,
}

/// In-memory FIFO of transmissions waiting for a free sender slot, bounded by
/// the total payload bytes it holds.
pub struct TransmissionBuffer {
    queue: Mutex<Queue>,
    capacity: AtomicUsize,
}

impl Default for TransmissionBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TransmissionBuffer {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            capacity: AtomicUsize::new(DEFAULT_TRANSMISSION_BUFFER_CAPACITY),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::SeqCst);
    }

    /// Payload bytes currently held.
    pub fn size(&self) -> usize {
        self.queue.lock().size
    }

    pub fn len(&self) -> usize {
        self.queue.lock().transmissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().transmissions.is_empty()
    }

    /// Appends the transmission the factory produces. The factory is not
    /// invoked when the buffer is already full, and its result is refused
    /// when the buffer filled up in the meantime.
    pub fn enqueue<F>(&self, factory: F) -> bool
    where
        F: FnOnce() -> Option<Transmission>,
    {
        if self.size() >= self.capacity() {
            return false;
        }
        let Some(transmission) = factory() else {
            return false;
        };
        let mut queue = self.queue.lock();
        if queue.size >= self.capacity() {
            return false;
        }
        queue.size += transmission.len();
        queue.transmissions.push_back(transmission);
        true
    }

    /// Puts a transmission back at the head, regardless of capacity.
    pub(crate) fn push_front(&self, transmission: Transmission) {
        let mut queue = self.queue.lock();
        queue.size += transmission.len();
        queue.transmissions.push_front(transmission);
    }

    pub fn dequeue(&self) -> Option<Transmission> {
        let mut queue = self.queue.lock();
        let transmission = queue.transmissions.pop_front()?;
        queue.size -= transmission.len();
        Some(transmission)
    }

    /// Removes the oldest transmissions until the held bytes fit the capacity.
    pub(crate) fn take_excess(&self) -> Vec<Transmission> {
        let capacity = self.capacity();
        let mut queue = self.queue.lock();
        let mut excess = Vec::new();
        while queue.size > capacity {
            let Some(transmission) = queue.transmissions.pop_front() else {
                break;
            };
            queue.size -= transmission.len();
            excess.push(transmission);
        }
        excess
    }
}
