// src/slab.rs
use crate::conn::Connection;
use crate::driver::EventDriver;
use crate::metrics::Metrics;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Fixed-capacity table of connection slots.
///
/// Slots are allocated strictly once at startup; workers take a slot's lock
/// for the duration of one readiness event. One-shot registration keeps the
/// locks uncontended in practice.
pub struct ConnectionSlab {
    slots: Box<[Mutex<Connection>]>,
    free: Mutex<Vec<usize>>,
}

impl ConnectionSlab {
    pub fn new(
        capacity: usize,
        driver: Arc<dyn EventDriver>,
        metrics: Arc<Metrics>,
        doc_root: Arc<PathBuf>,
    ) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Mutex::new(Connection::vacant(
                driver.clone(),
                metrics.clone(),
                doc_root.clone(),
            )));
        }
        // Reversed so allocation hands out low indexes first.
        let free: Vec<usize> = (0..capacity).rev().collect();

        Self {
            slots: slots.into_boxed_slice(),
            free: Mutex::new(free),
        }
    }

    /// O(1) slot claim. None when at capacity.
    pub fn allocate(&self) -> Option<usize> {
        self.free.lock().unwrap().pop()
    }

    /// Return a slot to the free list after its connection closed.
    pub fn release(&self, index: usize) {
        if index >= self.slots.len() {
            return;
        }
        let mut free = self.free.lock().unwrap();
        debug_assert!(!free.contains(&index));
        free.push(index);
    }

    pub fn get(&self, index: usize) -> Option<&Mutex<Connection>> {
        self.slots.get(index)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}
