//! Port pool (spec section 3 "Port pool", testable property 2: port
//! exclusivity). A single mutex covers both the free set and the
//! assignment map so the two can never observe a torn state.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

pub struct PortAllocator {
    inner: Mutex<Inner>,
}

struct Inner {
    free: HashSet<u16>,
    assigned: HashMap<String, u16>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        let free = (min..=max).collect();
        Self { inner: Mutex::new(Inner { free, assigned: HashMap::new() }) }
    }

    /// Allocates the lowest free port for `tenant`, or returns the port
    /// already assigned to it (spec 4.3: "once a tenant gets a port, it
    /// keeps it until *stopping*").
    pub fn acquire(&self, tenant: &str) -> Option<u16> {
        let mut inner = self.inner.lock();
        if let Some(&port) = inner.assigned.get(tenant) {
            return Some(port);
        }
        let port = *inner.free.iter().min()?;
        inner.free.remove(&port);
        inner.assigned.insert(tenant.to_string(), port);
        Some(port)
    }

    /// Returns the port to the free set and drops the assignment,
    /// atomically (spec 3 invariant: "no port appears in both").
    pub fn release(&self, tenant: &str) {
        let mut inner = self.inner.lock();
        if let Some(port) = inner.assigned.remove(tenant) {
            inner.free.insert(port);
        }
    }

    pub fn assigned_port(&self, tenant: &str) -> Option<u16> {
        self.inner.lock().assigned.get(tenant).copied()
    }

    pub fn assigned_count(&self) -> usize {
        self.inner.lock().assigned.len()
    }

    pub fn capacity(&self) -> usize {
        let inner = self.inner.lock();
        inner.free.len() + inner.assigned.len()
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }
}
