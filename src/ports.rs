//! Host port bookkeeping for sandboxes.
//!
//! Each sandbox holds one port from each of three disjoint ranges. The
//! reservation set is the only state shared between concurrent starts, so
//! "is this port free" and "mark it taken" happen under one lock.

use rand::Rng;
use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Mutex, MutexGuard};

use crate::model::SandboxInstance;
use crate::{Error, Result};

/// Randomized probes before falling back to a linear scan.
const RANDOM_ATTEMPTS: usize = 16;

/// Checks whether the operating system would let us bind a port right now.
pub trait PortProbe: Send + Sync {
    fn is_bindable(&self, port: u16) -> bool;
}

/// Binds a listener on all interfaces and immediately drops it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

impl PortProbe for TcpProbe {
    fn is_bindable(&self, port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
    }
}

pub struct PortAllocator {
    width: u16,
    reserved: Mutex<HashSet<u16>>,
    probe: Box<dyn PortProbe>,
}

impl PortAllocator {
    pub fn new(width: u16) -> Self {
        Self::with_probe(width, TcpProbe)
    }

    pub fn with_probe<P: PortProbe + 'static>(width: u16, probe: P) -> Self {
        PortAllocator {
            width,
            reserved: Mutex::new(HashSet::new()),
            probe: Box::new(probe),
        }
    }

    fn reserved(&self) -> MutexGuard<'_, HashSet<u16>> {
        // A panic while holding the lock cannot leave the set half-updated.
        self.reserved.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    /// Reserve a free port in `[base, base + width)`.
    ///
    /// `runtime_mapped` holds host ports the container runtime has already
    /// published; those are skipped even if a bind test would succeed.
    pub fn allocate(&self, base: u16, runtime_mapped: &HashSet<u16>) -> Result<u16> {
        let width = self.effective_width(base);
        let mut reserved = self.reserved();

        let usable = |reserved: &HashSet<u16>, port: u16| {
            !reserved.contains(&port)
                && !runtime_mapped.contains(&port)
                && self.probe.is_bindable(port)
        };

        if width > 0 {
            let mut rng = rand::thread_rng();
            for _ in 0..RANDOM_ATTEMPTS {
                let port = base + rng.gen_range(0..width);
                if usable(&*reserved, port) {
                    reserved.insert(port);
                    return Ok(port);
                }
            }
        }

        for offset in 0..width {
            let port = base + offset;
            if usable(&*reserved, port) {
                reserved.insert(port);
                return Ok(port);
            }
        }

        Err(Error::NoPortAvailable {
            base,
            width: self.width,
        })
    }

    /// Releasing a port that is not reserved is a no-op.
    pub fn release(&self, port: u16) {
        self.reserved().remove(&port);
    }

    pub fn release_all(&self, ports: &[u16]) {
        let mut reserved = self.reserved();
        for port in ports {
            reserved.remove(port);
        }
    }

    /// Mark a port as taken without probing it. Returns false if it already
    /// was.
    pub fn reserve(&self, port: u16) -> bool {
        self.reserved().insert(port)
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved().contains(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved().len()
    }

    /// Re-reserve the ports of every running instance, e.g. after a restart.
    /// Returns the number of ports reserved.
    pub fn rehydrate<'a, I>(&self, instances: I) -> usize
    where
        I: IntoIterator<Item = &'a SandboxInstance>,
    {
        let mut reserved = self.reserved();
        let before = reserved.len();

        for inst in instances.into_iter().filter(|inst| inst.is_running()) {
            reserved.extend(inst.ports.as_array().iter().copied());
        }

        reserved.len() - before
    }

    /// Clamp the range so it never runs past 65535.
    fn effective_width(&self, base: u16) -> u16 {
        let room = u32::from(u16::MAX) - u32::from(base) + 1;
        room.min(u32::from(self.width)) as u16
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    struct AlwaysFree;

    impl PortProbe for AlwaysFree {
        fn is_bindable(&self, _port: u16) -> bool {
            true
        }
    }

    struct Occupied(HashSet<u16>);

    impl PortProbe for Occupied {
        fn is_bindable(&self, port: u16) -> bool {
            !self.0.contains(&port)
        }
    }

    #[test]
    fn allocates_within_range() {
        let alloc = PortAllocator::with_probe(10, AlwaysFree);
        for _ in 0..10 {
            let port = alloc.allocate(30000, &HashSet::new()).unwrap();
            assert!((30000..30010).contains(&port));
        }
        assert_eq!(alloc.reserved_count(), 10);
    }

    #[test]
    fn exhausted_range_fails() {
        let alloc = PortAllocator::with_probe(3, AlwaysFree);
        for _ in 0..3 {
            alloc.allocate(30000, &HashSet::new()).unwrap();
        }
        match alloc.allocate(30000, &HashSet::new()) {
            Err(Error::NoPortAvailable { base, width }) => {
                assert_eq!(base, 30000);
                assert_eq!(width, 3);
            }
            other => panic!("expected NoPortAvailable, got {:?}", other),
        }
    }

    #[test]
    fn skips_unbindable_and_runtime_mapped_ports() {
        let busy: HashSet<u16> = [30000, 30001].iter().copied().collect();
        let alloc = PortAllocator::with_probe(4, Occupied(busy));
        let mapped: HashSet<u16> = [30002].iter().copied().collect();

        assert_eq!(alloc.allocate(30000, &mapped).unwrap(), 30003);
        assert!(alloc.allocate(30000, &mapped).is_err());
    }

    #[test]
    fn empty_range_fails_cleanly() {
        let alloc = PortAllocator::with_probe(0, AlwaysFree);

        let err = alloc.allocate(0, &HashSet::new()).unwrap_err();
        assert!(matches!(err, Error::NoPortAvailable { base: 0, width: 0 }));
        assert_eq!(err.to_string(), "No free port in range 0-0");
    }

    #[test]
    fn release_is_idempotent() {
        let alloc = PortAllocator::with_probe(1, AlwaysFree);
        let port = alloc.allocate(30000, &HashSet::new()).unwrap();

        alloc.release(port);
        alloc.release(port);
        assert!(!alloc.is_reserved(port));
        assert_eq!(alloc.allocate(30000, &HashSet::new()).unwrap(), port);
    }

    #[test]
    fn range_is_clamped_at_top_of_port_space() {
        let alloc = PortAllocator::with_probe(1000, AlwaysFree);
        for _ in 0..2 {
            alloc.allocate(65534, &HashSet::new()).unwrap();
        }
        assert!(alloc.allocate(65534, &HashSet::new()).is_err());
    }

    #[test]
    fn bound_port_is_not_handed_out() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();

        let probe = TcpProbe;
        assert!(!probe.is_bindable(taken));

        let alloc = PortAllocator::new(1);
        assert!(alloc.allocate(taken, &HashSet::new()).is_err());
    }

    #[test]
    fn concurrent_allocations_are_disjoint() {
        let alloc = Arc::new(PortAllocator::with_probe(200, AlwaysFree));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| alloc.allocate(30000, &HashSet::new()).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(seen.insert(port), "port {} handed out twice", port);
            }
        }
        assert_eq!(seen.len(), 200);
    }
}
