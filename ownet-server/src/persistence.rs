//! Admission control for persistent connections.
//!
//! The gate counts how many connections currently hold persistence. A new grant is only
//! handed out below the high-water mark, and sessions only linger for the long idle
//! timeout while the count is below the low-water mark.
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
pub struct PersistenceGate {
    high_water: usize,
    low_water: usize,
    current: Mutex<usize>,
}

impl PersistenceGate {
    pub fn new(high_water: usize, low_water: usize) -> PersistenceGate {
        PersistenceGate {
            high_water,
            low_water: low_water.min(high_water),
            current: Mutex::new(0),
        }
    }

    fn count(&self) -> MutexGuard<'_, usize> {
        // The counter stays consistent even if a holder panicked
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Grants persistence if the high-water mark has not been reached.
    /// The returned slot gives the grant back when dropped.
    pub fn try_acquire(self: &Arc<Self>) -> Option<PersistenceSlot> {
        let mut current = self.count();
        if *current >= self.high_water {
            log::debug!(
                "Persistence denied, {} of {} slots in use",
                *current,
                self.high_water
            );
            return None;
        }
        *current += 1;
        log::debug!("Persistence granted, {} of {} slots in use", *current, self.high_water);
        Some(PersistenceSlot {
            gate: Arc::clone(self),
        })
    }

    /// Number of connections currently holding persistence.
    pub fn current(&self) -> usize {
        *self.count()
    }

    /// Whether the server is far enough from its limit to let idle connections linger.
    pub fn below_low_water(&self) -> bool {
        *self.count() < self.low_water
    }

    fn release(&self) {
        let mut current = self.count();
        *current = current.saturating_sub(1);
        log::trace!("Persistence released, {} slots in use", *current);
    }
}

/// A granted persistence slot. Released exactly once, when dropped.
#[derive(Debug)]
pub struct PersistenceSlot {
    gate: Arc<PersistenceGate>,
}

impl Drop for PersistenceSlot {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod test {
    use super::PersistenceGate;
    use std::{sync::Arc, thread};

    #[test]
    fn never_grants_above_high_water() {
        let gate = Arc::new(PersistenceGate::new(3, 2));
        let slots: Vec<_> = (0..5).filter_map(|_| gate.try_acquire()).collect();
        assert_eq!(slots.len(), 3);
        assert_eq!(gate.current(), 3);
        assert!(gate.try_acquire().is_none());
        drop(slots);
        assert_eq!(gate.current(), 0);
    }

    #[test]
    fn low_water_decides_lingering() {
        let gate = Arc::new(PersistenceGate::new(4, 2));
        let first = gate.try_acquire();
        assert!(gate.below_low_water());
        let second = gate.try_acquire();
        assert!(!gate.below_low_water());
        drop(second);
        assert!(gate.below_low_water());
        drop(first);
    }

    #[test]
    fn concurrent_grants_respect_the_limit() {
        let gate = Arc::new(PersistenceGate::new(8, 4));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || {
                    let slot = gate.try_acquire();
                    assert!(gate.current() <= 8);
                    thread::yield_now();
                    slot.is_some()
                })
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|g| *g)
            .count();
        assert!(granted >= 8);
        assert_eq!(gate.current(), 0);
    }
}
