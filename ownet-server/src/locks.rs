//! Bus and device locks shared by all connections.
//!
//! Locks are always taken bus first, device second. [`LockRegistry::acquire`] is the only
//! place that takes both, and [`Held`] releases them in the opposite order.
//!
//! Device entries live in a table keyed by address. An entry is created by its first
//! user and removed by its last one, both under the table lock, while waiting for the
//! entry's own mutex happens outside of it.
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::query::{BusId, Change, DeviceId, Node, NodeKind};

/// Usage counters of one bus lock.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BusStats {
    /// Number of times the lock was taken
    pub locks: u64,
    /// Accumulated time the lock was held
    pub held: Duration,
}

#[derive(Debug, Default)]
struct BusLock {
    mutex: Arc<AsyncMutex<()>>,
    stats: Mutex<BusStats>,
}

#[derive(Debug)]
struct DeviceEntry {
    mutex: Arc<AsyncMutex<()>>,
    users: usize,
}

type DeviceTable = Mutex<BTreeMap<DeviceId, DeviceEntry>>;

fn lock_table<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Which locks a query on a node needs.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LockPlan {
    pub bus: Option<BusId>,
    pub device: Option<DeviceId>,
}

impl LockPlan {
    pub fn for_node(node: &Node) -> LockPlan {
        match node.kind {
            NodeKind::Directory => LockPlan {
                bus: node.bus,
                device: None,
            },
            NodeKind::Property(Change::Static | Change::Statistic) => LockPlan::default(),
            NodeKind::Property(Change::Stable | Change::Volatile) => LockPlan {
                bus: node.bus,
                device: node.device,
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct LockRegistry {
    buses: Mutex<BTreeMap<BusId, Arc<BusLock>>>,
    devices: Arc<DeviceTable>,
}

impl LockRegistry {
    pub fn new() -> LockRegistry {
        LockRegistry::default()
    }

    fn bus(&self, bus: BusId) -> Arc<BusLock> {
        Arc::clone(lock_table(&self.buses).entry(bus).or_default())
    }

    /// Takes the coarse lock serializing all traffic on one bus.
    pub async fn lock_bus(&self, bus: BusId) -> BusGuard {
        let lock = self.bus(bus);
        let guard = Arc::clone(&lock.mutex).lock_owned().await;
        log::trace!("Locked {}", bus);
        BusGuard {
            lock,
            since: Instant::now(),
            _guard: guard,
        }
    }

    /// Takes the lock of one device.
    ///
    /// When the bus is locked as well, the bus has to be taken first. Dropping the
    /// returned future before it resolves gives the reference back.
    pub async fn lock_device(&self, device: DeviceId) -> DeviceGuard {
        let mutex = {
            let mut table = lock_table(&self.devices);
            let entry = table.entry(device).or_insert_with(|| DeviceEntry {
                mutex: Arc::new(AsyncMutex::new(())),
                users: 0,
            });
            entry.users += 1;
            Arc::clone(&entry.mutex)
        };
        // Registered before waiting so cancellation still releases the reference
        let mut guard = DeviceGuard {
            device,
            table: Arc::clone(&self.devices),
            guard: None,
        };
        guard.guard = Some(mutex.lock_owned().await);
        log::trace!("Locked device {}", device);
        guard
    }

    /// Takes every lock in the plan, bus before device.
    pub async fn acquire(&self, plan: LockPlan) -> Held {
        let bus = match plan.bus {
            Some(bus) => Some(self.lock_bus(bus).await),
            None => None,
        };
        let device = match plan.device {
            Some(device) => Some(self.lock_device(device).await),
            None => None,
        };
        Held {
            _device: device,
            _bus: bus,
        }
    }

    /// Usage counters of a bus, `None` until the bus was locked once.
    pub fn bus_stats(&self, bus: BusId) -> Option<BusStats> {
        lock_table(&self.buses)
            .get(&bus)
            .map(|lock| *lock_table(&lock.stats))
    }

    /// Number of live device entries.
    #[cfg(test)]
    fn device_entries(&self) -> usize {
        lock_table(&self.devices).len()
    }

    /// Number of holders and waiters of one device lock.
    #[cfg(test)]
    fn users(&self, device: DeviceId) -> usize {
        lock_table(&self.devices)
            .get(&device)
            .map(|entry| entry.users)
            .unwrap_or(0)
    }
}

/// Holds a bus lock and records how long it was held.
#[derive(Debug)]
pub struct BusGuard {
    lock: Arc<BusLock>,
    since: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for BusGuard {
    fn drop(&mut self) {
        let mut stats = lock_table(&self.lock.stats);
        stats.locks += 1;
        stats.held += self.since.elapsed();
    }
}

/// Holds a device lock. On drop the device mutex is unlocked first, then the entry is
/// dereferenced and removed from the table if nobody else uses it.
#[derive(Debug)]
pub struct DeviceGuard {
    device: DeviceId,
    table: Arc<DeviceTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut table = lock_table(&self.table);
        if let Some(entry) = table.get_mut(&self.device) {
            entry.users -= 1;
            if entry.users == 0 {
                table.remove(&self.device);
            }
        }
    }
}

/// The locks taken for one query. Fields drop in declaration order: device, then bus.
#[derive(Debug)]
pub struct Held {
    _device: Option<DeviceGuard>,
    _bus: Option<BusGuard>,
}
