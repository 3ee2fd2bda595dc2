use core::cell::RefCell;

use embassy_sync::blocking_mutex::{raw::RawMutex, Mutex};
use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::drivers::ChargerHal;
use crate::manager::{BatteryManager, ManagerError};

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ManagerId(u16);

struct Slot<T> {
    id: ManagerId,
    manager: T,
}

struct Slots<T, const N: usize> {
    entries: Vec<Slot<T>, N>,
    next_id: u16,
}

/// Fixed capacity set of live managers, shared between the manager tasks
/// and whoever needs a cross-battery view.
pub struct Registry<M: RawMutex, T, const N: usize> {
    inner: Mutex<M, RefCell<Slots<T, N>>>,
}

impl<M: RawMutex, T, const N: usize> Registry<M, T, N> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Slots {
                entries: Vec::new(),
                next_id: 0,
            })),
        }
    }

    pub fn register(&self, manager: T) -> Result<ManagerId, ManagerError> {
        self.inner.lock(|slots| {
            let mut slots = slots.borrow_mut();
            let id = ManagerId(slots.next_id);
            slots
                .entries
                .push(Slot { id, manager })
                .map_err(|_| ManagerError::RegistryFull)?;
            slots.next_id = slots.next_id.wrapping_add(1);
            Ok(id)
        })
    }

    pub fn remove(&self, id: ManagerId) -> Result<T, ManagerError> {
        self.inner.lock(|slots| {
            let mut slots = slots.borrow_mut();
            let index = slots
                .entries
                .iter()
                .position(|slot| slot.id == id)
                .ok_or(ManagerError::UnknownId)?;
            Ok(slots.entries.swap_remove(index).manager)
        })
    }

    /// Runs `f` with exclusive access to one manager. Don't call back into
    /// the registry from `f`.
    pub fn with<R>(&self, id: ManagerId, f: impl FnOnce(&mut T) -> R) -> Result<R, ManagerError> {
        self.inner.lock(|slots| {
            let mut slots = slots.borrow_mut();
            let slot = slots
                .entries
                .iter_mut()
                .find(|slot| slot.id == id)
                .ok_or(ManagerError::UnknownId)?;
            Ok(f(&mut slot.manager))
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock(|slots| slots.borrow().entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M: RawMutex, H: ChargerHal, const N: usize> Registry<M, BatteryManager<H>, N> {
    /// One out of band monitor cycle on every battery. True if any of them
    /// ended up NOT_CHARGING.
    pub fn monitor_all(&self, now: Instant) -> bool {
        self.inner.lock(|slots| {
            let mut slots = slots.borrow_mut();
            let mut not_charging = false;
            for slot in slots.entries.iter_mut() {
                not_charging |= slot.manager.run_monitor(now).not_charging;
            }
            not_charging
        })
    }

    /// Shortest polling interval across the managers that want polling.
    pub fn polling_interval(&self) -> Option<Duration> {
        self.inner.lock(|slots| {
            slots
                .borrow()
                .entries
                .iter()
                .filter_map(|slot| slot.manager.polling_interval())
                .min()
        })
    }
}

impl<M: RawMutex, T, const N: usize> Default for Registry<M, T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/////////////
//  TESTS  //
/////////////

#[cfg(test)]
use embassy_sync::blocking_mutex::raw::NoopRawMutex;

#[test]
fn register_until_full() {
    let registry: Registry<NoopRawMutex, u32, 2> = Registry::new();

    let a = registry.register(10).unwrap();
    let b = registry.register(20).unwrap();
    assert_ne!(a, b);
    assert_eq!(Err(ManagerError::RegistryFull), registry.register(30));

    assert_eq!(Ok(21), registry.with(b, |v| {
        *v += 1;
        *v
    }));
    assert_eq!(2, registry.len());
}

#[test]
fn removed_ids_are_unknown() {
    let registry: Registry<NoopRawMutex, u32, 2> = Registry::new();

    let a = registry.register(10).unwrap();
    let b = registry.register(20).unwrap();
    assert_eq!(Ok(10), registry.remove(a));
    assert_eq!(Err(ManagerError::UnknownId), registry.with(a, |_| ()));
    assert_eq!(Err(ManagerError::UnknownId), registry.remove(a));
    assert_eq!(Ok(20), registry.with(b, |v| *v));

    // freed slot is reusable, ids aren't
    let c = registry.register(30).unwrap();
    assert_ne!(a, c);
    assert!(!registry.is_empty());
}
