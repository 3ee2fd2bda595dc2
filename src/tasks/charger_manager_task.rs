use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::pubsub::{ImmediatePublisher, PubSubChannel, Subscriber};
use embassy_time::{Instant, Timer};

use crate::drivers::ChargerHal;
use crate::event::{EventChannel, ManagerEvent};
use crate::manager::{BatteryManager, ManagerError, ManagerReport};
use crate::power::{CapacityLevel, ChargeStatus};
use crate::registry::{ManagerId, Registry};

/////////////////////
//  Pub Sub Types  //
/////////////////////

pub const BATTERY_UPDATE_PUBSUB_DEPTH: usize = 4;
pub const BATTERY_UPDATE_SUBS: usize = 4;

pub type BatteryUpdatePubSub<M> = PubSubChannel<M, BatteryUpdate, BATTERY_UPDATE_PUBSUB_DEPTH, BATTERY_UPDATE_SUBS, 1>;
pub type BatteryUpdatePublisher<'a, M> = ImmediatePublisher<'a, M, BatteryUpdate, BATTERY_UPDATE_PUBSUB_DEPTH, BATTERY_UPDATE_SUBS, 1>;
pub type BatteryUpdateSubscriber<'a, M> = Subscriber<'a, M, BatteryUpdate, BATTERY_UPDATE_PUBSUB_DEPTH, BATTERY_UPDATE_SUBS, 1>;

/// Published whenever status or displayed capacity moved, or UVLO asked for
/// a shutdown.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BatteryUpdate {
    pub id: ManagerId,
    pub report: ManagerReport,
    pub status: ChargeStatus,
    pub capacity: u8,
    pub level: CapacityLevel,
}

/// Drives one registered manager: drains its events, runs due work, then
/// sleeps until the next deadline or an urgent event.
pub struct ChargerManagerTask<'a, M: RawMutex, H: ChargerHal, const N: usize, const EVENTS: usize> {
    registry: &'a Registry<M, BatteryManager<H>, N>,
    id: ManagerId,
    events: &'a EventChannel<M, EVENTS>,
    updates: BatteryUpdatePublisher<'a, M>,
}

impl<'a, M: RawMutex, H: ChargerHal, const N: usize, const EVENTS: usize> ChargerManagerTask<'a, M, H, N, EVENTS> {
    pub fn new(
        registry: &'a Registry<M, BatteryManager<H>, N>,
        id: ManagerId,
        events: &'a EventChannel<M, EVENTS>,
        updates: BatteryUpdatePublisher<'a, M>,
    ) -> Self {
        Self { registry, id, events, updates }
    }

    /// Returns only once the manager was removed from the registry.
    pub async fn charger_manager_task_entry(&mut self) {
        info!("charger manager task startup, {}", self.id);

        loop {
            let next = match self.service(Instant::now()) {
                Ok(next) => next,
                Err(err) => {
                    error!("charger manager {} unavailable ({}), stopping", self.id, err);
                    return;
                }
            };

            match next {
                Some(at) => {
                    let _ = select(Timer::at(at), self.events.wait_wake()).await;
                }
                None => {
                    // nothing scheduled, only an event can make progress
                    if let Either::First(event) = select(self.events.receive(), self.events.wait_wake()).await {
                        if let Err(err) = self.dispatch(event, Instant::now()) {
                            error!("charger manager {} unavailable ({}), stopping", self.id, err);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One synchronous pass: every queued event, then every due deadline.
    /// Returns the next deadline.
    pub fn service(&mut self, now: Instant) -> Result<Option<Instant>, ManagerError> {
        let id = self.id;
        let events = self.events;

        let (update, next) = self.registry.with(id, |manager| {
            let mut report = ManagerReport::default();
            while let Some(event) = events.try_receive() {
                report.merge(manager.handle_event(event, now));
            }
            report.merge(manager.poll(now));

            (battery_update(id, report, manager), manager.next_deadline())
        })?;

        self.publish(update);
        Ok(next)
    }

    fn dispatch(&mut self, event: ManagerEvent, now: Instant) -> Result<(), ManagerError> {
        let id = self.id;
        let update = self.registry.with(id, |manager| {
            let report = manager.handle_event(event, now);
            battery_update(id, report, manager)
        })?;

        self.publish(update);
        Ok(())
    }

    fn publish(&mut self, update: BatteryUpdate) {
        if update.report.is_empty() {
            return;
        }

        if let Some(mode) = update.report.shutdown {
            error!("battery {} requests shutdown ({})", update.id, mode);
        }

        trace!("battery update {}", update);
        self.updates.publish_immediate(update);
    }
}

fn battery_update<H: ChargerHal>(id: ManagerId, report: ManagerReport, manager: &BatteryManager<H>) -> BatteryUpdate {
    BatteryUpdate {
        id,
        report,
        status: manager.status(),
        capacity: manager.capacity(),
        level: manager.capacity_level(),
    }
}
