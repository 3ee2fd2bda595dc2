use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use embassy_sync::signal::Signal;

/// Asynchronous notifications from drivers and the platform.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ManagerEvent {
    ExternalPowerIn,
    ExternalPowerOut,
    BatteryIn,
    BatteryOut,
    /// charge pump interrupt, alarms and faults are read on the next cycle
    ChargerFault,
    /// adapter finished fast charge negotiation
    FastChargeDetected,
    /// thermal budget in mW, 0 lifts it
    ThermalLimitChanged(i32),
}

impl ManagerEvent {
    /// Events that should preempt the current wait instead of being picked
    /// up at the next scheduled cycle.
    pub fn is_urgent(&self) -> bool {
        matches!(self, ManagerEvent::ExternalPowerOut | ManagerEvent::ChargerFault)
    }
}

/// Bounded event queue plus a wake signal for the manager task.
pub struct EventChannel<M: RawMutex, const N: usize> {
    events: Channel<M, ManagerEvent, N>,
    wake: Signal<M, ()>,
}

impl<M: RawMutex, const N: usize> EventChannel<M, N> {
    pub const fn new() -> Self {
        Self {
            events: Channel::new(),
            wake: Signal::new(),
        }
    }

    /// Non-blocking, callable from interrupt context. The event comes back
    /// if the queue is full.
    pub fn notify(&self, event: ManagerEvent) -> Result<(), ManagerEvent> {
        match self.events.try_send(event) {
            Ok(()) => {
                if event.is_urgent() {
                    self.wake.signal(());
                }
                Ok(())
            }
            Err(TrySendError::Full(event)) => {
                warn!("event queue full, dropping {}", event);
                Err(event)
            }
        }
    }

    pub async fn send(&self, event: ManagerEvent) {
        self.events.send(event).await;
        if event.is_urgent() {
            self.wake.signal(());
        }
    }

    /// Asks the task to run its due work now.
    pub fn wake(&self) {
        self.wake.signal(());
    }

    pub fn try_receive(&self) -> Option<ManagerEvent> {
        self.events.try_receive().ok()
    }

    pub async fn receive(&self) -> ManagerEvent {
        self.events.receive().await
    }

    pub async fn wait_wake(&self) {
        self.wake.wait().await
    }
}

/////////////
//  TESTS  //
/////////////

#[cfg(test)]
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

#[test]
fn urgent_events_raise_the_wake_signal() {
    let channel: EventChannel<CriticalSectionRawMutex, 4> = EventChannel::new();

    channel.notify(ManagerEvent::ExternalPowerIn).unwrap();
    assert!(!channel.wake.signaled());

    channel.notify(ManagerEvent::ChargerFault).unwrap();
    assert!(channel.wake.signaled());

    assert_eq!(Some(ManagerEvent::ExternalPowerIn), channel.try_receive());
    assert_eq!(Some(ManagerEvent::ChargerFault), channel.try_receive());
    assert_eq!(None, channel.try_receive());
}

#[test]
fn full_queue_hands_the_event_back() {
    let channel: EventChannel<CriticalSectionRawMutex, 2> = EventChannel::new();

    channel.notify(ManagerEvent::BatteryIn).unwrap();
    channel.notify(ManagerEvent::BatteryOut).unwrap();
    assert_eq!(
        Err(ManagerEvent::ThermalLimitChanged(2000)),
        channel.notify(ManagerEvent::ThermalLimitChanged(2000))
    );
    assert_eq!(Some(ManagerEvent::BatteryIn), channel.try_receive());
}
