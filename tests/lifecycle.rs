mod common;

use ateam_charger_manager::config::{ChargeProfile, ChargerConfig};
use ateam_charger_manager::drivers::{ChargerHal, Devices, DriverError, FuelGauge};
use ateam_charger_manager::event::{EventChannel, ManagerEvent};
use ateam_charger_manager::manager::{BatteryManager, ManagerError};
use ateam_charger_manager::power::vote::VoteKind;
use ateam_charger_manager::power::{ChargeStatus, ChargerType};
use ateam_charger_manager::registry::Registry;
use ateam_charger_manager::tasks::charger_manager_task::{BatteryUpdatePubSub, ChargerManagerTask};
use embassy_futures::block_on;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::pubsub::PubSubChannel;
use embassy_time::Duration;

use common::*;

#[test]
fn suspend_wakes_on_the_polling_interval() {
    let mut manager = on_adapter(plain_config(), ChargerType::Dcp);
    manager.poll(T0);
    let feeds = manager.devices().primary.watchdog_feeds;

    assert_eq!(Some(Duration::from_secs(15)), manager.suspend(at(1_000)));
    assert_eq!(feeds + 1, manager.devices().primary.watchdog_feeds);
    assert_eq!(None, manager.next_deadline());

    manager.resume(at(16_000));
    assert_eq!(ChargeStatus::Charging, manager.status());
    assert_eq!(Some(at(31_000)), manager.next_deadline());
}

#[test]
fn watchdog_interval_zero_never_feeds() {
    let mut cfg = plain_config();
    cfg.watchdog_interval_s = 0;
    let mut manager = on_adapter(cfg, ChargerType::Dcp);

    manager.poll(T0);
    manager.suspend(at(1_000));

    assert_eq!(0, manager.devices().primary.watchdog_feeds);
    assert_eq!(ChargeStatus::Charging, manager.status());
}

#[test]
fn suspend_keeps_the_pending_full_check() {
    let mut cfg = plain_config();
    cfg.polling_interval = Duration::from_secs(60);
    let mut gauge = SimGauge::new();
    gauge.capacity = 1000;
    gauge.boot_capacity = Some(1000);
    gauge.vbat_uv = 4_360_000;
    gauge.ocv_uv = 4_340_000;
    gauge.ibat_ua = 100_000;
    let mut manager = with_gauge(cfg, ChargerType::Dcp, gauge);

    run_until(&mut manager, at(60_000));
    assert_eq!(ChargeStatus::Full, manager.status());
    run_until(&mut manager, at(105_000));

    // full check due at 120s is sooner than the 60s polling interval
    assert_eq!(Some(Duration::from_secs(10)), manager.suspend(at(110_000)));

    manager.resume(at(115_000));
    assert_eq!(ChargeStatus::Full, manager.status());
    assert_eq!(Some(at(120_000)), manager.next_deadline());

    // short wakes get pushed out
    assert_eq!(Some(Duration::from_secs(4)), manager.suspend(at(119_000)));
}

#[test]
fn power_in_and_out() {
    let mut manager = battery_only(plain_config());
    manager.poll(T0);
    manager.devices_mut().adapter.charger_type = ChargerType::Dcp;

    let report = manager.handle_event(ManagerEvent::ExternalPowerIn, at(1_000));
    assert!(report.status_changed);
    assert!(manager.external_power());
    assert_eq!(ChargerType::Dcp, manager.charger_type());
    assert_eq!(ChargeStatus::Charging, manager.status());
    assert!(manager.devices().primary.enabled);
    assert_eq!(Some(at(15_000)), manager.next_deadline());

    manager.set_thermal_power_limit(5000);
    let report = manager.handle_event(ManagerEvent::ExternalPowerOut, at(2_000));
    assert!(report.status_changed);
    assert_eq!(ChargeStatus::Discharging, manager.status());
    assert_eq!(ChargerType::Unknown, manager.charger_type());
    assert_eq!(ChargeProfile::Unknown, manager.profile());
    assert_eq!(None, manager.thermal_limit_ua());
    assert_eq!(None, manager.resolved_vote(VoteKind::Ibat));
    assert_eq!(None, manager.resolved_vote(VoteKind::Ibus));
    assert!(!manager.devices().primary.enabled);
}

#[test]
fn power_out_tears_down_a_pump_session() {
    let mut manager = on_pps(ChargerConfig::default());
    manager.poll(T0);
    assert!(manager.charge_pump().running);

    manager.handle_event(ManagerEvent::ExternalPowerOut, at(200));

    let devices = manager.devices();
    assert!(!manager.charge_pump().running);
    assert!(!devices.pumps[0].enabled);
    assert!(!devices.adapter.pps);
    assert!(!devices.primary.enabled);
    assert_eq!(ChargeStatus::Discharging, manager.status());
}

#[test]
fn battery_removal_stops_charging() {
    let mut manager = on_adapter(plain_config(), ChargerType::Dcp);
    manager.poll(T0);

    manager.devices_mut().gauge.present = false;
    manager.handle_event(ManagerEvent::BatteryOut, at(1_000));
    assert!(!manager.battery_present());
    assert!(!manager.devices().primary.enabled);

    manager.devices_mut().gauge.present = true;
    manager.handle_event(ManagerEvent::BatteryIn, at(2_000));
    assert!(manager.battery_present());
    assert!(manager.devices().primary.enabled);
}

#[test]
fn missing_gauge_is_fatal() {
    struct Absent(SimGauge);

    // only presence matters to construction
    impl FuelGauge for Absent {
        fn vbat_now_uv(&mut self) -> Result<i32, DriverError> {
            self.0.vbat_now_uv()
        }
        fn vbat_avg_uv(&mut self) -> Result<i32, DriverError> {
            self.0.vbat_avg_uv()
        }
        fn ibat_now_ua(&mut self) -> Result<i32, DriverError> {
            self.0.ibat_now_ua()
        }
        fn ibat_avg_ua(&mut self) -> Result<i32, DriverError> {
            self.0.ibat_avg_ua()
        }
        fn ocv_uv(&mut self) -> Result<i32, DriverError> {
            self.0.ocv_uv()
        }
        fn temperature(&mut self) -> Result<i32, DriverError> {
            self.0.temperature()
        }
        fn capacity(&mut self) -> Result<i32, DriverError> {
            self.0.capacity()
        }
        fn battery_present(&mut self) -> Result<bool, DriverError> {
            Err(DriverError::NotPresent)
        }
        fn calibrate_capacity(&mut self, cap: i32) -> Result<(), DriverError> {
            self.0.calibrate_capacity(cap)
        }
        fn store_capacity(&mut self, cap: i32) -> Result<(), DriverError> {
            self.0.store_capacity(cap)
        }
        fn boot_capacity(&mut self) -> Result<Option<i32>, DriverError> {
            self.0.boot_capacity()
        }
    }

    struct NoGauge;

    impl ChargerHal for NoGauge {
        type Gauge = Absent;
        type Charger = SimCharger;
        type Pump = SimPump;
        type Adapter = SimAdapter;
    }

    let devices = Devices::<NoGauge>::new(
        Absent(SimGauge::new()),
        SimCharger::new(true),
        SimAdapter::new(ChargerType::Dcp),
    );
    let result = BatteryManager::new(plain_config(), devices, T0);
    assert!(matches!(result, Err(ManagerError::MissingFuelGauge)));
}

#[test]
fn events_queue_and_wake() {
    let events: EventChannel<NoopRawMutex, 4> = EventChannel::new();

    events.notify(ManagerEvent::FastChargeDetected).unwrap();
    block_on(events.send(ManagerEvent::ExternalPowerOut));

    // the urgent event already raised the wake signal
    block_on(events.wait_wake());

    assert_eq!(ManagerEvent::FastChargeDetected, block_on(events.receive()));
    assert_eq!(Some(ManagerEvent::ExternalPowerOut), events.try_receive());
    assert_eq!(None, events.try_receive());
}

#[test]
fn registry_spans_batteries() {
    let registry: Registry<NoopRawMutex, SimManager, 4> = Registry::new();

    let mut hot = on_adapter(plain_config(), ChargerType::Dcp);
    hot.devices_mut().gauge.temperature = 600;

    registry.register(on_adapter(plain_config(), ChargerType::Dcp)).unwrap();
    registry.register(battery_only(plain_config())).unwrap();
    let hot = registry.register(hot).unwrap();

    assert!(registry.monitor_all(T0));
    assert_eq!(Some(Duration::from_secs(15)), registry.polling_interval());
    assert_eq!(Ok(ChargeStatus::NotCharging), registry.with(hot, |m| m.status()));

    registry.remove(hot).unwrap();
    assert!(!registry.monitor_all(at(1_000)));
}

#[test]
fn task_service_publishes_changes() {
    let registry: Registry<NoopRawMutex, SimManager, 2> = Registry::new();
    let events: EventChannel<NoopRawMutex, 4> = EventChannel::new();
    let updates: BatteryUpdatePubSub<NoopRawMutex> = PubSubChannel::new();
    let mut subscriber = updates.subscriber().unwrap();

    let id = registry.register(on_adapter(plain_config(), ChargerType::Dcp)).unwrap();
    let mut task = ChargerManagerTask::new(&registry, id, &events, updates.immediate_publisher());

    assert_eq!(Ok(Some(at(15_000))), task.service(T0));
    let update = subscriber.try_next_message_pure().unwrap();
    assert_eq!(id, update.id);
    assert_eq!(ChargeStatus::Charging, update.status);
    assert_eq!(50, update.capacity);

    // nothing changed, nothing published
    task.service(at(1_000)).unwrap();
    assert!(subscriber.try_next_message_pure().is_none());

    events.notify(ManagerEvent::ExternalPowerOut).unwrap();
    task.service(at(2_000)).unwrap();
    let update = subscriber.try_next_message_pure().unwrap();
    assert!(update.report.status_changed);
    assert_eq!(ChargeStatus::Discharging, update.status);

    registry.remove(id).unwrap();
    assert_eq!(Err(ManagerError::UnknownId), task.service(at(3_000)));
}
