mod common;

use ateam_charger_manager::power::{ChargerType, ShutdownMode};

use common::*;

#[test]
fn discharging_never_rises() {
    let mut manager = battery_only(plain_config());
    manager.poll(T0);
    assert_eq!(500, manager.capacity_tenths());

    manager.devices_mut().gauge.capacity = 600;
    run_until(&mut manager, at(60_000));

    assert_eq!(500, manager.capacity_tenths());
    assert_eq!(None, manager.devices().gauge.stored);
}

#[test]
fn discharge_steps_are_bounded() {
    let mut manager = battery_only(plain_config());
    manager.devices_mut().gauge.capacity = 400;

    let report = manager.poll(T0);
    assert!(!report.capacity_changed);
    assert_eq!(495, manager.capacity_tenths());
    assert_eq!(Some(495), manager.devices().gauge.stored);

    // the next visible percent has to wait for a full window
    manager.poll(at(15_000));
    assert_eq!(495, manager.capacity_tenths());

    let report = manager.poll(at(30_000));
    assert!(report.capacity_changed);
    assert_eq!(490, manager.capacity_tenths());
    assert_eq!(49, manager.capacity());
    assert_eq!(Some(490), manager.devices().gauge.stored);
}

#[test]
fn catches_up_after_a_long_sleep() {
    let mut manager = battery_only(plain_config());
    manager.devices_mut().gauge.capacity = 400;
    manager.poll(T0);

    // nothing wants a periodic wake on battery
    assert_eq!(None, manager.suspend(at(1_000)));
    assert_eq!(None, manager.next_deadline());

    let report = manager.resume(at(301_000));
    assert!(report.capacity_changed);
    assert_eq!(400, manager.capacity_tenths());
}

#[test]
fn charging_never_falls_while_current_flows_in() {
    let mut manager = on_adapter(plain_config(), ChargerType::Dcp);
    manager.devices_mut().gauge.capacity = 450;

    run_until(&mut manager, at(60_000));

    assert_eq!(500, manager.capacity_tenths());
}

#[test]
fn uvlo_needs_consecutive_samples() {
    let mut manager = battery_only(plain_config());
    manager.devices_mut().gauge.vbat_uv = 3_000_000;

    assert_eq!(None, run_until(&mut manager, at(2_500)));
    assert!(!manager.uvlo_tripped());

    assert_eq!(Some(ShutdownMode::Orderly), run_until(&mut manager, at(3_300)));
    assert!(manager.uvlo_tripped());
    assert_eq!(Some(0), manager.devices().gauge.stored);
}

#[test]
fn uvlo_recovery_stops_the_fast_poll() {
    let mut manager = battery_only(plain_config());
    manager.devices_mut().gauge.vbat_uv = 3_000_000;
    run_until(&mut manager, at(1_700));

    manager.devices_mut().gauge.vbat_uv = 3_700_000;
    assert_eq!(None, run_until(&mut manager, at(2_500)));

    // only the capacity cadence is left
    assert_eq!(Some(at(15_000)), manager.next_deadline());
    assert!(!manager.uvlo_tripped());
}

#[test]
fn ui_shutdown_snaps_to_empty() {
    let mut cfg = plain_config();
    cfg.uvlo_shutdown_mode = ShutdownMode::Ui;
    let mut manager = battery_only(cfg);
    manager.devices_mut().gauge.vbat_uv = 3_000_000;

    assert_eq!(Some(ShutdownMode::Ui), run_until(&mut manager, at(3_300)));
    assert_eq!(0, manager.capacity());
    // capacity updates stop, the UI takes it from here
    assert_eq!(None, manager.next_deadline());
}

#[test]
fn cold_and_low_reads_empty() {
    let mut manager = battery_only(plain_config());
    {
        let gauge = &mut manager.devices_mut().gauge;
        gauge.temperature = 50;
        gauge.vbat_uv = 3_150_000;
    }

    // one cold sample is tolerated
    manager.poll(T0);
    assert_eq!(500, manager.capacity_tenths());

    // the second one reads as empty right away
    let report = manager.poll(at(15_000));
    assert!(report.capacity_changed);
    assert_eq!(0, manager.capacity());
    assert_eq!(Some(0), manager.devices().gauge.stored);
}
