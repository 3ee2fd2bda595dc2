mod common;

use ateam_charger_manager::config::{ChargeProfile, ChargerConfig, CP_CHECK_VBUS_RETRIES};
use ateam_charger_manager::event::ManagerEvent;
use ateam_charger_manager::power::charge_pump::{CpFault, CpState};
use ateam_charger_manager::power::ChargerType;

use common::*;

/// Powers up on PPS and walks the session through ENTRY and CHECK_VBUS.
fn tuning() -> SimManager {
    let mut manager = on_pps(ChargerConfig::default());

    manager.poll(T0);
    assert_eq!(CpState::CheckVbus, manager.cp_state());

    settle_vbus(&mut manager);
    manager.poll(at(500));
    assert_eq!(CpState::Tune, manager.cp_state());

    manager
}

#[test]
fn entry_hands_over_from_the_primary_charger() {
    let mut manager = on_pps(ChargerConfig::default());
    assert_eq!(ChargerType::Pps, manager.charger_type());

    manager.poll(T0);

    let devices = manager.devices();
    assert!(manager.charge_pump().running);
    assert_eq!(CpState::CheckVbus, manager.cp_state());
    assert_eq!(ChargeProfile::Flash, manager.profile());
    assert!(!devices.primary.enabled);
    assert!(devices.pumps[0].enabled);
    assert_eq!(1, devices.pumps[0].inits);
    assert!(devices.adapter.pps);
    // 3.8V * 2.05 plus the low battery guard band
    assert_eq!(Some(7_990_000), devices.adapter.requested_uv);
    assert_eq!(Some(3_000_000), devices.adapter.requested_ua);
    assert_eq!(Some(at(500)), manager.next_deadline());
}

#[test]
fn taper_ends_the_session() {
    let mut manager = tuning();

    {
        let devices = manager.devices_mut();
        devices.pumps[0].vbat_uv = 4_380_000;
        devices.pumps[0].ibat_ua = 500_000;
        // high enough that the monitor doesn't start another session
        devices.gauge.ocv_uv = 4_300_000;
    }

    let mut t = 1_000;
    while manager.charge_pump().running && t < 10_000 {
        manager.poll(at(t));
        t += 500;
    }

    let devices = manager.devices();
    assert!(!manager.charge_pump().running);
    assert_eq!(CpState::Exit, manager.cp_state());
    assert!(devices.primary.enabled);
    assert!(!devices.pumps[0].enabled);
    assert!(!devices.adapter.pps);
    assert_eq!(ChargeProfile::Dcp, manager.profile());
    assert!(!manager.fast_charge_enabled());
}

#[test]
fn entry_carries_on_when_pps_reset_fails() {
    let mut manager = on_pps(ChargerConfig::default());
    manager.devices_mut().adapter.fail_pps_disable = true;

    manager.poll(T0);

    assert_eq!(CpState::CheckVbus, manager.cp_state());
    assert_eq!(1, manager.devices().adapter.pps_disables);
    assert!(manager.devices().adapter.pps);
    assert!(manager.devices().pumps[0].enabled);
}

#[test]
fn check_vbus_walks_up_on_low_error() {
    let mut manager = on_pps(ChargerConfig::default());
    manager.poll(T0);

    settle_vbus(&mut manager);
    manager.devices_mut().pumps[0].health.vbus_error_lo = true;
    manager.poll(at(500));

    assert_eq!(CpState::CheckVbus, manager.cp_state());
    assert_eq!(1, manager.charge_pump().tune_vbus_retry);
    assert_eq!(Some(8_010_000), manager.devices().adapter.requested_uv);

    manager.devices_mut().pumps[0].health.vbus_error_lo = false;
    manager.poll(at(1_000));
    assert_eq!(CpState::Tune, manager.cp_state());
}

#[test]
fn bus_voltage_that_never_settles_gives_up() {
    let mut manager = on_pps(ChargerConfig::default());
    manager.poll(T0);
    manager.devices_mut().pumps[0].health.vbus_error_lo = true;

    let mut t = 500;
    while manager.charge_pump().running && t < 60_000 {
        manager.poll(at(t));
        t += 500;
    }

    assert!(!manager.charge_pump().running);
    assert_eq!(CP_CHECK_VBUS_RETRIES, manager.charge_pump().tune_vbus_retry);
    assert!(!manager.devices().adapter.pps);
    assert!(manager.devices().primary.enabled);
}

#[test]
fn stopping_twice_is_harmless() {
    let mut manager = tuning();

    manager.stop_charge_pump(at(700));
    assert!(!manager.charge_pump().running);

    let (disables, pps_disables, enable_calls) = {
        let devices = manager.devices();
        (devices.pumps[0].disable_calls, devices.adapter.pps_disables, devices.primary.enable_calls)
    };

    manager.stop_charge_pump(at(800));

    let devices = manager.devices();
    assert_eq!(disables, devices.pumps[0].disable_calls);
    assert_eq!(pps_disables, devices.adapter.pps_disables);
    assert_eq!(enable_calls, devices.primary.enable_calls);
    assert_eq!(CpState::Exit, manager.cp_state());
}

#[test]
fn pump_dropping_out_recovers_into_a_new_session() {
    let mut manager = tuning();
    manager.devices_mut().pumps[0].enabled = false;

    manager.poll(at(1_000));
    assert_eq!(CpState::Exit, manager.cp_state());
    assert!(manager.charge_pump().recovery);

    manager.poll(at(1_500));
    assert_eq!(CpState::Recovery, manager.cp_state());
    assert!(manager.charge_pump().running);
    assert!(manager.devices().primary.enabled);

    manager.poll(at(2_000));
    assert_eq!(CpState::Entry, manager.cp_state());

    manager.poll(at(2_500));
    assert_eq!(CpState::CheckVbus, manager.cp_state());
    assert_eq!(2, manager.devices().pumps[0].inits);
    assert_eq!(ChargeProfile::Flash, manager.profile());
}

#[test]
fn thermal_fault_ends_the_session() {
    let mut manager = tuning();

    manager.devices_mut().pumps[0].health.faults.insert(CpFault::DieTherm);
    manager.handle_event(ManagerEvent::ChargerFault, at(700));

    manager.poll(at(1_000));
    assert_eq!(CpState::Exit, manager.cp_state());
    // consumed by the state machine, not left for the next session
    assert!(manager.charge_pump().health.faults.is_empty());

    manager.poll(at(1_500));
    assert!(!manager.charge_pump().running);
    assert_eq!(1, manager.devices().pumps[0].faults_cleared);
    assert!(manager.devices().primary.enabled);
}

#[test]
fn faults_are_ignored_until_notified() {
    let mut manager = tuning();

    manager.devices_mut().pumps[0].health.faults.insert(CpFault::BusOvp);
    manager.poll(at(1_000));
    assert_eq!(CpState::Tune, manager.cp_state());

    manager.handle_event(ManagerEvent::ChargerFault, at(1_200));
    manager.poll(at(1_500));
    assert_eq!(CpState::Exit, manager.cp_state());
}

#[test]
fn pps_without_a_pump_is_plain_pd() {
    let manager = on_adapter(plain_config(), ChargerType::Pps);
    assert_eq!(ChargerType::Pd, manager.charger_type());
}
