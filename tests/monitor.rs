mod common;

use ateam_charger_manager::config::{ChargeProfile, ChargerConfig};
use ateam_charger_manager::event::ManagerEvent;
use ateam_charger_manager::power::vote::VoteKind;
use ateam_charger_manager::power::{ChargeStatus, ChargerHealth, ChargerType, StopReason};
use embassy_time::Duration;

use common::*;

#[test]
fn discharging_without_external_power() {
    let mut manager = battery_only(plain_config());

    let report = manager.poll(T0);

    assert!(!report.status_changed);
    assert_eq!(ChargeStatus::Discharging, manager.status());
    assert!(!manager.charger_enabled());
    assert!(!manager.devices().primary.enabled);
    assert_eq!(50, manager.capacity());
    // no monitor polling on battery, only the capacity cadence
    assert_eq!(Some(at(15_000)), manager.next_deadline());
}

#[test]
fn charging_on_dcp() {
    let mut manager = on_adapter(plain_config(), ChargerType::Dcp);
    assert_eq!(ChargeProfile::Dcp, manager.profile());

    let report = manager.poll(T0);

    assert!(report.status_changed);
    assert!(!report.not_charging);
    assert_eq!(ChargeStatus::Charging, manager.status());

    let primary = &manager.devices().primary;
    assert!(primary.enabled);
    assert_eq!(Some(2_000_000), primary.charge_current_ua);
    assert_eq!(Some(2_000_000), primary.input_limit_ua);
    assert!(primary.watchdog_feeds > 0);
}

#[test]
fn thermal_window_has_hysteresis() {
    let mut manager = on_adapter(plain_config(), ChargerType::Dcp);
    manager.poll(T0);

    manager.devices_mut().gauge.temperature = 510;
    let report = manager.poll(at(15_000));
    assert!(report.not_charging);
    assert_eq!(ChargeStatus::NotCharging, manager.status());
    assert_eq!(Some(StopReason::Overheat), manager.emergency_stop());
    assert!(!manager.devices().primary.enabled);

    // back under the limit but not under limit - diff yet
    manager.devices_mut().gauge.temperature = 460;
    manager.poll(at(30_000));
    assert_eq!(ChargeStatus::NotCharging, manager.status());

    manager.devices_mut().gauge.temperature = 440;
    manager.poll(at(45_000));
    assert_eq!(ChargeStatus::Charging, manager.status());
    assert_eq!(None, manager.emergency_stop());
    assert!(manager.devices().primary.enabled);
}

#[test]
fn unhealthy_charger_latches_until_good() {
    let mut manager = on_adapter(plain_config(), ChargerType::Dcp);
    manager.poll(T0);

    manager.devices_mut().primary.health = ChargerHealth::Overheat;
    manager.poll(at(15_000));
    assert_eq!(ChargeStatus::NotCharging, manager.status());
    assert!(manager.latches().contains(StopReason::HealthAbnormal));

    // still latched while the charger keeps reporting a problem
    manager.poll(at(30_000));
    assert_eq!(ChargeStatus::NotCharging, manager.status());

    manager.devices_mut().primary.health = ChargerHealth::Good;
    manager.poll(at(45_000));
    assert_eq!(ChargeStatus::Charging, manager.status());
    assert!(manager.latches().is_empty());
}

#[test]
fn bus_overvoltage_needs_the_drop_to_recover() {
    let mut manager = on_adapter(plain_config(), ChargerType::Dcp);
    manager.poll(T0);

    manager.devices_mut().primary.bus_voltage_uv = 7_000_000;
    manager.poll(at(15_000));
    assert_eq!(ChargeStatus::NotCharging, manager.status());
    assert!(manager.latches().contains(StopReason::VoltageAbnormal));

    // under the max, not under max - drop
    manager.devices_mut().primary.bus_voltage_uv = 6_000_000;
    manager.poll(at(30_000));
    assert_eq!(ChargeStatus::NotCharging, manager.status());

    manager.devices_mut().primary.bus_voltage_uv = 5_700_000;
    manager.poll(at(45_000));
    assert_eq!(ChargeStatus::Charging, manager.status());
}

#[test]
fn input_suspend_stops_charging() {
    let mut manager = on_adapter(plain_config(), ChargerType::Dcp);
    manager.poll(T0);

    manager.set_input_suspend(true, at(1_000));
    let report = manager.poll(at(1_000));
    assert!(report.not_charging);
    assert_eq!(ChargeStatus::NotCharging, manager.status());
    assert!(!manager.devices().primary.enabled);

    manager.set_input_suspend(false, at(2_000));
    manager.poll(at(2_000));
    assert_eq!(ChargeStatus::Charging, manager.status());
}

#[test]
fn capacity_ceiling_holds_charging_off() {
    let mut manager = on_adapter(plain_config(), ChargerType::Dcp);

    manager.set_capacity_ceiling(Some(50), T0);
    manager.poll(T0);
    assert_eq!(ChargeStatus::NotCharging, manager.status());

    manager.set_capacity_ceiling(Some(60), at(1_000));
    manager.poll(at(1_000));
    assert_eq!(ChargeStatus::Charging, manager.status());
}

#[test]
fn full_after_two_terminations_then_recharge() {
    let mut gauge = SimGauge::new();
    gauge.capacity = 1000;
    gauge.boot_capacity = Some(1000);
    let mut manager = with_gauge(plain_config(), ChargerType::Dcp, gauge);

    manager.poll(T0);
    assert_eq!(ChargeStatus::Charging, manager.status());

    {
        let gauge = &mut manager.devices_mut().gauge;
        gauge.vbat_uv = 4_360_000;
        gauge.ocv_uv = 4_340_000;
        gauge.ibat_ua = 100_000;
    }

    // one sample under termination isn't enough
    manager.poll(at(15_000));
    assert_eq!(ChargeStatus::Charging, manager.status());

    let report = manager.poll(at(30_000));
    assert!(report.status_changed);
    assert_eq!(ChargeStatus::Full, manager.status());
    assert!(!manager.devices().primary.enabled);
    // gauge already reads full, no recalibration
    assert_eq!(None, manager.devices().gauge.calibrated);

    manager.poll(at(45_000));
    assert_eq!(ChargeStatus::Full, manager.status());

    manager.devices_mut().gauge.ocv_uv = 4_200_000;
    manager.poll(at(60_000));
    assert_eq!(ChargeStatus::Charging, manager.status());
    assert!(manager.devices().primary.enabled);
}

#[test]
fn learned_capacity_over_the_threshold_is_full() {
    let mut cfg = plain_config();
    cfg.fullbatt_full_capacity_uah = 4_000_000;

    let mut gauge = SimGauge::new();
    gauge.charge_full_uah = Some(4_000_000);
    let mut manager = with_gauge(cfg.clone(), ChargerType::Dcp, gauge);
    manager.poll(T0);
    assert_eq!(ChargeStatus::Charging, manager.status());

    let mut gauge = SimGauge::new();
    gauge.charge_full_uah = Some(4_100_000);
    let mut manager = with_gauge(cfg, ChargerType::Dcp, gauge);
    manager.poll(T0);
    assert_eq!(ChargeStatus::Full, manager.status());
    assert!(!manager.devices().primary.enabled);
}

#[test]
fn termination_below_full_calibrates_the_gauge() {
    let mut manager = on_adapter(plain_config(), ChargerType::Dcp);
    manager.poll(T0);

    {
        let gauge = &mut manager.devices_mut().gauge;
        gauge.vbat_uv = 4_360_000;
        gauge.ibat_ua = 100_000;
    }

    manager.poll(at(15_000));
    manager.poll(at(30_000));

    assert_eq!(ChargeStatus::Charging, manager.status());
    assert_eq!(Some(1000), manager.devices().gauge.calibrated);
    // primary stopped while the capacity catches up
    assert!(!manager.devices().primary.enabled);
}

#[test]
fn charging_too_long_latches_until_rested() {
    let mut cfg = plain_config();
    cfg.charging_max_duration = Duration::from_secs(60);
    cfg.discharging_max_duration = Duration::from_secs(30);
    let mut manager = on_adapter(cfg, ChargerType::Dcp);
    manager.devices_mut().gauge.ocv_uv = 4_300_000;

    for t in (0..=60_000).step_by(15_000) {
        manager.poll(at(t));
        assert_eq!(ChargeStatus::Charging, manager.status());
    }

    manager.poll(at(75_000));
    assert_eq!(ChargeStatus::NotCharging, manager.status());
    assert!(manager.latches().contains(StopReason::DurationAbnormal));

    manager.poll(at(90_000));
    manager.poll(at(105_000));
    assert_eq!(ChargeStatus::NotCharging, manager.status());

    manager.poll(at(120_000));
    assert_eq!(ChargeStatus::Charging, manager.status());
    assert!(manager.latches().is_empty());
}

#[test]
fn jeita_zone_change_is_debounced() {
    let mut manager = on_adapter(ChargerConfig::default(), ChargerType::Dcp);
    manager.poll(T0);
    assert_eq!(2, manager.jeita_zone());
    assert_eq!(Some(4_400_000), manager.devices().primary.constant_voltage_uv);

    manager.devices_mut().gauge.temperature = 470;
    manager.poll(at(15_000));
    manager.poll(at(30_000));
    assert_eq!(2, manager.jeita_zone());
    assert_eq!(Some(4_400_000), manager.devices().primary.constant_voltage_uv);

    manager.poll(at(45_000));
    assert_eq!(3, manager.jeita_zone());
    assert_eq!(Some(4_100_000), manager.devices().primary.constant_voltage_uv);
    assert_eq!(Some(1_000_000), manager.devices().primary.charge_current_ua);
    assert_eq!(ChargeStatus::Charging, manager.status());
}

#[test]
fn ir_floor_goes_away_with_compensation() {
    let mut cfg = ChargerConfig::default();
    cfg.ir.rc_mohm = 50;
    let mut manager = on_adapter(cfg, ChargerType::Dcp);

    // 2A through 50 milli-ohm lifts the 4.4V zone voltage to the 4.5V cap
    run_until(&mut manager, at(30_000));
    assert_eq!(2, manager.jeita_zone());
    assert_eq!(Some(4_500_000), manager.resolved_vote(VoteKind::Cccv));

    manager.set_input_suspend(true, at(30_000));
    run_until(&mut manager, at(30_000));
    assert_eq!(Some(4_400_000), manager.devices().primary.constant_voltage_uv);

    manager.devices_mut().gauge.temperature = 470;
    run_until(&mut manager, at(120_000));
    assert_eq!(3, manager.jeita_zone());

    manager.devices_mut().gauge.ibat_ua = 0;
    manager.set_input_suspend(false, at(120_000));
    run_until(&mut manager, at(240_000));

    assert_eq!(ChargeStatus::Charging, manager.status());
    assert_eq!(Some(4_100_000), manager.resolved_vote(VoteKind::Cccv));
    assert_eq!(Some(4_100_000), manager.devices().primary.constant_voltage_uv);
}

#[test]
fn cold_battery_stops_on_the_first_sample() {
    let mut manager = on_adapter(ChargerConfig::default(), ChargerType::Dcp);
    manager.devices_mut().gauge.temperature = -10;

    let report = manager.poll(T0);

    assert!(report.not_charging);
    assert_eq!(ChargeStatus::NotCharging, manager.status());
    assert!(manager.latches().contains(StopReason::Cold));
    assert!(!manager.devices().primary.enabled);
}

#[test]
fn forced_zone_overrides_temperature() {
    let mut manager = on_adapter(ChargerConfig::default(), ChargerType::Dcp);
    manager.poll(T0);

    manager.force_jeita_zone(Some(3), at(1_000));
    manager.poll(at(1_000));
    assert_eq!(3, manager.jeita_zone());
    assert_eq!(Some(4_100_000), manager.devices().primary.constant_voltage_uv);

    manager.force_jeita_zone(None, at(2_000));
    manager.poll(at(2_000));
    assert_eq!(2, manager.jeita_zone());
    assert_eq!(Some(4_400_000), manager.devices().primary.constant_voltage_uv);
}

#[test]
fn thermal_budget_limits_input_current() {
    let mut manager = on_adapter(plain_config(), ChargerType::Dcp);
    manager.poll(T0);

    manager.handle_event(ManagerEvent::ThermalLimitChanged(5000), at(1_000));
    assert_eq!(Some(1_000_000), manager.thermal_limit_ua());
    assert_eq!(Some(1_000_000), manager.resolved_vote(VoteKind::Ibus));
    assert_eq!(Some(1_000_000), manager.devices().primary.input_limit_ua);

    manager.handle_event(ManagerEvent::ThermalLimitChanged(0), at(2_000));
    assert_eq!(None, manager.thermal_limit_ua());
    assert_eq!(Some(2_000_000), manager.devices().primary.input_limit_ua);
}

#[test]
fn user_limits_only_tighten() {
    let mut manager = on_adapter(plain_config(), ChargerType::Dcp);
    manager.poll(T0);

    manager.set_user_charge_current(Some(3_000_000));
    assert_eq!(Some(2_000_000), manager.resolved_vote(VoteKind::Ibat));

    manager.set_user_charge_current(Some(800_000));
    assert_eq!(Some(800_000), manager.devices().primary.charge_current_ua);

    manager.set_user_charge_current(None);
    assert_eq!(Some(2_000_000), manager.devices().primary.charge_current_ua);
}

#[test]
fn fixed_voltage_fast_charge_splits_current() {
    let mut manager = on_pd_parallel(plain_config());
    assert_eq!(ChargeProfile::Dcp, manager.profile());

    manager.poll(T0);

    assert!(manager.fast_charge_enabled());
    assert_eq!(ChargeProfile::Fchg, manager.profile());
    {
        let devices = manager.devices();
        let secondary = devices.secondary.as_ref().unwrap();
        assert_eq!(Some(9_000_000), devices.adapter.requested_uv);
        assert!(secondary.enabled);
        assert_eq!(Some(1_625_000), devices.primary.charge_current_ua);
        assert_eq!(Some(1_625_000), secondary.charge_current_ua);
    }

    // two low current cycles in a row turn it back off
    manager.devices_mut().gauge.ibat_ua = 500_000;
    manager.poll(at(15_000));
    assert!(manager.fast_charge_enabled());

    manager.poll(at(30_000));
    assert!(!manager.fast_charge_enabled());
    assert_eq!(ChargeProfile::Dcp, manager.profile());

    let devices = manager.devices();
    assert_eq!(Some(5_000_000), devices.adapter.requested_uv);
    assert!(!devices.secondary.as_ref().unwrap().enabled);
    assert_eq!(Some(2_000_000), devices.primary.charge_current_ua);
    assert_eq!(ChargeStatus::Charging, manager.status());
}
