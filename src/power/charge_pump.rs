use crate::config::*;

use super::{Flag, FlagSet};

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CpState {
    Unknown,
    Recovery,
    Entry,
    CheckVbus,
    Tune,
    Exit,
}

/// Early warnings, the tuning loop backs off while any is set.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CpAlarm {
    BatOvp,
    BatOcp,
    BusOvp,
    BusOcp,
    BatTherm,
    BusTherm,
    DieTherm,
    BatUcp,
}

/// Hard faults, any of them ends the session.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CpFault {
    BatOvp,
    BatOcp,
    BusOvp,
    BusOcp,
    BatTherm,
    BusTherm,
    DieTherm,
}

impl Flag for CpAlarm {
    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

impl Flag for CpFault {
    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

impl CpFault {
    pub fn is_thermal(self) -> bool {
        matches!(self, CpFault::BatTherm | CpFault::BusTherm | CpFault::DieTherm)
    }
}

#[derive(Clone, Copy, Default, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CpHealth {
    pub alarms: FlagSet<CpAlarm>,
    pub faults: FlagSet<CpFault>,
    pub vbus_error_lo: bool,
    pub vbus_error_hi: bool,
}

impl CpHealth {
    pub fn merge(&mut self, other: &CpHealth) {
        for alarm in [
            CpAlarm::BatOvp,
            CpAlarm::BatOcp,
            CpAlarm::BusOvp,
            CpAlarm::BusOcp,
            CpAlarm::BatTherm,
            CpAlarm::BusTherm,
            CpAlarm::DieTherm,
            CpAlarm::BatUcp,
        ] {
            if other.alarms.contains(alarm) {
                self.alarms.insert(alarm);
            }
        }

        for fault in [
            CpFault::BatOvp,
            CpFault::BatOcp,
            CpFault::BusOvp,
            CpFault::BusOcp,
            CpFault::BatTherm,
            CpFault::BusTherm,
            CpFault::DieTherm,
        ] {
            if other.faults.contains(fault) {
                self.faults.insert(fault);
            }
        }

        self.vbus_error_lo |= other.vbus_error_lo;
        self.vbus_error_hi |= other.vbus_error_hi;
    }

    pub fn thermal_fault(&self) -> bool {
        self.faults.contains(CpFault::BatTherm)
            || self.faults.contains(CpFault::BusTherm)
            || self.faults.contains(CpFault::DieTherm)
    }

    pub fn protection_fault(&self) -> bool {
        self.faults.contains(CpFault::BatOvp)
            || self.faults.contains(CpFault::BatOcp)
            || self.faults.contains(CpFault::BusOvp)
            || self.faults.contains(CpFault::BusOcp)
    }

    /// Any alarm other than under-current, which is counted separately.
    pub fn limit_alarm(&self) -> bool {
        let mut alarms = self.alarms;
        alarms.remove(CpAlarm::BatUcp);
        !alarms.is_empty()
    }

    pub fn vbus_error(&self) -> bool {
        self.vbus_error_lo || self.vbus_error_hi
    }
}

#[derive(Clone, Copy, Default, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CpSample {
    pub vbat_uv: i32,
    pub ibat_ua: i32,
    pub vbus_uv: i32,
    pub ibus_ua: i32,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TuneResult {
    pub taper_done: bool,
    pub vbat_step: i32,
    pub ibat_step: i32,
    pub vbus_step: i32,
    pub ibus_step: i32,
    pub alarm_step: i32,
    /// signed change applied to the target bus voltage
    pub step: i32,
}

/// Tiered step: 3, 2 or 1 units while the measurement is far, near or just
/// under target, -2 units once above it. Nothing without a valid reading.
pub fn tier_step(measured: i32, delta: i32, step1: i32, step2: i32, step3: i32) -> i32 {
    if measured <= 0 {
        0
    } else if delta > step1 {
        CP_VSTEP_UV * 3
    } else if delta > step2 {
        CP_VSTEP_UV * 2
    } else if delta > step3 {
        CP_VSTEP_UV
    } else if delta < 0 {
        -CP_VSTEP_UV * 2
    } else {
        0
    }
}

/// Bus voltage to open a session with, just above 2x vbat.
pub fn initial_target_vbus(vbat_uv: i32) -> i32 {
    let guard = if vbat_uv <= CP_ACC_VBAT_HIGH_UV { 10 * CP_VSTEP_UV } else { 2 * CP_VSTEP_UV };
    vbat_uv * CP_VBUS_LOW_RATIO / 100 + guard
}

pub fn vbus_window(vbat_uv: i32) -> (i32, i32) {
    (vbat_uv * CP_VBUS_LOW_RATIO / 100, vbat_uv * CP_VBUS_HIGH_RATIO / 100)
}

/// Charge pump session bookkeeping. Retry counters live here, one set per
/// battery.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargePumpState {
    pub state: CpState,
    pub running: bool,
    pub recovery: bool,
    /// monitor loop should look at eligibility every cycle
    pub check_threshold: bool,
    pub check_fault: bool,
    pub fault_event: bool,

    pub max_ibus_ua: i32,
    pub taper_current_ua: i32,
    pub adapter_max_vbus_uv: i32,
    pub adapter_max_ibus_ua: i32,

    pub target_vbat_uv: i32,
    pub target_ibat_ua: i32,
    pub target_vbus_uv: i32,
    pub target_ibus_ua: i32,
    pub last_target_vbus_uv: i32,

    pub sample: CpSample,
    pub health: CpHealth,

    pub primary_disable_retry: u32,
    pub tune_vbus_retry: u32,
    pub ucp_count: u32,
    pub taper_count: u32,
    pub adjust_count: u32,
    pub tune_logged: bool,
}

impl ChargePumpState {
    pub fn new(cfg: &ChargePumpConfig) -> Self {
        Self {
            state: CpState::Unknown,
            running: false,
            recovery: false,
            check_threshold: false,
            check_fault: false,
            fault_event: false,

            max_ibus_ua: cfg.max_ibus_ua,
            taper_current_ua: cfg.taper_current_ua,
            adapter_max_vbus_uv: 0,
            adapter_max_ibus_ua: 0,

            target_vbat_uv: cfg.target_vbat_uv,
            target_ibat_ua: cfg.max_ibat_ua,
            target_vbus_uv: 0,
            target_ibus_ua: 0,
            last_target_vbus_uv: 0,

            sample: CpSample::default(),
            health: CpHealth::default(),

            primary_disable_retry: 0,
            tune_vbus_retry: 0,
            ucp_count: 0,
            taper_count: 0,
            adjust_count: 0,
            tune_logged: false,
        }
    }

    pub fn set_state(&mut self, state: CpState) {
        if self.state != state {
            debug!("cp state {} -> {}", self.state, state);
        }
        self.state = state;
    }

    /// In ENTRY..=TUNE, the states that own the actuators.
    pub fn in_session(&self) -> bool {
        matches!(self.state, CpState::Entry | CpState::CheckVbus | CpState::Tune)
    }

    pub fn vbat_step(&self) -> i32 {
        tier_step(
            self.sample.vbat_uv,
            self.target_vbat_uv - self.sample.vbat_uv,
            CP_VBAT_STEP1_UV,
            CP_VBAT_STEP2_UV,
            CP_VBAT_STEP3_UV,
        )
    }

    pub fn ibat_step(&self) -> i32 {
        tier_step(
            self.sample.ibat_ua,
            self.target_ibat_ua - self.sample.ibat_ua,
            CP_IBAT_STEP1_UA,
            CP_IBAT_STEP2_UA,
            CP_IBAT_STEP3_UA,
        )
    }

    pub fn vbus_step(&self) -> i32 {
        tier_step(
            self.sample.vbus_uv,
            self.adapter_max_vbus_uv - self.sample.vbus_uv,
            CP_VBUS_STEP1_UV,
            CP_VBUS_STEP2_UV,
            CP_VBUS_STEP3_UV,
        )
    }

    pub fn ibus_step(&self) -> i32 {
        tier_step(
            self.sample.ibus_ua,
            self.target_ibus_ua - self.sample.ibus_ua,
            CP_IBUS_STEP1_UA,
            CP_IBUS_STEP2_UA,
            CP_IBUS_STEP3_UA,
        )
    }

    pub fn alarm_step(&self) -> i32 {
        if self.health.limit_alarm() {
            -CP_VSTEP_UV * 2
        } else {
            CP_VSTEP_UV * 3
        }
    }

    /// Bus current target, the tightest of pump rating, adapter rating and
    /// the thermal budget.
    pub fn update_target_ibus(&mut self, thermal_limit_ua: Option<i32>) {
        let mut target = self.max_ibus_ua;
        if self.adapter_max_ibus_ua > 0 {
            target = target.min(self.adapter_max_ibus_ua);
        }

        if let Some(limit) = thermal_limit_ua.filter(|l| *l > 0) {
            target = target.min(limit);
        }

        self.target_ibus_ua = target;
    }

    pub fn clamp_target_vbus(&mut self) {
        if self.adapter_max_vbus_uv > 0 {
            self.target_vbus_uv = self.target_vbus_uv.min(self.adapter_max_vbus_uv);
        }
    }

    /// One convergence step over the current `sample`/`health`.
    pub fn tune_algo(&mut self, thermal_limit_ua: Option<i32>) -> TuneResult {
        let mut result = TuneResult {
            taper_done: false,
            vbat_step: 0,
            ibat_step: 0,
            vbus_step: 0,
            ibus_step: 0,
            alarm_step: 0,
            step: 0,
        };

        if self.sample.vbat_uv >= self.target_vbat_uv - CP_TAPER_MARGIN_UV {
            if self.sample.ibat_ua < self.taper_current_ua {
                let count = self.taper_count;
                self.taper_count += 1;
                if count > CP_TAPER_COUNT {
                    result.taper_done = true;
                    return result;
                }
            } else {
                self.taper_count = 0;
            }
        }

        result.vbat_step = self.vbat_step();
        result.ibat_step = self.ibat_step();
        result.vbus_step = self.vbus_step();
        self.update_target_ibus(thermal_limit_ua);
        result.ibus_step = self.ibus_step();
        result.alarm_step = self.alarm_step();

        result.step = result.vbat_step
            .min(result.ibat_step)
            .min(result.vbus_step)
            .min(result.ibus_step)
            .min(result.alarm_step);

        self.target_vbus_uv += result.step;
        self.clamp_target_vbus();

        debug!(
            "cp tune vbat {} ibat {} vbus {} ibus {} target vbus {} step {} taper {}",
            self.sample.vbat_uv,
            self.sample.ibat_ua,
            self.sample.vbus_uv,
            self.sample.ibus_ua,
            self.target_vbus_uv,
            result.step,
            self.taper_count,
        );

        result
    }

    /// Sustained under-current check, evaluated every TUNE cycle
    /// independently of the step computation.
    pub fn check_ucp(&mut self) -> bool {
        let ucp_alarm = self.health.alarms.contains(CpAlarm::BatUcp);
        if ucp_alarm {
            warn!("cp battery under-current alarm");
            self.ucp_count += 1;
        }

        if self.ucp_count == 0 {
            return false;
        }

        if self.sample.vbat_uv >= self.target_vbat_uv - CP_TAPER_MARGIN_UV {
            self.ucp_count = 0;
            return false;
        }

        if self.sample.ibat_ua < self.taper_current_ua && !ucp_alarm {
            self.ucp_count += 1;
        } else if self.sample.ibat_ua >= self.taper_current_ua {
            self.ucp_count = 0;
        }

        self.ucp_count > CP_IBAT_UCP_THRESHOLD
    }

    /// Alarms and faults are only ever dropped here, never implicitly.
    pub fn clear_fault_status(&mut self) {
        self.health.alarms.clear();
        self.health.faults.clear();
        self.fault_event = false;
    }

    /// Clears everything a finished session leaves behind.
    pub fn end_session(&mut self) {
        self.check_fault = false;
        self.fault_event = false;
        self.ucp_count = 0;
        self.taper_count = 0;
        self.tune_logged = false;
    }

    /// Back to the power-on state, keeps board limits.
    pub fn reset(&mut self) {
        let max_ibus_ua = self.max_ibus_ua;
        let taper_current_ua = self.taper_current_ua;
        let target_vbat_uv = self.target_vbat_uv;
        let target_ibat_ua = self.target_ibat_ua;
        *self = Self {
            max_ibus_ua,
            taper_current_ua,
            target_vbat_uv,
            target_ibat_ua,
            ..Self::new(&ChargePumpConfig {
                max_ibus_ua,
                max_ibat_ua: target_ibat_ua,
                target_vbat_uv,
                taper_current_ua,
                fchg_ocv_threshold_uv: 0,
            })
        };
    }
}

/////////////
//  TESTS  //
/////////////

#[cfg(test)]
fn test_state() -> ChargePumpState {
    let cfg = ChargePumpConfig {
        max_ibus_ua: 3_000_000,
        max_ibat_ua: 3_000_000,
        target_vbat_uv: 4_350_000,
        taper_current_ua: 1_000_000,
        fchg_ocv_threshold_uv: 0,
    };
    ChargePumpState::new(&cfg)
}

#[test]
fn tune_takes_most_cautious_step() {
    let mut cp = test_state();
    cp.target_ibat_ua = 3_000_000;
    cp.adapter_max_vbus_uv = 9_000_000;
    cp.adapter_max_ibus_ua = 3_000_000;
    cp.target_vbus_uv = 8_200_000;
    cp.sample = CpSample {
        vbat_uv: 4_000_000,
        ibat_ua: 1_000_000,
        vbus_uv: 8_200_000,
        ibus_ua: 2_000_000,
    };

    let result = cp.tune_algo(None);

    assert!(!result.taper_done);
    assert_eq!(60_000, result.vbat_step);
    assert_eq!(40_000, result.ibat_step);
    assert_eq!(20_000, result.vbus_step);
    assert_eq!(40_000, result.ibus_step);
    assert_eq!(60_000, result.alarm_step);
    assert_eq!(20_000, result.step);
    assert_eq!(8_220_000, cp.target_vbus_uv);
    assert!(cp.target_vbus_uv <= cp.adapter_max_vbus_uv);
}

#[test]
fn tune_never_exceeds_adapter_max() {
    let mut cp = test_state();
    cp.adapter_max_vbus_uv = 9_000_000;
    cp.target_vbus_uv = 9_000_000;
    cp.sample = CpSample {
        vbat_uv: 3_600_000,
        ibat_ua: 500_000,
        vbus_uv: 4_000_000,
        ibus_ua: 500_000,
    };

    for _ in 0..20 {
        cp.tune_algo(None);
        assert!(cp.target_vbus_uv <= 9_000_000);
    }
}

#[test]
fn alarm_backs_off() {
    let mut cp = test_state();
    cp.adapter_max_vbus_uv = 9_000_000;
    cp.target_vbus_uv = 8_000_000;
    cp.sample = CpSample {
        vbat_uv: 3_800_000,
        ibat_ua: 500_000,
        vbus_uv: 6_000_000,
        ibus_ua: 500_000,
    };
    cp.health.alarms.insert(CpAlarm::BusOcp);

    let result = cp.tune_algo(None);
    assert_eq!(-40_000, result.step);
    assert_eq!(7_960_000, cp.target_vbus_uv);
}

#[test]
fn thermal_limit_caps_bus_current() {
    let mut cp = test_state();
    cp.adapter_max_ibus_ua = 2_500_000;
    cp.update_target_ibus(Some(1_800_000));
    assert_eq!(1_800_000, cp.target_ibus_ua);
    cp.update_target_ibus(None);
    assert_eq!(2_500_000, cp.target_ibus_ua);
}

#[test]
fn taper_needs_consecutive_samples() {
    let mut cp = test_state();
    cp.adapter_max_vbus_uv = 9_000_000;
    cp.sample = CpSample {
        vbat_uv: 4_320_000,
        ibat_ua: 800_000,
        vbus_uv: 8_800_000,
        ibus_ua: 400_000,
    };

    for _ in 0..=CP_TAPER_COUNT {
        assert!(!cp.tune_algo(None).taper_done);
    }
    assert!(cp.tune_algo(None).taper_done);
}

#[test]
fn ucp_counts_only_after_alarm() {
    let mut cp = test_state();
    cp.sample = CpSample {
        vbat_uv: 4_000_000,
        ibat_ua: 200_000,
        vbus_uv: 8_200_000,
        ibus_ua: 100_000,
    };

    // low current alone never starts the count
    for _ in 0..20 {
        assert!(!cp.check_ucp());
    }

    cp.health.alarms.insert(CpAlarm::BatUcp);
    assert!(!cp.check_ucp());
    cp.health.alarms.remove(CpAlarm::BatUcp);

    let mut tripped = false;
    for _ in 0..CP_IBAT_UCP_THRESHOLD {
        tripped = cp.check_ucp();
    }
    assert!(tripped);
}

#[test]
fn initial_bus_voltage_guard_band() {
    assert_eq!(3_800_000 * 205 / 100 + 200_000, initial_target_vbus(3_800_000));
    assert_eq!(4_000_000 * 205 / 100 + 40_000, initial_target_vbus(4_000_000));
}
