use embassy_time::{Duration, Instant};

use crate::config::*;
use crate::drivers::{ChargePump, Charger, ChargerHal, FuelGauge, PowerAdapter};
use crate::power::{
    charge_pump::{initial_target_vbus, vbus_window, CpSample, CpState},
    ir_comp::IrMode,
    vote::{VoteCmd, VoteKind, Voter},
    ChargerType,
};

use super::{read, BatteryManager};

impl<H: ChargerHal> BatteryManager<H> {
    pub(super) fn need_start_charge_pump(&mut self) -> bool {
        if !self.devices.has_pump() || self.cp.running || !self.cp.check_threshold {
            return false;
        }

        self.charger_enabled && self.charger_type == ChargerType::Pps && self.reach_fast_charge_threshold()
    }

    pub(super) fn start_charge_pump(&mut self, now: Instant) {
        if self.cp.running {
            return;
        }

        info!("fast charge threshold reached, starting charge pump");
        self.cp.running = true;
        self.cp.check_fault = false;
        self.cp.set_state(CpState::Entry);
        self.sched.charge_pump.arm(now, Duration::from_ticks(0));
    }

    /// Ends a charge pump session right away, without waiting for the next
    /// work cycle. Safe to call when no session is running.
    pub fn stop_charge_pump(&mut self, now: Instant) {
        if !self.devices.has_pump() {
            return;
        }

        self.cp.check_threshold = false;
        self.cp.recovery = false;
        self.cp.set_state(CpState::Exit);

        if self.cp.running {
            self.sched.charge_pump.cancel();
            self.charge_pump_step(now);

            // exit couldn't turn the pumps off, retry on the normal cadence
            if self.cp.running {
                self.sched.charge_pump.arm(now, CP_WORK_TIME);
            }
        }
    }

    pub(super) fn charge_pump_work(&mut self, now: Instant) {
        self.update_cp_sample();
        self.update_cp_health();

        if !self.cp.running {
            return;
        }

        self.charge_pump_step(now);

        if self.cp.running {
            self.sched.charge_pump.arm(now, CP_WORK_TIME);
        }
    }

    fn charge_pump_step(&mut self, now: Instant) {
        match self.cp.state {
            CpState::Recovery => self.cp_recovery(),
            CpState::Entry => self.cp_entry(now),
            CpState::CheckVbus => self.cp_check_vbus(),
            CpState::Tune => self.cp_tune(),
            CpState::Exit => self.cp_exit(now),
            CpState::Unknown => self.cp.set_state(CpState::Exit),
        }
    }

    fn update_cp_sample(&mut self) {
        let mut sample = CpSample::default();

        if self.cp.running && self.devices.has_pump() {
            if let Some(pump) = self.devices.pumps.first_mut() {
                sample.vbat_uv = read("cp vbat", pump.vbat_uv()).unwrap_or(0);
                sample.vbus_uv = read("cp vbus", pump.vbus_uv()).unwrap_or(0);
            }
            sample.ibat_ua = read("cp ibat", self.devices.pumps_ibat_ua()).unwrap_or(0);
            sample.ibus_ua = read("cp ibus", self.devices.pumps_ibus_ua()).unwrap_or(0);
        } else {
            sample.vbat_uv = read("vbat", self.devices.gauge.vbat_now_uv()).unwrap_or(0);
            sample.ibat_ua = read("ibat", self.devices.gauge.ibat_now_ua()).unwrap_or(0);
            sample.vbus_uv = read("bus voltage", self.devices.primary.bus_voltage_uv()).unwrap_or(0);
            sample.ibus_ua = read("bus current", self.devices.primary.bus_current_ua()).unwrap_or(0);
        }

        self.cp.sample = sample;
    }

    /// Bus voltage errors are tracked every cycle. Alarms and faults are only
    /// pulled in after a fault notification once TUNE started watching.
    fn update_cp_health(&mut self) {
        self.cp.health.vbus_error_lo = false;
        self.cp.health.vbus_error_hi = false;

        if !self.cp.running || !self.devices.has_pump() {
            return;
        }

        let Some(health) = read("cp health", self.devices.pumps_health()) else {
            return;
        };

        self.cp.health.vbus_error_lo = health.vbus_error_lo;
        self.cp.health.vbus_error_hi = health.vbus_error_hi;

        if self.cp_fault_pending && self.cp.check_fault {
            info!("charge pump fault reported, alarms {} faults {}", health.alarms, health.faults);
            self.cp_fault_pending = false;
            self.cp.fault_event = true;
            self.cp.health.alarms = health.alarms;
            self.cp.health.faults = health.faults;
        }
    }

    fn pump_enabled(&mut self) -> bool {
        read("cp enabled", self.devices.pump_enabled()).unwrap_or(false)
    }

    fn request_adapter_voltage(&mut self, uv: i32) -> bool {
        match self.devices.adapter.request_voltage(uv) {
            Ok(()) => true,
            Err(err) => {
                error!("failed to request {} uV from adapter: {}", uv, err);
                false
            }
        }
    }

    ///////////////
    //  States   //
    ///////////////

    fn cp_recovery(&mut self) {
        info!("cp recovery");
        if self.external_power && self.reach_fast_charge_threshold() {
            self.cp.set_state(CpState::Entry);
        } else {
            self.cp.recovery = false;
            self.cp.set_state(CpState::Exit);
        }
    }

    fn cp_entry(&mut self, now: Instant) {
        info!("cp entry");
        self.cp.check_fault = false;

        // restart negotiation from a clean state
        if let Err(err) = self.devices.adapter.set_pps_enabled(false) {
            warn!("failed to reset pps: {}", err);
        }
        if let Err(err) = self.devices.adapter.set_pps_enabled(true) {
            error!("failed to enable pps: {}", err);
            self.cp.set_state(CpState::Exit);
            return;
        }

        self.request_adapter_voltage(ADAPTER_VOLTAGE_5V);
        if let Err(err) = self.devices.pumps_set_enabled(false) {
            warn!("failed to disable charge pump: {}", err);
        }
        if let Err(err) = self.devices.primary.set_enabled(false) {
            warn!("failed to disable primary charger: {}", err);
        }
        self.disable_ir_compensation();

        if self.primary_enabled() {
            self.cp.primary_disable_retry += 1;
            if self.cp.primary_disable_retry > CP_PRIMARY_DISABLE_RETRIES {
                error!("primary charger refuses to turn off, leaving cp");
                self.cp.primary_disable_retry = 0;
                self.cp.set_state(CpState::Exit);
            }
            return;
        }

        self.cp.adapter_max_ibus_ua = read("adapter max current", self.devices.adapter.max_current_ua()).unwrap_or(0);
        self.cp.adapter_max_vbus_uv = read("adapter max voltage", self.devices.adapter.max_voltage_uv()).unwrap_or(0);

        for pump in self.devices.pumps.iter_mut() {
            if let Err(err) = pump.init() {
                error!("failed to init charge pump: {}", err);
                break;
            }
        }

        self.cp.recovery = false;
        self.fast_charge_enabled = true;
        self.update_charge_info(now);

        if let Err(err) = self.devices.pumps_set_enabled(true) {
            warn!("failed to enable charge pump: {}", err);
        }

        self.cp.tune_vbus_retry = 0;
        self.cp.primary_disable_retry = 0;
        self.cp.ucp_count = 0;
        self.cp.taper_count = 0;
        self.cp.adjust_count = 0;

        self.cp.target_vbus_uv = initial_target_vbus(self.cp.sample.vbat_uv);
        self.cp.clamp_target_vbus();
        self.request_adapter_voltage(self.cp.target_vbus_uv);
        self.cp.last_target_vbus_uv = self.cp.target_vbus_uv;

        self.cp.update_target_ibus(self.thermal_limit_ua);
        if let Err(err) = self.devices.adapter.request_current(self.cp.target_ibus_ua) {
            warn!("failed to request {} uA from adapter: {}", self.cp.target_ibus_ua, err);
        }

        info!(
            "cp entry target vbus {} ibus {} adapter max {} uV {} uA",
            self.cp.target_vbus_uv,
            self.cp.target_ibus_ua,
            self.cp.adapter_max_vbus_uv,
            self.cp.adapter_max_ibus_ua
        );
        self.cp.set_state(CpState::CheckVbus);
    }

    fn cp_check_vbus(&mut self) {
        let (lo, hi) = vbus_window(self.cp.sample.vbat_uv);
        let vbus = self.cp.sample.vbus_uv;
        let health = self.cp.health;

        if health.vbus_error_lo && vbus < hi {
            self.cp.tune_vbus_retry += 1;
            self.cp.target_vbus_uv += CP_VSTEP_UV;
            self.cp.clamp_target_vbus();
            if !self.request_adapter_voltage(self.cp.target_vbus_uv) {
                self.cp.target_vbus_uv -= CP_VSTEP_UV;
            }
        } else if health.vbus_error_hi && vbus > lo {
            self.cp.tune_vbus_retry += 1;
            self.cp.target_vbus_uv -= CP_VSTEP_UV;
            if !self.request_adapter_voltage(self.cp.target_vbus_uv) {
                self.cp.target_vbus_uv += CP_VSTEP_UV;
            }
        } else {
            info!("bus voltage {} in window after {} retries", vbus, self.cp.tune_vbus_retry);
            self.cp.set_state(CpState::Tune);
            if !self.pump_enabled() {
                if let Err(err) = self.devices.pumps_set_enabled(true) {
                    warn!("failed to enable charge pump: {}", err);
                }
            }
            self.cp.check_fault = true;
            return;
        }

        debug!(
            "cp check vbus {} window [{}, {}] target {} retry {}",
            vbus,
            lo,
            hi,
            self.cp.target_vbus_uv,
            self.cp.tune_vbus_retry
        );

        if self.cp.tune_vbus_retry >= CP_CHECK_VBUS_RETRIES {
            error!("bus voltage never settled, leaving cp");
            self.cp.set_state(CpState::Exit);
        }
    }

    fn cp_tune(&mut self) {
        if !self.cp.tune_logged {
            info!("cp tune");
            self.cp.tune_logged = true;
        }

        if let Some(target) = self.ir.sample(self.cp.sample.ibat_ua, IrMode::ChargePump) {
            self.cp.target_vbat_uv = target.target_uv;
            if let Some(vote_uv) = target.vote_uv {
                self.vote(VoteKind::Cccv, Voter::IrCompensation, VoteCmd::Max, vote_uv);
            }
        }

        let pump_enabled = self.pump_enabled();
        let health = self.cp.health;

        if health.thermal_fault() {
            error!("charge pump thermal fault {}, leaving cp", health.faults);
            self.cp.set_state(CpState::Exit);
        } else if health.protection_fault() {
            error!("charge pump protection fault {}, leaving cp", health.faults);
            self.cp.set_state(CpState::Exit);
        } else if !pump_enabled {
            if health.vbus_error() {
                error!("charge pump off with bus error, recovering");
            } else {
                error!("charge pump turned itself off, recovering");
            }
            self.cp.recovery = true;
            self.cp.set_state(CpState::Exit);
        } else if self.cp.check_ucp() {
            error!("sustained battery under-current, leaving cp");
            self.cp.set_state(CpState::Exit);
        } else {
            let result = self.cp.tune_algo(self.thermal_limit_ua);
            if result.taper_done {
                info!("taper current reached, leaving cp");
                self.cp.set_state(CpState::Exit);
            } else if self.cp.last_target_vbus_uv != self.cp.target_vbus_uv {
                let target = self.cp.target_vbus_uv;
                self.request_adapter_voltage(target);
                self.cp.last_target_vbus_uv = target;
                self.cp.adjust_count = 0;
            } else {
                self.cp.adjust_count += 1;
                if self.cp.adjust_count > CP_ADJUST_VOLTAGE_THRESHOLD {
                    let target = self.cp.target_vbus_uv;
                    self.request_adapter_voltage(target);
                    self.cp.adjust_count = 0;
                }
            }
        }

        if self.cp.fault_event {
            self.cp.clear_fault_status();
        }
    }

    fn cp_exit(&mut self, now: Instant) {
        if !self.cp.running {
            debug!("cp already stopped");
            return;
        }

        info!("cp exit, recovery {}", self.cp.recovery);

        if let Err(err) = self.devices.pumps_set_enabled(false) {
            error!("failed to disable charge pump: {}", err);
            return;
        }

        if let Err(err) = self.devices.adapter.set_pps_enabled(false) {
            warn!("failed to disable pps: {}", err);
        }

        if !self.cp.recovery {
            self.cp.running = false;
        }

        self.fast_charge_enabled = false;
        self.update_charge_info(now);
        // the session's compensated floor doesn't carry over
        self.withdraw(VoteKind::Cccv, Voter::IrCompensation);

        if self.latches.is_empty() && self.emergency_stop.is_none() {
            if let Err(err) = self.devices.primary.set_enabled(true) {
                warn!("failed to re-enable primary charger: {}", err);
            }
            self.enable_ir_compensation(now);
        }

        if self.cp.recovery {
            self.cp.set_state(CpState::Recovery);
        }

        self.cp.end_session();
        self.cp.clear_fault_status();
        if let Err(err) = self.devices.pumps_clear_faults() {
            warn!("failed to clear charge pump faults: {}", err);
        }
        self.ir.reset();
    }
}
