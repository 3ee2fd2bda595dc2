use embassy_time::{Duration, Instant};

use crate::config::*;
use crate::drivers::{Charger, ChargerHal, FuelGauge};
use crate::power::{
    jeita::JeitaDecision,
    ir_comp::IrMode,
    vote::{VoteCmd, VoteKind, Voter},
    ChargeStatus,
    ChargerHealth,
    StopReason,
};

use super::{read, BatteryManager, ManagerReport};

impl<H: ChargerHal> BatteryManager<H> {
    /// One pass of the charging state machine. Evaluates the stop conditions
    /// in priority order, then drives the chargers toward the result.
    pub(super) fn monitor(&mut self, now: Instant) -> ManagerReport {
        let mut report = ManagerReport::default();

        if let Err(err) = self.feed_watchdog() {
            warn!("failed to feed charger watchdog: {}", err);
            return report;
        }

        self.refresh_telemetry();
        let status = self.target_status(now);

        if status == ChargeStatus::Charging {
            self.emergency_stop = None;
            self.latches.clear();
            self.try_charger_enable(true, now);

            if !self.cp.running && !self.primary_enabled() && !self.capacity.force_full() {
                info!("primary charger off while charging, re-enabling");
                if let Err(err) = self.devices.primary.set_enabled(true) {
                    warn!("failed to re-enable primary charger: {}", err);
                }
            }

            if self.need_start_charge_pump() {
                self.start_charge_pump(now);
            }
        } else {
            self.try_charger_enable(false, now);
        }

        if status != self.status {
            info!("charge status {} -> {}", self.status, status);
            if status == ChargeStatus::Full {
                self.fullbatt_handler(now);
            }
            self.status = status;
            report.status_changed = true;
        }

        report.not_charging = status == ChargeStatus::NotCharging;

        debug!(
            "vbat {} ocv {} ibat {} temp {} status {} latches {} cap {}",
            self.telemetry.vbat_uv,
            self.telemetry.ocv_uv,
            self.telemetry.ibat_ua,
            self.telemetry.temperature,
            self.status,
            self.latches,
            self.capacity.cap()
        );

        report
    }

    fn refresh_telemetry(&mut self) {
        let gauge = &mut self.devices.gauge;
        if let Some(vbat) = read("vbat", gauge.vbat_now_uv()) {
            self.telemetry.vbat_uv = vbat;
        }
        if let Some(ibat) = read("ibat", gauge.ibat_now_ua()) {
            self.telemetry.ibat_ua = ibat;
        }
        if let Some(ocv) = read("ocv", gauge.ocv_uv()) {
            self.telemetry.ocv_uv = ocv;
        }
        if let Some(temp) = read("temperature", gauge.temperature()) {
            self.telemetry.temperature = Some(temp);
        }

        if self.cfg.battery_presence == BatteryPresence::FuelGauge {
            if let Some(present) = read("battery presence", gauge.battery_present()) {
                if present != self.battery_present {
                    warn!("battery presence changed to {}", present);
                }
                self.battery_present = present;
            }
        }
    }

    fn target_status(&mut self, now: Instant) -> ChargeStatus {
        self.jeita_monitor(now);

        if !self.external_power {
            return ChargeStatus::Discharging;
        }

        if !self.battery_present && !self.cfg.allow_charge_without_battery {
            return ChargeStatus::Discharging;
        }

        if self.check_thermal_window().is_some() {
            return ChargeStatus::NotCharging;
        }

        if self.latches.contains(StopReason::Cold) || self.latches.contains(StopReason::Overheat) {
            warn!("battery outside its jeita charging range");
            return ChargeStatus::NotCharging;
        }

        self.check_charger_health(now);
        if self.latches.contains(StopReason::HealthAbnormal) {
            return ChargeStatus::NotCharging;
        }

        self.check_charge_voltage(now);
        if self.latches.contains(StopReason::VoltageAbnormal) {
            return ChargeStatus::NotCharging;
        }

        self.check_charging_duration(now);
        if self.latches.contains(StopReason::DurationAbnormal) {
            return ChargeStatus::NotCharging;
        }

        if self.input_suspend {
            return ChargeStatus::NotCharging;
        }

        if let Some(ceiling) = self.capacity_ceiling {
            if self.capacity.uisoc() >= ceiling {
                debug!("capacity at ceiling {}", ceiling);
                return ChargeStatus::NotCharging;
            }
        }

        if self.is_full_charged() {
            ChargeStatus::Full
        } else {
            ChargeStatus::Charging
        }
    }

    /// True when `reason` is the only latch set, or none is.
    fn only_latched(&self, reason: StopReason) -> bool {
        let mut others = self.latches;
        others.remove(reason);
        others.is_empty()
    }

    ////////////
    //  JEITA //
    ////////////

    fn jeita_monitor(&mut self, now: Instant) {
        if !self.external_power {
            self.jeita.power_removed();
            return;
        }

        let Some(temp) = self.telemetry.temperature else {
            return;
        };

        let zone = match self.cfg.jeita.get(self.profile) {
            Some(table) => self.jeita.monitor(table, temp),
            None => return,
        };

        if let Some(zone) = zone {
            info!("jeita zone {} at {}", zone, temp);
            self.jeita_adjust(zone, now);
        }
    }

    /// Applies `zone` from the active table. A zone that stops charging
    /// latches Cold/Overheat, any other one sets current and voltage limits.
    pub(super) fn jeita_adjust(&mut self, zone: usize, now: Instant) {
        let mut others = self.latches;
        others.remove(StopReason::Cold);
        others.remove(StopReason::Overheat);
        if !others.is_empty() {
            return;
        }

        let decision = match self.cfg.jeita.get(self.profile) {
            Some(table) => table.adjust(zone),
            None => return,
        };

        match decision {
            JeitaDecision::Stop(reason) => {
                warn!("jeita zone {} stops charging ({})", zone, reason);
                self.try_charger_enable(false, now);
                self.latches.set(StopReason::Cold, reason == StopReason::Cold);
                self.latches.set(StopReason::Overheat, reason == StopReason::Overheat);
            }
            JeitaDecision::Limit { current_ua, term_volt_uv } => {
                self.ir.set_set_point(term_volt_uv);

                if self.cp.running && !self.primary_enabled() {
                    info!("cp jeita target ibat {}", current_ua);
                    self.cp.target_ibat_ua = current_ua;
                } else {
                    info!("jeita limits {} uA {} uV", current_ua, term_volt_uv);
                    self.vote(VoteKind::Ibat, Voter::Jeita, VoteCmd::Min, current_ua);
                    self.vote(VoteKind::Cccv, Voter::Jeita, VoteCmd::Min, term_volt_uv);
                }

                self.latches.remove(StopReason::Cold);
                self.latches.remove(StopReason::Overheat);
            }
        }
    }

    ////////////////////////
    //  Stop Conditions   //
    ////////////////////////

    /// Hard temperature window, narrowed by temp_diff once tripped so the
    /// battery has to come back well inside before charging resumes.
    fn check_thermal_window(&mut self) -> Option<StopReason> {
        let Some(temp) = self.telemetry.temperature else {
            error!("battery temperature unknown");
            return None;
        };

        let mut upper = self.cfg.temp_max;
        let mut lower = self.cfg.temp_min;
        if self.emergency_stop.is_some() {
            upper -= self.cfg.temp_diff;
            lower += self.cfg.temp_diff;
        }

        let stop = if temp > upper {
            Some(StopReason::Overheat)
        } else if temp < lower {
            Some(StopReason::Cold)
        } else {
            None
        };

        if stop != self.emergency_stop {
            match stop {
                Some(reason) => warn!("temperature {} outside [{}, {}], {}", temp, lower, upper, reason),
                None => info!("temperature {} back in range", temp),
            }
        }

        self.emergency_stop = stop;
        stop
    }

    fn check_charger_health(&mut self, now: Instant) {
        if !self.only_latched(StopReason::HealthAbnormal) {
            return;
        }

        let Some(health) = read("charger health", self.devices.primary.health()) else {
            return;
        };

        if health == ChargerHealth::Unspecified {
            return;
        }

        if self.charger_enabled && health != ChargerHealth::Good {
            warn!("charger health {}, stop charging", health);
            self.latches.insert(StopReason::HealthAbnormal);
            self.try_charger_enable(false, now);
        } else if !self.charger_enabled && health == ChargerHealth::Good && self.latches.contains(StopReason::HealthAbnormal) {
            info!("charger health back to good");
            self.latches.remove(StopReason::HealthAbnormal);
        }
    }

    fn check_charge_voltage(&mut self, now: Instant) {
        let max_uv = self.charge_info.charge_voltage_max_uv;
        let drop_uv = self.charge_info.charge_voltage_drop_uv;
        if max_uv == 0 || drop_uv == 0 {
            return;
        }

        if !self.only_latched(StopReason::VoltageAbnormal) {
            return;
        }

        let Some(vbus) = read("bus voltage", self.devices.primary.bus_voltage_uv()) else {
            return;
        };

        if self.charger_enabled && vbus > max_uv {
            warn!("bus voltage {} over {}, stop charging", vbus, max_uv);
            self.latches.insert(StopReason::VoltageAbnormal);
            self.try_charger_enable(false, now);
        } else if !self.charger_enabled && vbus <= max_uv - drop_uv && self.latches.contains(StopReason::VoltageAbnormal) {
            info!("bus voltage {} recovered", vbus);
            self.latches.remove(StopReason::VoltageAbnormal);
        }
    }

    fn check_charging_duration(&mut self, now: Instant) {
        let charging_max = self.cfg.charging_max_duration;
        let discharging_max = self.cfg.discharging_max_duration;
        if charging_max.as_ticks() == 0 && discharging_max.as_ticks() == 0 {
            return;
        }

        if !self.only_latched(StopReason::DurationAbnormal) {
            return;
        }

        if self.charger_enabled {
            let Some(start) = self.charging_start else {
                return;
            };
            if charging_max.as_ticks() == 0 {
                return;
            }

            let Some(ocv) = read("ocv", self.devices.gauge.ocv_uv()) else {
                return;
            };

            let charged_for = now.checked_duration_since(start).unwrap_or(Duration::from_ticks(0));
            if charged_for > charging_max && self.cfg.fullbatt_uv - ocv < self.cfg.fullbatt_vchkdrop_uv {
                warn!("charged for {} s, stop charging", charged_for.as_secs());
                self.latches.insert(StopReason::DurationAbnormal);
                self.try_charger_enable(false, now);
            }
        } else if self.latches.contains(StopReason::DurationAbnormal) {
            let Some(end) = self.charging_end else {
                return;
            };

            let rested_for = now.checked_duration_since(end).unwrap_or(Duration::from_ticks(0));
            if rested_for > discharging_max {
                info!("rested for {} s, charging allowed again", rested_for.as_secs());
                self.latches.remove(StopReason::DurationAbnormal);
            }
        }
    }

    ///////////////////
    //  Full Battery //
    ///////////////////

    fn is_full_charged(&mut self) -> bool {
        if !self.battery_present {
            return false;
        }

        if self.cfg.fullbatt_full_capacity_uah > 0 {
            if let Ok(full_uah) = self.devices.gauge.charge_full_uah() {
                if full_uah > self.cfg.fullbatt_full_capacity_uah {
                    return true;
                }
            }
        }

        let full_uv = self.cfg.fullbatt_uv;
        let full_ua = self.cfg.fullbatt_ua;

        if full_uv > 0 && full_ua > 0 {
            let Some(vbat) = read("vbat", self.devices.gauge.vbat_now_uv()) else {
                return false;
            };
            let Some(ibat) = read("ibat", self.devices.gauge.ibat_now_ua()) else {
                return false;
            };

            // once full, stay full until the open circuit voltage sags
            if self.status == ChargeStatus::Full && self.cfg.fullbatt_vchkdrop_uv != 0 {
                return match read("ocv", self.devices.gauge.ocv_uv()) {
                    Some(ocv) => ocv > full_uv - self.cfg.fullbatt_vchkdrop_uv,
                    None => false,
                };
            }

            let first_full_ua = self.cfg.first_fullbatt_ua;
            if first_full_ua > 0 && vbat >= full_uv && ibat > full_ua && ibat <= first_full_ua {
                self.first_full_trigger = self.first_full_trigger.saturating_add(1);
                if self.first_full_trigger > 1 {
                    self.capacity.set_force_full(true);
                }
            } else {
                self.first_full_trigger = 0;
            }

            if vbat >= full_uv && ibat >= 0 && ibat <= full_ua {
                self.full_trigger = self.full_trigger.saturating_add(1);
                if self.full_trigger <= 1 {
                    return false;
                }

                let full = if self.capacity.cap() >= CAP_FULL {
                    if self.full_trigger == 2 {
                        self.calibrate_full();
                    }
                    true
                } else {
                    self.calibrate_full();
                    if self.full_trigger == 2 {
                        info!("termination reached below 100%, stop the primary charger");
                        if let Err(err) = self.devices.primary.set_enabled(false) {
                            warn!("failed to stop primary charger: {}", err);
                        }
                    }
                    false
                };

                self.capacity.set_force_full(true);
                return full;
            }

            self.full_trigger = 0;
            return false;
        }

        if self.cfg.fullbatt_soc > 0 {
            if let Some(raw) = read("capacity", self.devices.gauge.capacity()) {
                return raw >= self.cfg.fullbatt_soc;
            }
        }

        false
    }

    fn calibrate_full(&mut self) {
        if self.telemetry.raw_capacity >= CAP_FULL {
            return;
        }

        if let Err(err) = self.devices.gauge.calibrate_capacity(CAP_FULL) {
            warn!("failed to calibrate gauge to full: {}", err);
        }
    }

    fn fullbatt_handler(&mut self, now: Instant) {
        if self.cfg.fullbatt_vchkdrop_uv == 0 || self.cfg.fullbatt_vchkdrop.as_ticks() == 0 {
            return;
        }

        info!("battery full, recharge check in {} s", self.cfg.fullbatt_vchkdrop.as_secs());
        self.sched.fullbatt_vchk.arm(now, self.cfg.fullbatt_vchkdrop);
    }

    /// Delayed check after FULL: restart charging if the battery sagged by
    /// at least the recharge drop.
    pub(super) fn fullbatt_vchk(&mut self, now: Instant) {
        if self.cfg.fullbatt_vchkdrop_uv == 0 || self.cfg.fullbatt_vchkdrop.as_ticks() == 0 {
            return;
        }

        let Some(ocv) = read("ocv", self.devices.gauge.ocv_uv()) else {
            return;
        };

        let drop_uv = self.cfg.fullbatt_uv - ocv;
        if drop_uv < 0 {
            return;
        }

        info!("vbat dropped {} uV since full", drop_uv);
        if drop_uv >= self.cfg.fullbatt_vchkdrop_uv {
            self.try_charger_restart(now);
        }
    }

    fn try_charger_restart(&mut self, now: Instant) {
        if self.emergency_stop.is_some() {
            return;
        }

        info!("recharging");
        self.capacity.set_force_full(false);
        self.full_trigger = 0;
        self.try_charger_enable(false, now);
        self.try_charger_enable(true, now);
    }

    //////////////////////
    //  Charger Enable  //
    //////////////////////

    /// Moves the chargers to `enable`, no-op if already there. Fixed voltage
    /// fast charge is re-evaluated on every call.
    pub(super) fn try_charger_enable(&mut self, enable: bool, now: Instant) {
        self.try_fast_charge(enable, now);

        if enable == self.charger_enabled {
            return;
        }

        let result = if enable {
            if self.emergency_stop.is_some() {
                return;
            }
            if !self.battery_present && !self.cfg.allow_charge_without_battery {
                return;
            }

            self.charging_start = Some(now);
            self.charging_end = None;
            let result = self.devices.primary.set_enabled(true);
            self.enable_ir_compensation(now);
            self.cp.check_threshold = true;
            result
        } else {
            self.charging_start = None;
            self.charging_end = Some(now);
            self.stop_charge_pump(now);
            self.disable_ir_compensation();
            self.devices.primary.set_enabled(false)
        };

        match result {
            Ok(()) => {
                info!("charger enabled {}", enable);
                self.charger_enabled = enable;
            }
            Err(err) => error!("failed to set charger enabled {}: {}", enable, err),
        }
    }

    ///////////////////////
    //  IR Compensation  //
    ///////////////////////

    pub(super) fn enable_ir_compensation(&mut self, now: Instant) {
        if self.ir.enable() {
            self.sched.ir_comp.arm(now, IR_COMPENSATION_INTERVAL);
        }
    }

    /// Also drops the compensated CCCV floor, otherwise it would outrank
    /// every JEITA ceiling until compensation votes again.
    pub(super) fn disable_ir_compensation(&mut self) {
        self.ir.disable();
        self.sched.ir_comp.cancel();
        self.withdraw(VoteKind::Cccv, Voter::IrCompensation);
    }

    pub(super) fn ir_work(&mut self, now: Instant) {
        if !self.ir.is_enabled() {
            return;
        }

        if let Some(ibat) = read("ibat", self.devices.gauge.ibat_now_ua()) {
            if let Some(target) = self.ir.sample(ibat, IrMode::Normal) {
                if let Some(vote_uv) = target.vote_uv {
                    self.vote(VoteKind::Cccv, Voter::IrCompensation, VoteCmd::Max, vote_uv);
                }
            }
        }

        self.sched.ir_comp.arm(now, IR_COMPENSATION_INTERVAL);
    }
}
