use embassy_time::{Duration, Instant};

use crate::config::*;
use crate::drivers::{ChargerHal, FuelGauge, PowerAdapter};
use crate::event::ManagerEvent;
use crate::power::ChargerType;

use super::{read, BatteryManager, ManagerReport};

impl<H: ChargerHal> BatteryManager<H> {
    pub fn handle_event(&mut self, event: ManagerEvent, now: Instant) -> ManagerReport {
        info!("event {}", event);

        match event {
            ManagerEvent::ExternalPowerIn => self.external_power_in(now),
            ManagerEvent::ExternalPowerOut => self.external_power_out(now),
            ManagerEvent::BatteryIn | ManagerEvent::BatteryOut => {
                self.battery_changed(now);
                ManagerReport::default()
            }
            ManagerEvent::ChargerFault => {
                self.cp_fault_pending = true;
                ManagerReport::default()
            }
            ManagerEvent::FastChargeDetected => self.fast_charge_detected(now),
            ManagerEvent::ThermalLimitChanged(power_mw) => {
                self.set_thermal_power_limit(power_mw);
                ManagerReport::default()
            }
        }
    }

    fn read_charger_type(&mut self) -> ChargerType {
        let charger_type = read("charger type", self.devices.adapter.charger_type()).unwrap_or(ChargerType::Unknown);
        self.normalize_charger_type(charger_type)
    }

    /// Runs a monitor cycle right away when polling is on, then re-arms the
    /// cadence from here.
    fn restart_polling(&mut self, now: Instant) -> ManagerReport {
        let report = if self.polling_interval().is_some() {
            self.monitor(now)
        } else {
            ManagerReport::default()
        };

        self.rearm_monitor(now);
        report
    }

    fn external_power_in(&mut self, now: Instant) -> ManagerReport {
        self.external_power = true;
        self.charger_type = self.read_charger_type();
        info!("external power in, {}", self.charger_type);

        self.update_charge_info(now);
        self.restart_polling(now)
    }

    /// Tears everything down to the power-on state, then lets one monitor
    /// cycle publish DISCHARGING.
    fn external_power_out(&mut self, now: Instant) -> ManagerReport {
        self.external_power = false;
        info!("external power out");

        self.try_charger_enable(false, now);
        self.stop_charge_pump(now);
        self.sched.charge_pump.cancel();

        let mut report = self.monitor(now);

        self.fast_charge_enabled = false;
        self.fast_charge_disable_count = 0;
        self.cp.reset();
        self.cp_fault_pending = false;
        self.charger_type = ChargerType::Unknown;
        self.profile = ChargeProfile::Unknown;
        self.charge_info = *self.cfg.charge_info(ChargeProfile::Unknown);

        self.capacity.set_force_full(false);
        self.full_trigger = 0;
        self.first_full_trigger = 0;
        self.emergency_stop = None;
        self.latches.clear();
        self.sched.fullbatt_vchk.cancel();

        self.thermal_power_mw = 0;
        self.thermal_limit_ua = None;
        self.votes.clear();
        self.jeita.power_removed();
        self.disable_ir_compensation();

        report.merge(self.restart_polling(now));
        report
    }

    fn battery_changed(&mut self, now: Instant) {
        self.battery_present = match self.cfg.battery_presence {
            BatteryPresence::Assume => true,
            BatteryPresence::FuelGauge => read("battery presence", self.devices.gauge.battery_present()).unwrap_or(false),
        };

        if !self.battery_present {
            error!("battery removed");
            self.try_charger_enable(false, now);
            return;
        }

        warn!("battery inserted");
        self.uvlo.reset();
        if !self.latches.is_empty() || !self.external_power {
            self.try_charger_enable(false, now);
        } else {
            self.try_charger_enable(true, now);
        }
    }

    fn fast_charge_detected(&mut self, now: Instant) -> ManagerReport {
        let mut report = ManagerReport::default();
        self.charger_type = self.read_charger_type();

        if !self.external_power {
            return report;
        }

        info!("fast charge adapter detected, {}", self.charger_type);
        let fast = matches!(self.charger_type, ChargerType::Pd | ChargerType::Sfcp | ChargerType::Pps);
        if fast && !self.fast_charge_enabled {
            self.update_charge_info(now);
        }

        if self.charger_type == ChargerType::Sfcp && self.charger_enabled {
            report = self.monitor(now);
        }

        if self.charger_type == ChargerType::Pps && !self.cp.running && self.charger_enabled {
            self.cp.check_threshold = true;
            self.sched.monitor.arm(now, Duration::from_ticks(0));
        }

        report
    }
}
