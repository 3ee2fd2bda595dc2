use embassy_time::Instant;

use crate::config::*;
use crate::drivers::{Charger, ChargerHal, DriverError, FuelGauge, PowerAdapter};
use crate::power::vote::{VoteCmd, VoteKind, Voter};

use super::{read, BatteryManager};

impl<H: ChargerHal> BatteryManager<H> {
    /// Re-selects the charge profile and re-votes everything that depends on
    /// it: charger type limits, thermal budget and the JEITA zone.
    pub(super) fn update_charge_info(&mut self, now: Instant) {
        let profile = ChargeProfile::select(
            self.charger_type,
            self.fast_charge_enabled,
            self.cp.running && !self.cp.recovery,
        );
        let info = *self.cfg.charge_info(profile);

        if profile != self.profile {
            info!("charge profile {} -> {}", self.profile, profile);
        }
        self.profile = profile;
        self.charge_info = info;
        self.update_thermal_limit();

        self.vote(VoteKind::Ibat, Voter::ChargerType, VoteCmd::Min, info.charge_limit_ua);
        self.vote(VoteKind::Ibus, Voter::ChargerType, VoteCmd::Min, info.input_limit_ua);
        self.vote_thermal_limit();

        self.refresh_jeita(now);
    }

    /// Thermal budget converted to a current at the profile's nominal
    /// adapter voltage.
    pub(super) fn update_thermal_limit(&mut self) {
        let volts = self.charge_info.adapter_default_uv / 1_000_000;
        self.thermal_limit_ua = if self.thermal_power_mw > 0 && volts > 0 {
            Some(self.thermal_power_mw / volts * 1000)
        } else {
            None
        };
    }

    pub(super) fn vote_thermal_limit(&mut self) {
        let Some(limit) = self.thermal_limit_ua else {
            return;
        };

        let kind = if self.cfg.thermal_limit_on_ibat { VoteKind::Ibat } else { VoteKind::Ibus };
        debug!("thermal limit {} mW -> {} uA on {}", self.thermal_power_mw, limit, kind);
        self.vote(kind, Voter::ThermalLimit, VoteCmd::Min, limit);
    }

    /// Immediate re-classification after a profile change, bypassing the
    /// monitor's debounce.
    fn refresh_jeita(&mut self, now: Instant) {
        if !self.latches.is_empty() {
            return;
        }

        let Some(temp) = self.telemetry.temperature else {
            return;
        };

        let zone = match self.cfg.jeita.get(self.profile) {
            Some(table) => self.jeita.classify(table, temp),
            None => return,
        };
        let zone = self.jeita.forced().unwrap_or(zone);

        self.jeita_adjust(zone, now);
    }

    //////////////////////////////
    //  Fixed Voltage Fast Chg  //
    //////////////////////////////

    pub(super) fn try_fast_charge(&mut self, enable: bool, now: Instant) {
        if !self.charger_type.is_fixed_fast_charge() {
            return;
        }

        let result = if enable {
            self.fast_charge_enable_check(now)
                .and_then(|_| self.fast_charge_disable_check(now))
        } else {
            self.fast_charge_disable(now)
        };

        if let Err(err) = result {
            error!("fast charge {} failed: {}", enable, err);
        }
    }

    fn fast_charge_enable_check(&mut self, now: Instant) -> Result<(), DriverError> {
        if self.emergency_stop.is_some() || self.fast_charge_enabled {
            return Ok(());
        }

        if !self.reach_fast_charge_threshold() {
            return Ok(());
        }

        let max_uv = self.devices.adapter.max_voltage_uv()?;
        if max_uv <= ADAPTER_VOLTAGE_5V {
            info!("adapter tops out at {} uV, no fast charge", max_uv);
            return Ok(());
        }

        self.devices.adapter.request_voltage(max_uv.min(ADAPTER_VOLTAGE_9V))?;

        if let Some(secondary) = self.devices.secondary.as_mut() {
            if let Err(err) = secondary.set_enabled(true) {
                if let Err(err) = self.devices.adapter.request_voltage(ADAPTER_VOLTAGE_5V) {
                    warn!("failed to drop adapter back to 5V: {}", err);
                }
                return Err(err);
            }
        }

        info!("fixed voltage fast charge on");
        self.fast_charge_enabled = true;
        self.fast_charge_disable_count = 0;
        self.update_charge_info(now);
        self.reapply_ibat();
        Ok(())
    }

    fn fast_charge_disable_check(&mut self, now: Instant) -> Result<(), DriverError> {
        if !self.fast_charge_enabled {
            return Ok(());
        }

        let vbat = self.devices.gauge.vbat_now_uv()?;
        let ibat = self.devices.gauge.ibat_now_ua()?;

        if vbat < FAST_CHARGE_DISABLE_BATTERY_UV || ibat < FAST_CHARGE_DISABLE_CURRENT_UA {
            self.fast_charge_disable_count += 1;
        } else {
            self.fast_charge_disable_count = 0;
        }

        if self.fast_charge_disable_count < FAST_CHARGE_DISABLE_COUNT {
            return Ok(());
        }

        info!("fast charge no longer useful, vbat {} ibat {}", vbat, ibat);
        self.fast_charge_disable_count = 0;
        self.fast_charge_disable(now)
    }

    fn fast_charge_disable(&mut self, now: Instant) -> Result<(), DriverError> {
        if !self.fast_charge_enabled {
            return Ok(());
        }

        if let Some(secondary) = self.devices.secondary.as_mut() {
            secondary.set_enabled(false)?;
        }
        self.devices.adapter.request_voltage(ADAPTER_VOLTAGE_5V)?;

        info!("fixed voltage fast charge off");
        self.fast_charge_enabled = false;
        self.update_charge_info(now);
        self.reapply_ibat();
        Ok(())
    }

    /// The split between primary and secondary changes with the parallel
    /// state even when the resolved current doesn't.
    fn reapply_ibat(&mut self) {
        if let Some(ibat) = self.votes.resolved(VoteKind::Ibat) {
            self.apply_vote(VoteKind::Ibat, ibat);
        }
    }

    /// Shared eligibility test for fixed voltage fast charge and charge pump
    /// sessions.
    pub(super) fn reach_fast_charge_threshold(&mut self) -> bool {
        let Some(ocv) = read("ocv", self.devices.gauge.ocv_uv()) else {
            return false;
        };
        let Some(ibat) = read("ibat", self.devices.gauge.ibat_now_ua()) else {
            return false;
        };

        let target_ua = match self.cfg.jeita.get(self.profile) {
            Some(table) => table.zone_current(self.jeita.current_zone()),
            None => ibat,
        };

        let ocv_threshold = if self.cfg.cp.fchg_ocv_threshold_uv > 0 {
            self.cfg.cp.fchg_ocv_threshold_uv
        } else {
            FAST_CHARGE_START_VOLTAGE_HIGH_UV
        };

        let thermal_ua = self.thermal_limit_ua.unwrap_or(FAST_CHARGE_ENABLE_THERMAL_CURRENT_UA);
        let ocv_ok = ocv >= FAST_CHARGE_START_VOLTAGE_LOW_UV;

        let reached = (ocv_ok
            && target_ua >= FAST_CHARGE_ENABLE_CURRENT_UA
            && thermal_ua >= FAST_CHARGE_ENABLE_THERMAL_CURRENT_UA
            && ocv < ocv_threshold)
            || (ocv_ok && ibat >= FAST_CHARGE_ENABLE_CURRENT_UA);

        debug!(
            "fast charge threshold {}: ocv {} ibat {} target {} thermal {}",
            reached,
            ocv,
            ibat,
            target_ua,
            thermal_ua
        );

        reached
    }
}
