use embassy_time::Instant;

use crate::config::*;
use crate::drivers::{ChargerHal, FuelGauge};
use crate::power::{
    capacity::{remap_capacity, CapacitySample},
    uvlo::UvloAction,
    ChargeStatus,
    ShutdownMode,
};

use super::{read, BatteryManager, ManagerReport};

impl<H: ChargerHal> BatteryManager<H> {
    pub(super) fn capacity_work(&mut self, now: Instant) -> ManagerReport {
        let mut report = ManagerReport::default();
        self.sched.capacity.arm(now, CAP_UPDATE_INTERVAL);

        let Some(sample) = self.capacity_sample() else {
            return report;
        };

        let update = self.capacity.update(&sample, now);

        if update.uvlo_watch {
            debug!("vbat {} near uvlo, watching", sample.vbat_uv);
            self.sched.uvlo.arm_if_idle(now, UVLO_FIRST_POLL);
        }

        if update.changed && !self.uvlo.tripped() {
            if let Err(err) = self.devices.gauge.store_capacity(update.cap) {
                warn!("failed to store capacity: {}", err);
            }
        }

        report.capacity_changed = update.percent_changed;
        report
    }

    fn capacity_sample(&mut self) -> Option<CapacitySample> {
        let gauge = &mut self.devices.gauge;
        let vbat_uv = read("vbat", gauge.vbat_now_uv())?;
        let ocv_uv = read("ocv", gauge.ocv_uv())?;
        let ibat_ua = read("ibat", gauge.ibat_now_ua())?;
        let raw = read("capacity", gauge.capacity())?;
        let temperature = read("temperature", gauge.temperature())?;
        let vbat_avg_uv = gauge.vbat_avg_uv().unwrap_or(vbat_uv);
        let ibat_avg_ua = gauge.ibat_avg_ua().unwrap_or(ibat_ua);

        self.telemetry.vbat_uv = vbat_uv;
        self.telemetry.ocv_uv = ocv_uv;
        self.telemetry.ibat_ua = ibat_ua;
        self.telemetry.raw_capacity = raw;
        self.telemetry.temperature = Some(temperature);

        let raw = remap_capacity(self.cfg.cap_remap_full_percent, &self.cfg.cap_remap, raw);

        debug!(
            "vbat {} avg {} ocv {} ibat {} avg {} cap {} raw {} temp {} thermal {} fast {}",
            vbat_uv,
            vbat_avg_uv,
            ocv_uv,
            ibat_ua,
            ibat_avg_ua,
            self.capacity.cap(),
            raw,
            temperature,
            self.thermal_limit_ua,
            self.fast_charge_enabled
        );

        Some(CapacitySample {
            raw,
            vbat_uv,
            ibat_ua,
            ocv_uv,
            temperature,
            status: self.capacity_status(),
            external_power: self.external_power,
        })
    }

    /// Status as the capacity estimator sees it, derived from the last
    /// monitor result rather than re-running the full detection.
    fn capacity_status(&self) -> ChargeStatus {
        if self.status == ChargeStatus::Full {
            ChargeStatus::Full
        } else if self.is_charging() {
            ChargeStatus::Charging
        } else if self.external_power {
            ChargeStatus::NotCharging
        } else {
            ChargeStatus::Discharging
        }
    }

    pub(super) fn uvlo_work(&mut self, now: Instant) -> ManagerReport {
        let mut report = ManagerReport::default();

        let Some(vbat) = read("vbat", self.devices.gauge.vbat_now_uv()) else {
            self.sched.uvlo.arm(now, UVLO_POLL_INTERVAL);
            return report;
        };

        match self.uvlo.sample(vbat) {
            UvloAction::Idle => {}
            UvloAction::Rearm(interval) => self.sched.uvlo.arm(now, interval),
            UvloAction::Shutdown(mode) => {
                if let Err(err) = self.devices.gauge.store_capacity(0) {
                    warn!("failed to store empty capacity: {}", err);
                }

                if mode == ShutdownMode::Ui {
                    self.sched.capacity.cancel();
                    self.capacity.snap(0, now);
                    report.capacity_changed = true;
                }

                report.shutdown = Some(mode);
            }
        }

        report
    }
}
