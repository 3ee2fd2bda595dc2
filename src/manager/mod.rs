use embassy_time::{Duration, Instant};
use num_traits::clamp;

use crate::config::*;
use crate::drivers::{ChargePump, Charger, ChargerHal, Devices, DriverError, FuelGauge, PowerAdapter};
use crate::power::{
    capacity::{capacity_level, remap_capacity, CapRemapError, CapacityEstimator},
    charge_pump::{ChargePumpState, CpState},
    ir_comp::IrCompensation,
    jeita::{JeitaPolicy, JeitaTableError},
    uvlo::UvloGuard,
    vote::{VoteCmd, VoteKind, VoteSink, Voter},
    CapacityLevel,
    ChargeStatus,
    ChargerType,
    FlagSet,
    ShutdownMode,
    StopReason,
};
use crate::time::{earliest, Deadline};

mod capacity;
mod charge_info;
mod charge_pump;
mod events;
mod monitor;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ManagerError {
    MissingFuelGauge,
    MissingPrimaryCharger,
    InvalidJeitaTable(JeitaTableError),
    InvalidCapRemap(CapRemapError),
    RegistryFull,
    UnknownId,
}

impl From<JeitaTableError> for ManagerError {
    fn from(err: JeitaTableError) -> Self {
        ManagerError::InvalidJeitaTable(err)
    }
}

impl From<CapRemapError> for ManagerError {
    fn from(err: CapRemapError) -> Self {
        ManagerError::InvalidCapRemap(err)
    }
}

/// What a call into the manager changed, for whoever publishes battery state.
#[derive(Clone, Copy, Default, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ManagerReport {
    pub status_changed: bool,
    /// the displayed percentage moved
    pub capacity_changed: bool,
    /// last monitor cycle ended in NOT_CHARGING
    pub not_charging: bool,
    pub shutdown: Option<ShutdownMode>,
}

impl ManagerReport {
    pub fn merge(&mut self, other: ManagerReport) {
        self.status_changed |= other.status_changed;
        self.capacity_changed |= other.capacity_changed;
        self.not_charging |= other.not_charging;
        self.shutdown = self.shutdown.or(other.shutdown);
    }

    pub fn is_empty(&self) -> bool {
        !self.status_changed && !self.capacity_changed && self.shutdown.is_none()
    }
}

/// Last good gauge readings, a failed read keeps the previous value.
#[derive(Clone, Copy, Default, Eq, PartialEq, Debug)]
struct Telemetry {
    vbat_uv: i32,
    ibat_ua: i32,
    ocv_uv: i32,
    raw_capacity: i32,
    temperature: Option<i32>,
}

#[derive(Clone, Copy, Default, Eq, PartialEq, Debug)]
struct Schedule {
    monitor: Deadline,
    charge_pump: Deadline,
    capacity: Deadline,
    uvlo: Deadline,
    ir_comp: Deadline,
    fullbatt_vchk: Deadline,
}

impl Schedule {
    fn next(&self) -> Option<Instant> {
        earliest(&[
            self.monitor.ready_at(),
            self.charge_pump.ready_at(),
            self.capacity.ready_at(),
            self.uvlo.ready_at(),
            self.ir_comp.ready_at(),
            self.fullbatt_vchk.ready_at(),
        ])
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
struct SuspendState {
    at: Instant,
    fullbatt_vchk_remaining: Option<Duration>,
}

/// Charging control for one battery: owns the devices and every piece of
/// policy state, and is driven by `poll`/`handle_event` from a single task.
pub struct BatteryManager<H: ChargerHal> {
    cfg: ChargerConfig,
    devices: Devices<H>,

    votes: VoteSink,
    jeita: JeitaPolicy,
    capacity: CapacityEstimator,
    uvlo: UvloGuard,
    ir: IrCompensation,
    cp: ChargePumpState,

    status: ChargeStatus,
    latches: FlagSet<StopReason>,
    emergency_stop: Option<StopReason>,
    charger_enabled: bool,
    charging_start: Option<Instant>,
    charging_end: Option<Instant>,
    full_trigger: u32,
    first_full_trigger: u32,

    external_power: bool,
    battery_present: bool,
    charger_type: ChargerType,
    profile: ChargeProfile,
    charge_info: ChargeInfo,
    fast_charge_enabled: bool,
    fast_charge_disable_count: u32,
    cp_fault_pending: bool,

    thermal_power_mw: i32,
    thermal_limit_ua: Option<i32>,
    input_suspend: bool,
    capacity_ceiling: Option<i32>,

    telemetry: Telemetry,
    sched: Schedule,
    suspended: Option<SuspendState>,
}

impl<H: ChargerHal> BatteryManager<H> {
    /// Probes the devices once. A gauge or primary charger that reports
    /// `NotPresent` can't be managed at all.
    pub fn new(cfg: ChargerConfig, mut devices: Devices<H>, now: Instant) -> Result<Self, ManagerError> {
        let gauge_present = match devices.gauge.battery_present() {
            Ok(present) => present,
            Err(DriverError::NotPresent) => return Err(ManagerError::MissingFuelGauge),
            Err(err) => {
                warn!("battery presence unknown: {}", err);
                false
            }
        };
        let battery_present = cfg.battery_presence == BatteryPresence::Assume || gauge_present;

        let external_power = match devices.primary.is_online() {
            Ok(online) => online,
            Err(DriverError::NotPresent) => return Err(ManagerError::MissingPrimaryCharger),
            Err(err) => {
                warn!("external power state unknown: {}", err);
                false
            }
        };

        let boot_cap = match devices.gauge.boot_capacity() {
            Ok(Some(cap)) => cap,
            Ok(None) => read("capacity", devices.gauge.capacity())
                .map(|raw| remap_capacity(cfg.cap_remap_full_percent, &cfg.cap_remap, raw))
                .unwrap_or(0),
            Err(err) => {
                warn!("no stored capacity: {}", err);
                read("capacity", devices.gauge.capacity())
                    .map(|raw| remap_capacity(cfg.cap_remap_full_percent, &cfg.cap_remap, raw))
                    .unwrap_or(0)
            }
        };

        let charger_type = if external_power {
            read("charger type", devices.adapter.charger_type()).unwrap_or(ChargerType::Unknown)
        } else {
            ChargerType::Unknown
        };

        let charge_info = *cfg.charge_info(ChargeProfile::Unknown);
        let mut manager = Self {
            votes: VoteSink::new(),
            jeita: JeitaPolicy::new(),
            capacity: CapacityEstimator::new(boot_cap, now, &cfg),
            uvlo: UvloGuard::new(cfg.uvlo_shutdown_uv, cfg.uvlo_shutdown_mode),
            ir: IrCompensation::new(cfg.ir),
            cp: ChargePumpState::new(&cfg.cp),

            status: ChargeStatus::Discharging,
            latches: FlagSet::empty(),
            emergency_stop: None,
            charger_enabled: false,
            charging_start: None,
            charging_end: None,
            full_trigger: 0,
            first_full_trigger: 0,

            external_power,
            battery_present,
            charger_type,
            profile: ChargeProfile::Unknown,
            charge_info,
            fast_charge_enabled: false,
            fast_charge_disable_count: 0,
            cp_fault_pending: false,

            thermal_power_mw: 0,
            thermal_limit_ua: None,
            input_suspend: false,
            capacity_ceiling: None,

            telemetry: Telemetry::default(),
            sched: Schedule::default(),
            suspended: None,

            cfg,
            devices,
        };

        let charger_type = manager.normalize_charger_type(charger_type);
        manager.charger_type = charger_type;
        if external_power {
            manager.update_charge_info(now);
        }

        manager.sched.monitor.arm(now, Duration::from_ticks(0));
        manager.sched.capacity.arm(now, Duration::from_ticks(0));

        info!(
            "battery manager up, boot cap {}, external power {} ({}), battery {}",
            boot_cap,
            external_power,
            charger_type,
            battery_present
        );

        Ok(manager)
    }

    /// Runs every piece of work whose deadline passed, monitor first.
    pub fn poll(&mut self, now: Instant) -> ManagerReport {
        let mut report = ManagerReport::default();

        if self.sched.fullbatt_vchk.fire(now) {
            self.fullbatt_vchk(now);
        }

        if self.sched.monitor.fire(now) {
            report.merge(self.monitor(now));
            self.rearm_monitor(now);
        }

        if self.sched.charge_pump.fire(now) {
            self.charge_pump_work(now);
        }

        if self.sched.capacity.fire(now) {
            report.merge(self.capacity_work(now));
        }

        if self.sched.uvlo.fire(now) {
            report.merge(self.uvlo_work(now));
        }

        if self.sched.ir_comp.fire(now) {
            self.ir_work(now);
        }

        report
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.sched.next()
    }

    /// Out of band monitor cycle, the periodic one keeps its phase.
    pub fn run_monitor(&mut self, now: Instant) -> ManagerReport {
        let report = self.monitor(now);
        if !self.sched.monitor.is_armed() {
            self.rearm_monitor(now);
        }
        report
    }

    pub fn polling_required(&self) -> bool {
        match self.cfg.polling_mode {
            PollingMode::Disabled => false,
            PollingMode::Always => true,
            PollingMode::ExternalPowerOnly => self.external_power,
            PollingMode::ChargingOnly => self.is_charging(),
        }
    }

    /// Monitor cadence right now, `None` while polling is off.
    pub fn polling_interval(&self) -> Option<Duration> {
        if self.cfg.polling_interval.as_ticks() == 0 {
            return None;
        }

        if self.polling_required() || self.emergency_stop.is_some() {
            Some(self.cfg.polling_interval)
        } else {
            None
        }
    }

    fn rearm_monitor(&mut self, now: Instant) {
        match self.polling_interval() {
            Some(interval) => self.sched.monitor.arm(now, interval),
            None => self.sched.monitor.cancel(),
        }
    }

    fn is_charging(&self) -> bool {
        self.battery_present && self.external_power && self.charger_enabled && self.emergency_stop.is_none()
    }

    ////////////////
    //  Suspend   //
    ////////////////

    /// Called right before the system sleeps. Returns how long the platform
    /// should sleep before waking the manager, `None` if nothing needs a
    /// wake at all.
    pub fn suspend(&mut self, now: Instant) -> Option<Duration> {
        if self.external_power {
            if let Err(err) = self.feed_watchdog() {
                warn!("failed to feed watchdog before suspend: {}", err);
            }
        }

        let mut wake: Option<Duration> = None;
        let mut fullbatt_vchk_remaining = None;
        if let Some(remaining) = self.sched.fullbatt_vchk.remaining(now) {
            if remaining.as_ticks() == 0 {
                self.sched.fullbatt_vchk.cancel();
                self.fullbatt_vchk(now);
            } else {
                wake = Some(remaining);
                fullbatt_vchk_remaining = Some(remaining);
            }
        }

        self.sched.monitor.cancel();
        self.sched.capacity.cancel();
        self.sched.uvlo.cancel();
        self.sched.fullbatt_vchk.cancel();
        self.suspended = Some(SuspendState { at: now, fullbatt_vchk_remaining });

        let interval = self.polling_interval()?;
        let interval = if self.ir.is_enabled() { IR_COMPENSATION_INTERVAL } else { interval };
        let wake = wake.map_or(interval, |w| w.min(interval));
        let wake = if wake < SUSPEND_SMALL_WAKE { SUSPEND_MIN_WAKE } else { wake };

        debug!("suspending, wake in {} ms", wake.as_millis());
        Some(wake)
    }

    /// Re-evaluates everything immediately, the capacity estimator catches
    /// up on the time spent asleep on its own.
    pub fn resume(&mut self, now: Instant) -> ManagerReport {
        let suspended = self.suspended.take();

        let mut report = self.monitor(now);
        self.rearm_monitor(now);
        report.merge(self.capacity_work(now));

        if let Some(SuspendState { at, fullbatt_vchk_remaining: Some(remaining) }) = suspended {
            let slept = now.checked_duration_since(at).unwrap_or(Duration::from_ticks(0));
            let delay = remaining.checked_sub(slept).unwrap_or(Duration::from_ticks(0));
            debug!("full battery check in {} ms after resume", delay.as_millis());
            self.sched.fullbatt_vchk.arm(now, delay);
        }

        report
    }

    ///////////////
    //  Getters  //
    ///////////////

    pub fn config(&self) -> &ChargerConfig {
        &self.cfg
    }

    pub fn devices(&self) -> &Devices<H> {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut Devices<H> {
        &mut self.devices
    }

    pub fn status(&self) -> ChargeStatus {
        self.status
    }

    /// Displayed percentage, 0..=100.
    pub fn capacity(&self) -> u8 {
        clamp(self.capacity.uisoc(), 0, 100) as u8
    }

    /// Tenths of a percent.
    pub fn capacity_tenths(&self) -> i32 {
        self.capacity.cap()
    }

    pub fn capacity_level(&self) -> CapacityLevel {
        let ocv = if self.telemetry.ocv_uv > 0 { Some(self.telemetry.ocv_uv) } else { None };
        capacity_level(
            self.capacity.cap(),
            self.status == ChargeStatus::Charging,
            ocv,
            self.battery_present,
        )
    }

    pub fn external_power(&self) -> bool {
        self.external_power
    }

    pub fn battery_present(&self) -> bool {
        self.battery_present
    }

    pub fn charger_type(&self) -> ChargerType {
        self.charger_type
    }

    pub fn charger_enabled(&self) -> bool {
        self.charger_enabled
    }

    pub fn fast_charge_enabled(&self) -> bool {
        self.fast_charge_enabled
    }

    pub fn profile(&self) -> ChargeProfile {
        self.profile
    }

    pub fn latches(&self) -> FlagSet<StopReason> {
        self.latches
    }

    pub fn emergency_stop(&self) -> Option<StopReason> {
        self.emergency_stop
    }

    pub fn jeita_zone(&self) -> usize {
        self.jeita.current_zone()
    }

    pub fn resolved_vote(&self, kind: VoteKind) -> Option<i32> {
        self.votes.resolved(kind)
    }

    pub fn thermal_limit_ua(&self) -> Option<i32> {
        self.thermal_limit_ua
    }

    pub fn charge_pump(&self) -> &ChargePumpState {
        &self.cp
    }

    pub fn cp_state(&self) -> CpState {
        self.cp.state
    }

    pub fn uvlo_tripped(&self) -> bool {
        self.uvlo.tripped()
    }

    ///////////////
    //  Setters  //
    ///////////////

    /// Thermal budget in mW from the platform's thermal manager, 0 lifts it.
    pub fn set_thermal_power_limit(&mut self, power_mw: i32) {
        self.thermal_power_mw = power_mw.max(0);
        self.update_thermal_limit();

        match self.thermal_limit_ua {
            Some(_) => self.vote_thermal_limit(),
            None => {
                self.withdraw(VoteKind::Ibat, Voter::ThermalLimit);
                self.withdraw(VoteKind::Ibus, Voter::ThermalLimit);
            }
        }

        if self.cp.running {
            self.cp.update_target_ibus(self.thermal_limit_ua);
        }
    }

    /// Keeps the adapter attached but stops drawing from it.
    pub fn set_input_suspend(&mut self, suspend: bool, now: Instant) {
        info!("input suspend {}", suspend);
        self.input_suspend = suspend;
        self.sched.monitor.arm(now, Duration::from_ticks(0));
    }

    /// Stop charging once the displayed capacity reaches `percent`.
    pub fn set_capacity_ceiling(&mut self, percent: Option<u8>, now: Instant) {
        self.capacity_ceiling = percent.map(i32::from);
        self.sched.monitor.arm(now, Duration::from_ticks(0));
    }

    pub fn set_user_charge_current(&mut self, ua: Option<i32>) {
        match ua {
            Some(ua) => self.vote(VoteKind::Ibat, Voter::UserChargeCurrent, VoteCmd::Min, ua),
            None => self.withdraw(VoteKind::Ibat, Voter::UserChargeCurrent),
        }
    }

    pub fn set_user_input_limit(&mut self, ua: Option<i32>) {
        match ua {
            Some(ua) => self.vote(VoteKind::Ibus, Voter::UserInputLimit, VoteCmd::Min, ua),
            None => self.withdraw(VoteKind::Ibus, Voter::UserInputLimit),
        }
    }

    /// Test hook for thermal qualification, pins the JEITA zone.
    pub fn force_jeita_zone(&mut self, zone: Option<usize>, now: Instant) {
        info!("jeita zone forced to {}", zone);
        self.jeita.force(zone);
        self.sched.monitor.arm(now, Duration::from_ticks(0));
    }

    /////////////
    //  Votes  //
    /////////////

    fn vote(&mut self, kind: VoteKind, voter: Voter, cmd: VoteCmd, value: i32) {
        if let Some(resolved) = self.votes.vote(kind, voter, cmd, value) {
            self.apply_vote(kind, resolved);
        }
    }

    fn withdraw(&mut self, kind: VoteKind, voter: Voter) {
        if let Some(resolved) = self.votes.withdraw(kind, voter) {
            self.apply_vote(kind, resolved);
        }
    }

    fn apply_vote(&mut self, kind: VoteKind, value: i32) {
        let parallel = self.fast_charge_enabled && self.devices.secondary.is_some();

        let result = match kind {
            VoteKind::Ibat if parallel => {
                let half = value / 2;
                self.devices.primary.set_charge_current(half).and_then(|_| match self.devices.secondary.as_mut() {
                    Some(secondary) => secondary.set_charge_current(half),
                    None => Ok(()),
                })
            }
            VoteKind::Ibat => self.devices.primary.set_charge_current(value),
            VoteKind::Ibus => self.devices.primary.set_input_current_limit(value),
            VoteKind::Cccv => self.devices.primary.set_constant_voltage(value),
        };

        match result {
            Ok(()) => debug!("applied {} = {}", kind, value),
            Err(err) => error!("failed to apply {} = {}: {}", kind, value, err),
        }
    }

    fn feed_watchdog(&mut self) -> Result<(), DriverError> {
        if self.cfg.watchdog_interval_s == 0 {
            return Ok(());
        }

        let interval_ms = self.cfg.watchdog_interval_s * 1000;
        self.devices.primary.feed_watchdog(interval_ms)?;
        if let Some(secondary) = self.devices.secondary.as_mut() {
            secondary.feed_watchdog(interval_ms)?;
        }

        if self.cp.running {
            for pump in self.devices.pumps.iter_mut() {
                pump.feed_watchdog(interval_ms)?;
            }
        }

        Ok(())
    }

    fn primary_enabled(&mut self) -> bool {
        read("primary enabled", self.devices.primary.is_enabled()).unwrap_or(false)
    }

    fn normalize_charger_type(&self, charger_type: ChargerType) -> ChargerType {
        if charger_type == ChargerType::Pps && !self.devices.has_pump() {
            ChargerType::Pd
        } else {
            charger_type
        }
    }
}

fn read<T>(what: &str, result: Result<T, DriverError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("failed to read {}: {}", what, err);
            None
        }
    }
}
