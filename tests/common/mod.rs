#![allow(dead_code)]

use ateam_charger_manager::config::ChargerConfig;
use ateam_charger_manager::drivers::{ChargePump, Charger, ChargerHal, Devices, DriverError, FuelGauge, PowerAdapter};
use ateam_charger_manager::power::jeita::JeitaTables;
use ateam_charger_manager::manager::BatteryManager;
use ateam_charger_manager::power::{charge_pump::CpHealth, ChargerHealth, ChargerType};
use embassy_time::{Duration, Instant};

pub struct SimGauge {
    pub vbat_uv: i32,
    pub ibat_ua: i32,
    pub ocv_uv: i32,
    pub temperature: i32,
    pub capacity: i32,
    pub present: bool,
    pub boot_capacity: Option<i32>,
    pub stored: Option<i32>,
    pub calibrated: Option<i32>,
    pub charge_full_uah: Option<i32>,
    pub fail: bool,
}

impl SimGauge {
    pub fn new() -> Self {
        Self {
            vbat_uv: 3_800_000,
            ibat_ua: 2_000_000,
            ocv_uv: 3_800_000,
            temperature: 250,
            capacity: 500,
            present: true,
            boot_capacity: None,
            stored: None,
            calibrated: None,
            charge_full_uah: None,
            fail: false,
        }
    }

    fn check(&self) -> Result<(), DriverError> {
        if self.fail {
            Err(DriverError::Bus)
        } else {
            Ok(())
        }
    }
}

impl FuelGauge for SimGauge {
    fn vbat_now_uv(&mut self) -> Result<i32, DriverError> {
        self.check()?;
        Ok(self.vbat_uv)
    }

    fn vbat_avg_uv(&mut self) -> Result<i32, DriverError> {
        self.vbat_now_uv()
    }

    fn ibat_now_ua(&mut self) -> Result<i32, DriverError> {
        self.check()?;
        Ok(self.ibat_ua)
    }

    fn ibat_avg_ua(&mut self) -> Result<i32, DriverError> {
        self.ibat_now_ua()
    }

    fn ocv_uv(&mut self) -> Result<i32, DriverError> {
        self.check()?;
        Ok(self.ocv_uv)
    }

    fn temperature(&mut self) -> Result<i32, DriverError> {
        self.check()?;
        Ok(self.temperature)
    }

    fn capacity(&mut self) -> Result<i32, DriverError> {
        self.check()?;
        Ok(self.capacity)
    }

    fn battery_present(&mut self) -> Result<bool, DriverError> {
        self.check()?;
        Ok(self.present)
    }

    fn calibrate_capacity(&mut self, cap: i32) -> Result<(), DriverError> {
        self.calibrated = Some(cap);
        Ok(())
    }

    fn store_capacity(&mut self, cap: i32) -> Result<(), DriverError> {
        self.stored = Some(cap);
        Ok(())
    }

    fn boot_capacity(&mut self) -> Result<Option<i32>, DriverError> {
        Ok(self.boot_capacity)
    }

    fn charge_full_uah(&mut self) -> Result<i32, DriverError> {
        self.charge_full_uah.ok_or(DriverError::Unsupported)
    }
}

pub struct SimCharger {
    pub enabled: bool,
    pub online: bool,
    pub health: ChargerHealth,
    pub charge_current_ua: Option<i32>,
    pub input_limit_ua: Option<i32>,
    pub constant_voltage_uv: Option<i32>,
    pub bus_voltage_uv: i32,
    pub bus_current_ua: i32,
    pub watchdog_feeds: u32,
    pub enable_calls: u32,
}

impl SimCharger {
    pub fn new(online: bool) -> Self {
        Self {
            enabled: false,
            online,
            health: ChargerHealth::Good,
            charge_current_ua: None,
            input_limit_ua: None,
            constant_voltage_uv: None,
            bus_voltage_uv: 5_000_000,
            bus_current_ua: 500_000,
            watchdog_feeds: 0,
            enable_calls: 0,
        }
    }
}

impl Charger for SimCharger {
    fn set_enabled(&mut self, enable: bool) -> Result<(), DriverError> {
        self.enable_calls += 1;
        self.enabled = enable;
        Ok(())
    }

    fn is_enabled(&mut self) -> Result<bool, DriverError> {
        Ok(self.enabled)
    }

    fn is_online(&mut self) -> Result<bool, DriverError> {
        Ok(self.online)
    }

    fn health(&mut self) -> Result<ChargerHealth, DriverError> {
        Ok(self.health)
    }

    fn set_charge_current(&mut self, ua: i32) -> Result<(), DriverError> {
        self.charge_current_ua = Some(ua);
        Ok(())
    }

    fn set_input_current_limit(&mut self, ua: i32) -> Result<(), DriverError> {
        self.input_limit_ua = Some(ua);
        Ok(())
    }

    fn set_constant_voltage(&mut self, uv: i32) -> Result<(), DriverError> {
        self.constant_voltage_uv = Some(uv);
        Ok(())
    }

    fn feed_watchdog(&mut self, _interval_ms: u32) -> Result<(), DriverError> {
        self.watchdog_feeds += 1;
        Ok(())
    }

    fn bus_voltage_uv(&mut self) -> Result<i32, DriverError> {
        Ok(self.bus_voltage_uv)
    }

    fn bus_current_ua(&mut self) -> Result<i32, DriverError> {
        Ok(self.bus_current_ua)
    }
}

pub struct SimPump {
    pub enabled: bool,
    pub inits: u32,
    pub disable_calls: u32,
    pub vbat_uv: i32,
    pub ibat_ua: i32,
    pub vbus_uv: i32,
    pub ibus_ua: i32,
    pub health: CpHealth,
    pub faults_cleared: u32,
}

impl SimPump {
    pub fn new() -> Self {
        Self {
            enabled: false,
            inits: 0,
            disable_calls: 0,
            vbat_uv: 3_800_000,
            ibat_ua: 3_000_000,
            vbus_uv: 0,
            ibus_ua: 1_500_000,
            health: CpHealth::default(),
            faults_cleared: 0,
        }
    }
}

impl ChargePump for SimPump {
    fn init(&mut self) -> Result<(), DriverError> {
        self.inits += 1;
        Ok(())
    }

    fn set_enabled(&mut self, enable: bool) -> Result<(), DriverError> {
        if !enable {
            self.disable_calls += 1;
        }
        self.enabled = enable;
        Ok(())
    }

    fn is_enabled(&mut self) -> Result<bool, DriverError> {
        Ok(self.enabled)
    }

    fn feed_watchdog(&mut self, _interval_ms: u32) -> Result<(), DriverError> {
        Ok(())
    }

    fn vbat_uv(&mut self) -> Result<i32, DriverError> {
        Ok(self.vbat_uv)
    }

    fn ibat_ua(&mut self) -> Result<i32, DriverError> {
        Ok(self.ibat_ua)
    }

    fn vbus_uv(&mut self) -> Result<i32, DriverError> {
        Ok(self.vbus_uv)
    }

    fn ibus_ua(&mut self) -> Result<i32, DriverError> {
        Ok(self.ibus_ua)
    }

    fn health(&mut self) -> Result<CpHealth, DriverError> {
        Ok(self.health)
    }

    fn clear_faults(&mut self) -> Result<(), DriverError> {
        self.faults_cleared += 1;
        self.health = CpHealth::default();
        Ok(())
    }
}

pub struct SimAdapter {
    pub charger_type: ChargerType,
    pub max_voltage_uv: i32,
    pub max_current_ua: i32,
    pub requested_uv: Option<i32>,
    pub requested_ua: Option<i32>,
    pub voltage_requests: u32,
    pub pps: bool,
    pub pps_disables: u32,
    pub fail_pps_disable: bool,
}

impl SimAdapter {
    pub fn new(charger_type: ChargerType) -> Self {
        Self {
            charger_type,
            max_voltage_uv: 11_000_000,
            max_current_ua: 5_000_000,
            requested_uv: None,
            requested_ua: None,
            voltage_requests: 0,
            pps: false,
            pps_disables: 0,
            fail_pps_disable: false,
        }
    }
}

impl PowerAdapter for SimAdapter {
    fn charger_type(&mut self) -> Result<ChargerType, DriverError> {
        Ok(self.charger_type)
    }

    fn max_voltage_uv(&mut self) -> Result<i32, DriverError> {
        Ok(self.max_voltage_uv)
    }

    fn max_current_ua(&mut self) -> Result<i32, DriverError> {
        Ok(self.max_current_ua)
    }

    fn request_voltage(&mut self, uv: i32) -> Result<(), DriverError> {
        self.voltage_requests += 1;
        self.requested_uv = Some(uv);
        Ok(())
    }

    fn request_current(&mut self, ua: i32) -> Result<(), DriverError> {
        self.requested_ua = Some(ua);
        Ok(())
    }

    fn set_pps_enabled(&mut self, enable: bool) -> Result<(), DriverError> {
        if !enable {
            self.pps_disables += 1;
            if self.fail_pps_disable {
                return Err(DriverError::Bus);
            }
        }
        self.pps = enable;
        Ok(())
    }
}

pub struct Sim;

impl ChargerHal for Sim {
    type Gauge = SimGauge;
    type Charger = SimCharger;
    type Pump = SimPump;
    type Adapter = SimAdapter;
}

pub type SimManager = BatteryManager<Sim>;

pub const T0: Instant = Instant::from_secs(1_000);

pub fn at(ms: u64) -> Instant {
    T0 + Duration::from_millis(ms)
}

/// Defaults with JEITA off, so only the hard temperature window applies.
pub fn plain_config() -> ChargerConfig {
    let mut cfg = ChargerConfig::default();
    cfg.jeita = JeitaTables::none();
    cfg
}

pub fn battery_only(cfg: ChargerConfig) -> SimManager {
    let devices = Devices::<Sim>::new(SimGauge::new(), SimCharger::new(false), SimAdapter::new(ChargerType::Unknown));
    BatteryManager::new(cfg, devices, T0).unwrap()
}

pub fn on_adapter(cfg: ChargerConfig, charger_type: ChargerType) -> SimManager {
    let devices = Devices::<Sim>::new(SimGauge::new(), SimCharger::new(true), SimAdapter::new(charger_type));
    BatteryManager::new(cfg, devices, T0).unwrap()
}

pub fn with_gauge(cfg: ChargerConfig, charger_type: ChargerType, gauge: SimGauge) -> SimManager {
    let devices = Devices::<Sim>::new(gauge, SimCharger::new(true), SimAdapter::new(charger_type));
    BatteryManager::new(cfg, devices, T0).unwrap()
}

/// Fixed voltage PD adapter with a secondary charger for parallel charging.
pub fn on_pd_parallel(cfg: ChargerConfig) -> SimManager {
    let devices = Devices::<Sim>::new(SimGauge::new(), SimCharger::new(true), SimAdapter::new(ChargerType::Pd))
        .with_secondary(SimCharger::new(true));
    BatteryManager::new(cfg, devices, T0).unwrap()
}

pub fn on_pps(cfg: ChargerConfig) -> SimManager {
    let devices = Devices::<Sim>::new(SimGauge::new(), SimCharger::new(true), SimAdapter::new(ChargerType::Pps))
        .with_pump(SimPump::new())
        .ok()
        .unwrap();
    BatteryManager::new(cfg, devices, T0).unwrap()
}

/// Adapter output shows up at the pump input right away.
pub fn settle_vbus(manager: &mut SimManager) {
    let devices = manager.devices_mut();
    if let Some(uv) = devices.adapter.requested_uv {
        for pump in devices.pumps.iter_mut() {
            pump.vbus_uv = uv;
        }
    }
}

/// Polls every deadline up to and including `until`, returns the merged
/// shutdown request if any.
pub fn run_until(manager: &mut SimManager, until: Instant) -> Option<ateam_charger_manager::power::ShutdownMode> {
    let mut shutdown = None;
    while let Some(next) = manager.next_deadline() {
        if next > until {
            break;
        }
        let report = manager.poll(next);
        shutdown = shutdown.or(report.shutdown);
    }
    shutdown
}
