// Variable Naming Scheme
// _UV values are micro-volts, _UA values are micro-amps
// capacities are tenths of a percent (1000 == 100.0%)
// temperatures are tenths of a degree C

use embassy_time::Duration;

use crate::power::{
    capacity::CapRemapTable,
    jeita::{JeitaTable, JeitaTables},
    ChargerType,
    ShutdownMode,
};

//////////////////////////
//  Capacity Estimator  //
//////////////////////////

pub const CAP_FULL: i32 = 1000;
pub const CAP_ONE_PERCENT: i32 = 10;
pub const CAP_UPDATE_INTERVAL: Duration = Duration::from_secs(15);
// max change per cap_one_time window while awake
pub const CAP_MAX_STEP: i32 = 5;
// discharge near full steps down in explicit 0.8% chunks
pub const CAP_HIGH_THRESHOLD: i32 = 995;
pub const CAP_HIGH_DECREASE_STEP: i32 = 8;
// while charging, 98.5%..=99.4% can't jump straight to 100%
pub const CAP_PRE_FULL_LOW: i32 = 985;
pub const CAP_PRE_FULL_HIGH: i32 = 994;
pub const CAP_TRICKLE_START: i32 = 986;
pub const CAP_RECHARGE_MARGIN_UV: i32 = 50_000;

pub const LOW_TEMP_REGION: i32 = 100;
pub const LOW_TEMP_SHUTDOWN_UV: i32 = 3_200_000;

pub const CAPACITY_LEVEL_LOW: i32 = 15;
pub const CAPACITY_LEVEL_NORMAL: i32 = 85;
pub const CAPACITY_LEVEL_FULL: i32 = 100;
pub const CAPACITY_LEVEL_CRITICAL_UV: i32 = 3_300_000;

////////////
//  UVLO  //
////////////

// below this the fast poll runs, independent of the main cadence
pub const UVLO_CALIBRATION_UV: i32 = 3_250_000;
pub const UVLO_TRIGGER_COUNT: u32 = 5;
pub const UVLO_FIRST_POLL: Duration = Duration::from_millis(100);
pub const UVLO_POLL_INTERVAL: Duration = Duration::from_millis(800);

///////////////////
//  Fast Charge  //
///////////////////

pub const FAST_CHARGE_ENABLE_CURRENT_UA: i32 = 1_200_000;
pub const FAST_CHARGE_ENABLE_THERMAL_CURRENT_UA: i32 = 1_000_000;
pub const FAST_CHARGE_START_VOLTAGE_LOW_UV: i32 = 3_520_000;
pub const FAST_CHARGE_START_VOLTAGE_HIGH_UV: i32 = 4_200_000;
pub const FAST_CHARGE_DISABLE_BATTERY_UV: i32 = 3_400_000;
pub const FAST_CHARGE_DISABLE_CURRENT_UA: i32 = 1_000_000;
pub const FAST_CHARGE_DISABLE_COUNT: u32 = 2;
pub const ADAPTER_VOLTAGE_5V: i32 = 5_000_000;
pub const ADAPTER_VOLTAGE_9V: i32 = 9_000_000;

///////////////////
//  Charge Pump  //
///////////////////

pub const CP_VSTEP_UV: i32 = 20_000;
pub const CP_WORK_TIME: Duration = Duration::from_millis(500);
// re-assert an unchanged adapter request every ~5s of tuning
pub const CP_ADJUST_VOLTAGE_THRESHOLD: u32 = 10;
pub const CP_PRIMARY_DISABLE_RETRIES: u32 = 20;
pub const CP_CHECK_VBUS_RETRIES: u32 = 50;
pub const CP_IBAT_UCP_THRESHOLD: u32 = 8;
pub const CP_TAPER_COUNT: u32 = 5;
pub const CP_TAPER_MARGIN_UV: i32 = 50_000;
// below this vbat the initial bus voltage guard band is wider
pub const CP_ACC_VBAT_HIGH_UV: i32 = 3_850_000;
// bus voltage window, percent of vbat
pub const CP_VBUS_LOW_RATIO: i32 = 205;
pub const CP_VBUS_HIGH_RATIO: i32 = 219;

pub const CP_VBAT_STEP1_UV: i32 = 300_000;
pub const CP_VBAT_STEP2_UV: i32 = 150_000;
pub const CP_VBAT_STEP3_UV: i32 = 50_000;
pub const CP_IBAT_STEP1_UA: i32 = 2_000_000;
pub const CP_IBAT_STEP2_UA: i32 = 1_000_000;
pub const CP_IBAT_STEP3_UA: i32 = 100_000;
pub const CP_VBUS_STEP1_UV: i32 = 2_000_000;
pub const CP_VBUS_STEP2_UV: i32 = 1_000_000;
pub const CP_VBUS_STEP3_UV: i32 = 50_000;
pub const CP_IBUS_STEP1_UA: i32 = 1_000_000;
pub const CP_IBUS_STEP2_UA: i32 = 500_000;
pub const CP_IBUS_STEP3_UA: i32 = 100_000;

pub const MAX_CHARGE_PUMPS: usize = 2;

///////////////////////
//  IR Compensation  //
///////////////////////

pub const IR_COMPENSATION_INTERVAL: Duration = Duration::from_secs(3);
pub const IR_IBAT_SAMPLE_COUNT: usize = 7;

///////////////
//  Monitor  //
///////////////

pub const DEFAULT_CHARGE_TEMP_MAX: i32 = 500;
pub const DEFAULT_RECHARGE_TEMP_DIFF: i32 = 50;
// wake timers shorter than this get pushed out to SUSPEND_MIN_WAKE
pub const SUSPEND_SMALL_WAKE: Duration = Duration::from_secs(2);
pub const SUSPEND_MIN_WAKE: Duration = Duration::from_secs(4);
// charger watchdogs get the polling interval plus this much slack
pub const WATCHDOG_SLACK_S: u32 = 5;
pub const MAX_JEITA_ENTRIES: usize = 8;
pub const MAX_CAP_REMAP_ENTRIES: usize = 8;
// keeps the stretched band bounds well inside i32
pub const MAX_CAP_REMAP_CNT: i32 = 100;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PollingMode {
    Disabled,
    Always,
    ExternalPowerOnly,
    ChargingOnly,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BatteryPresence {
    Assume,
    FuelGauge,
}

/// Charging profile, picks both the charge limits and the JEITA table.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargeProfile {
    Unknown,
    Sdp,
    Cdp,
    Dcp,
    /// fixed voltage fast charge with the secondary charger
    Fchg,
    /// charge pump session
    Flash,
    WirelessBpp,
    WirelessEpp,
}

impl ChargeProfile {
    pub const COUNT: usize = 8;

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn select(charger_type: ChargerType, fast_charge_enabled: bool, cp_active: bool) -> Self {
        match charger_type {
            ChargerType::Sdp => ChargeProfile::Sdp,
            ChargerType::Cdp => ChargeProfile::Cdp,
            ChargerType::Dcp => ChargeProfile::Dcp,
            ChargerType::Pd | ChargerType::Sfcp if fast_charge_enabled => ChargeProfile::Fchg,
            ChargerType::Pps if cp_active => ChargeProfile::Flash,
            ChargerType::Pd | ChargerType::Sfcp | ChargerType::Pps => ChargeProfile::Dcp,
            ChargerType::WirelessBpp => ChargeProfile::WirelessBpp,
            ChargerType::WirelessEpp => ChargeProfile::WirelessEpp,
            ChargerType::Unknown => ChargeProfile::Unknown,
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargeInfo {
    pub charge_limit_ua: i32,
    pub input_limit_ua: i32,
    pub charge_voltage_max_uv: i32,
    pub charge_voltage_drop_uv: i32,
    /// nominal adapter output, used to turn the thermal power budget into a current
    pub adapter_default_uv: i32,
}

impl ChargeInfo {
    pub const fn new(charge_limit_ua: i32, input_limit_ua: i32, charge_voltage_max_uv: i32, charge_voltage_drop_uv: i32, adapter_default_uv: i32) -> Self {
        Self {
            charge_limit_ua,
            input_limit_ua,
            charge_voltage_max_uv,
            charge_voltage_drop_uv,
            adapter_default_uv,
        }
    }
}

// indexed by ChargeProfile
pub const DEFAULT_CHARGE_INFO: [ChargeInfo; ChargeProfile::COUNT] = [
    ChargeInfo::new(500_000, 500_000, 6_500_000, 700_000, 5_000_000),
    ChargeInfo::new(500_000, 500_000, 6_500_000, 700_000, 5_000_000),
    ChargeInfo::new(1_500_000, 1_500_000, 6_500_000, 700_000, 5_000_000),
    ChargeInfo::new(2_000_000, 2_000_000, 6_500_000, 700_000, 5_000_000),
    ChargeInfo::new(3_250_000, 2_000_000, 10_500_000, 1_000_000, 9_000_000),
    ChargeInfo::new(6_000_000, 3_000_000, 11_500_000, 1_000_000, 11_000_000),
    ChargeInfo::new(1_000_000, 1_000_000, 6_500_000, 700_000, 5_000_000),
    ChargeInfo::new(2_000_000, 1_100_000, 11_500_000, 1_000_000, 11_000_000),
];

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IrCompConfig {
    /// pack resistance in milli-ohm, 0 disables compensation
    pub rc_mohm: i32,
    /// constant voltage set point before compensation
    pub us_uv: i32,
    pub us_lower_limit_uv: i32,
    pub us_upper_limit_uv: i32,
    /// extra headroom granted to the charge pump target
    pub cp_upper_limit_offset_uv: i32,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargePumpConfig {
    pub max_ibus_ua: i32,
    pub max_ibat_ua: i32,
    pub target_vbat_uv: i32,
    pub taper_current_ua: i32,
    /// 0 falls back to FAST_CHARGE_START_VOLTAGE_HIGH_UV
    pub fchg_ocv_threshold_uv: i32,
}

/// Per battery descriptor, everything a board can tune.
#[derive(Clone, Debug)]
pub struct ChargerConfig {
    pub polling_mode: PollingMode,
    pub polling_interval: Duration,
    /// seconds handed to every feed_watchdog call, 0 disables feeding
    pub watchdog_interval_s: u32,
    pub battery_presence: BatteryPresence,
    /// calibration / autotest boots may charge with no battery attached
    pub allow_charge_without_battery: bool,

    pub fullbatt_uv: i32,
    pub fullbatt_ua: i32,
    pub first_fullbatt_ua: i32,
    /// raw capacity counted as full, 0 disables
    pub fullbatt_soc: i32,
    /// learned full capacity above this counts as full, 0 disables
    pub fullbatt_full_capacity_uah: i32,
    pub fullbatt_vchkdrop_uv: i32,
    pub fullbatt_vchkdrop: Duration,

    pub temp_min: i32,
    pub temp_max: i32,
    pub temp_diff: i32,

    /// zero disables the duration checks
    pub charging_max_duration: Duration,
    pub discharging_max_duration: Duration,

    pub cap_one_time: Duration,
    pub trickle_time_out: Duration,
    pub cap_remap_full_percent: i32,
    pub cap_remap: CapRemapTable,

    pub uvlo_shutdown_uv: i32,
    pub uvlo_shutdown_mode: ShutdownMode,

    /// linear chargers can't limit ibus, so the thermal limit lands on ibat
    pub thermal_limit_on_ibat: bool,

    pub ir: IrCompConfig,
    pub cp: ChargePumpConfig,
    pub charge_info: [ChargeInfo; ChargeProfile::COUNT],
    pub jeita: JeitaTables,
}

impl ChargerConfig {
    pub fn charge_info(&self, profile: ChargeProfile) -> &ChargeInfo {
        &self.charge_info[profile.index()]
    }

    /// Installs the same table for every profile.
    pub fn with_jeita_table(mut self, table: JeitaTable) -> Self {
        self.jeita = JeitaTables::uniform(table);
        self
    }
}

impl Default for ChargerConfig {
    fn default() -> Self {
        Self {
            polling_mode: PollingMode::ExternalPowerOnly,
            polling_interval: Duration::from_secs(15),
            watchdog_interval_s: 15 + WATCHDOG_SLACK_S,
            battery_presence: BatteryPresence::FuelGauge,
            allow_charge_without_battery: false,

            fullbatt_uv: 4_350_000,
            fullbatt_ua: 200_000,
            first_fullbatt_ua: 0,
            fullbatt_soc: 0,
            fullbatt_full_capacity_uah: 0,
            fullbatt_vchkdrop_uv: 100_000,
            fullbatt_vchkdrop: Duration::from_secs(60),

            temp_min: -200,
            temp_max: DEFAULT_CHARGE_TEMP_MAX,
            temp_diff: DEFAULT_RECHARGE_TEMP_DIFF,

            charging_max_duration: Duration::from_secs(0),
            discharging_max_duration: Duration::from_secs(0),

            cap_one_time: Duration::from_secs(30),
            trickle_time_out: Duration::from_secs(1500),
            cap_remap_full_percent: 0,
            cap_remap: CapRemapTable::empty(),

            uvlo_shutdown_uv: 3_100_000,
            uvlo_shutdown_mode: ShutdownMode::Orderly,

            thermal_limit_on_ibat: false,

            ir: IrCompConfig {
                rc_mohm: 0,
                us_uv: 4_350_000,
                us_lower_limit_uv: 4_350_000,
                us_upper_limit_uv: 4_500_000,
                cp_upper_limit_offset_uv: 40_000,
            },
            cp: ChargePumpConfig {
                max_ibus_ua: 3_000_000,
                max_ibat_ua: 6_000_000,
                target_vbat_uv: 4_400_000,
                taper_current_ua: 1_000_000,
                fchg_ocv_threshold_uv: 0,
            },
            charge_info: DEFAULT_CHARGE_INFO,
            jeita: JeitaTables::conservative(),
        }
    }
}
