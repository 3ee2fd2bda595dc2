//! Seams to the hardware. The control core only ever talks to devices
//! through these traits, a board implements them over its I2C/ADC drivers.

use heapless::Vec;

use crate::config::MAX_CHARGE_PUMPS;
use crate::power::{charge_pump::CpHealth, ChargerHealth, ChargerType};

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverError {
    Bus,
    NotPresent,
    Rejected,
    Unsupported,
}

/// Battery side telemetry plus capacity persistence.
pub trait FuelGauge {
    fn vbat_now_uv(&mut self) -> Result<i32, DriverError>;

    fn vbat_avg_uv(&mut self) -> Result<i32, DriverError>;

    /// positive while charging
    fn ibat_now_ua(&mut self) -> Result<i32, DriverError>;

    fn ibat_avg_ua(&mut self) -> Result<i32, DriverError>;

    fn ocv_uv(&mut self) -> Result<i32, DriverError>;

    /// tenths of a degree C
    fn temperature(&mut self) -> Result<i32, DriverError>;

    /// tenths of a percent, may be outside 0..=1000
    fn capacity(&mut self) -> Result<i32, DriverError>;

    fn battery_present(&mut self) -> Result<bool, DriverError>;

    /// Recalibrate the gauge to report `cap`.
    fn calibrate_capacity(&mut self, cap: i32) -> Result<(), DriverError>;

    /// Persist the displayed capacity so it survives a restart.
    fn store_capacity(&mut self, cap: i32) -> Result<(), DriverError>;

    /// Capacity persisted by the previous boot, if any.
    fn boot_capacity(&mut self) -> Result<Option<i32>, DriverError>;

    /// Learned full charge capacity, uAh.
    fn charge_full_uah(&mut self) -> Result<i32, DriverError> {
        Err(DriverError::Unsupported)
    }
}

/// Primary or secondary switching charger.
pub trait Charger {
    fn set_enabled(&mut self, enable: bool) -> Result<(), DriverError>;

    fn is_enabled(&mut self) -> Result<bool, DriverError>;

    /// external power present on this charger's input
    fn is_online(&mut self) -> Result<bool, DriverError>;

    fn health(&mut self) -> Result<ChargerHealth, DriverError>;

    fn set_charge_current(&mut self, ua: i32) -> Result<(), DriverError>;

    fn set_input_current_limit(&mut self, ua: i32) -> Result<(), DriverError>;

    fn set_constant_voltage(&mut self, uv: i32) -> Result<(), DriverError>;

    fn feed_watchdog(&mut self, interval_ms: u32) -> Result<(), DriverError>;

    fn bus_voltage_uv(&mut self) -> Result<i32, DriverError>;

    fn bus_current_ua(&mut self) -> Result<i32, DriverError>;
}

/// Divide-by-two switched capacitor charger.
pub trait ChargePump {
    /// Bring the pump to a known state before a session.
    fn init(&mut self) -> Result<(), DriverError>;

    fn set_enabled(&mut self, enable: bool) -> Result<(), DriverError>;

    fn is_enabled(&mut self) -> Result<bool, DriverError>;

    fn feed_watchdog(&mut self, interval_ms: u32) -> Result<(), DriverError>;

    fn vbat_uv(&mut self) -> Result<i32, DriverError>;

    fn ibat_ua(&mut self) -> Result<i32, DriverError>;

    fn vbus_uv(&mut self) -> Result<i32, DriverError>;

    fn ibus_ua(&mut self) -> Result<i32, DriverError>;

    fn health(&mut self) -> Result<CpHealth, DriverError>;

    fn clear_faults(&mut self) -> Result<(), DriverError>;
}

/// Upstream adapter negotiation (USB-PD / PPS).
pub trait PowerAdapter {
    fn charger_type(&mut self) -> Result<ChargerType, DriverError>;

    fn max_voltage_uv(&mut self) -> Result<i32, DriverError>;

    fn max_current_ua(&mut self) -> Result<i32, DriverError>;

    fn request_voltage(&mut self, uv: i32) -> Result<(), DriverError>;

    fn request_current(&mut self, ua: i32) -> Result<(), DriverError>;

    fn set_pps_enabled(&mut self, enable: bool) -> Result<(), DriverError>;
}

/// Type family tying one board's device drivers together.
pub trait ChargerHal {
    type Gauge: FuelGauge;
    type Charger: Charger;
    type Pump: ChargePump;
    type Adapter: PowerAdapter;
}

pub struct Devices<H: ChargerHal> {
    pub gauge: H::Gauge,
    pub primary: H::Charger,
    pub secondary: Option<H::Charger>,
    pub pumps: Vec<H::Pump, MAX_CHARGE_PUMPS>,
    pub adapter: H::Adapter,
}

impl<H: ChargerHal> Devices<H> {
    pub fn new(gauge: H::Gauge, primary: H::Charger, adapter: H::Adapter) -> Self {
        Self {
            gauge,
            primary,
            secondary: None,
            pumps: Vec::new(),
            adapter,
        }
    }

    pub fn with_secondary(mut self, secondary: H::Charger) -> Self {
        self.secondary = Some(secondary);
        self
    }

    /// Extra pumps beyond MAX_CHARGE_PUMPS are rejected.
    pub fn with_pump(mut self, pump: H::Pump) -> Result<Self, H::Pump> {
        self.pumps.push(pump)?;
        Ok(self)
    }

    pub fn has_pump(&self) -> bool {
        !self.pumps.is_empty()
    }

    pub fn pumps_set_enabled(&mut self, enable: bool) -> Result<(), DriverError> {
        for pump in self.pumps.iter_mut() {
            pump.set_enabled(enable)?;
        }

        Ok(())
    }

    /// Master pump decides, the rest follow it.
    pub fn pump_enabled(&mut self) -> Result<bool, DriverError> {
        match self.pumps.first_mut() {
            Some(pump) => pump.is_enabled(),
            None => Ok(false),
        }
    }

    pub fn pumps_health(&mut self) -> Result<CpHealth, DriverError> {
        let mut health = CpHealth::default();
        for pump in self.pumps.iter_mut() {
            health.merge(&pump.health()?);
        }

        Ok(health)
    }

    pub fn pumps_clear_faults(&mut self) -> Result<(), DriverError> {
        for pump in self.pumps.iter_mut() {
            pump.clear_faults()?;
        }

        Ok(())
    }

    /// Summed battery current across every pump.
    pub fn pumps_ibat_ua(&mut self) -> Result<i32, DriverError> {
        let mut total = 0;
        for pump in self.pumps.iter_mut() {
            total += pump.ibat_ua()?;
        }

        Ok(total)
    }

    /// Summed bus current across every pump.
    pub fn pumps_ibus_ua(&mut self) -> Result<i32, DriverError> {
        let mut total = 0;
        for pump in self.pumps.iter_mut() {
            total += pump.ibus_ua()?;
        }

        Ok(total)
    }
}
