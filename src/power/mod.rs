use core::marker::PhantomData;

pub mod capacity;
pub mod charge_pump;
pub mod ir_comp;
pub mod jeita;
pub mod uvlo;
pub mod vote;

/// Coarse battery status reported to the UI layer.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargeStatus {
    Discharging,
    NotCharging,
    Charging,
    Full,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CapacityLevel {
    Critical,
    Low,
    Normal,
    High,
    Full,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargerHealth {
    Good,
    Overheat,
    Cold,
    OverVoltage,
    WatchdogExpired,
    SafetyTimerExpired,
    Unspecified,
}

/// Input source as reported by cable detection / PD negotiation.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargerType {
    Unknown,
    Sdp,
    Dcp,
    Cdp,
    /// fixed voltage USB-PD
    Pd,
    /// vendor fast charge protocol (fixed 9V)
    Sfcp,
    /// PD programmable power supply, the only type the charge pump runs on
    Pps,
    WirelessBpp,
    WirelessEpp,
}

impl ChargerType {
    pub const COUNT: usize = 9;

    pub const fn index(self) -> usize {
        self as usize
    }

    /// Types that use a fixed 9V request with the secondary charger.
    pub const fn is_fixed_fast_charge(self) -> bool {
        matches!(self, ChargerType::Pd | ChargerType::Sfcp)
    }

    pub const fn is_wireless(self) -> bool {
        matches!(self, ChargerType::WirelessBpp | ChargerType::WirelessEpp)
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ShutdownMode {
    /// ask userspace to power off cleanly
    Orderly,
    /// immediate power off
    Kernel,
    /// report 0% and let the UI drive the power off
    Ui,
}

/// Reasons charging is currently held off. Independent of each other, so
/// they live in a set rather than a status bitmask.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopReason {
    Cold,
    Overheat,
    HealthAbnormal,
    VoltageAbnormal,
    DurationAbnormal,
}

pub trait Flag: Copy {
    fn bit(self) -> u16;
}

impl Flag for StopReason {
    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Small fixed set over an enum of up to 16 variants.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct FlagSet<F: Flag> {
    bits: u16,
    _flag: PhantomData<F>,
}

impl<F: Flag> FlagSet<F> {
    pub const fn empty() -> Self {
        Self { bits: 0, _flag: PhantomData }
    }

    pub fn insert(&mut self, flag: F) {
        self.bits |= flag.bit();
    }

    pub fn remove(&mut self, flag: F) {
        self.bits &= !flag.bit();
    }

    pub fn set(&mut self, flag: F, value: bool) {
        if value {
            self.insert(flag);
        } else {
            self.remove(flag);
        }
    }

    pub fn contains(&self, flag: F) -> bool {
        self.bits & flag.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn clear(&mut self) {
        self.bits = 0;
    }

    pub fn raw(&self) -> u16 {
        self.bits
    }
}

impl<F: Flag> Default for FlagSet<F> {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(feature = "defmt")]
impl<F: Flag> defmt::Format for FlagSet<F> {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "FlagSet({=u16:b})", self.bits)
    }
}

/////////////
//  TESTS  //
/////////////

#[test]
fn stop_reasons_are_independent() {
    let mut latches: FlagSet<StopReason> = FlagSet::empty();
    latches.insert(StopReason::Cold);
    latches.insert(StopReason::DurationAbnormal);
    latches.remove(StopReason::Cold);

    assert!(!latches.contains(StopReason::Cold));
    assert!(latches.contains(StopReason::DurationAbnormal));
    assert!(!latches.is_empty());

    latches.set(StopReason::DurationAbnormal, false);
    assert!(latches.is_empty());
}
