use heapless::Vec;

use crate::config::{ChargeProfile, MAX_JEITA_ENTRIES};

use super::StopReason;

/// One row of a JEITA table. Temperatures are tenths of a degree C.
///
/// The row's limits apply to the zone that ends at `temp`; `recovery_temp` is
/// the threshold used when deciding whether a zone may be left again.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JeitaEntry {
    pub temp: i32,
    pub recovery_temp: i32,
    pub current_ua: i32,
    pub term_volt_uv: i32,
}

impl JeitaEntry {
    pub const fn new(temp: i32, recovery_temp: i32, current_ua: i32, term_volt_uv: i32) -> Self {
        Self { temp, recovery_temp, current_ua, term_volt_uv }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum JeitaTableError {
    Empty,
    TooManyEntries,
    Unordered,
}

// used whenever a board doesn't supply a battery profile
const CONSERVATIVE_TABLE: [JeitaEntry; 4] = [
    JeitaEntry::new(0, 30, 500_000, 4_400_000),
    JeitaEntry::new(100, 130, 1_000_000, 4_400_000),
    JeitaEntry::new(450, 420, 2_000_000, 4_400_000),
    JeitaEntry::new(500, 470, 1_000_000, 4_100_000),
];

/// Table of N entries describing zones 0..=N. Zone 0 is too cold, zone N is
/// too hot, everything between charges with the limits of entry `zone`.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct JeitaTable {
    entries: Vec<JeitaEntry, MAX_JEITA_ENTRIES>,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum JeitaDecision {
    Stop(StopReason),
    Limit { current_ua: i32, term_volt_uv: i32 },
}

impl JeitaTable {
    pub fn new(entries: &[JeitaEntry]) -> Result<Self, JeitaTableError> {
        if entries.is_empty() {
            return Err(JeitaTableError::Empty);
        }

        if entries.windows(2).any(|pair| pair[1].temp < pair[0].temp) {
            return Err(JeitaTableError::Unordered);
        }

        let entries = Vec::from_slice(entries).map_err(|_| JeitaTableError::TooManyEntries)?;
        Ok(Self { entries })
    }

    pub fn conservative() -> Self {
        let mut entries = Vec::new();
        for entry in CONSERVATIVE_TABLE {
            // table is smaller than MAX_JEITA_ENTRIES
            let _ = entries.push(entry);
        }

        Self { entries }
    }

    /// Number of entries, also the index of the "too hot" zone.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, zone: usize) -> Option<&JeitaEntry> {
        self.entries.get(zone)
    }

    fn scan(&self, temp: i32, threshold: impl Fn(&JeitaEntry) -> i32) -> usize {
        // the coldest threshold is exclusive, every other one inclusive
        for (i, entry) in self.entries.iter().enumerate().rev() {
            let t = threshold(entry);
            if (i > 0 && temp >= t) || (i == 0 && temp > t) {
                return i + 1;
            }
        }

        0
    }

    pub fn enter_zone(&self, temp: i32) -> usize {
        self.scan(temp, |e| e.temp)
    }

    pub fn recovery_zone(&self, temp: i32) -> usize {
        self.scan(temp, |e| e.recovery_temp)
    }

    pub fn adjust(&self, zone: usize) -> JeitaDecision {
        let zone = zone.min(self.len());
        if zone == 0 {
            return JeitaDecision::Stop(StopReason::Cold);
        }

        match self.entries.get(zone) {
            Some(entry) if zone < self.len() => JeitaDecision::Limit {
                current_ua: entry.current_ua,
                term_volt_uv: entry.term_volt_uv,
            },
            _ => JeitaDecision::Stop(StopReason::Overheat),
        }
    }

    /// Charge current allowed in `zone`, 0 if charging is stopped there.
    pub fn zone_current(&self, zone: usize) -> i32 {
        match self.adjust(zone) {
            JeitaDecision::Limit { current_ua, .. } => current_ua,
            JeitaDecision::Stop(_) => 0,
        }
    }
}

/// One optional table per charge profile, exactly one is active at a time.
#[derive(Clone, Debug)]
pub struct JeitaTables {
    tables: [Option<JeitaTable>; ChargeProfile::COUNT],
}

impl JeitaTables {
    pub fn none() -> Self {
        Self { tables: core::array::from_fn(|_| None) }
    }

    pub fn uniform(table: JeitaTable) -> Self {
        Self { tables: core::array::from_fn(|_| Some(table.clone())) }
    }

    pub fn conservative() -> Self {
        Self::uniform(JeitaTable::conservative())
    }

    pub fn set(&mut self, profile: ChargeProfile, table: Option<JeitaTable>) {
        self.tables[profile.index()] = table;
    }

    pub fn get(&self, profile: ChargeProfile) -> Option<&JeitaTable> {
        self.tables[profile.index()].as_ref()
    }
}

const JEITA_TRIGGER_COUNT: u32 = 2;
const JEITA_INITIAL_TEMP: i32 = -200;

/// Hysteretic zone tracking for one battery.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JeitaPolicy {
    zone: usize,
    last_temp: i32,
    applied: Option<usize>,
    up_trigger: u32,
    down_trigger: u32,
    forced: Option<usize>,
}

impl JeitaPolicy {
    pub const fn new() -> Self {
        Self {
            zone: 0,
            last_temp: JEITA_INITIAL_TEMP,
            applied: None,
            up_trigger: 0,
            down_trigger: 0,
            forced: None,
        }
    }

    /// Hysteretic zone for `temp`. Falling temperatures may only move toward
    /// the recovery zone (or colder), rising ones only toward the enter zone
    /// (or hotter).
    pub fn classify(&mut self, table: &JeitaTable, temp: i32) -> usize {
        let size = table.len();
        let enter = table.enter_zone(temp);

        if enter == size || enter == 0 {
            self.zone = enter;
        } else {
            let recovery = table.recovery_zone(temp);
            if self.last_temp > temp {
                self.zone = Self::goes_down(table, enter, recovery, self.zone);
            } else {
                self.zone = Self::goes_up(table, enter, recovery, self.zone);
            }

            trace!("jeita zone {} enter {} recovery {} temp {}", self.zone, enter, recovery, temp);
        }

        self.last_temp = temp;
        self.zone
    }

    fn goes_down(table: &JeitaTable, enter: usize, recovery: usize, zone: usize) -> usize {
        let recovery_is_colder = match table.entry(recovery) {
            None => true,
            Some(entry) => entry.temp > entry.recovery_temp,
        };

        if recovery_is_colder {
            if zone >= recovery { recovery } else { zone }
        } else if zone >= enter {
            enter
        } else {
            zone
        }
    }

    fn goes_up(table: &JeitaTable, enter: usize, recovery: usize, zone: usize) -> usize {
        match table.entry(recovery) {
            None => zone.max(enter),
            Some(entry) if entry.temp < entry.recovery_temp => zone.max(recovery),
            Some(_) => zone.max(enter),
        }
    }

    /// Per cycle evaluation. Returns the zone to apply: immediately on the
    /// first sample after power arrives, otherwise only after the new zone was
    /// seen on three consecutive cycles.
    pub fn monitor(&mut self, table: &JeitaTable, temp: i32) -> Option<usize> {
        if let Some(forced) = self.forced {
            if self.applied != Some(forced) {
                self.applied = Some(forced);
                return Some(forced);
            }

            return None;
        }

        let zone = self.classify(table, temp);

        let Some(applied) = self.applied else {
            self.applied = Some(zone);
            return Some(zone);
        };

        if zone > applied {
            self.down_trigger = 0;
            self.up_trigger += 1;
            if self.up_trigger > JEITA_TRIGGER_COUNT {
                self.applied = Some(zone);
                return Some(zone);
            }
        } else if zone < applied {
            self.up_trigger = 0;
            self.down_trigger += 1;
            if self.down_trigger > JEITA_TRIGGER_COUNT {
                self.applied = Some(zone);
                return Some(zone);
            }
        } else {
            self.up_trigger = 0;
            self.down_trigger = 0;
        }

        None
    }

    /// Zone currently in force, forced zone first, used outside the monitor
    /// cadence (fast charge eligibility, charge info refresh).
    pub fn current_zone(&self) -> usize {
        self.forced.or(self.applied).unwrap_or(self.zone)
    }

    pub fn applied(&self) -> Option<usize> {
        self.applied
    }

    pub fn forced(&self) -> Option<usize> {
        self.forced
    }

    /// Pin the zone regardless of temperature, `None` returns to normal
    /// tracking.
    pub fn force(&mut self, zone: Option<usize>) {
        self.forced = zone;
        if zone.is_none() {
            self.applied = None;
        }
    }

    /// External power went away, next sample is treated as the first one.
    pub fn power_removed(&mut self) {
        self.applied = None;
        self.up_trigger = 0;
        self.down_trigger = 0;
    }
}

impl Default for JeitaPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/////////////
//  TESTS  //
/////////////

#[test]
fn zone_bounds() {
    let table = JeitaTable::conservative();
    assert_eq!(0, table.enter_zone(-100));
    // the coldest threshold is exclusive
    assert_eq!(0, table.enter_zone(0));
    assert_eq!(1, table.enter_zone(1));
    assert_eq!(2, table.enter_zone(100));
    assert_eq!(3, table.enter_zone(450));
    assert_eq!(4, table.enter_zone(500));
    assert_eq!(4, table.enter_zone(900));
}

#[test]
fn adjust_stops_outside_table() {
    let table = JeitaTable::conservative();
    assert_eq!(JeitaDecision::Stop(StopReason::Cold), table.adjust(0));
    assert_eq!(JeitaDecision::Stop(StopReason::Overheat), table.adjust(4));
    assert_eq!(JeitaDecision::Stop(StopReason::Overheat), table.adjust(7));
    assert_eq!(
        JeitaDecision::Limit { current_ua: 2_000_000, term_volt_uv: 4_400_000 },
        table.adjust(2)
    );
}

#[test]
fn rejects_unordered_table() {
    let entries = [
        JeitaEntry::new(100, 130, 1_000_000, 4_400_000),
        JeitaEntry::new(50, 80, 1_000_000, 4_400_000),
    ];
    assert_eq!(Err(JeitaTableError::Unordered), JeitaTable::new(&entries));
    assert_eq!(Err(JeitaTableError::Empty), JeitaTable::new(&[]));
}

#[test]
fn hot_boundary_does_not_flap() {
    let table = JeitaTable::conservative();
    let mut policy = JeitaPolicy::new();

    assert_eq!(2, policy.classify(&table, 300));
    assert_eq!(3, policy.classify(&table, 450));
    for _ in 0..10 {
        assert_eq!(3, policy.classify(&table, 449));
        assert_eq!(3, policy.classify(&table, 450));
    }

    // only leaves once it cools past the recovery threshold
    assert_eq!(3, policy.classify(&table, 421));
    assert_eq!(2, policy.classify(&table, 419));
}

#[test]
fn cold_boundary_does_not_flap() {
    let table = JeitaTable::conservative();
    let mut policy = JeitaPolicy::new();

    assert_eq!(1, policy.classify(&table, 50));
    for _ in 0..10 {
        assert_eq!(1, policy.classify(&table, 100));
        assert_eq!(1, policy.classify(&table, 99));
    }

    assert_eq!(2, policy.classify(&table, 130));
}

#[test]
fn repeated_temperature_is_idempotent() {
    let table = JeitaTable::conservative();
    let mut policy = JeitaPolicy::new();
    let first = policy.classify(&table, 250);
    for _ in 0..5 {
        assert_eq!(first, policy.classify(&table, 250));
    }
}

#[test]
fn monitor_debounces_zone_changes() {
    let table = JeitaTable::conservative();
    let mut policy = JeitaPolicy::new();

    assert_eq!(Some(2), policy.monitor(&table, 250));
    assert_eq!(None, policy.monitor(&table, 460));
    assert_eq!(None, policy.monitor(&table, 460));
    assert_eq!(Some(3), policy.monitor(&table, 460));
    assert_eq!(None, policy.monitor(&table, 460));

    policy.power_removed();
    assert_eq!(Some(3), policy.monitor(&table, 460));
}

#[test]
fn forced_zone_overrides_temperature() {
    let table = JeitaTable::conservative();
    let mut policy = JeitaPolicy::new();

    policy.force(Some(1));
    assert_eq!(Some(1), policy.monitor(&table, 300));
    assert_eq!(None, policy.monitor(&table, 600));
    assert_eq!(1, policy.current_zone());

    policy.force(None);
    assert_eq!(Some(2), policy.monitor(&table, 300));
}
