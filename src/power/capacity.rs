use embassy_time::{Duration, Instant};
use heapless::Vec;
use num_traits::clamp;

use crate::config::*;

use super::{CapacityLevel, ChargeStatus};

/// Rounds tenths of a percent to whole percent the way the UI shows it.
pub fn round_percent(cap: i32) -> i32 {
    if cap >= 0 {
        (cap + 5) / 10
    } else {
        (cap - 5) / 10
    }
}

fn div_round_closest(n: i32, d: i32) -> i32 {
    if d == 0 {
        return 0;
    }

    if n >= 0 {
        (n + d / 2) / d
    } else {
        (n - d / 2) / d
    }
}

///////////////////////
//  Capacity Remap  //
///////////////////////

/// Stretches the percent band lcap..hcap so it takes `cnt` times as much raw
/// capacity to cross it.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CapRemapEntry {
    pub lcap: i32,
    pub hcap: i32,
    pub cnt: i32,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
struct RemapBand {
    entry: CapRemapEntry,
    lb: i32,
    hb: i32,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CapRemapError {
    TooManyEntries,
    Unordered,
    BadMultiplier,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CapRemapTable {
    bands: Vec<RemapBand, MAX_CAP_REMAP_ENTRIES>,
    total_cnt: i32,
}

impl CapRemapTable {
    pub const fn empty() -> Self {
        Self { bands: Vec::new(), total_cnt: 0 }
    }

    pub fn new(entries: &[CapRemapEntry]) -> Result<Self, CapRemapError> {
        let mut bands: Vec<RemapBand, MAX_CAP_REMAP_ENTRIES> = Vec::new();
        let mut total_cnt = 0;

        for entry in entries {
            if entry.cnt <= 0 || entry.cnt > MAX_CAP_REMAP_CNT {
                return Err(CapRemapError::BadMultiplier);
            }

            if entry.lcap < 0 || entry.hcap < entry.lcap || entry.hcap > 100 {
                return Err(CapRemapError::Unordered);
            }

            let lb = match bands.last() {
                None => {
                    total_cnt = entry.lcap;
                    entry.lcap * 1000
                }
                Some(prev) => {
                    if entry.lcap < prev.entry.hcap {
                        return Err(CapRemapError::Unordered);
                    }
                    total_cnt += entry.lcap - prev.entry.hcap;
                    prev.hb + (entry.lcap - prev.entry.hcap) * 1000
                }
            };

            let hb = lb + (entry.hcap - entry.lcap) * entry.cnt * 1000;
            total_cnt += (entry.hcap - entry.lcap) * entry.cnt;

            bands.push(RemapBand { entry: *entry, lb, hb }).map_err(|_| CapRemapError::TooManyEntries)?;
        }

        if let Some(last) = bands.last() {
            total_cnt += 100 - last.entry.hcap;
        }

        Ok(Self { bands, total_cnt })
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn remap(&self, fuel_cap: i32) -> i32 {
        if self.bands.is_empty() {
            return fuel_cap;
        }

        let fuel_cap = clamp(fuel_cap, 0, CAP_FULL);
        let scaled = fuel_cap * self.total_cnt;

        for (i, band) in self.bands.iter().enumerate() {
            if scaled <= band.lb {
                return match i.checked_sub(1).and_then(|p| self.bands.get(p)) {
                    None => div_round_closest(scaled, 100),
                    Some(prev) => div_round_closest(scaled - prev.hb, 100) + prev.entry.hcap * 10,
                };
            } else if scaled <= band.hb {
                return div_round_closest(scaled - band.lb, band.entry.cnt * 100) + band.entry.lcap * 10;
            }
        }

        match self.bands.last() {
            Some(last) => div_round_closest(scaled - last.hb, 100) + last.entry.hcap * 10,
            None => fuel_cap,
        }
    }
}

/// Applies the optional full-scale correction and the band remap to a raw
/// gauge reading.
pub fn remap_capacity(full_percent: i32, table: &CapRemapTable, fuel_cap: i32) -> i32 {
    let mut fuel_cap = fuel_cap;
    if full_percent > 0 {
        fuel_cap = (fuel_cap * 100 / full_percent).min(CAP_FULL);
    }

    table.remap(fuel_cap)
}

pub fn capacity_level(cap: i32, charging: bool, ocv_uv: Option<i32>, battery_present: bool) -> CapacityLevel {
    if !battery_present {
        return CapacityLevel::Full;
    }

    let uisoc = round_percent(cap);
    let level = if uisoc >= CAPACITY_LEVEL_FULL {
        CapacityLevel::Full
    } else if uisoc > CAPACITY_LEVEL_NORMAL {
        CapacityLevel::High
    } else if uisoc > CAPACITY_LEVEL_LOW {
        CapacityLevel::Normal
    } else if uisoc > 0 {
        CapacityLevel::Low
    } else {
        CapacityLevel::Critical
    };

    match (level, ocv_uv) {
        (CapacityLevel::Critical, Some(ocv)) if charging && ocv > CAPACITY_LEVEL_CRITICAL_UV => CapacityLevel::Low,
        _ => level,
    }
}

//////////////////////////
//  Capacity Estimator  //
//////////////////////////

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CapacitySample {
    /// remapped gauge capacity, tenths of a percent, not yet clamped
    pub raw: i32,
    pub vbat_uv: i32,
    pub ibat_ua: i32,
    pub ocv_uv: i32,
    pub temperature: i32,
    pub status: ChargeStatus,
    pub external_power: bool,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CapacityUpdate {
    pub cap: i32,
    pub changed: bool,
    /// the rounded percent moved, UI should be notified
    pub percent_changed: bool,
    /// vbat is close to the UVLO threshold, start the fast poll
    pub uvlo_watch: bool,
}

/// Turns noisy gauge readings into a displayed capacity that only moves in
/// the direction the charge status allows and never faster than a bounded
/// step per `cap_one_time`.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct CapacityEstimator {
    cap: i32,
    last_raw: Option<i32>,
    last_query: Instant,
    update_time: Instant,
    trickle_start: Instant,
    trickle_time: Duration,
    low_temp_count: u32,
    force_full: bool,

    cap_one_time: Duration,
    trickle_time_out: Duration,
    recharge_uv: i32,
}

impl CapacityEstimator {
    pub fn new(boot_cap: i32, now: Instant, cfg: &ChargerConfig) -> Self {
        let cap_one_time = if cfg.cap_one_time.as_secs() == 0 { CAP_UPDATE_INTERVAL } else { cfg.cap_one_time };

        Self {
            cap: clamp(boot_cap, 0, CAP_FULL),
            last_raw: None,
            last_query: now,
            update_time: now,
            trickle_start: now,
            trickle_time: Duration::from_secs(0),
            low_temp_count: 0,
            force_full: false,

            cap_one_time,
            trickle_time_out: cfg.trickle_time_out,
            recharge_uv: cfg.fullbatt_uv - cfg.fullbatt_vchkdrop_uv - CAP_RECHARGE_MARGIN_UV,
        }
    }

    pub fn cap(&self) -> i32 {
        self.cap
    }

    pub fn uisoc(&self) -> i32 {
        round_percent(self.cap)
    }

    pub fn force_full(&self) -> bool {
        self.force_full
    }

    pub fn set_force_full(&mut self, force_full: bool) {
        self.force_full = force_full;
    }

    /// Discontinuous jump, only used for explicit snaps (UVLO to 0%).
    pub fn snap(&mut self, cap: i32, now: Instant) {
        self.cap = clamp(cap, 0, CAP_FULL);
        self.update_time = now;
    }

    pub fn update(&mut self, sample: &CapacitySample, now: Instant) -> CapacityUpdate {
        let mut cold_empty = false;
        if sample.temperature <= LOW_TEMP_REGION && sample.vbat_uv <= LOW_TEMP_SHUTDOWN_UV {
            self.low_temp_count += 1;
            if self.low_temp_count >= 2 {
                warn!("cold and under {} uV, reporting empty", LOW_TEMP_SHUTDOWN_UV);
                cold_empty = true;
            }
        } else {
            self.low_temp_count = 0;
        }

        let mut fuel_cap = if cold_empty { 0 } else { clamp(sample.raw, 0, CAP_FULL) };
        let mut last_raw = self.last_raw.unwrap_or(fuel_cap);

        if sample.status == ChargeStatus::Charging {
            if self.cap >= CAP_TRICKLE_START {
                self.trickle_time = now.saturating_duration_since(self.trickle_start);
            } else {
                self.trickle_start = now;
                self.trickle_time = Duration::from_secs(0);
            }
        } else {
            self.trickle_start = now;
            self.trickle_time = self.trickle_time_out + self.cap_one_time;
        }

        let flush_time = now.saturating_duration_since(self.update_time);
        let period_time = now.saturating_duration_since(self.last_query);
        self.last_query = now;

        let status = if self.force_full && sample.external_power {
            ChargeStatus::Full
        } else {
            sample.status
        };

        debug!(
            "cap vbat {} ocv {} ibat {} raw {} cap {} status {} force full {}",
            sample.vbat_uv,
            sample.ocv_uv,
            sample.ibat_ua,
            fuel_cap,
            self.cap,
            status,
            self.force_full,
        );

        match status {
            ChargeStatus::Charging => {
                last_raw = fuel_cap;
                if fuel_cap < self.cap {
                    if sample.ibat_ua >= 0 {
                        fuel_cap = self.cap;
                    } else {
                        fuel_cap = self.limit_fall(fuel_cap, period_time, flush_time);
                    }
                } else if fuel_cap > self.cap {
                    fuel_cap = self.limit_rise(fuel_cap, period_time, flush_time);
                }

                if (CAP_PRE_FULL_LOW..=CAP_PRE_FULL_HIGH).contains(&self.cap) && fuel_cap >= CAP_FULL {
                    fuel_cap = CAP_PRE_FULL_HIGH;
                }

                if self.cap >= CAP_HIGH_THRESHOLD
                    && self.trickle_time_out.as_ticks() > 0
                    && self.trickle_time >= self.trickle_time_out
                    && sample.ibat_ua > 0
                {
                    info!("trickle charged for {} s, forcing full", self.trickle_time.as_secs());
                    self.force_full = true;
                }
            }
            ChargeStatus::NotCharging | ChargeStatus::Discharging => {
                if fuel_cap >= self.cap {
                    last_raw = fuel_cap;
                    fuel_cap = self.cap;
                } else if self.cap >= CAP_HIGH_THRESHOLD {
                    if last_raw - fuel_cap >= CAP_HIGH_DECREASE_STEP {
                        if self.cap - fuel_cap >= CAP_ONE_PERCENT {
                            fuel_cap = self.cap - CAP_ONE_PERCENT;
                        } else {
                            fuel_cap = self.cap - CAP_HIGH_DECREASE_STEP;
                        }

                        last_raw -= CAP_HIGH_DECREASE_STEP;
                    } else {
                        fuel_cap = self.cap;
                    }
                } else {
                    fuel_cap = self.limit_fall(fuel_cap, period_time, flush_time);
                }
            }
            ChargeStatus::Full => {
                last_raw = fuel_cap;
                self.update_time = now;
                if sample.ocv_uv < self.recharge_uv && sample.ibat_ua < 0 {
                    info!("ocv {} under recharge threshold {}", sample.ocv_uv, self.recharge_uv);
                    self.force_full = false;
                }

                if sample.external_power {
                    fuel_cap = CAP_FULL.min(self.cap + 1);
                }
            }
        }

        // shutdown is imminent, skip the rate limits
        if cold_empty {
            fuel_cap = 0;
            last_raw = 0;
        }

        self.last_raw = Some(last_raw);

        let mut update = CapacityUpdate {
            cap: fuel_cap,
            changed: false,
            percent_changed: false,
            uvlo_watch: sample.vbat_uv < UVLO_CALIBRATION_UV,
        };

        if fuel_cap != self.cap {
            if round_percent(fuel_cap) != round_percent(self.cap) {
                self.update_time = now;
                update.percent_changed = true;
            }

            debug!("cap {} -> {}", self.cap, fuel_cap);
            self.cap = fuel_cap;
            update.changed = true;
        }

        update
    }

    fn windows_elapsed(&self, period_time: Duration) -> i32 {
        (period_time.as_secs() / self.cap_one_time.as_secs().max(1)) as i32
    }

    fn limit_fall(&self, fuel_cap: i32, period_time: Duration, flush_time: Duration) -> i32 {
        if period_time < self.cap_one_time {
            let mut fuel_cap = fuel_cap;
            if self.cap - fuel_cap >= CAP_MAX_STEP {
                fuel_cap = self.cap - CAP_MAX_STEP;
            }

            // at most one visible percent change per window
            if flush_time < self.cap_one_time && round_percent(fuel_cap) != round_percent(self.cap) {
                fuel_cap = self.cap;
            }

            fuel_cap
        } else {
            // long sleep, catch up proportionally to the elapsed time
            let allowed = self.windows_elapsed(period_time) * CAP_ONE_PERCENT;
            if self.cap - fuel_cap >= allowed {
                self.cap - allowed
            } else {
                fuel_cap
            }
        }
    }

    fn limit_rise(&self, fuel_cap: i32, period_time: Duration, flush_time: Duration) -> i32 {
        if period_time < self.cap_one_time {
            let mut fuel_cap = fuel_cap;
            if fuel_cap - self.cap >= CAP_MAX_STEP {
                fuel_cap = self.cap + CAP_MAX_STEP;
            }

            if flush_time < self.cap_one_time && round_percent(fuel_cap) != round_percent(self.cap) {
                fuel_cap = self.cap;
            }

            fuel_cap
        } else {
            let allowed = self.windows_elapsed(period_time) * CAP_ONE_PERCENT;
            if fuel_cap - self.cap >= allowed {
                self.cap + allowed
            } else {
                fuel_cap
            }
        }
    }
}

/////////////
//  TESTS  //
/////////////

#[cfg(test)]
fn sample(raw: i32, status: ChargeStatus) -> CapacitySample {
    CapacitySample {
        raw,
        vbat_uv: 3_900_000,
        ibat_ua: if status == ChargeStatus::Charging { 1_000_000 } else { -500_000 },
        ocv_uv: 3_900_000,
        temperature: 250,
        status,
        external_power: status != ChargeStatus::Discharging,
    }
}

#[test]
fn clamps_out_of_range_raw() {
    let cfg = ChargerConfig::default();
    let t0 = Instant::from_secs(0);

    // a long window allows 40%, only the clamp keeps this at 100%
    let mut est = CapacityEstimator::new(995, t0, &cfg);
    let update = est.update(&sample(1500, ChargeStatus::Charging), t0 + Duration::from_secs(600));
    assert_eq!(CAP_FULL, update.cap);
    assert_eq!(CAP_FULL, est.cap());

    let mut est = CapacityEstimator::new(5, t0, &cfg);
    let update = est.update(&sample(-50, ChargeStatus::Discharging), t0 + Duration::from_secs(600));
    assert_eq!(0, update.cap);
    assert_eq!(0, est.cap());

    // negative raw while charging with current flowing out
    let mut est = CapacityEstimator::new(5, t0, &cfg);
    let mut s = sample(-50, ChargeStatus::Charging);
    s.ibat_ua = -100_000;
    est.update(&s, t0 + Duration::from_secs(600));
    assert_eq!(0, est.cap());
}

#[test]
fn boot_capacity_is_clamped() {
    let cfg = ChargerConfig::default();
    let t0 = Instant::from_secs(0);
    assert_eq!(CAP_FULL, CapacityEstimator::new(1500, t0, &cfg).cap());
    assert_eq!(0, CapacityEstimator::new(-50, t0, &cfg).cap());
}

#[test]
fn charging_rise_is_rate_limited() {
    let cfg = ChargerConfig::default();
    let t0 = Instant::from_secs(0);
    let mut est = CapacityEstimator::new(500, t0, &cfg);

    // the rounded percent may not move inside the first window
    let update = est.update(&sample(600, ChargeStatus::Charging), t0 + Duration::from_secs(15));
    assert_eq!(500, update.cap);
    assert!(!update.changed);

    // window elapsed, one bounded step
    let update = est.update(&sample(600, ChargeStatus::Charging), t0 + Duration::from_secs(31));
    assert_eq!(505, update.cap);
    assert!(update.percent_changed);

    // moving within the same percent is fine
    let update = est.update(&sample(600, ChargeStatus::Charging), t0 + Duration::from_secs(35));
    assert_eq!(510, update.cap);
    assert!(update.changed);
    assert!(!update.percent_changed);
}

#[test]
fn long_sleep_catches_up_proportionally() {
    let cfg = ChargerConfig::default();
    let t0 = Instant::from_secs(0);
    let mut est = CapacityEstimator::new(800, t0, &cfg);

    // 90 s asleep is three 30 s windows, 3% allowed
    let update = est.update(&sample(500, ChargeStatus::Discharging), t0 + Duration::from_secs(90));
    assert_eq!(770, update.cap);
}

#[test]
fn charging_does_not_pull_down_with_positive_current() {
    let cfg = ChargerConfig::default();
    let t0 = Instant::from_secs(0);
    let mut est = CapacityEstimator::new(600, t0, &cfg);
    let update = est.update(&sample(400, ChargeStatus::Charging), t0 + Duration::from_secs(120));
    assert_eq!(600, update.cap);
    assert!(!update.changed);

    // net discharge on the charging path is allowed to fall
    let mut s = sample(400, ChargeStatus::Charging);
    s.ibat_ua = -200_000;
    let update = est.update(&s, t0 + Duration::from_secs(240));
    assert_eq!(560, update.cap);
}

#[test]
fn discharging_never_rises() {
    let cfg = ChargerConfig::default();
    let t0 = Instant::from_secs(0);
    let mut est = CapacityEstimator::new(500, t0, &cfg);
    let update = est.update(&sample(900, ChargeStatus::Discharging), t0 + Duration::from_secs(300));
    assert_eq!(500, update.cap);
}

#[test]
fn pre_full_holds_at_994() {
    let cfg = ChargerConfig::default();
    let t0 = Instant::from_secs(0);
    let mut est = CapacityEstimator::new(990, t0, &cfg);
    let update = est.update(&sample(1000, ChargeStatus::Charging), t0 + Duration::from_secs(300));
    assert_eq!(CAP_PRE_FULL_HIGH, update.cap);
}

#[test]
fn high_capacity_steps_down_in_chunks() {
    let cfg = ChargerConfig::default();
    let t0 = Instant::from_secs(0);
    let mut est = CapacityEstimator::new(1000, t0, &cfg);

    // establish last raw at 1000
    est.update(&sample(1000, ChargeStatus::Discharging), t0 + Duration::from_secs(15));

    // raw fell less than one step, hold
    let update = est.update(&sample(995, ChargeStatus::Discharging), t0 + Duration::from_secs(30));
    assert_eq!(1000, update.cap);

    let update = est.update(&sample(990, ChargeStatus::Discharging), t0 + Duration::from_secs(45));
    assert_eq!(990, update.cap);
}

#[test]
fn full_climbs_to_hundred_and_recharge_clears_force_full() {
    let cfg = ChargerConfig::default();
    let t0 = Instant::from_secs(0);
    let mut est = CapacityEstimator::new(997, t0, &cfg);
    est.set_force_full(true);

    let update = est.update(&sample(980, ChargeStatus::Charging), t0 + Duration::from_secs(15));
    assert_eq!(998, update.cap);

    let mut s = sample(980, ChargeStatus::Charging);
    s.ocv_uv = cfg.fullbatt_uv - cfg.fullbatt_vchkdrop_uv - CAP_RECHARGE_MARGIN_UV - 1;
    s.ibat_ua = -10_000;
    est.update(&s, t0 + Duration::from_secs(30));
    assert!(!est.force_full());
}

#[test]
fn trickle_timeout_forces_full() {
    let cfg = ChargerConfig::default();
    let t0 = Instant::from_secs(0);
    let mut est = CapacityEstimator::new(996, t0, &cfg);

    est.update(&sample(996, ChargeStatus::Charging), t0 + Duration::from_secs(15));
    assert!(!est.force_full());
    est.update(&sample(996, ChargeStatus::Charging), t0 + Duration::from_secs(15) + cfg.trickle_time_out);
    assert!(est.force_full());
}

#[test]
fn cold_and_low_voltage_reports_empty() {
    let cfg = ChargerConfig::default();
    let t0 = Instant::from_secs(0);
    let mut est = CapacityEstimator::new(300, t0, &cfg);
    let mut s = sample(300, ChargeStatus::Discharging);
    s.temperature = 50;
    s.vbat_uv = 3_100_000;

    est.update(&s, t0 + Duration::from_secs(15));
    assert_eq!(300, est.cap());

    // second consecutive poll snaps straight to empty
    let update = est.update(&s, t0 + Duration::from_secs(30));
    assert_eq!(0, est.cap());
    assert!(update.percent_changed);

    // a warm sample clears the guard, discharging still can't rise
    s.temperature = 250;
    est.update(&s, t0 + Duration::from_secs(45));
    assert_eq!(0, est.cap());
}

#[test]
fn level_thresholds() {
    assert_eq!(CapacityLevel::Full, capacity_level(996, false, None, true));
    assert_eq!(CapacityLevel::High, capacity_level(900, false, None, true));
    assert_eq!(CapacityLevel::Normal, capacity_level(500, false, None, true));
    assert_eq!(CapacityLevel::Low, capacity_level(100, false, None, true));
    assert_eq!(CapacityLevel::Critical, capacity_level(0, false, Some(3_400_000), true));
    assert_eq!(CapacityLevel::Low, capacity_level(0, true, Some(3_400_000), true));
    assert_eq!(CapacityLevel::Full, capacity_level(0, false, None, false));
}

#[test]
fn remap_stretches_top_band() {
    let table = CapRemapTable::new(&[CapRemapEntry { lcap: 90, hcap: 100, cnt: 2 }]).unwrap();
    assert_eq!(1000, table.remap(1000));
    assert_eq!(945, table.remap(900));
    assert_eq!(0, table.remap(-20));
    assert_eq!(500, remap_capacity(0, &CapRemapTable::empty(), 500));
    assert_eq!(CAP_FULL, remap_capacity(95, &CapRemapTable::empty(), 980));
}

#[test]
fn remap_past_last_band() {
    let table = CapRemapTable::new(&[CapRemapEntry { lcap: 10, hcap: 20, cnt: 2 }]).unwrap();
    assert_eq!(1000, table.remap(1000));
}

#[test]
fn remap_rejects_bad_multipliers() {
    assert_eq!(
        Err(CapRemapError::BadMultiplier),
        CapRemapTable::new(&[CapRemapEntry { lcap: 90, hcap: 100, cnt: 0 }])
    );
    assert_eq!(
        Err(CapRemapError::BadMultiplier),
        CapRemapTable::new(&[CapRemapEntry { lcap: 0, hcap: 100, cnt: MAX_CAP_REMAP_CNT + 1 }])
    );

    // the widest band at the largest multiplier still maps the ends
    let table = CapRemapTable::new(&[CapRemapEntry { lcap: 0, hcap: 100, cnt: MAX_CAP_REMAP_CNT }]).unwrap();
    assert_eq!(0, table.remap(0));
    assert_eq!(CAP_FULL, table.remap(CAP_FULL));
}
