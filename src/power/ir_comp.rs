use num_traits::clamp;

use crate::config::{IrCompConfig, IR_IBAT_SAMPLE_COUNT};
use crate::filter::{Filter, TrimmedMeanFilter};

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IrMode {
    Normal,
    ChargePump,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IrTarget {
    /// compensated battery voltage target
    pub target_uv: i32,
    /// CCCV floor to vote, only when the target moved by at least 1mV
    pub vote_uv: Option<i32>,
}

/// Raises the constant voltage set point by the drop across the pack
/// resistance so the cell itself still reaches its terminal voltage.
pub struct IrCompensation {
    cfg: IrCompConfig,
    enabled: bool,
    ibat: TrimmedMeanFilter<IR_IBAT_SAMPLE_COUNT>,
    last_target_uv: i32,
}

impl IrCompensation {
    pub fn new(cfg: IrCompConfig) -> Self {
        Self {
            cfg,
            enabled: false,
            ibat: TrimmedMeanFilter::new(),
            last_target_uv: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn configured(&self) -> bool {
        self.cfg.rc_mohm != 0
    }

    /// Returns true when this call turned compensation on, the caller then
    /// schedules the periodic sampling.
    pub fn enable(&mut self) -> bool {
        if !self.configured() || self.enabled {
            return false;
        }

        info!("ir compensation on");
        // first full window always votes
        self.reset();
        self.enabled = true;
        true
    }

    pub fn disable(&mut self) {
        if self.enabled {
            info!("ir compensation off");
            self.enabled = false;
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.ibat.reset();
        self.last_target_uv = 0;
    }

    /// JEITA moves the uncompensated set point.
    pub fn set_set_point(&mut self, term_volt_uv: i32) {
        self.cfg.us_uv = term_volt_uv;
        self.cfg.us_lower_limit_uv = term_volt_uv;
    }

    pub fn set_point(&self) -> i32 {
        self.cfg.us_uv
    }

    pub fn sample(&mut self, ibat_ua: i32, mode: IrMode) -> Option<IrTarget> {
        if !self.configured() {
            return None;
        }

        self.ibat.add_sample(ibat_ua);
        self.ibat.update();
        let ibat_avg = self.ibat.filtered_value()?.max(0);

        let target_uv = clamp(
            self.cfg.us_uv + (ibat_avg / 1000) * self.cfg.rc_mohm,
            self.cfg.us_lower_limit_uv,
            self.cfg.us_upper_limit_uv.max(self.cfg.us_lower_limit_uv),
        );

        if target_uv / 1000 == self.last_target_uv / 1000 {
            return Some(IrTarget { target_uv, vote_uv: None });
        }

        debug!("ir compensation target {} ibat avg {}", target_uv, ibat_avg);
        self.last_target_uv = target_uv;

        let vote_uv = match mode {
            IrMode::Normal => target_uv,
            IrMode::ChargePump => self.cfg.us_upper_limit_uv.min(target_uv + self.cfg.cp_upper_limit_offset_uv),
        };

        Some(IrTarget { target_uv, vote_uv: Some(vote_uv) })
    }
}

/////////////
//  TESTS  //
/////////////

#[cfg(test)]
fn test_cfg() -> IrCompConfig {
    IrCompConfig {
        rc_mohm: 50,
        us_uv: 4_400_000,
        us_lower_limit_uv: 4_400_000,
        us_upper_limit_uv: 4_500_000,
        cp_upper_limit_offset_uv: 40_000,
    }
}

#[test]
fn compensates_after_full_window() {
    let mut ir = IrCompensation::new(test_cfg());
    assert!(ir.enable());
    assert!(!ir.enable());

    for _ in 0..IR_IBAT_SAMPLE_COUNT - 1 {
        assert_eq!(None, ir.sample(1_000_000, IrMode::Normal));
    }

    // 1A through 50 milli-ohm is 50mV
    let target = ir.sample(1_000_000, IrMode::Normal);
    assert_eq!(Some(IrTarget { target_uv: 4_450_000, vote_uv: Some(4_450_000) }), target);

    // unchanged target doesn't re-vote
    let target = ir.sample(1_000_000, IrMode::Normal);
    assert_eq!(Some(IrTarget { target_uv: 4_450_000, vote_uv: None }), target);
}

#[test]
fn clamps_to_upper_limit() {
    let mut ir = IrCompensation::new(test_cfg());
    ir.enable();
    let mut last = None;
    for _ in 0..IR_IBAT_SAMPLE_COUNT {
        last = ir.sample(5_000_000, IrMode::ChargePump);
    }
    assert_eq!(Some(IrTarget { target_uv: 4_500_000, vote_uv: Some(4_500_000) }), last);
}

#[test]
fn unconfigured_is_inert() {
    let mut cfg = test_cfg();
    cfg.rc_mohm = 0;
    let mut ir = IrCompensation::new(cfg);
    assert!(!ir.enable());
    assert_eq!(None, ir.sample(1_000_000, IrMode::Normal));
}

#[test]
fn re_enable_votes_the_set_point() {
    let mut ir = IrCompensation::new(test_cfg());
    ir.enable();
    for _ in 0..IR_IBAT_SAMPLE_COUNT {
        ir.sample(2_000_000, IrMode::Normal);
    }
    ir.disable();

    ir.set_set_point(4_100_000);
    assert!(ir.enable());
    let mut last = None;
    for _ in 0..IR_IBAT_SAMPLE_COUNT {
        last = ir.sample(0, IrMode::Normal);
    }
    assert_eq!(Some(IrTarget { target_uv: 4_100_000, vote_uv: Some(4_100_000) }), last);
}
